//! Versioned settings document
//!
//! The settings file is a pretty-printed JSON object:
//!
//! ```json
//! { "VERSION": 2, "endpoints": [ { "name": "GCS", ... } ] }
//! ```
//!
//! Older documents are upgraded in place by the migration chain before the
//! endpoint records are parsed. Newer documents are rejected.

use crate::endpoint::{Endpoint, EndpointRecord};
use crate::error::{ManagerError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Write;
use std::path::Path;
use tracing::{debug, info};

/// Version written by this build
pub const CURRENT_VERSION: u32 = 2;

type Migration = fn(&mut Value) -> std::result::Result<(), String>;

/// Migration steps keyed by the version they upgrade from
const MIGRATIONS: &[(u32, Migration)] = &[(1, migrate_v1_to_v2)];

/// Version 1 records used `protect`, and had no `owner` or `overwrite_settings`.
fn migrate_v1_to_v2(document: &mut Value) -> std::result::Result<(), String> {
    let endpoints = document
        .get_mut("endpoints")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| "missing 'endpoints' array".to_string())?;

    for (index, endpoint) in endpoints.iter_mut().enumerate() {
        let record = endpoint
            .as_object_mut()
            .ok_or_else(|| format!("endpoint #{} is not an object", index))?;

        if let Some(protect) = record.remove("protect") {
            record.entry("protected").or_insert(protect);
        }
        record
            .entry("owner")
            .or_insert_with(|| Value::String("legacy".to_string()));
        record
            .entry("overwrite_settings")
            .or_insert(Value::Bool(false));
    }

    Ok(())
}

/// The whole persisted document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsDocument {
    #[serde(rename = "VERSION")]
    pub version: u32,
    #[serde(default)]
    pub endpoints: Vec<Value>,
}

impl SettingsDocument {
    /// Build a current-version document from persistent endpoints only
    pub fn from_endpoints<'a>(endpoints: impl IntoIterator<Item = &'a Endpoint>) -> Result<Self> {
        let endpoints = endpoints
            .into_iter()
            .filter(|endpoint| endpoint.is_persistent())
            .map(|endpoint| serde_json::to_value(endpoint.record()))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| ManagerError::internal(format!("cannot serialize endpoint: {}", e)))?;

        Ok(Self {
            version: CURRENT_VERSION,
            endpoints,
        })
    }

    /// Parse a document, running migrations when it is older than current
    pub fn parse(content: &str) -> Result<Self> {
        let mut value: Value = serde_json::from_str(content)
            .map_err(|e| ManagerError::SettingsMalformed(e.to_string()))?;

        let found = value
            .get("VERSION")
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| {
                ManagerError::SettingsMalformed("missing or invalid 'VERSION'".to_string())
            })?;

        if found > CURRENT_VERSION {
            return Err(ManagerError::SettingsVersionFuture {
                found,
                supported: CURRENT_VERSION,
            });
        }

        let mut version = found;
        while version < CURRENT_VERSION {
            let (_, migration) = MIGRATIONS
                .iter()
                .find(|(from, _)| *from == version)
                .ok_or_else(|| ManagerError::SettingsMigrationFailed {
                    from: version,
                    reason: "no migration registered".to_string(),
                })?;

            migration(&mut value).map_err(|reason| ManagerError::SettingsMigrationFailed {
                from: version,
                reason,
            })?;
            version += 1;
            value["VERSION"] = Value::from(version);
            debug!(from = version - 1, to = version, "Migrated settings document");
        }

        if found != version {
            info!(from = found, to = version, "Settings upgraded");
        }

        serde_json::from_value(value).map_err(|e| ManagerError::SettingsMalformed(e.to_string()))
    }

    /// Validate every record into an [`Endpoint`]
    pub fn endpoints(&self) -> Result<Vec<Endpoint>> {
        self.endpoints
            .iter()
            .enumerate()
            .map(|(index, value)| {
                let record: EndpointRecord = serde_json::from_value(value.clone()).map_err(|e| {
                    ManagerError::validation(format!("endpoint #{}: {}", index, e))
                })?;
                Endpoint::new(record)
            })
            .collect()
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| ManagerError::internal(e.to_string()))
    }

    /// Load a document from disk. A missing file yields `None`.
    pub fn load_file(path: &Path) -> Result<Option<Self>> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ManagerError::io(path.display().to_string(), e)),
        }
    }

    /// Replace the file's content with this document
    pub fn write_file(&self, path: &Path) -> Result<()> {
        let json = self.to_json()?;
        let io_err = |e: std::io::Error| ManagerError::io(path.display().to_string(), e);

        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir).map_err(io_err)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
        tmp.write_all(json.as_bytes()).map_err(io_err)?;
        tmp.write_all(b"\n").map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(path).map_err(|e| io_err(e.error))?;

        debug!(path = %path.display(), endpoints = self.endpoints.len(), "Settings written");
        Ok(())
    }
}
