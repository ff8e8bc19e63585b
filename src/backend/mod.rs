//! Router backends
//!
//! Each backend wraps an external MAVLink routing program and knows how to
//! report its version, which endpoint kinds it understands, and how to turn a
//! master endpoint plus an endpoint snapshot into a command line.
//!
//! Backends are listed in [`REGISTRY`] in order of preference. The table is
//! the only process-wide state and is never mutated.

pub mod mavlink_router;
pub mod mavlink_server;
pub mod mavproxy;

use crate::endpoint::{Endpoint, EndpointType};
use crate::error::{ManagerError, Result};
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

pub use mavlink_router::MavlinkRouter;
pub use mavlink_server::MavlinkServer;
pub use mavproxy::MavProxy;

/// Constructor for a backend, optionally with a binary path override
pub type BackendFactory = fn(Option<&str>) -> Arc<dyn RouterBackend>;

/// Known backends, in default selection order
pub const REGISTRY: &[(&str, BackendFactory)] = &[
    (mavlink_router::NAME, mavlink_router::factory),
    (mavlink_server::NAME, mavlink_server::factory),
    (mavproxy::NAME, mavproxy::factory),
];

/// Construct a registered backend by name
pub fn create(name: &str, binary: Option<&str>) -> Option<Arc<dyn RouterBackend>> {
    REGISTRY
        .iter()
        .find(|(registered, _)| *registered == name)
        .map(|(_, factory)| factory(binary))
}

/// Command-line adapter for one routing program
pub trait RouterBackend: Send + Sync + fmt::Debug {
    /// Registry name
    fn name(&self) -> &'static str;

    /// Executable name or path
    fn binary(&self) -> &str;

    /// Arguments that make the binary print its version
    fn version_args(&self) -> &'static [&'static str];

    /// Pattern whose first capture group is the version
    fn version_pattern(&self) -> &'static str;

    /// Kinds accepted as output endpoints
    fn accepted_kinds(&self) -> &'static [EndpointType];

    /// Kinds accepted as the master endpoint
    fn accepted_master_kinds(&self) -> &'static [EndpointType];

    /// Arguments following the binary. Kinds are already validated.
    fn assemble_args(&self, master: &Endpoint, endpoints: &[Endpoint], log_dir: &Path)
        -> Vec<String>;

    fn validate(&self, endpoint: &Endpoint) -> Result<()> {
        if self.accepted_kinds().contains(&endpoint.kind()) {
            return Ok(());
        }
        Err(ManagerError::KindNotSupported(format!(
            "{} does not support {} endpoints ({})",
            self.name(),
            endpoint.kind(),
            endpoint
        )))
    }

    fn validate_master(&self, master: &Endpoint) -> Result<()> {
        if self.accepted_master_kinds().contains(&master.kind()) {
            return Ok(());
        }
        Err(ManagerError::BadMasterKind(format!(
            "{} cannot use a {} master ({})",
            self.name(),
            master.kind(),
            master
        )))
    }

    /// Check limits that involve several links at once, such as a single
    /// listening port shared by the master and the outputs
    fn validate_links(&self, _master: Option<&Endpoint>, _endpoints: &[Endpoint]) -> Result<()> {
        Ok(())
    }

    /// Shell-ready command line for `master` and the enabled `endpoints`
    fn assemble(&self, master: &Endpoint, endpoints: &[Endpoint], log_dir: &Path) -> Result<String> {
        self.validate_master(master)?;
        for endpoint in endpoints {
            self.validate(endpoint)?;
        }
        self.validate_links(Some(master), endpoints)?;

        let mut words = vec![self.binary().to_string()];
        words.extend(self.assemble_args(master, endpoints, log_dir));
        Ok(shell_words::join(&words))
    }
}

impl dyn RouterBackend {
    /// Run the binary with its version flag and extract the version
    pub async fn version(&self, timeout: Duration) -> Result<String> {
        let unavailable =
            |reason: String| ManagerError::BackendUnavailable(format!("{}: {}", self.name(), reason));

        let output = tokio::time::timeout(
            timeout,
            Command::new(self.binary())
                .args(self.version_args())
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| unavailable("version check timed out".to_string()))?
        .map_err(|e| unavailable(format!("cannot run '{}': {}", self.binary(), e)))?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push('\n');
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        let pattern = Regex::new(self.version_pattern())
            .map_err(|e| ManagerError::internal(format!("bad version pattern: {}", e)))?;

        pattern
            .captures(&text)
            .and_then(|captures| captures.get(1))
            .map(|m| m.as_str().to_string())
            .filter(|version| !version.is_empty())
            .ok_or_else(|| unavailable("no version in output".to_string()))
    }

    /// True when the binary runs and reports a version
    pub async fn is_available(&self, timeout: Duration) -> bool {
        match self.version(timeout).await {
            Ok(version) => {
                debug!(backend = self.name(), %version, "Backend available");
                true
            }
            Err(e) => {
                debug!(backend = self.name(), error = %e, "Backend not available");
                false
            }
        }
    }

    pub fn descriptor(&self, version: &str) -> BackendDescriptor {
        BackendDescriptor {
            name: self.name().to_string(),
            binary: self.binary().to_string(),
            version: version.to_string(),
            accepted_kinds: self.accepted_kinds().to_vec(),
            accepted_master_kinds: self.accepted_master_kinds().to_vec(),
        }
    }
}

/// Public description of an installed backend
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendDescriptor {
    pub name: String,
    pub binary: String,
    pub version: String,
    pub accepted_kinds: Vec<EndpointType>,
    pub accepted_master_kinds: Vec<EndpointType>,
}

/// A backend that passed its availability check
#[derive(Debug, Clone)]
pub struct AvailableBackend {
    pub backend: Arc<dyn RouterBackend>,
    pub version: String,
}

impl AvailableBackend {
    pub fn descriptor(&self) -> BackendDescriptor {
        self.backend.descriptor(&self.version)
    }
}

/// Backends found on this host, in registry order
#[derive(Debug, Clone, Default)]
pub struct BackendRegistry {
    available: Vec<AvailableBackend>,
}

impl BackendRegistry {
    /// Detect every registered backend.
    ///
    /// `binaries` overrides the executable per backend name.
    pub async fn discover(binaries: &HashMap<String, String>, timeout: Duration) -> Self {
        let candidates = REGISTRY
            .iter()
            .map(|(name, factory)| factory(binaries.get(*name).map(String::as_str)))
            .collect();
        Self::detect(candidates, timeout).await
    }

    /// Detect an explicit list of backends
    pub async fn detect(candidates: Vec<Arc<dyn RouterBackend>>, timeout: Duration) -> Self {
        let mut available = Vec::new();
        for backend in candidates {
            match backend.version(timeout).await {
                Ok(version) => {
                    info!(backend = backend.name(), binary = backend.binary(), %version, "Found router backend");
                    available.push(AvailableBackend { backend, version });
                }
                Err(e) => debug!(backend = backend.name(), error = %e, "Skipping backend"),
            }
        }
        Self { available }
    }

    /// Build a registry from already detected backends
    pub fn from_available(available: Vec<AvailableBackend>) -> Self {
        Self { available }
    }

    pub fn names(&self) -> Vec<String> {
        self.available
            .iter()
            .map(|a| a.backend.name().to_string())
            .collect()
    }

    pub fn descriptors(&self) -> Vec<BackendDescriptor> {
        self.available.iter().map(AvailableBackend::descriptor).collect()
    }

    pub fn get(&self, name: &str) -> Option<&AvailableBackend> {
        self.available.iter().find(|a| a.backend.name() == name)
    }

    pub fn is_empty(&self) -> bool {
        self.available.is_empty()
    }

    /// Pick `preferred` if available, else the first available backend
    pub fn select(&self, preferred: Option<&str>) -> Result<AvailableBackend> {
        if let Some(name) = preferred {
            if let Some(found) = self.get(name) {
                return Ok(found.clone());
            }
            warn!(backend = name, "Preferred backend not available, using default");
        }
        self.available.first().cloned().ok_or_else(|| {
            ManagerError::BackendUnavailable("no router backend is installed".to_string())
        })
    }
}

/// `host:port`, with IPv6 hosts bracketed
pub(crate) fn host_port(endpoint: &Endpoint) -> String {
    if endpoint.place().contains(':') {
        format!("[{}]:{}", endpoint.place(), endpoint.argument())
    } else {
        format!("{}:{}", endpoint.place(), endpoint.argument())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointRecord;

    #[test]
    fn test_registry_order() {
        let names: Vec<_> = REGISTRY.iter().map(|(name, _)| *name).collect();
        assert_eq!(names, ["mavlink-router", "mavlink-server", "mavproxy"]);
    }

    #[test]
    fn test_create_with_override() {
        let backend = create("mavlink-server", Some("/opt/bin/mavlink-server")).unwrap();
        assert_eq!(backend.binary(), "/opt/bin/mavlink-server");
        assert!(create("unknown", None).is_none());
    }

    #[test]
    fn test_assemble_quotes_glob_characters() {
        let backend = create("mavproxy", Some("/opt/my tools/mavproxy.py")).unwrap();
        let master = EndpointRecord::new("Autopilot", EndpointType::Serial, "/dev/ttyACM0", 115200)
            .build()
            .unwrap();
        let v6 = EndpointRecord::new("Six", EndpointType::UdpClient, "::1", 14551)
            .build()
            .unwrap();

        let command = backend
            .assemble(&master, &[v6], Path::new("/tmp/state dir"))
            .unwrap();
        assert!(command.starts_with("'/opt/my tools/mavproxy.py' "));
        assert!(command.contains("'--out=udpout:[::1]:14551'"));

        let words = shell_words::split(&command).unwrap();
        assert_eq!(words[0], "/opt/my tools/mavproxy.py");
        assert!(words.contains(&"--out=udpout:[::1]:14551".to_string()));
        assert!(words.contains(&"--state-basedir=/tmp/state dir".to_string()));
    }

    #[test]
    fn test_host_port_brackets_ipv6() {
        let v6 = EndpointRecord::new("Six", EndpointType::UdpClient, "::1", 14550)
            .build()
            .unwrap();
        assert_eq!(host_port(&v6), "[::1]:14550");
    }

    #[test]
    fn test_select_without_backends() {
        let registry = BackendRegistry::default();
        assert!(matches!(
            registry.select(None).unwrap_err(),
            ManagerError::BackendUnavailable(_)
        ));
    }

    #[test]
    fn test_select_preferred() {
        let registry = BackendRegistry::from_available(vec![
            AvailableBackend {
                backend: create("mavlink-router", None).unwrap(),
                version: "4".to_string(),
            },
            AvailableBackend {
                backend: create("mavproxy", None).unwrap(),
                version: "1.8.70".to_string(),
            },
        ]);

        assert_eq!(registry.select(None).unwrap().backend.name(), "mavlink-router");
        assert_eq!(
            registry.select(Some("mavproxy")).unwrap().backend.name(),
            "mavproxy"
        );
        assert_eq!(
            registry.select(Some("mavlink-server")).unwrap().backend.name(),
            "mavlink-router"
        );
        assert_eq!(registry.names(), ["mavlink-router", "mavproxy"]);
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let backend = create("mavlink-server", Some("/nonexistent/mavlink-server")).unwrap();
        assert!(!backend.is_available(Duration::from_secs(1)).await);
        assert!(matches!(
            backend.version(Duration::from_secs(1)).await.unwrap_err(),
            ManagerError::BackendUnavailable(_)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_version_detection() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::TempDir::new().unwrap();
        let script = tmp.path().join("mavproxy.py");
        std::fs::write(
            &script,
            "#!/bin/sh\necho 'MAVProxy is a modular ground station'\necho 'MAVProxy Version: 1.8.70'\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let backend = create("mavproxy", Some(script.to_str().unwrap())).unwrap();
        let version = backend.version(Duration::from_secs(5)).await.unwrap();
        assert_eq!(version, "1.8.70");

        let registry = BackendRegistry::detect(vec![backend], Duration::from_secs(5)).await;
        assert_eq!(registry.descriptors()[0].version, "1.8.70");
    }
}
