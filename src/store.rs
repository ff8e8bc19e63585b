//! Ordered endpoint set with identity and name uniqueness
//!
//! The store is a plain value; the manager serializes access to it. Endpoints
//! keep their insertion order so assembled command lines stay stable.

use crate::endpoint::Endpoint;
use crate::error::{ManagerError, Result};
use crate::settings::SettingsDocument;
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info, warn};

/// Who is asking for a mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Request coming from the control API; protected endpoints are off limits
    User,
    /// Manager-internal bookkeeping
    Internal,
}

#[derive(Debug, Clone, Default)]
pub struct EndpointStore {
    endpoints: Vec<Endpoint>,
}

impl EndpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with factory defaults.
    ///
    /// Defaults that collide with an earlier default are skipped.
    pub fn with_defaults(defaults: impl IntoIterator<Item = Endpoint>) -> Self {
        let mut store = Self::new();
        for endpoint in defaults {
            let identity = endpoint.identity();
            if let Err(e) = store.add(endpoint) {
                warn!(endpoint = %identity, error = %e, "Skipping default endpoint");
            }
        }
        store
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.iter()
    }

    /// All endpoints in insertion order
    pub fn list(&self) -> Vec<Endpoint> {
        self.endpoints.clone()
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Endpoint> {
        let name = name.trim();
        self.endpoints.iter().find(|e| e.name() == name)
    }

    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        self.endpoints.iter().any(|e| e.same_link(endpoint))
    }

    /// Endpoints that go into the next command line
    pub fn enabled_view(&self) -> Vec<Endpoint> {
        self.endpoints
            .iter()
            .filter(|e| e.is_enabled())
            .cloned()
            .collect()
    }

    /// Insert an endpoint.
    ///
    /// With `overwrite_settings` set, an entry with the same name is replaced
    /// in place, even a protected one.
    pub fn add(&mut self, endpoint: Endpoint) -> Result<()> {
        self.insert(endpoint, None)
    }

    fn insert(&mut self, endpoint: Endpoint, position: Option<usize>) -> Result<()> {
        let replaced = if endpoint.overwrites_settings() {
            self.endpoints.iter().position(|e| e.name() == endpoint.name())
        } else {
            None
        };

        let others = || {
            self.endpoints
                .iter()
                .enumerate()
                .filter(|(i, _)| Some(*i) != replaced)
                .map(|(_, e)| e)
        };

        if let Some(existing) = others().find(|e| e.same_link(&endpoint)) {
            return Err(ManagerError::DuplicateIdentity(format!(
                "{} is already used by '{}'",
                endpoint,
                existing.name()
            )));
        }
        if others().any(|e| e.name() == endpoint.name()) {
            return Err(ManagerError::DuplicateName(endpoint.name().to_string()));
        }

        match (replaced, position) {
            (Some(index), _) => {
                debug!(endpoint = %endpoint, name = endpoint.name(), "Overwriting endpoint");
                self.endpoints[index] = endpoint;
            }
            (None, Some(index)) if index <= self.endpoints.len() => {
                self.endpoints.insert(index, endpoint);
            }
            (None, _) => self.endpoints.push(endpoint),
        }
        Ok(())
    }

    /// Remove the endpoint with the same identity
    pub fn remove(&mut self, endpoint: &Endpoint, origin: Origin) -> Result<Endpoint> {
        let index = self.position(endpoint)?;
        if origin == Origin::User && self.endpoints[index].is_protected() {
            return Err(ManagerError::Protected(self.endpoints[index].name().to_string()));
        }
        Ok(self.endpoints.remove(index))
    }

    /// Replace `old` with `new`, keeping its position.
    ///
    /// On failure the store is left exactly as before.
    pub fn update(&mut self, old: &Endpoint, new: Endpoint, origin: Origin) -> Result<()> {
        let index = self.position(old)?;
        let removed = self.remove(old, origin)?;

        if let Err(e) = self.insert(new, Some(index)) {
            self.endpoints.insert(index, removed);
            return Err(e);
        }
        Ok(())
    }

    /// Drop every non-protected endpoint, returning what was removed
    pub fn clear(&mut self) -> Vec<Endpoint> {
        let (kept, removed): (Vec<_>, Vec<_>) =
            self.endpoints.drain(..).partition(|e| e.is_protected());
        self.endpoints = kept;
        removed
    }

    fn position(&self, endpoint: &Endpoint) -> Result<usize> {
        self.endpoints
            .iter()
            .position(|e| e.same_link(endpoint))
            .ok_or_else(|| ManagerError::NotFound(endpoint.identity()))
    }

    /// Merge endpoints from a settings file into the store.
    ///
    /// Stored endpoints replace entries that share their name or identity,
    /// unless the existing entry carries `overwrite_settings`. A missing file
    /// leaves the store untouched. Returns the number of endpoints taken from
    /// the file.
    pub fn load(&mut self, path: &Path) -> Result<usize> {
        let Some(document) = SettingsDocument::load_file(path)? else {
            info!(path = %path.display(), "No settings file, keeping defaults");
            return Ok(0);
        };

        let mut loaded = 0;
        let mut from_file: HashSet<Endpoint> = HashSet::new();

        for stored in document.endpoints()? {
            let conflicts = |e: &Endpoint| e.name() == stored.name() || e.same_link(&stored);

            if self
                .endpoints
                .iter()
                .any(|e| conflicts(e) && (e.overwrites_settings() || from_file.contains(e)))
            {
                debug!(endpoint = %stored, name = stored.name(), "Stored endpoint superseded");
                continue;
            }

            let position = self.endpoints.iter().position(|e| conflicts(e));
            self.endpoints.retain(|e| !conflicts(e));
            let position = position.map(|p| p.min(self.endpoints.len()));
            from_file.insert(stored.clone());
            self.insert(stored, position)?;
            loaded += 1;
        }

        info!(path = %path.display(), loaded, total = self.len(), "Settings loaded");
        Ok(loaded)
    }

    /// Write persistent endpoints to `path`
    pub fn save(&self, path: &Path) -> Result<()> {
        SettingsDocument::from_endpoints(&self.endpoints)?.write_file(path)
    }
}
