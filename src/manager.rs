//! Router manager facade
//!
//! [`Manager`] is the single entry point for the control API. It owns the
//! endpoint store, the selected backend, the master endpoint and the process
//! supervisor, and runs the watchdog that keeps the router alive.
//!
//! Two locks are involved:
//!
//! * `state` (a `parking_lot::Mutex`) guards the store, backend, master,
//!   desired flag and settings path. It is never held across an `.await`.
//! * `supervisor` (a `tokio::sync::Mutex`) serializes process lifecycle
//!   operations, so at most one child exists at any time. The command line is
//!   snapshotted from `state` while this lock is held, which makes a restart
//!   atomic with respect to concurrent endpoint changes.

use crate::backend::{AvailableBackend, BackendDescriptor, BackendRegistry};
use crate::config::ManagerConfig;
use crate::endpoint::Endpoint;
use crate::error::{ManagerError, Result};
use crate::store::{EndpointStore, Origin};
use crate::supervisor::{ProcessState, Supervisor};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What the user asked the router to be doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    Running,
    Stopped,
}

struct ManagerState {
    store: EndpointStore,
    backend: AvailableBackend,
    master: Option<Endpoint>,
    desired: DesiredState,
    log_dir: PathBuf,
    /// `None` when persistence is off
    settings_file: Option<PathBuf>,
}

impl ManagerState {
    fn persist(&self) -> Result<()> {
        match self.settings_file {
            Some(ref path) => self.store.save(path),
            None => Ok(()),
        }
    }

    /// Limits the backend places on the enabled set as a whole
    fn check_links(&self) -> Result<()> {
        self.backend
            .backend
            .validate_links(self.master.as_ref(), &self.store.enabled_view())
    }

    fn command(&self) -> Result<String> {
        let master = self.master.as_ref().ok_or_else(|| {
            ManagerError::NoMaster("set a master endpoint before starting the router".to_string())
        })?;
        self.backend
            .backend
            .assemble(master, &self.store.enabled_view(), &self.log_dir)
    }
}

/// Snapshot of the manager for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub backend: BackendDescriptor,
    pub desired: DesiredState,
    pub process: ProcessState,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub command: Option<String>,
    pub log_dir: PathBuf,
    pub master: Option<Endpoint>,
    pub endpoints: usize,
}

/// Supervises one external MAVLink router.
///
/// Like the other long-lived services in this crate, `Manager` is shared
/// behind an `Arc`; [`Manager::new`] returns one directly.
pub struct Manager {
    state: Mutex<ManagerState>,
    supervisor: tokio::sync::Mutex<Supervisor>,
    process_state: watch::Receiver<ProcessState>,
    registry: BackendRegistry,
    watchdog_interval: Duration,
}

impl Manager {
    /// Create a manager with the preferred (or first) available backend.
    ///
    /// Default endpoints the backend cannot handle are left out.
    pub fn new(
        registry: BackendRegistry,
        config: &ManagerConfig,
        defaults: Vec<Endpoint>,
        master: Option<Endpoint>,
    ) -> Result<Arc<Self>> {
        let backend = registry.select(config.preferred_backend.as_deref())?;

        if let Some(ref master) = master {
            backend.backend.validate_master(master)?;
            backend.backend.validate_links(Some(master), &[])?;
        }

        let defaults = defaults.into_iter().filter(|endpoint| {
            let supported = backend.backend.validate(endpoint).is_ok();
            if !supported {
                debug!(endpoint = %endpoint, backend = backend.backend.name(), "Default endpoint not supported");
            }
            supported
        });
        let store = EndpointStore::with_defaults(defaults);

        let mut supervisor = Supervisor::new(config.settle_delay(), config.stop_timeout())?;
        if let Some(ref dir) = config.log_dir {
            supervisor.set_log_dir(dir)?;
        }

        info!(
            backend = backend.backend.name(),
            version = %backend.version,
            endpoints = store.len(),
            log_dir = %supervisor.log_dir().display(),
            "Router manager created"
        );

        Ok(Arc::new(Self {
            state: Mutex::new(ManagerState {
                store,
                backend,
                master,
                desired: DesiredState::Stopped,
                log_dir: supervisor.log_dir().to_path_buf(),
                settings_file: config.settings_file.clone(),
            }),
            process_state: supervisor.subscribe(),
            supervisor: tokio::sync::Mutex::new(supervisor),
            registry,
            watchdog_interval: config.watchdog_interval(),
        }))
    }

    /// Merge the settings file into the store.
    ///
    /// Loaded endpoints the active backend cannot handle are kept, but disabled.
    /// A file that cannot be loaded is never overwritten: persistence stays
    /// off until the manager is recreated.
    pub fn load_settings(&self) -> Result<usize> {
        let mut state = self.state.lock();
        let Some(path) = state.settings_file.clone() else {
            return Ok(0);
        };

        let loaded = match state.store.load(&path) {
            Ok(loaded) => loaded,
            Err(e) => {
                error!(
                    path = %path.display(),
                    error = %e,
                    "Cannot load settings, persistence disabled"
                );
                state.settings_file = None;
                return Err(e);
            }
        };

        let unsupported: Vec<Endpoint> = state
            .store
            .iter()
            .filter(|e| e.is_enabled() && state.backend.backend.validate(e).is_err())
            .cloned()
            .collect();
        for endpoint in unsupported {
            warn!(
                endpoint = %endpoint,
                backend = state.backend.backend.name(),
                "Disabling endpoint unsupported by backend"
            );
            let disabled = endpoint.with_enabled(false);
            state.store.update(&endpoint, disabled, Origin::Internal)?;
        }

        // Rewrite at the current version
        if loaded > 0 {
            state.store.save(&path)?;
        }
        Ok(loaded)
    }

    /// Settings file in use, `None` when persistence is off
    pub fn settings_file(&self) -> Option<PathBuf> {
        self.state.lock().settings_file.clone()
    }

    /// Apply a store mutation, save, and restart the router if the enabled set
    /// changed while it should be running.
    async fn mutate<T>(
        &self,
        operation: impl FnOnce(&mut ManagerState) -> Result<T>,
    ) -> Result<T> {
        let (value, needs_restart, saved) = {
            let mut state = self.state.lock();
            let before = state.store.enabled_view();
            let snapshot = state.store.clone();
            let value = operation(&mut *state)?;
            if let Err(e) = state.check_links() {
                state.store = snapshot;
                return Err(e);
            }
            let changed = state.store.enabled_view() != before;
            let saved = state.persist();
            (value, changed && state.desired == DesiredState::Running, saved)
        };

        if needs_restart {
            debug!("Enabled endpoints changed, restarting router");
            if let Err(e) = self.restart_router(true).await {
                if let Err(ref save_error) = saved {
                    error!(error = %save_error, "Failed to save settings");
                }
                return Err(e);
            }
        }
        saved?;
        Ok(value)
    }

    /// Names of the installed backends
    pub fn list_backends(&self) -> Vec<String> {
        self.registry.names()
    }

    pub fn backend_descriptors(&self) -> Vec<BackendDescriptor> {
        self.registry.descriptors()
    }

    pub fn current_backend(&self) -> BackendDescriptor {
        self.state.lock().backend.descriptor()
    }

    /// Switch backend. Only allowed while the router is desired stopped.
    pub fn set_backend(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.desired == DesiredState::Running {
            return Err(ManagerError::Busy(
                "stop the router before changing backend".to_string(),
            ));
        }

        let candidate = self
            .registry
            .get(name)
            .cloned()
            .ok_or_else(|| ManagerError::NotFound(format!("backend '{}'", name)))?;

        if let Some(ref master) = state.master {
            candidate.backend.validate_master(master)?;
        }
        let enabled = state.store.enabled_view();
        for endpoint in &enabled {
            candidate.backend.validate(endpoint)?;
        }
        candidate
            .backend
            .validate_links(state.master.as_ref(), &enabled)?;

        info!(from = state.backend.backend.name(), to = name, "Backend changed");
        state.backend = candidate;
        Ok(())
    }

    pub fn list_endpoints(&self) -> Vec<Endpoint> {
        self.state.lock().store.list()
    }

    pub fn get_endpoint(&self, name: &str) -> Option<Endpoint> {
        self.state.lock().store.get_by_name(name).cloned()
    }

    pub async fn add_endpoint(&self, endpoint: Endpoint) -> Result<()> {
        self.mutate(|state| {
            state.backend.backend.validate(&endpoint)?;
            info!(endpoint = %endpoint, name = endpoint.name(), "Adding endpoint");
            state.store.add(endpoint)
        })
        .await
    }

    pub async fn remove_endpoint(&self, endpoint: &Endpoint) -> Result<()> {
        self.mutate(|state| {
            let removed = state.store.remove(endpoint, Origin::User)?;
            info!(endpoint = %removed, name = removed.name(), "Removed endpoint");
            Ok(())
        })
        .await
    }

    pub async fn update_endpoint(&self, old: &Endpoint, new: Endpoint) -> Result<()> {
        self.mutate(|state| {
            state.backend.backend.validate(&new)?;
            info!(old = %old, new = %new, "Updating endpoint");
            state.store.update(old, new, Origin::User)
        })
        .await
    }

    /// Remove every non-protected endpoint
    pub async fn clear_endpoints(&self) -> Result<Vec<Endpoint>> {
        self.mutate(|state| {
            let removed = state.store.clear();
            info!(removed = removed.len(), "Cleared endpoints");
            Ok(removed)
        })
        .await
    }

    pub fn master(&self) -> Option<Endpoint> {
        self.state.lock().master.clone()
    }

    pub async fn set_master(&self, master: Endpoint) -> Result<()> {
        let needs_restart = {
            let mut state = self.state.lock();
            state.backend.backend.validate_master(&master)?;
            state
                .backend
                .backend
                .validate_links(Some(&master), &state.store.enabled_view())?;
            let changed = state
                .master
                .as_ref()
                .map_or(true, |current| current != &master);
            info!(master = %master, "Master endpoint set");
            state.master = Some(master);
            changed && state.desired == DesiredState::Running
        };

        if needs_restart {
            self.restart_router(true).await?;
        }
        Ok(())
    }

    /// Command line the router would be started with right now
    pub fn command_preview(&self) -> Result<String> {
        self.state.lock().command()
    }

    pub fn desired(&self) -> DesiredState {
        self.state.lock().desired
    }

    /// Current process state, without waiting for lifecycle operations
    pub fn process_state(&self) -> ProcessState {
        *self.process_state.borrow()
    }

    pub fn log_dir(&self) -> PathBuf {
        self.state.lock().log_dir.clone()
    }

    /// Use an existing directory for router logs
    pub async fn set_log_dir(&self, path: &Path) -> Result<()> {
        let mut supervisor = self.supervisor.lock().await;
        let mut state = self.state.lock();
        if state.desired == DesiredState::Running {
            return Err(ManagerError::Busy(
                "stop the router before changing the log directory".to_string(),
            ));
        }
        supervisor.set_log_dir(path)?;
        state.log_dir = path.to_path_buf();
        Ok(())
    }

    /// Start the router if it is not already running
    pub async fn start(&self) -> Result<()> {
        self.state.lock().desired = DesiredState::Running;
        if self.process_state() == ProcessState::Running {
            return Ok(());
        }
        self.restart_router(true).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.state.lock().desired = DesiredState::Stopped;
        self.supervisor.lock().await.exit().await;
        info!("Router stopped");
        Ok(())
    }

    pub async fn restart(&self) -> Result<()> {
        self.state.lock().desired = DesiredState::Running;
        self.restart_router(true).await
    }

    /// Stop the current child and spawn a fresh one from the current store.
    ///
    /// With `clear_on_failure`, a failed start also clears the desired flag.
    async fn restart_router(&self, clear_on_failure: bool) -> Result<()> {
        let mut supervisor = self.supervisor.lock().await;
        let command = self.command_preview();
        let result = match command {
            Ok(command) => supervisor.restart(&command).await,
            Err(e) => Err(e),
        };

        if let Err(ref e) = result {
            if clear_on_failure {
                self.state.lock().desired = DesiredState::Stopped;
            }
            error!(error = %e, "Router restart failed");
        }
        result
    }

    pub async fn status(&self) -> ManagerStatus {
        let supervisor = self.supervisor.lock().await;
        let state = self.state.lock();
        ManagerStatus {
            backend: state.backend.descriptor(),
            desired: state.desired,
            process: supervisor.state(),
            pid: supervisor.pid(),
            started_at: supervisor.started_at(),
            exit_code: supervisor.exit_code(),
            command: supervisor.command().map(str::to_string),
            log_dir: state.log_dir.clone(),
            master: state.master.clone(),
            endpoints: state.store.len(),
        }
    }

    /// One watchdog pass: restart the router if it should run but does not
    async fn watchdog_tick(&self) {
        let mut supervisor = self.supervisor.lock().await;
        if self.desired() != DesiredState::Running {
            return;
        }
        if supervisor.poll() == ProcessState::Running {
            return;
        }

        warn!("Router is not running, restarting");
        let command = match self.command_preview() {
            Ok(command) => command,
            Err(e) => {
                error!(error = %e, "Cannot assemble router command");
                return;
            }
        };
        if let Err(e) = supervisor.restart(&command).await {
            error!(error = %e, "Watchdog restart failed, retrying next tick");
        }
    }

    /// Run the watchdog until `shutdown_rx` turns true
    pub fn spawn_watchdog(self: &Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                interval_ms = manager.watchdog_interval.as_millis(),
                "Router watchdog started"
            );

            loop {
                tokio::select! {
                    _ = tokio::time::sleep(manager.watchdog_interval) => {
                        manager.watchdog_tick().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            info!("Router watchdog shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{create, AvailableBackend};
    use crate::endpoint::{EndpointRecord, EndpointType};

    fn registry() -> BackendRegistry {
        BackendRegistry::from_available(vec![
            AvailableBackend {
                backend: create("mavlink-router", None).unwrap(),
                version: "4".to_string(),
            },
            AvailableBackend {
                backend: create("mavlink-server", None).unwrap(),
                version: "0.1.0".to_string(),
            },
        ])
    }

    fn config(preferred: &str) -> ManagerConfig {
        ManagerConfig {
            preferred_backend: Some(preferred.to_string()),
            ..ManagerConfig::default()
        }
    }

    fn serial_master() -> Endpoint {
        EndpointRecord::new("Autopilot", EndpointType::Serial, "/dev/ttyUSB0", 115200)
            .build()
            .unwrap()
    }

    fn udp_server(name: &str, port: u32) -> Endpoint {
        EndpointRecord::new(name, EndpointType::UdpServer, "0.0.0.0", port)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_command_preview() {
        let manager = Manager::new(registry(), &config("mavlink-server"), vec![], None).unwrap();
        assert!(matches!(
            manager.command_preview().unwrap_err(),
            ManagerError::NoMaster(_)
        ));

        manager.add_endpoint(udp_server("GCS", 14550)).await.unwrap();
        manager.set_master(serial_master()).await.unwrap();
        assert_eq!(
            manager.command_preview().unwrap(),
            "mavlink-server serial:/dev/ttyUSB0:115200 udps:0.0.0.0:14550"
        );
    }

    #[tokio::test]
    async fn test_kind_not_supported_leaves_store_unchanged() {
        let manager = Manager::new(registry(), &config("mavlink-router"), vec![], None).unwrap();

        let err = manager.add_endpoint(udp_server("GCS", 14550)).await.unwrap_err();
        assert!(matches!(err, ManagerError::KindNotSupported(_)));
        assert!(manager.list_endpoints().is_empty());
    }

    #[tokio::test]
    async fn test_bad_master_kind() {
        let manager = Manager::new(registry(), &config("mavlink-router"), vec![], None).unwrap();
        let master = EndpointRecord::new("Upstream", EndpointType::UdpClient, "10.0.0.1", 14550)
            .build()
            .unwrap();

        let err = manager.set_master(master).await.unwrap_err();
        assert!(matches!(err, ManagerError::BadMasterKind(_)));
        assert!(manager.master().is_none());
    }

    #[tokio::test]
    async fn test_single_tcp_port_enforced() {
        let manager = Manager::new(registry(), &config("mavlink-router"), vec![], None).unwrap();
        let tcp_server = |name: &str, port: u32| {
            EndpointRecord::new(name, EndpointType::TcpServer, "0.0.0.0", port)
                .build()
                .unwrap()
        };

        manager.add_endpoint(tcp_server("Inspector", 5777)).await.unwrap();
        assert!(matches!(
            manager.add_endpoint(tcp_server("Second", 5778)).await.unwrap_err(),
            ManagerError::KindNotSupported(_)
        ));
        assert_eq!(manager.list_endpoints().len(), 1);

        assert!(matches!(
            manager.set_master(tcp_server("Autopilot", 5760)).await.unwrap_err(),
            ManagerError::KindNotSupported(_)
        ));
        assert!(manager.master().is_none());

        manager.set_master(serial_master()).await.unwrap();
        assert!(manager.command_preview().unwrap().contains("--tcp-port 5777"));
    }

    #[test]
    fn test_unsupported_defaults_filtered() {
        let defaults = vec![
            udp_server("GCS Server Link", 14550),
            EndpointRecord::new("Inspector Link", EndpointType::TcpServer, "0.0.0.0", 5777)
                .build()
                .unwrap(),
        ];
        let manager = Manager::new(registry(), &config("mavlink-router"), defaults, None).unwrap();

        let names: Vec<_> = manager
            .list_endpoints()
            .iter()
            .map(|e| e.name().to_string())
            .collect();
        assert_eq!(names, ["Inspector Link"]);
    }

    #[test]
    fn test_set_backend() {
        let manager = Manager::new(registry(), &config("mavlink-server"), vec![], None).unwrap();
        assert_eq!(manager.current_backend().name, "mavlink-server");
        assert_eq!(manager.list_backends(), ["mavlink-router", "mavlink-server"]);

        manager.set_backend("mavlink-router").unwrap();
        assert_eq!(manager.current_backend().name, "mavlink-router");

        assert!(matches!(
            manager.set_backend("mavproxy").unwrap_err(),
            ManagerError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_set_backend_rejects_incompatible_endpoints() {
        let manager = Manager::new(registry(), &config("mavlink-server"), vec![], None).unwrap();
        manager.add_endpoint(udp_server("GCS", 14550)).await.unwrap();

        assert!(matches!(
            manager.set_backend("mavlink-router").unwrap_err(),
            ManagerError::KindNotSupported(_)
        ));
        assert_eq!(manager.current_backend().name, "mavlink-server");
    }

    #[tokio::test]
    async fn test_protected_endpoint_not_removable() {
        let protected = EndpointRecord::new("GCS", EndpointType::UdpServer, "0.0.0.0", 14550)
            .protected(true)
            .build()
            .unwrap();
        let manager =
            Manager::new(registry(), &config("mavlink-server"), vec![protected.clone()], None)
                .unwrap();

        assert!(matches!(
            manager.remove_endpoint(&protected).await.unwrap_err(),
            ManagerError::Protected(_)
        ));
        assert!(matches!(
            manager
                .update_endpoint(&protected, protected.with_enabled(false))
                .await
                .unwrap_err(),
            ManagerError::Protected(_)
        ));
        assert!(manager.clear_endpoints().await.unwrap().is_empty());
        assert_eq!(manager.list_endpoints().len(), 1);
    }

    #[tokio::test]
    async fn test_mutations_persist() {
        let tmp = tempfile::TempDir::new().unwrap();
        let settings = tmp.path().join("settings.json");
        let config = ManagerConfig {
            settings_file: Some(settings.clone()),
            ..config("mavlink-server")
        };

        let manager = Manager::new(registry(), &config, vec![], None).unwrap();
        let persistent = EndpointRecord::new("GCS", EndpointType::UdpServer, "0.0.0.0", 14550)
            .persistent(true)
            .build()
            .unwrap();
        manager.add_endpoint(persistent).await.unwrap();
        manager.add_endpoint(udp_server("Volatile", 14551)).await.unwrap();

        let reloaded = Manager::new(registry(), &config, vec![], None).unwrap();
        assert_eq!(reloaded.load_settings().unwrap(), 1);
        assert_eq!(reloaded.list_endpoints()[0].name(), "GCS");
    }

    #[tokio::test]
    async fn test_set_log_dir() {
        let manager = Manager::new(registry(), &config("mavlink-router"), vec![], None).unwrap();
        let tmp = tempfile::TempDir::new().unwrap();

        assert!(matches!(
            manager
                .set_log_dir(Path::new("/nonexistent/router-logs"))
                .await
                .unwrap_err(),
            ManagerError::Validation(_)
        ));

        manager.set_log_dir(tmp.path()).await.unwrap();
        assert_eq!(manager.log_dir(), tmp.path());
        manager.set_master(serial_master()).await.unwrap();
        assert!(manager
            .command_preview()
            .unwrap()
            .contains(&format!("--log {}", tmp.path().display())));
    }

    #[tokio::test]
    async fn test_start_without_master_clears_desired() {
        let manager = Manager::new(registry(), &config("mavlink-server"), vec![], None).unwrap();
        assert!(matches!(
            manager.start().await.unwrap_err(),
            ManagerError::NoMaster(_)
        ));
        assert_eq!(manager.desired(), DesiredState::Stopped);
    }
}
