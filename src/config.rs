use crate::backend::REGISTRY;
use crate::endpoint::{Endpoint, EndpointRecord, EndpointType};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon configuration
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Control API settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Router supervision settings
    #[serde(default)]
    pub manager: ManagerConfig,

    /// Upstream link, usually the autopilot
    pub master: Option<EndpointRecord>,

    /// Endpoints injected when the store is created.
    /// Empty means the built-in factory defaults.
    #[serde(default)]
    pub default_endpoints: Vec<EndpointRecord>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Control API port (default: 6040, set to 0 to disable)
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_api_port(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ManagerConfig {
    /// Settings file holding persistent endpoints
    pub settings_file: Option<PathBuf>,

    /// Backend to use when several are installed
    pub preferred_backend: Option<String>,

    /// Router log directory (default: a temporary directory)
    pub log_dir: Option<PathBuf>,

    /// Period of the restart watchdog in milliseconds
    #[serde(default = "default_watchdog_interval")]
    pub watchdog_interval_ms: u64,

    /// Time a new router must survive to count as started, in milliseconds
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,

    /// Grace period in seconds between SIGTERM and SIGKILL
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    /// Time allowed for a backend version check in milliseconds
    #[serde(default = "default_version_timeout")]
    pub version_timeout_ms: u64,

    /// Start the router as soon as a master is known
    #[serde(default = "default_autostart")]
    pub autostart: bool,

    /// Binary path overrides keyed by backend name
    #[serde(default)]
    pub binaries: HashMap<String, String>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            settings_file: None,
            preferred_backend: None,
            log_dir: None,
            watchdog_interval_ms: default_watchdog_interval(),
            settle_delay_ms: default_settle_delay(),
            stop_timeout_secs: default_stop_timeout(),
            version_timeout_ms: default_version_timeout(),
            autostart: default_autostart(),
            binaries: HashMap::new(),
        }
    }
}

impl ManagerConfig {
    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn version_timeout(&self) -> Duration {
        Duration::from_millis(self.version_timeout_ms)
    }

    /// Configured settings file, or the per-user default
    pub fn settings_path(&self) -> PathBuf {
        self.settings_file
            .clone()
            .unwrap_or_else(default_settings_path)
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.watchdog_interval_ms == 0 {
            errors.push("manager.watchdog_interval_ms must be greater than 0".to_string());
        }
        if self.stop_timeout_secs == 0 {
            errors.push("manager.stop_timeout_secs must be greater than 0".to_string());
        }
        if self.version_timeout_ms == 0 {
            errors.push("manager.version_timeout_ms must be greater than 0".to_string());
        }

        let known = |name: &str| REGISTRY.iter().any(|(registered, _)| *registered == name);
        if let Some(ref name) = self.preferred_backend {
            if !known(name) {
                errors.push(format!("manager.preferred_backend: unknown backend '{}'", name));
            }
        }
        for name in self.binaries.keys() {
            if !known(name) {
                errors.push(format!("manager.binaries: unknown backend '{}'", name));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    6040
}

fn default_watchdog_interval() -> u64 {
    5000
}

fn default_settle_delay() -> u64 {
    1000
}

fn default_stop_timeout() -> u64 {
    3
}

fn default_version_timeout() -> u64 {
    2000
}

fn default_autostart() -> bool {
    true
}

/// `<config dir>/mavrouter-manager/settings.json`
pub fn default_settings_path() -> PathBuf {
    dirs_next::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mavrouter-manager")
        .join("settings.json")
}

/// Endpoints every fresh installation starts with
pub fn factory_default_endpoints() -> Vec<EndpointRecord> {
    vec![
        EndpointRecord::new("GCS Server Link", EndpointType::UdpServer, "0.0.0.0", 14550)
            .with_owner("manager")
            .persistent(true)
            .protected(true),
        EndpointRecord::new("Inspector Link", EndpointType::TcpServer, "0.0.0.0", 5777)
            .with_owner("manager")
            .persistent(true)
            .protected(true),
    ]
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(mut manager_errors) = self.manager.validate() {
            errors.append(&mut manager_errors);
        }
        if let Err(e) = self.master() {
            errors.push(format!("master: {}", e));
        }
        for record in &self.default_endpoints {
            if let Err(e) = Endpoint::new(record.clone()) {
                errors.push(format!("default_endpoints '{}': {}", record.name, e));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    pub fn master(&self) -> crate::error::Result<Option<Endpoint>> {
        self.master.clone().map(Endpoint::new).transpose()
    }

    /// Validated default endpoints, falling back to the factory set
    pub fn default_endpoints(&self) -> crate::error::Result<Vec<Endpoint>> {
        let records = if self.default_endpoints.is_empty() {
            factory_default_endpoints()
        } else {
            self.default_endpoints.clone()
        };
        records.into_iter().map(Endpoint::new).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
bind = "127.0.0.1"
port = 8088

[manager]
settings_file = "/var/lib/mavrouter/settings.json"
preferred_backend = "mavlink-server"
watchdog_interval_ms = 2000
settle_delay_ms = 500

[manager.binaries]
"mavlink-server" = "/opt/bin/mavlink-server"

[master]
name = "Autopilot"
owner = "manager"
connection_type = "serial"
place = "/dev/ttyACM0"
argument = 115200

[[default_endpoints]]
name = "GCS"
owner = "manager"
connection_type = "udpin"
place = "0.0.0.0"
argument = 14550
persistent = true
"#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.port, 8088);
        assert_eq!(config.manager.watchdog_interval(), Duration::from_secs(2));
        assert_eq!(config.manager.settle_delay(), Duration::from_millis(500));
        assert_eq!(
            config.manager.settings_path(),
            PathBuf::from("/var/lib/mavrouter/settings.json")
        );
        assert_eq!(
            config.manager.binaries.get("mavlink-server").map(String::as_str),
            Some("/opt/bin/mavlink-server")
        );

        let master = config.master().unwrap().unwrap();
        assert_eq!(master.to_string(), "serial:/dev/ttyACM0:115200");

        let defaults = config.default_endpoints().unwrap();
        assert_eq!(defaults.len(), 1);
        assert!(defaults[0].is_enabled());
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.port, 6040);
        assert_eq!(config.manager.watchdog_interval(), Duration::from_secs(5));
        assert_eq!(config.manager.settle_delay(), Duration::from_secs(1));
        assert_eq!(config.manager.stop_timeout(), Duration::from_secs(3));
        assert!(config.manager.autostart);
        assert!(config.master().unwrap().is_none());
    }

    #[test]
    fn test_factory_defaults() {
        let config = Config::default();
        let defaults = config.default_endpoints().unwrap();
        let links: Vec<_> = defaults.iter().map(|e| e.identity()).collect();
        assert_eq!(links, ["udpin:0.0.0.0:14550", "tcpin:0.0.0.0:5777"]);
        assert!(defaults.iter().all(|e| e.is_protected() && e.is_persistent()));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let toml = r#"
[manager]
watchdog_interval_ms = 0
preferred_backend = "ardupilot-router"

[master]
name = "Autopilot"
owner = "manager"
connection_type = "serial"
place = "ttyACM0"
argument = 115200
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let message = config.validate().unwrap_err().to_string();

        assert!(message.contains("watchdog_interval_ms"));
        assert!(message.contains("ardupilot-router"));
        assert!(message.contains("master"));
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let toml = r#"
[manager]
watchdog = 10
"#;
        assert!(toml::from_str::<Config>(toml).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("mavrouter-manager.toml");
        std::fs::write(&path, "[server]\nport = 0\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.port, 0);
    }
}
