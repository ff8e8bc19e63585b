//! Link endpoint model
//!
//! An [`Endpoint`] is an immutable, validated description of one link the
//! router should open. The only way to obtain one is through
//! [`Endpoint::new`] (or [`EndpointRecord::build`]), so every value held by
//! the store has already passed validation.

use crate::error::{ManagerError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::OnceLock;

/// Accepted serial baud rates
pub const BAUD_RATES: [u32; 14] = [
    9600, 19200, 38400, 57600, 115200, 230400, 460800, 500000, 576000, 921600, 1000000, 1500000,
    2000000, 3000000,
];

const NAME_MIN_LEN: usize = 3;
const NAME_MAX_LEN: usize = 50;
const HOSTNAME_MAX_LEN: usize = 253;

/// Kind of link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EndpointType {
    /// Listen for UDP peers
    #[serde(rename = "udpin")]
    UdpServer,
    /// Send UDP to a fixed peer
    #[serde(rename = "udpout")]
    UdpClient,
    /// Accept TCP connections
    #[serde(rename = "tcpin")]
    TcpServer,
    /// Connect to a TCP server
    #[serde(rename = "tcpout")]
    TcpClient,
    /// Serial device
    #[serde(rename = "serial")]
    Serial,
}

impl EndpointType {
    pub const ALL: [EndpointType; 5] = [
        EndpointType::UdpServer,
        EndpointType::UdpClient,
        EndpointType::TcpServer,
        EndpointType::TcpClient,
        EndpointType::Serial,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointType::UdpServer => "udpin",
            EndpointType::UdpClient => "udpout",
            EndpointType::TcpServer => "tcpin",
            EndpointType::TcpClient => "tcpout",
            EndpointType::Serial => "serial",
        }
    }

    /// True for the network kinds (place is an address, argument a port)
    pub fn is_ip(&self) -> bool {
        !matches!(self, EndpointType::Serial)
    }
}

impl fmt::Display for EndpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EndpointType {
    type Err = ManagerError;

    fn from_str(s: &str) -> Result<Self> {
        EndpointType::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ManagerError::validation(format!("unknown connection type '{}'", s)))
    }
}

fn default_enabled() -> bool {
    true
}

/// Serialized form of an endpoint, as found in the settings file and the API.
///
/// Records are unvalidated; turn one into an [`Endpoint`] with
/// [`EndpointRecord::build`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointRecord {
    pub name: String,
    pub owner: String,
    pub connection_type: EndpointType,
    pub place: String,
    pub argument: u32,
    #[serde(default)]
    pub persistent: bool,
    #[serde(default)]
    pub protected: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub overwrite_settings: bool,
}

impl EndpointRecord {
    /// Create a user-owned, enabled, non-persistent record
    pub fn new(
        name: &str,
        connection_type: EndpointType,
        place: &str,
        argument: u32,
    ) -> Self {
        Self {
            name: name.to_string(),
            owner: "user".to_string(),
            connection_type,
            place: place.to_string(),
            argument,
            persistent: false,
            protected: false,
            enabled: true,
            overwrite_settings: false,
        }
    }

    pub fn with_owner(mut self, owner: &str) -> Self {
        self.owner = owner.to_string();
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn protected(mut self, protected: bool) -> Self {
        self.protected = protected;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn overwrite_settings(mut self, overwrite: bool) -> Self {
        self.overwrite_settings = overwrite;
        self
    }

    /// Validate the record and produce an [`Endpoint`]
    pub fn build(self) -> Result<Endpoint> {
        Endpoint::new(self)
    }
}

/// A validated link endpoint.
///
/// Equality and hashing use the identity triple (kind, place, argument),
/// rendered canonically as `kind:place:argument`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "EndpointRecord", into = "EndpointRecord")]
pub struct Endpoint {
    record: EndpointRecord,
}

impl Endpoint {
    /// Validate `record` and wrap it.
    ///
    /// Name, owner and place are trimmed before checks.
    pub fn new(mut record: EndpointRecord) -> Result<Self> {
        record.name = record.name.trim().to_string();
        record.owner = record.owner.trim().to_string();
        record.place = record.place.trim().to_string();

        check_label("name", &record.name)?;
        check_label("owner", &record.owner)?;

        if record.connection_type.is_ip() {
            check_address(&record.place)?;
            check_port(record.argument)?;
        } else {
            check_serial_path(&record.place)?;
            check_baud(record.argument)?;
        }

        Ok(Self { record })
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn owner(&self) -> &str {
        &self.record.owner
    }

    pub fn kind(&self) -> EndpointType {
        self.record.connection_type
    }

    pub fn place(&self) -> &str {
        &self.record.place
    }

    pub fn argument(&self) -> u32 {
        self.record.argument
    }

    pub fn is_persistent(&self) -> bool {
        self.record.persistent
    }

    pub fn is_protected(&self) -> bool {
        self.record.protected
    }

    pub fn is_enabled(&self) -> bool {
        self.record.enabled
    }

    pub fn overwrites_settings(&self) -> bool {
        self.record.overwrite_settings
    }

    /// Canonical `kind:place:argument` identity
    pub fn identity(&self) -> String {
        self.to_string()
    }

    /// True when both endpoints describe the same link
    pub fn same_link(&self, other: &Endpoint) -> bool {
        self.kind() == other.kind()
            && self.place() == other.place()
            && self.argument() == other.argument()
    }

    pub fn record(&self) -> &EndpointRecord {
        &self.record
    }

    pub fn to_record(&self) -> EndpointRecord {
        self.record.clone()
    }

    /// Copy of this endpoint with a different `enabled` flag
    pub fn with_enabled(&self, enabled: bool) -> Self {
        let mut record = self.record.clone();
        record.enabled = enabled;
        Self { record }
    }
}

impl TryFrom<EndpointRecord> for Endpoint {
    type Error = ManagerError;

    fn try_from(record: EndpointRecord) -> Result<Self> {
        Endpoint::new(record)
    }
}

impl From<Endpoint> for EndpointRecord {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.record
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.kind(), self.place(), self.argument())
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.same_link(other)
    }
}

impl Eq for Endpoint {}

impl Hash for Endpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind().hash(state);
        self.place().hash(state);
        self.argument().hash(state);
    }
}

fn check_label(field: &str, value: &str) -> Result<()> {
    let len = value.chars().count();
    if !(NAME_MIN_LEN..=NAME_MAX_LEN).contains(&len) {
        return Err(ManagerError::validation(format!(
            "{} must be between {} and {} characters, got {}",
            field, NAME_MIN_LEN, NAME_MAX_LEN, len
        )));
    }
    Ok(())
}

fn hostname_label_regex() -> &'static Regex {
    static LABEL: OnceLock<Regex> = OnceLock::new();
    LABEL.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?$")
            .expect("static hostname label pattern")
    })
}

fn is_hostname(value: &str) -> bool {
    let host = value.strip_suffix('.').unwrap_or(value);
    if host.is_empty() || host.len() > HOSTNAME_MAX_LEN {
        return false;
    }

    let labels: Vec<&str> = host.split('.').collect();
    if !labels.iter().all(|label| hostname_label_regex().is_match(label)) {
        return false;
    }

    // Dotted all-numeric names are malformed IPv4 addresses, not hostnames
    !(labels.len() > 1
        && labels
            .iter()
            .all(|label| label.chars().all(|c| c.is_ascii_digit())))
}

fn check_address(place: &str) -> Result<()> {
    if place.parse::<IpAddr>().is_ok() || is_hostname(place) {
        return Ok(());
    }
    Err(ManagerError::validation(format!(
        "'{}' is not a valid IP address or hostname",
        place
    )))
}

fn check_port(argument: u32) -> Result<()> {
    if !(1..=u32::from(u16::MAX)).contains(&argument) {
        return Err(ManagerError::validation(format!(
            "port out of range: {} (expected 1-65535)",
            argument
        )));
    }
    Ok(())
}

fn check_serial_path(place: &str) -> Result<()> {
    if !place.starts_with('/') {
        return Err(ManagerError::validation(format!(
            "serial device '{}' must be an absolute path",
            place
        )));
    }
    if place.ends_with('/') {
        return Err(ManagerError::validation(format!(
            "serial device '{}' must not end with '/'",
            place
        )));
    }
    Ok(())
}

fn check_baud(argument: u32) -> Result<()> {
    if !BAUD_RATES.contains(&argument) {
        return Err(ManagerError::validation(format!(
            "unsupported baud rate {}",
            argument
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn udp_server(name: &str, port: u32) -> EndpointRecord {
        EndpointRecord::new(name, EndpointType::UdpServer, "0.0.0.0", port)
    }

    #[test]
    fn test_valid_endpoints() {
        assert!(udp_server("GCS", 14550).build().is_ok());
        assert!(EndpointRecord::new("Link", EndpointType::TcpClient, "example.com", 5760)
            .build()
            .is_ok());
        assert!(EndpointRecord::new("Link", EndpointType::UdpClient, "::1", 14550)
            .build()
            .is_ok());
        assert!(EndpointRecord::new("Pixhawk", EndpointType::Serial, "/dev/ttyACM0", 115200)
            .build()
            .is_ok());
    }

    #[test]
    fn test_port_out_of_range() {
        let err = EndpointRecord::new("Bad", EndpointType::TcpServer, "127.0.0.1", 70000)
            .build()
            .unwrap_err();
        assert!(matches!(err, ManagerError::Validation(_)));
        assert!(err.to_string().contains("port out of range"));

        assert!(udp_server("Zero", 0).build().is_err());
        assert!(udp_server("Max", 65535).build().is_ok());
    }

    #[test]
    fn test_name_length() {
        assert!(udp_server("ab", 14550).build().is_err());
        assert!(udp_server(&"x".repeat(51), 14550).build().is_err());
        assert!(udp_server(&"x".repeat(50), 14550).build().is_ok());
        // Surrounding whitespace does not count
        let endpoint = udp_server("  GCS  ", 14550).build().unwrap();
        assert_eq!(endpoint.name(), "GCS");
        assert!(udp_server("  a  ", 14550).build().is_err());
    }

    #[test]
    fn test_owner_length() {
        let err = udp_server("GCS", 14550).with_owner("me").build().unwrap_err();
        assert!(err.to_string().contains("owner"));
    }

    #[test]
    fn test_bad_addresses() {
        for place in ["256.1.1.1", "not a host", "-leading.com", "", "a..b"] {
            let result = EndpointRecord::new("Link", EndpointType::UdpClient, place, 14550).build();
            assert!(result.is_err(), "{} should be rejected", place);
        }
        assert!(EndpointRecord::new("Link", EndpointType::UdpClient, "localhost", 14550)
            .build()
            .is_ok());
    }

    #[test]
    fn test_serial_validation() {
        let serial = |place: &str, baud: u32| {
            EndpointRecord::new("Serial", EndpointType::Serial, place, baud).build()
        };
        assert!(serial("dev/ttyUSB0", 115200).is_err());
        assert!(serial("/dev/", 115200).is_err());
        assert!(serial("/dev/ttyUSB0", 115201).is_err());
        assert!(serial("/dev/serial/by-id/usb-ArduPilot", 921600).is_ok());
        assert!(serial("/dev/ttyUSB0", 3000000).is_ok());
    }

    #[test]
    fn test_canonical_string_and_identity() {
        let a = udp_server("First", 14550).build().unwrap();
        let b = udp_server("Second", 14550).enabled(false).build().unwrap();
        let c = udp_server("Third", 14551).build().unwrap();

        assert_eq!(a.to_string(), "udpin:0.0.0.0:14550");
        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut set = std::collections::HashSet::new();
        set.insert(a);
        assert!(!set.insert(b));
        assert!(set.insert(c));
    }

    #[test]
    fn test_connection_type_parsing() {
        assert_eq!("tcpout".parse::<EndpointType>().unwrap(), EndpointType::TcpClient);
        assert!("udp".parse::<EndpointType>().is_err());
        for kind in EndpointType::ALL {
            assert_eq!(kind.as_str().parse::<EndpointType>().unwrap(), kind);
        }
    }

    #[test]
    fn test_deserialize_validates() {
        let json = r#"{"name":"GCS","owner":"user","connection_type":"udpin",
            "place":"0.0.0.0","argument":14550}"#;
        let endpoint: Endpoint = serde_json::from_str(json).unwrap();
        assert!(endpoint.is_enabled());
        assert!(!endpoint.is_persistent());

        let bad = json.replace("14550", "0");
        assert!(serde_json::from_str::<Endpoint>(&bad).is_err());

        let unknown = json.replace("\"owner\"", "\"color\":\"red\",\"owner\"");
        assert!(serde_json::from_str::<Endpoint>(&unknown).is_err());
    }

    #[test]
    fn test_with_enabled_keeps_identity() {
        let endpoint = udp_server("GCS", 14550).build().unwrap();
        let disabled = endpoint.with_enabled(false);
        assert!(!disabled.is_enabled());
        assert_eq!(endpoint, disabled);
        assert_eq!(disabled.name(), "GCS");
    }
}
