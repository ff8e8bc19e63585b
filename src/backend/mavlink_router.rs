//! `mavlink-routerd` adapter
//!
//! Outputs are given as options (`--endpoint`, `--tcp-endpoint`,
//! `--tcp-port`) and the master is the trailing positional argument, except
//! for a TCP server master which is another `--tcp-port`.

use super::{host_port, RouterBackend};
use crate::endpoint::{Endpoint, EndpointType};
use crate::error::{ManagerError, Result};
use std::path::Path;
use std::sync::Arc;

pub const NAME: &str = "mavlink-router";
const DEFAULT_BINARY: &str = "mavlink-routerd";

#[derive(Debug, Clone)]
pub struct MavlinkRouter {
    binary: String,
}

impl MavlinkRouter {
    pub fn new() -> Self {
        Self::with_binary(DEFAULT_BINARY)
    }

    pub fn with_binary(binary: &str) -> Self {
        Self {
            binary: binary.to_string(),
        }
    }
}

impl Default for MavlinkRouter {
    fn default() -> Self {
        Self::new()
    }
}

pub fn factory(binary: Option<&str>) -> Arc<dyn RouterBackend> {
    Arc::new(binary.map_or_else(MavlinkRouter::new, MavlinkRouter::with_binary))
}

impl RouterBackend for MavlinkRouter {
    fn name(&self) -> &'static str {
        NAME
    }

    fn binary(&self) -> &str {
        &self.binary
    }

    fn version_args(&self) -> &'static [&'static str] {
        &["--version"]
    }

    fn version_pattern(&self) -> &'static str {
        r"version\s+(\S+)"
    }

    fn accepted_kinds(&self) -> &'static [EndpointType] {
        &[
            EndpointType::UdpClient,
            EndpointType::TcpServer,
            EndpointType::TcpClient,
        ]
    }

    fn accepted_master_kinds(&self) -> &'static [EndpointType] {
        &[
            EndpointType::UdpServer,
            EndpointType::Serial,
            EndpointType::TcpServer,
        ]
    }

    /// `mavlink-routerd` listens on a single `--tcp-port`
    fn validate_links(&self, master: Option<&Endpoint>, endpoints: &[Endpoint]) -> Result<()> {
        let mut tcp_servers = master
            .into_iter()
            .chain(endpoints)
            .filter(|e| e.kind() == EndpointType::TcpServer);

        if let (Some(first), Some(second)) = (tcp_servers.next(), tcp_servers.next()) {
            return Err(ManagerError::KindNotSupported(format!(
                "{} serves a single TCP port, '{}' ({}) and '{}' ({}) both need one",
                NAME,
                first.name(),
                first,
                second.name(),
                second
            )));
        }
        Ok(())
    }

    fn assemble_args(
        &self,
        master: &Endpoint,
        endpoints: &[Endpoint],
        log_dir: &Path,
    ) -> Vec<String> {
        let mut args = vec!["--log".to_string(), log_dir.display().to_string()];

        for endpoint in endpoints {
            match endpoint.kind() {
                EndpointType::UdpClient => {
                    args.push("--endpoint".to_string());
                    args.push(host_port(endpoint));
                }
                EndpointType::TcpClient => {
                    args.push("--tcp-endpoint".to_string());
                    args.push(host_port(endpoint));
                }
                EndpointType::TcpServer => {
                    args.push("--tcp-port".to_string());
                    args.push(endpoint.argument().to_string());
                }
                // Rejected by validate()
                EndpointType::UdpServer | EndpointType::Serial => {}
            }
        }

        match master.kind() {
            EndpointType::TcpServer => {
                args.push("--tcp-port".to_string());
                args.push(master.argument().to_string());
            }
            EndpointType::Serial => {
                args.push(format!("{}:{}", master.place(), master.argument()));
            }
            _ => args.push(host_port(master)),
        }

        args
    }
}
