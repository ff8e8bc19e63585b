//! MAVProxy adapter
//!
//! `--master=` names the upstream link and each output is an `--out=`.
//! Serial links are written `device,baud`.

use super::{host_port, RouterBackend};
use crate::endpoint::{Endpoint, EndpointType};
use std::path::Path;
use std::sync::Arc;

pub const NAME: &str = "mavproxy";
const DEFAULT_BINARY: &str = "mavproxy.py";

#[derive(Debug, Clone)]
pub struct MavProxy {
    binary: String,
}

impl MavProxy {
    pub fn new() -> Self {
        Self::with_binary(DEFAULT_BINARY)
    }

    pub fn with_binary(binary: &str) -> Self {
        Self {
            binary: binary.to_string(),
        }
    }
}

impl Default for MavProxy {
    fn default() -> Self {
        Self::new()
    }
}

pub fn factory(binary: Option<&str>) -> Arc<dyn RouterBackend> {
    Arc::new(binary.map_or_else(MavProxy::new, MavProxy::with_binary))
}

fn link(endpoint: &Endpoint) -> String {
    let scheme = match endpoint.kind() {
        EndpointType::Serial => {
            return format!("{},{}", endpoint.place(), endpoint.argument());
        }
        EndpointType::UdpServer => "udpin",
        EndpointType::UdpClient => "udpout",
        EndpointType::TcpServer => "tcpin",
        EndpointType::TcpClient => "tcp",
    };
    format!("{}:{}", scheme, host_port(endpoint))
}

impl RouterBackend for MavProxy {
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
        r"MAVProxy Version:\s*(\S+)"
    }

    fn accepted_kinds(&self) -> &'static [EndpointType] {
        &EndpointType::ALL
    }

    fn accepted_master_kinds(&self) -> &'static [EndpointType] {
        &EndpointType::ALL
    }

    fn assemble_args(
        &self,
        master: &Endpoint,
        endpoints: &[Endpoint],
        log_dir: &Path,
    ) -> Vec<String> {
        let mut args = vec![format!("--master={}", link(master))];
        args.extend(endpoints.iter().map(|e| format!("--out={}", link(e))));
        args.push(format!("--state-basedir={}", log_dir.display()));
        args.push("--non-interactive".to_string());
        args
    }
}
