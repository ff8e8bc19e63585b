//! `mavlink-server` adapter
//!
//! Every link, master included, is a positional `prefix:place:argument`
//! URL. The master comes first.

use super::RouterBackend;
use crate::endpoint::{Endpoint, EndpointType};
use std::path::Path;
use std::sync::Arc;

pub const NAME: &str = "mavlink-server";
const DEFAULT_BINARY: &str = "mavlink-server";

#[derive(Debug, Clone)]
pub struct MavlinkServer {
    binary: String,
}

impl MavlinkServer {
    pub fn new() -> Self {
        Self::with_binary(DEFAULT_BINARY)
    }

    pub fn with_binary(binary: &str) -> Self {
        Self {
            binary: binary.to_string(),
        }
    }
}

impl Default for MavlinkServer {
    fn default() -> Self {
        Self::new()
    }
}

pub fn factory(binary: Option<&str>) -> Arc<dyn RouterBackend> {
    Arc::new(binary.map_or_else(MavlinkServer::new, MavlinkServer::with_binary))
}

fn prefix(kind: EndpointType) -> &'static str {
    match kind {
        EndpointType::Serial => "serial",
        EndpointType::TcpServer => "tcps",
        EndpointType::TcpClient => "tcpc",
        EndpointType::UdpServer => "udps",
        EndpointType::UdpClient => "udpc",
    }
}

fn url(endpoint: &Endpoint) -> String {
    format!(
        "{}:{}:{}",
        prefix(endpoint.kind()),
        endpoint.place(),
        endpoint.argument()
    )
}

impl RouterBackend for MavlinkServer {
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
        r"mavlink-server\s+v?(\d\S*)"
    }

    fn accepted_kinds(&self) -> &'static [EndpointType] {
        &EndpointType::ALL
    }

    fn accepted_master_kinds(&self) -> &'static [EndpointType] {
        &EndpointType::ALL
    }

    // mavlink-server keeps no log directory of its own
    fn assemble_args(
        &self,
        master: &Endpoint,
        endpoints: &[Endpoint],
        _log_dir: &Path,
    ) -> Vec<String> {
        std::iter::once(master).chain(endpoints).map(url).collect()
    }
}
