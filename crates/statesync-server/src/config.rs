//! Server configuration.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Configuration for the device services.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Device name, reported by the system status endpoint.
    pub name: String,
    /// Address the WebSocket event server binds to.
    pub ws_addr: SocketAddr,
    /// Address the REST server binds to.
    pub http_addr: SocketAddr,
    /// Directory holding one JSON file per persisted service.
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "statesync-device".to_string(),
            ws_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 3001)),
            http_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 3000)),
            data_dir: PathBuf::from("data"),
        }
    }
}
