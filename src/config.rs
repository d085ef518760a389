//! Node configuration
//!
//! Protocol timing and collaborator addresses. Values mirror the deployed
//! network's constants; the wire-format constants themselves live in
//! [`crate::protocol`] because they must match bit-for-bit across nodes.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{NodeError, Result};

/// Configuration for a relay node.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Number of hops in the node's own circuit.
    pub circuit_length: usize,

    /// Milliseconds to wait for a Create/Extend/Begin reply.
    pub reply_timeout_ms: u64,

    /// Milliseconds between retries while building the circuit.
    pub build_retry_ms: u64,

    /// Milliseconds a proxy-edge TCP connection may stay idle.
    pub proxy_idle_ms: u64,

    /// Address the node listens on for peer connections and proxy clients.
    pub listen_ip: IpAddr,

    /// Local port for the HTTP/CONNECT proxy entry point.
    pub proxy_port: u16,

    /// Registration/directory server host (name or IP).
    pub directory_host: String,

    /// Registration/directory server port.
    pub directory_port: u16,

    /// PEM file with this node's certificate chain.
    pub cert_path: PathBuf,

    /// PEM file with this node's private key.
    pub key_path: PathBuf,

    /// PEM file with the network CA certificate.
    pub ca_path: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            circuit_length: 3,
            reply_timeout_ms: 3_000,
            build_retry_ms: 100,
            proxy_idle_ms: 5_000,
            listen_ip: IpAddr::from([127, 0, 0, 1]),
            proxy_port: 8118,
            directory_host: "127.0.0.1".to_string(),
            directory_port: 1025,
            cert_path: PathBuf::from("node.crt"),
            key_path: PathBuf::from("node.key"),
            ca_path: PathBuf::from("ca.crt"),
        }
    }
}

impl NodeConfig {
    /// Load configuration from a JSON file. Missing fields fall back to
    /// defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| NodeError::Config(format!("read {}: {}", path.display(), e)))?;
        serde_json::from_str(&raw)
            .map_err(|e| NodeError::Config(format!("parse {}: {}", path.display(), e)))
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn build_retry(&self) -> Duration {
        Duration::from_millis(self.build_retry_ms)
    }

    pub fn proxy_idle(&self) -> Duration {
        Duration::from_millis(self.proxy_idle_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.circuit_length, 3);
        assert_eq!(config.reply_timeout(), Duration::from_millis(3_000));
        assert_eq!(config.build_retry(), Duration::from_millis(100));
        assert_eq!(config.directory_port, 1025);
    }

    #[test]
    fn test_partial_json_falls_back_to_defaults() {
        let parsed: NodeConfig = serde_json::from_str(r#"{"circuit_length": 5}"#).unwrap();
        assert_eq!(parsed.circuit_length, 5);
        assert_eq!(parsed.proxy_port, 8118);
    }
}
