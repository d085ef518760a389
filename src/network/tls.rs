//! Mutual-TLS plumbing
//!
//! Every node-to-node and directory connection is secured with mutual TLS
//! against the network CA. The credential bundle (key, certificate, CA
//! certificate) is produced by the external certificate service and loaded
//! here from PEM files. A peer's agent identity is the common name of its
//! certificate, an 8-digit hex string.
//!
//! The CA issues node certificates with an IP subject-alternative-name for
//! the node's listen address, so outbound connections verify against the
//! dialed address and the agent id is read from the CN afterwards.

use std::path::Path;
use std::sync::Arc;

use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use x509_parser::prelude::*;

use crate::error::{NodeError, Result};

/// A process credential bundle: private key, certificate chain and the
/// network CA certificate.
pub struct Credentials {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    ca: Vec<CertificateDer<'static>>,
}

impl Credentials {
    /// Load the bundle from PEM files.
    pub fn load(cert_path: &Path, key_path: &Path, ca_path: &Path) -> Result<Self> {
        let certs = read_certs(cert_path)?;
        if certs.is_empty() {
            return Err(NodeError::Certificate(format!(
                "no certificate in {}",
                cert_path.display()
            )));
        }
        let ca = read_certs(ca_path)?;
        if ca.is_empty() {
            return Err(NodeError::Certificate(format!(
                "no CA certificate in {}",
                ca_path.display()
            )));
        }

        let key_file = std::fs::File::open(key_path)
            .map_err(|e| NodeError::Certificate(format!("open {}: {}", key_path.display(), e)))?;
        let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(key_file))
            .map_err(|e| NodeError::Certificate(format!("read {}: {}", key_path.display(), e)))?
            .ok_or_else(|| {
                NodeError::Certificate(format!("no private key in {}", key_path.display()))
            })?;

        Ok(Self { certs, key, ca })
    }

    /// Agent id of this node, from its own certificate's common name.
    pub fn agent_id(&self) -> Result<u32> {
        peer_agent_id(&self.certs[0]).ok_or_else(|| {
            NodeError::Certificate("own certificate CN is not an agent id".into())
        })
    }

    /// Acceptor for the node's inbound listener. Requires and verifies a
    /// client certificate against the network CA.
    pub fn acceptor(&self) -> Result<TlsAcceptor> {
        let roots = self.root_store()?;
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| NodeError::Certificate(format!("client verifier: {}", e)))?;
        let config = ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(self.certs.clone(), self.key.clone_key())
            .map_err(|e| NodeError::Certificate(format!("server config: {}", e)))?;
        Ok(TlsAcceptor::from(Arc::new(config)))
    }

    /// Connector for outbound connections, presenting this node's
    /// certificate.
    pub fn connector(&self) -> Result<TlsConnector> {
        let roots = self.root_store()?;
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(self.certs.clone(), self.key.clone_key())
            .map_err(|e| NodeError::Certificate(format!("client config: {}", e)))?;
        Ok(TlsConnector::from(Arc::new(config)))
    }

    fn root_store(&self) -> Result<RootCertStore> {
        let mut roots = RootCertStore::empty();
        for cert in &self.ca {
            roots
                .add(cert.clone())
                .map_err(|e| NodeError::Certificate(format!("bad CA certificate: {}", e)))?;
        }
        Ok(roots)
    }
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path)
        .map_err(|e| NodeError::Certificate(format!("open {}: {}", path.display(), e)))?;
    rustls_pemfile::certs(&mut std::io::BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| NodeError::Certificate(format!("read {}: {}", path.display(), e)))
}

/// Extract the agent id from a peer certificate: the common name parsed as
/// an 8-digit hex string.
pub fn peer_agent_id(cert: &CertificateDer<'_>) -> Option<u32> {
    let (_, parsed) = X509Certificate::from_der(cert.as_ref()).ok()?;
    let cn = parsed.subject().iter_common_name().next()?.as_str().ok()?;
    u32::from_str_radix(cn, 16).ok()
}

/// Hex string representation of an agent id, as it appears in certificate
/// common names and logs.
pub fn agent_string(agent: u32) -> String {
    format!("{:08X}", agent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_string() {
        assert_eq!(agent_string(0xCAFE0001), "CAFE0001");
        assert_eq!(agent_string(0x1), "00000001");
    }

    #[test]
    fn test_agent_string_roundtrip() {
        let agent = 0x00AB_12CD;
        assert_eq!(u32::from_str_radix(&agent_string(agent), 16).unwrap(), agent);
    }
}
