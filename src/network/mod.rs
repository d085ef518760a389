//! Transport layer
//!
//! Owns the mutual-TLS connections to peer nodes, the identity-based
//! connection registry, and the per-connection payload cipher seam.

mod layers;
mod registry;
mod tls;

pub use layers::{IdentityCipher, KeyStore, PayloadCipher};
pub use registry::ConnectionRegistry;
pub use tls::{agent_string, peer_agent_id, Credentials};
