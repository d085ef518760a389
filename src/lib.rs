//! Multi-hop traffic-relaying overlay node.
//!
//! Each running instance is simultaneously a relay for other nodes'
//! circuits and a local HTTP/CONNECT proxy entry point. Traffic is framed
//! into fixed-size binary cells, carried over mutual-TLS connections
//! between nodes, and forwarded hop by hop: intermediate relays pair two
//! (connection, circuit) legs in a route table and pass relay cells
//! through blindly, while the path's endpoints interpret stream commands
//! and bridge real TCP traffic in and out.
//!
//! Module map:
//! - [`protocol`] — cell codec, dispatch, circuits, routes, streams
//! - [`network`] — connection registry, TLS credentials, payload cipher hook
//! - [`directory`] — registration/discovery client
//! - [`proxy`] — HTTP/CONNECT entry point and exit-side bridging
//! - [`node`] — assembly and restart lifecycle

pub mod config;
pub mod directory;
pub mod error;
pub mod network;
pub mod node;
pub mod protocol;
pub mod proxy;

pub use config::NodeConfig;
pub use error::{NodeError, Result};
pub use node::Node;
