//! Cell protocol engine
//!
//! Binary cell framing, the Create/Destroy/Relay sub-protocol, circuit
//! construction, per-hop forwarding and stream multiplexing.

mod cell;
mod circuit;
mod dispatch;
mod pending;
mod route;
mod stream;

pub use cell::{
    decode_begin_body, decode_extend_body, encode_begin_body, encode_extend_body, Cell,
    CellPayload, CellType, RelayCell, RelayCommand,
};
pub use circuit::{CircuitBuilder, Hop};
pub use dispatch::{CellDispatcher, ConnEvent, RestartReason, StreamEndpoint};
pub use pending::{PendingKey, PendingTable};
pub use route::{RelayTable, RouteEndpoint};
pub use stream::{StreamKey, StreamMultiplexer};

/// Stable identifier of a peer connection, assigned by the registry.
pub type ConnId = u32;

/// Circuit identifier, scoped to one connection.
pub type CircuitId = u32;

/// Stream identifier, scoped to one (connection, circuit) pair.
pub type StreamId = u16;

/// Magic number at the head of every cell. Must match bit-for-bit across
/// all nodes in the network.
pub const MAGIC: u32 = 0xCA4B_E001;

/// Fixed total cell length in bytes.
pub const CELL_LEN: usize = 214;

/// Length of the relay header: magic(4) circuit(4) type(1) stream(2)
/// digest(4) body_len(2) relay_cmd(1).
pub const RELAY_HEADER_LEN: usize = 18;

/// Relay body capacity: whatever is left of the cell after the relay header.
pub const RELAY_BODY_LEN: usize = CELL_LEN - RELAY_HEADER_LEN;

/// Circuit ids wrap below this ceiling (both parity counters).
pub const CIRCUIT_ID_CEILING: u32 = 1 << 30;
