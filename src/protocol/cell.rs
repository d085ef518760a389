//! Cell wire codec
//!
//! Cells are the basic unit of communication between adjacent relay nodes.
//! Every cell is exactly [`CELL_LEN`] bytes: `magic(4) | circuit_id(4) |
//! cell_type(1)` followed by type-specific fields, zero-padded. All integers
//! are big-endian.
//!
//! Decoding rejects cells of the wrong total length or with a mismatched
//! magic number. This is a framing integrity check, not authentication; the
//! dispatcher drops such cells silently.

use crate::error::{NodeError, Result};

use super::{CircuitId, StreamId, CELL_LEN, MAGIC, RELAY_BODY_LEN, RELAY_HEADER_LEN};

/// Cell command types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CellType {
    /// CREATE - establish a circuit on this connection
    Create = 1,
    /// CREATED - circuit established
    Created = 2,
    /// CREATE_FAILED - circuit refused
    CreateFailed = 3,
    /// DESTROY - tear down a circuit
    Destroy = 4,
    /// RELAY - carries an inner relay sub-command
    Relay = 5,
}

impl CellType {
    /// Parse command from byte.
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            1 => Some(CellType::Create),
            2 => Some(CellType::Created),
            3 => Some(CellType::CreateFailed),
            4 => Some(CellType::Destroy),
            5 => Some(CellType::Relay),
            _ => None,
        }
    }
}

/// Relay sub-commands, meaningful only to circuit endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RelayCommand {
    /// EXTEND - append a hop to the circuit
    Extend = 1,
    /// EXTENDED - hop appended
    Extended = 2,
    /// EXTEND_FAILED - hop refused
    ExtendFailed = 3,
    /// BEGIN - open a stream to a destination
    Begin = 4,
    /// CONNECTED - stream open at the exit
    Connected = 5,
    /// BEGIN_FAILED - stream refused
    BeginFailed = 6,
    /// DATA - stream payload
    Data = 7,
    /// END - close a stream
    End = 8,
}

impl RelayCommand {
    /// Parse relay command from byte.
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            1 => Some(RelayCommand::Extend),
            2 => Some(RelayCommand::Extended),
            3 => Some(RelayCommand::ExtendFailed),
            4 => Some(RelayCommand::Begin),
            5 => Some(RelayCommand::Connected),
            6 => Some(RelayCommand::BeginFailed),
            7 => Some(RelayCommand::Data),
            8 => Some(RelayCommand::End),
            _ => None,
        }
    }
}

/// Inner payload of a RELAY cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCell {
    /// Relay command
    pub command: RelayCommand,

    /// Stream id, scoped to the enclosing (connection, circuit)
    pub stream_id: StreamId,

    /// Reserved tag, stamped by the sender and never verified
    pub digest: u32,

    /// Body, at most [`RELAY_BODY_LEN`] bytes before padding
    pub body: Vec<u8>,
}

impl RelayCell {
    /// Create a new relay cell. Fails if the body exceeds the relay body
    /// capacity.
    pub fn new(
        command: RelayCommand,
        stream_id: StreamId,
        digest: u32,
        body: Vec<u8>,
    ) -> Result<Self> {
        if body.len() > RELAY_BODY_LEN {
            return Err(NodeError::Internal(format!(
                "relay body {} exceeds capacity {}",
                body.len(),
                RELAY_BODY_LEN
            )));
        }
        Ok(Self {
            command,
            stream_id,
            digest,
            body,
        })
    }
}

/// Type-specific portion of a cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellPayload {
    Create,
    Created,
    CreateFailed,
    Destroy,
    Relay(RelayCell),
}

impl CellPayload {
    fn cell_type(&self) -> CellType {
        match self {
            CellPayload::Create => CellType::Create,
            CellPayload::Created => CellType::Created,
            CellPayload::CreateFailed => CellType::CreateFailed,
            CellPayload::Destroy => CellType::Destroy,
            CellPayload::Relay(_) => CellType::Relay,
        }
    }
}

/// A fixed-size protocol cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    /// Circuit id, scoped to the connection the cell travels on
    pub circuit_id: CircuitId,

    /// Type-specific payload
    pub payload: CellPayload,
}

impl Cell {
    pub fn new(circuit_id: CircuitId, payload: CellPayload) -> Self {
        Self {
            circuit_id,
            payload,
        }
    }

    pub fn relay(circuit_id: CircuitId, relay: RelayCell) -> Self {
        Self::new(circuit_id, CellPayload::Relay(relay))
    }

    pub fn cell_type(&self) -> CellType {
        self.payload.cell_type()
    }

    /// Serialize to exactly [`CELL_LEN`] bytes, zero-padding unused body
    /// bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(CELL_LEN);
        buf.extend_from_slice(&MAGIC.to_be_bytes());
        buf.extend_from_slice(&self.circuit_id.to_be_bytes());
        buf.push(self.cell_type() as u8);

        if let CellPayload::Relay(relay) = &self.payload {
            buf.extend_from_slice(&relay.stream_id.to_be_bytes());
            buf.extend_from_slice(&relay.digest.to_be_bytes());
            buf.extend_from_slice(&(relay.body.len() as u16).to_be_bytes());
            buf.push(relay.command as u8);
            buf.extend_from_slice(&relay.body);
        }

        buf.resize(CELL_LEN, 0);
        buf
    }

    /// Parse a cell from bytes. Any framing anomaly yields
    /// [`NodeError::Framing`]; the caller is expected to drop the cell.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != CELL_LEN {
            return Err(NodeError::Framing(format!(
                "cell length {} != {}",
                data.len(),
                CELL_LEN
            )));
        }

        let magic = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        if magic != MAGIC {
            return Err(NodeError::Framing(format!("bad magic {:#010x}", magic)));
        }

        let circuit_id = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);

        let cell_type = CellType::from_u8(data[8])
            .ok_or_else(|| NodeError::Framing(format!("unknown cell type {}", data[8])))?;

        let payload = match cell_type {
            CellType::Create => CellPayload::Create,
            CellType::Created => CellPayload::Created,
            CellType::CreateFailed => CellPayload::CreateFailed,
            CellType::Destroy => CellPayload::Destroy,
            CellType::Relay => {
                let stream_id = u16::from_be_bytes([data[9], data[10]]);
                let digest = u32::from_be_bytes([data[11], data[12], data[13], data[14]]);
                let body_len = u16::from_be_bytes([data[15], data[16]]) as usize;
                let command = RelayCommand::from_u8(data[17]).ok_or_else(|| {
                    NodeError::Framing(format!("unknown relay command {}", data[17]))
                })?;
                if body_len > RELAY_BODY_LEN {
                    return Err(NodeError::Framing(format!(
                        "relay body length {} exceeds capacity {}",
                        body_len, RELAY_BODY_LEN
                    )));
                }
                let body = data[RELAY_HEADER_LEN..RELAY_HEADER_LEN + body_len].to_vec();
                CellPayload::Relay(RelayCell {
                    command,
                    stream_id,
                    digest,
                    body,
                })
            }
        };

        Ok(Self {
            circuit_id,
            payload,
        })
    }
}

/// Build the body of an EXTEND cell: `"{ip}:{port}"`, one NUL byte, then the
/// target's 4-byte agent id.
pub fn encode_extend_body(ip: &str, port: u16, agent: u32) -> Vec<u8> {
    let mut body = format!("{}:{}", ip, port).into_bytes();
    body.push(0);
    body.extend_from_slice(&agent.to_be_bytes());
    body
}

/// Parse an EXTEND body back into (ip, port, agent id).
pub fn decode_extend_body(body: &[u8]) -> Result<(String, u16, u32)> {
    if body.len() < 5 {
        return Err(NodeError::Framing("extend body too short".into()));
    }
    let agent = u32::from_be_bytes([
        body[body.len() - 4],
        body[body.len() - 3],
        body[body.len() - 2],
        body[body.len() - 1],
    ]);
    let host = std::str::from_utf8(&body[..body.len() - 5])
        .map_err(|_| NodeError::Framing("extend target is not UTF-8".into()))?;
    let (ip, port) = split_host_port(host)?;
    Ok((ip, port, agent))
}

/// Build the body of a BEGIN cell: `"{host}:{port}"` plus one NUL byte.
pub fn encode_begin_body(host: &str, port: u16) -> Vec<u8> {
    let mut body = format!("{}:{}", host, port).into_bytes();
    body.push(0);
    body
}

/// Parse a BEGIN body back into (host, port).
pub fn decode_begin_body(body: &[u8]) -> Result<(String, u16)> {
    let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
    let host = std::str::from_utf8(&body[..end])
        .map_err(|_| NodeError::Framing("begin target is not UTF-8".into()))?;
    split_host_port(host)
}

fn split_host_port(host: &str) -> Result<(String, u16)> {
    let (name, port) = host
        .rsplit_once(':')
        .ok_or_else(|| NodeError::Framing(format!("missing port in target {:?}", host)))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| NodeError::Framing(format!("bad port in target {:?}", host)))?;
    Ok((name.to_string(), port))
}
