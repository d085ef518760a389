//! Error types for the relay node
//!
//! One taxonomy for the whole crate:
//! - framing errors (dropped silently by the dispatcher, never fatal)
//! - typed handshake failures (reported through the pending-operation channel)
//! - timeouts (reported identically to a handshake failure)
//! - transport/directory failures (cascade to teardown or restart)
//! - internal errors (programming invariant violations)

use thiserror::Error;

pub type Result<T> = std::result::Result<T, NodeError>;

/// Main error type for the relay node.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    // ===== Framing =====
    #[error("malformed cell: {0}")]
    Framing(String),

    // ===== Handshake failures =====
    #[error("create handshake refused by peer")]
    CreateFailed,

    #[error("extend handshake refused by relay")]
    ExtendFailed,

    #[error("stream begin refused by exit")]
    BeginFailed,

    #[error("no reply within the timeout interval")]
    Timeout,

    #[error("request superseded by a newer request on the same key")]
    Superseded,

    // ===== Transport =====
    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("certificate error: {0}")]
    Certificate(String),

    // ===== Circuit / stream lifecycle =====
    #[error("circuit torn down")]
    CircuitClosed,

    // ===== Directory =====
    #[error("directory error: {0}")]
    Directory(String),

    #[error("no relay candidates available")]
    NoCandidates,

    // ===== Configuration =====
    #[error("configuration error: {0}")]
    Config(String),

    // ===== Internal =====
    #[error("internal error: {0}")]
    Internal(String),
}

impl NodeError {
    /// Whether the caller may retry the same operation with a different
    /// candidate or after a delay.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NodeError::CreateFailed
                | NodeError::ExtendFailed
                | NodeError::BeginFailed
                | NodeError::Timeout
                | NodeError::Transport(_)
                | NodeError::ConnectionClosed
                | NodeError::Directory(_)
        )
    }

    /// Whether this error should terminate the process rather than trigger
    /// a restart of the routing state.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            NodeError::Certificate(_) | NodeError::Config(_) | NodeError::Internal(_)
        )
    }
}

impl From<std::io::Error> for NodeError {
    fn from(err: std::io::Error) -> Self {
        NodeError::Transport(err.to_string())
    }
}
