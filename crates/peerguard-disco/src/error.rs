//! Discovery core error types

use thiserror::Error;

use crate::peer::PeerId;

/// Errors surfaced by the discovery core
#[derive(Debug, Error)]
pub enum DiscoError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No fresh path and no relay permitted
    #[error("peer unreachable: {0}")]
    PeerUnreachable(PeerId),

    /// Operation on a shut-down connection
    #[error("connection closed")]
    Closed,

    /// Peer id is empty or longer than 255 bytes
    #[error("invalid peer id length: {0}")]
    InvalidPeerId(usize),

    /// Malformed STUN message
    #[error("malformed STUN response: {0}")]
    MalformedStun(String),

    /// Bad discovery configuration
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result type for discovery operations
pub type DiscoResult<T> = Result<T, DiscoError>;
