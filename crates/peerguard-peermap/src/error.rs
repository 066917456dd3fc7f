//! Signalling client error types

use thiserror::Error;

/// Errors from the peermap session, secret store and join flow
#[derive(Debug, Error)]
pub enum PeermapError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Secret file (de)serialization error
    #[error("secret file error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error from the join flow
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket transport error
    #[error("websocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),

    /// Frame (de)serialization error
    #[error("frame codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// The server rejected the presented secret
    #[error("invalid token")]
    InvalidToken,

    /// The presented secret has expired
    #[error("token expired")]
    TokenExpired,

    /// The OIDC join flow was not granted in time
    #[error("network join timed out")]
    JoinTimeout,

    /// Unusable rendezvous or peer URL
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// Operation on a closed session
    #[error("peermap session closed")]
    Closed,
}

/// Result type for signalling operations
pub type PeermapResult<T> = Result<T, PeermapError>;
