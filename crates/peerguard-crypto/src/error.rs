//! Crypto error types

use thiserror::Error;

/// Errors from key handling
#[derive(Debug, Error)]
pub enum CryptoError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Key material is not valid base58
    #[error("invalid base58 key: {0}")]
    InvalidBase58(String),

    /// Key has the wrong length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },
}

/// Result type for key operations
pub type CryptoResult<T> = Result<T, CryptoError>;
