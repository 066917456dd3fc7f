//! Peer identity and inbound datagram types

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{DiscoError, DiscoResult};

/// Maximum length of a peer id in bytes.
pub const MAX_PEER_ID_LEN: usize = 255;

/// Opaque peer identifier, unique within a network.
///
/// Ids are short UTF-8 strings of 1–255 bytes (base58 public keys in
/// practice) and are compared for equality only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    /// Validate and wrap a peer id.
    pub fn new(id: impl Into<String>) -> DiscoResult<Self> {
        let id = id.into();
        if id.is_empty() || id.len() > MAX_PEER_ID_LEN {
            return Err(DiscoError::InvalidPeerId(id.len()));
        }
        Ok(Self(id))
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The id as raw bytes, as carried on the wire.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for PeerId {
    type Err = DiscoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// A datagram delivered to the packet-conn facade.
///
/// `from` is `None` when the sender's address matched no fresh path.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub from: Option<PeerId>,
    pub data: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_oversized() {
        assert!(matches!(PeerId::new(""), Err(DiscoError::InvalidPeerId(0))));
        let long = "x".repeat(256);
        assert!(matches!(
            PeerId::new(long),
            Err(DiscoError::InvalidPeerId(256))
        ));
        assert!(PeerId::new("x".repeat(255)).is_ok());
    }

    #[test]
    fn display_matches_inner() {
        let id = PeerId::new("abc").unwrap();
        assert_eq!(id.to_string(), "abc");
        assert_eq!(id.as_bytes(), b"abc");
    }
}
