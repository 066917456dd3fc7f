//! Ping wire format
//!
//! A discovery ping is the 5-byte prefix `"_ping"` followed by the sender's
//! peer id (1–255 bytes), 6–260 bytes total. Anything starting with the
//! prefix but exceeding 260 bytes is ignored entirely.

use crate::peer::{PeerId, MAX_PEER_ID_LEN};

/// The ping frame prefix.
pub const PING_PREFIX: &[u8; 5] = b"_ping";

/// Largest valid ping frame.
pub const MAX_PING_LEN: usize = PING_PREFIX.len() + MAX_PEER_ID_LEN;

/// Encode a ping frame announcing `id`.
pub fn encode(id: &PeerId) -> Vec<u8> {
    let mut buf = Vec::with_capacity(PING_PREFIX.len() + id.as_bytes().len());
    buf.extend_from_slice(PING_PREFIX);
    buf.extend_from_slice(id.as_bytes());
    buf
}

/// True if the buffer begins with the ping prefix, regardless of validity.
pub fn has_prefix(buf: &[u8]) -> bool {
    buf.len() >= PING_PREFIX.len() && &buf[..PING_PREFIX.len()] == PING_PREFIX
}

/// Decode the sender's peer id from a ping frame.
///
/// Returns `None` for frames without the prefix, frames longer than
/// [`MAX_PING_LEN`], empty ids, and ids that are not UTF-8.
pub fn decode(buf: &[u8]) -> Option<PeerId> {
    if !has_prefix(buf) || buf.len() > MAX_PING_LEN {
        return None;
    }
    let id = std::str::from_utf8(&buf[PING_PREFIX.len()..]).ok()?;
    PeerId::new(id).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        for len in [1usize, 7, 64, 255] {
            let id = PeerId::new("p".repeat(len)).unwrap();
            let frame = encode(&id);
            assert_eq!(frame.len(), 5 + len);
            assert_eq!(decode(&frame), Some(id));
        }
    }

    #[test]
    fn rejects_prefix_only() {
        assert_eq!(decode(b"_ping"), None);
    }

    #[test]
    fn rejects_oversized() {
        let mut frame = encode(&PeerId::new("x".repeat(255)).unwrap());
        frame.push(b'y');
        assert!(has_prefix(&frame));
        assert_eq!(decode(&frame), None);
    }

    #[test]
    fn rejects_other_traffic() {
        assert_eq!(decode(b"datagram payload"), None);
        assert!(!has_prefix(b"_pin"));
    }
}
