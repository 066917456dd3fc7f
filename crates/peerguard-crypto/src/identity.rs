//! X25519 identity keypair
//!
//! A node identity is a static curve25519 secret. The base58 form of the
//! public key identifies the node on the overlay network.

use std::path::Path;

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::ZeroizeOnDrop;

use crate::error::{CryptoError, CryptoResult};

/// Size of a curve25519 key in bytes
pub const KEY_SIZE: usize = 32;

/// A static X25519 secret key (long-term node identity)
#[derive(ZeroizeOnDrop)]
pub struct SecretKey {
    inner: StaticSecret,
}

/// A X25519 public key
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey {
    bytes: [u8; KEY_SIZE],
}

impl SecretKey {
    /// Generate a new random secret key
    pub fn generate() -> Self {
        Self {
            inner: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self {
            inner: StaticSecret::from(bytes),
        }
    }

    /// Parse from the base58 form used by the `--key` flag
    pub fn from_base58(s: &str) -> CryptoResult<Self> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| CryptoError::InvalidBase58(e.to_string()))?;
        if bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; KEY_SIZE];
        arr.copy_from_slice(&bytes);
        Ok(Self::from_bytes(arr))
    }

    /// Base58 form, suitable for the `--key` flag and key files
    pub fn to_base58(&self) -> String {
        bs58::encode(self.inner.to_bytes()).into_string()
    }

    /// Get the corresponding public key
    pub fn public_key(&self) -> PublicKey {
        let public = X25519Public::from(&self.inner);
        PublicKey {
            bytes: public.to_bytes(),
        }
    }

    /// Export raw bytes
    pub fn to_bytes(&self) -> [u8; KEY_SIZE] {
        self.inner.to_bytes()
    }
}

impl Clone for SecretKey {
    fn clone(&self) -> Self {
        Self::from_bytes(self.to_bytes())
    }
}

impl PublicKey {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Parse from base58
    pub fn from_base58(s: &str) -> CryptoResult<Self> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| CryptoError::InvalidBase58(e.to_string()))?;
        if bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; KEY_SIZE];
        arr.copy_from_slice(&bytes);
        Ok(Self { bytes: arr })
    }

    /// Base58 form; doubles as the node's default peer id
    pub fn to_base58(&self) -> String {
        bs58::encode(self.bytes).into_string()
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_base58())
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", self.to_base58())
    }
}

/// Load a base58 secret key from a file, or generate a new one and persist
/// it for future runs.
pub fn load_or_generate(path: &Path) -> CryptoResult<SecretKey> {
    if path.exists() {
        let contents = std::fs::read_to_string(path)?;
        return SecretKey::from_base58(contents.trim());
    }
    let key = SecretKey::generate();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, key.to_base58())?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base58_roundtrip() {
        let key = SecretKey::generate();
        let encoded = key.to_base58();
        let decoded = SecretKey::from_base58(&encoded).unwrap();
        assert_eq!(key.to_bytes(), decoded.to_bytes());
        assert_eq!(key.public_key(), decoded.public_key());
    }

    #[test]
    fn rejects_wrong_length() {
        let short = bs58::encode([1u8; 16]).into_string();
        assert!(matches!(
            SecretKey::from_base58(&short),
            Err(CryptoError::InvalidKeyLength { expected: 32, actual: 16 })
        ));
    }

    #[test]
    fn rejects_bad_base58() {
        assert!(matches!(
            PublicKey::from_base58("not base58 0OIl"),
            Err(CryptoError::InvalidBase58(_))
        ));
    }

    #[test]
    fn load_or_generate_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subdir/node.key");

        assert!(!path.exists());
        let k1 = load_or_generate(&path).unwrap();
        assert!(path.exists());
        let k2 = load_or_generate(&path).unwrap();
        assert_eq!(k1.to_bytes(), k2.to_bytes());
    }
}
