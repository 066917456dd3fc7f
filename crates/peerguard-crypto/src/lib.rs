//! Curve25519 identity keys for the peerguard overlay.
//!
//! Every node owns a static curve25519 keypair. The base58-encoded public
//! key doubles as the node's default peer id on the network; the secret key
//! is kept on disk between runs.

pub mod error;
pub mod identity;

pub use error::{CryptoError, CryptoResult};
pub use identity::{load_or_generate, PublicKey, SecretKey};
