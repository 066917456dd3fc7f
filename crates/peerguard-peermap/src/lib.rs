//! Rendezvous (peermap) signalling client.
//!
//! The peermap server introduces peers to each other and carries relay
//! traffic when no direct UDP path exists. This crate maintains the
//! persistent session to that server, exchanges peer hello messages and
//! candidate addresses, persists the network bearer secret, and runs the
//! OIDC join flow that issues a fresh secret.

pub mod client;
pub mod error;
pub mod oidc;
pub mod peer_url;
pub mod secret;

pub use client::{Frame, PeerMetadata, PeermapClient, PeermapConfig, PeermapEvent};
pub use error::{PeermapError, PeermapResult};
pub use oidc::{join_oidc, JoinSession, JOIN_FLOW_TIMEOUT};
pub use peer_url::PeerUrl;
pub use secret::{FileSecretStore, NetworkSecret};
