//! Peer discovery and NAT traversal over a single UDP socket.
//!
//! This crate is the transport core of the peerguard overlay. It takes
//! logical peer ids and, fed with candidate addresses from a rendezvous
//! (signalling) service, cross-pings candidates until a direct UDP path is
//! confirmed, keeps a liveness model of every path, and exposes a
//! packet-conn style interface (`PacketConn`) addressed by peer id. When no
//! direct path exists the facade falls back to a pluggable relay transport.
//!
//! Components:
//! - [`udp::UdpConn`]: the bound socket plus the inbound demultiplexer
//! - [`table::PeerTable`]: candidate paths per peer with expiry
//! - [`stun`]: RFC 5389 Binding requests for public address discovery
//! - [`discovery::Discovery`]: ping campaigns, STUN escalation, port scans
//! - [`conn::PacketConn`]: the public send/receive surface
//! - [`relay::RelayTransport`]: the fallback seam

use std::time::Duration;

pub mod cidr;
pub mod config;
pub mod conn;
pub mod discovery;
pub mod error;
pub mod peer;
pub mod ping;
pub mod relay;
pub mod stun;
pub mod table;
pub mod udp;

pub use cidr::IpNetwork;
pub use config::DiscoConfig;
pub use conn::{ConnStats, PacketConn, RecvQueue, TransportMode};
pub use discovery::{Discovery, DiscoveryEvent};
pub use error::{DiscoError, DiscoResult};
pub use peer::{Datagram, PeerId};
pub use relay::RelayTransport;
pub use udp::{CandidateEvent, ListenConfig, UdpConn};

/// Steady-state ping interval for a confirmed path.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// A path is fresh while it was confirmed within twice the keepalive.
pub(crate) fn freshness_window(keepalive: Duration) -> Duration {
    2 * keepalive
}
