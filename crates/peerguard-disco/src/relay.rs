//! Relay transport seam
//!
//! When no direct UDP path exists, the packet conn hands datagrams to a
//! [`RelayTransport`]. The signalling crate implements this over its
//! rendezvous connection; tests plug in recording mocks.

use async_trait::async_trait;

use crate::error::DiscoResult;
use crate::peer::PeerId;

/// Alternate transport carrying `(peer_id, bytes)` framed messages.
///
/// Delivery is best effort. Ordering holds per `(src, dst)` pair as long as
/// the implementation runs over a single server connection.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Forward a datagram to `dst`. With `peer_assisted` set the relay is
    /// asked to route through another peer instead of the server itself.
    async fn send_datagram(&self, dst: &PeerId, data: &[u8], peer_assisted: bool)
        -> DiscoResult<()>;
}
