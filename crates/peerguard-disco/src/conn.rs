//! Packet-conn facade
//!
//! The public surface of the core: send datagrams by peer id, receive
//! `(peer_id, bytes)` pairs, switch transport modes, shut down. Direct
//! paths come from the peer table; everything else goes through the relay
//! transport when the mode permits.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::error::{DiscoError, DiscoResult};
use crate::peer::{Datagram, PeerId};
use crate::relay::RelayTransport;
use crate::udp::UdpConn;

/// Default capacity of the inbound datagram queue.
pub const RECV_QUEUE_CAPACITY: usize = 50;

/// Transport selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportMode {
    /// Prefer a direct path, fall back to the server relay.
    #[default]
    Auto,
    /// Never send direct; ask for peer-assisted relaying.
    ForcePeerRelay,
    /// Never send direct; always use the server relay.
    ForceServerRelay,
}

/// Counters exposed for diagnostics and tests.
#[derive(Debug, Clone, Default)]
pub struct ConnStats {
    pub direct_sent: u64,
    pub relay_frames_sent: u64,
    pub recv_dropped: u64,
}

/// Bounded inbound queue shared by the UDP demultiplexer and the relay
/// receiver. Overflow drops the oldest unread datagram.
pub struct RecvQueue {
    inner: Mutex<VecDeque<Datagram>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl RecvQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue a datagram, evicting the oldest entry when full.
    pub fn push(&self, datagram: Datagram) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }
        {
            let mut queue = self.inner.lock().unwrap();
            if queue.len() >= self.capacity {
                queue.pop_front();
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                trace!("receive queue full, dropped oldest ({} total)", dropped);
            }
            queue.push_back(datagram);
        }
        self.notify.notify_one();
    }

    /// Wait for the next datagram. Fails with [`DiscoError::Closed`] once
    /// the queue has been shut down.
    pub async fn pop(&self) -> DiscoResult<Datagram> {
        loop {
            let notified = self.notify.notified();
            if self.closed.load(Ordering::Relaxed) {
                // cascade the wakeup to any other blocked reader
                self.notify.notify_one();
                return Err(DiscoError::Closed);
            }
            {
                let mut queue = self.inner.lock().unwrap();
                if let Some(d) = queue.pop_front() {
                    // wake the next reader if more is pending
                    if !queue.is_empty() {
                        self.notify.notify_one();
                    }
                    return Ok(d);
                }
            }
            notified.await;
        }
    }

    /// Shut the queue down; pending and future readers observe `Closed`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
        self.notify.notify_waiters();
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Datagram connection addressed by peer id.
pub struct PacketConn {
    udp: Arc<UdpConn>,
    recv: Arc<RecvQueue>,
    relay: RwLock<Option<Arc<dyn RelayTransport>>>,
    mode: RwLock<TransportMode>,
    direct_sent: AtomicU64,
    relay_frames_sent: AtomicU64,
    closed: AtomicBool,
}

impl PacketConn {
    pub fn new(udp: Arc<UdpConn>, recv: Arc<RecvQueue>) -> Self {
        Self {
            udp,
            recv,
            relay: RwLock::new(None),
            mode: RwLock::new(TransportMode::default()),
            direct_sent: AtomicU64::new(0),
            relay_frames_sent: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Install the relay fallback transport.
    pub fn set_relay(&self, relay: Arc<dyn RelayTransport>) {
        *self.relay.write().unwrap() = Some(relay);
    }

    /// Switch the transport selection policy.
    pub fn set_transport_mode(&self, mode: TransportMode) {
        *self.mode.write().unwrap() = mode;
    }

    pub fn transport_mode(&self) -> TransportMode {
        *self.mode.read().unwrap()
    }

    /// Send `data` to `peer_id`, choosing the path per the current mode.
    pub async fn write_to(&self, peer_id: &PeerId, data: &[u8]) -> DiscoResult<usize> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(DiscoError::Closed);
        }
        match self.transport_mode() {
            TransportMode::Auto => match self.udp.write_to_peer(peer_id, data) {
                Ok(n) => {
                    self.direct_sent.fetch_add(1, Ordering::Relaxed);
                    Ok(n)
                }
                Err(DiscoError::PeerUnreachable(_)) => {
                    debug!("no direct path to {}, falling back to relay", peer_id);
                    self.write_relay(peer_id, data, false).await
                }
                Err(e) => Err(e),
            },
            TransportMode::ForcePeerRelay => self.write_relay(peer_id, data, true).await,
            TransportMode::ForceServerRelay => self.write_relay(peer_id, data, false).await,
        }
    }

    async fn write_relay(
        &self,
        peer_id: &PeerId,
        data: &[u8],
        peer_assisted: bool,
    ) -> DiscoResult<usize> {
        let relay = self.relay.read().unwrap().clone();
        match relay {
            Some(relay) => {
                relay.send_datagram(peer_id, data, peer_assisted).await?;
                self.relay_frames_sent.fetch_add(1, Ordering::Relaxed);
                Ok(data.len())
            }
            None => Err(DiscoError::PeerUnreachable(peer_id.clone())),
        }
    }

    /// Receive the next datagram. `None` peer id means the sender's address
    /// matched no fresh path.
    pub async fn read_from(&self) -> DiscoResult<(Option<PeerId>, Bytes)> {
        let datagram = self.recv.pop().await?;
        Ok((datagram.from, datagram.data))
    }

    /// Current counters.
    pub fn stats(&self) -> ConnStats {
        ConnStats {
            direct_sent: self.direct_sent.load(Ordering::Relaxed),
            relay_frames_sent: self.relay_frames_sent.load(Ordering::Relaxed),
            recv_dropped: self.recv.dropped(),
        }
    }

    /// Handle to the shared receive queue (for relay inbound delivery).
    pub fn recv_queue(&self) -> Arc<RecvQueue> {
        self.recv.clone()
    }

    /// Broadcast the close signal and tear the socket loops down.
    /// Idempotent.
    pub async fn close(&self) -> DiscoResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.udp.close();
        self.recv.close();
        Ok(())
    }
}
