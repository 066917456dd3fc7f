//! Peer path table
//!
//! Maps each peer id to its candidate UDP paths with liveness timestamps.
//! All mutations flow through a single applier task consuming [`PeerOp`]
//! events, so there is exactly one writer; readers go through the table's
//! read lock. The health sweeper periodically enqueues [`PeerOp::Sweep`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace};

use crate::error::{DiscoError, DiscoResult};
use crate::freshness_window;
use crate::peer::PeerId;

/// New peers learned from unsolicited pings are capped at this rate so a
/// flood of bogus ids cannot grow the table without bound.
const UNKNOWN_PEERS_PER_MINUTE: u32 = 1000;

/// Mutation events applied by the single writer task.
#[derive(Debug, Clone)]
pub enum PeerOp {
    /// Ensure the (peer, addr) path exists; idempotent.
    Observe { peer_id: PeerId, addr: SocketAddr },
    /// Mark the (peer, addr) path active now, if it exists.
    Confirm { peer_id: PeerId, addr: SocketAddr },
    /// Expire stale paths and drop emptied peers.
    Sweep,
}

/// A single candidate path to a peer.
#[derive(Debug, Clone)]
struct UdpPath {
    created_at: Instant,
    /// `None` until the first inbound ping confirms the path.
    last_active_at: Option<Instant>,
}

/// Everything known about one peer.
#[derive(Debug)]
struct PeerContext {
    created_at: Instant,
    paths: HashMap<SocketAddr, UdpPath>,
}

struct UnknownPeerBudget {
    window_start: Instant,
    count: u32,
}

/// Thread-safe peer id → paths mapping with single-writer discipline.
pub struct PeerTable {
    peers: RwLock<HashMap<PeerId, PeerContext>>,
    ops_tx: mpsc::UnboundedSender<PeerOp>,
    keepalive: Duration,
    unknown_budget: Mutex<UnknownPeerBudget>,
}

impl PeerTable {
    /// Create the table plus the op stream consumed by the applier task.
    pub fn new(keepalive: Duration) -> (std::sync::Arc<Self>, mpsc::UnboundedReceiver<PeerOp>) {
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let table = std::sync::Arc::new(Self {
            peers: RwLock::new(HashMap::new()),
            ops_tx,
            keepalive,
            unknown_budget: Mutex::new(UnknownPeerBudget {
                window_start: Instant::now(),
                count: 0,
            }),
        });
        (table, ops_rx)
    }

    pub fn keepalive(&self) -> Duration {
        self.keepalive
    }

    /// The single writer: applies ops until the channel or close signal ends.
    pub async fn run_apply_loop(
        self: std::sync::Arc<Self>,
        mut ops_rx: mpsc::UnboundedReceiver<PeerOp>,
        mut close_rx: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = close_rx.recv() => break,
                op = ops_rx.recv() => match op {
                    Some(op) => self.apply(op),
                    None => break,
                },
            }
        }
        debug!("peer op loop exit");
    }

    /// Enqueue an observe event.
    pub fn observe(&self, peer_id: PeerId, addr: SocketAddr) {
        let _ = self.ops_tx.send(PeerOp::Observe { peer_id, addr });
    }

    /// Enqueue a confirm event.
    pub fn confirm(&self, peer_id: PeerId, addr: SocketAddr) {
        let _ = self.ops_tx.send(PeerOp::Confirm { peer_id, addr });
    }

    /// Enqueue a sweep.
    pub fn sweep(&self) {
        let _ = self.ops_tx.send(PeerOp::Sweep);
    }

    /// Handle an inbound ping: confirm a known path, or learn the peer from
    /// the wire (subject to the unknown-peer rate cap).
    pub fn on_ping(&self, peer_id: PeerId, addr: SocketAddr) {
        let known = self.peers.read().unwrap().contains_key(&peer_id);
        if !known {
            let mut budget = self.unknown_budget.lock().unwrap();
            if budget.window_start.elapsed() >= Duration::from_secs(60) {
                budget.window_start = Instant::now();
                budget.count = 0;
            }
            if budget.count >= UNKNOWN_PEERS_PER_MINUTE {
                debug!("unknown peer {} dropped, rate cap reached", peer_id);
                return;
            }
            budget.count += 1;
        }
        trace!("Heartbeat: {} at {}", peer_id, addr);
        self.observe(peer_id.clone(), addr);
        self.confirm(peer_id, addr);
    }

    fn apply(&self, op: PeerOp) {
        let mut peers = self.peers.write().unwrap();
        let now = Instant::now();
        match op {
            PeerOp::Observe { peer_id, addr } => {
                let ctx = peers.entry(peer_id).or_insert_with(|| PeerContext {
                    created_at: now,
                    paths: HashMap::new(),
                });
                ctx.paths.entry(addr).or_insert(UdpPath {
                    created_at: now,
                    last_active_at: None,
                });
            }
            PeerOp::Confirm { peer_id, addr } => {
                if let Some(ctx) = peers.get_mut(&peer_id) {
                    if let Some(path) = ctx.paths.get_mut(&addr) {
                        let was_stale = !is_fresh(path, now, self.keepalive);
                        path.last_active_at = Some(now);
                        if was_stale {
                            info!("AddPeer: {} at {}", peer_id, addr);
                        }
                    }
                }
            }
            PeerOp::Sweep => {
                peers.retain(|peer_id, ctx| {
                    if now.duration_since(ctx.created_at) > 3 * self.keepalive {
                        ctx.paths.retain(|addr, path| {
                            if is_fresh(path, now, self.keepalive) {
                                return true;
                            }
                            match path.last_active_at {
                                None => debug!("RemovePeer: {} at {}", peer_id, addr),
                                Some(_) => info!("RemovePeer: {} at {}", peer_id, addr),
                            }
                            false
                        });
                    }
                    !ctx.paths.is_empty()
                });
            }
        }
    }

    /// Find the peer with a fresh path matching `addr`.
    pub fn lookup_peer_by_addr(&self, addr: SocketAddr) -> Option<PeerId> {
        let peers = self.peers.read().unwrap();
        let now = Instant::now();
        for (peer_id, ctx) in peers.iter() {
            if let Some(path) = ctx.paths.get(&addr) {
                if is_fresh(path, now, self.keepalive) {
                    return Some(peer_id.clone());
                }
            }
        }
        None
    }

    /// Pick the address to send to: IPv4 before IPv6, then the most
    /// recently confirmed. Only fresh paths qualify.
    pub fn select(&self, peer_id: &PeerId) -> DiscoResult<SocketAddr> {
        let peers = self.peers.read().unwrap();
        let now = Instant::now();
        peers
            .get(peer_id)
            .and_then(|ctx| {
                ctx.paths
                    .iter()
                    .filter(|(_, path)| is_fresh(path, now, self.keepalive))
                    .max_by_key(|(addr, path)| (addr.is_ipv4(), path.last_active_at))
                    .map(|(addr, _)| *addr)
            })
            .ok_or_else(|| DiscoError::PeerUnreachable(peer_id.clone()))
    }

    /// True if the peer has at least one fresh path.
    pub fn is_ready(&self, peer_id: &PeerId) -> bool {
        self.select(peer_id).is_ok()
    }

    /// True if the peer has at least one fresh IPv4 path.
    pub fn is_ipv4_ready(&self, peer_id: &PeerId) -> bool {
        matches!(self.select(peer_id), Ok(addr) if addr.is_ipv4())
    }

    /// Every observed address for the peer, fresh or not. Used as the base
    /// set for symmetric-NAT port prediction.
    pub fn peer_addrs(&self, peer_id: &PeerId) -> Vec<SocketAddr> {
        self.peers
            .read()
            .unwrap()
            .get(peer_id)
            .map(|ctx| ctx.paths.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().unwrap().len()
    }
}

fn is_fresh(path: &UdpPath, now: Instant, keepalive: Duration) -> bool {
    match path.last_active_at {
        Some(t) => now.duration_since(t) <= freshness_window(keepalive),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEEPALIVE: Duration = Duration::from_millis(20);

    fn table() -> std::sync::Arc<PeerTable> {
        PeerTable::new(KEEPALIVE).0
    }

    fn peer(s: &str) -> PeerId {
        PeerId::new(s).unwrap()
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn observe_alone_is_not_reachable() {
        let t = table();
        let (p, a) = (peer("p1"), addr("10.0.0.1:1000"));

        t.apply(PeerOp::Observe {
            peer_id: p.clone(),
            addr: a,
        });
        assert_eq!(t.lookup_peer_by_addr(a), None);
        assert!(matches!(t.select(&p), Err(DiscoError::PeerUnreachable(_))));

        t.apply(PeerOp::Confirm {
            peer_id: p.clone(),
            addr: a,
        });
        assert_eq!(t.lookup_peer_by_addr(a), Some(p.clone()));
        assert_eq!(t.select(&p).unwrap(), a);
    }

    #[test]
    fn confirm_without_observe_is_noop() {
        let t = table();
        let (p, a) = (peer("p1"), addr("10.0.0.1:1000"));
        t.apply(PeerOp::Confirm {
            peer_id: p.clone(),
            addr: a,
        });
        assert_eq!(t.peer_count(), 0);
        assert!(t.select(&p).is_err());
    }

    #[test]
    fn select_never_returns_stale_paths() {
        let t = table();
        let (p, a) = (peer("p1"), addr("10.0.0.1:1000"));
        t.apply(PeerOp::Observe {
            peer_id: p.clone(),
            addr: a,
        });
        t.apply(PeerOp::Confirm {
            peer_id: p.clone(),
            addr: a,
        });
        assert!(t.select(&p).is_ok());

        std::thread::sleep(3 * KEEPALIVE);
        assert!(t.select(&p).is_err());
        assert_eq!(t.lookup_peer_by_addr(a), None);
    }

    #[test]
    fn select_prefers_ipv4_then_recency() {
        let t = table();
        let p = peer("p1");
        let v6 = addr("[fd00::1]:1000");
        let v4_old = addr("10.0.0.1:1000");
        let v4_new = addr("10.0.0.2:1000");

        for a in [v6, v4_old, v4_new] {
            t.apply(PeerOp::Observe {
                peer_id: p.clone(),
                addr: a,
            });
        }
        t.apply(PeerOp::Confirm {
            peer_id: p.clone(),
            addr: v4_old,
        });
        std::thread::sleep(Duration::from_millis(2));
        t.apply(PeerOp::Confirm {
            peer_id: p.clone(),
            addr: v4_new,
        });
        std::thread::sleep(Duration::from_millis(2));
        // the v6 path is the most recent of all, but v4 wins
        t.apply(PeerOp::Confirm {
            peer_id: p.clone(),
            addr: v6,
        });

        assert_eq!(t.select(&p).unwrap(), v4_new);
        assert!(t.is_ipv4_ready(&p));
    }

    #[test]
    fn sweep_spares_young_peers_and_fresh_paths() {
        let t = table();
        let (p, a) = (peer("p1"), addr("10.0.0.1:1000"));
        t.apply(PeerOp::Observe {
            peer_id: p.clone(),
            addr: a,
        });
        t.apply(PeerOp::Confirm {
            peer_id: p.clone(),
            addr: a,
        });

        // peer younger than 3·keepalive: untouched
        t.apply(PeerOp::Sweep);
        assert_eq!(t.peer_count(), 1);

        // aged past 3·keepalive with a stale path: dropped entirely
        std::thread::sleep(4 * KEEPALIVE);
        t.apply(PeerOp::Sweep);
        assert_eq!(t.peer_count(), 0);
    }

    #[test]
    fn sweep_keeps_recently_confirmed_paths_of_old_peers() {
        let t = table();
        let (p, a) = (peer("p1"), addr("10.0.0.1:1000"));
        t.apply(PeerOp::Observe {
            peer_id: p.clone(),
            addr: a,
        });
        std::thread::sleep(4 * KEEPALIVE);
        // confirm just before the sweep: path is fresh even though the peer
        // itself is old
        t.apply(PeerOp::Confirm {
            peer_id: p.clone(),
            addr: a,
        });
        t.apply(PeerOp::Sweep);
        assert_eq!(t.peer_count(), 1);
        assert!(t.is_ready(&p));
    }

    #[test]
    fn learns_unknown_peers_from_pings_up_to_cap() {
        let (t, mut ops) = PeerTable::new(KEEPALIVE);
        let a = addr("10.0.0.1:1000");
        for i in 0..UNKNOWN_PEERS_PER_MINUTE {
            t.on_ping(peer(&format!("p{i}")), a);
        }
        // past the cap: nothing is enqueued for this peer
        t.on_ping(peer("overflow"), a);

        let mut n = 0;
        while ops.try_recv().is_ok() {
            n += 1;
        }
        // two ops (observe + confirm) per admitted peer, none for overflow
        assert_eq!(n, 2 * UNKNOWN_PEERS_PER_MINUTE as usize);
    }
}
