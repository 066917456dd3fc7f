//! Discovery coordinator
//!
//! Drives the path search for each peer: advertise local addresses first,
//! escalate to STUN when the peer is not IPv4-ready after a second, run a
//! ping campaign against every candidate the remote advertises, and as a
//! last resort predict symmetric-NAT port allocations with a paced scan.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::config::DiscoConfig;
use crate::peer::PeerId;
use crate::ping;
use crate::udp::UdpConn;

/// Initial cadence of a ping campaign.
const CHALLENGE_INTERVAL: Duration = Duration::from_millis(500);

/// Fast attempts before a campaign slows to the keepalive cadence.
const CHALLENGE_FAST_ATTEMPTS: u32 = 32;

/// Wait after the local phase before the STUN escalation.
const STUN_ESCALATION_DELAY: Duration = Duration::from_secs(1);

/// Input events for the coordinator.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// A peer appeared (signalling hello or a locally configured dial).
    PeerDiscovered { peer_id: PeerId },
    /// The remote advertised one of its candidate addresses to us.
    CandidateReceived { peer_id: PeerId, addr: SocketAddr },
}

/// Per-peer discovery state machine.
pub struct Discovery {
    udp: Arc<UdpConn>,
    config: DiscoConfig,
    stun_servers: Vec<String>,
    /// Live ping campaigns, keyed by `(peer, addr)` so concurrent triggers
    /// never double-probe a path.
    campaigns: Mutex<HashSet<(PeerId, SocketAddr)>>,
}

impl Discovery {
    pub fn new(udp: Arc<UdpConn>, config: DiscoConfig, stun_servers: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            udp,
            config,
            stun_servers,
            campaigns: Mutex::new(HashSet::new()),
        })
    }

    /// Consume discovery events until the close signal or the channel ends.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<DiscoveryEvent>) {
        let mut close_rx = self.udp.subscribe_close();
        loop {
            let event = tokio::select! {
                _ = close_rx.recv() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            match event {
                DiscoveryEvent::PeerDiscovered { peer_id } => {
                    debug!("discovery start for {}", peer_id);
                    let this = self.clone();
                    tokio::spawn(async move { this.drive_peer(peer_id).await });
                }
                DiscoveryEvent::CandidateReceived { peer_id, addr } => {
                    self.start_campaign(peer_id, addr);
                }
            }
        }
        debug!("discovery coordinator exit");
    }

    /// Local phase, STUN escalation and the challenge/port-scan ladder for
    /// one peer.
    async fn drive_peer(&self, peer_id: PeerId) {
        let mut close_rx = self.udp.subscribe_close();
        let table = self.udp.table().clone();

        self.udp.advertise_local_addrs(&peer_id);

        tokio::select! {
            _ = close_rx.recv() => return,
            _ = tokio::time::sleep(STUN_ESCALATION_DELAY) => {}
        }
        if !table.is_ipv4_ready(&peer_id) {
            self.udp.request_stun(&peer_id, &self.stun_servers).await;
        }

        // challenge rounds with geometric backoff, then port prediction
        let mut interval = self.config.challenges_initial_interval;
        for _ in 0..self.config.challenges_retry {
            tokio::select! {
                _ = close_rx.recv() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            if table.is_ready(&peer_id) {
                return;
            }
            interval = interval.mul_f64(self.config.challenges_backoff_rate);
        }
        if table.is_ready(&peer_id) || self.udp.is_closed() {
            return;
        }
        self.port_scan(&peer_id).await;
    }

    /// Start a ping campaign for `(peer, addr)` unless one is already live
    /// or the address is filtered.
    pub fn start_campaign(self: &Arc<Self>, peer_id: PeerId, addr: SocketAddr) {
        if self.config.is_ignored_addr(addr.ip()) {
            debug!("candidate {} for {} is in an ignored CIDR", addr, peer_id);
            return;
        }
        let key = (peer_id.clone(), addr);
        {
            let mut campaigns = self.campaigns.lock().unwrap();
            if !campaigns.insert(key) {
                trace!("campaign for {} at {} already running", peer_id, addr);
                return;
            }
        }
        let this = self.clone();
        tokio::spawn(async move { this.run_campaign(peer_id, addr).await });
    }

    /// One `(peer, addr)` ping loop: 500 ms cadence until the path is
    /// observed-and-fresh or 32 attempts passed, then the keepalive
    /// cadence; ends for good once the path goes stale at that cadence.
    async fn run_campaign(&self, peer_id: PeerId, addr: SocketAddr) {
        let table = self.udp.table();
        table.observe(peer_id.clone(), addr);

        let frame = ping::encode(self.udp.self_id());
        let keepalive = self.udp.keepalive();
        let mut close_rx = self.udp.subscribe_close();
        let mut interval = CHALLENGE_INTERVAL;
        let mut attempts = 0u32;

        loop {
            if self.udp.is_closed() {
                break;
            }
            let discovered = table.lookup_peer_by_addr(addr).is_some();
            if interval == keepalive && !discovered {
                break;
            }
            if discovered || attempts >= CHALLENGE_FAST_ATTEMPTS {
                interval = keepalive;
            }
            trace!("Ping: {} at {}", peer_id, addr);
            if let Err(e) = self.udp.send_to(&frame, addr) {
                debug!("ping to {} failed: {}", addr, e);
            }
            tokio::select! {
                _ = close_rx.recv() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            attempts += 1;
        }

        self.campaigns
            .lock()
            .unwrap()
            .remove(&(peer_id.clone(), addr));
        debug!("Ping exit: {} at {}", peer_id, addr);
    }

    /// Probe predicted symmetric-NAT ports around every known candidate of
    /// the peer, paced to finish within `port_scan_duration`.
    async fn port_scan(&self, peer_id: &PeerId) {
        let bases = self.udp.table().peer_addrs(peer_id);
        if bases.is_empty() || self.config.port_scan_count == 0 {
            return;
        }
        info!(
            "PortScan: {} over {} candidates, {} ports each",
            peer_id,
            bases.len(),
            self.config.port_scan_count
        );

        let frame = ping::encode(self.udp.self_id());
        let pace = self.config.port_scan_duration / self.config.port_scan_count;
        let mut close_rx = self.udp.subscribe_close();

        for i in 0..self.config.port_scan_count {
            if self.udp.table().is_ready(peer_id) {
                debug!("PortScan: {} became ready, stopping", peer_id);
                return;
            }
            for base in &bases {
                if self.config.is_ignored_addr(base.ip()) {
                    continue;
                }
                let addr = predicted_addr(*base, self.config.port_scan_offset, i);
                if let Err(e) = self.udp.send_to(&frame, addr) {
                    warn!("PortScan probe to {} failed: {}", addr, e);
                }
            }
            tokio::select! {
                _ = close_rx.recv() => return,
                _ = tokio::time::sleep(pace) => {}
            }
        }
    }
}

/// The `i`-th predicted address for a candidate, clamped to valid ports.
fn predicted_addr(base: SocketAddr, offset: i32, i: u32) -> SocketAddr {
    let port = (base.port() as i64 + offset as i64 + i as i64).clamp(1, 65_535) as u16;
    SocketAddr::new(base.ip(), port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::{PacketConn, RecvQueue, RECV_QUEUE_CAPACITY};
    use crate::error::DiscoError;
    use std::net::Ipv4Addr;

    fn loopback(port: u16) -> SocketAddr {
        SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port)
    }

    #[test]
    fn predicted_ports_walk_the_offset_window() {
        let base = loopback(40_000);
        assert_eq!(predicted_addr(base, -5, 0).port(), 39_995);
        assert_eq!(predicted_addr(base, -5, 5).port(), 40_000);
        assert_eq!(predicted_addr(base, -5, 9).port(), 40_004);
        assert_eq!(predicted_addr(base, -5, 0).ip(), base.ip());
    }

    #[test]
    fn predicted_ports_clamp_to_valid_range() {
        assert_eq!(predicted_addr(loopback(100), -1000, 0).port(), 1);
        assert_eq!(predicted_addr(loopback(65_000), 1000, 0).port(), 65_535);
    }

    struct Stack {
        udp: Arc<UdpConn>,
        conn: Arc<PacketConn>,
        events_tx: mpsc::Sender<DiscoveryEvent>,
    }

    async fn stack(id: &str, config: DiscoConfig) -> Stack {
        let recv = Arc::new(RecvQueue::new(RECV_QUEUE_CAPACITY));
        let udp = UdpConn::test_bind_as(recv.clone(), id, Duration::from_secs(1)).await;
        let discovery = Discovery::new(udp.clone(), config, Vec::new());
        let (events_tx, events_rx) = mpsc::channel(16);
        tokio::spawn(discovery.run(events_rx));
        let conn = Arc::new(PacketConn::new(udp.clone(), recv));
        Stack {
            udp,
            conn,
            events_tx,
        }
    }

    async fn wait_ready(udp: &UdpConn, peer: &PeerId, deadline: Duration) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < deadline {
            if udp.table().is_ready(peer) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    /// Two peers on the loopback "LAN": candidates in, pings out, payload
    /// delivered with the sender's id attached.
    #[tokio::test]
    async fn local_net_discovery_delivers_payload() {
        let a = stack("peer-a", DiscoConfig::default()).await;
        let b = stack("peer-b", DiscoConfig::default()).await;
        let a_id = a.udp.self_id().clone();
        let b_id = b.udp.self_id().clone();

        a.events_tx
            .send(DiscoveryEvent::CandidateReceived {
                peer_id: b_id.clone(),
                addr: loopback(b.udp.local_port()),
            })
            .await
            .unwrap();
        b.events_tx
            .send(DiscoveryEvent::CandidateReceived {
                peer_id: a_id.clone(),
                addr: loopback(a.udp.local_port()),
            })
            .await
            .unwrap();

        assert!(wait_ready(&a.udp, &b_id, Duration::from_secs(3)).await);
        assert!(wait_ready(&b.udp, &a_id, Duration::from_secs(3)).await);

        let n = a.conn.write_to(&b_id, b"hello").await.unwrap();
        assert_eq!(n, 5);

        let (from, data) =
            tokio::time::timeout(Duration::from_secs(2), b.conn.read_from())
                .await
                .unwrap()
                .unwrap();
        assert_eq!(from, Some(a_id));
        assert_eq!(data.as_ref(), b"hello");

        a.conn.close().await.unwrap();
        b.conn.close().await.unwrap();
    }

    /// A candidate with the wrong port is rescued by the port scan: the
    /// probe lands on the real socket, which answers with its own ping.
    #[tokio::test]
    async fn port_scan_finds_shifted_port() {
        let config = DiscoConfig {
            port_scan_offset: -5,
            port_scan_count: 20,
            port_scan_duration: Duration::from_millis(400),
            challenges_retry: 2,
            challenges_initial_interval: Duration::from_millis(50),
            challenges_backoff_rate: 1.5,
            ..Default::default()
        };
        let a = stack("peer-a", config).await;
        let a_id = a.udp.self_id().clone();
        let b_id = PeerId::new("peer-b").unwrap();

        // "peer-b" is a plain socket; its advertised candidate is off by 3
        let b_socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b_port = b_socket.local_addr().unwrap().port();
        let shifted = loopback(b_port.wrapping_add(3));

        a.events_tx
            .send(DiscoveryEvent::PeerDiscovered {
                peer_id: b_id.clone(),
            })
            .await
            .unwrap();
        a.events_tx
            .send(DiscoveryEvent::CandidateReceived {
                peer_id: b_id.clone(),
                addr: shifted,
            })
            .await
            .unwrap();

        // answer the first probe that reaches the real port with a ping
        let reply = ping::encode(&b_id);
        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            let (_, from) = b_socket.recv_from(&mut buf).await.unwrap();
            b_socket.send_to(&reply, from).await.unwrap();
        });

        assert!(
            wait_ready(&a.udp, &b_id, Duration::from_secs(5)).await,
            "port prediction must reach the shifted socket"
        );
        responder.await.unwrap();
        a.conn.close().await.unwrap();
    }

    /// Candidates inside an ignored CIDR are never probed.
    #[tokio::test]
    async fn ignored_cidr_candidates_are_skipped() {
        let config = DiscoConfig {
            ignored_local_cidrs: vec!["127.0.0.0/8".parse().unwrap()],
            ..Default::default()
        };
        let a = stack("peer-a", config).await;
        let b_id = PeerId::new("peer-b").unwrap();

        let b_socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b_port = b_socket.local_addr().unwrap().port();

        a.events_tx
            .send(DiscoveryEvent::CandidateReceived {
                peer_id: b_id.clone(),
                addr: loopback(b_port),
            })
            .await
            .unwrap();

        let mut buf = [0u8; 2048];
        let got_probe = tokio::time::timeout(
            Duration::from_millis(700),
            b_socket.recv_from(&mut buf),
        )
        .await;
        assert!(got_probe.is_err(), "filtered candidate must stay silent");
        assert_eq!(a.udp.table().peer_count(), 0);
        a.conn.close().await.unwrap();
    }

    /// After close, write_to reports Closed and all loops die quickly.
    #[tokio::test]
    async fn shutdown_propagates_to_campaigns() {
        let a = stack("peer-a", DiscoConfig::default()).await;
        let b_id = PeerId::new("peer-b").unwrap();
        a.events_tx
            .send(DiscoveryEvent::CandidateReceived {
                peer_id: b_id.clone(),
                addr: loopback(1),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        a.conn.close().await.unwrap();
        assert!(matches!(
            a.conn.write_to(&b_id, b"x").await,
            Err(DiscoError::Closed)
        ));
        let deadline = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if a.udp.is_closed() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(deadline.is_ok());
    }
}
