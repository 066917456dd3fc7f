//! UDP socket driver
//!
//! One socket carries everything: discovery pings, STUN exchanges and data.
//! The demultiplexer classifies each inbound packet and hands it to the
//! right consumer through bounded queues; writers share the socket freely
//! since datagram writes are atomic.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, trace, warn};

use crate::config::DiscoConfig;
use crate::conn::RecvQueue;
use crate::error::{DiscoError, DiscoResult};
use crate::peer::{Datagram, PeerId};
use crate::stun::{self, StunSessions};
use crate::table::PeerTable;
use crate::{ping, KEEPALIVE_INTERVAL};

/// Largest UDP payload the demultiplexer will read.
const MAX_DATAGRAM: usize = 65_535;

/// Capacity of the STUN response and candidate event queues.
const EVENT_QUEUE_CAPACITY: usize = 10;

/// Gap between Binding Requests to successive STUN servers.
const STUN_SERVER_GAP: Duration = Duration::from_secs(2);

/// Socket binding options.
#[derive(Debug, Clone)]
pub struct ListenConfig {
    pub port: u16,
    pub disable_ipv4: bool,
    pub disable_ipv6: bool,
    pub keepalive: Duration,
    pub peer_id: PeerId,
}

impl ListenConfig {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            port: 29877,
            disable_ipv4: false,
            disable_ipv6: false,
            keepalive: KEEPALIVE_INTERVAL,
            peer_id,
        }
    }
}

/// A local or STUN-derived address to advertise to a peer through the
/// signalling channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateEvent {
    pub peer_id: PeerId,
    pub addr: SocketAddr,
}

/// The bound UDP socket plus its demultiplexer and helper tasks.
pub struct UdpConn {
    socket: Arc<UdpSocket>,
    /// Socket speaks IPv6 (possibly dual-stack); IPv4 targets need mapping.
    v6_socket: bool,
    local_port: u16,
    local_addrs: Vec<SocketAddr>,
    self_id: PeerId,
    keepalive: Duration,
    table: Arc<PeerTable>,
    stun_sessions: Arc<StunSessions>,
    recv_queue: Arc<RecvQueue>,
    candidates_tx: mpsc::Sender<CandidateEvent>,
    close_tx: broadcast::Sender<()>,
    closed: AtomicBool,
}

impl UdpConn {
    /// Bind the socket, enumerate usable local addresses and start the
    /// demultiplexer, peer-op applier, STUN handler and health sweeper.
    ///
    /// The returned receiver yields candidate addresses to forward to the
    /// signalling service.
    pub async fn bind(
        config: ListenConfig,
        disco: &DiscoConfig,
        recv_queue: Arc<RecvQueue>,
    ) -> DiscoResult<(Arc<Self>, mpsc::Receiver<CandidateEvent>)> {
        if config.disable_ipv4 && config.disable_ipv6 {
            return Err(DiscoError::Config(
                "both IPv4 and IPv6 disabled".into(),
            ));
        }

        let socket = bind_socket(&config)?;
        let v6_socket = !config.disable_ipv6;
        let local_port = socket.local_addr()?.port();
        let local_addrs = enumerate_local_addrs(local_port, disco, &config)?;
        debug!(
            "udp socket bound on port {}, {} local candidate addrs",
            local_port,
            local_addrs.len()
        );

        let (table, ops_rx) = PeerTable::new(config.keepalive);
        let (candidates_tx, candidates_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (stun_tx, stun_rx) = mpsc::channel::<Vec<u8>>(EVENT_QUEUE_CAPACITY);
        let (close_tx, _) = broadcast::channel(1);

        let conn = Arc::new(Self {
            socket: Arc::new(socket),
            v6_socket,
            local_port,
            local_addrs,
            self_id: config.peer_id,
            keepalive: config.keepalive,
            table: table.clone(),
            stun_sessions: Arc::new(StunSessions::new()),
            recv_queue,
            candidates_tx,
            close_tx: close_tx.clone(),
            closed: AtomicBool::new(false),
        });

        tokio::spawn(table.run_apply_loop(ops_rx, close_tx.subscribe()));
        tokio::spawn(conn.clone().run_demux_loop(stun_tx));
        tokio::spawn(conn.clone().run_stun_loop(stun_rx));
        tokio::spawn(conn.clone().run_sweeper_loop());

        Ok((conn, candidates_rx))
    }

    pub fn self_id(&self) -> &PeerId {
        &self.self_id
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Local candidate addresses, already filtered by interface prefix and
    /// ignored CIDRs.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn table(&self) -> &Arc<PeerTable> {
        &self.table
    }

    pub fn keepalive(&self) -> Duration {
        self.keepalive
    }

    /// Subscribe to the broadcast close signal.
    pub fn subscribe_close(&self) -> broadcast::Receiver<()> {
        self.close_tx.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Broadcast the close signal; every loop exits promptly.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.close_tx.send(());
        }
    }

    /// Raw non-blocking write. A write that would block is treated as a
    /// dropped packet.
    pub fn send_to(&self, data: &[u8], addr: SocketAddr) -> DiscoResult<usize> {
        if addr.ip().is_unspecified() || addr.port() == 0 {
            return Err(DiscoError::PeerUnreachable(self.self_id.clone()));
        }
        let target = self.map_target(addr);
        match self.socket.try_send_to(data, target) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                debug!("udp write to {} would block, packet dropped", addr);
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Send to a peer via its freshest path.
    pub fn write_to_peer(&self, peer_id: &PeerId, data: &[u8]) -> DiscoResult<usize> {
        let addr = self.table.select(peer_id)?;
        trace!("WriteTo: {} at {}", peer_id, addr);
        self.send_to(data, addr)
    }

    /// Queue every local address as a candidate for `peer_id`.
    pub fn advertise_local_addrs(&self, peer_id: &PeerId) {
        for addr in &self.local_addrs {
            let event = CandidateEvent {
                peer_id: peer_id.clone(),
                addr: *addr,
            };
            if self.candidates_tx.try_send(event).is_err() {
                warn!("candidate queue full, dropped local addr {}", addr);
            }
        }
    }

    /// Issue a Binding Request round: one session, every server in
    /// sequence with a 2 s gap, stopping early once the peer is ready.
    pub async fn request_stun(&self, peer_id: &PeerId, stun_servers: &[String]) {
        if self.is_closed() {
            return;
        }
        let txid = self.stun_sessions.create(peer_id.clone());
        let request = stun::binding_request(&txid);
        let mut close_rx = self.subscribe_close();

        for server in stun_servers {
            let addr = match tokio::net::lookup_host(server.as_str()).await {
                Ok(mut addrs) => match addrs.next() {
                    Some(addr) => addr,
                    None => {
                        error!("no addresses for STUN server {}", server);
                        continue;
                    }
                },
                Err(e) => {
                    error!("resolve STUN server {} failed: {}", server, e);
                    continue;
                }
            };
            if let Err(e) = self.send_to(&request, addr) {
                error!("STUN request to {} failed: {}", server, e);
                continue;
            }
            tokio::select! {
                _ = close_rx.recv() => return,
                _ = tokio::time::sleep(STUN_SERVER_GAP) => {}
            }
            if self.table.is_ready(peer_id) {
                break;
            }
        }
    }

    /// Packet reader: classify inbound traffic into pings, STUN responses
    /// and datagrams.
    async fn run_demux_loop(self: Arc<Self>, stun_tx: mpsc::Sender<Vec<u8>>) {
        let mut close_rx = self.subscribe_close();
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (n, src) = tokio::select! {
                _ = close_rx.recv() => break,
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok(r) => r,
                    Err(e) => {
                        if self.is_closed() {
                            break;
                        }
                        error!("read from udp error: {}", e);
                        continue;
                    }
                },
            };
            let src = canonical_addr(src);
            let packet = &buf[..n];

            if ping::has_prefix(packet) {
                match ping::decode(packet) {
                    Some(peer_id) => self.table.on_ping(peer_id, src),
                    None => debug!("malformed ping from {}, {} bytes", src, n),
                }
                continue;
            }

            if stun::is_message(packet) {
                if stun_tx.try_send(packet.to_vec()).is_err() {
                    warn!("stun queue full, response from {} dropped", src);
                }
                continue;
            }

            let from = self.table.lookup_peer_by_addr(src);
            self.recv_queue.push(Datagram {
                from,
                data: Bytes::copy_from_slice(packet),
            });
        }
        debug!("packet reader exit");
    }

    /// STUN handler: correlate responses to sessions and emit the observed
    /// public address as a candidate for the session's peer.
    async fn run_stun_loop(self: Arc<Self>, mut stun_rx: mpsc::Receiver<Vec<u8>>) {
        let mut close_rx = self.subscribe_close();
        loop {
            let raw = tokio::select! {
                _ = close_rx.recv() => break,
                raw = stun_rx.recv() => match raw {
                    Some(raw) => raw,
                    None => break,
                },
            };
            let (txid, addr) = match stun::parse_response(&raw) {
                Ok(parsed) => parsed,
                Err(e) => {
                    debug!("skipped invalid stun response: {}", e);
                    continue;
                }
            };
            let Some(session) = self.stun_sessions.take(&txid) else {
                debug!("skipped unknown stun txid");
                continue;
            };
            debug!("stun mapped address {} for {}", addr, session.peer_id);
            let event = CandidateEvent {
                peer_id: session.peer_id,
                addr: canonical_addr(addr),
            };
            if self.candidates_tx.try_send(event).is_err() {
                warn!("candidate queue full, dropped stun-derived addr {}", addr);
            }
        }
        debug!("stun handler exit");
    }

    /// Health sweeper: tick at `keepalive/2 + 1 s`, expiring stale paths
    /// and unanswered STUN sessions.
    async fn run_sweeper_loop(self: Arc<Self>) {
        let mut close_rx = self.subscribe_close();
        let period = self.keepalive / 2 + Duration::from_secs(1);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // immediate first tick
        loop {
            tokio::select! {
                _ = close_rx.recv() => break,
                _ = ticker.tick() => {
                    self.table.sweep();
                    let expired = self.stun_sessions.sweep();
                    if expired > 0 {
                        debug!("swept {} unanswered stun sessions", expired);
                    }
                }
            }
        }
        debug!("health sweeper exit");
    }

    /// Map IPv4 targets onto a dual-stack IPv6 socket.
    fn map_target(&self, addr: SocketAddr) -> SocketAddr {
        match addr {
            SocketAddr::V4(v4) if self.v6_socket => {
                SocketAddr::new(v4.ip().to_ipv6_mapped().into(), v4.port())
            }
            other => other,
        }
    }

    #[cfg(test)]
    pub(crate) async fn test_bind(recv_queue: Arc<RecvQueue>) -> Arc<Self> {
        Self::test_bind_as(recv_queue, "test-peer", Duration::from_millis(100)).await
    }

    #[cfg(test)]
    pub(crate) async fn test_bind_as(
        recv_queue: Arc<RecvQueue>,
        id: &str,
        keepalive: Duration,
    ) -> Arc<Self> {
        let mut config = ListenConfig::new(PeerId::new(id).unwrap());
        config.port = 0;
        config.keepalive = keepalive;
        let (conn, _candidates) = Self::bind(config, &DiscoConfig::default(), recv_queue)
            .await
            .unwrap();
        conn
    }
}

fn bind_socket(config: &ListenConfig) -> DiscoResult<UdpSocket> {
    let (domain, bind_addr): (Domain, SocketAddr) = if config.disable_ipv6 {
        (
            Domain::IPV4,
            SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), config.port),
        )
    } else {
        (
            Domain::IPV6,
            SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), config.port),
        )
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    if domain == Domain::IPV6 {
        socket.set_only_v6(config.disable_ipv4)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&bind_addr.into())?;

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

/// Non-loopback interface addresses usable as candidates, as
/// `ip:listen-port` pairs.
fn enumerate_local_addrs(
    port: u16,
    disco: &DiscoConfig,
    config: &ListenConfig,
) -> DiscoResult<Vec<SocketAddr>> {
    let mut addrs = Vec::new();
    for iface in get_if_addrs::get_if_addrs()? {
        if iface.is_loopback() || disco.is_ignored_interface(&iface.name) {
            continue;
        }
        let ip = iface.ip();
        if disco.is_ignored_addr(ip) {
            continue;
        }
        if (ip.is_ipv4() && config.disable_ipv4) || (ip.is_ipv6() && config.disable_ipv6) {
            continue;
        }
        addrs.push(SocketAddr::new(ip, port));
    }
    Ok(addrs)
}

/// Normalize IPv4-mapped IPv6 addresses back to plain IPv4 so path keys
/// compare consistently on dual-stack sockets.
fn canonical_addr(addr: SocketAddr) -> SocketAddr {
    SocketAddr::new(addr.ip().to_canonical(), addr.port())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::RECV_QUEUE_CAPACITY;

    async fn wait_until(deadline: Duration, mut probe: impl FnMut() -> bool) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < deadline {
            if probe() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    fn loopback(port: u16) -> SocketAddr {
        SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port)
    }

    #[tokio::test]
    async fn inbound_ping_confirms_path() {
        let recv_a = Arc::new(RecvQueue::new(RECV_QUEUE_CAPACITY));
        let recv_b = Arc::new(RecvQueue::new(RECV_QUEUE_CAPACITY));
        let a = UdpConn::test_bind_as(recv_a, "peer-a", Duration::from_millis(500)).await;
        let b = UdpConn::test_bind_as(recv_b, "peer-b", Duration::from_millis(500)).await;

        let frame = ping::encode(a.self_id());
        a.send_to(&frame, loopback(b.local_port())).unwrap();

        let a_id = a.self_id().clone();
        let found = wait_until(Duration::from_secs(2), || {
            b.table().is_ready(&a_id)
        })
        .await;
        assert!(found, "peer-b must learn peer-a from the ping");

        a.close();
        b.close();
    }

    #[tokio::test]
    async fn datagrams_are_tagged_with_sender_id() {
        let recv_a = Arc::new(RecvQueue::new(RECV_QUEUE_CAPACITY));
        let recv_b = Arc::new(RecvQueue::new(RECV_QUEUE_CAPACITY));
        let a = UdpConn::test_bind_as(recv_a, "peer-a", Duration::from_millis(500)).await;
        let b = UdpConn::test_bind_as(recv_b.clone(), "peer-b", Duration::from_millis(500)).await;

        // teach B about A first
        a.send_to(&ping::encode(a.self_id()), loopback(b.local_port()))
            .unwrap();
        let a_id = a.self_id().clone();
        assert!(
            wait_until(Duration::from_secs(2), || b.table().is_ready(&a_id)).await
        );

        a.send_to(b"hello", loopback(b.local_port())).unwrap();
        let datagram = tokio::time::timeout(Duration::from_secs(2), recv_b.pop())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(datagram.from.as_ref(), Some(a.self_id()));
        assert_eq!(datagram.data.as_ref(), b"hello");

        a.close();
        b.close();
    }

    #[tokio::test]
    async fn datagrams_from_strangers_are_untagged() {
        let recv_b = Arc::new(RecvQueue::new(RECV_QUEUE_CAPACITY));
        let recv_a = Arc::new(RecvQueue::new(RECV_QUEUE_CAPACITY));
        let a = UdpConn::test_bind(recv_a).await;
        let b = UdpConn::test_bind(recv_b.clone()).await;

        a.send_to(b"anonymous", loopback(b.local_port())).unwrap();
        let datagram = tokio::time::timeout(Duration::from_secs(2), recv_b.pop())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(datagram.from, None);

        a.close();
        b.close();
    }

    #[tokio::test]
    async fn oversized_ping_frames_are_ignored() {
        let recv_a = Arc::new(RecvQueue::new(RECV_QUEUE_CAPACITY));
        let recv_b = Arc::new(RecvQueue::new(RECV_QUEUE_CAPACITY));
        let a = UdpConn::test_bind(recv_a).await;
        let b = UdpConn::test_bind(recv_b.clone()).await;

        let mut frame = b"_ping".to_vec();
        frame.extend_from_slice(&[b'x'; 300]);
        a.send_to(&frame, loopback(b.local_port())).unwrap();

        // neither a path nor a datagram may come out of it
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(b.table().peer_count(), 0);
        assert!(recv_b.is_empty());

        a.close();
        b.close();
    }

    #[tokio::test]
    async fn write_to_unknown_peer_is_unreachable() {
        let recv = Arc::new(RecvQueue::new(RECV_QUEUE_CAPACITY));
        let conn = UdpConn::test_bind(recv).await;
        let err = conn
            .write_to_peer(&PeerId::new("ghost").unwrap(), b"x")
            .unwrap_err();
        assert!(matches!(err, DiscoError::PeerUnreachable(_)));
        conn.close();
    }

    #[tokio::test]
    async fn send_to_zero_addr_is_rejected() {
        let recv = Arc::new(RecvQueue::new(RECV_QUEUE_CAPACITY));
        let conn = UdpConn::test_bind(recv).await;
        let err = conn
            .send_to(b"x", "0.0.0.0:0".parse().unwrap())
            .unwrap_err();
        assert!(matches!(err, DiscoError::PeerUnreachable(_)));
        conn.close();
    }

    #[tokio::test]
    async fn close_stops_loops_within_a_second() {
        let recv = Arc::new(RecvQueue::new(RECV_QUEUE_CAPACITY));
        let conn = UdpConn::test_bind(recv).await;
        let mut close_rx = conn.subscribe_close();
        conn.close();
        let signalled =
            tokio::time::timeout(Duration::from_secs(1), close_rx.recv()).await;
        assert!(signalled.is_ok());
        assert!(conn.is_closed());
        // double close is harmless
        conn.close();
    }
}
