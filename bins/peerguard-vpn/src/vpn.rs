//! IP frame shovel
//!
//! Moves L3 frames between the TUN device and the packet conn. The
//! destination peer for an outbound frame is resolved through the overlay
//! routes learned from peer metadata (alias1/alias2) or pinned peer URLs.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};

use tracing::{debug, info, trace, warn};

use peerguard_disco::{DiscoError, PacketConn, PeerId};

use crate::nic::TunDevice;

/// Overlay IP → peer id routes.
pub struct PeerRoutes {
    map: RwLock<HashMap<IpAddr, PeerId>>,
}

impl PeerRoutes {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }

    /// Register a peer's overlay addresses. Unparseable aliases are skipped.
    pub fn add(&self, peer_id: PeerId, alias1: Option<String>, alias2: Option<String>) {
        let mut map = self.map.write().unwrap();
        for alias in [alias1, alias2].into_iter().flatten() {
            match alias.parse::<IpAddr>() {
                Ok(ip) => {
                    map.insert(ip, peer_id.clone());
                }
                Err(_) => debug!("peer {} has unparseable alias {}", peer_id, alias),
            }
        }
    }

    pub fn lookup(&self, ip: IpAddr) -> Option<PeerId> {
        self.map.read().unwrap().get(&ip).cloned()
    }

    pub fn len(&self) -> usize {
        self.map.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PeerRoutes {
    fn default() -> Self {
        Self::new()
    }
}

/// Run both directions until the conn closes.
pub async fn run(tun: TunDevice, conn: Arc<PacketConn>, routes: Arc<PeerRoutes>) {
    let tun = Arc::new(tun);

    let outbound = {
        let tun = tun.clone();
        let conn = conn.clone();
        let routes = routes.clone();
        tokio::spawn(async move {
            loop {
                let frame = match tun.read_frame().await {
                    Ok(frame) if frame.is_empty() => continue,
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("TUN read failed: {}", e);
                        break;
                    }
                };
                let Some(dst) = dst_ip(&frame) else {
                    trace!("dropped non-IP frame of {} bytes", frame.len());
                    continue;
                };
                let Some(peer_id) = routes.lookup(dst) else {
                    trace!("no route to {}", dst);
                    continue;
                };
                match conn.write_to(&peer_id, &frame).await {
                    Ok(_) => {}
                    Err(DiscoError::Closed) => break,
                    Err(e) => debug!("frame to {} dropped: {}", peer_id, e),
                }
            }
        })
    };

    let inbound = tokio::spawn(async move {
        loop {
            match conn.read_from().await {
                Ok((_, data)) => {
                    if let Err(e) = tun.write_frame(&data).await {
                        warn!("TUN write failed: {}", e);
                        break;
                    }
                }
                Err(DiscoError::Closed) => break,
                Err(e) => {
                    warn!("packet conn read failed: {}", e);
                    break;
                }
            }
        }
    });

    let _ = tokio::join!(outbound, inbound);
    info!("vpn packet loops stopped");
}

/// Destination address of a raw IP frame.
fn dst_ip(frame: &[u8]) -> Option<IpAddr> {
    match frame.first()? >> 4 {
        4 if frame.len() >= 20 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&frame[16..20]);
            Some(IpAddr::from(octets))
        }
        6 if frame.len() >= 40 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&frame[24..40]);
            Some(IpAddr::from(octets))
        }
        _ => None,
    }
}
