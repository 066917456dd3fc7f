//! peerguard VPN daemon
//!
//! Runs a mesh VPN on top of the peerguard P2P overlay: peers are found
//! through the rendezvous (peermap) server, NAT-traversed over a single
//! UDP socket, and IP frames from the TUN device ride the resulting
//! packet conn.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use peerguard_disco::{Discovery, DiscoveryEvent, PacketConn, RecvQueue, UdpConn};
use peerguard_peermap::{join_oidc, PeermapClient, PeermapEvent, JOIN_FLOW_TIMEOUT};

mod config;
mod nic;
mod shutdown;
mod vpn;

use config::{AppConfig, Cli};
use vpn::PeerRoutes;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.loglevel.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    let config = AppConfig::from_cli(cli)?;
    run(config).await
}

async fn run(config: AppConfig) -> Result<()> {
    // network secret: reuse the stored one, or walk the join flow
    let secret = match config.secret_store.exists() {
        true => {
            let stored = config.secret_store.load().context("read secret file")?;
            if stored.expired() {
                request_network_secret(&config).await?
            } else {
                stored
            }
        }
        false => request_network_secret(&config).await?,
    };

    // the TUN device comes up first so a broken setup fails fast
    let tun = nic::TunDevice::create(&config.tun_name, config.ipv4, config.mtu)
        .await
        .context("create TUN device")?;
    if let Some((addr, prefix_len)) = config.ipv6 {
        // the tun crate only auto-assigns IPv4
        info!(
            "assign {}/{} to {} manually, IPv6 is not auto-configured",
            addr, prefix_len, config.tun_name
        );
    }

    let recv_queue = Arc::new(RecvQueue::new(peerguard_disco::conn::RECV_QUEUE_CAPACITY));
    let (udp, candidates_rx) = UdpConn::bind(
        config.listen.clone(),
        &config.disco,
        recv_queue.clone(),
    )
    .await
    .context("bind UDP socket")?;
    info!(
        "listening on udp port {} as {}",
        udp.local_port(),
        udp.self_id()
    );

    let discovery =
        Discovery::new(udp.clone(), config.disco.clone(), config.stun_servers.clone());
    let (events_tx, events_rx) = tokio::sync::mpsc::channel::<DiscoveryEvent>(64);
    tokio::spawn(discovery.run(events_rx));

    let conn = Arc::new(PacketConn::new(udp.clone(), recv_queue.clone()));
    conn.set_transport_mode(config.transport_mode);

    // session to the rendezvous server; one re-join on an expired token
    let connect =
        PeermapClient::connect(config.peermap_config(), &secret, recv_queue.clone());
    let (peermap, peermap_events) = match connect.await {
        Ok(session) => session,
        Err(peerguard_peermap::PeermapError::TokenExpired)
        | Err(peerguard_peermap::PeermapError::InvalidToken) => {
            warn!("stored network secret rejected, re-joining");
            let secret = request_network_secret(&config).await?;
            PeermapClient::connect(config.peermap_config(), &secret, recv_queue.clone())
                .await
                .context("connect to rendezvous server")?
        }
        Err(e) => return Err(e).context("connect to rendezvous server"),
    };
    conn.set_relay(peermap.clone());

    let routes = Arc::new(PeerRoutes::new());
    spawn_signalling_glue(
        peermap.clone(),
        peermap_events,
        candidates_rx,
        events_tx.clone(),
        routes.clone(),
    );

    // statically pinned peers bypass auto-discovery
    for peer_url in &config.peers {
        routes.add(
            peer_url.peer_id.clone(),
            peer_url.alias1.map(|ip| ip.to_string()),
            peer_url.alias2.map(|ip| ip.to_string()),
        );
        events_tx
            .send(DiscoveryEvent::PeerDiscovered {
                peer_id: peer_url.peer_id.clone(),
            })
            .await
            .ok();
    }

    let vpn_task = tokio::spawn(vpn::run(tun, conn.clone(), routes.clone()));

    shutdown::shutdown_signal().await?;
    info!("shutting down");
    conn.close().await?;
    peermap.close();
    vpn_task.abort();
    Ok(())
}

/// Forward signalling traffic between the peermap session and the
/// discovery coordinator, and keep the overlay routes current.
fn spawn_signalling_glue(
    peermap: Arc<PeermapClient>,
    mut peermap_events: tokio::sync::mpsc::Receiver<PeermapEvent>,
    mut candidates_rx: tokio::sync::mpsc::Receiver<peerguard_disco::CandidateEvent>,
    events_tx: tokio::sync::mpsc::Sender<DiscoveryEvent>,
    routes: Arc<PeerRoutes>,
) {
    tokio::spawn(async move {
        while let Some(event) = peermap_events.recv().await {
            match event {
                PeermapEvent::PeerUp { peer_id, meta } => {
                    routes.add(peer_id.clone(), meta.alias1.clone(), meta.alias2.clone());
                    if events_tx
                        .send(DiscoveryEvent::PeerDiscovered { peer_id })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                PeermapEvent::Candidate { peer_id, addr } => {
                    if events_tx
                        .send(DiscoveryEvent::CandidateReceived { peer_id, addr })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
    });

    tokio::spawn(async move {
        while let Some(event) = candidates_rx.recv().await {
            if let Err(e) = peermap.advertise(event.peer_id, event.addr).await {
                warn!("candidate advertisement failed: {}", e);
                break;
            }
        }
    });
}

/// Run the OIDC join flow and persist the granted secret.
async fn request_network_secret(
    config: &AppConfig,
) -> Result<peerguard_peermap::NetworkSecret> {
    let join = join_oidc(&config.server)
        .await
        .context("open join session")?;

    println!("Open the following link to authenticate");
    println!("{}", join.auth_url());
    if config.auth_qr {
        let code = qrcode::QrCode::new(join.auth_url().as_bytes())
            .context("render auth QR code")?;
        let rendered = code
            .render::<qrcode::render::unicode::Dense1x2>()
            .quiet_zone(true)
            .build();
        println!("{rendered}");
    }

    let secret = join
        .wait(JOIN_FLOW_TIMEOUT)
        .await
        .context("wait for network join grant")?;
    config
        .secret_store
        .update(&secret)
        .context("persist network secret")?;
    info!("joined network {}", secret.network);
    Ok(secret)
}
