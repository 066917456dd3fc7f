//! Peermap session
//!
//! One persistent WebSocket connection to the rendezvous server carries
//! everything signalling-related: our hello (identity + metadata), peer
//! hello events, candidate address exchange and relayed datagrams. The
//! secret from the store authenticates the handshake; a rejected secret
//! surfaces as [`PeermapError::TokenExpired`] / [`PeermapError::InvalidToken`]
//! so the caller can re-run the join flow.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http::header::{HeaderName, HeaderValue, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};
use url::Url;

use peerguard_disco::{Datagram, DiscoError, DiscoResult, PeerId, RecvQueue, RelayTransport};

use crate::error::{PeermapError, PeermapResult};
use crate::secret::NetworkSecret;

/// Capacity of the outbound frame queue.
const OUT_QUEUE_CAPACITY: usize = 64;

/// Capacity of the signalling event queue handed to the caller.
const EVENT_QUEUE_CAPACITY: usize = 64;

/// Identity metadata published with our hello and attached to peer events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerMetadata {
    /// Software version string.
    pub version: String,
    /// Overlay IPv4 address, if any.
    pub alias1: Option<String>,
    /// Overlay IPv6 address, if any.
    pub alias2: Option<String>,
    /// curve25519 public key.
    pub public_key: Option<[u8; 32]>,
}

/// Wire frames exchanged with the rendezvous server (bincode encoded).
///
/// `peer_id` names the counterparty: on the way up it addresses the peer
/// the frame is for, on the way down it identifies the peer it came from.
/// The server rewrites it while routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    /// Presence plus identity metadata.
    Hello { peer_id: PeerId, meta: PeerMetadata },
    /// A candidate UDP address for NAT traversal.
    Candidate { peer_id: PeerId, addr: std::net::SocketAddr },
    /// A relayed datagram.
    Relay {
        src: PeerId,
        dst: PeerId,
        peer_assisted: bool,
        data: Vec<u8>,
    },
}

/// Signalling events delivered to the caller.
#[derive(Debug, Clone)]
pub enum PeermapEvent {
    /// A peer announced itself on the network.
    PeerUp { peer_id: PeerId, meta: PeerMetadata },
    /// A peer advertised a candidate address for us to probe.
    Candidate { peer_id: PeerId, addr: std::net::SocketAddr },
}

/// Session parameters.
#[derive(Debug, Clone)]
pub struct PeermapConfig {
    pub server: Url,
    pub peer_id: PeerId,
    pub metadata: PeerMetadata,
    /// With statically pinned peers the client neither broadcasts presence
    /// nor auto-discovers: no hello is sent.
    pub silence_mode: bool,
}

/// Handle to the running session.
pub struct PeermapClient {
    self_id: PeerId,
    out_tx: mpsc::Sender<Frame>,
    close_tx: broadcast::Sender<()>,
    closed: AtomicBool,
}

impl PeermapClient {
    /// Connect and authenticate, then spawn the reader and writer tasks.
    ///
    /// Relayed datagrams are pushed straight into `inbound` (the same
    /// queue the UDP demultiplexer feeds); everything else arrives on the
    /// returned event stream.
    pub async fn connect(
        config: PeermapConfig,
        secret: &NetworkSecret,
        inbound: Arc<RecvQueue>,
    ) -> PeermapResult<(Arc<Self>, mpsc::Receiver<PeermapEvent>)> {
        let mut request = ws_url(&config.server)?
            .as_str()
            .into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&secret.secret)
                .map_err(|_| PeermapError::InvalidToken)?,
        );
        headers.insert(
            HeaderName::from_static("x-network"),
            HeaderValue::from_str(&secret.network)
                .map_err(|_| PeermapError::InvalidToken)?,
        );
        headers.insert(
            HeaderName::from_static("x-peer-id"),
            HeaderValue::from_str(config.peer_id.as_str())
                .map_err(|_| PeermapError::InvalidToken)?,
        );

        let (stream, _response) = connect_async(request).await.map_err(handshake_error)?;
        info!("peermap session established with {}", config.server);
        let (mut sink, mut ws_stream) = stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Frame>(OUT_QUEUE_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (close_tx, _) = broadcast::channel(1);

        let client = Arc::new(Self {
            self_id: config.peer_id.clone(),
            out_tx,
            close_tx: close_tx.clone(),
            closed: AtomicBool::new(false),
        });

        // writer: our hello first, then the outbound queue
        let mut writer_close = close_tx.subscribe();
        let silence = config.silence_mode;
        let hello = Frame::Hello {
            peer_id: config.peer_id.clone(),
            meta: config.metadata.clone(),
        };
        tokio::spawn(async move {
            if !silence {
                if let Err(e) = send_frame(&mut sink, &hello).await {
                    warn!("peermap hello failed: {}", e);
                    return;
                }
            }
            loop {
                let frame = tokio::select! {
                    _ = writer_close.recv() => break,
                    frame = out_rx.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };
                if let Err(e) = send_frame(&mut sink, &frame).await {
                    warn!("peermap write failed: {}", e);
                    break;
                }
            }
            let _ = sink.send(Message::Close(None)).await;
            debug!("peermap writer exit");
        });

        // reader: peer events to the caller, relayed datagrams to the queue
        let mut reader_close = close_tx.subscribe();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = reader_close.recv() => break,
                    message = ws_stream.next() => match message {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => {
                            warn!("peermap read failed: {}", e);
                            break;
                        }
                        None => break,
                    },
                };
                let data = match message {
                    Message::Binary(data) => data,
                    Message::Close(_) => break,
                    _ => continue,
                };
                let frame: Frame = match bincode::deserialize(&data) {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!("skipped malformed peermap frame: {}", e);
                        continue;
                    }
                };
                match frame {
                    Frame::Hello { peer_id, meta } => {
                        debug!("PeerUp: {}", peer_id);
                        let _ = events_tx
                            .send(PeermapEvent::PeerUp { peer_id, meta })
                            .await;
                    }
                    Frame::Candidate { peer_id, addr } => {
                        let _ = events_tx
                            .send(PeermapEvent::Candidate { peer_id, addr })
                            .await;
                    }
                    Frame::Relay { src, data, .. } => {
                        inbound.push(Datagram {
                            from: Some(src),
                            data: Bytes::from(data),
                        });
                    }
                }
            }
            debug!("peermap reader exit");
        });

        Ok((client, events_rx))
    }

    /// Advertise one of our candidate addresses to `peer_id`.
    pub async fn advertise(
        &self,
        peer_id: PeerId,
        addr: std::net::SocketAddr,
    ) -> PeermapResult<()> {
        self.send(Frame::Candidate { peer_id, addr }).await
    }

    async fn send(&self, frame: Frame) -> PeermapResult<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(PeermapError::Closed);
        }
        self.out_tx
            .send(frame)
            .await
            .map_err(|_| PeermapError::Closed)
    }

    /// Tear the session down. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.close_tx.send(());
        }
    }
}

#[async_trait]
impl RelayTransport for PeermapClient {
    async fn send_datagram(
        &self,
        dst: &PeerId,
        data: &[u8],
        peer_assisted: bool,
    ) -> DiscoResult<()> {
        let frame = Frame::Relay {
            src: self.self_id.clone(),
            dst: dst.clone(),
            peer_assisted,
            data: data.to_vec(),
        };
        self.send(frame).await.map_err(|_| DiscoError::Closed)
    }
}

async fn send_frame<S>(sink: &mut S, frame: &Frame) -> PeermapResult<()>
where
    S: futures_util::Sink<Message, Error = WsError> + Unpin,
{
    let data = bincode::serialize(frame)?;
    sink.send(Message::Binary(data)).await?;
    Ok(())
}

/// Map the configured server URL onto the websocket endpoint.
fn ws_url(server: &Url) -> PeermapResult<Url> {
    let mut url = server.clone();
    let scheme = match server.scheme() {
        "ws" | "wss" => return Ok(url),
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(PeermapError::InvalidUrl(format!(
                "unsupported rendezvous scheme {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| PeermapError::InvalidUrl(server.to_string()))?;
    Ok(url)
}

/// Authentication failures from the handshake get their own kinds so the
/// caller can relaunch the join flow.
fn handshake_error(err: WsError) -> PeermapError {
    match err {
        WsError::Http(response) if response.status() == http::StatusCode::UNAUTHORIZED => {
            PeermapError::TokenExpired
        }
        WsError::Http(response) if response.status() == http::StatusCode::FORBIDDEN => {
            PeermapError::InvalidToken
        }
        other => PeermapError::Ws(other),
    }
}
