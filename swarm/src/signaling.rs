//! Signaling: room-scoped rendezvous over WebSocket, plus the direct peer
//! channel fabric.
//!
//! The client joins a room, learns the membership, and negotiates peer
//! channels: the **newcomer dials** each existing peer's advertised
//! endpoint (announcing itself with an offer; the accepting side answers),
//! which keeps the dance deterministic with no dial races. Candidate
//! alternate endpoints travel as `ice-candidate` messages. Heartbeats go
//! out every 30 s; on a dropped signaling socket the client reconnects with
//! exponential backoff from 5 s, rejoins, and reannounces — existing peer
//! channels survive the signaling outage.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::envelope::{now_millis, Envelope};
use crate::peer::{PeerInfo, PeerLink, HEARTBEAT_INTERVAL};
use crate::transport::SwarmTransport;
use crate::SwarmError;

/// Base delay for signaling reconnect backoff.
pub const RECONNECT_BASE: Duration = Duration::from_secs(5);

/// Signaling protocol messages.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    Join {
        room: String,
        peer_id: String,
        endpoint: String,
        capabilities: Vec<String>,
    },
    Offer {
        from: String,
        to: String,
        endpoint: String,
    },
    Answer {
        from: String,
        to: String,
        endpoint: String,
    },
    IceCandidate {
        from: String,
        to: String,
        candidate: String,
    },
    PeerJoined {
        peer_id: String,
        endpoint: String,
        capabilities: Vec<String>,
    },
    PeerLeft {
        peer_id: String,
    },
    Announce {
        peer_id: String,
        capabilities: Vec<String>,
    },
    Broadcast {
        from: String,
        payload: serde_json::Value,
    },
    Leave {
        peer_id: String,
    },
    Heartbeat {
        peer_id: String,
    },
}

impl SignalMessage {
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn decode(text: &str) -> Result<Self, SwarmError> {
        serde_json::from_str(text).map_err(|e| SwarmError::Malformed(e.to_string()))
    }
}

#[derive(Clone, Debug)]
pub struct SignalingConfig {
    pub url: String,
    pub room: String,
}

/// Outbound half of a WebSocket peer channel.
struct WsLink {
    sink: Mutex<futures_util::stream::SplitSink<WebSocketStream<TcpStream>, Message>>,
}

#[async_trait]
impl PeerLink for WsLink {
    async fn send(&self, text: String) -> Result<(), SwarmError> {
        self.sink
            .lock()
            .await
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| SwarmError::Transport(e.to_string()))
    }
}

/// Outbound half of a dialed (possibly TLS) WebSocket peer channel.
struct DialedLink {
    sink: Mutex<
        futures_util::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>,
    >,
}

#[async_trait]
impl PeerLink for DialedLink {
    async fn send(&self, text: String) -> Result<(), SwarmError> {
        self.sink
            .lock()
            .await
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| SwarmError::Transport(e.to_string()))
    }
}

/// Starts the peer-channel listener: inbound connections introduce
/// themselves with a `hello` envelope, then stream envelopes into the
/// transport. Returns the bound address (bind to port 0 in tests).
pub async fn start_peer_listener(
    transport: Arc<SwarmTransport>,
    bind: &str,
) -> Result<std::net::SocketAddr, SwarmError> {
    let listener = TcpListener::bind(bind)
        .await
        .map_err(|e| SwarmError::Transport(e.to_string()))?;
    let addr = listener
        .local_addr()
        .map_err(|e| SwarmError::Transport(e.to_string()))?;
    serve_peer_listener(transport, listener);
    Ok(addr)
}

/// Serves peer channels on an already-bound listener (tests bind to port 0
/// first so the endpoint is known before the transport is built).
pub fn serve_peer_listener(transport: Arc<SwarmTransport>, listener: TcpListener) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "peer listener up");
    }

    tokio::spawn(async move {
        loop {
            let Ok((stream, remote)) = listener.accept().await else {
                return;
            };
            let transport = Arc::clone(&transport);
            tokio::spawn(async move {
                let ws = match accept_async(stream).await {
                    Ok(ws) => ws,
                    Err(e) => {
                        debug!(%remote, %e, "peer handshake failed");
                        return;
                    }
                };
                let (sink, mut rx) = ws.split();

                // First frame must be the hello.
                let hello = match rx.next().await {
                    Some(Ok(Message::Text(text))) => match Envelope::decode(&text) {
                        Ok(envelope) if envelope.msg_type == "hello" => envelope,
                        _ => {
                            debug!(%remote, "expected hello; closing");
                            return;
                        }
                    },
                    _ => return,
                };
                let peer_id = hello.peer_id.clone();
                let info = PeerInfo {
                    peer_id: peer_id.clone(),
                    endpoint: hello.payload["endpoint"].as_str().unwrap_or_default().to_string(),
                    capabilities: hello.payload["capabilities"]
                        .as_array()
                        .map(|a| {
                            a.iter()
                                .filter_map(|v| v.as_str().map(String::from))
                                .collect()
                        })
                        .unwrap_or_default(),
                    last_seen: now_millis(),
                };
                transport
                    .connect_peer(info, Arc::new(WsLink { sink: Mutex::new(sink) }))
                    .await;

                while let Some(Ok(message)) = rx.next().await {
                    if let Message::Text(text) = message {
                        transport.handle_incoming(&peer_id, &text).await;
                    }
                }
                transport.disconnect_peer(&peer_id);
            });
        }
    });
}

/// Dials a peer's endpoint, introduces this transport, and wires the
/// inbound half into it.
pub async fn dial_peer(transport: &Arc<SwarmTransport>, info: PeerInfo) -> Result<(), SwarmError> {
    let url = format!("ws://{}", info.endpoint.trim_start_matches("ws://"));
    let (ws, _) = connect_async(&url)
        .await
        .map_err(|e| SwarmError::Transport(e.to_string()))?;
    let (sink, mut rx) = ws.split();
    let link = Arc::new(DialedLink { sink: Mutex::new(sink) });

    let hello = Envelope::new(
        "hello",
        transport.peer_id(),
        serde_json::json!({
            "endpoint": transport.config().endpoint,
            "capabilities": transport.config().capabilities,
        }),
    )?;
    link.send(hello.encode()).await?;
    transport.connect_peer(info.clone(), link).await;

    let transport = Arc::clone(transport);
    tokio::spawn(async move {
        while let Some(Ok(message)) = rx.next().await {
            if let Message::Text(text) = message {
                transport.handle_incoming(&info.peer_id, &text).await;
            }
        }
        transport.disconnect_peer(&info.peer_id);
    });
    Ok(())
}

/// The signaling client task: join, negotiate peer channels, heartbeat,
/// reconnect forever.
pub struct SignalingClient;

impl SignalingClient {
    /// Spawns the client loop. Runs until the transport is dropped or the
    /// process exits.
    pub fn spawn(config: SignalingConfig, transport: Arc<SwarmTransport>) {
        tokio::spawn(async move {
            let mut backoff = RECONNECT_BASE;
            loop {
                match Self::session(&config, &transport).await {
                    Ok(()) => backoff = RECONNECT_BASE,
                    Err(e) => {
                        warn!(%e, ?backoff, "signaling session ended; reconnecting");
                    }
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(120));
            }
        });
    }

    /// One signaling connection: join, pump messages, heartbeat.
    async fn session(
        config: &SignalingConfig,
        transport: &Arc<SwarmTransport>,
    ) -> Result<(), SwarmError> {
        let (ws, _) = connect_async(&config.url)
            .await
            .map_err(|e| SwarmError::Signaling(e.to_string()))?;
        let (mut sink, mut rx) = ws.split();

        let join = SignalMessage::Join {
            room: config.room.clone(),
            peer_id: transport.peer_id().to_string(),
            endpoint: transport.config().endpoint.clone(),
            capabilities: transport.config().capabilities.clone(),
        };
        sink.send(Message::Text(join.encode().into()))
            .await
            .map_err(|e| SwarmError::Signaling(e.to_string()))?;
        // Rejoin doubles as the reannounce after a reconnect.
        let announce = SignalMessage::Announce {
            peer_id: transport.peer_id().to_string(),
            capabilities: transport.config().capabilities.clone(),
        };
        sink.send(Message::Text(announce.encode().into()))
            .await
            .map_err(|e| SwarmError::Signaling(e.to_string()))?;

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await; // immediate first tick

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    let beat = SignalMessage::Heartbeat {
                        peer_id: transport.peer_id().to_string(),
                    };
                    sink.send(Message::Text(beat.encode().into()))
                        .await
                        .map_err(|e| SwarmError::Signaling(e.to_string()))?;
                    transport.alive_peers(); // prune on the same cadence
                }
                message = rx.next() => {
                    let Some(Ok(Message::Text(text))) = message else {
                        return Err(SwarmError::Signaling("socket closed".to_string()));
                    };
                    let Ok(message) = SignalMessage::decode(&text) else {
                        continue;
                    };
                    Self::handle_signal(config, transport, &mut sink, message).await;
                }
            }
        }
    }

    async fn handle_signal(
        _config: &SignalingConfig,
        transport: &Arc<SwarmTransport>,
        sink: &mut futures_util::stream::SplitSink<
            WebSocketStream<MaybeTlsStream<TcpStream>>,
            Message,
        >,
        message: SignalMessage,
    ) {
        match message {
            // Membership arrives as peer-joined messages. Exactly one side
            // dials: the peer with the greater id, so there is never a dial
            // race whichever order the server delivers notifications in.
            SignalMessage::PeerJoined {
                peer_id,
                endpoint,
                capabilities,
            } => {
                let already_connected = transport
                    .alive_peers()
                    .iter()
                    .any(|p| p.peer_id == peer_id);
                if already_connected || transport.peer_id() <= peer_id.as_str() {
                    return;
                }
                let info = PeerInfo {
                    peer_id: peer_id.clone(),
                    endpoint: endpoint.clone(),
                    capabilities,
                    last_seen: now_millis(),
                };
                match dial_peer(transport, info).await {
                    Ok(()) => {
                        let offer = SignalMessage::Offer {
                            from: transport.peer_id().to_string(),
                            to: peer_id,
                            endpoint: transport.config().endpoint.clone(),
                        };
                        let _ = sink.send(Message::Text(offer.encode().into())).await;
                    }
                    Err(e) => warn!(%peer_id, %e, "peer dial failed"),
                }
            }
            // The accepting side acknowledges the inbound channel.
            SignalMessage::Offer { from, to, .. } => {
                if to == transport.peer_id() {
                    let answer = SignalMessage::Answer {
                        from: transport.peer_id().to_string(),
                        to: from,
                        endpoint: transport.config().endpoint.clone(),
                    };
                    let _ = sink.send(Message::Text(answer.encode().into())).await;
                }
            }
            SignalMessage::Answer { from, .. } => {
                debug!(%from, "peer channel answered");
            }
            SignalMessage::IceCandidate { from, candidate, .. } => {
                // Alternate endpoints; useful once a primary dial fails.
                debug!(%from, %candidate, "ice candidate noted");
            }
            SignalMessage::PeerLeft { peer_id } => {
                transport.disconnect_peer(&peer_id);
            }
            SignalMessage::Announce { peer_id, .. } | SignalMessage::Heartbeat { peer_id } => {
                transport.touch_peer(&peer_id);
            }
            SignalMessage::Broadcast { .. }
            | SignalMessage::Join { .. }
            | SignalMessage::Leave { .. } => {}
        }
    }
}
