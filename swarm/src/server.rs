//! The signaling coordination server (axum + ws).
//!
//! Rooms scope peer visibility: a join registers the peer, tells it who is
//! already there, and announces it to the room. Offers, answers, and ICE
//! candidates relay point-to-point; announces, broadcasts, and heartbeats
//! fan out to the room. A closed socket (or an explicit leave) prunes the
//! peer and notifies the room.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::signaling::SignalMessage;

struct PeerRecord {
    tx: mpsc::UnboundedSender<String>,
    endpoint: String,
    capabilities: Vec<String>,
}

#[derive(Default)]
struct ServerState {
    /// room → peer id → record
    rooms: Mutex<HashMap<String, HashMap<String, PeerRecord>>>,
}

impl ServerState {
    fn send_to(&self, room: &str, peer_id: &str, message: &SignalMessage) {
        let rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(record) = rooms.get(room).and_then(|peers| peers.get(peer_id)) {
            let _ = record.tx.send(message.encode());
        }
    }

    fn broadcast(&self, room: &str, except: &str, message: &SignalMessage) {
        let rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(peers) = rooms.get(room) {
            for (peer_id, record) in peers {
                if peer_id != except {
                    let _ = record.tx.send(message.encode());
                }
            }
        }
    }

    fn remove(&self, room: &str, peer_id: &str) {
        let mut rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(peers) = rooms.get_mut(room) {
            peers.remove(peer_id);
            if peers.is_empty() {
                rooms.remove(room);
            }
        }
    }
}

fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<ServerState>) {
    let (mut sink, mut rx) = socket.split();

    // First message must be a join.
    let (room, peer_id) = loop {
        let Some(Ok(message)) = rx.next().await else {
            return;
        };
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(message) = SignalMessage::decode(&text) else {
            continue;
        };
        let SignalMessage::Join {
            room,
            peer_id,
            endpoint,
            capabilities,
        } = message
        else {
            debug!("pre-join message ignored");
            continue;
        };

        let (tx, mut outbox) = mpsc::unbounded_channel::<String>();
        {
            let mut rooms = state.rooms.lock().unwrap_or_else(|e| e.into_inner());
            let peers = rooms.entry(room.clone()).or_default();

            // The newcomer learns the membership; the room learns the
            // newcomer.
            for (existing_id, record) in peers.iter() {
                let _ = tx.send(
                    SignalMessage::PeerJoined {
                        peer_id: existing_id.clone(),
                        endpoint: record.endpoint.clone(),
                        capabilities: record.capabilities.clone(),
                    }
                    .encode(),
                );
            }
            peers.insert(
                peer_id.clone(),
                PeerRecord {
                    tx,
                    endpoint: endpoint.clone(),
                    capabilities: capabilities.clone(),
                },
            );
        }
        state.broadcast(
            &room,
            &peer_id,
            &SignalMessage::PeerJoined {
                peer_id: peer_id.clone(),
                endpoint,
                capabilities,
            },
        );
        info!(%room, %peer_id, "peer joined");

        // Pump the outbox to the socket.
        tokio::spawn(async move {
            while let Some(text) = outbox.recv().await {
                if sink.send(Message::Text(text.into())).await.is_err() {
                    return;
                }
            }
        });
        break (room, peer_id);
    };

    while let Some(Ok(message)) = rx.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(message) = SignalMessage::decode(&text) else {
            continue;
        };
        match &message {
            SignalMessage::Offer { to, .. }
            | SignalMessage::Answer { to, .. }
            | SignalMessage::IceCandidate { to, .. } => {
                state.send_to(&room, to, &message);
            }
            SignalMessage::Announce { .. }
            | SignalMessage::Broadcast { .. }
            | SignalMessage::Heartbeat { .. } => {
                state.broadcast(&room, &peer_id, &message);
            }
            SignalMessage::Leave { .. } => break,
            _ => debug!("unexpected in-room message ignored"),
        }
    }

    state.remove(&room, &peer_id);
    state.broadcast(
        &room,
        &peer_id,
        &SignalMessage::PeerLeft {
            peer_id: peer_id.clone(),
        },
    );
    info!(%room, %peer_id, "peer left");
}

/// Runs the server on an existing listener. Tests bind to `127.0.0.1:0` and
/// pass the listener in.
pub async fn run_server_on_listener(
    listener: TcpListener,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = listener.local_addr()?;
    info!("signaling server listening on ws://{addr}/ws");
    let app = router(Arc::new(ServerState::default()));
    axum::serve(listener, app).await?;
    Ok(())
}

/// Binds and runs the server.
pub async fn run_server(addr: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    run_server_on_listener(listener).await
}
