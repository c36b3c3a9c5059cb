//! Peers and peer links.
//!
//! A [`PeerLink`] is the outbound half of any reliable bidirectional stream;
//! inbound traffic is pushed into the transport by whatever task owns the
//! stream. [`ChannelLink`] pairs two in-process transports over tokio
//! channels — the test fabric, and the degenerate single-host mesh.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::SwarmError;

/// Heartbeat cadence.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Peers unseen for this long are pruned.
pub const PEER_TTL: Duration = Duration::from_secs(60);

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: String,
    /// Direct endpoint for peer channels (`ws://…`).
    pub endpoint: String,
    pub capabilities: Vec<String>,
    /// Milliseconds since the epoch of the last message or heartbeat.
    pub last_seen: u64,
}

/// Outbound half of a peer channel.
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn send(&self, text: String) -> Result<(), SwarmError>;
}

/// In-process link over a tokio channel.
pub struct ChannelLink {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelLink {
    /// A link plus the receiving end the remote side drains.
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl PeerLink for ChannelLink {
    async fn send(&self, text: String) -> Result<(), SwarmError> {
        self.tx
            .send(text)
            .map_err(|_| SwarmError::Transport("peer channel closed".to_string()))
    }
}
