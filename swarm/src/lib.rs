//! Peer federation: WebSocket signaling, direct peer channels, LWW state
//! sync, task delegation, and consensus.
//!
//! The signaling server ([`server`]) relays room-scoped rendezvous messages
//! (`join`/`offer`/`answer`/`ice-candidate`/…); peers then talk over any
//! reliable bidirectional stream — here a direct WebSocket, negotiated by
//! exchanging listen endpoints through the offer/answer dance. Everything on
//! a peer channel is a protocol-versioned JSON [`Envelope`] with a 64 KiB
//! payload cap.
//!
//! State reconciliation is last-writer-wins: higher clock wins, ties break
//! to the lexicographically larger peer id, which makes merge commutative,
//! associative, and idempotent across the mesh.

mod consensus;
mod delegate;
mod envelope;
mod peer;
pub mod server;
pub mod signaling;
mod sync;
mod transport;
mod worker;

pub use consensus::{ConsensusResult, ConsensusVoter, YesVoter, CONSENSUS_TIMEOUT};
pub use delegate::{TaskExecutor, TaskSpec, DELEGATION_TIMEOUT};
pub use envelope::{Envelope, MAX_PAYLOAD, PROTOCOL_VERSION};
pub use peer::{ChannelLink, PeerInfo, PeerLink, HEARTBEAT_INTERVAL, PEER_TTL};
pub use server::{run_server, run_server_on_listener};
pub use signaling::{
    dial_peer, serve_peer_listener, start_peer_listener, SignalMessage, SignalingClient,
    SignalingConfig,
};
pub use sync::{LwwEntry, LwwMap};
pub use transport::{Handler, SwarmTransport, TransportConfig};
pub use worker::SwarmWorkerSpawner;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SwarmError {
    #[error("protocol version mismatch: {0}")]
    VersionMismatch(u32),
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("no capable peer")]
    NoCapablePeer,
    #[error("timed out")]
    Timeout,
    #[error("transport: {0}")]
    Transport(String),
    #[error("signaling: {0}")]
    Signaling(String),
}
