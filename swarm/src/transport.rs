//! The peer transport: envelope routing, LWW sync, delegation, consensus.
//!
//! The transport owns the peer table; stream-owning tasks push inbound text
//! into [`SwarmTransport::handle_incoming`] and everything else posts
//! commands through the public methods. Built-in message types are handled
//! here; unknown types fall through to registered handlers, then to a
//! default that logs and drops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::consensus::{ConsensusResult, ConsensusVoter, YesVoter, CONSENSUS_TIMEOUT};
use crate::delegate::{EchoExecutor, TaskExecutor, TaskSpec, DELEGATION_TIMEOUT};
use crate::envelope::{now_millis, Envelope};
use crate::peer::{PeerInfo, PeerLink, PEER_TTL};
use crate::sync::{LwwEntry, LwwMap};
use crate::SwarmError;

use reploid::bus::{topics, EventBus};

/// Message handler for non-built-in types.
pub type Handler = Arc<dyn Fn(&Envelope) + Send + Sync>;

#[derive(Clone, Debug)]
pub struct TransportConfig {
    pub peer_id: String,
    pub room: String,
    /// This peer's own channel endpoint, advertised through signaling.
    pub endpoint: String,
    pub capabilities: Vec<String>,
}

pub struct SwarmTransport {
    config: TransportConfig,
    peers: Mutex<HashMap<String, PeerInfo>>,
    links: Mutex<HashMap<String, Arc<dyn PeerLink>>>,
    handlers: Mutex<HashMap<String, Handler>>,
    /// Reply slots keyed by the full reply type (`task-complete-<id>`).
    pending: Mutex<HashMap<String, oneshot::Sender<Envelope>>>,
    /// Vote streams keyed by proposal id.
    pending_votes: Mutex<HashMap<String, mpsc::UnboundedSender<bool>>>,
    lww: Mutex<LwwMap>,
    clock: AtomicU64,
    executor: Mutex<Arc<dyn TaskExecutor>>,
    voter: Mutex<Arc<dyn ConsensusVoter>>,
    bus: Mutex<Option<Arc<EventBus>>>,
}

impl SwarmTransport {
    pub fn new(config: TransportConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            peers: Mutex::new(HashMap::new()),
            links: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            pending_votes: Mutex::new(HashMap::new()),
            lww: Mutex::new(LwwMap::new()),
            clock: AtomicU64::new(0),
            executor: Mutex::new(Arc::new(EchoExecutor)),
            voter: Mutex::new(Arc::new(YesVoter)),
            bus: Mutex::new(None),
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.config.peer_id
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Attaches the runtime bus; peer and sync events surface there.
    pub fn attach_bus(&self, bus: Arc<EventBus>) {
        *self.bus.lock().unwrap_or_else(|e| e.into_inner()) = Some(bus);
    }

    pub fn set_executor(&self, executor: Arc<dyn TaskExecutor>) {
        *self.executor.lock().unwrap_or_else(|e| e.into_inner()) = executor;
    }

    pub fn set_voter(&self, voter: Arc<dyn ConsensusVoter>) {
        *self.voter.lock().unwrap_or_else(|e| e.into_inner()) = voter;
    }

    pub fn register_handler(&self, msg_type: &str, handler: Handler) {
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(msg_type.to_string(), handler);
    }

    fn emit(&self, topic: &str, payload: Value) {
        if let Some(bus) = self.bus.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            bus.emit(topic, payload);
        }
    }

    // ---- peer table ---------------------------------------------------

    /// Registers an open channel to a peer and requests its state.
    pub async fn connect_peer(self: &Arc<Self>, info: PeerInfo, link: Arc<dyn PeerLink>) {
        let peer_id = info.peer_id.clone();
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(peer_id.clone(), info);
        self.links
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(peer_id.clone(), link);
        self.emit(topics::SWARM_PEER_JOINED, json!({ "peer": peer_id }));
        let _ = self.send_to(&peer_id, "sync-request", json!({})).await;
    }

    pub fn disconnect_peer(&self, peer_id: &str) {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(peer_id);
        self.links
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(peer_id);
        self.emit(topics::SWARM_PEER_LEFT, json!({ "peer": peer_id }));
    }

    pub fn touch_peer(&self, peer_id: &str) {
        if let Some(info) = self
            .peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(peer_id)
        {
            info.last_seen = now_millis();
        }
    }

    /// Drops peers unseen past the TTL; returns the survivors sorted by id.
    pub fn alive_peers(&self) -> Vec<PeerInfo> {
        let cutoff = now_millis().saturating_sub(PEER_TTL.as_millis() as u64);
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        let dead: Vec<String> = peers
            .values()
            .filter(|p| p.last_seen < cutoff)
            .map(|p| p.peer_id.clone())
            .collect();
        for id in &dead {
            peers.remove(id);
            self.links
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(id);
        }
        let mut alive: Vec<PeerInfo> = peers.values().cloned().collect();
        alive.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        alive
    }

    // ---- sending ------------------------------------------------------

    pub async fn send_to(
        &self,
        peer_id: &str,
        msg_type: &str,
        payload: Value,
    ) -> Result<(), SwarmError> {
        let link = self
            .links
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(peer_id)
            .cloned()
            .ok_or_else(|| SwarmError::Transport(format!("no link to {peer_id}")))?;
        let envelope = Envelope::new(msg_type, &self.config.peer_id, payload)?;
        link.send(envelope.encode()).await
    }

    /// Sends to every connected peer; returns how many sends went out. With
    /// zero peers this is 0 and a no-op.
    pub async fn broadcast(&self, msg_type: &str, payload: Value) -> usize {
        let links: Vec<(String, Arc<dyn PeerLink>)> = self
            .links
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(id, link)| (id.clone(), Arc::clone(link)))
            .collect();
        let Ok(envelope) = Envelope::new(msg_type, &self.config.peer_id, payload) else {
            return 0;
        };
        let text = envelope.encode();
        let mut sent = 0;
        for (peer_id, link) in links {
            match link.send(text.clone()).await {
                Ok(()) => sent += 1,
                Err(e) => warn!(%peer_id, %e, "broadcast send failed"),
            }
        }
        sent
    }

    // ---- LWW state ----------------------------------------------------

    /// Local state write: bumps the clock, merges locally, and pushes the
    /// entry to every peer.
    pub async fn set_state(&self, id: &str, value: Value) {
        let clock = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        let entry = LwwEntry {
            id: id.to_string(),
            value,
            clock,
            peer_id: self.config.peer_id.clone(),
        };
        self.lww
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .apply(entry.clone());
        self.broadcast("sync-state", json!({ "entries": [entry] }))
            .await;
    }

    pub fn state(&self) -> LwwMap {
        self.lww.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn merge_entries(&self, entries: &Value) -> usize {
        let Some(entries) = entries.as_array() else {
            return 0;
        };
        let mut merged = 0;
        let mut lww = self.lww.lock().unwrap_or_else(|e| e.into_inner());
        for entry in entries {
            if let Ok(entry) = serde_json::from_value::<LwwEntry>(entry.clone()) {
                // Local clock must stay ahead of anything observed, so later
                // local writes win over what they have seen.
                self.clock.fetch_max(entry.clock, Ordering::Relaxed);
                lww.apply(entry);
                merged += 1;
            }
        }
        merged
    }

    // ---- delegation ---------------------------------------------------

    /// Hands a task to the first capable peer (sorted by peer id). Fails
    /// with `NoCapablePeer` when nobody advertises a superset of the
    /// requirements, and `Timeout` after 60 s without `task-complete`.
    pub async fn delegate_task(&self, task: TaskSpec) -> Result<Value, SwarmError> {
        let candidate = self
            .alive_peers()
            .into_iter()
            .find(|p| {
                task.requirements
                    .iter()
                    .all(|r| p.capabilities.contains(r))
            })
            .ok_or(SwarmError::NoCapablePeer)?;

        let task_id = Uuid::new_v4().simple().to_string();
        let reply_type = format!("task-complete-{task_id}");
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(reply_type.clone(), tx);

        let payload = json!({ "id": task_id, "task": task });
        if let Err(e) = self
            .send_to(&candidate.peer_id, "task-delegation", payload)
            .await
        {
            self.pending
                .lock()
                .unwrap_or_else(|e2| e2.into_inner())
                .remove(&reply_type);
            return Err(e);
        }

        match tokio::time::timeout(DELEGATION_TIMEOUT, rx).await {
            Ok(Ok(envelope)) => Ok(envelope.payload),
            _ => {
                self.pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&reply_type);
                Err(SwarmError::Timeout)
            }
        }
    }

    // ---- consensus ----------------------------------------------------

    /// Broadcasts a proposal and resolves on a strict majority of
    /// known-alive peers including self.
    pub async fn propose(&self, proposal: Value) -> ConsensusResult {
        let voters = self.alive_peers().len() + 1;
        let threshold = voters / 2 + 1;

        let proposal_id = Uuid::new_v4().simple().to_string();
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.pending_votes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(proposal_id.clone(), tx);

        let own_vote = {
            let voter = self.voter.lock().unwrap_or_else(|e| e.into_inner()).clone();
            voter.vote(proposal.clone()).await
        };
        let mut yes = usize::from(own_vote);
        let mut received = 1;

        let sent = self
            .broadcast(
                "consensus-request",
                json!({ "id": proposal_id, "proposal": proposal }),
            )
            .await;

        let deadline = tokio::time::Instant::now() + CONSENSUS_TIMEOUT;
        let mut timed_out = false;
        while received < sent + 1 && yes < threshold {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(vote)) => {
                    received += 1;
                    if vote {
                        yes += 1;
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    timed_out = true;
                    break;
                }
            }
        }
        self.pending_votes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&proposal_id);

        ConsensusResult {
            consensus: yes >= threshold,
            yes,
            voters,
            timeout: timed_out,
        }
    }

    // ---- inbound ------------------------------------------------------

    /// Routes one inbound text frame from `from`. Malformed or
    /// version-mismatched envelopes are dropped here.
    pub async fn handle_incoming(self: &Arc<Self>, from: &str, text: &str) {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(%from, %e, "dropping envelope");
                return;
            }
        };
        self.touch_peer(from);

        match envelope.msg_type.as_str() {
            "ping" => {
                let _ = self.send_to(from, "pong", json!({})).await;
            }
            "pong" => {}
            "sync-request" => {
                let entries: Vec<LwwEntry> = self.state().entries().cloned().collect();
                let _ = self
                    .send_to(from, "sync-state", json!({ "entries": entries }))
                    .await;
            }
            "sync-state" => {
                let merged = self.merge_entries(&envelope.payload["entries"]);
                self.emit(
                    topics::SWARM_STATE_SYNCED,
                    json!({ "peer": from, "entries": merged }),
                );
            }
            "task-delegation" => {
                let task_id = envelope.payload["id"].as_str().unwrap_or_default().to_string();
                let task: TaskSpec = match serde_json::from_value(envelope.payload["task"].clone())
                {
                    Ok(task) => task,
                    Err(e) => {
                        warn!(%from, %e, "bad task-delegation payload");
                        return;
                    }
                };
                let executor = self
                    .executor
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone();
                let transport = Arc::clone(self);
                let from = from.to_string();
                tokio::spawn(async move {
                    let reply_type = format!("task-complete-{task_id}");
                    let payload = match executor.execute(task).await {
                        Ok(result) => json!({ "ok": true, "result": result }),
                        Err(error) => json!({ "ok": false, "error": error }),
                    };
                    let _ = transport.send_to(&from, &reply_type, payload).await;
                });
            }
            "consensus-request" => {
                let proposal_id = envelope.payload["id"].as_str().unwrap_or_default().to_string();
                let proposal = envelope.payload["proposal"].clone();
                let voter = self.voter.lock().unwrap_or_else(|e| e.into_inner()).clone();
                let transport = Arc::clone(self);
                let from = from.to_string();
                tokio::spawn(async move {
                    let vote = voter.vote(proposal).await;
                    let reply_type = format!("consensus-vote-{proposal_id}");
                    let _ = transport
                        .send_to(&from, &reply_type, json!({ "vote": vote }))
                        .await;
                });
            }
            reply if reply.starts_with("task-complete-") => {
                if let Some(tx) = self
                    .pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(reply)
                {
                    let _ = tx.send(envelope);
                } else {
                    debug!(%reply, "reply with no pending slot");
                }
            }
            reply if reply.starts_with("consensus-vote-") => {
                let proposal_id = reply.trim_start_matches("consensus-vote-");
                let vote = envelope.payload["vote"].as_bool().unwrap_or(false);
                if let Some(tx) = self
                    .pending_votes
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .get(proposal_id)
                {
                    let _ = tx.send(vote);
                }
            }
            other => {
                let handler = self
                    .handlers
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .get(other)
                    .cloned();
                match handler {
                    Some(handler) => handler(&envelope),
                    // Default handler: log and drop.
                    None => debug!(msg_type = %other, %from, "unhandled message type; dropping"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::ChannelLink;

    fn info(peer_id: &str, capabilities: &[&str]) -> PeerInfo {
        PeerInfo {
            peer_id: peer_id.to_string(),
            endpoint: format!("chan://{peer_id}"),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            last_seen: now_millis(),
        }
    }

    fn transport(peer_id: &str, capabilities: &[&str]) -> Arc<SwarmTransport> {
        SwarmTransport::new(TransportConfig {
            peer_id: peer_id.to_string(),
            room: "test".to_string(),
            endpoint: format!("chan://{peer_id}"),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
        })
    }

    /// Wires a ↔ b over in-process channels, pumping each inbox into the
    /// other transport.
    async fn connect(a: &Arc<SwarmTransport>, b: &Arc<SwarmTransport>) {
        let (link_to_b, mut inbox_b) = ChannelLink::pair();
        let (link_to_a, mut inbox_a) = ChannelLink::pair();

        let b_clone = Arc::clone(b);
        let a_id = a.peer_id().to_string();
        tokio::spawn(async move {
            while let Some(text) = inbox_b.recv().await {
                b_clone.handle_incoming(&a_id, &text).await;
            }
        });
        let a_clone = Arc::clone(a);
        let b_id = b.peer_id().to_string();
        tokio::spawn(async move {
            while let Some(text) = inbox_a.recv().await {
                a_clone.handle_incoming(&b_id, &text).await;
            }
        });

        a.connect_peer(
            info(b.peer_id(), &b.config().capabilities.iter().map(String::as_str).collect::<Vec<_>>()),
            Arc::new(link_to_b),
        )
        .await;
        b.connect_peer(
            info(a.peer_id(), &a.config().capabilities.iter().map(String::as_str).collect::<Vec<_>>()),
            Arc::new(link_to_a),
        )
        .await;
    }

    async fn settle() {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn broadcast_with_no_peers_is_a_noop() {
        let t = transport("solo", &[]);
        assert_eq!(t.broadcast("knowledge-share", json!({})).await, 0);
    }

    #[tokio::test]
    async fn delegate_with_no_capable_peer_fails() {
        let t = transport("solo", &[]);
        let err = t
            .delegate_task(TaskSpec {
                description: "d".to_string(),
                requirements: vec!["gpu".to_string()],
                payload: json!({}),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SwarmError::NoCapablePeer));
    }

    #[tokio::test]
    async fn concurrent_writes_converge_to_the_larger_peer_id() {
        let a = transport("a", &[]);
        let b = transport("b", &[]);
        // Both write key k at the same logical clock before syncing.
        a.set_state("k", json!("α")).await;
        b.set_state("k", json!("β")).await;
        connect(&a, &b).await;
        settle();

        let on_a = a.state().get("k").cloned().unwrap();
        let on_b = b.state().get("k").cloned().unwrap();
        assert_eq!(on_a.value, "β");
        assert_eq!(on_a, on_b);
        assert_eq!(on_a.peer_id, "b");
    }

    #[tokio::test]
    async fn delegation_round_trips_through_the_executor() {
        let a = transport("a", &[]);
        let b = transport("b", &["echo"]);
        connect(&a, &b).await;
        settle();

        let result = a
            .delegate_task(TaskSpec {
                description: "say hi".to_string(),
                requirements: vec!["echo".to_string()],
                payload: json!({}),
            })
            .await
            .unwrap();
        assert_eq!(result["ok"], true);
        assert_eq!(result["result"]["echo"], "say hi");
    }

    #[tokio::test]
    async fn consensus_reaches_majority_with_yes_voters() {
        let a = transport("a", &[]);
        let b = transport("b", &[]);
        connect(&a, &b).await;
        settle();

        let result = a.propose(json!({ "action": "upgrade" })).await;
        assert!(result.consensus);
        assert_eq!(result.voters, 2);
        assert_eq!(result.yes, 2);
        assert!(!result.timeout);
    }

    #[tokio::test]
    async fn no_voters_besides_self_still_resolves() {
        let t = transport("solo", &[]);
        let result = t.propose(json!({})).await;
        assert!(result.consensus);
        assert_eq!(result.voters, 1);
    }

    #[tokio::test]
    async fn unknown_types_hit_registered_handler_or_drop() {
        let a = transport("a", &[]);
        let b = transport("b", &[]);
        let seen = Arc::new(Mutex::new(0));
        {
            let seen = Arc::clone(&seen);
            b.register_handler(
                "knowledge-share",
                Arc::new(move |_| {
                    *seen.lock().unwrap() += 1;
                }),
            );
        }
        connect(&a, &b).await;
        settle();

        a.broadcast("knowledge-share", json!({ "fact": 1 })).await;
        a.broadcast("totally-unknown", json!({})).await;
        settle();
        assert_eq!(*seen.lock().unwrap(), 1);
    }
}
