//! Consensus types: strict-majority voting over known-alive peers.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How long a proposal collects votes before resolving as timed out.
pub const CONSENSUS_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of one proposal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub consensus: bool,
    pub yes: usize,
    pub voters: usize,
    pub timeout: bool,
}

/// How this peer votes on incoming proposals.
#[async_trait]
pub trait ConsensusVoter: Send + Sync {
    async fn vote(&self, proposal: Value) -> bool;
}

/// Approves everything; the default for cooperative meshes.
pub struct YesVoter;

#[async_trait]
impl ConsensusVoter for YesVoter {
    async fn vote(&self, _proposal: Value) -> bool {
        true
    }
}
