//! Well-known bus topics. Components emit and subscribe by these consts
//! rather than ad-hoc strings; replay mirrors any of them under
//! [`REPLAY_PREFIX`].

pub const VFS_UPDATED: &str = "vfs:updated";
pub const VFS_DELETED: &str = "vfs:deleted";

pub const STATE_UPDATED: &str = "state:updated";
pub const SESSION_CREATED: &str = "session:created";
pub const SESSION_ARCHIVED: &str = "session:archived";
pub const SESSION_REWIND: &str = "session:rewind";
pub const CHECKPOINT_CREATED: &str = "checkpoint:created";
pub const CHECKPOINT_RESTORED: &str = "checkpoint:restored";

pub const TOOL_START: &str = "tool:start";
pub const TOOL_COMPLETE: &str = "tool:complete";
pub const TOOL_ERROR: &str = "tool:error";
pub const TOOL_PROGRESS: &str = "tool:progress";

pub const MODULE_LOADED: &str = "module:loaded";
pub const MODULE_RELOADED: &str = "module:reloaded";
pub const MODULE_RELOAD_FAILED: &str = "module:reload-failed";

pub const LLM_REQUEST: &str = "llm:request";
pub const LLM_RESPONSE: &str = "llm:response";
pub const LLM_CHUNK: &str = "llm:chunk";

pub const CYCLE_START: &str = "agent:cycle-start";
pub const CYCLE_END: &str = "agent:cycle-end";
pub const CYCLE_PHASE: &str = "agent:phase";
pub const CONTEXT_READY: &str = "context:ready";
pub const PROPOSAL_READY: &str = "proposal:ready";
pub const PROPOSAL_APPROVED: &str = "proposal:approved";
pub const PROPOSAL_REJECTED: &str = "proposal:rejected";

pub const INFER_COMPLETE: &str = "cognition:symbolic:infer";
pub const POLICY_DENIED: &str = "policy:denied";
pub const APPROVAL_REQUIRED: &str = "approval:required";

pub const TELEMETRY_DROPPED: &str = "telemetry:dropped";
pub const SECURITY_VIOLATION: &str = "security:violation";

pub const SWARM_PEER_JOINED: &str = "swarm:peer-joined";
pub const SWARM_PEER_LEFT: &str = "swarm:peer-left";
pub const SWARM_STATE_SYNCED: &str = "swarm:state-synced";

pub const REPLAY_PREFIX: &str = "replay:";
pub const REPLAY_COMPLETED: &str = "replay:completed";

/// Mirrors a live topic into the replay namespace (`tool:start` →
/// `replay:tool:start`).
pub fn replay_topic(live: &str) -> String {
    format!("{REPLAY_PREFIX}{live}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_topic_prefixes_without_altering_the_live_name() {
        assert_eq!(replay_topic(TOOL_START), "replay:tool:start");
        assert_eq!(replay_topic("custom:evt"), "replay:custom:evt");
    }
}
