//! # REPLOID runtime core
//!
//! A self-modifying agent substrate: the cognitive cycle FSM, sandboxed tool
//! execution with a dynamic module substrate, and a multi-provider inference
//! gateway, bound together by a virtual file system, a typed event bus,
//! transactional state with checkpoints, an append-only telemetry timeline,
//! and a forward-chaining rule engine.
//!
//! ## Main modules
//!
//! - [`bus`]: [`EventBus`] — typed topic pub/sub with per-module unsubscribe
//!   and re-entrant emit queuing; topic consts in [`bus::topics`].
//! - [`vfs`]: [`Vfs`] — normalized-path artifact store (memory or SQLite),
//!   size caps, atomic replace, transient [`BlobStore`] handles.
//! - [`timeline`]: [`Timeline`] — date-partitioned JSONL event log with a
//!   recent-events ring; [`timeline::audit::AuditLogger`] layers typed
//!   security events with secret scrubbing on top.
//! - [`state`]: [`StateManager`] — `update_and_save` transactional state,
//!   sessions/turns, checkpoint ring with artifact-tree restore.
//! - [`knowledge`]: [`KnowledgeBase`] — triple store, bounded forward
//!   chaining, constraints, induction, and policy gates.
//! - [`tools`]: [`tools::ToolRegistry`] + [`tools::ToolRunner`] —
//!   schema-validated dispatch, read-only fan-out, per-session mutation
//!   queue, and the VFS-backed built-ins.
//! - [`sandbox`]: the isolation contract plus [`sandbox::ProcessSandbox`]
//!   (subprocess, kill-on-timeout) and [`sandbox::InProcessSandbox`].
//! - [`loader`]: [`loader::SubstrateLoader`] — declared-manifest modules in
//!   a generation-counted arena, hot reload with rollback, function patches.
//! - [`gateway`]: [`gateway::Gateway`] — one `generate()` over eight
//!   providers with streaming, retries, rate limiting, and cancellation;
//!   [`gateway::MockInference`] for deterministic tests.
//! - [`cycle`]: the agent FSM ([`cycle::spawn`], [`cycle::CycleHandle`]) and
//!   the changeset bundle format.
//! - [`replay`]: re-emits exported runs under `replay:` topics.
//! - [`runtime`]: [`Runtime`] — wires everything together from a
//!   [`config::RuntimeConfig`].

pub mod bus;
pub mod cycle;
pub mod gateway;
pub mod knowledge;
pub mod loader;
pub mod replay;
pub mod runtime;
pub mod sandbox;
pub mod state;
pub mod timeline;
pub mod tools;
pub mod vfs;

pub use bus::{BusEvent, EventBus, ModuleId, SubscriptionId};
pub use cycle::{CycleCommand, CycleConfig, CycleDeps, CycleHandle, Phase};
pub use gateway::{
    ChatMessage, Gateway, GenerateRequest, GenerateResult, InferenceClient, ProviderConfig,
    ProviderKind, Role, Usage,
};
pub use knowledge::{KnowledgeBase, Rule, Triple, TripleMeta, TriplePattern};
pub use runtime::{Runtime, RuntimeError};
pub use state::{AgentState, Checkpoint, Session, SessionManager, StateManager, Turn};
pub use timeline::{audit::AuditLogger, ExportedRun, Severity, Timeline, TimelineEvent};
pub use vfs::{Artifact, ArtifactType, BlobStore, MemoryVfs, SizeCaps, SqliteVfs, Vfs, VfsError};

/// When running `cargo test -p reploid`, initializes tracing from `RUST_LOG`
/// so unit tests can print logs with `--nocapture`.
#[cfg(test)]
mod test_logging {
    use ctor::ctor;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::Layer;

    #[ctor]
    fn init() {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_test_writer()
                    .with_filter(filter),
            )
            .try_init();
    }
}
