//! Runtime assembly: constructs every component from a
//! [`config::RuntimeConfig`] and wires the bus into the timeline and audit
//! trail. Nothing here is policy; it is the dependency-injection seam the
//! rest of the crate is written against.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use crate::bus::{topics, EventBus};
use crate::cycle::{self, CycleConfig, CycleDeps, CycleHandle};
use crate::gateway::{Gateway, ProviderConfig, ProviderKind};
use crate::knowledge::{KnowledgeBase, KnowledgeError};
use crate::loader::SubstrateLoader;
use crate::sandbox::{ProcessSandbox, Sandbox, SandboxCommand, SandboxShim};
use crate::state::{SessionManager, StateError, StateManager};
use crate::timeline::audit::{self, AuditLogger};
use crate::timeline::{RecordOptions, Severity, Timeline};
use crate::tools::builtin::register_builtins;
use crate::tools::{ToolRegistry, ToolRunner};
use crate::vfs::{MemoryVfs, SizeCaps, SqliteVfs, Vfs, VfsError};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("storage: {0}")]
    Storage(#[from] VfsError),
    #[error("state: {0}")]
    State(#[from] StateError),
    #[error("knowledge: {0}")]
    Knowledge(#[from] KnowledgeError),
}

/// Topics mirrored into the timeline.
const BRIDGED_TOPICS: &[&str] = &[
    topics::CYCLE_START,
    topics::CYCLE_END,
    topics::CYCLE_PHASE,
    topics::LLM_REQUEST,
    topics::LLM_RESPONSE,
    topics::CONTEXT_READY,
    topics::PROPOSAL_READY,
    topics::PROPOSAL_APPROVED,
    topics::PROPOSAL_REJECTED,
    topics::TOOL_START,
    topics::TOOL_COMPLETE,
    topics::TOOL_ERROR,
    topics::VFS_UPDATED,
    topics::VFS_DELETED,
    topics::SESSION_CREATED,
    topics::SESSION_ARCHIVED,
    topics::SESSION_REWIND,
    topics::CHECKPOINT_CREATED,
    topics::CHECKPOINT_RESTORED,
    topics::MODULE_LOADED,
    topics::MODULE_RELOADED,
    topics::MODULE_RELOAD_FAILED,
    topics::INFER_COMPLETE,
    topics::POLICY_DENIED,
    topics::APPROVAL_REQUIRED,
];

/// The assembled runtime core.
pub struct Runtime {
    pub bus: Arc<EventBus>,
    pub vfs: Arc<Vfs>,
    pub timeline: Arc<Timeline>,
    pub audit: Arc<AuditLogger>,
    pub state: Arc<StateManager>,
    pub sessions: Arc<SessionManager>,
    pub knowledge: Arc<KnowledgeBase>,
    pub registry: Arc<ToolRegistry>,
    pub runner: Arc<ToolRunner>,
    pub loader: Arc<SubstrateLoader>,
    pub gateway: Arc<Gateway>,
}

impl Runtime {
    /// Builds and wires the whole core from configuration.
    pub fn from_config(config: &config::RuntimeConfig) -> Result<Self, RuntimeError> {
        let bus = Arc::new(EventBus::new());

        let caps = SizeCaps {
            code: config.code_size_cap,
            document: config.document_size_cap,
            ..SizeCaps::default()
        };
        let vfs: Arc<Vfs> = match &config.vfs_db_path {
            Some(path) => Arc::new(Vfs::new(
                Box::new(SqliteVfs::new(path)?),
                caps,
                Arc::clone(&bus),
            )),
            None => Arc::new(Vfs::new(
                Box::new(MemoryVfs::new()),
                caps,
                Arc::clone(&bus),
            )),
        };

        let timeline = Arc::new(Timeline::new(Arc::clone(&vfs)));
        let audit = Arc::new(AuditLogger::new(Arc::clone(&timeline), Arc::clone(&vfs)));
        audit.install_as_error_sink(&bus);
        bridge_timeline(&bus, &timeline);
        bridge_audit(&bus, &audit);

        let state = Arc::new(StateManager::with_ring_size(
            Arc::clone(&vfs),
            Arc::clone(&bus),
            config.checkpoint_ring_size,
        ));
        state.load()?;
        let sessions = Arc::new(SessionManager::new(Arc::clone(&state)));

        let knowledge = Arc::new(KnowledgeBase::new(Arc::clone(&vfs), Arc::clone(&bus)));
        knowledge.load()?;

        let registry = Arc::new(ToolRegistry::new());
        register_builtins(&registry, None);
        let runner = ToolRunner::new(
            Arc::clone(&registry),
            Arc::clone(&vfs),
            Arc::clone(&state),
            Arc::clone(&knowledge),
            Arc::clone(&bus),
        );

        let loader = SubstrateLoader::new(Arc::clone(&vfs), Arc::clone(&bus));
        let shim = Arc::new(SandboxShim::new(
            Arc::clone(&vfs),
            Arc::clone(&state),
            Arc::clone(&bus),
        ));
        let sandbox: Arc<dyn Sandbox> = Arc::new(ProcessSandbox::new(
            SandboxCommand {
                program: config.sandbox_program.clone(),
                args: config.sandbox_args.clone(),
            },
            shim,
        ));
        loader.attach_tool_registry(
            Arc::clone(&registry),
            sandbox,
            Duration::from_millis(config.sandbox_timeout_ms),
        );
        loader.watch();

        let gateway = Arc::new(Gateway::new());
        for provider in &config.providers {
            if let Some(kind) = ProviderKind::parse(&provider.name) {
                let mut pc = ProviderConfig::new(kind, provider.api_key.clone());
                if let Some(base_url) = &provider.base_url {
                    pc = pc.with_base_url(base_url);
                }
                gateway.set_provider(pc);
            }
        }

        ensure_genesis(&vfs)?;

        // The summary is credential-free by construction.
        info!(config = %config.summary(), "runtime assembled");
        Ok(Self {
            bus,
            vfs,
            timeline,
            audit,
            state,
            sessions,
            knowledge,
            registry,
            runner,
            loader,
            gateway,
        })
    }

    /// Spawns the cognitive cycle against this runtime's components.
    pub fn spawn_cycle(&self, config: CycleConfig) -> CycleHandle {
        cycle::spawn(
            CycleDeps {
                bus: Arc::clone(&self.bus),
                vfs: Arc::clone(&self.vfs),
                state: Arc::clone(&self.state),
                sessions: Arc::clone(&self.sessions),
                knowledge: Arc::clone(&self.knowledge),
                registry: Arc::clone(&self.registry),
                runner: Arc::clone(&self.runner),
                inference: Arc::clone(&self.gateway) as Arc<dyn crate::gateway::InferenceClient>,
            },
            config,
        )
    }
}

/// Genesis manifest path: the immutable first-boot snapshot.
pub const GENESIS_MANIFEST: &str = "/genesis/manifest.json";

/// Writes the first-boot snapshot once; later boots leave it untouched.
/// Immutability of `/genesis` itself is enforced by the deny policy a
/// deployment installs over that prefix.
fn ensure_genesis(vfs: &Arc<Vfs>) -> Result<(), VfsError> {
    if vfs.exists(GENESIS_MANIFEST)? {
        return Ok(());
    }
    let manifest = serde_json::json!({
        "created": crate::vfs::now_millis(),
        "paths": vfs.list("/")?,
    });
    vfs.write(
        GENESIS_MANIFEST,
        &manifest.to_string(),
        crate::vfs::WriteOptions::config(),
    )?;
    Ok(())
}

/// Mirrors the well-known topics into the timeline. The timeline's own
/// partition writes are filtered out so recording never feeds itself.
pub fn bridge_timeline(bus: &Arc<EventBus>, timeline: &Arc<Timeline>) {
    for topic in BRIDGED_TOPICS {
        let timeline = Arc::clone(timeline);
        bus.on(topic, "timeline-bridge", move |event| {
            if matches!(event.topic.as_str(), topics::VFS_UPDATED | topics::VFS_DELETED) {
                if let Some(path) = event.payload["path"].as_str() {
                    if path.starts_with("/.logs") || path.starts_with("/.audit") {
                        return Ok(());
                    }
                }
            }
            let severity = if event.topic.ends_with(":error")
                || event.topic == topics::MODULE_RELOAD_FAILED
                || event.topic == topics::POLICY_DENIED
            {
                Severity::Warn
            } else {
                Severity::Info
            };
            timeline.record(
                &event.topic,
                event.payload.clone(),
                RecordOptions::severity(severity),
            );
            Ok(())
        });
    }
}

/// Routes security-relevant topics through the audit logger.
fn bridge_audit(bus: &Arc<EventBus>, audit_logger: &Arc<AuditLogger>) {
    let audit_clone = Arc::clone(audit_logger);
    bus.on(topics::SECURITY_VIOLATION, "audit-bridge", move |event| {
        audit_clone.log(audit::events::SECURITY_VIOLATION, event.payload.clone());
        Ok(())
    });
    let audit_clone = Arc::clone(audit_logger);
    bus.on(topics::VFS_DELETED, "audit-bridge", move |event| {
        if let Some(path) = event.payload["path"].as_str() {
            if !path.starts_with("/.") {
                audit_clone.log(audit::events::VFS_DELETE, event.payload.clone());
            }
        }
        Ok(())
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_assembles_from_default_config() {
        let config = config::RuntimeConfig::default();
        let runtime = Runtime::from_config(&config).unwrap();
        assert!(runtime.registry.len() > 20, "builtins registered");
    }

    #[test]
    fn bridged_events_land_in_the_timeline_without_feedback() {
        let config = config::RuntimeConfig::default();
        let runtime = Runtime::from_config(&config).unwrap();
        runtime
            .vfs
            .write("/a", "x", crate::vfs::WriteOptions::default())
            .unwrap();
        let recent = runtime.timeline.recent(50);
        // The user write is recorded once; the timeline's own partition
        // writes never feed back.
        let for_a = recent
            .iter()
            .filter(|e| e.event_type == topics::VFS_UPDATED && e.payload["path"] == "/a")
            .count();
        assert_eq!(for_a, 1);
        assert!(recent.iter().all(|e| {
            e.payload["path"]
                .as_str()
                .map(|p| !p.starts_with("/.logs"))
                .unwrap_or(true)
        }));
    }
}
