//! Substrate loader: code blobs from the VFS become live modules.
//!
//! Loaded modules live in an arena keyed by name with a global generation
//! counter; callers hold [`ModuleHandle`]s and resolve on each use, so a hot
//! reload is observed transparently by everyone. The reload pipeline swaps
//! the entry, bumps versions, and notifies subscribers with `(new, old)`;
//! any failure leaves the old entry in place and raises `HotReload`.
//! A watcher on `vfs:updated` auto-reloads modules whose source changed.
//!
//! Modules' `tool` exports register into the tool registry as dynamic tools
//! executed through the sandbox.

mod dynamic;
mod manifest;

pub use dynamic::DynamicTool;
pub use manifest::{parse_module_source, ExportDecl, ExportKind, ModuleManifest};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crate::bus::{topics, EventBus};
use crate::sandbox::Sandbox;
use crate::tools::ToolRegistry;
use crate::vfs::{BlobHandle, BlobStore, Vfs, VfsError};

/// Where dynamic module sources live in the VFS.
pub const MODULE_DIR: &str = "/modules";

/// Canonical source path for a module name.
pub fn module_source_path(name: &str) -> String {
    format!("{MODULE_DIR}/{name}.mod")
}

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("manifest: {0}")]
    Manifest(String),
    #[error("unknown module: {0}")]
    UnknownModule(String),
    #[error("unknown export: {module}:{export}")]
    UnknownExport { module: String, export: String },
    #[error("hot reload failed: {0}")]
    HotReload(String),
    #[error("storage: {0}")]
    Storage(#[from] VfsError),
}

/// One loaded module.
#[derive(Clone, Debug)]
pub struct ModuleEntry {
    pub manifest: ModuleManifest,
    pub body: Arc<str>,
    /// Bumped on each reload of this module.
    pub version: u64,
    /// Global load ordinal; stale handles compare against it.
    pub generation: u64,
}

/// Callback invoked on load/reload with `(new, old)`.
pub type ReloadSubscriber = Arc<dyn Fn(&ModuleEntry, Option<&ModuleEntry>) + Send + Sync>;

/// The module arena.
pub struct SubstrateLoader {
    vfs: Arc<Vfs>,
    bus: Arc<EventBus>,
    blobs: BlobStore,
    arena: DashMap<String, Arc<ModuleEntry>>,
    generation: AtomicU64,
    subscribers: Mutex<Vec<ReloadSubscriber>>,
    /// (module, export) → (patched body, original body).
    patches: DashMap<(String, String), (Arc<str>, Arc<str>)>,
    tool_target: Mutex<Option<ToolTarget>>,
}

struct ToolTarget {
    registry: Arc<ToolRegistry>,
    sandbox: Arc<dyn Sandbox>,
    budget: Duration,
}

impl SubstrateLoader {
    pub fn new(vfs: Arc<Vfs>, bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            vfs,
            bus,
            blobs: BlobStore::new(),
            arena: DashMap::new(),
            generation: AtomicU64::new(1),
            subscribers: Mutex::new(Vec::new()),
            patches: DashMap::new(),
            tool_target: Mutex::new(None),
        })
    }

    /// Registers the registry + sandbox that receive dynamic tool exports.
    pub fn attach_tool_registry(
        &self,
        registry: Arc<ToolRegistry>,
        sandbox: Arc<dyn Sandbox>,
        budget: Duration,
    ) {
        *self.tool_target.lock().unwrap_or_else(|e| e.into_inner()) = Some(ToolTarget {
            registry,
            sandbox,
            budget,
        });
    }

    /// Called after construction: auto-reload modules when their VFS source
    /// changes.
    pub fn watch(self: &Arc<Self>) {
        let loader = Arc::clone(self);
        self.bus.on(topics::VFS_UPDATED, "substrate-loader", move |event| {
            let Some(path) = event.payload["path"].as_str() else {
                return Ok(());
            };
            if !path.starts_with(MODULE_DIR) || !path.ends_with(".mod") {
                return Ok(());
            }
            if let Err(err) = loader.load_from_vfs(path) {
                warn!(%path, %err, "module auto-reload failed");
            }
            Ok(())
        });
    }

    /// Loads (or reloads) a module from its VFS source.
    pub fn load_from_vfs(self: &Arc<Self>, path: &str) -> Result<Arc<ModuleEntry>, LoaderError> {
        let artifact = self.vfs.read(path)?;
        self.load_source(&artifact.content)
    }

    /// Loads a module from a transient blob; the handle is released as soon
    /// as the module is materialized so the source never leaks.
    pub fn load_from_blob(
        self: &Arc<Self>,
        handle: &BlobHandle,
    ) -> Result<Arc<ModuleEntry>, LoaderError> {
        let source = self
            .blobs
            .read(handle)
            .ok_or_else(|| LoaderError::UnknownModule(format!("blob {}", handle.id())))?;
        let result = self.load_source(&source);
        self.blobs.release(handle);
        result
    }

    /// Blob registry for transient sources.
    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    fn load_source(self: &Arc<Self>, source: &str) -> Result<Arc<ModuleEntry>, LoaderError> {
        let (manifest, body) = parse_module_source(source)?;
        let name = manifest.name.clone();
        let old = self.arena.get(&name).map(|e| Arc::clone(e.value()));

        let entry = Arc::new(ModuleEntry {
            manifest,
            body: Arc::from(body.as_str()),
            version: old.as_ref().map_or(1, |o| o.version + 1),
            generation: self.generation.fetch_add(1, Ordering::Relaxed),
        });

        self.arena.insert(name.clone(), Arc::clone(&entry));
        // A reload invalidates any function patches against the old body.
        self.patches.retain(|(module, _), _| module != &name);
        self.register_tool_exports(&entry);

        let subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for subscriber in subscribers {
            subscriber(&entry, old.as_deref());
        }

        let topic = if old.is_some() {
            topics::MODULE_RELOADED
        } else {
            topics::MODULE_LOADED
        };
        self.bus.emit(
            topic,
            json!({ "module": name, "version": entry.version, "generation": entry.generation }),
        );
        info!(module = %name, version = entry.version, "module loaded");
        Ok(entry)
    }

    /// The hot-reload pipeline with rollback: on any failure the old entry
    /// stays current and the error surfaces as `HotReload`.
    pub fn reload(self: &Arc<Self>, name: &str, new_source: &str) -> Result<Arc<ModuleEntry>, LoaderError> {
        let old = self
            .arena
            .get(name)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| LoaderError::UnknownModule(name.to_string()))?;

        match self.load_source(new_source) {
            Ok(entry) if entry.manifest.name == name => Ok(entry),
            Ok(entry) => {
                // The new source renamed the module; put the old one back.
                self.arena.insert(name.to_string(), Arc::clone(&old));
                self.arena.remove(&entry.manifest.name);
                self.emit_reload_failed(name, "manifest renamed the module");
                Err(LoaderError::HotReload(format!(
                    "source declares '{}' but '{}' was expected",
                    entry.manifest.name, name
                )))
            }
            Err(err) => {
                self.emit_reload_failed(name, &err.to_string());
                Err(LoaderError::HotReload(err.to_string()))
            }
        }
    }

    fn emit_reload_failed(&self, name: &str, error: &str) {
        self.bus.emit(
            topics::MODULE_RELOAD_FAILED,
            json!({ "module": name, "error": error }),
        );
    }

    /// Subscribes to load/reload notifications `(new, old)`.
    pub fn subscribe(&self, subscriber: ReloadSubscriber) {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(subscriber);
    }

    /// A handle that resolves the latest generation on each use.
    pub fn handle(self: &Arc<Self>, name: &str) -> ModuleHandle {
        ModuleHandle {
            loader: Arc::clone(self),
            name: name.to_string(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<ModuleEntry>> {
        self.arena.get(name).map(|e| Arc::clone(e.value()))
    }

    /// Replaces one export's implementation, keeping the original for
    /// rollback. The patch applies until rollback or the next reload.
    pub fn patch_function(
        &self,
        module: &str,
        export: &str,
        replacement: &str,
    ) -> Result<(), LoaderError> {
        let entry = self
            .get(module)
            .ok_or_else(|| LoaderError::UnknownModule(module.to_string()))?;
        if entry.manifest.export(export).is_none() {
            return Err(LoaderError::UnknownExport {
                module: module.to_string(),
                export: export.to_string(),
            });
        }
        let key = (module.to_string(), export.to_string());
        let original = self
            .patches
            .get(&key)
            .map(|p| Arc::clone(&p.value().1))
            .unwrap_or_else(|| Arc::clone(&entry.body));
        self.patches.insert(key, (Arc::from(replacement), original));
        Ok(())
    }

    /// Restores the original implementation of a patched export.
    pub fn rollback_patch(&self, module: &str, export: &str) -> bool {
        self.patches
            .remove(&(module.to_string(), export.to_string()))
            .is_some()
    }

    /// The body to execute for an export: the patch when one is active,
    /// otherwise the module body.
    pub fn resolve_export_body(&self, module: &str, export: &str) -> Result<Arc<str>, LoaderError> {
        if let Some(patch) = self.patches.get(&(module.to_string(), export.to_string())) {
            return Ok(Arc::clone(&patch.value().0));
        }
        let entry = self
            .get(module)
            .ok_or_else(|| LoaderError::UnknownModule(module.to_string()))?;
        if entry.manifest.export(export).is_none() {
            return Err(LoaderError::UnknownExport {
                module: module.to_string(),
                export: export.to_string(),
            });
        }
        Ok(Arc::clone(&entry.body))
    }

    fn register_tool_exports(self: &Arc<Self>, entry: &ModuleEntry) {
        let target = self.tool_target.lock().unwrap_or_else(|e| e.into_inner());
        let Some(target) = target.as_ref() else {
            return;
        };
        for export in entry.manifest.tool_exports() {
            target.registry.register(Arc::new(DynamicTool::new(
                Arc::clone(self),
                entry.manifest.name.clone(),
                export.clone(),
                Arc::clone(&target.sandbox),
                target.budget,
            )));
        }
    }
}

/// Resolves against the latest registry entry on every use; stale handles
/// see new generations transparently.
#[derive(Clone)]
pub struct ModuleHandle {
    loader: Arc<SubstrateLoader>,
    name: String,
}

impl ModuleHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn resolve(&self) -> Option<Arc<ModuleEntry>> {
        self.loader.get(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::WriteOptions;

    const V1: &str = "---\nname: calc\nversion: 1\nexports:\n  - name: add\n    kind: tool\n---\nadd v1";
    const V2: &str = "---\nname: calc\nversion: 2\nexports:\n  - name: add\n    kind: tool\n---\nadd v2";

    fn loader() -> (Arc<SubstrateLoader>, Arc<Vfs>, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        let vfs = Arc::new(Vfs::in_memory(Arc::clone(&bus)));
        (
            SubstrateLoader::new(Arc::clone(&vfs), Arc::clone(&bus)),
            vfs,
            bus,
        )
    }

    #[test]
    fn load_then_reload_bumps_version_and_handles_stay_fresh() {
        let (loader, vfs, _) = loader();
        vfs.write(&module_source_path("calc"), V1, WriteOptions::code())
            .unwrap();
        loader.load_from_vfs(&module_source_path("calc")).unwrap();

        let handle = loader.handle("calc");
        assert_eq!(handle.resolve().unwrap().version, 1);

        loader.reload("calc", V2).unwrap();
        let entry = handle.resolve().unwrap();
        assert_eq!(entry.version, 2);
        assert_eq!(&*entry.body, "add v2");
    }

    #[test]
    fn failed_reload_keeps_the_old_module() {
        let (loader, _, bus) = loader();
        let failed = Arc::new(Mutex::new(false));
        {
            let failed = Arc::clone(&failed);
            bus.on(topics::MODULE_RELOAD_FAILED, "test", move |_| {
                *failed.lock().unwrap() = true;
                Ok(())
            });
        }
        let blob = loader.blobs().create(V1);
        loader.load_from_blob(&blob).unwrap();

        let err = loader.reload("calc", "not a module").unwrap_err();
        assert!(matches!(err, LoaderError::HotReload(_)));
        assert_eq!(&*loader.get("calc").unwrap().body, "add v1");
        assert!(*failed.lock().unwrap());
    }

    #[test]
    fn blob_is_released_after_load() {
        let (loader, _, _) = loader();
        let blob = loader.blobs().create(V1);
        loader.load_from_blob(&blob).unwrap();
        assert!(loader.blobs().is_empty());
    }

    #[test]
    fn subscribers_see_new_and_old() {
        let (loader, _, _) = loader();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            loader.subscribe(Arc::new(move |new, old| {
                seen.lock()
                    .unwrap()
                    .push((new.version, old.map(|o| o.version)));
            }));
        }
        let blob = loader.blobs().create(V1);
        loader.load_from_blob(&blob).unwrap();
        loader.reload("calc", V2).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![(1, None), (2, Some(1))]);
    }

    #[test]
    fn watch_auto_reloads_on_vfs_update() {
        let (loader, vfs, _) = loader();
        loader.watch();
        vfs.write(&module_source_path("calc"), V1, WriteOptions::code())
            .unwrap();
        assert_eq!(loader.get("calc").unwrap().version, 1);
        vfs.write(&module_source_path("calc"), V2, WriteOptions::code())
            .unwrap();
        assert_eq!(loader.get("calc").unwrap().version, 2);
    }

    #[test]
    fn patch_and_rollback() {
        let (loader, _, _) = loader();
        let blob = loader.blobs().create(V1);
        loader.load_from_blob(&blob).unwrap();

        loader.patch_function("calc", "add", "patched body").unwrap();
        assert_eq!(&*loader.resolve_export_body("calc", "add").unwrap(), "patched body");

        assert!(loader.rollback_patch("calc", "add"));
        assert_eq!(&*loader.resolve_export_body("calc", "add").unwrap(), "add v1");
        assert!(!loader.rollback_patch("calc", "add"));
    }

    #[test]
    fn reload_clears_patches() {
        let (loader, _, _) = loader();
        let blob = loader.blobs().create(V1);
        loader.load_from_blob(&blob).unwrap();
        loader.patch_function("calc", "add", "patched").unwrap();
        loader.reload("calc", V2).unwrap();
        assert_eq!(&*loader.resolve_export_body("calc", "add").unwrap(), "add v2");
    }

    #[test]
    fn unknown_export_patch_is_rejected() {
        let (loader, _, _) = loader();
        let blob = loader.blobs().create(V1);
        loader.load_from_blob(&blob).unwrap();
        assert!(matches!(
            loader.patch_function("calc", "nope", "x"),
            Err(LoaderError::UnknownExport { .. })
        ));
    }
}
