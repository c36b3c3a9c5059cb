//! Content-addressed artifact store: normalized path → artifact, with
//! per-type size caps and atomic replace.
//!
//! The [`Vfs`] service wraps a [`VfsBackend`] (in-memory or SQLite), validates
//! sizes, normalizes paths, and emits `vfs:updated` / `vfs:deleted` on the bus.
//! Artifact bytes are owned here exclusively; the state manager layers the
//! session/checkpoint model on top.

mod blob;
mod memory;
pub mod path;
mod sqlite;

pub use blob::{BlobHandle, BlobStore};
pub use memory::MemoryVfs;
pub use sqlite::SqliteVfs;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::bus::{topics, EventBus};

/// Errors from VFS operations.
#[derive(Debug, Error)]
pub enum VfsError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("too large: {path} is {size} bytes (cap {cap})")]
    TooLarge { path: String, size: usize, cap: usize },
    #[error("storage: {0}")]
    Storage(String),
}

/// Symbolic artifact kind; drives the size cap.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactType {
    Code,
    #[default]
    Document,
    Config,
}

/// Per-type write size caps, in bytes.
#[derive(Clone, Copy, Debug)]
pub struct SizeCaps {
    pub code: usize,
    pub document: usize,
    pub config: usize,
}

impl Default for SizeCaps {
    fn default() -> Self {
        Self {
            code: 1024 * 1024,
            document: 5 * 1024 * 1024,
            config: 1024 * 1024,
        }
    }
}

impl SizeCaps {
    pub fn cap_for(&self, kind: ArtifactType) -> usize {
        match kind {
            ArtifactType::Code => self.code,
            ArtifactType::Document => self.document,
            ArtifactType::Config => self.config,
        }
    }
}

/// One VFS entry. The stable identifier is the (canonical) path.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Artifact {
    pub path: String,
    pub content: String,
    pub artifact_type: ArtifactType,
    pub size: usize,
    /// Monotonic milliseconds of the last write.
    pub updated: u64,
}

/// Metadata view returned by `stat`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArtifactStat {
    pub path: String,
    pub artifact_type: ArtifactType,
    pub size: usize,
    pub updated: u64,
}

/// Options for a write.
#[derive(Clone, Copy, Debug, Default)]
pub struct WriteOptions {
    pub artifact_type: ArtifactType,
}

impl WriteOptions {
    pub fn code() -> Self {
        Self {
            artifact_type: ArtifactType::Code,
        }
    }
    pub fn config() -> Self {
        Self {
            artifact_type: ArtifactType::Config,
        }
    }
}

/// Storage backend contract. `put` must be atomic: a concurrent reader sees
/// either the old artifact or the new one, never a torn write.
pub trait VfsBackend: Send + Sync {
    fn get(&self, path: &str) -> Result<Option<Artifact>, VfsError>;
    fn put(&self, artifact: Artifact) -> Result<(), VfsError>;
    fn remove(&self, path: &str) -> Result<bool, VfsError>;
    /// All canonical paths under `prefix`, sorted.
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, VfsError>;
    fn clear(&self) -> Result<(), VfsError>;
}

/// The artifact store service.
pub struct Vfs {
    backend: Box<dyn VfsBackend>,
    caps: SizeCaps,
    bus: Arc<EventBus>,
}

impl Vfs {
    pub fn new(backend: Box<dyn VfsBackend>, caps: SizeCaps, bus: Arc<EventBus>) -> Self {
        Self { backend, caps, bus }
    }

    /// In-memory VFS with default caps; the usual choice in tests.
    pub fn in_memory(bus: Arc<EventBus>) -> Self {
        Self::new(Box::new(MemoryVfs::new()), SizeCaps::default(), bus)
    }

    /// Validates the size cap, then atomically replaces the artifact at
    /// `path`. A failed write leaves any prior content intact.
    pub fn write(&self, path: &str, content: &str, opts: WriteOptions) -> Result<Artifact, VfsError> {
        let path = path::normalize(path)?;
        let size = content.len();
        let cap = self.caps.cap_for(opts.artifact_type);
        if size > cap {
            return Err(VfsError::TooLarge { path, size, cap });
        }
        let artifact = Artifact {
            path: path.clone(),
            content: content.to_string(),
            artifact_type: opts.artifact_type,
            size,
            updated: now_millis(),
        };
        self.backend.put(artifact.clone())?;
        self.bus.emit(
            topics::VFS_UPDATED,
            json!({ "path": path, "size": size, "type": opts.artifact_type }),
        );
        Ok(artifact)
    }

    pub fn read(&self, path: &str) -> Result<Artifact, VfsError> {
        let path = path::normalize(path)?;
        self.backend
            .get(&path)?
            .ok_or(VfsError::NotFound(path))
    }

    pub fn exists(&self, path: &str) -> Result<bool, VfsError> {
        let path = path::normalize(path)?;
        Ok(self.backend.get(&path)?.is_some())
    }

    pub fn stat(&self, path: &str) -> Result<ArtifactStat, VfsError> {
        let a = self.read(path)?;
        Ok(ArtifactStat {
            path: a.path,
            artifact_type: a.artifact_type,
            size: a.size,
            updated: a.updated,
        })
    }

    /// All paths under `prefix` (directory semantics are virtual), sorted.
    pub fn list(&self, prefix: &str) -> Result<Vec<String>, VfsError> {
        let prefix = path::normalize(prefix)?;
        self.backend.keys_with_prefix(&prefix)
    }

    pub fn delete(&self, path: &str) -> Result<(), VfsError> {
        let path = path::normalize(path)?;
        if !self.backend.remove(&path)? {
            return Err(VfsError::NotFound(path));
        }
        self.bus.emit(topics::VFS_DELETED, json!({ "path": path }));
        Ok(())
    }

    pub fn clear(&self) -> Result<(), VfsError> {
        self.backend.clear()
    }
}

/// Monotonic-enough milliseconds for `updated` stamps.
pub(crate) fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vfs() -> Vfs {
        Vfs::in_memory(Arc::new(EventBus::new()))
    }

    #[test]
    fn write_then_read_returns_content() {
        let vfs = vfs();
        vfs.write("/notes/a.md", "HELLO", WriteOptions::default())
            .unwrap();
        assert_eq!(vfs.read("/notes/a.md").unwrap().content, "HELLO");
        assert_eq!(vfs.read("notes/a.md").unwrap().content, "HELLO");
    }

    #[test]
    fn oversized_write_fails_and_leaves_prior_content() {
        let caps = SizeCaps {
            code: 8,
            ..SizeCaps::default()
        };
        let vfs = Vfs::new(Box::new(MemoryVfs::new()), caps, Arc::new(EventBus::new()));
        vfs.write("/t.rs", "fn f(){}", WriteOptions::code()).unwrap();

        let err = vfs
            .write("/t.rs", "fn frob(){}", WriteOptions::code())
            .unwrap_err();
        assert!(matches!(err, VfsError::TooLarge { .. }));
        assert_eq!(vfs.read("/t.rs").unwrap().content, "fn f(){}");
    }

    #[test]
    fn exact_cap_write_succeeds() {
        let caps = SizeCaps {
            code: 5,
            ..SizeCaps::default()
        };
        let vfs = Vfs::new(Box::new(MemoryVfs::new()), caps, Arc::new(EventBus::new()));
        vfs.write("/c", "12345", WriteOptions::code()).unwrap();
        assert_eq!(vfs.stat("/c").unwrap().size, 5);
    }

    #[test]
    fn read_missing_is_not_found() {
        assert!(matches!(
            vfs().read("/missing"),
            Err(VfsError::NotFound(_))
        ));
    }

    #[test]
    fn list_returns_sorted_paths_under_prefix() {
        let vfs = vfs();
        for p in ["/a/2", "/a/1", "/b/1"] {
            vfs.write(p, "x", WriteOptions::default()).unwrap();
        }
        assert_eq!(vfs.list("/a").unwrap(), vec!["/a/1", "/a/2"]);
        assert!(vfs.list("/ab").unwrap().is_empty());
    }

    #[test]
    fn write_emits_vfs_updated() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            bus.on(topics::VFS_UPDATED, "test", move |e| {
                seen.lock()
                    .unwrap()
                    .push(e.payload["path"].as_str().unwrap_or("").to_string());
                Ok(())
            });
        }
        let vfs = Vfs::in_memory(Arc::clone(&bus));
        vfs.write("/x", "1", WriteOptions::default()).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["/x"]);
    }

    #[test]
    fn delete_missing_is_not_found() {
        assert!(matches!(
            vfs().delete("/nope"),
            Err(VfsError::NotFound(_))
        ));
    }
}
