//! In-memory VFS backend. The default for tests and ephemeral agents.

use std::collections::BTreeMap;
use std::sync::Mutex;

use super::path::has_prefix;
use super::{Artifact, VfsBackend, VfsError};

/// BTreeMap-backed store; `keys_with_prefix` falls out of the sorted keys.
#[derive(Default)]
pub struct MemoryVfs {
    entries: Mutex<BTreeMap<String, Artifact>>,
}

impl MemoryVfs {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VfsBackend for MemoryVfs {
    fn get(&self, path: &str) -> Result<Option<Artifact>, VfsError> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(path).cloned())
    }

    fn put(&self, artifact: Artifact) -> Result<(), VfsError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(artifact.path.clone(), artifact);
        Ok(())
    }

    fn remove(&self, path: &str) -> Result<bool, VfsError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.remove(path).is_some())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, VfsError> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .keys()
            .filter(|k| has_prefix(k, prefix))
            .cloned()
            .collect())
    }

    fn clear(&self) -> Result<(), VfsError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.clear();
        Ok(())
    }
}
