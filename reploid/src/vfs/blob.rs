//! Transient in-memory blobs: code objects the substrate loader can load
//! without writing through the artifact store. A handle is released as soon
//! as the loader has materialized the module, so short-lived sources never
//! accumulate.

use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

/// Reference to a blob held by a [`BlobStore`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BlobHandle(String);

impl BlobHandle {
    pub fn id(&self) -> &str {
        &self.0
    }
}

/// Registry of transient code blobs.
#[derive(Default)]
pub struct BlobStore {
    blobs: DashMap<String, Arc<str>>,
}

impl BlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `content` and returns its handle.
    pub fn create(&self, content: &str) -> BlobHandle {
        let id = Uuid::new_v4().to_string();
        self.blobs.insert(id.clone(), Arc::from(content));
        BlobHandle(id)
    }

    /// Content for a live handle; `None` once released.
    pub fn read(&self, handle: &BlobHandle) -> Option<Arc<str>> {
        self.blobs.get(handle.id()).map(|e| Arc::clone(e.value()))
    }

    /// Drops the blob. Releasing twice is a no-op.
    pub fn release(&self, handle: &BlobHandle) {
        self.blobs.remove(handle.id());
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_read_release() {
        let store = BlobStore::new();
        let handle = store.create("module source");
        assert_eq!(store.read(&handle).as_deref(), Some("module source"));
        store.release(&handle);
        assert!(store.read(&handle).is_none());
        assert!(store.is_empty());
    }
}
