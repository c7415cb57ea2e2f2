//! In-process remote store.
//!
//! Shares objects between every clone of the store, which makes it a stand-in
//! for a real shared backend when several deployers run inside one process.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{Result, StateError};

use super::remote::{RemoteObject, RemoteStore, VersionMarker};

#[derive(Debug, Clone)]
struct Entry {
    bytes: Vec<u8>,
    generation: u64,
}

/// In-memory remote store with generation-counter version markers.
#[derive(Debug, Clone, Default)]
pub struct MemoryRemoteStore {
    objects: Arc<RwLock<HashMap<String, Entry>>>,
    next_generation: Arc<RwLock<u64>>,
}

impl MemoryRemoteStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored objects.
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    /// Returns true if no objects are stored.
    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    fn marker(generation: u64) -> VersionMarker {
        VersionMarker::new(format!("g{generation}"))
    }

    fn check(path: &str, current: Option<&Entry>, expected: Option<&VersionMarker>) -> Result<()> {
        let current = current.map(|e| Self::marker(e.generation));
        if current.as_ref() == expected {
            Ok(())
        } else {
            Err(StateError::Conflict {
                path: path.to_string(),
            }
            .into())
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn get(&self, path: &str) -> Result<Option<RemoteObject>> {
        let objects = self.objects.read().await;
        Ok(objects.get(path).map(|entry| RemoteObject {
            bytes: entry.bytes.clone(),
            version: Self::marker(entry.generation),
        }))
    }

    async fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        expected: Option<VersionMarker>,
    ) -> Result<VersionMarker> {
        let mut objects = self.objects.write().await;
        Self::check(path, objects.get(path), expected.as_ref())?;

        let mut next = self.next_generation.write().await;
        *next += 1;
        let generation = *next;

        objects.insert(path.to_string(), Entry { bytes, generation });
        Ok(Self::marker(generation))
    }

    async fn head_version(&self, path: &str) -> Result<Option<VersionMarker>> {
        let objects = self.objects.read().await;
        Ok(objects.get(path).map(|e| Self::marker(e.generation)))
    }

    async fn delete(&self, path: &str, expected: Option<VersionMarker>) -> Result<()> {
        let mut objects = self.objects.write().await;
        if !objects.contains_key(path) {
            return Ok(());
        }
        if expected.is_some() {
            Self::check(path, objects.get(path), expected.as_ref())?;
        }
        objects.remove(path);
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_conditional_put() {
        let store = MemoryRemoteStore::new();

        let v1 = store
            .put("a", b"one".to_vec(), None)
            .await
            .expect("create should succeed");

        // Create-only write against an existing object conflicts
        assert!(store.put("a", b"two".to_vec(), None).await.is_err());

        let v2 = store
            .put("a", b"two".to_vec(), Some(v1.clone()))
            .await
            .expect("update with current version should succeed");
        assert_ne!(v1, v2);

        // Stale version conflicts
        let err = store
            .put("a", b"three".to_vec(), Some(v1))
            .await
            .expect_err("stale write must fail");
        assert!(err.is_persist_conflict());

        let obj = store.get("a").await.expect("get").expect("exists");
        assert_eq!(obj.bytes, b"two");
        assert_eq!(obj.version, v2);
        assert_eq!(store.head_version("a").await.expect("head"), Some(v2));
    }

    #[tokio::test]
    async fn test_delete_is_conditional_and_idempotent() {
        let store = MemoryRemoteStore::new();
        let v1 = store.put("a", b"x".to_vec(), None).await.expect("put");
        let v2 = store.put("a", b"y".to_vec(), Some(v1.clone())).await.expect("put");

        assert!(store.delete("a", Some(v1)).await.is_err());
        store.delete("a", Some(v2)).await.expect("delete current");
        store.delete("a", None).await.expect("delete missing");
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_clones_share_objects() {
        let a = MemoryRemoteStore::new();
        let b = a.clone();
        a.put("k", b"v".to_vec(), None).await.expect("put");
        assert!(b.get("k").await.expect("get").is_some());
    }
}
