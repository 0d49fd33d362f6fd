//! Bounded cache of parsed snapshot bodies
//!
//! Snapshot summaries stay in the session for its whole lifetime; the full
//! bodies (allocations and tracebacks) are kept only for the most recently
//! used few. An evicted body is reloaded on demand, from the store when it
//! has a copy, otherwise by parsing the source file again.

use crate::store::SnapshotStore;
use heapscope_core::error::Result;
use heapscope_core::{Snapshot, SnapshotIdentity};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

pub struct SnapshotCache {
    entries: Mutex<LruCache<usize, Arc<Snapshot>>>,
    store: Option<Arc<dyn SnapshotStore>>,
    reloads: AtomicU64,
}

impl SnapshotCache {
    pub fn new(capacity: usize, store: Option<Arc<dyn SnapshotStore>>) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            store,
            reloads: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<usize, Arc<Snapshot>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Keep a freshly parsed body
    pub fn insert(&self, snapshot: Arc<Snapshot>) {
        let index = snapshot.index();
        if let Some((evicted, _)) = self.lock().push(index, snapshot)
            && evicted != index
        {
            debug!("Snapshot {} body evicted from memory", evicted);
        }
    }

    /// Cached body, marking it most recently used
    pub fn get(&self, index: usize) -> Option<Arc<Snapshot>> {
        self.lock().get(&index).cloned()
    }

    pub fn contains(&self, index: usize) -> bool {
        self.lock().contains(&index)
    }

    /// Cached body, reloading it when it was evicted
    pub async fn fetch(&self, identity: &SnapshotIdentity) -> Result<Arc<Snapshot>> {
        if let Some(snapshot) = self.get(identity.index) {
            return Ok(snapshot);
        }

        let snapshot = self.reload(identity).await?;
        self.reloads.fetch_add(1, Ordering::Relaxed);
        self.insert(snapshot.clone());
        Ok(snapshot)
    }

    async fn reload(&self, identity: &SnapshotIdentity) -> Result<Arc<Snapshot>> {
        if let Some(store) = &self.store
            && let Some(snapshot) = store.load(identity.index).await?
        {
            debug!("Reloaded snapshot {} from store", identity.index);
            return Ok(snapshot);
        }

        debug!(
            "Reparsing snapshot {} from {}",
            identity.index,
            identity.path.display()
        );
        let mut snapshot = heapscope_parser::load_snapshot(&identity.path).await?;
        // Keep the index the session assigned, which may differ from the name
        snapshot.identity = identity.clone();
        Ok(Arc::new(snapshot))
    }

    /// Bodies reloaded after eviction so far
    pub fn reload_count(&self) -> u64 {
        self.reloads.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use heapscope_core::dump_writer::DumpWriter;
    use heapscope_core::{Allocation, HeapId, TracebackId};

    fn write_dump(dir: &std::path::Path, index: usize) -> SnapshotIdentity {
        let path = dir.join(format!("snapshot_{index:04}_20240101-00000{index}.heap"));
        let mut writer = DumpWriter::new();
        writer
            .modules([])
            .begin_heap(HeapId(0x1000))
            .allocation(
                &Allocation {
                    address: 0x1000,
                    size: 0x10 * index as u32,
                    overhead: 0,
                    traceback: TracebackId(1),
                },
                Some(&[0x401000]),
            )
            .end_heap(HeapId(0x1000));
        std::fs::write(&path, writer.finish()).unwrap();
        SnapshotIdentity::from_path(&path)
    }

    #[tokio::test]
    async fn test_evicted_body_is_reparsed() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SnapshotCache::new(1, None);

        let first = write_dump(dir.path(), 1);
        let second = write_dump(dir.path(), 2);

        let body = cache.fetch(&first).await.unwrap();
        assert_eq!(body.total_requested(), 0x10);
        cache.fetch(&second).await.unwrap();
        assert!(!cache.contains(1));
        assert_eq!(cache.len(), 1);

        let again = cache.fetch(&first).await.unwrap();
        assert_eq!(again.total_requested(), 0x10);
        assert_eq!(cache.reload_count(), 3);
    }

    #[test]
    fn test_reinsert_replaces_without_evicting() {
        let cache = SnapshotCache::new(2, None);
        let first = SnapshotIdentity::from_path("/d/snapshot_0001_20240101-000000.heap");
        let second = SnapshotIdentity::from_path("/d/snapshot_0002_20240101-000000.heap");
        cache.insert(Arc::new(Snapshot::new(first.clone())));
        cache.insert(Arc::new(Snapshot::new(second)));
        cache.insert(Arc::new(Snapshot::new(first)));

        assert_eq!(cache.len(), 2);
        assert!(cache.contains(1));
        assert!(cache.contains(2));
    }

    #[tokio::test]
    async fn test_reload_prefers_store() {
        let store = Arc::new(MemoryStore::new());
        let identity = SnapshotIdentity::from_path("/nonexistent/snapshot_0005_20240101-000000.heap");
        store
            .save(Arc::new(Snapshot::new(identity.clone())))
            .await
            .unwrap();

        let cache = SnapshotCache::new(2, Some(store));
        let snapshot = cache.fetch(&identity).await.unwrap();
        assert_eq!(snapshot.index(), 5);
        assert!(cache.get(5).is_some());
    }

    #[tokio::test]
    async fn test_missing_source_is_an_error() {
        let cache = SnapshotCache::new(2, None);
        let identity = SnapshotIdentity::from_path("/nonexistent/snapshot_0009_20240101-000000.heap");
        assert!(cache.fetch(&identity).await.is_err());
        assert!(cache.is_empty());
    }
}
