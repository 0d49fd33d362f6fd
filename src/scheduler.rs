//! Snapshot load scheduler
//!
//! A single worker drains a queue of snapshot paths and parses at most
//! `max_concurrent_loads` of them at once. Each finished snapshot is inserted
//! into the timestamp-sorted summary list, announced, handed to the symbol
//! pipeline, kept in the body cache, and queued for persistence.
//!
//! Every submitted path carries a [`LoadGuard`]. The guard decrements the
//! in-flight count and advances the load progress when it drops, which
//! happens exactly once whether the load succeeds, fails, or panics.

use crate::snapshot_cache::SnapshotCache;
use crate::store::PersistenceQueue;
use heapscope_core::progress::{Progress, SessionEvent};
use heapscope_core::{HeapSnapshotInfo, Snapshot};
use heapscope_symbols::SymbolPipeline;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{Notify, Semaphore, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// In-flight load bookkeeping shared by the scheduler and its guards
#[derive(Debug, Default)]
pub struct LoadTracker {
    pending: Arc<AtomicUsize>,
    progress: Progress,
    idle: Notify,
}

impl LoadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count handle read by the symbol workers
    pub fn pending_handle(&self) -> Arc<AtomicUsize> {
        self.pending.clone()
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    /// Register one load and return the guard that completes it
    pub fn begin(self: &Arc<Self>) -> LoadGuard {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.progress.add_work(1);
        LoadGuard {
            tracker: self.clone(),
        }
    }

    /// Wait until no load is in flight
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Completes one load on drop
#[derive(Debug)]
pub struct LoadGuard {
    tracker: Arc<LoadTracker>,
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.tracker.progress.complete(1);
        if self.tracker.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.tracker.idle.notify_waiters();
        }
    }
}

struct LoaderShared {
    snapshots: RwLock<Vec<HeapSnapshotInfo>>,
    tracker: Arc<LoadTracker>,
    events: broadcast::Sender<SessionEvent>,
    pipeline: Arc<SymbolPipeline>,
    cache: Arc<SnapshotCache>,
    persistence: Option<PersistenceQueue>,
}

/// Queue-driven snapshot loader
pub struct SnapshotLoader {
    shared: Arc<LoaderShared>,
    queue: mpsc::UnboundedSender<(PathBuf, LoadGuard)>,
    worker: JoinHandle<()>,
}

impl SnapshotLoader {
    /// Spawn the load worker on the current runtime
    pub fn start(
        max_concurrent_loads: usize,
        tracker: Arc<LoadTracker>,
        pipeline: Arc<SymbolPipeline>,
        cache: Arc<SnapshotCache>,
        events: broadcast::Sender<SessionEvent>,
        persistence: Option<PersistenceQueue>,
    ) -> Self {
        let shared = Arc::new(LoaderShared {
            snapshots: RwLock::new(Vec::new()),
            tracker,
            events,
            pipeline,
            cache,
            persistence,
        });

        let (queue, receiver) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_loader(
            shared.clone(),
            receiver,
            Arc::new(Semaphore::new(max_concurrent_loads.max(1))),
        ));

        Self {
            shared,
            queue,
            worker,
        }
    }

    /// Queue one snapshot file
    pub fn submit(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        let guard = self.shared.tracker.begin();
        debug!("Queued snapshot {}", path.display());
        if let Err(mpsc::error::SendError((path, _guard))) = self.queue.send((path, guard)) {
            warn!("Snapshot loader stopped, {} not loaded", path.display());
        }
    }

    pub fn submit_all(&self, paths: impl IntoIterator<Item = PathBuf>) {
        for path in paths {
            self.submit(path);
        }
    }

    /// Summaries of all loaded snapshots, oldest first
    pub fn snapshots(&self) -> Vec<HeapSnapshotInfo> {
        self.shared
            .snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn summary(&self, index: usize) -> Option<HeapSnapshotInfo> {
        self.shared
            .snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|s| s.index() == index)
            .cloned()
    }

    pub fn tracker(&self) -> &Arc<LoadTracker> {
        &self.shared.tracker
    }

    /// Wait until every submitted file has been loaded or has failed
    pub async fn wait_idle(&self) {
        self.shared.tracker.wait_idle().await;
    }

    /// Add an already parsed snapshot as if it had been loaded
    pub fn insert(&self, snapshot: Snapshot) -> HeapSnapshotInfo {
        self.shared.install(snapshot)
    }
}

impl Drop for SnapshotLoader {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn run_loader(
    shared: Arc<LoaderShared>,
    mut receiver: mpsc::UnboundedReceiver<(PathBuf, LoadGuard)>,
    semaphore: Arc<Semaphore>,
) {
    while let Some((path, guard)) = receiver.recv().await {
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };
        let shared = shared.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let _guard = guard;
            shared.load(path).await;
        });
    }
    debug!("Snapshot loader stopped");
}

impl LoaderShared {
    async fn load(&self, path: PathBuf) {
        match heapscope_parser::load_snapshot(&path).await {
            Ok(snapshot) => {
                self.install(snapshot);
            }
            Err(e) => {
                warn!("Failed to load snapshot {}: {}", path.display(), e);
                let _ = self.events.send(SessionEvent::SnapshotLoadFailed {
                    path,
                    error: e.to_string(),
                });
            }
        }
    }

    fn install(&self, mut snapshot: Snapshot) -> HeapSnapshotInfo {
        let info = {
            let mut list = self
                .snapshots
                .write()
                .unwrap_or_else(PoisonError::into_inner);

            list.retain(|s| s.identity.path != snapshot.identity.path);
            if list.iter().any(|s| s.index() == snapshot.index()) {
                let next = list.iter().map(|s| s.index()).max().unwrap_or(0) + 1;
                debug!(
                    "Snapshot index {} already taken, using {} for {}",
                    snapshot.index(),
                    next,
                    snapshot.identity.path.display()
                );
                snapshot.identity.index = next;
            }

            let info = snapshot.summary();
            list.push(info.clone());
            list.sort_by(|a, b| {
                a.identity
                    .timestamp
                    .cmp(&b.identity.timestamp)
                    .then(a.index().cmp(&b.index()))
            });
            info
        };

        let snapshot = Arc::new(snapshot);
        self.cache.insert(snapshot.clone());
        let _ = self.events.send(SessionEvent::SnapshotsChanged);
        self.pipeline.enqueue_snapshot(&snapshot);
        if let Some(persistence) = &self.persistence {
            persistence.enqueue(snapshot.clone());
        }

        info!(
            "Loaded snapshot {} from {}: {} heaps, {} allocations, {} tracebacks",
            info.index(),
            info.identity.path.display(),
            info.heaps.len(),
            info.allocation_count(),
            info.traceback_count
        );
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_completes_exactly_once() {
        let tracker = Arc::new(LoadTracker::new());
        let first = tracker.begin();
        let second = tracker.begin();
        assert_eq!(tracker.pending(), 2);
        assert_eq!(tracker.progress().get(), (0, 2));

        drop(first);
        assert_eq!(tracker.pending(), 1);
        drop(second);
        assert_eq!(tracker.pending(), 0);
        assert_eq!(tracker.progress().get(), (2, 2));
    }

    #[test]
    fn test_guard_completes_on_panic() {
        let tracker = Arc::new(LoadTracker::new());
        let guard = tracker.begin();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = guard;
            panic!("parse failed");
        }));
        assert!(result.is_err());
        assert_eq!(tracker.pending(), 0);
    }

    #[tokio::test]
    async fn test_wait_idle_returns_after_last_guard() {
        let tracker = Arc::new(LoadTracker::new());
        tracker.wait_idle().await;

        let guard = tracker.begin();
        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_idle().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
    }
}
