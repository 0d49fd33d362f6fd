//! Profiling session
//!
//! A [`Session`] owns every long-lived piece of a profiling run: the symbol
//! pipeline and its workers, the snapshot loader, the snapshot body cache,
//! the diff cache, and the optional persistence writer. Nothing is global,
//! so independent sessions can run side by side.
//!
//! # Examples
//!
//! ```no_run
//! use heapscope::config::SessionConfig;
//! use heapscope::session::Session;
//!
//! #[tokio::main]
//! async fn main() -> heapscope::Result<()> {
//!     let session = Session::new(SessionConfig::default())?;
//!     session.load("dumps/snapshot_0001_20240101-120000.heap");
//!     session.wait_for_loads().await;
//!
//!     for info in session.snapshots() {
//!         println!("{}: {} allocations", info.index(), info.allocation_count());
//!     }
//!     Ok(())
//! }
//! ```

use crate::config::SessionConfig;
use crate::diff_cache::{DiffCache, DiffGenerator};
use crate::report::{TracebackReport, symbolize_reports, top_tracebacks};
use crate::scheduler::{LoadTracker, SnapshotLoader};
use crate::snapshot_cache::SnapshotCache;
use crate::store::{PersistenceWriter, SnapshotStore};
use heapscope_core::error::{HeapscopeError, Result};
use heapscope_core::progress::{Progress, SessionEvent};
use heapscope_core::tool::HeapTool;
use heapscope_core::{Diff, HeapSnapshotInfo, Snapshot, SnapshotIdentity};
use heapscope_symbols::{FrameResolver, SymbolPipeline, ToolResolver};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

const EVENT_CAPACITY: usize = 256;

/// External collaborators of a session
///
/// [`Session::new`] wires the heap tool in for both symbol resolution and
/// diffing; tests and embedders can substitute their own.
pub struct SessionParts {
    pub resolver: Arc<dyn FrameResolver>,
    pub diff_generator: Arc<dyn DiffGenerator>,
    pub store: Option<Arc<dyn SnapshotStore>>,
}

pub struct Session {
    config: SessionConfig,
    tool: HeapTool,
    events: broadcast::Sender<SessionEvent>,
    pipeline: Arc<SymbolPipeline>,
    loader: SnapshotLoader,
    snapshots: Arc<SnapshotCache>,
    diffs: DiffCache,
    store: Option<Arc<dyn SnapshotStore>>,
    persistence: Option<PersistenceWriter>,
}

impl Session {
    /// Start a session backed by the configured heap tool
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: SessionConfig) -> Result<Self> {
        let tool = HeapTool::new(config.tool.clone());
        let parts = SessionParts {
            resolver: Arc::new(ToolResolver::new(tool.clone(), config.temp_dir.clone())),
            diff_generator: Arc::new(tool),
            store: None,
        };
        Self::with_parts(config, parts)
    }

    /// Start a session with explicit collaborators
    pub fn with_parts(config: SessionConfig, parts: SessionParts) -> Result<Self> {
        config.validate()?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let tracker = Arc::new(LoadTracker::new());
        let pipeline = Arc::new(SymbolPipeline::start(
            parts.resolver,
            config.pipeline_config(),
            tracker.pending_handle(),
            events.clone(),
        ));
        let snapshots = Arc::new(SnapshotCache::new(
            config.snapshot_cache_capacity,
            parts.store.clone(),
        ));
        let persistence = parts.store.clone().map(PersistenceWriter::start);
        let loader = SnapshotLoader::start(
            config.max_concurrent_loads,
            tracker,
            pipeline.clone(),
            snapshots.clone(),
            events.clone(),
            persistence.as_ref().map(PersistenceWriter::queue),
        );
        let diffs = DiffCache::new(
            config.diff_cache_capacity,
            parts.diff_generator,
            config.temp_dir.clone(),
        );

        debug!(
            "Session started: {} resolver workers, {} concurrent loads",
            config.resolver_workers, config.max_concurrent_loads
        );

        Ok(Self {
            tool: HeapTool::new(config.tool.clone()),
            config,
            events,
            pipeline,
            loader,
            snapshots,
            diffs,
            store: parts.store,
            persistence,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Receive session events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Queue a snapshot file for loading
    pub fn load(&self, path: impl Into<PathBuf>) {
        self.loader.submit(path);
    }

    pub fn load_all(&self, paths: impl IntoIterator<Item = PathBuf>) {
        self.loader.submit_all(paths);
    }

    /// Wait until every queued snapshot has loaded or failed
    pub async fn wait_for_loads(&self) {
        self.loader.wait_idle().await;
    }

    /// Loaded snapshots, oldest first
    pub fn snapshots(&self) -> Vec<HeapSnapshotInfo> {
        self.loader.snapshots()
    }

    /// Full body of a loaded snapshot, reloading it if it was evicted
    pub async fn snapshot(&self, index: usize) -> Result<Arc<Snapshot>> {
        let info = self
            .loader
            .summary(index)
            .ok_or(HeapscopeError::SnapshotNotFound(index))?;
        self.snapshots.fetch(&info.identity).await
    }

    /// Add an already parsed snapshot to the session
    pub fn insert_snapshot(&self, snapshot: Snapshot) -> HeapSnapshotInfo {
        self.loader.insert(snapshot)
    }

    pub fn symbols(&self) -> &Arc<SymbolPipeline> {
        &self.pipeline
    }

    pub fn load_progress(&self) -> &Progress {
        self.loader.tracker().progress()
    }

    pub fn symbol_progress(&self) -> Arc<Progress> {
        self.pipeline.progress()
    }

    pub fn snapshot_cache(&self) -> &SnapshotCache {
        &self.snapshots
    }

    /// Largest tracebacks of a snapshot, with resolved frames
    pub async fn top_tracebacks(&self, index: usize, limit: usize) -> Result<Vec<TracebackReport>> {
        let snapshot = self.snapshot(index).await?;
        let mut reports = top_tracebacks(&snapshot, limit);
        symbolize_reports(&snapshot, &mut reports, &self.pipeline).await;
        Ok(reports)
    }

    /// Diff two dump files, reusing a cached diff when there is one
    pub async fn diff_files(&self, first: &Path, second: &Path) -> Result<Diff> {
        let mut diff = self.diffs.diff(first, second).await?;
        diff.sort_by_magnitude();
        Ok(diff)
    }

    /// Diff two loaded snapshots by index
    pub async fn diff_snapshots(&self, first: usize, second: usize) -> Result<Diff> {
        let first = self
            .loader
            .summary(first)
            .ok_or(HeapscopeError::SnapshotNotFound(first))?;
        let second = self
            .loader
            .summary(second)
            .ok_or(HeapscopeError::SnapshotNotFound(second))?;
        self.diff_files(&first.identity.path, &second.identity.path)
            .await
    }

    pub fn diff_cache(&self) -> &DiffCache {
        &self.diffs
    }

    /// Capture the heap of a live process into `directory` and load it
    ///
    /// The file is named after the next free snapshot index and the current
    /// local time.
    pub async fn capture(&self, pid: u32, directory: &Path) -> Result<PathBuf> {
        let index = self
            .snapshots()
            .iter()
            .map(|s| s.index() + 1)
            .max()
            .unwrap_or(1);
        let timestamp = chrono::Local::now().naive_local();
        tokio::fs::create_dir_all(directory).await?;
        let path = directory.join(SnapshotIdentity::file_name(index, timestamp));

        self.tool.capture(pid, &path).await?;
        self.load(path.clone());
        Ok(path)
    }

    /// Toggle stack collection for an executable
    pub async fn set_instrumentation(&self, executable: &str, enabled: bool) -> Result<()> {
        self.tool.set_instrumentation(executable, enabled).await
    }

    /// Write resolved symbols to the store
    pub async fn persist_symbols(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let symbols = self.pipeline.resolved_symbols();
        let count = symbols.len();
        store.save_symbols(symbols).await?;
        debug!("Persisted {} symbols", count);
        Ok(count)
    }

    /// Seed the symbol cache from the store
    pub async fn restore_symbols(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let restored = self.pipeline.preload(store.load_symbols().await?);
        debug!("Restored {} symbols from store", restored);
        Ok(restored)
    }

    /// Flush pending persistence and stop background work
    ///
    /// Symbol lookups still waiting complete with placeholders.
    pub async fn shutdown(self) -> Result<()> {
        self.persist_symbols().await?;
        self.pipeline.shutdown();
        let Session {
            loader,
            persistence,
            ..
        } = self;
        drop(loader);
        if let Some(writer) = persistence {
            let written = writer.finish().await?;
            info!("Persisted {} snapshots", written);
        }
        Ok(())
    }
}
