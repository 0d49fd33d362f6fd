//! Common test utilities and helpers for heapscope tests
//!
//! Builders for dump files on disk, a session wired to deterministic
//! collaborators, and a diff generator that never runs a real tool.

#![allow(dead_code)]

use async_trait::async_trait;
use heapscope::config::SessionConfig;
use heapscope::diff_cache::DiffGenerator;
use heapscope::session::{Session, SessionParts};
use heapscope::store::SnapshotStore;
use heapscope_core::dump_writer::DumpWriter;
use heapscope_core::error::Result;
use heapscope_core::{Allocation, HeapId, MemoryStatistics, Module, SymbolInfo, TracebackId};
use heapscope_symbols::{FrameResolver, ModuleOffsetResolver};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Module every fixture frame points into
pub const APP_BASE: u32 = 0x0040_0000;
pub const APP_SIZE: u32 = 0x0010_0000;

pub fn app_module() -> Module {
    Module::new(r"c:\app\app.exe", APP_BASE, APP_SIZE)
}

/// Builder for a dump file with a single module
pub struct SnapshotBuilder {
    heaps: Vec<(HeapId, Vec<(Allocation, Option<Vec<u32>>)>)>,
    memory: Option<MemoryStatistics>,
}

impl SnapshotBuilder {
    pub fn new() -> Self {
        Self {
            heaps: Vec::new(),
            memory: None,
        }
    }

    pub fn heap(mut self, id: u32) -> Self {
        self.heaps.push((HeapId(id), Vec::new()));
        self
    }

    /// Add an allocation to the last heap; `frames` are app-relative offsets
    pub fn allocation(mut self, address: u32, size: u32, traceback: u32, frames: &[u32]) -> Self {
        let allocation = Allocation {
            address,
            size,
            overhead: 8,
            traceback: TracebackId(traceback),
        };
        let frames = (!frames.is_empty()).then(|| frames.iter().map(|f| APP_BASE + f).collect());
        if let Some((_, allocations)) = self.heaps.last_mut() {
            allocations.push((allocation, frames));
        }
        self
    }

    pub fn memory(mut self, working_set: u64) -> Self {
        self.memory = Some(MemoryStatistics {
            working_set,
            ..MemoryStatistics::default()
        });
        self
    }

    pub fn build(&self) -> String {
        let mut writer = DumpWriter::new();
        writer.modules([&app_module()]);
        for (id, allocations) in &self.heaps {
            writer.begin_heap(*id);
            for (allocation, frames) in allocations {
                writer.allocation(allocation, frames.as_deref());
            }
            writer.end_heap(*id);
        }
        if let Some(memory) = &self.memory {
            writer.memory(memory);
        }
        writer.finish()
    }

    /// Write to `dir` under the conventional snapshot file name
    pub fn write(&self, dir: &Path, index: usize, time: &str) -> PathBuf {
        let path = dir.join(format!("snapshot_{index:04}_20240101-{time}.heap"));
        std::fs::write(&path, self.build()).unwrap();
        path
    }
}

/// Two heaps, three tracebacks, frames shared between tracebacks
pub fn sample_snapshot() -> SnapshotBuilder {
    SnapshotBuilder::new()
        .heap(0x0015_0000)
        .allocation(0x0015_0010, 0x100, 1, &[0x1000, 0x2000])
        .allocation(0x0015_0200, 0x40, 2, &[0x1000, 0x3000])
        .allocation(0x0015_0300, 0x20, 1, &[])
        .heap(0x0025_0000)
        .allocation(0x0025_0010, 0x400, 3, &[0x4000])
        .memory(0x0080_0000)
}

/// Diff generator that writes a fixed diff and counts its runs
#[derive(Default)]
pub struct CannedDiff {
    pub runs: AtomicUsize,
}

impl CannedDiff {
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

pub const CANNED_DIFF: &str = "\
// Debug library initialized ...
DBGHELP: app - private symbols & lines

+   200 (   300 -   100)      3 allocs\tBackTrace00000001
+     2 (     3 -     1)\tBackTrace00000001\tallocations

\tapp!Widget::grow+0000001C (c:\\src\\widget.cpp, 88)
\tapp!main+00000010

-    40 (     0 -    40)      0 allocs\tBackTrace00000002
-     1 (     0 -     1)\tBackTrace00000002\tallocations

\tapp!Cache::drop+00000004

Total increase ==    1C0 requested +     20 overhead =    1E0
";

#[async_trait]
impl DiffGenerator for CannedDiff {
    async fn generate(&self, _first: &Path, _second: &Path, output: &Path) -> Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        tokio::fs::write(output, CANNED_DIFF).await?;
        Ok(())
    }
}

pub fn test_config(temp_dir: &Path) -> SessionConfig {
    SessionConfig {
        resolver_workers: 2,
        max_concurrent_loads: 2,
        batch_size: 64,
        idle_interval: Duration::from_millis(5),
        temp_dir: temp_dir.to_path_buf(),
        ..SessionConfig::default()
    }
}

/// Session resolving frames by module offset, diffing with [`CannedDiff`]
pub fn offset_session(
    config: SessionConfig,
    diffs: Arc<CannedDiff>,
    store: Option<Arc<dyn SnapshotStore>>,
) -> Session {
    let parts = SessionParts {
        resolver: Arc::new(ModuleOffsetResolver::new()),
        diff_generator: diffs,
        store,
    };
    Session::with_parts(config, parts).unwrap()
}

/// Resolver whose batches never finish
pub struct StalledResolver;

#[async_trait]
impl FrameResolver for StalledResolver {
    async fn resolve_batch(&self, _addresses: &[u32]) -> Result<HashMap<u32, SymbolInfo>> {
        std::future::pending().await
    }
}

/// Session whose symbol lookups only complete through shutdown
pub fn stalled_session(config: SessionConfig) -> Session {
    let parts = SessionParts {
        resolver: Arc::new(StalledResolver),
        diff_generator: Arc::new(CannedDiff::default()),
        store: None,
    };
    Session::with_parts(config, parts).unwrap()
}
