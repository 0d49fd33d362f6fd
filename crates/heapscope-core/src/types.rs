//! Core domain types for heapscope
//!
//! This module contains the parsed form of a heap dump: modules, tracebacks,
//! allocations, heaps with their derived statistics, and the snapshot that
//! owns them all.

use crate::frame_pool::FrameSlice;
use crate::patterns;
use chrono::{DateTime, Local, NaiveDateTime};
use derive_more::{Display, From};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Identifier the heap tool assigns to a distinct call stack
///
/// # Examples
/// ```
/// use heapscope_core::types::TracebackId;
///
/// let id = TracebackId(0xA7);
/// assert_eq!(id.to_string(), "000000A7");
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From,
)]
#[display("{_0:08X}")]
pub struct TracebackId(pub u32);

/// Heap identifier, the heap's base address as reported by the heap tool
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    From,
)]
#[display("{_0:08X}")]
pub struct HeapId(pub u32);

/// A module loaded into the profiled process
///
/// Identity is the normalized (case-folded) path; two modules with the same
/// path compare equal regardless of base address.
///
/// # Examples
/// ```
/// use heapscope_core::types::Module;
///
/// let module = Module::new(r"C:\Windows\System32\NTDLL.dll", 0x7C900000, 0xB2000);
/// assert_eq!(module.path(), r"c:\windows\system32\ntdll.dll");
/// assert_eq!(module.name(), "NTDLL.dll");
/// assert!(module.contains(0x7C910000));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Module {
    path: String,
    name: String,
    base: u32,
    size: u32,
}

impl Module {
    /// Create a module, normalizing its path
    pub fn new(path: &str, base: u32, size: u32) -> Self {
        let trimmed = path.trim();
        let name = trimmed
            .rsplit(['\\', '/'])
            .next()
            .unwrap_or(trimmed)
            .to_string();
        Self {
            path: trimmed.to_lowercase(),
            name,
            base,
            size,
        }
    }

    /// Normalized path, the module's identity
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Short display name (file name with original casing)
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Whether `address` falls inside the module image
    pub fn contains(&self, address: u32) -> bool {
        address >= self.base && (address - self.base) < self.size
    }
}

impl PartialEq for Module {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl Eq for Module {}

impl Hash for Module {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.path.hash(state);
    }
}

/// A deduplicated call stack of raw frame addresses
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Traceback {
    pub id: TracebackId,
    pub frames: FrameSlice,
}

impl Traceback {
    pub fn new(id: TracebackId, frames: FrameSlice) -> Self {
        Self { id, frames }
    }
}

/// A single live allocation inside a heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    /// Start address
    pub address: u32,
    /// Requested size in bytes
    pub size: u32,
    /// Heap bookkeeping overhead in bytes
    pub overhead: u32,
    /// Call stack that made the allocation
    pub traceback: TracebackId,
}

impl Allocation {
    /// End address (start + size + overhead)
    pub fn end(&self) -> u64 {
        self.address as u64 + self.size as u64 + self.overhead as u64
    }
}

/// Occupancy statistics derived from a heap's sorted allocation list
///
/// Spans are inferred from allocation boundaries: consecutive allocations
/// that touch or overlap form one occupied span, and every gap between two
/// occupied spans is an empty span.
///
/// # Examples
/// ```
/// use heapscope_core::types::{Allocation, HeapId, HeapInfo, TracebackId};
///
/// let allocations = [
///     Allocation { address: 0x1000, size: 0x10, overhead: 0x4, traceback: TracebackId(1) },
///     Allocation { address: 0x1020, size: 0x8, overhead: 0x0, traceback: TracebackId(1) },
/// ];
/// let info = HeapInfo::compute(HeapId(0x1000), &allocations);
/// assert_eq!(info.estimated_size, 0x28);
/// assert_eq!(info.estimated_free, 0xC);
/// assert_eq!(info.occupied_spans, 2);
/// assert_eq!(info.empty_spans, 1);
/// ```
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapInfo {
    pub heap_id: HeapId,
    pub allocation_count: usize,
    pub estimated_start: u32,
    pub estimated_size: u64,
    pub estimated_free: u64,
    pub total_requested: u64,
    pub total_overhead: u64,
    pub largest_free_span: u64,
    pub largest_occupied_span: u64,
    pub occupied_spans: usize,
    pub empty_spans: usize,
}

impl HeapInfo {
    /// Compute statistics in one pass over allocations sorted by address
    pub fn compute(heap_id: HeapId, allocations: &[Allocation]) -> Self {
        let mut info = HeapInfo {
            heap_id,
            allocation_count: allocations.len(),
            estimated_start: heap_id.0,
            ..Default::default()
        };

        let Some(first) = allocations.first() else {
            return info;
        };

        info.estimated_start = first.address;
        let mut span_start = first.address as u64;
        let mut span_end = first.end();
        info.occupied_spans = 1;

        for allocation in allocations {
            info.total_requested += allocation.size as u64;
            info.total_overhead += allocation.overhead as u64;

            let start = allocation.address as u64;
            if start > span_end {
                info.largest_occupied_span = info.largest_occupied_span.max(span_end - span_start);
                info.largest_free_span = info.largest_free_span.max(start - span_end);
                info.empty_spans += 1;
                info.occupied_spans += 1;
                span_start = start;
            }
            span_end = span_end.max(allocation.end());
        }

        info.largest_occupied_span = info.largest_occupied_span.max(span_end - span_start);
        info.estimated_size = span_end - first.address as u64;
        info.estimated_free = info
            .estimated_size
            .saturating_sub(info.total_requested + info.total_overhead);
        info
    }

    /// Ratio of empty spans to allocations
    pub fn fragmentation(&self) -> f64 {
        self.empty_spans as f64 / self.allocation_count.max(1) as f64
    }
}

/// One heap in the profiled process
#[derive(Debug, Clone, Serialize)]
pub struct Heap {
    pub id: HeapId,
    pub allocations: Vec<Allocation>,
    info: HeapInfo,
}

impl Heap {
    pub fn new(id: HeapId) -> Self {
        Self {
            id,
            allocations: Vec::new(),
            info: HeapInfo {
                heap_id: id,
                estimated_start: id.0,
                ..Default::default()
            },
        }
    }

    /// Sort allocations by address and recompute statistics
    ///
    /// Must be called after every change to `allocations`.
    pub fn finalize(&mut self) {
        self.allocations.sort_by_key(|a| a.address);
        self.info = HeapInfo::compute(self.id, &self.allocations);
    }

    /// Statistics as of the last [`Heap::finalize`]
    pub fn info(&self) -> &HeapInfo {
        &self.info
    }
}

/// Process memory counters, in bytes
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct MemoryStatistics {
    pub paged: u64,
    pub peak_paged: u64,
    #[serde(rename = "Virtual")]
    pub virtual_bytes: u64,
    #[serde(rename = "PeakVirtual")]
    pub peak_virtual_bytes: u64,
    pub working_set: u64,
    pub peak_working_set: u64,
}

impl MemoryStatistics {
    /// Render as the trailing comment line embedded in dump files
    pub fn to_comment_line(&self) -> String {
        // serialization of plain integers cannot fail
        let body = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("// Memory={body}")
    }
}

/// Identity of a snapshot, derived from its file name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotIdentity {
    pub index: usize,
    pub timestamp: NaiveDateTime,
    pub path: PathBuf,
}

impl SnapshotIdentity {
    /// Derive identity from `snapshot_<index>_<YYYYMMDD-HHMMSS>` style names
    ///
    /// Names that do not follow the convention get index 0 and the file's
    /// modification time, or the Unix epoch when that is unavailable.
    ///
    /// # Examples
    /// ```
    /// use heapscope_core::types::SnapshotIdentity;
    ///
    /// let id = SnapshotIdentity::from_path("dumps/snapshot_0004_20240115-103000.heap");
    /// assert_eq!(id.index, 4);
    /// assert_eq!(id.timestamp.format("%H:%M").to_string(), "10:30");
    /// ```
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        Self::from_file_name(path).unwrap_or_else(|| {
            let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok();
            Self::with_modified(path, modified)
        })
    }

    /// Like [`SnapshotIdentity::from_path`] with the modification time supplied
    ///
    /// Lets async callers fetch metadata without blocking. The time is read
    /// as local time, matching the timestamps in snapshot file names.
    pub fn with_modified(path: impl AsRef<Path>, modified: Option<SystemTime>) -> Self {
        let path = path.as_ref();
        Self::from_file_name(path).unwrap_or_else(|| Self {
            index: 0,
            timestamp: modified
                .map(|t| DateTime::<Local>::from(t).naive_local())
                .unwrap_or_default(),
            path: path.to_path_buf(),
        })
    }

    fn from_file_name(path: &Path) -> Option<Self> {
        let file_name = path.file_name()?.to_string_lossy();
        let (index, timestamp) = patterns::snapshot_filename(&file_name)?;
        Some(Self {
            index,
            timestamp,
            path: path.to_path_buf(),
        })
    }

    /// File name for a new snapshot with this index and timestamp
    pub fn file_name(index: usize, timestamp: NaiveDateTime) -> String {
        format!("snapshot_{index:04}_{}.heap", timestamp.format("%Y%m%d-%H%M%S"))
    }
}

/// A fully parsed heap dump
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub identity: SnapshotIdentity,
    /// Loaded modules keyed by normalized path, in declaration order
    pub modules: IndexMap<String, Module>,
    /// Heaps keyed and sorted by ID
    pub heaps: BTreeMap<HeapId, Heap>,
    pub tracebacks: HashMap<TracebackId, Traceback>,
    pub memory: MemoryStatistics,
}

impl Snapshot {
    pub fn new(identity: SnapshotIdentity) -> Self {
        Self {
            identity,
            modules: IndexMap::new(),
            heaps: BTreeMap::new(),
            tracebacks: HashMap::new(),
            memory: MemoryStatistics::default(),
        }
    }

    pub fn index(&self) -> usize {
        self.identity.index
    }

    pub fn timestamp(&self) -> NaiveDateTime {
        self.identity.timestamp
    }

    pub fn traceback(&self, id: TracebackId) -> Option<&Traceback> {
        self.tracebacks.get(&id)
    }

    /// Total allocation count across all heaps
    pub fn allocation_count(&self) -> usize {
        self.heaps.values().map(|h| h.allocations.len()).sum()
    }

    /// Total requested bytes across all heaps
    pub fn total_requested(&self) -> u64 {
        self.heaps.values().map(|h| h.info().total_requested).sum()
    }

    /// Every distinct raw frame address referenced by a traceback, sorted
    pub fn unique_frames(&self) -> Vec<u32> {
        let mut frames: Vec<u32> = self
            .tracebacks
            .values()
            .flat_map(|t| t.frames.iter().copied())
            .collect();
        frames.sort_unstable();
        frames.dedup();
        frames
    }

    /// Metadata that outlives the snapshot body
    pub fn summary(&self) -> HeapSnapshotInfo {
        HeapSnapshotInfo {
            identity: self.identity.clone(),
            memory: self.memory,
            heaps: self.heaps.values().map(|h| *h.info()).collect(),
            module_count: self.modules.len(),
            traceback_count: self.tracebacks.len(),
        }
    }
}

/// Snapshot metadata kept after the snapshot body has been evicted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeapSnapshotInfo {
    pub identity: SnapshotIdentity,
    pub memory: MemoryStatistics,
    pub heaps: Vec<HeapInfo>,
    pub module_count: usize,
    pub traceback_count: usize,
}

impl HeapSnapshotInfo {
    pub fn index(&self) -> usize {
        self.identity.index
    }

    pub fn allocation_count(&self) -> usize {
        self.heaps.iter().map(|h| h.allocation_count).sum()
    }

    pub fn total_requested(&self) -> u64 {
        self.heaps.iter().map(|h| h.total_requested).sum()
    }

    pub fn total_overhead(&self) -> u64 {
        self.heaps.iter().map(|h| h.total_overhead).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alloc(address: u32, size: u32, overhead: u32) -> Allocation {
        Allocation {
            address,
            size,
            overhead,
            traceback: TracebackId(1),
        }
    }

    #[test]
    fn test_module_identity_is_case_folded_path() {
        let a = Module::new(r"C:\App\Foo.DLL", 0x1000, 0x100);
        let b = Module::new(r"c:\app\foo.dll", 0x2000, 0x200);
        assert_eq!(a, b);
        assert_eq!(a.name(), "Foo.DLL");
        assert!(!a.contains(0x1100));
    }

    #[test]
    fn test_heap_info_empty_heap() {
        let info = HeapInfo::compute(HeapId(0x150000), &[]);
        assert_eq!(info.estimated_start, 0x150000);
        assert_eq!(info.estimated_size, 0);
        assert_eq!(info.occupied_spans, 0);
        assert_eq!(info.fragmentation(), 0.0);
    }

    #[test]
    fn test_heap_info_span_example() {
        let info = HeapInfo::compute(
            HeapId(0x1000),
            &[alloc(0x1000, 0x10, 0x4), alloc(0x1020, 0x8, 0x0)],
        );
        assert_eq!(info.estimated_start, 0x1000);
        assert_eq!(info.estimated_size, 0x28);
        assert_eq!(info.estimated_free, 0xC);
        assert_eq!(info.total_requested, 0x18);
        assert_eq!(info.total_overhead, 0x4);
        assert_eq!(info.largest_free_span, 0xC);
        assert_eq!(info.largest_occupied_span, 0x14);
        assert_eq!(info.occupied_spans, 2);
        assert_eq!(info.empty_spans, 1);
        assert_eq!(info.fragmentation(), 0.5);
    }

    #[test]
    fn test_heap_info_contiguous_and_overlapping() {
        let info = HeapInfo::compute(
            HeapId(0),
            &[
                alloc(0x100, 0x10, 0),
                alloc(0x110, 0x10, 0),
                alloc(0x118, 0x4, 0),
            ],
        );
        assert_eq!(info.occupied_spans, 1);
        assert_eq!(info.empty_spans, 0);
        assert_eq!(info.estimated_size, 0x20);
        assert_eq!(info.largest_occupied_span, 0x20);
        assert_eq!(info.estimated_free, 0);
    }

    #[test]
    fn test_heap_finalize_sorts() {
        let mut heap = Heap::new(HeapId(0x10));
        heap.allocations.push(alloc(0x300, 4, 0));
        heap.allocations.push(alloc(0x100, 4, 0));
        heap.allocations.push(alloc(0x200, 4, 0));
        heap.finalize();

        let addresses: Vec<u32> = heap.allocations.iter().map(|a| a.address).collect();
        assert_eq!(addresses, vec![0x100, 0x200, 0x300]);
        assert_eq!(heap.info().allocation_count, 3);
        assert_eq!(heap.info().empty_spans, 2);
    }

    #[test]
    fn test_memory_statistics_comment_line() {
        let stats = MemoryStatistics {
            paged: 10,
            virtual_bytes: 20,
            working_set: 30,
            ..Default::default()
        };
        let line = stats.to_comment_line();
        assert!(line.starts_with("// Memory={"));
        assert!(line.contains(r#""Virtual":20"#));
        assert!(line.contains(r#""WorkingSet":30"#));
    }

    #[test]
    fn test_identity_fallback() {
        let id = SnapshotIdentity::from_path("/nonexistent/custom.txt");
        assert_eq!(id.index, 0);
        assert_eq!(id.timestamp, NaiveDateTime::default());
    }

    #[test]
    fn test_identity_uses_modification_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manual.heap");
        std::fs::write(&path, "").unwrap();

        let id = SnapshotIdentity::from_path(&path);
        assert_eq!(id.index, 0);
        assert!(id.timestamp > NaiveDateTime::default());
        assert_eq!(id.path, path);
    }

    #[test]
    fn test_snapshot_serializes_modules() {
        let mut snapshot = Snapshot::new(SnapshotIdentity::from_path("snapshot_0001_20240101-000000.heap"));
        for module in [
            Module::new(r"c:\app\b.dll", 0x2000_0000, 0x1000),
            Module::new(r"c:\app\a.exe", 0x0040_0000, 0x1000),
        ] {
            snapshot.modules.insert(module.path().to_string(), module);
        }

        let value = serde_json::to_value(&snapshot).unwrap();
        let modules = value["modules"].as_object().unwrap();
        assert_eq!(modules.len(), 2);
        assert!(modules.contains_key(r"c:\app\a.exe"));
        assert_eq!(value["identity"]["index"], 1);
    }

    #[test]
    fn test_modification_time_is_local() {
        let modified = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000);
        let id = SnapshotIdentity::with_modified("/dumps/manual.heap", Some(modified));
        assert_eq!(id.index, 0);
        assert_eq!(id.timestamp, DateTime::<Local>::from(modified).naive_local());

        let named = SnapshotIdentity::with_modified("/dumps/snapshot_0003_20240101-120000.heap", Some(modified));
        assert_eq!(named.index, 3);
        assert_eq!(named.timestamp.format("%H%M%S").to_string(), "120000");

        let unknown = SnapshotIdentity::with_modified("/dumps/manual.heap", None);
        assert_eq!(unknown.timestamp, NaiveDateTime::default());
    }

    #[test]
    fn test_identity_file_name_round_trip() {
        let ts = chrono::NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(8, 5, 1)
            .unwrap();
        let name = SnapshotIdentity::file_name(12, ts);
        assert_eq!(name, "snapshot_0012_20240309-080501.heap");
        let id = SnapshotIdentity::from_path(&name);
        assert_eq!(id.index, 12);
        assert_eq!(id.timestamp, ts);
    }
}
