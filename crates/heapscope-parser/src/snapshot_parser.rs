//! Snapshot parser
//!
//! Turns one complete heap dump into a [`Snapshot`]. The dump is scanned line
//! by line through four states:
//!
//! 1. `ScanningForStart` skips preamble until the loaded-modules marker.
//! 2. `ScanningModules` registers module table entries until the
//!    modules-enumerated marker.
//! 3. `ScanningForMemoryMarker` waits for a heap block or the trailing
//!    memory statistics line, which ends the dump body.
//! 4. `ScanningHeap` collects allocation records until the heap end marker.
//!
//! The first allocation that references a traceback ID is followed by that
//! traceback's raw frames; later references carry no frames. Frames are
//! written into a [`FramePool`] so tracebacks share large chunks.
//!
//! # Examples
//!
//! ```
//! use heapscope_core::types::{SnapshotIdentity, HeapId};
//! use heapscope_parser::snapshot_parser::parse_snapshot;
//!
//! let text = "\
//! // Loaded modules:
//! //   400000     1000  c:\\app\\app.exe
//! // Process modules enumerated.
//! *- - - Start of data for heap @ 150000 - - -
//! 00000010 bytes + 00000008 at 00150020 by BackTrace00000001
//! \t00401010
//!
//! *- - - End of data for heap @ 150000 - - -
//! ";
//! let snapshot = parse_snapshot(SnapshotIdentity::from_path("snapshot_0001_20240101-120000.heap"), text);
//! assert_eq!(snapshot.modules.len(), 1);
//! assert_eq!(snapshot.heaps[&HeapId(0x150000)].allocations.len(), 1);
//! assert_eq!(snapshot.tracebacks.len(), 1);
//! ```

use heapscope_core::frame_pool::{FramePool, FrameSpan};
use heapscope_core::line_reader::LineReader;
use heapscope_core::patterns::{self, AllocationRecord};
use heapscope_core::types::{
    Allocation, Heap, HeapId, MemoryStatistics, Module, Snapshot, SnapshotIdentity, Traceback,
    TracebackId,
};
use rayon::prelude::*;
use std::collections::HashSet;
use tracing::{debug, trace, warn};

/// Lines between two progress callbacks
pub const PROGRESS_INTERVAL_LINES: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    ScanningForStart,
    ScanningModules,
    ScanningForMemoryMarker,
    ScanningHeap,
}

/// Counters describing one parse
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ParseStats {
    pub lines: usize,
    pub unrecognized_lines: usize,
    pub duplicate_tracebacks: usize,
    pub truncated_tracebacks: usize,
}

type ProgressCallback<'a> = Box<dyn FnMut(usize, usize) + Send + 'a>;

/// Parser for one heap dump
pub struct SnapshotParser<'a> {
    reader: LineReader<'a>,
    state: ScanState,
    snapshot: Snapshot,
    current_heap: Option<Heap>,
    frames: FramePool,
    pending_tracebacks: Vec<(TracebackId, FrameSpan)>,
    seen_tracebacks: HashSet<TracebackId>,
    stats: ParseStats,
    progress: Option<ProgressCallback<'a>>,
    next_progress: usize,
}

/// Parse a complete dump
pub fn parse_snapshot(identity: SnapshotIdentity, text: &str) -> Snapshot {
    SnapshotParser::new(identity, text).parse().0
}

impl<'a> SnapshotParser<'a> {
    pub fn new(identity: SnapshotIdentity, text: &'a str) -> Self {
        Self {
            reader: LineReader::new(text),
            state: ScanState::ScanningForStart,
            snapshot: Snapshot::new(identity),
            current_heap: None,
            frames: FramePool::new(),
            pending_tracebacks: Vec::new(),
            seen_tracebacks: HashSet::new(),
            stats: ParseStats::default(),
            progress: None,
            next_progress: PROGRESS_INTERVAL_LINES,
        }
    }

    /// Report `(bytes consumed, total bytes)` every few hundred lines
    pub fn with_progress(mut self, callback: impl FnMut(usize, usize) + Send + 'a) -> Self {
        self.progress = Some(Box::new(callback));
        self
    }

    /// Use a frame pool with a custom chunk size
    pub fn with_frame_pool(mut self, frames: FramePool) -> Self {
        self.frames = frames;
        self
    }

    /// Run the parse to completion
    pub fn parse(mut self) -> (Snapshot, ParseStats) {
        while let Some(line) = self.reader.read_line() {
            self.stats.lines += 1;
            if self.stats.lines >= self.next_progress {
                self.next_progress = self.stats.lines + PROGRESS_INTERVAL_LINES;
                if let Some(progress) = self.progress.as_mut() {
                    progress(self.reader.position(), self.reader.len());
                }
            }

            let text = line.text;
            match self.state {
                ScanState::ScanningForStart => {
                    if patterns::is_loaded_modules_marker(text) {
                        self.state = ScanState::ScanningModules;
                    } else if let Some(id) = patterns::heap_header(text) {
                        debug!("Heap data before module table, skipping modules");
                        self.start_heap(id);
                    } else {
                        self.unrecognized(text);
                    }
                }
                ScanState::ScanningModules => {
                    if let Some(decl) = patterns::module_decl(text) {
                        let module = Module::new(decl.path, decl.base, decl.size);
                        self.snapshot
                            .modules
                            .insert(module.path().to_string(), module);
                    } else if patterns::is_modules_enumerated_marker(text) {
                        self.state = ScanState::ScanningForMemoryMarker;
                    } else if let Some(id) = patterns::heap_header(text) {
                        debug!("Module table not terminated before heap data");
                        self.start_heap(id);
                    } else {
                        self.unrecognized(text);
                    }
                }
                ScanState::ScanningForMemoryMarker => {
                    if let Some(id) = patterns::heap_header(text) {
                        self.start_heap(id);
                    } else if let Some(json) = patterns::memory_statistics(text) {
                        self.snapshot.memory = parse_memory_statistics(json);
                        break;
                    } else {
                        self.unrecognized(text);
                    }
                }
                ScanState::ScanningHeap => {
                    if patterns::is_heap_end(text) {
                        self.end_heap();
                    } else if let Some(record) = patterns::allocation_record(text) {
                        self.add_allocation(record);
                    } else if let Some(id) = patterns::heap_header(text) {
                        debug!("Heap {} started before previous heap ended", id);
                        self.end_heap();
                        self.start_heap(id);
                    } else {
                        self.unrecognized(text);
                    }
                }
            }
        }

        if self.current_heap.is_some() {
            debug!("Dump ended inside a heap block");
            self.end_heap();
        }

        if let Some(progress) = self.progress.as_mut() {
            progress(self.reader.len(), self.reader.len());
        }

        self.finish()
    }

    fn unrecognized(&mut self, text: &str) {
        if !text.trim().is_empty() {
            self.stats.unrecognized_lines += 1;
            trace!("Skipping unrecognized line: {}", text);
        }
    }

    fn start_heap(&mut self, id: HeapId) {
        let heap = self
            .snapshot
            .heaps
            .remove(&id)
            .unwrap_or_else(|| Heap::new(id));
        self.current_heap = Some(heap);
        self.state = ScanState::ScanningHeap;
    }

    fn end_heap(&mut self) {
        if let Some(mut heap) = self.current_heap.take() {
            heap.allocations.shrink_to_fit();
            self.snapshot.heaps.insert(heap.id, heap);
        }
        self.state = ScanState::ScanningForMemoryMarker;
    }

    fn add_allocation(&mut self, record: AllocationRecord) {
        if let Some(heap) = self.current_heap.as_mut() {
            heap.allocations.push(Allocation {
                address: record.address,
                size: record.size,
                overhead: record.overhead,
                traceback: record.traceback,
            });
        }

        let is_new = self.seen_tracebacks.insert(record.traceback);
        if is_new {
            self.frames.begin();
        }

        let mut truncated = false;
        let mut ignored_frames = 0usize;
        while let Some(line) = self.reader.read_line() {
            if let Some(frame) = patterns::raw_frame(line.text) {
                self.stats.lines += 1;
                if !is_new {
                    ignored_frames += 1;
                } else if !self.frames.push(frame) {
                    truncated = true;
                }
            } else if line.is_blank() {
                self.stats.lines += 1;
                break;
            } else {
                self.reader.rewind(line);
                break;
            }
        }

        if is_new {
            let span = self.frames.finish();
            self.pending_tracebacks.push((record.traceback, span));
            if truncated {
                self.stats.truncated_tracebacks += 1;
                debug!("Traceback {} truncated to {} frames", record.traceback, span.len());
            }
        } else if ignored_frames > 0 {
            self.stats.duplicate_tracebacks += 1;
            debug!(
                "Duplicate definition of traceback {} ignored ({} frames)",
                record.traceback, ignored_frames
            );
        }
    }

    fn finish(mut self) -> (Snapshot, ParseStats) {
        let frozen = self.frames.freeze();
        self.snapshot.tracebacks.reserve(self.pending_tracebacks.len());
        for (id, span) in self.pending_tracebacks {
            self.snapshot
                .tracebacks
                .insert(id, Traceback::new(id, frozen.slice(span)));
        }

        self.snapshot
            .heaps
            .par_iter_mut()
            .for_each(|(_, heap)| heap.finalize());

        debug!(
            "Parsed snapshot {}: {} modules, {} heaps, {} allocations, {} tracebacks ({} unrecognized lines)",
            self.snapshot.index(),
            self.snapshot.modules.len(),
            self.snapshot.heaps.len(),
            self.snapshot.allocation_count(),
            self.snapshot.tracebacks.len(),
            self.stats.unrecognized_lines
        );

        (self.snapshot, self.stats)
    }
}

/// Parse the JSON body of a memory statistics line
///
/// A malformed body is logged and yields zeroed statistics.
pub fn parse_memory_statistics(json: &str) -> MemoryStatistics {
    match serde_json::from_str(json) {
        Ok(memory) => memory,
        Err(e) => {
            warn!("Ignoring malformed memory statistics: {}", e);
            MemoryStatistics::default()
        }
    }
}
