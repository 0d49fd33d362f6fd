//! Core types, line grammar, and tool plumbing for heapscope
//!
//! This crate provides the data model of a parsed heap dump, the zero-copy
//! line reader and line recognizers the parsers are built on, chunked frame
//! storage, progress counters, and the wrapper around the
//! external heap tool.

pub mod diff_types;
pub mod dump_writer;
pub mod error;
pub mod frame_pool;
pub mod line_reader;
pub mod patterns;
pub mod progress;
pub mod tool;
pub mod types;

// Re-export commonly used types
pub use diff_types::{Diff, DiffEntry, DiffTraceback, SymbolInfo};
pub use error::{HeapscopeError, Result};
pub use progress::{Progress, SessionEvent};
pub use types::{
    Allocation, Heap, HeapId, HeapInfo, HeapSnapshotInfo, MemoryStatistics, Module, Snapshot,
    SnapshotIdentity, Traceback, TracebackId,
};
