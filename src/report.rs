//! Per-traceback allocation reports
//!
//! Groups a snapshot's allocations by the call stack that made them and
//! ranks the stacks by requested bytes.

use heapscope_core::{Snapshot, SymbolInfo, TracebackId};
use heapscope_symbols::SymbolPipeline;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Allocations attributed to one traceback
#[derive(Debug, Clone, Serialize)]
pub struct TracebackReport {
    pub traceback: TracebackId,
    pub allocation_count: usize,
    pub total_requested: u64,
    pub total_overhead: u64,
    /// Symbolized frames, innermost first; empty until symbolized
    pub frames: Vec<Arc<SymbolInfo>>,
}

/// The `limit` tracebacks holding the most requested bytes
///
/// Ties are broken by traceback ID so the ranking is stable.
pub fn top_tracebacks(snapshot: &Snapshot, limit: usize) -> Vec<TracebackReport> {
    let mut totals: HashMap<TracebackId, TracebackReport> = HashMap::new();
    for heap in snapshot.heaps.values() {
        for allocation in &heap.allocations {
            let report = totals
                .entry(allocation.traceback)
                .or_insert_with(|| TracebackReport {
                    traceback: allocation.traceback,
                    allocation_count: 0,
                    total_requested: 0,
                    total_overhead: 0,
                    frames: Vec::new(),
                });
            report.allocation_count += 1;
            report.total_requested += u64::from(allocation.size);
            report.total_overhead += u64::from(allocation.overhead);
        }
    }

    let mut reports: Vec<TracebackReport> = totals.into_values().collect();
    reports.sort_by(|a, b| {
        b.total_requested
            .cmp(&a.total_requested)
            .then(a.traceback.cmp(&b.traceback))
    });
    reports.truncate(limit);
    reports
}

/// Fill in the frames of each report, waiting for resolution
pub async fn symbolize_reports(
    snapshot: &Snapshot,
    reports: &mut [TracebackReport],
    pipeline: &SymbolPipeline,
) {
    for report in reports.iter_mut() {
        if let Some(traceback) = snapshot.traceback(report.traceback) {
            report.frames = pipeline.symbolize(traceback).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heapscope_core::{Allocation, Heap, HeapId, SnapshotIdentity};

    fn allocation(address: u32, size: u32, traceback: u32) -> Allocation {
        Allocation {
            address,
            size,
            overhead: 4,
            traceback: TracebackId(traceback),
        }
    }

    #[test]
    fn test_top_tracebacks_ranks_by_bytes() {
        let mut snapshot = Snapshot::new(SnapshotIdentity::from_path("snapshot_0001_20240101-000000.heap"));
        let mut first = Heap::new(HeapId(0x1000));
        first.allocations = vec![allocation(0x1000, 0x10, 1), allocation(0x1020, 0x40, 2)];
        let mut second = Heap::new(HeapId(0x2000));
        second.allocations = vec![allocation(0x2000, 0x40, 1), allocation(0x2050, 0x30, 3)];
        snapshot.heaps.insert(first.id, first);
        snapshot.heaps.insert(second.id, second);

        let reports = top_tracebacks(&snapshot, 2);
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].traceback, TracebackId(1));
        assert_eq!(reports[0].allocation_count, 2);
        assert_eq!(reports[0].total_requested, 0x50);
        assert_eq!(reports[0].total_overhead, 8);
        assert_eq!(reports[1].traceback, TracebackId(2));
    }

    #[test]
    fn test_empty_snapshot() {
        let snapshot = Snapshot::new(SnapshotIdentity::from_path("empty.heap"));
        assert!(top_tracebacks(&snapshot, 5).is_empty());
    }
}
