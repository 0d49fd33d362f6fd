//! Output formatting for heapscope
//!
//! Formatters render snapshot summaries, per-traceback reports, and diffs
//! either as tables for a terminal or as JSON for other tools.
//!
//! # Examples
//!
//! ```
//! use heapscope::output::get_formatter;
//! use heapscope_core::Diff;
//!
//! let diff = Diff::default();
//! let table = get_formatter(false).format_diff(&diff, 10);
//! assert!(table.contains("TOTAL"));
//!
//! let json: serde_json::Value =
//!     serde_json::from_str(&get_formatter(true).format_diff(&diff, 10)).unwrap();
//! assert_eq!(json["totals"]["bytes_delta"], 0);
//! ```

use crate::report::TracebackReport;
use heapscope_core::{Diff, HeapSnapshotInfo};
use prettytable::{Table, format, row};
use serde_json::json;

/// Renders session results
pub trait OutputFormatter {
    /// Snapshot summaries with one row per heap
    fn format_snapshots(&self, snapshots: &[HeapSnapshotInfo]) -> String;

    /// Largest tracebacks of one snapshot
    fn format_tracebacks(&self, snapshot: &HeapSnapshotInfo, reports: &[TracebackReport]) -> String;

    /// The `limit` largest diff entries plus totals
    fn format_diff(&self, diff: &Diff, limit: usize) -> String;
}

/// Table formatter for human-readable output
pub struct TableFormatter;

impl TableFormatter {
    /// Format a number with thousands separators
    fn format_number(n: u64) -> String {
        let s = n.to_string();
        let mut result = String::new();

        for (count, ch) in s.chars().rev().enumerate() {
            if count > 0 && count % 3 == 0 {
                result.push(',');
            }
            result.push(ch);
        }

        result.chars().rev().collect()
    }

    fn format_signed(n: i64) -> String {
        let magnitude = Self::format_number(n.unsigned_abs());
        if n < 0 {
            format!("-{magnitude}")
        } else {
            format!("+{magnitude}")
        }
    }

    fn format_percent(ratio: f64) -> String {
        format!("{:.1}%", ratio * 100.0)
    }
}

impl OutputFormatter for TableFormatter {
    fn format_snapshots(&self, snapshots: &[HeapSnapshotInfo]) -> String {
        let mut table = Table::new();
        table.set_format(*format::consts::FORMAT_NO_LINESEP_WITH_TITLE);
        table.set_titles(row![
            b -> "Snapshot",
            b -> "Taken",
            b -> "Heap",
            b -> "Allocations",
            b -> "Requested",
            b -> "Overhead",
            b -> "Est. Size",
            b -> "Est. Free",
            b -> "Largest Free",
            b -> "Fragmentation"
        ]);

        let mut allocations = 0usize;
        let mut requested = 0u64;
        let mut overhead = 0u64;
        for snapshot in snapshots {
            let taken = snapshot.identity.timestamp.format("%Y-%m-%d %H:%M:%S").to_string();
            for heap in &snapshot.heaps {
                table.add_row(row![
                    snapshot.index(),
                    taken,
                    heap.heap_id,
                    r -> Self::format_number(heap.allocation_count as u64),
                    r -> Self::format_number(heap.total_requested),
                    r -> Self::format_number(heap.total_overhead),
                    r -> Self::format_number(heap.estimated_size),
                    r -> Self::format_number(heap.estimated_free),
                    r -> Self::format_number(heap.largest_free_span),
                    r -> Self::format_percent(heap.fragmentation())
                ]);
            }
            if snapshot.heaps.is_empty() {
                table.add_row(row![snapshot.index(), taken, "-", r -> "0", r -> "0", r -> "0", "", "", "", ""]);
            }
            allocations += snapshot.allocation_count();
            requested += snapshot.total_requested();
            overhead += snapshot.total_overhead();
        }

        table.add_row(row![
            b -> "TOTAL",
            "",
            "",
            br -> Self::format_number(allocations as u64),
            br -> Self::format_number(requested),
            br -> Self::format_number(overhead),
            "",
            "",
            "",
            ""
        ]);
        table.to_string()
    }

    fn format_tracebacks(&self, snapshot: &HeapSnapshotInfo, reports: &[TracebackReport]) -> String {
        let mut table = Table::new();
        table.set_format(*format::consts::FORMAT_NO_LINESEP_WITH_TITLE);
        table.set_titles(row![
            b -> "Traceback",
            b -> "Allocations",
            b -> "Requested",
            b -> "Overhead",
            b -> "Call Stack"
        ]);

        for report in reports {
            let stack = if report.frames.is_empty() {
                "-".to_string()
            } else {
                report
                    .frames
                    .iter()
                    .map(|frame| frame.to_string())
                    .collect::<Vec<_>>()
                    .join("\n")
            };
            table.add_row(row![
                report.traceback,
                r -> Self::format_number(report.allocation_count as u64),
                r -> Self::format_number(report.total_requested),
                r -> Self::format_number(report.total_overhead),
                stack
            ]);
        }

        format!(
            "Snapshot {} ({})\n{}",
            snapshot.index(),
            snapshot.identity.path.display(),
            table
        )
    }

    fn format_diff(&self, diff: &Diff, limit: usize) -> String {
        let mut table = Table::new();
        table.set_format(*format::consts::FORMAT_NO_LINESEP_WITH_TITLE);
        table.set_titles(row![
            b -> "Traceback",
            b -> "Bytes Delta",
            b -> "Old Bytes",
            b -> "New Bytes",
            b -> "Count Delta",
            b -> "Top Frame"
        ]);

        for entry in diff.entries.iter().take(limit) {
            let top = entry
                .traceback
                .frames
                .first()
                .map(|frame| frame.to_string())
                .unwrap_or_else(|| "-".to_string());
            table.add_row(row![
                entry.traceback.id,
                r -> Self::format_signed(entry.bytes_delta),
                r -> Self::format_number(entry.old_bytes),
                r -> Self::format_number(entry.new_bytes),
                r -> Self::format_signed(entry.count_delta()),
                top
            ]);
        }

        table.add_row(row![
            b -> "TOTAL",
            br -> Self::format_signed(diff.total_bytes_delta()),
            "",
            "",
            br -> Self::format_signed(diff.total_count_delta()),
            format!("{} records", diff.entries.len())
        ]);
        table.to_string()
    }
}

/// JSON formatter for machine-readable output
pub struct JsonFormatter;

impl OutputFormatter for JsonFormatter {
    fn format_snapshots(&self, snapshots: &[HeapSnapshotInfo]) -> String {
        let output = json!({
            "snapshots": snapshots.iter().map(|s| json!({
                "index": s.index(),
                "timestamp": s.identity.timestamp.format("%Y-%m-%dT%H:%M:%S").to_string(),
                "path": s.identity.path,
                "memory": s.memory,
                "module_count": s.module_count,
                "traceback_count": s.traceback_count,
                "heaps": s.heaps,
                "allocation_count": s.allocation_count(),
                "total_requested": s.total_requested(),
                "total_overhead": s.total_overhead(),
            })).collect::<Vec<_>>(),
        });
        serde_json::to_string_pretty(&output).unwrap_or_else(|_| "{}".to_string())
    }

    fn format_tracebacks(&self, snapshot: &HeapSnapshotInfo, reports: &[TracebackReport]) -> String {
        let output = json!({
            "snapshot": snapshot.index(),
            "tracebacks": reports.iter().map(|r| json!({
                "traceback": r.traceback.to_string(),
                "allocation_count": r.allocation_count,
                "total_requested": r.total_requested,
                "total_overhead": r.total_overhead,
                "frames": r.frames.iter().map(|f| f.to_string()).collect::<Vec<_>>(),
            })).collect::<Vec<_>>(),
        });
        serde_json::to_string_pretty(&output).unwrap_or_else(|_| "{}".to_string())
    }

    fn format_diff(&self, diff: &Diff, limit: usize) -> String {
        let output = json!({
            "modules": diff.modules.iter().map(|m| json!({
                "module": m.module,
                "symbol_type": m.symbol_type,
            })).collect::<Vec<_>>(),
            "entries": diff.entries.iter().take(limit).map(|e| json!({
                "traceback": e.traceback.id.to_string(),
                "bytes_delta": e.bytes_delta,
                "old_bytes": e.old_bytes,
                "new_bytes": e.new_bytes,
                "old_count": e.old_count,
                "new_count": e.new_count,
                "frames": e.traceback.frames,
            })).collect::<Vec<_>>(),
            "totals": {
                "records": diff.entries.len(),
                "bytes_delta": diff.total_bytes_delta(),
                "count_delta": diff.total_count_delta(),
            },
        });
        serde_json::to_string_pretty(&output).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Formatter for the requested output mode
pub fn get_formatter(json: bool) -> Box<dyn OutputFormatter> {
    if json {
        Box::new(JsonFormatter)
    } else {
        Box::new(TableFormatter)
    }
}
