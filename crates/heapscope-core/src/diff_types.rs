//! Types produced by diffing two snapshots
//!
//! Diff output is symbolized, so its tracebacks carry [`SymbolInfo`] frames
//! instead of raw addresses. The same [`SymbolInfo`] type is what symbol
//! resolution hands back for a raw frame address.

use crate::types::TracebackId;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Module name used for frames nobody could resolve
pub const UNKNOWN_MODULE: &str = "<unknown>";

/// Human-readable location of a stack frame
///
/// # Examples
/// ```
/// use heapscope_core::diff_types::SymbolInfo;
///
/// let unknown = SymbolInfo::unknown(0x7C90D6DC);
/// assert!(unknown.is_unknown());
/// assert_eq!(unknown.to_string(), "<unknown>!0x7C90D6DC+0x0");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub module: String,
    pub function: String,
    pub offset: u32,
    pub secondary_offset: Option<u32>,
    pub source_file: Option<String>,
    pub source_line: Option<u32>,
}

impl SymbolInfo {
    /// Placeholder for an address that could not be resolved
    pub fn unknown(address: u32) -> Self {
        Self {
            module: UNKNOWN_MODULE.to_string(),
            function: format!("0x{address:08X}"),
            offset: 0,
            secondary_offset: None,
            source_file: None,
            source_line: None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.module == UNKNOWN_MODULE
    }
}

impl fmt::Display for SymbolInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}!{}+0x{:X}", self.module, self.function, self.offset)?;
        if let Some(secondary) = self.secondary_offset {
            write!(f, ":0x{secondary:X}")?;
        }
        if let (Some(file), Some(line)) = (&self.source_file, self.source_line) {
            write!(f, " ({file}:{line})")?;
        }
        Ok(())
    }
}

/// A symbolized call stack from diff output
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiffTraceback {
    pub id: TracebackId,
    pub frames: SmallVec<[SymbolInfo; 4]>,
}

/// Symbol quality the diff tool reported for one module
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleSymbols {
    pub module: String,
    pub symbol_type: String,
}

/// Before/after comparison for one traceback
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiffEntry {
    /// new_bytes - old_bytes, as reported
    pub bytes_delta: i64,
    pub old_bytes: u64,
    pub new_bytes: u64,
    pub old_count: u64,
    pub new_count: u64,
    pub traceback: Arc<DiffTraceback>,
}

impl DiffEntry {
    pub fn count_delta(&self) -> i64 {
        self.new_count as i64 - self.old_count as i64
    }
}

/// Parsed output of a snapshot diff
#[derive(Debug, Clone, Default, Serialize)]
pub struct Diff {
    pub modules: Vec<ModuleSymbols>,
    pub tracebacks: HashMap<TracebackId, Arc<DiffTraceback>>,
    pub entries: Vec<DiffEntry>,
}

impl Diff {
    pub fn total_bytes_delta(&self) -> i64 {
        self.entries.iter().map(|e| e.bytes_delta).sum()
    }

    pub fn total_count_delta(&self) -> i64 {
        self.entries.iter().map(DiffEntry::count_delta).sum()
    }

    /// Sort entries by absolute byte delta, largest first
    pub fn sort_by_magnitude(&mut self) {
        self.entries
            .sort_by(|a, b| b.bytes_delta.unsigned_abs().cmp(&a.bytes_delta.unsigned_abs()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn entry(id: u32, old: u64, new: u64) -> DiffEntry {
        DiffEntry {
            bytes_delta: new as i64 - old as i64,
            old_bytes: old,
            new_bytes: new,
            old_count: 1,
            new_count: 3,
            traceback: Arc::new(DiffTraceback {
                id: TracebackId(id),
                frames: smallvec![],
            }),
        }
    }

    #[test]
    fn test_symbol_display() {
        let symbol = SymbolInfo {
            module: "app".to_string(),
            function: "Widget::new".to_string(),
            offset: 0x1A,
            secondary_offset: Some(0x4),
            source_file: Some(r"c:\src\widget.cpp".to_string()),
            source_line: Some(42),
        };
        assert_eq!(
            symbol.to_string(),
            r"app!Widget::new+0x1A:0x4 (c:\src\widget.cpp:42)"
        );
        assert!(!symbol.is_unknown());
    }

    #[test]
    fn test_totals_and_sorting() {
        let mut diff = Diff {
            entries: vec![entry(1, 100, 110), entry(2, 500, 100), entry(3, 0, 50)],
            ..Default::default()
        };
        assert_eq!(diff.total_bytes_delta(), 10 - 400 + 50);
        assert_eq!(diff.total_count_delta(), 6);

        diff.sort_by_magnitude();
        let ids: Vec<u32> = diff.entries.iter().map(|e| e.traceback.id.0).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }
}
