//! Line grammar of heap dumps and diff output
//!
//! Each recognizer is a pure function from one line to an optional record.
//! Numeric fields are hexadecimal, except the source line number in a diff
//! frame, which is decimal.

use crate::diff_types::SymbolInfo;
use crate::types::{HeapId, TracebackId};
use chrono::NaiveDateTime;
use once_cell::sync::Lazy;
use regex::Regex;

static MODULE_DECL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^//\s+([0-9A-Fa-f]+)\s+([0-9A-Fa-f]+)\s+(\S.*?)\s*$").unwrap()
});

static MODULE_SYMBOLS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:DBGHELP:\s+)?(\S.*?) - (\S.*symbols.*?)\s*$").unwrap());

static BYTES_DELTA_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^([+-])\s*([0-9A-Fa-f]+)\s*\(\s*([0-9A-Fa-f]+)\s*-\s*([0-9A-Fa-f]+)\s*\)\s*([0-9A-Fa-f]+)\s+allocs\s+BackTrace([0-9A-Fa-f]+)\s*$",
    )
    .unwrap()
});

static COUNT_DELTA_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^([+-])\s*([0-9A-Fa-f]+)\s*\(\s*([0-9A-Fa-f]+)\s*-\s*([0-9A-Fa-f]+)\s*\)\s+BackTrace([0-9A-Fa-f]+)\s+allocations\s*$",
    )
    .unwrap()
});

static FRAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\t\s*([^!\s][^!]*)!(.+?)\+([0-9A-Fa-f]+)(?::([0-9A-Fa-f]+))?(?:\s*\((.+),\s*(\d+)\))?\s*$",
    )
    .unwrap()
});

static HEAP_START_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\*[-\s]*Start of data for heap @\s*([0-9A-Fa-f]+)").unwrap());

static HEAP_END_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\*[-\s.]*End of data for heap").unwrap());

static ALLOCATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s*([0-9A-Fa-f]+)\s+bytes\s+\+\s+([0-9A-Fa-f]+)\s+at\s+([0-9A-Fa-f]+)\s+by\s+BackTrace([0-9A-Fa-f]+)",
    )
    .unwrap()
});

static MEMORY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^//\s*Memory\s*=\s*(\{.*\})\s*$").unwrap());

static SNAPSHOT_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+)_(\d{8}-\d{6})").unwrap());

/// Marker that precedes the module table
pub const LOADED_MODULES_MARKER: &str = "Loaded modules";

/// Marker that follows the module table
pub const MODULES_ENUMERATED_MARKER: &str = "Process modules enumerated";

/// Parse a hexadecimal field into 32 bits
pub fn parse_hex(text: &str) -> Option<u32> {
    u32::from_str_radix(text, 16).ok()
}

/// `// <base> <size> <path>` from the snapshot module table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleDecl<'a> {
    pub base: u32,
    pub size: u32,
    pub path: &'a str,
}

pub fn module_decl(line: &str) -> Option<ModuleDecl<'_>> {
    let caps = MODULE_DECL_RE.captures(line)?;
    Some(ModuleDecl {
        base: parse_hex(caps.get(1)?.as_str())?,
        size: parse_hex(caps.get(2)?.as_str())?,
        path: caps.get(3)?.as_str(),
    })
}

/// `<module> - <symbol type>` lines printed by the diff tool
pub fn module_symbols(line: &str) -> Option<(&str, &str)> {
    let caps = MODULE_SYMBOLS_RE.captures(line)?;
    Some((caps.get(1)?.as_str(), caps.get(2)?.as_str()))
}

/// Byte delta header of one diff record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BytesDelta {
    pub delta: i64,
    pub new_bytes: u32,
    pub old_bytes: u32,
    pub new_count: u32,
    pub traceback: TracebackId,
}

fn signed(sign: &str, magnitude: u32) -> i64 {
    if sign == "-" {
        -(magnitude as i64)
    } else {
        magnitude as i64
    }
}

pub fn bytes_delta(line: &str) -> Option<BytesDelta> {
    let caps = BYTES_DELTA_RE.captures(line)?;
    Some(BytesDelta {
        delta: signed(caps.get(1)?.as_str(), parse_hex(caps.get(2)?.as_str())?),
        new_bytes: parse_hex(caps.get(3)?.as_str())?,
        old_bytes: parse_hex(caps.get(4)?.as_str())?,
        new_count: parse_hex(caps.get(5)?.as_str())?,
        traceback: TracebackId(parse_hex(caps.get(6)?.as_str())?),
    })
}

/// Allocation count companion line of one diff record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountDelta {
    pub delta: i64,
    pub new_count: u32,
    pub old_count: u32,
    pub traceback: TracebackId,
}

pub fn count_delta(line: &str) -> Option<CountDelta> {
    let caps = COUNT_DELTA_RE.captures(line)?;
    Some(CountDelta {
        delta: signed(caps.get(1)?.as_str(), parse_hex(caps.get(2)?.as_str())?),
        new_count: parse_hex(caps.get(3)?.as_str())?,
        old_count: parse_hex(caps.get(4)?.as_str())?,
        traceback: TracebackId(parse_hex(caps.get(5)?.as_str())?),
    })
}

/// `\t<module>!<function>+<offset>[:<offset2>][ (<file>, <line>)]`
pub fn traceback_frame(line: &str) -> Option<SymbolInfo> {
    let caps = FRAME_RE.captures(line)?;
    Some(SymbolInfo {
        module: caps.get(1)?.as_str().trim().to_string(),
        function: caps.get(2)?.as_str().to_string(),
        offset: parse_hex(caps.get(3)?.as_str())?,
        secondary_offset: caps.get(4).and_then(|m| parse_hex(m.as_str())),
        source_file: caps.get(5).map(|m| m.as_str().trim().to_string()),
        source_line: caps.get(6).and_then(|m| m.as_str().parse().ok()),
    })
}

/// Heap ID from a heap block start line
pub fn heap_header(line: &str) -> Option<HeapId> {
    let caps = HEAP_START_RE.captures(line)?;
    Some(HeapId(parse_hex(caps.get(1)?.as_str())?))
}

pub fn is_heap_end(line: &str) -> bool {
    HEAP_END_RE.is_match(line)
}

/// `<size> bytes + <overhead> at <address> by BackTrace<id>`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationRecord {
    pub size: u32,
    pub overhead: u32,
    pub address: u32,
    pub traceback: TracebackId,
}

pub fn allocation_record(line: &str) -> Option<AllocationRecord> {
    let caps = ALLOCATION_RE.captures(line)?;
    Some(AllocationRecord {
        size: parse_hex(caps.get(1)?.as_str())?,
        overhead: parse_hex(caps.get(2)?.as_str())?,
        address: parse_hex(caps.get(3)?.as_str())?,
        traceback: TracebackId(parse_hex(caps.get(4)?.as_str())?),
    })
}

/// Tab-indented raw frame address following an allocation record
pub fn raw_frame(line: &str) -> Option<u32> {
    let text = line.strip_prefix('\t')?.trim();
    if text.is_empty() || text.len() > 8 {
        return None;
    }
    parse_hex(text)
}

pub fn is_loaded_modules_marker(line: &str) -> bool {
    line.starts_with("//") && line.contains(LOADED_MODULES_MARKER)
}

pub fn is_modules_enumerated_marker(line: &str) -> bool {
    line.starts_with("//") && line.contains(MODULES_ENUMERATED_MARKER)
}

/// JSON body of a `// Memory=<object>` line
pub fn memory_statistics(line: &str) -> Option<&str> {
    Some(MEMORY_RE.captures(line)?.get(1)?.as_str())
}

/// Index and timestamp encoded in a snapshot file name
pub fn snapshot_filename(name: &str) -> Option<(usize, NaiveDateTime)> {
    let caps = SNAPSHOT_NAME_RE.captures(name)?;
    let index = caps.get(1)?.as_str().parse().ok()?;
    let timestamp = NaiveDateTime::parse_from_str(caps.get(2)?.as_str(), "%Y%m%d-%H%M%S").ok()?;
    Some((index, timestamp))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_decl() {
        let decl = module_decl(r"//   7C900000    B2000  C:\WINDOWS\system32\ntdll.dll").unwrap();
        assert_eq!(decl.base, 0x7C900000);
        assert_eq!(decl.size, 0xB2000);
        assert_eq!(decl.path, r"C:\WINDOWS\system32\ntdll.dll");

        assert!(module_decl("//     Base     Size  Module").is_none());
        assert!(module_decl("// Loaded modules:").is_none());
    }

    #[test]
    fn test_module_symbols() {
        let (module, kind) = module_symbols("DBGHELP: ntdll - export symbols").unwrap();
        assert_eq!(module, "ntdll");
        assert_eq!(kind, "export symbols");

        let (module, kind) = module_symbols(r"c:\app\app.exe - private symbols & lines").unwrap();
        assert_eq!(module, r"c:\app\app.exe");
        assert_eq!(kind, "private symbols & lines");
    }

    #[test]
    fn test_bytes_delta() {
        let delta =
            bytes_delta("+   1A0 (   3C0 -   220)      4 allocs\tBackTrace00A7E8A0").unwrap();
        assert_eq!(delta.delta, 0x1A0);
        assert_eq!(delta.new_bytes, 0x3C0);
        assert_eq!(delta.old_bytes, 0x220);
        assert_eq!(delta.new_count, 4);
        assert_eq!(delta.traceback, TracebackId(0x00A7E8A0));

        let negative = bytes_delta("- 10 (0 - 10) 0 allocs\tBackTrace1").unwrap();
        assert_eq!(negative.delta, -0x10);
    }

    #[test]
    fn test_count_delta() {
        let count = count_delta("+     2 (     4 -     2)\tBackTrace00A7E8A0\tallocations").unwrap();
        assert_eq!(count.delta, 2);
        assert_eq!(count.new_count, 4);
        assert_eq!(count.old_count, 2);
        assert_eq!(count.traceback, TracebackId(0x00A7E8A0));

        assert!(count_delta("+ 1A0 (3C0 - 220) 4 allocs\tBackTrace1").is_none());
    }

    #[test]
    fn test_traceback_frame_variants() {
        let plain = traceback_frame("\tntdll!RtlAllocateHeap+00000123").unwrap();
        assert_eq!(plain.module, "ntdll");
        assert_eq!(plain.function, "RtlAllocateHeap");
        assert_eq!(plain.offset, 0x123);
        assert_eq!(plain.secondary_offset, None);
        assert_eq!(plain.source_file, None);
        assert_eq!(plain.source_line, None);

        let full = traceback_frame("\tapp!Widget::Grow+1A:4 (c:\\src\\widget.cpp, 120)").unwrap();
        assert_eq!(full.function, "Widget::Grow");
        assert_eq!(full.offset, 0x1A);
        assert_eq!(full.secondary_offset, Some(4));
        assert_eq!(full.source_file.as_deref(), Some(r"c:\src\widget.cpp"));
        assert_eq!(full.source_line, Some(120));

        assert!(traceback_frame("ntdll!RtlAllocateHeap+123").is_none());
        assert!(traceback_frame("\t7C96D6DC").is_none());
    }

    #[test]
    fn test_heap_markers() {
        assert_eq!(
            heap_header("*- - - - - - - - - - Start of data for heap @ 150000 - - - - - - - - - -"),
            Some(HeapId(0x150000))
        );
        assert_eq!(
            heap_header("*---- Start of data for heap @ 00250000"),
            Some(HeapId(0x250000))
        );
        assert!(is_heap_end("*- - - - - End of data for heap @ 150000 - - - - -"));
        assert!(is_heap_end("*- ... End of data for heap"));
        assert!(!is_heap_end("*- - - Heap 150000 Hogs - - -"));
    }

    #[test]
    fn test_allocation_record() {
        let record = allocation_record("000001D8 bytes + 00000028 at 00159C70 by BackTrace00A7E8A0").unwrap();
        assert_eq!(record.size, 0x1D8);
        assert_eq!(record.overhead, 0x28);
        assert_eq!(record.address, 0x159C70);
        assert_eq!(record.traceback, TracebackId(0xA7E8A0));

        assert!(allocation_record("REQUESTED bytes + OVERHEAD at ADDRESS by BackTraceID").is_none());
    }

    #[test]
    fn test_raw_frame() {
        assert_eq!(raw_frame("\t7C96D6DC"), Some(0x7C96D6DC));
        assert_eq!(raw_frame("\t7C96D6DC  "), Some(0x7C96D6DC));
        assert_eq!(raw_frame("7C96D6DC"), None);
        assert_eq!(raw_frame("\t"), None);
        assert_eq!(raw_frame("\tntdll!Foo+1"), None);
        assert_eq!(raw_frame("\t1234567890"), None);
    }

    #[test]
    fn test_markers_and_memory() {
        assert!(is_loaded_modules_marker("// Loaded modules:"));
        assert!(is_modules_enumerated_marker("// Process modules enumerated."));
        assert!(!is_loaded_modules_marker("Loaded modules"));

        assert_eq!(
            memory_statistics(r#"// Memory={"Paged":1,"Virtual":2}"#),
            Some(r#"{"Paged":1,"Virtual":2}"#)
        );
        assert_eq!(memory_statistics("// Memory=none"), None);
    }

    #[test]
    fn test_snapshot_filename() {
        let (index, ts) = snapshot_filename("snapshot_0007_20240115-093015.heap").unwrap();
        assert_eq!(index, 7);
        assert_eq!(ts.format("%Y-%m-%d %H:%M:%S").to_string(), "2024-01-15 09:30:15");
        assert!(snapshot_filename("notes.txt").is_none());
        assert!(snapshot_filename("snapshot_1_20241399-000000.heap").is_none());
    }
}
