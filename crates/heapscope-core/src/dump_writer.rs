//! Writer for the heap dump text format
//!
//! Produces text the snapshot parser and the external heap tool both accept.
//! Symbol resolution uses it to build synthetic dumps; tests use it to build
//! fixtures.

use crate::types::{Allocation, HeapId, MemoryStatistics, Module};
use std::fmt::Write;

/// Incremental builder for dump text
///
/// # Examples
/// ```
/// use heapscope_core::dump_writer::DumpWriter;
/// use heapscope_core::types::{Allocation, HeapId, Module, TracebackId};
///
/// let mut writer = DumpWriter::new();
/// writer
///     .modules(&[Module::new(r"c:\app\app.exe", 0x400000, 0x1000)])
///     .begin_heap(HeapId(0x150000))
///     .allocation(
///         &Allocation { address: 0x150010, size: 0x20, overhead: 0x8, traceback: TracebackId(1) },
///         Some(&[0x401000, 0x401234]),
///     )
///     .end_heap(HeapId(0x150000));
/// let text = writer.finish();
/// assert!(text.contains("00000020 bytes + 00000008 at 00150010 by BackTrace00000001"));
/// ```
#[derive(Debug, Default)]
pub struct DumpWriter {
    out: String,
}

impl DumpWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write the module table, including its start and end markers
    pub fn modules<'a>(&mut self, modules: impl IntoIterator<Item = &'a Module>) -> &mut Self {
        let _ = writeln!(self.out, "// Loaded modules:");
        let _ = writeln!(self.out, "//     Base     Size  Module");
        for module in modules {
            let _ = writeln!(
                self.out,
                "// {:8X} {:8X}  {}",
                module.base(),
                module.size(),
                module.path()
            );
        }
        let _ = writeln!(self.out, "// Process modules enumerated.");
        let _ = writeln!(self.out);
        self
    }

    pub fn begin_heap(&mut self, id: HeapId) -> &mut Self {
        let _ = writeln!(
            self.out,
            "*- - - - - - - - - - Start of data for heap @ {:X} - - - - - - - - - -",
            id.0
        );
        let _ = writeln!(self.out);
        self
    }

    /// Write one allocation record, followed by its stack when given
    pub fn allocation(&mut self, allocation: &Allocation, frames: Option<&[u32]>) -> &mut Self {
        let _ = writeln!(
            self.out,
            "{:08X} bytes + {:08X} at {:08X} by BackTrace{:08X}",
            allocation.size, allocation.overhead, allocation.address, allocation.traceback.0
        );
        if let Some(frames) = frames {
            for frame in frames {
                let _ = writeln!(self.out, "\t{frame:08X}");
            }
            let _ = writeln!(self.out);
        }
        self
    }

    pub fn end_heap(&mut self, id: HeapId) -> &mut Self {
        let _ = writeln!(
            self.out,
            "*- - - - - - - - - - End of data for heap @ {:X} - - - - - - - - - -",
            id.0
        );
        let _ = writeln!(self.out);
        self
    }

    /// Append the trailing memory statistics line
    pub fn memory(&mut self, memory: &MemoryStatistics) -> &mut Self {
        let _ = writeln!(self.out, "{}", memory.to_comment_line());
        self
    }

    pub fn finish(self) -> String {
        self.out
    }
}
