//! Diff parser
//!
//! Reads the symbolized comparison the heap tool prints for two dumps. The
//! output is a sequence of records, each made of a byte delta header, an
//! optional allocation count line, and a block of symbolized frames. Module
//! symbol lines may appear anywhere before the records.
//!
//! Record parsing stops at the first line that does not belong to the
//! record. That line is handed back to the top-level loop unconsumed, so a
//! header directly following another record's frames is never lost.

use heapscope_core::diff_types::{Diff, DiffEntry, DiffTraceback, ModuleSymbols};
use heapscope_core::line_reader::{Line, LineReader};
use heapscope_core::patterns::{self, BytesDelta, CountDelta};
use smallvec::SmallVec;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use tracing::{debug, trace};

/// Lines between two cooperative yields in [`parse_diff_async`]
pub const YIELD_INTERVAL_LINES: usize = 128;

/// Whether a record parser consumed the line that ended it
enum RecordOutcome<'a> {
    Consumed,
    NotConsumed(Line<'a>),
}

/// Incremental diff parser
///
/// Drive it to completion with [`DiffParser::parse`], or one top-level line
/// at a time with [`DiffParser::step`].
pub struct DiffParser<'a> {
    reader: LineReader<'a>,
    pending: Option<Line<'a>>,
    diff: Diff,
    lines: usize,
    duplicate_tracebacks: usize,
}

/// Parse a complete diff
///
/// # Examples
///
/// ```
/// use heapscope_parser::diff_parser::parse_diff;
///
/// let diff = parse_diff(
///     "+ 40 ( 60 - 20) 2 allocs\tBackTrace1\n\
///      + 1 ( 2 - 1)\tBackTrace1\tallocations\n\
///      \n\
///      \tapp!Grow+10\n",
/// );
/// assert_eq!(diff.entries.len(), 1);
/// assert_eq!(diff.entries[0].bytes_delta, 0x40);
/// assert_eq!(diff.entries[0].old_count, 1);
/// assert_eq!(diff.entries[0].traceback.frames[0].function, "Grow");
/// ```
pub fn parse_diff(text: &str) -> Diff {
    DiffParser::new(text).parse()
}

/// Parse a diff without monopolizing the runtime
///
/// Yields to the scheduler every [`YIELD_INTERVAL_LINES`] lines and reports
/// `(bytes consumed, total bytes)` at the same points.
pub async fn parse_diff_async(text: &str, mut progress: impl FnMut(usize, usize)) -> Diff {
    let mut parser = DiffParser::new(text);
    let mut next_yield = YIELD_INTERVAL_LINES;
    while parser.step() {
        if parser.lines() >= next_yield {
            next_yield = parser.lines() + YIELD_INTERVAL_LINES;
            progress(parser.position(), text.len());
            tokio::task::yield_now().await;
        }
    }
    progress(text.len(), text.len());
    parser.finish()
}

impl<'a> DiffParser<'a> {
    pub fn new(text: &'a str) -> Self {
        Self {
            reader: LineReader::new(text),
            pending: None,
            diff: Diff::default(),
            lines: 0,
            duplicate_tracebacks: 0,
        }
    }

    /// Lines read so far
    pub fn lines(&self) -> usize {
        self.lines
    }

    /// Byte offset of the next unread line
    pub fn position(&self) -> usize {
        match &self.pending {
            Some(line) => line.start,
            None => self.reader.position(),
        }
    }

    pub fn parse(mut self) -> Diff {
        while self.step() {}
        self.finish()
    }

    /// Process one top-level line, returning false at end of input
    pub fn step(&mut self) -> bool {
        let Some(line) = self.next_line() else {
            return false;
        };

        if let Some(header) = patterns::bytes_delta(line.text) {
            if let RecordOutcome::NotConsumed(line) = self.parse_record(header) {
                self.pending = Some(line);
            }
        } else if let Some((module, symbol_type)) = patterns::module_symbols(line.text) {
            self.diff.modules.push(ModuleSymbols {
                module: module.to_string(),
                symbol_type: symbol_type.to_string(),
            });
        } else if !line.is_blank() {
            trace!("Skipping diff line: {}", line.text);
        }
        true
    }

    pub fn finish(self) -> Diff {
        debug!(
            "Parsed diff: {} records, {} tracebacks, {} modules, {} duplicate tracebacks",
            self.diff.entries.len(),
            self.diff.tracebacks.len(),
            self.diff.modules.len(),
            self.duplicate_tracebacks
        );
        self.diff
    }

    fn next_line(&mut self) -> Option<Line<'a>> {
        if let Some(line) = self.pending.take() {
            return Some(line);
        }
        let line = self.reader.read_line()?;
        self.lines += 1;
        Some(line)
    }

    fn parse_record(&mut self, header: BytesDelta) -> RecordOutcome<'a> {
        let mut next = self.next_line();

        let mut count: Option<CountDelta> = None;
        if let Some(line) = next
            && let Some(parsed) = patterns::count_delta(line.text)
        {
            if parsed.traceback == header.traceback {
                count = Some(parsed);
                next = self.next_line();
            } else {
                debug!(
                    "Count line for {} under header for {}",
                    parsed.traceback, header.traceback
                );
            }
        }

        let mut frames = SmallVec::new();
        let mut blank_tolerated = false;
        let outcome = loop {
            let Some(line) = next else {
                break RecordOutcome::Consumed;
            };
            if let Some(frame) = patterns::traceback_frame(line.text) {
                frames.push(frame);
            } else if line.is_blank() {
                if frames.is_empty() && !blank_tolerated {
                    blank_tolerated = true;
                } else {
                    break RecordOutcome::Consumed;
                }
            } else {
                break RecordOutcome::NotConsumed(line);
            }
            next = self.next_line();
        };

        self.add_entry(header, count, frames);
        outcome
    }

    fn add_entry(
        &mut self,
        header: BytesDelta,
        count: Option<CountDelta>,
        frames: SmallVec<[heapscope_core::SymbolInfo; 4]>,
    ) {
        let traceback = match self.diff.tracebacks.entry(header.traceback) {
            Entry::Occupied(existing) => {
                if !frames.is_empty() {
                    self.duplicate_tracebacks += 1;
                    debug!("Duplicate traceback {} in diff ignored", header.traceback);
                }
                existing.get().clone()
            }
            Entry::Vacant(slot) => slot
                .insert(Arc::new(DiffTraceback {
                    id: header.traceback,
                    frames,
                }))
                .clone(),
        };

        let (old_count, new_count) = match count {
            Some(count) => (u64::from(count.old_count), u64::from(count.new_count)),
            None => (0, u64::from(header.new_count)),
        };

        self.diff.entries.push(DiffEntry {
            bytes_delta: header.delta,
            old_bytes: u64::from(header.old_bytes),
            new_bytes: u64::from(header.new_bytes),
            old_count,
            new_count,
            traceback,
        });
    }
}
