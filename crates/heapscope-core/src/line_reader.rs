//! Zero-copy line reader over an in-memory dump
//!
//! Lines are returned as slices of the source text with the `\n` or `\r\n`
//! delimiter stripped. One line can be pushed back with [`LineReader::rewind`]
//! so a caller that over-read while scanning a variable-length block can hand
//! the line to the next stage.

/// One line of the source text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Line<'a> {
    /// Line content without its delimiter
    pub text: &'a str,
    /// Byte offset of the first character
    pub start: usize,
    /// Byte offset just past the delimiter
    pub next: usize,
}

impl<'a> Line<'a> {
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Sequential reader with single-line lookahead
pub struct LineReader<'a> {
    text: &'a str,
    position: usize,
    pushed_back: Option<Line<'a>>,
}

impl<'a> LineReader<'a> {
    pub fn new(text: &'a str) -> Self {
        Self {
            text,
            position: 0,
            pushed_back: None,
        }
    }

    /// Next line, or `None` at end of input
    pub fn read_line(&mut self) -> Option<Line<'a>> {
        if let Some(line) = self.pushed_back.take() {
            return Some(line);
        }

        if self.position >= self.text.len() {
            return None;
        }

        let start = self.position;
        let rest = &self.text[start..];
        let (raw, next) = match rest.find('\n') {
            Some(offset) => (&rest[..offset], start + offset + 1),
            None => (rest, self.text.len()),
        };
        self.position = next;

        Some(Line {
            text: raw.strip_suffix('\r').unwrap_or(raw),
            start,
            next,
        })
    }

    /// Push a line back so the next [`LineReader::read_line`] returns it
    ///
    /// Only one line of lookahead is kept; a second rewind replaces the first.
    pub fn rewind(&mut self, line: Line<'a>) {
        debug_assert!(self.pushed_back.is_none(), "only one line can be rewound");
        self.pushed_back = Some(line);
    }

    /// Byte offset of the next line to be returned
    pub fn position(&self) -> usize {
        self.pushed_back
            .map(|line| line.start)
            .unwrap_or(self.position)
    }

    /// Total length of the source text in bytes
    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

impl<'a> Iterator for LineReader<'a> {
    type Item = Line<'a>;

    fn next(&mut self) -> Option<Line<'a>> {
        self.read_line()
    }
}
