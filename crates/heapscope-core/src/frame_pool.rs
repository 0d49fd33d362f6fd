//! Chunked storage for traceback frames
//!
//! A large dump holds hundreds of thousands of short call stacks. Rather than
//! giving every traceback its own `Vec<u32>`, frames are appended to large
//! chunks and each traceback keeps a slice into its chunk. A new chunk is only
//! started when the current one cannot hold a traceback of the maximum length,
//! so a traceback never straddles two chunks.

use serde::{Serialize, Serializer};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// Longest call stack kept per traceback; deeper frames are dropped
pub const MAX_TRACEBACK_LENGTH: usize = 64;

/// Default number of frames per chunk
pub const DEFAULT_CHUNK_CAPACITY: usize = 64 * 1024;

/// Location of a traceback's frames inside a [`FramePool`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSpan {
    chunk: u32,
    start: u32,
    len: u32,
}

impl FrameSpan {
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Append-only frame storage used while parsing
pub struct FramePool {
    sealed: Vec<Vec<u32>>,
    current: Vec<u32>,
    chunk_capacity: usize,
    open: Option<usize>,
}

impl Default for FramePool {
    fn default() -> Self {
        Self::with_chunk_capacity(DEFAULT_CHUNK_CAPACITY)
    }
}

impl FramePool {
    /// Create a pool with the default chunk size
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pool; capacity is raised to at least [`MAX_TRACEBACK_LENGTH`]
    pub fn with_chunk_capacity(chunk_capacity: usize) -> Self {
        let chunk_capacity = chunk_capacity.max(MAX_TRACEBACK_LENGTH);
        Self {
            sealed: Vec::new(),
            current: Vec::with_capacity(chunk_capacity),
            chunk_capacity,
            open: None,
        }
    }

    /// Start a new traceback, sealing the current chunk if it lacks room
    pub fn begin(&mut self) {
        if self.current.capacity() - self.current.len() < MAX_TRACEBACK_LENGTH {
            let full = std::mem::replace(&mut self.current, Vec::with_capacity(self.chunk_capacity));
            self.sealed.push(full);
        }
        self.open = Some(self.current.len());
    }

    /// Append a frame to the open traceback
    ///
    /// Returns `false` when the traceback is already at the maximum length or
    /// no traceback is open; the frame is dropped in that case.
    pub fn push(&mut self, frame: u32) -> bool {
        match self.open {
            Some(start) if self.current.len() - start < MAX_TRACEBACK_LENGTH => {
                self.current.push(frame);
                true
            }
            _ => false,
        }
    }

    /// Close the open traceback and return where its frames live
    pub fn finish(&mut self) -> FrameSpan {
        let start = self.open.take().unwrap_or(self.current.len());
        FrameSpan {
            chunk: self.sealed.len() as u32,
            start: start as u32,
            len: (self.current.len() - start) as u32,
        }
    }

    /// Drop the open traceback's frames
    pub fn discard(&mut self) {
        if let Some(start) = self.open.take() {
            self.current.truncate(start);
        }
    }

    /// Usage statistics
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            chunk_count: self.sealed.len() + 1,
            frame_count: self.sealed.iter().map(Vec::len).sum::<usize>() + self.current.len(),
        }
    }

    /// Seal every chunk so slices can be handed out
    pub fn freeze(mut self) -> FrozenFrames {
        self.sealed.push(self.current);
        FrozenFrames {
            chunks: self.sealed.into_iter().map(Arc::new).collect(),
        }
    }
}

/// Statistics about frame pool usage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub chunk_count: usize,
    pub frame_count: usize,
}

/// Read-only chunks produced by [`FramePool::freeze`]
pub struct FrozenFrames {
    chunks: Vec<Arc<Vec<u32>>>,
}

impl FrozenFrames {
    /// Shared slice for a span produced by the same pool
    pub fn slice(&self, span: FrameSpan) -> FrameSlice {
        FrameSlice {
            chunk: self.chunks[span.chunk as usize].clone(),
            start: span.start,
            len: span.len,
        }
    }
}

/// A cheap, shareable view of one traceback's frames
#[derive(Clone)]
pub struct FrameSlice {
    chunk: Arc<Vec<u32>>,
    start: u32,
    len: u32,
}

impl FrameSlice {
    /// Standalone slice owning its own chunk
    pub fn from_vec(frames: Vec<u32>) -> Self {
        let len = frames.len() as u32;
        Self {
            chunk: Arc::new(frames),
            start: 0,
            len,
        }
    }
}

impl Deref for FrameSlice {
    type Target = [u32];

    fn deref(&self) -> &[u32] {
        let start = self.start as usize;
        &self.chunk[start..start + self.len as usize]
    }
}

impl PartialEq for FrameSlice {
    fn eq(&self, other: &Self) -> bool {
        **self == **other
    }
}

impl Eq for FrameSlice {}

impl fmt::Debug for FrameSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.iter().map(|frame| format!("{frame:08X}")))
            .finish()
    }
}

impl Serialize for FrameSlice {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_share_chunk() {
        let mut pool = FramePool::new();

        pool.begin();
        pool.push(1);
        pool.push(2);
        let a = pool.finish();

        pool.begin();
        pool.push(3);
        let b = pool.finish();

        let frozen = pool.freeze();
        let a = frozen.slice(a);
        let b = frozen.slice(b);
        assert_eq!(&*a, &[1, 2]);
        assert_eq!(&*b, &[3]);
        assert!(Arc::ptr_eq(&a.chunk, &b.chunk));
    }

    #[test]
    fn test_new_chunk_only_when_out_of_room() {
        let mut pool = FramePool::with_chunk_capacity(MAX_TRACEBACK_LENGTH * 2);
        let mut spans = Vec::new();

        for id in 0..3u32 {
            pool.begin();
            for frame in 0..MAX_TRACEBACK_LENGTH as u32 {
                assert!(pool.push(id * 1000 + frame));
            }
            spans.push(pool.finish());
        }

        assert_eq!(pool.stats().chunk_count, 2);
        assert_eq!(pool.stats().frame_count, MAX_TRACEBACK_LENGTH * 3);

        let frozen = pool.freeze();
        let last = frozen.slice(spans[2]);
        assert_eq!(last.len(), MAX_TRACEBACK_LENGTH);
        assert_eq!(last[0], 2000);
    }

    #[test]
    fn test_push_stops_at_max_length() {
        let mut pool = FramePool::new();
        pool.begin();
        for frame in 0..MAX_TRACEBACK_LENGTH as u32 {
            assert!(pool.push(frame));
        }
        assert!(!pool.push(0xFFFF));
        assert_eq!(pool.finish().len(), MAX_TRACEBACK_LENGTH);
    }

    #[test]
    fn test_discard_rewinds() {
        let mut pool = FramePool::new();
        pool.begin();
        pool.push(7);
        pool.discard();
        assert!(!pool.push(8));
        assert_eq!(pool.stats().frame_count, 0);
    }

    #[test]
    fn test_slice_equality_and_debug() {
        let a = FrameSlice::from_vec(vec![0x10, 0x20]);
        let b = FrameSlice::from_vec(vec![0x10, 0x20]);
        assert_eq!(a, b);
        assert_eq!(format!("{a:?}"), r#"["00000010", "00000020"]"#);
    }
}
