//! Heap dump and diff parsers for heapscope
//!
//! Both parsers work on fully decoded text held in memory. Loading a file is
//! split into a read, a decode, and a parse step so callers can move the
//! CPU-bound steps off the async runtime.

pub mod diff_parser;
pub mod snapshot_parser;

pub use diff_parser::{DiffParser, parse_diff, parse_diff_async};
pub use snapshot_parser::{ParseStats, SnapshotParser, parse_snapshot};

use heapscope_core::error::Result;
use heapscope_core::types::{Snapshot, SnapshotIdentity};
use heapscope_core::Diff;
use std::path::Path;
use tracing::debug;

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];
const UTF16LE_BOM: &[u8] = &[0xFF, 0xFE];

/// Decode dump bytes into text
///
/// UTF-16LE input (marked by its byte order mark) is converted; everything
/// else is read as UTF-8 with invalid sequences replaced.
///
/// ```
/// use heapscope_parser::decode_text;
///
/// assert_eq!(decode_text(b"\xEF\xBB\xBFheap".to_vec()), "heap");
/// assert_eq!(decode_text(vec![0xFF, 0xFE, b'h', 0, b'i', 0]), "hi");
/// ```
pub fn decode_text(bytes: Vec<u8>) -> String {
    if let Some(body) = bytes.strip_prefix(UTF16LE_BOM) {
        let units: Vec<u16> = body
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }

    let body = bytes.strip_prefix(UTF8_BOM).unwrap_or(&bytes);
    match std::str::from_utf8(body) {
        Ok(text) => text.to_string(),
        Err(_) => String::from_utf8_lossy(body).into_owned(),
    }
}

/// Read, decode, and parse a heap dump file
///
/// Decoding and parsing run on the blocking thread pool.
pub async fn load_snapshot(path: &Path) -> Result<Snapshot> {
    let bytes = tokio::fs::read(path).await?;
    debug!("Read {} bytes from {}", bytes.len(), path.display());

    let modified = tokio::fs::metadata(path)
        .await
        .and_then(|m| m.modified())
        .ok();
    let identity = SnapshotIdentity::with_modified(path, modified);

    let text = tokio::task::spawn_blocking(move || decode_text(bytes)).await?;
    let snapshot = tokio::task::spawn_blocking(move || parse_snapshot(identity, &text)).await?;
    Ok(snapshot)
}

/// Read, decode, and parse a diff file
pub async fn load_diff(path: &Path) -> Result<Diff> {
    let bytes = tokio::fs::read(path).await?;
    let text = tokio::task::spawn_blocking(move || decode_text(bytes)).await?;
    Ok(parse_diff_async(&text, |_, _| {}).await)
}
