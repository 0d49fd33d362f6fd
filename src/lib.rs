//! heapscope - Parse heap allocation dumps and resolve their call stacks
//!
//! This library provides functionality to:
//! - Load heap dump snapshots concurrently and compute per-heap statistics
//! - Resolve allocation call stacks through a batched symbol pipeline
//! - Diff dumps with the external heap tool, caching generated diffs
//! - Render snapshots, call stacks and diffs as tables or JSON
//!
//! # Examples
//!
//! ```no_run
//! use heapscope::{config::SessionConfig, session::Session};
//!
//! #[tokio::main]
//! async fn main() -> heapscope::Result<()> {
//!     let session = Session::new(SessionConfig::default())?;
//!     session.load("dumps/snapshot_0001_20240101-120000.heap");
//!     session.load("dumps/snapshot_0002_20240101-121500.heap");
//!     session.wait_for_loads().await;
//!
//!     let diff = session.diff_snapshots(1, 2).await?;
//!     println!("{} bytes grown", diff.total_bytes_delta());
//!     session.shutdown().await
//! }
//! ```

pub mod cli;
pub mod config;
pub mod diff_cache;
pub mod output;
pub mod report;
pub mod scheduler;
pub mod session;
pub mod snapshot_cache;
pub mod store;

// Re-export commonly used types
pub use heapscope_core::error::{HeapscopeError, Result};
pub use heapscope_core::{Diff, HeapSnapshotInfo, Snapshot, SnapshotIdentity};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
