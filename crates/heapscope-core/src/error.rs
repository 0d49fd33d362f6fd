//! Error types for heapscope
//!
//! This module defines the error types used throughout the heapscope crates.
//! All errors are derived from `thiserror` for convenient error handling
//! and automatic `From` implementations.
//!
//! Recoverable parse anomalies (unrecognized lines, duplicate traceback IDs)
//! are logged by the parsers and never surface here.
//!
//! # Example
//!
//! ```
//! use heapscope_core::error::{HeapscopeError, Result};
//!
//! fn example_function() -> Result<()> {
//!     // This will automatically convert io::Error to HeapscopeError
//!     let _file = std::fs::read_to_string("nonexistent.heap")?;
//!     Ok(())
//! }
//! ```

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for heapscope operations
#[derive(Error, Debug)]
pub enum HeapscopeError {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// Parse error with file context
    #[error("Parse error in {file}: {error}")]
    Parse {
        /// The file that caused the error
        file: PathBuf,
        /// The error message
        error: String,
    },

    /// An external tool exited unsuccessfully
    #[error("{tool} failed with {status}: {stderr}")]
    ToolFailed {
        /// Program that was run
        tool: String,
        /// Exit status description
        status: String,
        /// Captured standard error
        stderr: String,
    },

    /// An external tool could not be started
    #[error("Unable to start {0}")]
    ToolNotFound(String),

    /// Snapshot index is unknown to the session
    #[error("Snapshot {0} not found")]
    SnapshotNotFound(usize),

    /// Background task panicked or was cancelled
    #[error("Background task failed: {0}")]
    TaskFailed(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<tokio::task::JoinError> for HeapscopeError {
    fn from(err: tokio::task::JoinError) -> Self {
        HeapscopeError::TaskFailed(err.to_string())
    }
}

/// Convenience type alias for Results in heapscope
pub type Result<T> = std::result::Result<T, HeapscopeError>;
