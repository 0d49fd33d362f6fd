//! CLI interface for heapscope
//!
//! # Example
//!
//! ```bash
//! # Parse every dump in a directory and show the largest call stacks
//! heapscope load dumps/ --top 20
//!
//! # Diff two dumps with the heap tool
//! heapscope diff dumps/snapshot_0001_20240101-120000.heap dumps/snapshot_0002_20240101-121500.heap
//!
//! # Turn on stack collection, then capture a running process
//! heapscope instrument enable app.exe
//! heapscope capture --pid 4242 --output dumps/
//! ```

use crate::config::{SessionConfig, default_temp_dir};
use clap::{Parser, Subcommand, ValueEnum};
use heapscope_core::error::{HeapscopeError, Result};
use heapscope_core::tool::ToolConfig;
use std::path::PathBuf;
use walkdir::WalkDir;

/// File extension of heap dumps picked up from directories
pub const DUMP_EXTENSION: &str = "heap";

/// Parse heap allocation dumps and resolve their call stacks
#[derive(Parser, Debug, Clone)]
#[command(name = "heapscope")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Only show warnings and errors
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    /// Output as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Program that captures, diffs and symbolizes heap dumps
    #[arg(long, env = "HEAPSCOPE_HEAP_TOOL", default_value = "umdh", global = true)]
    pub heap_tool: PathBuf,

    /// Program that toggles stack collection for an executable
    #[arg(long, env = "HEAPSCOPE_FLAGS_TOOL", default_value = "gflags", global = true)]
    pub flags_tool: PathBuf,

    /// Symbol search path handed to the heap tool
    #[arg(long, env = "HEAPSCOPE_SYMBOL_PATH", global = true)]
    pub symbol_path: Option<String>,

    /// Symbol resolution workers (default: half the CPU cores)
    #[arg(long, env = "HEAPSCOPE_WORKERS", global = true)]
    pub workers: Option<usize>,

    /// Snapshot files parsed concurrently (default: CPU cores, at most 4)
    #[arg(long, global = true)]
    pub max_loads: Option<usize>,

    /// Scratch directory for synthetic dumps and generated diffs
    #[arg(long, global = true)]
    pub temp_dir: Option<PathBuf>,

    /// Name frames by module and offset instead of running the heap tool
    #[arg(long, global = true)]
    pub no_symbols: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Parse snapshot files and show heap statistics
    Load {
        /// Snapshot files, or directories searched for *.heap files
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Largest call stacks to show per snapshot
        #[arg(long, default_value = "10")]
        top: usize,
    },

    /// Diff two snapshot files with the heap tool
    Diff {
        first: PathBuf,
        second: PathBuf,

        /// Records to show
        #[arg(long, default_value = "20")]
        top: usize,
    },

    /// Show an existing diff file
    ParseDiff {
        file: PathBuf,

        /// Records to show
        #[arg(long, default_value = "20")]
        top: usize,
    },

    /// Capture the heap of a running process
    Capture {
        /// Process ID
        #[arg(long)]
        pid: u32,

        /// Directory receiving the snapshot file
        #[arg(long, short = 'o', default_value = ".")]
        output: PathBuf,
    },

    /// Enable or disable stack collection for an executable
    Instrument {
        #[arg(value_enum)]
        action: InstrumentAction,

        /// Executable image name, e.g. app.exe
        executable: String,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrumentAction {
    Enable,
    Disable,
}

impl Cli {
    /// Session settings from flags, environment, and defaults
    pub fn session_config(&self) -> Result<SessionConfig> {
        let defaults = SessionConfig::default();
        let config = SessionConfig {
            resolver_workers: self.workers.unwrap_or(defaults.resolver_workers),
            max_concurrent_loads: self.max_loads.unwrap_or(defaults.max_concurrent_loads),
            temp_dir: self.temp_dir.clone().unwrap_or_else(default_temp_dir),
            tool: ToolConfig {
                heap_tool: self.heap_tool.clone(),
                flags_tool: self.flags_tool.clone(),
                symbol_path: self.symbol_path.clone(),
            },
            ..defaults
        };
        config.validate()?;
        Ok(config)
    }
}

/// Expand directories into the dump files they contain
///
/// Files are returned as given; directories are walked recursively for
/// `*.heap` files in name order.
pub fn collect_snapshot_files(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut found: Vec<PathBuf> = WalkDir::new(path)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_file())
                .map(|entry| entry.into_path())
                .filter(|p| p.extension().is_some_and(|ext| ext == DUMP_EXTENSION))
                .collect();
            files.append(&mut found);
        } else if path.exists() {
            files.push(path.clone());
        } else {
            return Err(HeapscopeError::InvalidArgument(format!(
                "{} does not exist",
                path.display()
            )));
        }
    }
    Ok(files)
}
