//! Session configuration
//!
//! All tunables of a profiling session live in [`SessionConfig`]. The CLI
//! fills it from flags and environment variables; library users start from
//! `SessionConfig::default()` and override what they need.

use heapscope_core::error::{HeapscopeError, Result};
use heapscope_core::tool::ToolConfig;
use heapscope_symbols::PipelineConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Settings for one profiling session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Concurrent symbol resolution workers
    pub resolver_workers: usize,
    /// Snapshot files parsed at the same time
    pub max_concurrent_loads: usize,
    /// Addresses handed to the resolver per round
    pub batch_size: usize,
    /// Sleep between checks while workers wait for loads to finish
    pub idle_interval: Duration,
    /// Generated diffs kept before the oldest is evicted
    pub diff_cache_capacity: usize,
    /// Parsed snapshot bodies kept in memory
    pub snapshot_cache_capacity: usize,
    /// Scratch directory for synthetic dumps and generated diffs
    pub temp_dir: PathBuf,
    /// External heap tools
    pub tool: ToolConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let cpus = num_cpus::get();
        Self {
            resolver_workers: (cpus / 2).max(1),
            max_concurrent_loads: cpus.clamp(1, 4),
            batch_size: 1024,
            idle_interval: Duration::from_millis(50),
            diff_cache_capacity: 8,
            snapshot_cache_capacity: 4,
            temp_dir: default_temp_dir(),
            tool: ToolConfig::default(),
        }
    }
}

/// Per-user cache directory, falling back to the system temp directory
pub fn default_temp_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|dir| dir.join("heapscope"))
        .unwrap_or_else(|| std::env::temp_dir().join("heapscope"))
}

impl SessionConfig {
    /// Reject settings a session cannot run with
    ///
    /// ```
    /// use heapscope::config::SessionConfig;
    ///
    /// let mut config = SessionConfig::default();
    /// assert!(config.validate().is_ok());
    ///
    /// config.batch_size = 0;
    /// assert!(config.validate().is_err());
    /// ```
    pub fn validate(&self) -> Result<()> {
        let counts = [
            ("resolver_workers", self.resolver_workers),
            ("max_concurrent_loads", self.max_concurrent_loads),
            ("batch_size", self.batch_size),
            ("diff_cache_capacity", self.diff_cache_capacity),
            ("snapshot_cache_capacity", self.snapshot_cache_capacity),
        ];
        for (name, value) in counts {
            if value == 0 {
                return Err(HeapscopeError::Config(format!("{name} must be at least 1")));
            }
        }
        if self.idle_interval.is_zero() {
            return Err(HeapscopeError::Config(
                "idle_interval must be non-zero".to_string(),
            ));
        }
        if self.temp_dir.as_os_str().is_empty() {
            return Err(HeapscopeError::Config("temp_dir is empty".to_string()));
        }
        Ok(())
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            workers: self.resolver_workers,
            batch_size: self.batch_size,
            idle_interval: self.idle_interval,
        }
    }
}
