//! External heap tool invocations
//!
//! Heap dumps are produced, diffed, and symbolized by an external tool. Every
//! call captures stdout and stderr, logs them, and turns a non-zero exit into
//! [`HeapscopeError::ToolFailed`]. None of the calls can be cancelled once the
//! process has started, and there is no timeout.

use crate::error::{HeapscopeError, Result};
use crate::types::MemoryStatistics;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

/// Environment variable carrying the symbol search path to child processes
pub const SYMBOL_PATH_VAR: &str = "_NT_SYMBOL_PATH";

/// Programs used for heap instrumentation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolConfig {
    /// Captures, diffs, and symbolizes heap dumps
    pub heap_tool: PathBuf,
    /// Toggles stack-trace collection for an executable
    pub flags_tool: PathBuf,
    /// Symbol search path handed to the heap tool
    pub symbol_path: Option<String>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            heap_tool: PathBuf::from("umdh"),
            flags_tool: PathBuf::from("gflags"),
            symbol_path: None,
        }
    }
}

/// Captured output of a successful tool run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs the configured heap tools
#[derive(Debug, Clone, Default)]
pub struct HeapTool {
    config: ToolConfig,
}

impl HeapTool {
    pub fn new(config: ToolConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ToolConfig {
        &self.config
    }

    /// Run `program` to completion and capture its output
    pub async fn run(&self, program: &Path, args: &[OsString]) -> Result<ToolOutput> {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        if let Some(symbol_path) = &self.config.symbol_path {
            command.env(SYMBOL_PATH_VAR, symbol_path);
        }

        debug!("Running {} {:?}", program.display(), args);
        let output = command.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                HeapscopeError::ToolNotFound(program.display().to_string())
            } else {
                HeapscopeError::Io(e)
            }
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !stdout.trim().is_empty() {
            debug!("{} stdout: {}", program.display(), stdout.trim_end());
        }
        if !stderr.trim().is_empty() {
            debug!("{} stderr: {}", program.display(), stderr.trim_end());
        }

        if !output.status.success() {
            return Err(HeapscopeError::ToolFailed {
                tool: program.display().to_string(),
                status: output.status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(ToolOutput { stdout, stderr })
    }

    /// Enable or disable stack-trace collection for an executable image
    pub async fn set_instrumentation(&self, executable: &str, enabled: bool) -> Result<()> {
        let flag = if enabled { "+ust" } else { "-ust" };
        let args = [OsString::from("/i"), OsString::from(executable), OsString::from(flag)];
        self.run(&self.config.flags_tool, &args).await?;
        info!(
            "Heap instrumentation {} for {}",
            if enabled { "enabled" } else { "disabled" },
            executable
        );
        Ok(())
    }

    /// Dump the heap state of a live process into `target`
    ///
    /// When the process memory counters can be read they are appended to the
    /// dump as a trailing `// Memory=` comment line.
    pub async fn capture(&self, pid: u32, target: &Path) -> Result<()> {
        let args = [
            OsString::from(format!("-p:{pid}")),
            prefixed("-f:", target),
        ];
        self.run(&self.config.heap_tool, &args).await?;

        if let Some(memory) = read_process_memory(pid) {
            let mut file = tokio::fs::OpenOptions::new()
                .append(true)
                .open(target)
                .await?;
            file.write_all(format!("\n{}\n", memory.to_comment_line()).as_bytes())
                .await?;
            file.flush().await?;
        }

        info!("Captured heap of process {} into {}", pid, target.display());
        Ok(())
    }

    /// Diff two heap dumps into `output`
    pub async fn diff(&self, first: &Path, second: &Path, output: &Path) -> Result<()> {
        let args = [
            first.as_os_str().to_os_string(),
            second.as_os_str().to_os_string(),
            prefixed("-f:", output),
        ];
        self.run(&self.config.heap_tool, &args).await?;
        Ok(())
    }
}

fn prefixed(prefix: &str, path: &Path) -> OsString {
    let mut arg = OsString::from(prefix);
    arg.push(path.as_os_str());
    arg
}

/// Read live memory counters for a process
pub fn read_process_memory(pid: u32) -> Option<MemoryStatistics> {
    #[cfg(target_os = "linux")]
    {
        let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
        Some(parse_proc_status(&status))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = pid;
        None
    }
}

/// Parse the `Vm*` counters of a `/proc/<pid>/status` file
pub fn parse_proc_status(status: &str) -> MemoryStatistics {
    let mut memory = MemoryStatistics::default();
    for line in status.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let Some(kib) = value
            .split_whitespace()
            .next()
            .and_then(|v| v.parse::<u64>().ok())
        else {
            continue;
        };
        let bytes = kib * 1024;
        match key.trim() {
            "VmSize" => memory.virtual_bytes = bytes,
            "VmPeak" => memory.peak_virtual_bytes = bytes,
            "VmRSS" => memory.working_set = bytes,
            "VmHWM" => memory.peak_working_set = bytes,
            "VmSwap" => memory.paged = bytes,
            _ => {}
        }
    }
    memory.peak_paged = memory.peak_paged.max(memory.paged);
    memory
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_proc_status() {
        let status = "Name:\tapp\nVmPeak:\t  2048 kB\nVmSize:\t  1024 kB\nVmHWM:\t   512 kB\nVmRSS:\t   256 kB\nVmSwap:\t     4 kB\n";
        let memory = parse_proc_status(status);
        assert_eq!(memory.virtual_bytes, 1024 * 1024);
        assert_eq!(memory.peak_virtual_bytes, 2048 * 1024);
        assert_eq!(memory.working_set, 256 * 1024);
        assert_eq!(memory.peak_working_set, 512 * 1024);
        assert_eq!(memory.paged, 4 * 1024);
    }

    #[test]
    fn test_missing_tool_is_reported() {
        let tool = HeapTool::new(ToolConfig {
            heap_tool: PathBuf::from("/nonexistent/heap-tool"),
            ..Default::default()
        });
        let result = tokio_test::block_on(tool.diff(
            Path::new("a.heap"),
            Path::new("b.heap"),
            Path::new("out.txt"),
        ));
        assert!(matches!(result, Err(HeapscopeError::ToolNotFound(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_hard_failure() {
        let tool = HeapTool::default();
        let result = tool.run(Path::new("false"), &[]).await;
        assert!(matches!(result, Err(HeapscopeError::ToolFailed { .. })));

        let output = tool
            .run(Path::new("echo"), &[OsString::from("hello")])
            .await
            .unwrap();
        assert_eq!(output.stdout.trim(), "hello");
    }
}
