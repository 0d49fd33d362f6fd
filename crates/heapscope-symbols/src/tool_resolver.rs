//! Resolver backed by the external heap tool
//!
//! The heap tool only symbolizes stacks while diffing two dumps. To resolve
//! an arbitrary batch of addresses, the resolver writes an empty baseline
//! dump and a synthetic dump holding one single-frame allocation per address,
//! with traceback ID `i + 1` for the `i`-th address. Diffing the two makes
//! the tool print every synthetic traceback symbolized, and the first frame
//! of traceback `i + 1` is the answer for address `i`.

use crate::resolver::{FrameResolver, ModuleTable};
use async_trait::async_trait;
use heapscope_core::diff_types::Diff;
use heapscope_core::dump_writer::DumpWriter;
use heapscope_core::error::Result;
use heapscope_core::tool::HeapTool;
use heapscope_core::types::{Allocation, HeapId, Module, TracebackId};
use heapscope_core::SymbolInfo;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

/// Heap ID used for the synthetic heap
const SYNTHETIC_HEAP: HeapId = HeapId(0x0001_0000);
/// Spacing between synthetic allocation addresses
const SYNTHETIC_STRIDE: u32 = 0x10;

/// Resolves frames by diffing synthetic dumps with the heap tool
pub struct ToolResolver {
    tool: HeapTool,
    temp_dir: PathBuf,
    modules: ModuleTable,
}

impl ToolResolver {
    pub fn new(tool: HeapTool, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            tool,
            temp_dir: temp_dir.into(),
            modules: ModuleTable::new(),
        }
    }

    pub fn modules(&self) -> &ModuleTable {
        &self.modules
    }
}

#[async_trait]
impl FrameResolver for ToolResolver {
    async fn resolve_batch(&self, addresses: &[u32]) -> Result<HashMap<u32, SymbolInfo>> {
        if addresses.is_empty() {
            return Ok(HashMap::new());
        }

        let modules = self.modules.modules();
        let (baseline, synthetic) = synthetic_dumps(&modules, addresses);

        let batch = Uuid::new_v4();
        let files = TempFiles(vec![
            self.temp_dir.join(format!("heapscope-{batch}-base.heap")),
            self.temp_dir.join(format!("heapscope-{batch}-frames.heap")),
            self.temp_dir.join(format!("heapscope-{batch}-symbols.txt")),
        ]);
        let [baseline_path, synthetic_path, output_path] = [&files.0[0], &files.0[1], &files.0[2]];

        tokio::fs::create_dir_all(&self.temp_dir).await?;
        tokio::fs::write(baseline_path, baseline).await?;
        tokio::fs::write(synthetic_path, synthetic).await?;

        self.tool
            .diff(baseline_path, synthetic_path, output_path)
            .await?;
        let diff = heapscope_parser::load_diff(output_path).await?;

        let resolved = map_results(addresses, &diff);
        debug!(
            "Resolved {}/{} addresses against {} modules",
            resolved.len(),
            addresses.len(),
            modules.len()
        );
        Ok(resolved)
    }

    fn register_modules(&self, modules: &[Module]) {
        let added = self.modules.register(modules);
        if added > 0 {
            debug!("Registered {} new modules for symbol resolution", added);
        }
    }
}

/// Baseline and synthetic dump texts for one batch
pub fn synthetic_dumps(modules: &[Module], addresses: &[u32]) -> (String, String) {
    let mut baseline = DumpWriter::new();
    baseline
        .modules(modules)
        .begin_heap(SYNTHETIC_HEAP)
        .end_heap(SYNTHETIC_HEAP);

    let mut synthetic = DumpWriter::new();
    synthetic.modules(modules).begin_heap(SYNTHETIC_HEAP);
    for (index, &address) in addresses.iter().enumerate() {
        let allocation = Allocation {
            address: SYNTHETIC_HEAP.0.wrapping_add((index as u32).wrapping_mul(SYNTHETIC_STRIDE)),
            size: SYNTHETIC_STRIDE,
            overhead: 0,
            traceback: synthetic_traceback(index),
        };
        synthetic.allocation(&allocation, Some(&[address]));
    }
    synthetic.end_heap(SYNTHETIC_HEAP);

    (baseline.finish(), synthetic.finish())
}

fn synthetic_traceback(index: usize) -> TracebackId {
    TracebackId(index as u32 + 1)
}

/// Map the first frame of each synthetic traceback back onto its address
pub fn map_results(addresses: &[u32], diff: &Diff) -> HashMap<u32, SymbolInfo> {
    addresses
        .iter()
        .enumerate()
        .filter_map(|(index, &address)| {
            let traceback = diff.tracebacks.get(&synthetic_traceback(index))?;
            let frame = traceback.frames.first()?;
            Some((address, frame.clone()))
        })
        .collect()
}

/// Files deleted on drop, ignoring failures
struct TempFiles(Vec<PathBuf>);

impl Drop for TempFiles {
    fn drop(&mut self) {
        for path in &self.0 {
            remove_quietly(path);
        }
    }
}

fn remove_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_file(path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        debug!("Failed to remove {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heapscope_core::types::SnapshotIdentity;
    use heapscope_parser::{parse_diff, parse_snapshot};

    #[test]
    fn test_synthetic_dump_round_trips_through_parser() {
        let modules = [Module::new(r"c:\app\app.exe", 0x400000, 0x10000)];
        let addresses = [0x401000, 0x402000, 0x401000];
        let (baseline, synthetic) = synthetic_dumps(&modules, &addresses);

        let base = parse_snapshot(SnapshotIdentity::from_path("base.heap"), &baseline);
        assert_eq!(base.modules.len(), 1);
        assert_eq!(base.allocation_count(), 0);

        let frames = parse_snapshot(SnapshotIdentity::from_path("frames.heap"), &synthetic);
        assert_eq!(frames.tracebacks.len(), 3);
        for (index, address) in addresses.iter().enumerate() {
            let traceback = frames.traceback(TracebackId(index as u32 + 1)).unwrap();
            assert_eq!(&*traceback.frames, &[*address]);
        }
    }

    #[test]
    fn test_map_results_by_position() {
        let diff = parse_diff(
            "+ 10 (10 - 0) 1 allocs\tBackTrace1\n\
             \tapp!First+4\n\
             \n\
             + 10 (10 - 0) 1 allocs\tBackTrace3\n\
             \tapp!Third+8\n",
        );
        let resolved = map_results(&[0xA, 0xB, 0xC], &diff);
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[&0xA].function, "First");
        assert_eq!(resolved[&0xC].offset, 8);
        assert!(!resolved.contains_key(&0xB));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_resolves_through_tool_and_cleans_up() {
        use heapscope_core::tool::ToolConfig;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-heap-tool");
        std::fs::write(
            &script,
            "#!/bin/sh\n\
             out=\"${3#-f:}\"\n\
             printf '+ 10 (10 - 0) 1 allocs\\tBackTrace1\\n\\tapp!Alpha+1\\n\\n+ 10 (10 - 0) 1 allocs\\tBackTrace2\\n\\tapp!Beta+2\\n' > \"$out\"\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let scratch = dir.path().join("scratch");
        let resolver = ToolResolver::new(
            HeapTool::new(ToolConfig {
                heap_tool: script,
                ..Default::default()
            }),
            &scratch,
        );
        resolver.register_modules(&[Module::new(r"c:\app\app.exe", 0x400000, 0x10000)]);

        let resolved = resolver
            .resolve_batch(&[0x401000, 0x402000, 0x403000])
            .await
            .unwrap();
        assert_eq!(resolved[&0x401000].function, "Alpha");
        assert_eq!(resolved[&0x402000].function, "Beta");
        assert!(!resolved.contains_key(&0x403000));

        assert_eq!(std::fs::read_dir(&scratch).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_missing_tool_fails_batch() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = ToolResolver::new(
            HeapTool::new(heapscope_core::tool::ToolConfig {
                heap_tool: PathBuf::from("/nonexistent/heap-tool"),
                ..Default::default()
            }),
            dir.path(),
        );
        assert!(resolver.resolve_batch(&[0x1]).await.is_err());
    }
}
