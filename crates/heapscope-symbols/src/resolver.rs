//! Frame resolver capability
//!
//! A [`FrameResolver`] turns a batch of raw frame addresses into symbols. The
//! pipeline only ever talks to this trait, so how a resolver gets its answers
//! (an external tool, a symbol store, a fixed table) stays behind it.

use async_trait::async_trait;
use heapscope_core::error::Result;
use heapscope_core::types::Module;
use heapscope_core::SymbolInfo;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

/// Resolves raw frame addresses to symbols
///
/// Addresses missing from the returned map are treated as unresolvable and
/// receive a placeholder symbol. An `Err` fails the whole batch the same
/// way; it never reaches callers waiting on individual addresses.
#[async_trait]
pub trait FrameResolver: Send + Sync {
    async fn resolve_batch(&self, addresses: &[u32]) -> Result<HashMap<u32, SymbolInfo>>;

    /// Make modules of a newly loaded snapshot known to the resolver
    fn register_modules(&self, _modules: &[Module]) {}
}

/// Modules accumulated across every loaded snapshot, keyed by path
#[derive(Debug, Default)]
pub struct ModuleTable {
    modules: Mutex<IndexMap<String, Module>>,
}

impl ModuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add modules not seen before, returning how many were new
    pub fn register(&self, modules: &[Module]) -> usize {
        let mut table = self.modules.lock().unwrap_or_else(PoisonError::into_inner);
        let before = table.len();
        for module in modules {
            if !table.contains_key(module.path()) {
                table.insert(module.path().to_string(), module.clone());
            }
        }
        table.len() - before
    }

    /// All registered modules in registration order
    pub fn modules(&self) -> Vec<Module> {
        self.modules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Module whose address range contains `address`
    pub fn find(&self, address: u32) -> Option<Module> {
        self.modules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|m| m.contains(address))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.modules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resolver that names frames by module and module-relative offset
///
/// Needs no debug information or external tool. Addresses outside every
/// registered module are left unresolved.
///
/// ```
/// use heapscope_core::types::Module;
/// use heapscope_symbols::resolver::{FrameResolver, ModuleOffsetResolver};
///
/// let resolver = ModuleOffsetResolver::new();
/// resolver.register_modules(&[Module::new(r"c:\app\App.exe", 0x400000, 0x1000)]);
/// let symbols = tokio_test::block_on(resolver.resolve_batch(&[0x400123, 0x900000])).unwrap();
/// assert_eq!(symbols[&0x400123].to_string(), "App!0x00000123+0x0");
/// assert!(!symbols.contains_key(&0x900000));
/// ```
#[derive(Debug, Default)]
pub struct ModuleOffsetResolver {
    modules: ModuleTable,
}

impl ModuleOffsetResolver {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Display name of a module without its extension
pub fn module_stem(module: &Module) -> String {
    Path::new(module.name())
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| module.name().to_string())
}

#[async_trait]
impl FrameResolver for ModuleOffsetResolver {
    async fn resolve_batch(&self, addresses: &[u32]) -> Result<HashMap<u32, SymbolInfo>> {
        let modules = self.modules.modules();
        let mut resolved = HashMap::with_capacity(addresses.len());
        for &address in addresses {
            if let Some(module) = modules.iter().find(|m| m.contains(address)) {
                let rva = address - module.base();
                resolved.insert(
                    address,
                    SymbolInfo {
                        module: module_stem(module),
                        function: format!("0x{rva:08X}"),
                        offset: 0,
                        secondary_offset: None,
                        source_file: None,
                        source_line: None,
                    },
                );
            }
        }
        Ok(resolved)
    }

    fn register_modules(&self, modules: &[Module]) {
        self.modules.register(modules);
    }
}
