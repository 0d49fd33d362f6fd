//! Snapshot persistence
//!
//! The storage engine is a collaborator behind [`SnapshotStore`]: parsed
//! snapshots are stored and retrieved by index, resolved symbols by address.
//! [`MemoryStore`] keeps everything in process memory. A
//! [`PersistenceWriter`] drains freshly loaded snapshots into a store on a
//! background task so loading never waits on storage.

use async_trait::async_trait;
use heapscope_core::error::Result;
use heapscope_core::{Snapshot, SymbolInfo};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Storage for parsed snapshots and resolved symbols
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Store a snapshot under its index, replacing any previous one
    async fn save(&self, snapshot: Arc<Snapshot>) -> Result<()>;

    /// Snapshot stored under `index`, if any
    async fn load(&self, index: usize) -> Result<Option<Arc<Snapshot>>>;

    /// Merge resolved symbols into the store
    async fn save_symbols(&self, symbols: Vec<(u32, SymbolInfo)>) -> Result<()>;

    /// Every stored symbol
    async fn load_symbols(&self) -> Result<Vec<(u32, SymbolInfo)>>;
}

/// Store that keeps everything in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshots: RwLock<HashMap<usize, Arc<Snapshot>>>,
    symbols: RwLock<HashMap<u32, SymbolInfo>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot_count(&self) -> usize {
        self.snapshots.read().await.len()
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn save(&self, snapshot: Arc<Snapshot>) -> Result<()> {
        self.snapshots
            .write()
            .await
            .insert(snapshot.index(), snapshot);
        Ok(())
    }

    async fn load(&self, index: usize) -> Result<Option<Arc<Snapshot>>> {
        Ok(self.snapshots.read().await.get(&index).cloned())
    }

    async fn save_symbols(&self, symbols: Vec<(u32, SymbolInfo)>) -> Result<()> {
        self.symbols.write().await.extend(symbols);
        Ok(())
    }

    async fn load_symbols(&self) -> Result<Vec<(u32, SymbolInfo)>> {
        let mut symbols: Vec<(u32, SymbolInfo)> = self
            .symbols
            .read()
            .await
            .iter()
            .map(|(&address, symbol)| (address, symbol.clone()))
            .collect();
        symbols.sort_by_key(|(address, _)| *address);
        Ok(symbols)
    }
}

/// Background task writing loaded snapshots into a store
pub struct PersistenceWriter {
    sender: mpsc::UnboundedSender<Arc<Snapshot>>,
    worker: JoinHandle<usize>,
}

impl PersistenceWriter {
    /// Spawn the writer on the current runtime
    pub fn start(store: Arc<dyn SnapshotStore>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Arc<Snapshot>>();
        let worker = tokio::spawn(async move {
            let mut written = 0usize;
            while let Some(snapshot) = receiver.recv().await {
                let index = snapshot.index();
                match store.save(snapshot).await {
                    Ok(()) => {
                        written += 1;
                        debug!("Persisted snapshot {}", index);
                    }
                    Err(e) => warn!("Failed to persist snapshot {}: {}", index, e),
                }
            }
            written
        });
        Self { sender, worker }
    }

    /// A handle for queueing snapshots
    pub fn queue(&self) -> PersistenceQueue {
        PersistenceQueue {
            sender: self.sender.clone(),
        }
    }

    /// Write everything still queued, then stop
    ///
    /// Returns the number of snapshots written over the writer's lifetime.
    /// Queue handles still alive keep the writer running until they drop.
    pub async fn finish(self) -> Result<usize> {
        drop(self.sender);
        Ok(self.worker.await?)
    }
}

/// Cloneable sender side of a [`PersistenceWriter`]
#[derive(Clone)]
pub struct PersistenceQueue {
    sender: mpsc::UnboundedSender<Arc<Snapshot>>,
}

impl PersistenceQueue {
    pub fn enqueue(&self, snapshot: Arc<Snapshot>) {
        if self.sender.send(snapshot).is_err() {
            debug!("Persistence writer stopped, snapshot not stored");
        }
    }
}
