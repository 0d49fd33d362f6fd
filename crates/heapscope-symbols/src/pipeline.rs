//! Symbol cache and batched resolution pipeline
//!
//! Every raw frame address is in one of three states:
//!
//! - **Resolved**: its symbol is in the cache and is returned immediately.
//! - **Pending**: a request is queued; callers share one future that
//!   completes exactly once.
//! - **Unseen**: the first caller queues a request and records it as pending.
//!
//! The resolved cache and the pending map live under one lock so the
//! "check resolved, check pending, insert pending" sequence and the
//! "insert resolved, remove pending" completion are each atomic. The lock is
//! never held across an await.
//!
//! Workers drain the queue in batches and hand each batch to a
//! [`FrameResolver`]. They stay idle while snapshot loads are in flight so
//! resolution does not compete with parsing for I/O. Every request in a
//! batch is completed, with a placeholder symbol when the resolver failed or
//! had no answer. Once the pipeline is shut down, pending addresses and any
//! address looked up afterwards settle on placeholders.

use crate::resolver::FrameResolver;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared, join_all};
use heapscope_core::progress::{Progress, SessionEvent};
use heapscope_core::types::{Module, Snapshot, Traceback};
use heapscope_core::SymbolInfo;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Future completing with the symbol of one address
pub type SymbolFuture = Shared<BoxFuture<'static, Arc<SymbolInfo>>>;

/// Outcome of a cache lookup
#[derive(Clone)]
pub enum Lookup {
    /// Already in the cache
    Resolved(Arc<SymbolInfo>),
    /// Another caller already queued this address
    Pending(SymbolFuture),
    /// This call queued the address
    Queued(SymbolFuture),
}

impl Lookup {
    /// Wait for the symbol
    pub async fn wait(self) -> Arc<SymbolInfo> {
        match self {
            Lookup::Resolved(symbol) => symbol,
            Lookup::Pending(future) | Lookup::Queued(future) => future.await,
        }
    }

    pub fn resolved(&self) -> Option<&Arc<SymbolInfo>> {
        match self {
            Lookup::Resolved(symbol) => Some(symbol),
            _ => None,
        }
    }
}

/// Worker settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    pub workers: usize,
    pub batch_size: usize,
    pub idle_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            batch_size: 1024,
            idle_interval: Duration::from_millis(50),
        }
    }
}

struct Request {
    address: u32,
    completion: oneshot::Sender<Arc<SymbolInfo>>,
}

#[derive(Default)]
struct CacheState {
    resolved: HashMap<u32, Arc<SymbolInfo>>,
    pending: HashMap<u32, SymbolFuture>,
}

struct Inner {
    state: Mutex<CacheState>,
    sender: mpsc::UnboundedSender<Request>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<Request>>,
    resolver: Arc<dyn FrameResolver>,
    config: PipelineConfig,
    loads_pending: Arc<AtomicUsize>,
    progress: Arc<Progress>,
    events: broadcast::Sender<SessionEvent>,
    batches: AtomicU64,
    /// Flips to true once, under the state lock
    closed: watch::Sender<bool>,
}

/// Session-owned symbol cache with its resolution workers
///
/// Shutting down or dropping the pipeline stops its workers. Requests still
/// queued at that point complete with placeholders.
pub struct SymbolPipeline {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SymbolPipeline {
    /// Create the pipeline and spawn its workers on the current runtime
    ///
    /// `loads_pending` is the number of snapshot loads still in flight;
    /// workers idle while it is non-zero.
    pub fn start(
        resolver: Arc<dyn FrameResolver>,
        config: PipelineConfig,
        loads_pending: Arc<AtomicUsize>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let config = PipelineConfig {
            workers: config.workers.max(1),
            batch_size: config.batch_size.max(1),
            ..config
        };
        let inner = Arc::new(Inner {
            state: Mutex::new(CacheState::default()),
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
            resolver,
            config,
            loads_pending,
            progress: Arc::new(Progress::new()),
            events,
            batches: AtomicU64::new(0),
            closed: watch::Sender::new(false),
        });

        let workers = (0..config.workers)
            .map(|worker| tokio::spawn(run_worker(inner.clone(), worker)))
            .collect();
        debug!(
            "Started {} symbol workers (batch size {})",
            config.workers, config.batch_size
        );

        Self {
            inner,
            workers: Mutex::new(workers),
        }
    }

    /// Look up `address`, queueing it for resolution when unseen
    pub fn resolve(&self, address: u32) -> Lookup {
        let mut state = self.inner.lock_state();
        if let Some(symbol) = state.resolved.get(&address) {
            return Lookup::Resolved(symbol.clone());
        }
        if let Some(future) = state.pending.get(&address) {
            return Lookup::Pending(future.clone());
        }
        if self.is_closed() {
            let symbol = Arc::new(SymbolInfo::unknown(address));
            state.resolved.insert(address, symbol.clone());
            return Lookup::Resolved(symbol);
        }

        let (completion, receiver) = oneshot::channel();
        let closed = self.inner.closed.subscribe();
        let future = async move {
            let symbol = tokio::select! {
                biased;
                symbol = receiver => symbol.ok(),
                _ = wait_closed(closed) => None,
            };
            symbol.unwrap_or_else(|| Arc::new(SymbolInfo::unknown(address)))
        }
        .boxed()
        .shared();

        match self.inner.sender.send(Request {
            address,
            completion,
        }) {
            Ok(()) => {
                state.pending.insert(address, future.clone());
                self.inner.progress.add_work(1);
                Lookup::Queued(future)
            }
            Err(mpsc::error::SendError(request)) => {
                let symbol = Arc::new(SymbolInfo::unknown(address));
                state.resolved.insert(address, symbol.clone());
                let _ = request.completion.send(symbol.clone());
                Lookup::Resolved(symbol)
            }
        }
    }

    /// Cached symbol for `address`, without queueing anything
    pub fn cached(&self, address: u32) -> Option<Arc<SymbolInfo>> {
        self.inner.lock_state().resolved.get(&address).cloned()
    }

    /// Queue every unseen address, returning how many were queued
    pub fn enqueue(&self, addresses: impl IntoIterator<Item = u32>) -> usize {
        addresses
            .into_iter()
            .filter(|&address| matches!(self.resolve(address), Lookup::Queued(_)))
            .count()
    }

    /// Make modules known to the resolver
    pub fn register_modules(&self, modules: &[Module]) {
        self.inner.resolver.register_modules(modules);
    }

    /// Register a snapshot's modules and queue all of its frames
    pub fn enqueue_snapshot(&self, snapshot: &Snapshot) -> usize {
        let modules: Vec<Module> = snapshot.modules.values().cloned().collect();
        self.register_modules(&modules);
        let queued = self.enqueue(snapshot.unique_frames());
        debug!(
            "Queued {} new frames from snapshot {}",
            queued,
            snapshot.index()
        );
        queued
    }

    /// Resolve several addresses, waiting for all of them
    pub async fn resolve_all(&self, addresses: &[u32]) -> Vec<Arc<SymbolInfo>> {
        let lookups: Vec<Lookup> = addresses.iter().map(|&a| self.resolve(a)).collect();
        join_all(lookups.into_iter().map(Lookup::wait)).await
    }

    /// Symbols for every frame of a traceback, outermost last
    pub async fn symbolize(&self, traceback: &Traceback) -> Vec<Arc<SymbolInfo>> {
        self.resolve_all(&traceback.frames).await
    }

    /// Seed the cache with previously resolved symbols
    ///
    /// Addresses already resolved or pending are left alone.
    pub fn preload(&self, symbols: impl IntoIterator<Item = (u32, SymbolInfo)>) -> usize {
        let mut state = self.inner.lock_state();
        let mut added = 0;
        for (address, symbol) in symbols {
            if state.resolved.contains_key(&address) || state.pending.contains_key(&address) {
                continue;
            }
            state.resolved.insert(address, Arc::new(symbol));
            added += 1;
        }
        added
    }

    /// Every resolved symbol, for persistence
    pub fn resolved_symbols(&self) -> Vec<(u32, SymbolInfo)> {
        let state = self.inner.lock_state();
        let mut symbols: Vec<(u32, SymbolInfo)> = state
            .resolved
            .iter()
            .map(|(&address, symbol)| (address, (**symbol).clone()))
            .collect();
        symbols.sort_by_key(|(address, _)| *address);
        symbols
    }

    pub fn resolved_count(&self) -> usize {
        self.inner.lock_state().resolved.len()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock_state().pending.len()
    }

    /// Number of batches handed to the resolver so far
    pub fn batch_count(&self) -> u64 {
        self.inner.batches.load(Ordering::Relaxed)
    }

    /// Resolved count against total queued, across the session
    pub fn progress(&self) -> Arc<Progress> {
        self.inner.progress.clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Stop all workers and settle every pending address on a placeholder
    ///
    /// Lookups after shutdown resolve immediately to placeholders.
    pub fn shutdown(&self) {
        let workers: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for worker in &workers {
            worker.abort();
        }

        let settled = {
            let mut state = self.inner.lock_state();
            if self.inner.closed.send_replace(true) {
                return;
            }
            let pending: Vec<u32> = state.pending.drain().map(|(address, _)| address).collect();
            for &address in &pending {
                state
                    .resolved
                    .insert(address, Arc::new(SymbolInfo::unknown(address)));
            }
            pending.len()
        };

        self.inner.progress.complete(settled as u64);
        debug!(
            "Symbol pipeline shut down, {} pending addresses left unresolved",
            settled
        );
    }
}

impl Drop for SymbolPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn wait_for_loads(&self) {
        while self.loads_pending.load(Ordering::Acquire) > 0 {
            tokio::time::sleep(self.config.idle_interval).await;
        }
    }

    /// Block for one request, then take whatever else is queued
    async fn next_batch(&self) -> Option<Vec<Request>> {
        let mut receiver = self.receiver.lock().await;
        let first = receiver.recv().await?;
        self.wait_for_loads().await;

        let mut batch = Vec::with_capacity(self.config.batch_size.min(256));
        batch.push(first);
        while batch.len() < self.config.batch_size {
            match receiver.try_recv() {
                Ok(request) => batch.push(request),
                Err(_) => break,
            }
        }
        Some(batch)
    }

    async fn process_batch(&self, worker: usize, batch: Vec<Request>) {
        let addresses: Vec<u32> = batch.iter().map(|r| r.address).collect();
        self.batches.fetch_add(1, Ordering::Relaxed);
        trace!("Worker {} resolving {} addresses", worker, addresses.len());

        let outcome = AssertUnwindSafe(self.resolver.resolve_batch(&addresses))
            .catch_unwind()
            .await;
        let mut results = match outcome {
            Ok(Ok(results)) => results,
            Ok(Err(e)) => {
                warn!(
                    "Symbol resolution failed for {} addresses: {}",
                    addresses.len(),
                    e
                );
                HashMap::new()
            }
            Err(_) => {
                warn!(
                    "Symbol resolver panicked on a batch of {} addresses",
                    addresses.len()
                );
                HashMap::new()
            }
        };

        let mut completions = Vec::with_capacity(batch.len());
        let mut unresolved = 0usize;
        let mut settled = 0u64;
        {
            let mut state = self.lock_state();
            for request in batch {
                let symbol = match results.remove(&request.address) {
                    Some(symbol) => Arc::new(symbol),
                    None => {
                        unresolved += 1;
                        Arc::new(SymbolInfo::unknown(request.address))
                    }
                };
                // Shutdown may have settled the address already
                if state.pending.remove(&request.address).is_some() {
                    state.resolved.insert(request.address, symbol.clone());
                    settled += 1;
                }
                completions.push((request.completion, symbol));
            }
        }

        let count = completions.len();
        for (completion, symbol) in completions {
            let _ = completion.send(symbol);
        }
        self.progress.complete(settled);
        let _ = self.events.send(SessionEvent::SymbolsResolved(count));
        debug!(
            "Worker {} resolved {} addresses ({} placeholders)",
            worker, count, unresolved
        );
    }
}

/// Completes once the pipeline is shut down or gone
async fn wait_closed(mut closed: watch::Receiver<bool>) {
    while !*closed.borrow_and_update() {
        if closed.changed().await.is_err() {
            return;
        }
    }
}

async fn run_worker(inner: Arc<Inner>, worker: usize) {
    while let Some(batch) = inner.next_batch().await {
        inner.process_batch(worker, batch).await;
    }
    debug!("Symbol worker {} stopped", worker);
}
