//! Shared progress counters and session events
//!
//! Background workers publish their progress through [`Progress`] and
//! announce state changes on a broadcast channel of [`SessionEvent`]s. Both
//! are read by whatever front end drives the session.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// Current/maximum pair updated lock-free by workers
#[derive(Debug, Default)]
pub struct Progress {
    current: AtomicU64,
    maximum: AtomicU64,
}

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Announce `count` more units of work
    pub fn add_work(&self, count: u64) {
        self.maximum.fetch_add(count, Ordering::Relaxed);
    }

    /// Mark `count` units of work as done
    pub fn complete(&self, count: u64) {
        self.current.fetch_add(count, Ordering::Relaxed);
    }

    /// `(current, maximum)`
    ///
    /// ```
    /// use heapscope_core::progress::Progress;
    ///
    /// let progress = Progress::new();
    /// progress.add_work(3);
    /// progress.complete(1);
    /// assert_eq!(progress.get(), (1, 3));
    /// ```
    pub fn get(&self) -> (u64, u64) {
        let current = self.current.load(Ordering::Relaxed);
        let maximum = self.maximum.load(Ordering::Relaxed);
        (current, maximum.max(current))
    }

    pub fn is_done(&self) -> bool {
        let (current, maximum) = self.get();
        current >= maximum
    }
}

/// Notifications published by a running session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The sorted snapshot list changed
    SnapshotsChanged,
    /// A snapshot file could not be loaded
    SnapshotLoadFailed { path: PathBuf, error: String },
    /// A resolution batch completed this many addresses
    SymbolsResolved(usize),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_progress_from_many_threads() {
        let progress = Arc::new(Progress::new());
        progress.add_work(400);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let progress = progress.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        progress.complete(1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(progress.get(), (400, 400));
        assert!(progress.is_done());
    }

    #[test]
    fn test_maximum_never_below_current() {
        let progress = Progress::new();
        progress.complete(2);
        assert_eq!(progress.get(), (2, 2));
    }
}
