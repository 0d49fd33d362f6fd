//! Diff result cache
//!
//! Diffing two dumps means running the external heap tool, so generated diff
//! files are kept in a bounded LRU cache keyed by the ordered pair of input
//! paths. A hit returns the existing file without running the tool again.
//! Evicting a diff the cache generated itself deletes the file; diffs the
//! user supplied are only forgotten.

use async_trait::async_trait;
use heapscope_core::error::Result;
use heapscope_core::tool::HeapTool;
use heapscope_core::Diff;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Produces a diff file for two dump files
#[async_trait]
pub trait DiffGenerator: Send + Sync {
    async fn generate(&self, first: &Path, second: &Path, output: &Path) -> Result<()>;
}

#[async_trait]
impl DiffGenerator for HeapTool {
    async fn generate(&self, first: &Path, second: &Path, output: &Path) -> Result<()> {
        self.diff(first, second, output).await
    }
}

/// Ordered pair of normalized absolute paths
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DiffKey {
    pub first: PathBuf,
    pub second: PathBuf,
}

impl DiffKey {
    /// ```
    /// use heapscope::diff_cache::DiffKey;
    ///
    /// let a = DiffKey::new("/dumps/./a.heap", "/dumps/x/../b.heap").unwrap();
    /// let b = DiffKey::new("/dumps/a.heap", "/dumps/b.heap").unwrap();
    /// assert_eq!(a, b);
    /// assert_ne!(a, DiffKey::new("/dumps/b.heap", "/dumps/a.heap").unwrap());
    /// ```
    pub fn new(first: impl AsRef<Path>, second: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            first: normalize_path(first.as_ref())?,
            second: normalize_path(second.as_ref())?,
        })
    }
}

/// Absolute path with `.` and `..` removed lexically
pub fn normalize_path(path: &Path) -> Result<PathBuf> {
    let absolute = std::path::absolute(path)?;
    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    Ok(normalized)
}

/// A diff file known to the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffArtifact {
    pub path: PathBuf,
    /// Generated by the cache and deleted on eviction
    pub temporary: bool,
}

pub struct DiffCache {
    entries: Mutex<LruCache<DiffKey, DiffArtifact>>,
    generator: Arc<dyn DiffGenerator>,
    temp_dir: PathBuf,
}

impl DiffCache {
    pub fn new(capacity: usize, generator: Arc<dyn DiffGenerator>, temp_dir: impl Into<PathBuf>) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            generator,
            temp_dir: temp_dir.into(),
        }
    }

    /// Path of the diff between two dumps, generating it on a miss
    ///
    /// Generation runs with the cache locked, so concurrent requests for the
    /// same pair never run the tool twice.
    pub async fn get_or_create(&self, first: &Path, second: &Path) -> Result<PathBuf> {
        let key = DiffKey::new(first, second)?;
        let mut entries = self.entries.lock().await;
        if let Some(artifact) = entries.get(&key) {
            debug!("Diff cache hit for {}", artifact.path.display());
            return Ok(artifact.path.clone());
        }

        tokio::fs::create_dir_all(&self.temp_dir).await?;
        let output = self
            .temp_dir
            .join(format!("heapscope-diff-{}.txt", Uuid::new_v4()));
        if let Err(e) = self
            .generator
            .generate(&key.first, &key.second, &output)
            .await
        {
            remove_quietly(&output);
            return Err(e);
        }

        debug!(
            "Generated diff of {} and {} into {}",
            key.first.display(),
            key.second.display(),
            output.display()
        );
        let evicted = entries.push(
            key,
            DiffArtifact {
                path: output.clone(),
                temporary: true,
            },
        );
        release(evicted);
        Ok(output)
    }

    /// Generate or reuse a diff, then parse it
    pub async fn diff(&self, first: &Path, second: &Path) -> Result<Diff> {
        let path = self.get_or_create(first, second).await?;
        heapscope_parser::load_diff(&path).await
    }

    /// Record a diff file the user produced; it is never deleted
    pub async fn insert_user(&self, first: &Path, second: &Path, diff: &Path) -> Result<()> {
        let key = DiffKey::new(first, second)?;
        let artifact = DiffArtifact {
            path: diff.to_path_buf(),
            temporary: false,
        };
        let evicted = self.entries.lock().await.push(key, artifact);
        release(evicted);
        Ok(())
    }

    pub async fn contains(&self, first: &Path, second: &Path) -> Result<bool> {
        let key = DiffKey::new(first, second)?;
        Ok(self.entries.lock().await.contains(&key))
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Forget every entry, deleting generated files
    pub async fn clear(&self) {
        drain(&mut *self.entries.lock().await);
    }
}

impl Drop for DiffCache {
    fn drop(&mut self) {
        drain(self.entries.get_mut());
    }
}

fn drain(entries: &mut LruCache<DiffKey, DiffArtifact>) {
    while let Some(entry) = entries.pop_lru() {
        release(Some(entry));
    }
}

/// Delete the files of generated artifacts that left the cache
fn release(evicted: impl IntoIterator<Item = (DiffKey, DiffArtifact)>) {
    for (_, artifact) in evicted {
        if artifact.temporary {
            remove_quietly(&artifact.path);
        }
    }
}

fn remove_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_file(path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        debug!("Failed to remove diff file {}: {}", path.display(), e);
    }
}
