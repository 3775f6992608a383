// Artifact cache
// Content-addressed storage of task outputs, keyed by input hashes and
// resolved parameters. Providers stack into a tiered cache: reads take the
// first hit, writes go to every writable tier.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::defs::{Compression, DataItem};
use crate::error::CacheError;

pub mod key;
pub mod local;
pub mod lock;

pub use key::{compute_key, CacheKey, DefaultHashProvider, HashProvider, HashRegistry};
pub use local::LocalCache;
pub use lock::CacheLock;

/// One cache tier
#[async_trait]
pub trait CacheProvider: Send + Sync {
    fn name(&self) -> &str;

    /// False for tiers that only serve reads (shared team caches)
    fn writable(&self) -> bool;

    async fn exists(&self, key: &CacheKey) -> bool;

    /// Restore the entry's outputs into `run_dir`, returning the rewritten
    /// data items, or `None` on a miss
    async fn get(
        &self,
        key: &CacheKey,
        run_dir: &Path,
    ) -> Result<Option<Vec<DataItem>>, CacheError>;

    /// Store `outputs` under `key`. Returns false when the provider declined
    /// (read-only, or the entry already exists).
    async fn put(
        &self,
        key: &CacheKey,
        run_dir: &Path,
        outputs: &[DataItem],
        compression: Compression,
    ) -> Result<bool, CacheError>;
}

/// Ordered stack of cache providers
#[derive(Default)]
pub struct TieredCache {
    tiers: Vec<Arc<dyn CacheProvider>>,
}

impl TieredCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, provider: Arc<dyn CacheProvider>) {
        self.tiers.push(provider);
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    /// First tier with a hit wins; retryable tier errors fall through to the
    /// next tier
    pub async fn get(
        &self,
        key: &CacheKey,
        run_dir: &Path,
    ) -> Result<Option<Vec<DataItem>>, CacheError> {
        for tier in &self.tiers {
            match tier.get(key, run_dir).await {
                Ok(Some(outputs)) => return Ok(Some(outputs)),
                Ok(None) => continue,
                Err(e) if e.is_retryable() => {
                    tracing::warn!("cache tier '{}' unavailable for {}: {}", tier.name(), key, e);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Every writable tier receives a copy; failures in one tier do not stop
    /// the others
    pub async fn put(
        &self,
        key: &CacheKey,
        run_dir: &Path,
        outputs: &[DataItem],
        compression: Compression,
    ) -> Result<(), CacheError> {
        for tier in &self.tiers {
            if !tier.writable() {
                continue;
            }
            match tier.put(key, run_dir, outputs, compression).await {
                Ok(_) => {}
                Err(CacheError::PathEscape(path)) => {
                    // Structural problem with the outputs, not the tier
                    return Err(CacheError::PathEscape(path));
                }
                Err(e) => {
                    tracing::warn!("cache tier '{}' rejected {}: {}", tier.name(), key, e);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> CacheKey {
        CacheKey {
            task: "t".to_string(),
            hash: "h".to_string(),
        }
    }

    fn output_in(run_dir: &Path, file: &str, contents: &[u8]) -> DataItem {
        let dir = run_dir.join("out");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(file), contents).unwrap();

        let mut item = DataItem::new("fileset");
        item.basedir = Some(dir);
        item.files.push(file.to_string());
        item
    }

    #[tokio::test]
    async fn test_first_hit_wins() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let run1 = tempfile::tempdir().unwrap();
        let run2 = tempfile::tempdir().unwrap();

        // Seed only the second tier
        let lower = LocalCache::new(dir_b.path());
        let item = output_in(run1.path(), "a.txt", b"lower");
        lower
            .put(&key(), run1.path(), &[item], Compression::None)
            .await
            .unwrap();

        let mut cache = TieredCache::new();
        cache.push(Arc::new(LocalCache::new(dir_a.path())));
        cache.push(Arc::new(lower));

        let outputs = cache.get(&key(), run2.path()).await.unwrap().unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(
            std::fs::read(run2.path().join("out/a.txt")).unwrap(),
            b"lower"
        );
    }

    #[tokio::test]
    async fn test_write_reaches_all_writable_tiers() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let dir_c = tempfile::tempdir().unwrap();
        let run = tempfile::tempdir().unwrap();

        let mut cache = TieredCache::new();
        cache.push(Arc::new(LocalCache::new(dir_a.path())));
        cache.push(Arc::new(LocalCache::new(dir_b.path()).read_only()));
        cache.push(Arc::new(LocalCache::new(dir_c.path())));

        let item = output_in(run.path(), "a.txt", b"x");
        cache
            .put(&key(), run.path(), &[item], Compression::None)
            .await
            .unwrap();

        assert!(LocalCache::new(dir_a.path()).exists(&key()).await);
        assert!(!LocalCache::new(dir_b.path()).exists(&key()).await);
        assert!(LocalCache::new(dir_c.path()).exists(&key()).await);
    }

    #[tokio::test]
    async fn test_all_misses_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let run = tempfile::tempdir().unwrap();

        let mut cache = TieredCache::new();
        cache.push(Arc::new(LocalCache::new(dir.path())));
        assert!(cache.get(&key(), run.path()).await.unwrap().is_none());
    }
}
