//! Read-through caches in front of the persister core
//!
//! Two independent moka caches:
//! - [`ContentCache`]: `(artifact kind, path, revision)` to decoded artifact
//! - [`VersionCache`]: revision to test version listing
//!
//! Revisions are immutable, so entries never need invalidation; they only
//! age out after the idle window or under capacity pressure.

use crate::config::CacheConfig;
use crate::error::{StoreError, StoreResult};
use crate::persister::{Artifact, ArtifactKind};
use moka::future::Cache;
use proctor_model::TestVersionResult;
use std::future::Future;
use std::sync::Arc;

/// Statistics for cache monitoring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of entries in cache
    pub entry_count: u64,
}

/// Key of one cached artifact
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentKey {
    /// Artifact kind
    pub kind: ArtifactKind,
    /// Repository path
    pub path: String,
    /// Revision read at
    pub revision: u64,
}

impl ContentKey {
    /// Create key
    #[inline]
    #[must_use]
    pub fn new(kind: ArtifactKind, path: impl Into<String>, revision: u64) -> Self {
        Self {
            kind,
            path: path.into(),
            revision,
        }
    }
}

/// Decoded artifacts by kind, path and revision
#[derive(Debug, Clone)]
pub struct ContentCache {
    inner: Cache<ContentKey, Artifact>,
}

impl ContentCache {
    /// Create cache from bounds
    #[must_use]
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(config.content_capacity)
                .time_to_idle(config.time_to_idle())
                .build(),
        }
    }

    /// Get cached artifact
    pub async fn get(&self, key: &ContentKey) -> Option<Artifact> {
        self.inner.get(key).await
    }

    /// Look up `key`, loading through `load` on a miss.
    ///
    /// Only found artifacts are cached; a `None` from `load` is returned as
    /// is and the next lookup loads again.
    pub async fn get_or_load<F, Fut>(&self, key: ContentKey, load: F) -> StoreResult<Option<Artifact>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StoreResult<Option<Artifact>>>,
    {
        if let Some(cached) = self.inner.get(&key).await {
            return Ok(Some(cached));
        }
        let loaded = load().await?;
        if let Some(artifact) = &loaded {
            self.inner.insert(key, artifact.clone()).await;
        }
        Ok(loaded)
    }

    /// Drop every entry
    #[inline]
    pub fn invalidate_all(&self) {
        self.inner.invalidate_all();
    }

    /// Apply pending evictions so [`stats`](Self::stats) is exact
    pub async fn run_pending_tasks(&self) {
        self.inner.run_pending_tasks().await;
    }

    /// Get cache statistics
    #[inline]
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entry_count: self.inner.entry_count(),
        }
    }
}

impl Default for ContentCache {
    fn default() -> Self {
        Self::new(&CacheConfig::default())
    }
}

/// Version listings by revision
#[derive(Debug, Clone)]
pub struct VersionCache {
    inner: Cache<u64, Arc<TestVersionResult>>,
}

impl VersionCache {
    /// Create cache from bounds
    #[must_use]
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(config.version_capacity)
                .time_to_idle(config.time_to_idle())
                .build(),
        }
    }

    /// Look up `revision`, loading through `load` on a miss.
    ///
    /// Concurrent misses for the same revision share one load. A failed load
    /// is not cached and surfaces as a read error.
    pub async fn try_get_or_load<F>(&self, revision: u64, load: F) -> StoreResult<Arc<TestVersionResult>>
    where
        F: Future<Output = StoreResult<TestVersionResult>>,
    {
        self.inner
            .try_get_with(revision, async move { load.await.map(Arc::new) })
            .await
            .map_err(|e| {
                StoreError::read_with(format!("Unable to list test versions at revision {revision}"), e)
            })
    }

    /// Drop every entry
    #[inline]
    pub fn invalidate_all(&self) {
        self.inner.invalidate_all();
    }

    /// Apply pending evictions so [`stats`](Self::stats) is exact
    pub async fn run_pending_tasks(&self) {
        self.inner.run_pending_tasks().await;
    }

    /// Get cache statistics
    #[inline]
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entry_count: self.inner.entry_count(),
        }
    }
}

impl Default for VersionCache {
    fn default() -> Self {
        Self::new(&CacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use proctor_model::{TestDefinition, TestType, TestVersion};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn definition() -> Artifact {
        Artifact::Definition(Arc::new(TestDefinition::new(TestType::USER, "salt")))
    }

    fn listing(revision: u64) -> TestVersionResult {
        TestVersionResult {
            tests: vec![TestVersion::new("example", revision.to_string())],
            published: Utc::now(),
            author: "alice".to_string(),
            version: revision.to_string(),
            description: "msg".to_string(),
        }
    }

    #[tokio::test]
    async fn found_artifacts_are_cached() {
        let cache = ContentCache::default();
        let loads = AtomicUsize::new(0);
        let key = ContentKey::new(ArtifactKind::Definition, "test-definitions/a/definition.json", 3);

        for _ in 0..3 {
            let loaded = cache
                .get_or_load(key.clone(), || async {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok(Some(definition()))
                })
                .await
                .unwrap();
            assert!(loaded.is_some());
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_artifacts_are_not_cached() {
        let cache = ContentCache::default();
        let loads = AtomicUsize::new(0);
        let key = ContentKey::new(ArtifactKind::Definition, "test-definitions/b/definition.json", 3);

        for _ in 0..2 {
            let loaded = cache
                .get_or_load(key.clone(), || async {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                })
                .await
                .unwrap();
            assert!(loaded.is_none());
        }
        assert_eq!(loads.load(Ordering::SeqCst), 2);
        assert!(cache.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn failed_version_loads_are_read_errors_and_retried() {
        let cache = VersionCache::default();

        let err = cache
            .try_get_or_load(7, async { Err(StoreError::read("boom")) })
            .await
            .unwrap_err();
        assert!(err.is_read());

        let loaded = cache.try_get_or_load(7, async { Ok(listing(7)) }).await.unwrap();
        assert_eq!(loaded.version, "7");

        let cached = cache
            .try_get_or_load(7, async { Err(StoreError::read("not called")) })
            .await
            .unwrap();
        assert_eq!(cached.tests.len(), 1);
    }
}
