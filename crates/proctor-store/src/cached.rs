//! Caching decorator for any [`PersisterCore`]

use crate::cache::{CacheStats, ContentCache, ContentKey, VersionCache};
use crate::config::CacheConfig;
use crate::error::StoreResult;
use crate::persister::{Artifact, ArtifactKind, PersisterCore, Updater};
use async_trait::async_trait;
use proctor_model::{ChangeMetadata, Revision, TestVersionResult};
use std::sync::Arc;

/// Read-through caching in front of another core.
///
/// Writes and history queries pass straight through.
#[derive(Debug)]
pub struct CachedPersisterCore {
    core: Arc<dyn PersisterCore>,
    contents: ContentCache,
    versions: VersionCache,
}

impl CachedPersisterCore {
    /// Wrap `core`
    #[must_use]
    pub fn new(core: Arc<dyn PersisterCore>, config: &CacheConfig) -> Self {
        Self {
            core,
            contents: ContentCache::new(config),
            versions: VersionCache::new(config),
        }
    }

    /// Content cache statistics
    pub async fn content_stats(&self) -> CacheStats {
        self.contents.run_pending_tasks().await;
        self.contents.stats()
    }

    /// Version cache statistics
    pub async fn version_stats(&self) -> CacheStats {
        self.versions.run_pending_tasks().await;
        self.versions.stats()
    }
}

#[async_trait]
impl PersisterCore for CachedPersisterCore {
    async fn read_optional(
        &self,
        kind: ArtifactKind,
        path: &str,
        revision: u64,
    ) -> StoreResult<Option<Artifact>> {
        self.contents
            .get_or_load(ContentKey::new(kind, path, revision), || {
                self.core.read_optional(kind, path, revision)
            })
            .await
    }

    async fn determine_versions(&self, revision: u64) -> StoreResult<TestVersionResult> {
        let listing = self
            .versions
            .try_get_or_load(revision, self.core.determine_versions(revision))
            .await?;
        Ok(TestVersionResult::clone(&listing))
    }

    async fn do_in_working_directory(
        &self,
        meta: &ChangeMetadata,
        previous_version: &str,
        updater: Updater,
    ) -> StoreResult<bool> {
        self.core.do_in_working_directory(meta, previous_version, updater).await
    }

    async fn history(
        &self,
        path: &str,
        revision: u64,
        start: usize,
        limit: usize,
    ) -> StoreResult<Vec<Revision>> {
        self.core.history(path, revision, start, limit).await
    }

    async fn matrix_history(&self, start: usize, limit: usize) -> StoreResult<Vec<Revision>> {
        self.core.matrix_history(start, limit).await
    }

    async fn latest_version(&self) -> StoreResult<String> {
        self.core.latest_version().await
    }

    async fn get_latest_revision(&self) -> StoreResult<u64> {
        self.core.get_latest_revision().await
    }

    fn clean_user_workspace(&self, identity: &str) -> bool {
        self.core.clean_user_workspace(identity)
    }

    fn add_test_revision(&self) -> &'static str {
        self.core.add_test_revision()
    }

    fn test_definitions_directory(&self) -> &str {
        self.core.test_definitions_directory()
    }

    fn close(&self) {
        self.core.close();
        self.contents.invalidate_all();
        self.versions.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::persister::ScmPersisterCore;
    use crate::scm::local::LocalRepository;
    use crate::scm::ChangeSet;
    use proctor_model::{TestDefinition, TestType};
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    const PATH: &str = "test-definitions/late/definition.json";

    struct Fixture {
        _dirs: (TempDir, TempDir),
        repo: LocalRepository,
        cached: CachedPersisterCore,
    }

    fn fixture() -> Fixture {
        let repo_dir = TempDir::new().unwrap();
        let work_dir = TempDir::new().unwrap();
        let repo = LocalRepository::init(repo_dir.path()).unwrap();
        repo.add_user("alice", "secret").unwrap();
        repo.mkdir("test-definitions", "alice", "Create layout").unwrap();
        let config = StoreConfig::new(work_dir.path());
        let core = ScmPersisterCore::open(Arc::new(repo.clone()), &config).unwrap();
        Fixture {
            _dirs: (repo_dir, work_dir),
            repo,
            cached: CachedPersisterCore::new(Arc::new(core), &config.cache),
        }
    }

    async fn create_late_test(cached: &CachedPersisterCore) {
        let updater: Updater = Box::new(|changes: &mut ChangeSet, dir: &Path| {
            let file = dir.join(PATH);
            fs::create_dir_all(file.parent().unwrap_or(dir))?;
            let definition = TestDefinition::new(TestType::USER, "late");
            fs::write(&file, serde_json::to_string(&definition).unwrap())?;
            changes.add(file);
            Ok(true)
        });
        let meta = ChangeMetadata::new("alice", "secret", "add late");
        assert!(cached.do_in_working_directory(&meta, "0", updater).await.unwrap());
    }

    #[tokio::test]
    async fn default_is_returned_but_never_cached() {
        let f = fixture();
        let before = f.repo.head();
        let default = Artifact::Definition(Arc::new(TestDefinition::new(TestType::PAGE, "default")));

        for _ in 0..2 {
            let read = f
                .cached
                .get_file_contents(ArtifactKind::Definition, PATH, before, Some(default.clone()))
                .await
                .unwrap();
            assert_eq!(read, Some(default.clone()));
        }
        assert_eq!(f.cached.content_stats().await.entry_count, 0);

        create_late_test(&f.cached).await;
        let after = f.repo.head();

        let read = f
            .cached
            .get_file_contents(ArtifactKind::Definition, PATH, after, Some(default.clone()))
            .await
            .unwrap()
            .and_then(Artifact::into_definition)
            .unwrap();
        assert_eq!(read.salt, "late");
        assert_eq!(f.cached.content_stats().await.entry_count, 1);

        let old = f
            .cached
            .read_optional(ArtifactKind::Definition, PATH, before)
            .await
            .unwrap();
        assert!(old.is_none());
    }

    #[tokio::test]
    async fn version_listings_are_cached_per_revision() {
        let f = fixture();
        create_late_test(&f.cached).await;
        let head = f.repo.head();

        let first = f.cached.determine_versions(head).await.unwrap();
        let second = f.cached.determine_versions(head).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.tests.len(), 1);
        assert_eq!(f.cached.version_stats().await.entry_count, 1);
    }

    #[tokio::test]
    async fn missing_revision_is_a_read_error() {
        let f = fixture();
        let err = f.cached.determine_versions(999).await.unwrap_err();
        assert!(err.is_read());
        assert_eq!(f.cached.version_stats().await.entry_count, 0);
    }
}
