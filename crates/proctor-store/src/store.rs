//! File-based test definition store
//!
//! Layout inside the repository:
//!
//! ```text
//! test-definitions/
//!   <test name>/
//!     definition.json
//!     metadata.json
//! ```

use crate::error::{StoreError, StoreResult};
use crate::persister::{parse_revision, Artifact, ArtifactKind, PersisterCore, TestMetadata, Updater};
use crate::scm::ChangeSet;
use async_trait::async_trait;
use futures::future::try_join_all;
use proctor_model::{ChangeMetadata, Revision, TestDefinition, TestMatrixDefinition, TestMatrixVersion};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// File holding a test's definition
pub const DEFINITION_FILENAME: &str = "definition.json";

/// File holding a test's metadata
pub const METADATA_FILENAME: &str = "metadata.json";

/// Versioned store of test definitions for one environment
#[async_trait]
pub trait ProctorStore: Send + Sync + fmt::Debug {
    /// Matrix at head
    async fn current_test_matrix(&self) -> StoreResult<TestMatrixVersion>;

    /// Matrix at `revision`
    async fn test_matrix(&self, revision: &str) -> StoreResult<TestMatrixVersion>;

    /// Definition at the test's latest revision, `None` if the test does not exist
    async fn current_test_definition(&self, test_name: &str) -> StoreResult<Option<TestDefinition>>;

    /// Definition at `revision`, `None` if the test did not exist then
    async fn test_definition(&self, test_name: &str, revision: &str) -> StoreResult<Option<TestDefinition>>;

    /// Newest-first history of a test at head, paged
    async fn history(&self, test_name: &str, start: usize, limit: usize) -> StoreResult<Vec<Revision>>;

    /// Newest-first history of a test at or before `revision`, paged
    async fn history_from(
        &self,
        test_name: &str,
        revision: &str,
        start: usize,
        limit: usize,
    ) -> StoreResult<Vec<Revision>>;

    /// Full history of every current test
    async fn all_histories(&self) -> StoreResult<BTreeMap<String, Vec<Revision>>>;

    /// Newest-first history of the whole store, paged
    async fn matrix_history(&self, start: usize, limit: usize) -> StoreResult<Vec<Revision>>;

    /// Revision of the newest commit
    async fn latest_version(&self) -> StoreResult<String>;

    /// Head revision
    async fn latest_revision(&self) -> StoreResult<String>;

    /// Create a test; fails if it already exists
    async fn add_test_definition(
        &self,
        meta: &ChangeMetadata,
        previous_version: &str,
        test_name: &str,
        definition: &TestDefinition,
        metadata: &TestMetadata,
    ) -> StoreResult<()>;

    /// Replace a test's definition; fails if it does not exist or nothing changed
    async fn update_test_definition(
        &self,
        meta: &ChangeMetadata,
        previous_version: &str,
        test_name: &str,
        definition: &TestDefinition,
        metadata: &TestMetadata,
    ) -> StoreResult<()>;

    /// Remove a test; fails if it does not exist
    async fn delete_test_definition(
        &self,
        meta: &ChangeMetadata,
        previous_version: &str,
        test_name: &str,
        definition: &TestDefinition,
    ) -> StoreResult<()>;

    /// Delete `identity`'s workspace
    fn clean_user_workspace(&self, identity: &str) -> bool;

    /// Check the backing repository is usable
    async fn verify_setup(&self) -> StoreResult<()>;

    /// Release resources. Idempotent.
    fn close(&self);
}

/// [`ProctorStore`] keeping one directory per test
#[derive(Debug)]
pub struct FileBasedProctorStore {
    core: Arc<dyn PersisterCore>,
    name: String,
    /// serializes full-history scans
    history_lock: tokio::sync::Mutex<()>,
}

impl FileBasedProctorStore {
    /// Create store over `core`; `name` only appears in logs
    #[must_use]
    pub fn new(core: Arc<dyn PersisterCore>, name: impl Into<String>) -> Self {
        Self {
            core,
            name: name.into(),
            history_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// The persister core
    #[inline]
    #[must_use]
    pub fn core(&self) -> &Arc<dyn PersisterCore> {
        &self.core
    }

    fn test_path(&self, test_name: &str) -> String {
        format!("{}/{test_name}", self.core.test_definitions_directory())
    }

    fn file_path(&self, test_name: &str, file: &str) -> String {
        format!("{}/{test_name}/{file}", self.core.test_definitions_directory())
    }

    async fn definition_at(&self, test_name: &str, revision: u64) -> StoreResult<Option<TestDefinition>> {
        let artifact = self
            .core
            .get_file_contents(
                ArtifactKind::Definition,
                &self.file_path(test_name, DEFINITION_FILENAME),
                revision,
                None,
            )
            .await?;
        Ok(artifact
            .and_then(Artifact::into_definition)
            .map(|definition| TestDefinition::clone(&definition)))
    }
}

/// Write `value` as pretty JSON unless the file already holds an equal value
pub fn write_if_changed<T: Serialize>(path: &Path, value: &T) -> StoreResult<bool> {
    let encoded = serde_json::to_value(value)
        .map_err(|e| StoreError::update_with(format!("Unable to encode {}", path.display()), e))?;
    if path.is_file() {
        let existing = std::fs::read(path)?;
        if serde_json::from_slice::<serde_json::Value>(&existing).is_ok_and(|v| v == encoded) {
            tracing::debug!(path = %path.display(), "Unchanged, not writing");
            return Ok(false);
        }
    }
    let pretty = serde_json::to_vec_pretty(&encoded)
        .map_err(|e| StoreError::update_with(format!("Unable to encode {}", path.display()), e))?;
    std::fs::write(path, pretty)?;
    Ok(true)
}

#[async_trait]
impl ProctorStore for FileBasedProctorStore {
    async fn current_test_matrix(&self) -> StoreResult<TestMatrixVersion> {
        let revision = self.core.get_latest_revision().await?;
        self.test_matrix(&revision.to_string()).await
    }

    async fn test_matrix(&self, revision: &str) -> StoreResult<TestMatrixVersion> {
        let revision = parse_revision(revision)?;
        let versions = self.core.determine_versions(revision).await?;

        let loads = versions.tests.iter().map(|test| async move {
            let at = parse_revision(&test.revision)?;
            let definition = self.definition_at(&test.test_name, at).await?.ok_or_else(|| {
                StoreError::read(format!(
                    "Missing definition for {} at revision {at}",
                    test.test_name
                ))
            })?;
            Ok::<_, StoreError>((test.test_name.clone(), definition))
        });
        let tests = try_join_all(loads).await?.into_iter().collect();

        Ok(TestMatrixVersion {
            test_matrix_definition: TestMatrixDefinition { tests },
            published: versions.published,
            author: versions.author,
            version: versions.version,
            description: versions.description,
        })
    }

    async fn current_test_definition(&self, test_name: &str) -> StoreResult<Option<TestDefinition>> {
        let Some(latest) = self.history(test_name, 0, 1).await?.into_iter().next() else {
            return Ok(None);
        };
        self.test_definition(test_name, &latest.revision).await
    }

    async fn test_definition(&self, test_name: &str, revision: &str) -> StoreResult<Option<TestDefinition>> {
        self.definition_at(test_name, parse_revision(revision)?).await
    }

    async fn history(&self, test_name: &str, start: usize, limit: usize) -> StoreResult<Vec<Revision>> {
        let head = self.core.get_latest_revision().await?;
        self.core.history(&self.test_path(test_name), head, start, limit).await
    }

    async fn history_from(
        &self,
        test_name: &str,
        revision: &str,
        start: usize,
        limit: usize,
    ) -> StoreResult<Vec<Revision>> {
        let revision = parse_revision(revision)?;
        self.core.history(&self.test_path(test_name), revision, start, limit).await
    }

    async fn all_histories(&self) -> StoreResult<BTreeMap<String, Vec<Revision>>> {
        let _guard = self.history_lock.lock().await;
        let matrix = self.current_test_matrix().await?;
        let mut histories = BTreeMap::new();
        for test_name in matrix.test_matrix_definition.tests.keys() {
            let history = self.history(test_name, 0, usize::MAX).await?;
            histories.insert(test_name.clone(), history);
        }
        tracing::debug!(store = %self.name, tests = histories.len(), "Loaded all histories");
        Ok(histories)
    }

    async fn matrix_history(&self, start: usize, limit: usize) -> StoreResult<Vec<Revision>> {
        self.core.matrix_history(start, limit).await
    }

    async fn latest_version(&self) -> StoreResult<String> {
        self.core.latest_version().await
    }

    async fn latest_revision(&self) -> StoreResult<String> {
        Ok(self.core.get_latest_revision().await?.to_string())
    }

    async fn add_test_definition(
        &self,
        meta: &ChangeMetadata,
        previous_version: &str,
        test_name: &str,
        definition: &TestDefinition,
        metadata: &TestMetadata,
    ) -> StoreResult<()> {
        tracing::info!(store = %self.name, test = test_name, author = %meta.author, "Adding test definition");
        let relative = self.test_path(test_name);
        let test_name = test_name.to_string();
        let definition = definition.clone();
        let metadata = metadata.clone();
        let updater: Updater = Box::new(move |changes: &mut ChangeSet, dir: &Path| {
            let test_dir = dir.join(&relative);
            if test_dir.exists() {
                return Err(StoreError::update(format!(
                    "Supposedly new test '{test_name}' already exists"
                )));
            }
            std::fs::create_dir_all(&test_dir)?;
            let definition_file = test_dir.join(DEFINITION_FILENAME);
            let metadata_file = test_dir.join(METADATA_FILENAME);
            write_if_changed(&definition_file, &definition)?;
            write_if_changed(&metadata_file, &metadata)?;
            changes.add(definition_file);
            changes.add(metadata_file);
            Ok(true)
        });
        self.core.do_in_working_directory(meta, previous_version, updater).await?;
        Ok(())
    }

    async fn update_test_definition(
        &self,
        meta: &ChangeMetadata,
        previous_version: &str,
        test_name: &str,
        definition: &TestDefinition,
        metadata: &TestMetadata,
    ) -> StoreResult<()> {
        tracing::info!(store = %self.name, test = test_name, author = %meta.author, "Updating test definition");
        let relative = self.test_path(test_name);
        let test_name = test_name.to_string();
        let definition = definition.clone();
        let metadata = metadata.clone();
        let updater: Updater = Box::new(move |_changes: &mut ChangeSet, dir: &Path| {
            let test_dir = dir.join(&relative);
            if !test_dir.is_dir() {
                return Err(StoreError::update(format!(
                    "Attempting to update non-existent test {test_name}"
                )));
            }
            let definition_changed = write_if_changed(&test_dir.join(DEFINITION_FILENAME), &definition)?;
            let metadata_changed = write_if_changed(&test_dir.join(METADATA_FILENAME), &metadata)?;
            if !definition_changed && !metadata_changed {
                return Err(StoreError::update(format!(
                    "Attempting to save test definition without changes for test {test_name}"
                )));
            }
            Ok(true)
        });
        self.core.do_in_working_directory(meta, previous_version, updater).await?;
        Ok(())
    }

    async fn delete_test_definition(
        &self,
        meta: &ChangeMetadata,
        previous_version: &str,
        test_name: &str,
        _definition: &TestDefinition,
    ) -> StoreResult<()> {
        tracing::info!(store = %self.name, test = test_name, author = %meta.author, "Deleting test definition");
        let relative = self.test_path(test_name);
        let test_name = test_name.to_string();
        let updater: Updater = Box::new(move |changes: &mut ChangeSet, dir: &Path| {
            let test_dir = dir.join(&relative);
            if !test_dir.exists() {
                return Err(StoreError::update(format!(
                    "Unable to delete non-existent test {test_name}"
                )));
            }
            changes.delete(&test_dir)?;
            Ok(true)
        });
        self.core.do_in_working_directory(meta, previous_version, updater).await?;
        Ok(())
    }

    fn clean_user_workspace(&self, identity: &str) -> bool {
        self.core.clean_user_workspace(identity)
    }

    async fn verify_setup(&self) -> StoreResult<()> {
        let revision = self.core.get_latest_revision().await?;
        if revision == 0 {
            return Err(StoreError::Setup(format!(
                "Found non-positive revision ({revision}) for {}",
                self.name
            )));
        }
        Ok(())
    }

    fn close(&self) {
        self.core.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cached::CachedPersisterCore;
    use crate::config::StoreConfig;
    use crate::persister::ScmPersisterCore;
    use crate::scm::local::LocalRepository;
    use pretty_assertions::assert_eq;
    use proctor_model::{Allocation, Range, TestBucket, TestType};
    use tempfile::TempDir;

    struct Fixture {
        _dirs: (TempDir, TempDir),
        store: FileBasedProctorStore,
    }

    fn fixture() -> Fixture {
        let repo_dir = TempDir::new().unwrap();
        let work_dir = TempDir::new().unwrap();
        let repo = LocalRepository::init(repo_dir.path()).unwrap();
        repo.add_user("alice", "secret").unwrap();
        repo.mkdir("test-definitions", "alice", "Create layout").unwrap();
        let config = StoreConfig::new(work_dir.path());
        let core = ScmPersisterCore::open(Arc::new(repo), &config).unwrap();
        let cached = CachedPersisterCore::new(Arc::new(core), &config.cache);
        Fixture {
            _dirs: (repo_dir, work_dir),
            store: FileBasedProctorStore::new(Arc::new(cached), "trunk"),
        }
    }

    fn meta(comment: &str) -> ChangeMetadata {
        ChangeMetadata::new("alice", "secret", comment)
    }

    fn definition(salt: &str, control: f64) -> TestDefinition {
        TestDefinition::new(TestType::USER, salt)
            .with_bucket(TestBucket::new("control", 0))
            .with_bucket(TestBucket::new("test", 1))
            .with_allocation(Allocation::new(vec![Range::new(0, control), Range::new(1, 1.0 - control)]))
    }

    #[test]
    fn write_if_changed_compares_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metadata.json");
        let mut metadata = TestMetadata::new();
        metadata.insert("owner".to_string(), "alice".to_string());

        assert!(write_if_changed(&path, &metadata).unwrap());
        assert!(!write_if_changed(&path, &metadata).unwrap());
        metadata.insert("team".to_string(), "search".to_string());
        assert!(write_if_changed(&path, &metadata).unwrap());
    }

    #[tokio::test]
    async fn add_update_delete_lifecycle() {
        let f = fixture();
        let store = &f.store;
        store.verify_setup().await.unwrap();
        assert!(store.current_test_definition("example").await.unwrap().is_none());

        store
            .add_test_definition(&meta("create"), "0", "example", &definition("s", 0.5), &TestMetadata::new())
            .await
            .unwrap();
        assert_eq!(
            store.current_test_definition("example").await.unwrap(),
            Some(definition("s", 0.5))
        );

        store
            .update_test_definition(&meta("shift"), "2", "example", &definition("s", 0.7), &TestMetadata::new())
            .await
            .unwrap();
        let history = store.history("example", 0, 10).await.unwrap();
        let messages: Vec<_> = history.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["shift", "create"]);

        let old = store.test_definition("example", &history[1].revision).await.unwrap();
        assert_eq!(old, Some(definition("s", 0.5)));

        store
            .delete_test_definition(&meta("remove"), "3", "example", &definition("s", 0.7))
            .await
            .unwrap();
        assert!(store.current_test_definition("example").await.unwrap().is_none());
        assert!(store.current_test_matrix().await.unwrap().test_matrix_definition.tests.is_empty());
        let history = store.history("example", 0, 10).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].message, "remove");
    }

    #[tokio::test]
    async fn invalid_mutations_are_update_errors() {
        let f = fixture();
        let store = &f.store;
        let def = definition("s", 0.5);

        let err = store
            .update_test_definition(&meta("x"), "0", "ghost", &def, &TestMetadata::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Attempting to update non-existent test ghost");

        store
            .add_test_definition(&meta("create"), "0", "example", &def, &TestMetadata::new())
            .await
            .unwrap();
        let err = store
            .add_test_definition(&meta("again"), "0", "example", &def, &TestMetadata::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Supposedly new test 'example' already exists");

        let err = store
            .update_test_definition(&meta("same"), "2", "example", &def, &TestMetadata::new())
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Attempting to save test definition without changes for test example"
        );

        let err = store
            .delete_test_definition(&meta("gone"), "2", "ghost", &def)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Unable to delete non-existent test ghost");
        assert!(err.is_update());
    }

    #[tokio::test]
    async fn matrix_and_histories_cover_every_test() {
        let f = fixture();
        let store = &f.store;
        for name in ["alpha", "beta"] {
            store
                .add_test_definition(&meta(name), "0", name, &definition(name, 0.5), &TestMetadata::new())
                .await
                .unwrap();
        }
        store
            .update_test_definition(&meta("alpha again"), "2", "alpha", &definition("alpha", 0.9), &TestMetadata::new())
            .await
            .unwrap();

        let matrix = store.current_test_matrix().await.unwrap();
        assert_eq!(matrix.version, "4");
        assert_eq!(matrix.test_matrix_definition.tests["alpha"], definition("alpha", 0.9));

        let older = store.test_matrix("3").await.unwrap();
        assert_eq!(older.test_matrix_definition.tests["alpha"], definition("alpha", 0.5));

        let histories = store.all_histories().await.unwrap();
        assert_eq!(histories["alpha"].len(), 2);
        assert_eq!(histories["beta"].len(), 1);
        assert_eq!(store.latest_version().await.unwrap(), "4");
        assert_eq!(store.matrix_history(0, 10).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn bad_revisions_are_read_errors() {
        let f = fixture();
        assert!(f.store.test_definition("example", "-3").await.unwrap_err().is_read());
        assert!(f.store.history_from("example", "abc", 0, 1).await.unwrap_err().is_read());
    }
}
