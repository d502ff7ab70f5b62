//! SCM persister core
//!
//! The core is the only component that talks to the SCM. Reads go through
//! the anonymous [`ConnectionPool`]; writes run inside the writer's own
//! workspace, which is synced to head before the caller's updater runs and
//! committed afterwards with the writer's credentials.

use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::pool::ConnectionPool;
use crate::scm::{ChangeSet, ConnectionFactory, Credentials, NodeKind, ScmConnection, WorkingCopyStatus};
use crate::workspace::{clean_directory, copy_directory, touch, WorkspaceProvider};
use async_trait::async_trait;
use proctor_model::{ChangeMetadata, Revision, TestDefinition, TestVersion, TestVersionResult};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Identity of the shared template working copy
pub const TEMPLATE_IDENTITY: &str = "template";

/// Revision reported for a test that has not been committed yet
pub const ADD_TEST_REVISION: &str = "0";

/// Free-form metadata stored next to each definition
pub type TestMetadata = BTreeMap<String, String>;

/// Mutation run inside a synced workspace.
///
/// Receives the change set and the workspace root; returns whether anything
/// was changed and should be committed.
pub type Updater = Box<dyn FnOnce(&mut ChangeSet, &Path) -> StoreResult<bool> + Send>;

/// What a stored file decodes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    /// `definition.json`
    Definition,
    /// `metadata.json`
    Metadata,
}

impl ArtifactKind {
    /// Decode raw file contents
    pub fn decode(self, bytes: &[u8]) -> Result<Artifact, serde_json::Error> {
        Ok(match self {
            Self::Definition => Artifact::Definition(Arc::new(serde_json::from_slice(bytes)?)),
            Self::Metadata => Artifact::Metadata(Arc::new(serde_json::from_slice(bytes)?)),
        })
    }
}

/// Decoded file contents
#[derive(Debug, Clone, PartialEq)]
pub enum Artifact {
    /// A test definition
    Definition(Arc<TestDefinition>),
    /// Definition metadata
    Metadata(Arc<TestMetadata>),
}

impl Artifact {
    /// Kind of this artifact
    #[must_use]
    pub fn kind(&self) -> ArtifactKind {
        match self {
            Self::Definition(_) => ArtifactKind::Definition,
            Self::Metadata(_) => ArtifactKind::Metadata,
        }
    }

    /// The definition, if this is one
    #[must_use]
    pub fn into_definition(self) -> Option<Arc<TestDefinition>> {
        match self {
            Self::Definition(definition) => Some(definition),
            Self::Metadata(_) => None,
        }
    }

    /// The metadata, if this is metadata
    #[must_use]
    pub fn into_metadata(self) -> Option<Arc<TestMetadata>> {
        match self {
            Self::Metadata(metadata) => Some(metadata),
            Self::Definition(_) => None,
        }
    }
}

/// Parse a revision string.
///
/// # Errors
/// Read error for negative or non-numeric input.
pub fn parse_revision(revision: &str) -> StoreResult<u64> {
    revision
        .trim()
        .parse::<u64>()
        .map_err(|_| StoreError::read(format!("Invalid SCM revision {revision}")))
}

/// Everything the file-based store needs from an SCM
#[async_trait]
pub trait PersisterCore: Send + Sync + fmt::Debug {
    /// Decoded contents of `path` at `revision`, `None` if the path does not exist
    async fn read_optional(
        &self,
        kind: ArtifactKind,
        path: &str,
        revision: u64,
    ) -> StoreResult<Option<Artifact>>;

    /// Decoded contents of `path`, or `default` if it does not exist
    async fn get_file_contents(
        &self,
        kind: ArtifactKind,
        path: &str,
        revision: u64,
        default: Option<Artifact>,
    ) -> StoreResult<Option<Artifact>> {
        Ok(self.read_optional(kind, path, revision).await?.or(default))
    }

    /// Decoded contents of `path`; a read error if it does not exist
    async fn read_artifact(&self, kind: ArtifactKind, path: &str, revision: u64) -> StoreResult<Artifact> {
        self.read_optional(kind, path, revision)
            .await?
            .ok_or_else(|| StoreError::read(format!("{path} does not exist at revision {revision}")))
    }

    /// Every test with the revision its directory last changed at
    async fn determine_versions(&self, revision: u64) -> StoreResult<TestVersionResult>;

    /// Sync the writer's workspace, run `updater` in it and commit the result.
    ///
    /// `previous_version` is informational; conflict detection happens in
    /// the caller before this is invoked. Returns whether a commit was made.
    async fn do_in_working_directory(
        &self,
        meta: &ChangeMetadata,
        previous_version: &str,
        updater: Updater,
    ) -> StoreResult<bool>;

    /// Newest-first history of `path` at or before `revision`, paged
    async fn history(
        &self,
        path: &str,
        revision: u64,
        start: usize,
        limit: usize,
    ) -> StoreResult<Vec<Revision>>;

    /// Newest-first history of the whole repository, paged
    async fn matrix_history(&self, start: usize, limit: usize) -> StoreResult<Vec<Revision>>;

    /// Revision of the newest commit, [`proctor_model::UNKNOWN_VERSION`] if none
    async fn latest_version(&self) -> StoreResult<String>;

    /// Head revision
    async fn get_latest_revision(&self) -> StoreResult<u64>;

    /// Delete `identity`'s workspace; never fails
    fn clean_user_workspace(&self, identity: &str) -> bool;

    /// Revision reported for a test that was never committed
    fn add_test_revision(&self) -> &'static str {
        ADD_TEST_REVISION
    }

    /// Directory holding one subdirectory per test
    fn test_definitions_directory(&self) -> &str;

    /// Release pooled resources. Idempotent.
    fn close(&self);
}

/// [`PersisterCore`] over an SCM connection factory
#[derive(Debug)]
pub struct ScmPersisterCore {
    factory: Arc<dyn ConnectionFactory>,
    pool: Arc<ConnectionPool>,
    workspaces: Arc<WorkspaceProvider>,
    owns_workspaces: bool,
    template_dir: PathBuf,
    test_definitions_directory: String,
    shutdown: AtomicBool,
}

impl ScmPersisterCore {
    /// Core sharing an existing workspace provider, which it will not close
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        workspaces: Arc<WorkspaceProvider>,
        config: &StoreConfig,
    ) -> StoreResult<Self> {
        Self::build(factory, workspaces, false, config)
    }

    /// Core with its own workspace provider rooted at the configured directory
    pub fn open(factory: Arc<dyn ConnectionFactory>, config: &StoreConfig) -> StoreResult<Self> {
        std::fs::create_dir_all(&config.workspace_root)?;
        let workspaces = WorkspaceProvider::new(
            &config.workspace_root,
            config.workspace_prefix.clone(),
            config.cleanup_age(),
        )?;
        Self::build(factory, Arc::new(workspaces), true, config)
    }

    fn build(
        factory: Arc<dyn ConnectionFactory>,
        workspaces: Arc<WorkspaceProvider>,
        owns_workspaces: bool,
        config: &StoreConfig,
    ) -> StoreResult<Self> {
        let template_dir = workspaces.acquire(TEMPLATE_IDENTITY, true)?;
        let pool = ConnectionPool::new(Arc::clone(&factory), Credentials::Anonymous, config.pool);
        tracing::info!(
            repository = %factory.location(),
            template = %template_dir.display(),
            "Created SCM persister core"
        );
        Ok(Self {
            factory,
            pool: Arc::new(pool),
            workspaces,
            owns_workspaces,
            template_dir,
            test_definitions_directory: config.test_definitions_directory.clone(),
            shutdown: AtomicBool::new(false),
        })
    }

    /// The read pool
    #[inline]
    #[must_use]
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// The workspace provider
    #[inline]
    #[must_use]
    pub fn workspaces(&self) -> &Arc<WorkspaceProvider> {
        &self.workspaces
    }

    /// Whether [`close`](PersisterCore::close) has run
    #[inline]
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn check_shutdown(&self) -> StoreResult<()> {
        if self.is_shutdown() {
            Err(StoreError::Shutdown("ScmPersisterCore"))
        } else {
            Ok(())
        }
    }

    /// Bring the shared template working copy to head
    pub async fn refresh_template(&self) -> StoreResult<u64> {
        self.check_shutdown()?;
        let connection = self.pool.borrow()?;
        sync_working_directory(&*connection, &self.template_dir).await
    }

    /// Spawn the workspace sweeper, pool evictor and template refresher
    pub fn spawn_maintenance(
        self: &Arc<Self>,
        config: &StoreConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let refresher = crate::refresher::TemplateRefresher::new(Arc::clone(self));
        vec![
            tokio::spawn(
                Arc::clone(&self.workspaces).run_sweeper(config.sweep_interval(), shutdown_rx.clone()),
            ),
            tokio::spawn(Arc::clone(&self.pool).run_evictor(shutdown_rx.clone())),
            tokio::spawn(refresher.run(config.template_refresh_interval(), shutdown_rx)),
        ]
    }

    /// Workspace for `identity`, seeded from the template when empty
    fn user_workspace(&self, identity: &str) -> StoreResult<PathBuf> {
        let dir = self.workspaces.acquire(identity, false)?;
        let is_empty = std::fs::read_dir(&dir)?.next().is_none();
        if is_empty && self.template_dir.is_dir() {
            tracing::debug!(identity, "Seeding workspace from template");
            copy_directory(&self.template_dir, &dir)?;
        }
        Ok(dir)
    }

    async fn write_in(
        &self,
        meta: &ChangeMetadata,
        dir: &Path,
        updater: Updater,
    ) -> StoreResult<bool> {
        let credentials = Credentials::basic(meta.username.clone(), meta.password.clone());
        let connection = self.factory.connect(&credentials)?;
        sync_working_directory(connection.as_ref(), dir).await?;

        let mut changes = ChangeSet::new();
        if !updater(&mut changes, dir)? {
            tracing::debug!(dir = %dir.display(), "Updater made no changes, skipping commit");
            return Ok(false);
        }
        let revision = connection.commit(dir, &changes, &meta.comment).await?;
        tracing::info!(user = %meta.username, ?revision, "Committed changes");
        Ok(revision.is_some())
    }
}

/// Update a clean working copy; otherwise wipe it and check out afresh
pub(crate) async fn sync_working_directory(
    connection: &dyn ScmConnection,
    dir: &Path,
) -> StoreResult<u64> {
    touch(dir);
    let revision = match connection.status(dir).await? {
        WorkingCopyStatus::Normal { .. } => connection.update(dir).await?,
        WorkingCopyStatus::Modified => {
            tracing::warn!(dir = %dir.display(), "Working directory is in a bad state, checking out again");
            clean_directory(dir)?;
            connection.checkout(dir).await?
        }
        WorkingCopyStatus::Unversioned => {
            clean_directory(dir)?;
            connection.checkout(dir).await?
        }
    };
    Ok(revision)
}

fn map_update_error(err: StoreError, user: &str) -> StoreError {
    if err.is_authentication() {
        return StoreError::update_with(format!("Invalid credentials provided for {user}"), err);
    }
    match err {
        StoreError::Scm(_) => StoreError::update_with("Unable to check out to working directory", err),
        StoreError::Io(_) => StoreError::update_with("Unable to perform operation", err),
        other => other,
    }
}

fn read_error(path: &str, err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> StoreError {
    StoreError::read_with(format!("Error reading {path} from scm"), err)
}

fn page(entries: Vec<crate::scm::LogEntry>, start: usize, limit: usize) -> Vec<Revision> {
    entries.into_iter().skip(start).take(limit).map(Revision::from).collect()
}

#[async_trait]
impl PersisterCore for ScmPersisterCore {
    async fn read_optional(
        &self,
        kind: ArtifactKind,
        path: &str,
        revision: u64,
    ) -> StoreResult<Option<Artifact>> {
        self.check_shutdown()?;
        let connection = self.pool.borrow()?;
        let node = connection
            .check_path(path, revision)
            .await
            .map_err(|e| read_error(path, e))?;
        if node == NodeKind::None {
            tracing::warn!(path, revision, "Path does not exist, returning default");
            return Ok(None);
        }
        let bytes = connection.cat(path, revision).await.map_err(|e| read_error(path, e))?;
        kind.decode(&bytes).map(Some).map_err(|e| read_error(path, e))
    }

    async fn determine_versions(&self, revision: u64) -> StoreResult<TestVersionResult> {
        self.check_shutdown()?;
        let connection = self.pool.borrow()?;
        let dir = self.test_definitions_directory.as_str();
        let listing = connection.list(dir, revision).await.map_err(|e| {
            StoreError::read_with(format!("Unable to list {dir} at revision {revision}"), e)
        })?;

        let mut tests = Vec::with_capacity(listing.children.len());
        for child in listing.children {
            if child.kind != NodeKind::Dir {
                tracing::warn!(name = %child.name, "Skipping non-directory entry in {dir}");
                continue;
            }
            let path = format!("{dir}/{}", child.name);
            let log = connection
                .log(std::slice::from_ref(&path), revision, 1)
                .await
                .map_err(|e| read_error(&path, e))?;
            let last_changed = match log.first() {
                Some(entry) if entry.revision != child.revision => {
                    tracing::debug!(
                        test = %child.name,
                        listed = child.revision,
                        logged = entry.revision,
                        "Listing revision differs from history, using history"
                    );
                    entry.revision
                }
                _ => child.revision,
            };
            tests.push(TestVersion::new(child.name, last_changed.to_string()));
        }

        Ok(TestVersionResult {
            tests,
            published: listing.parent.date,
            author: listing.parent.author,
            version: listing.parent.revision.to_string(),
            description: listing.parent.message,
        })
    }

    async fn do_in_working_directory(
        &self,
        meta: &ChangeMetadata,
        previous_version: &str,
        updater: Updater,
    ) -> StoreResult<bool> {
        self.check_shutdown()?;
        tracing::debug!(user = %meta.username, previous_version, "Writing in working directory");
        let result = match self.user_workspace(&meta.username) {
            Ok(dir) => self.write_in(meta, &dir, updater).await,
            Err(e) => Err(e),
        };
        result.map_err(|e| map_update_error(e, &meta.username))
    }

    async fn history(
        &self,
        path: &str,
        revision: u64,
        start: usize,
        limit: usize,
    ) -> StoreResult<Vec<Revision>> {
        self.check_shutdown()?;
        let connection = self.pool.borrow()?;
        // a deleted path still has history, ending with the delete commit
        let entries = connection
            .log(&[path.to_string()], revision, start.saturating_add(limit))
            .await
            .map_err(|e| read_error(path, e))?;
        Ok(page(entries, start, limit))
    }

    async fn matrix_history(&self, start: usize, limit: usize) -> StoreResult<Vec<Revision>> {
        self.check_shutdown()?;
        let connection = self.pool.borrow()?;
        let head = connection.latest_revision().await?;
        let entries = connection
            .log(&[], head, start.saturating_add(limit))
            .await
            .map_err(|e| StoreError::read_with("Unable to read repository history", e))?;
        Ok(page(entries, start, limit))
    }

    async fn latest_version(&self) -> StoreResult<String> {
        self.check_shutdown()?;
        let connection = self.pool.borrow()?;
        let head = connection.latest_revision().await?;
        let entries = connection
            .log(&[], head, 1)
            .await
            .map_err(|e| StoreError::read_with("Unable to read repository history", e))?;
        Ok(entries
            .first()
            .map_or_else(|| proctor_model::UNKNOWN_VERSION.to_string(), |e| e.revision.to_string()))
    }

    async fn get_latest_revision(&self) -> StoreResult<u64> {
        self.check_shutdown()?;
        let connection = self.pool.borrow()?;
        Ok(connection.latest_revision().await?)
    }

    fn clean_user_workspace(&self, identity: &str) -> bool {
        self.workspaces.release(identity)
    }

    fn test_definitions_directory(&self) -> &str {
        &self.test_definitions_directory
    }

    fn close(&self) {
        if self
            .shutdown
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let started = Instant::now();
        if self.owns_workspaces {
            self.workspaces.close();
        }
        self.pool.close();
        tracing::info!(elapsed_ms = started.elapsed().as_millis() as u64, "Closed SCM persister core");
    }
}
