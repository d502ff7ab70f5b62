//! Source-control abstraction
//!
//! The persister core only needs a handful of primitives from an SCM:
//! path inspection and file contents at a revision, directory listings,
//! history, and a working-copy cycle (checkout, update, status, commit).
//! [`ScmConnection`] is that seam; [`local::LocalRepository`] is the
//! bundled file-backed implementation.

pub mod local;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use proctor_model::Revision;
use std::collections::BTreeSet;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// SCM backend failures
#[derive(Debug, thiserror::Error)]
pub enum ScmError {
    /// Credentials rejected
    #[error("authentication failed for {user}")]
    Authentication {
        /// Rejected user, empty for anonymous
        user: String,
    },

    /// Path or revision does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Working copy is out of date or has conflicting local changes
    #[error("conflict: {0}")]
    Conflict(String),

    /// Filesystem failure
    #[error("scm i/o error: {0}")]
    Io(#[from] io::Error),

    /// Repository or working-copy metadata could not be decoded
    #[error("corrupt scm data: {0}")]
    Corrupt(String),

    /// Any other backend failure
    #[error("{0}")]
    Backend(String),
}

impl ScmError {
    /// Check if credentials were rejected
    #[inline]
    #[must_use]
    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }
}

/// Result type for SCM operations
pub type ScmResult<T> = Result<T, ScmError>;

/// Credentials a connection is opened with
#[derive(Clone, PartialEq, Eq, Default)]
pub enum Credentials {
    /// Read-only access
    #[default]
    Anonymous,
    /// User and password
    Basic {
        /// User name
        username: String,
        /// Password
        password: String,
    },
}

impl Credentials {
    /// Basic credentials
    #[inline]
    #[must_use]
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    /// User name, empty for anonymous
    #[must_use]
    pub fn username(&self) -> &str {
        match self {
            Self::Anonymous => "",
            Self::Basic { username, .. } => username,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anonymous => f.write_str("Anonymous"),
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

/// Kind of node at a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Nothing at the path
    None,
    /// Regular file
    File,
    /// Directory
    Dir,
}

/// One entry of a directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Entry name, relative to the listed directory
    pub name: String,
    /// Entry kind
    pub kind: NodeKind,
    /// Revision the listing reports as the entry's last change
    pub revision: u64,
    /// Author of that revision
    pub author: String,
    /// Date of that revision
    pub date: DateTime<Utc>,
    /// Message of that revision
    pub message: String,
}

/// Directory listing at a revision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirListing {
    /// The listed directory itself
    pub parent: DirEntry,
    /// Immediate children
    pub children: Vec<DirEntry>,
}

/// One history entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Commit revision
    pub revision: u64,
    /// Committer
    pub author: String,
    /// Commit time
    pub date: DateTime<Utc>,
    /// Commit message
    pub message: String,
}

impl From<LogEntry> for Revision {
    fn from(entry: LogEntry) -> Self {
        Revision::new(entry.revision.to_string(), entry.author, entry.date, entry.message)
    }
}

/// State of a working copy relative to its base revision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkingCopyStatus {
    /// Checked out and unmodified at `revision`
    Normal {
        /// Base revision
        revision: u64,
    },
    /// Checked out but content differs from the base revision
    Modified,
    /// Not a working copy of this repository
    Unversioned,
}

/// Paths scheduled for addition or deletion in a working copy
#[derive(Debug, Default, Clone)]
pub struct ChangeSet {
    added: BTreeSet<PathBuf>,
    deleted: BTreeSet<PathBuf>,
}

impl ChangeSet {
    /// Empty change set
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a file (and any unversioned parents) for addition
    pub fn add(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        self.deleted.remove(&path);
        self.added.insert(path);
    }

    /// Remove a path from disk and schedule it for deletion
    pub fn delete(&mut self, path: impl AsRef<Path>) -> io::Result<()> {
        let path = path.as_ref();
        if path.is_dir() {
            std::fs::remove_dir_all(path)?;
        } else if path.exists() {
            std::fs::remove_file(path)?;
        }
        self.added.retain(|added| !added.starts_with(path));
        self.deleted.insert(path.to_path_buf());
        Ok(())
    }

    /// Scheduled additions
    pub fn added(&self) -> impl Iterator<Item = &Path> {
        self.added.iter().map(PathBuf::as_path)
    }

    /// Scheduled deletions
    pub fn deleted(&self) -> impl Iterator<Item = &Path> {
        self.deleted.iter().map(PathBuf::as_path)
    }

    /// Nothing scheduled
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.deleted.is_empty()
    }
}

/// A client handle to one repository
#[async_trait]
pub trait ScmConnection: Send + Sync + fmt::Debug {
    /// Head revision
    async fn latest_revision(&self) -> ScmResult<u64>;

    /// Kind of node at `path` in `revision`
    async fn check_path(&self, path: &str, revision: u64) -> ScmResult<NodeKind>;

    /// Contents of the file at `path` in `revision`
    async fn cat(&self, path: &str, revision: u64) -> ScmResult<Vec<u8>>;

    /// Immediate children of `dir` in `revision`
    async fn list(&self, dir: &str, revision: u64) -> ScmResult<DirListing>;

    /// Newest-first history of `paths` at or before `start_revision`.
    ///
    /// An empty `paths` means the whole repository.
    async fn log(&self, paths: &[String], start_revision: u64, limit: usize)
        -> ScmResult<Vec<LogEntry>>;

    /// Check out head into an existing directory, returning the revision
    async fn checkout(&self, dir: &Path) -> ScmResult<u64>;

    /// Bring a clean working copy to head, returning the revision
    async fn update(&self, dir: &Path) -> ScmResult<u64>;

    /// Working-copy status
    async fn status(&self, dir: &Path) -> ScmResult<WorkingCopyStatus>;

    /// Commit local modifications plus `changes`.
    ///
    /// Returns the new revision, or `None` when there was nothing to commit.
    async fn commit(&self, dir: &Path, changes: &ChangeSet, message: &str)
        -> ScmResult<Option<u64>>;
}

/// Opens connections to one repository
pub trait ConnectionFactory: Send + Sync + fmt::Debug {
    /// Open a connection with the given credentials
    fn connect(&self, credentials: &Credentials) -> ScmResult<Arc<dyn ScmConnection>>;

    /// Human-readable repository location
    fn location(&self) -> String;
}
