//! Per-identity working directories
//!
//! Every identity gets `<root>/<prefix>-<sanitized identity>`. Directories
//! are reused across writes and swept once their modification time is older
//! than the configured cleanup age.

use crate::error::{StoreError, StoreResult};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

/// Creates, reuses and evicts working directories
#[derive(Debug)]
pub struct WorkspaceProvider {
    root: PathBuf,
    prefix: String,
    cleanup_age: Duration,
    shutdown: AtomicBool,
}

impl WorkspaceProvider {
    /// Provider rooted at an existing directory
    pub fn new(
        root: impl Into<PathBuf>,
        prefix: impl Into<String>,
        cleanup_age: Duration,
    ) -> StoreResult<Self> {
        let root = root.into();
        let prefix = prefix.into();
        if !root.is_dir() {
            return Err(StoreError::Setup(format!("{} should be a directory", root.display())));
        }
        if prefix.trim().is_empty() {
            return Err(StoreError::Setup("Prefix should not be empty".to_string()));
        }
        if cleanup_age.is_zero() {
            return Err(StoreError::Setup(
                "cleanup age should be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            root,
            prefix,
            cleanup_age,
            shutdown: AtomicBool::new(false),
        })
    }

    /// Root directory
    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where `identity`'s workspace lives, whether or not it exists
    #[must_use]
    pub fn workspace_path(&self, identity: &str) -> PathBuf {
        self.root.join(format!("{}-{}", self.prefix, sanitize(identity)))
    }

    /// Create or reuse the workspace for `identity`.
    ///
    /// With `reset_if_exists` an existing workspace is emptied first.
    pub fn acquire(&self, identity: &str, reset_if_exists: bool) -> StoreResult<PathBuf> {
        self.check_shutdown()?;
        let dir = self.workspace_path(identity);
        if dir.exists() {
            if !dir.is_dir() {
                return Err(StoreError::Io(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("File {} exists but is not a directory", dir.display()),
                )));
            }
            if reset_if_exists {
                clean_directory(&dir)?;
            }
        } else {
            fs::create_dir(&dir)?;
        }
        Ok(dir)
    }

    /// Delete `identity`'s workspace; true if it is gone afterwards
    pub fn release(&self, identity: &str) -> bool {
        if self.is_shutdown() {
            tracing::warn!(identity, "Workspace provider is shutdown, not releasing");
            return false;
        }
        let dir = self.workspace_path(identity);
        if !dir.exists() {
            tracing::debug!(identity, "Workspace not found");
            return true;
        }
        tracing::info!(dir = %dir.display(), identity, "Deleting user directory");
        match fs::remove_dir_all(&dir) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(dir = %dir.display(), identity, error = %e, "Failed to delete user directory");
                false
            }
        }
    }

    /// Delete prefixed workspaces older than the cleanup age.
    ///
    /// Returns the number of directories removed; does nothing after shutdown.
    pub fn sweep(&self) -> usize {
        if self.is_shutdown() {
            tracing::info!("Currently shutdown, skipping older-than directory cleanup");
            return 0;
        }
        tracing::info!(
            cleanup_age_hours = self.cleanup_age.as_secs() / 3600,
            "Actively cleaning up directories older than cleanup age"
        );
        let now = SystemTime::now();
        self.delete_prefixed(|dir| {
            fs::metadata(dir)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .is_some_and(|age| age > self.cleanup_age)
        })
    }

    /// Periodic sweep until `shutdown_rx` flips to true
    pub async fn run_sweeper(self: Arc<Self>, period: Duration, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("Workspace sweeper shutting down");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let provider = Arc::clone(&self);
                    if let Err(e) = tokio::task::spawn_blocking(move || provider.sweep()).await {
                        tracing::error!(error = %e, "Unhandled failure during directory cleanup");
                    }
                }
            }
        }
    }

    /// Delete every prefixed workspace and refuse further use. Idempotent.
    pub fn close(&self) {
        if self
            .shutdown
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            tracing::info!(root = %self.root.display(), "[shutdown] deleting all working directories");
            let deleted = self.delete_prefixed(|_| true);
            tracing::info!(deleted, "[shutdown] complete");
        }
    }

    /// Whether [`close`](Self::close) has run
    #[inline]
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn check_shutdown(&self) -> StoreResult<()> {
        if self.is_shutdown() {
            Err(StoreError::Shutdown("WorkspaceProvider"))
        } else {
            Ok(())
        }
    }

    fn delete_prefixed(&self, filter: impl Fn(&Path) -> bool) -> usize {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(root = %self.root.display(), error = %e, "Unable to list workspace root");
                return 0;
            }
        };
        let candidates: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(&self.prefix))
            })
            .filter(|path| filter(path))
            .collect();
        tracing::info!(count = candidates.len(), "Identified directories to delete");

        candidates
            .into_iter()
            .filter(|dir| match fs::remove_dir_all(dir) {
                Ok(()) => true,
                Err(e) => {
                    tracing::info!(dir = %dir.display(), error = %e, "Failed to delete directory");
                    false
                }
            })
            .count()
    }
}

/// Lower-case; runs of non-alphanumerics collapse to `-` and are trimmed at the ends
#[must_use]
pub fn sanitize(identity: &str) -> String {
    identity
        .to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Remove everything inside `dir`, keeping `dir` itself
pub(crate) fn clean_directory(dir: &Path) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Refresh a directory's modification time so the sweep leaves it alone
pub(crate) fn touch(dir: &Path) {
    let result = fs::File::open(dir).and_then(|f| f.set_modified(SystemTime::now()));
    if let Err(e) = result {
        tracing::debug!(dir = %dir.display(), error = %e, "Unable to touch directory");
    }
}

/// Recursively copy `from` into the existing directory `to`
pub(crate) fn copy_directory(from: &Path, to: &Path) -> io::Result<()> {
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            fs::create_dir_all(&target)?;
            copy_directory(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
