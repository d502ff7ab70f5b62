//! Periodic refresh of the shared template working copy

use crate::persister::ScmPersisterCore;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

/// Keeps the template working copy close to head so new workspaces start warm
#[derive(Debug, Clone)]
pub struct TemplateRefresher {
    core: Arc<ScmPersisterCore>,
}

impl TemplateRefresher {
    /// Create refresher
    #[inline]
    #[must_use]
    pub fn new(core: Arc<ScmPersisterCore>) -> Self {
        Self { core }
    }

    /// Sync the template once; returns the revision reached, if any
    pub async fn refresh(&self) -> Option<u64> {
        if self.core.is_shutdown() {
            tracing::info!("Skipping template refresh, shutdown in progress");
            return None;
        }
        let started = Instant::now();
        match self.core.refresh_template().await {
            Ok(revision) => {
                tracing::info!(
                    revision,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Synced template working copy"
                );
                Some(revision)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Unable to refresh template working copy");
                None
            }
        }
    }

    /// Refresh every `period` until `shutdown_rx` flips to true
    pub async fn run(self, period: Duration, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("Template refresher shutting down");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.refresh().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::persister::PersisterCore;
    use crate::scm::local::LocalRepository;
    use tempfile::TempDir;

    #[tokio::test]
    async fn refresh_tracks_head_and_stops_after_close() {
        let repo_dir = TempDir::new().unwrap();
        let work_dir = TempDir::new().unwrap();
        let repo = LocalRepository::init(repo_dir.path()).unwrap();
        repo.mkdir("test-definitions", "alice", "Create layout").unwrap();
        let core = Arc::new(
            ScmPersisterCore::open(Arc::new(repo.clone()), &StoreConfig::new(work_dir.path())).unwrap(),
        );
        let refresher = TemplateRefresher::new(Arc::clone(&core));

        assert_eq!(refresher.refresh().await, Some(1));
        repo.mkdir("test-definitions/example", "alice", "Add example").unwrap();
        assert_eq!(refresher.refresh().await, Some(2));

        core.close();
        assert_eq!(refresher.refresh().await, None);
    }

    #[tokio::test]
    async fn run_exits_on_shutdown_signal() {
        let repo_dir = TempDir::new().unwrap();
        let work_dir = TempDir::new().unwrap();
        let repo = LocalRepository::init(repo_dir.path()).unwrap();
        let core = Arc::new(
            ScmPersisterCore::open(Arc::new(repo), &StoreConfig::new(work_dir.path())).unwrap(),
        );
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(TemplateRefresher::new(core).run(Duration::from_millis(5), rx));

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }
}
