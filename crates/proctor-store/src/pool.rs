//! SCM connection pool
//!
//! Provides reuse of SCM connections:
//! - Unbounded: borrowing never blocks, the pool grows instead
//! - Connections idle longer than `max_idle` are evicted by a periodic sweep
//! - Connections borrowed longer than `abandoned_timeout` are reclaimed on the next borrow
//! - Returned automatically when the [`PooledConnection`] guard drops

use crate::config::PoolConfig;
use crate::error::{StoreError, StoreResult};
use crate::scm::{ConnectionFactory, Credentials, ScmConnection};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

/// Pool statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Currently borrowed
    pub num_active: usize,
    /// Idle in the pool
    pub num_idle: usize,
    /// Connections created since start
    pub created: u64,
    /// Borrowed connections reclaimed as abandoned
    pub abandoned: u64,
    /// Idle connections evicted
    pub evicted: u64,
}

#[derive(Debug)]
struct IdleConnection {
    connection: Arc<dyn ScmConnection>,
    since: Instant,
}

#[derive(Debug)]
struct BorrowedConnection {
    borrowed_at: Instant,
}

/// Pool of connections opened with one set of credentials
#[derive(Debug)]
pub struct ConnectionPool {
    factory: Arc<dyn ConnectionFactory>,
    credentials: Credentials,
    config: PoolConfig,
    /// Idle connections (LIFO)
    idle: Mutex<Vec<IdleConnection>>,
    /// Borrowed connections by lease id
    borrowed: DashMap<u64, BorrowedConnection>,
    next_lease: AtomicU64,
    created: AtomicU64,
    abandoned: AtomicU64,
    evicted: AtomicU64,
    closed: AtomicBool,
}

impl ConnectionPool {
    /// Create pool
    #[must_use]
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        credentials: Credentials,
        config: PoolConfig,
    ) -> Self {
        Self {
            factory,
            credentials,
            config,
            idle: Mutex::new(Vec::new()),
            borrowed: DashMap::new(),
            next_lease: AtomicU64::new(1),
            created: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Borrow a connection, reusing an idle one or opening a new one
    ///
    /// # Errors
    /// - `StoreError::Shutdown` after [`close`](Self::close)
    /// - `StoreError::Scm` if a new connection cannot be opened
    pub fn borrow(self: &Arc<Self>) -> StoreResult<PooledConnection> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Shutdown("ConnectionPool"));
        }
        self.reclaim_abandoned();

        let reused = self.idle.lock().pop();
        let connection = match reused {
            Some(idle) => idle.connection,
            None => {
                let connection = self.factory.connect(&self.credentials)?;
                self.created.fetch_add(1, Ordering::Relaxed);
                connection
            }
        };

        let lease = self.next_lease.fetch_add(1, Ordering::Relaxed);
        self.borrowed.insert(lease, BorrowedConnection { borrowed_at: Instant::now() });
        self.publish_metrics();

        Ok(PooledConnection {
            pool: Arc::clone(self),
            lease,
            connection,
        })
    }

    fn give_back(&self, lease: u64, connection: Arc<dyn ScmConnection>) {
        // a reclaimed lease is no longer tracked; its connection is dropped
        if self.borrowed.remove(&lease).is_none() {
            tracing::debug!(lease, "Dropping connection returned after being reclaimed");
            return;
        }
        if !self.closed.load(Ordering::SeqCst) {
            self.idle.lock().push(IdleConnection { connection, since: Instant::now() });
        }
        self.publish_metrics();
    }

    fn reclaim_abandoned(&self) {
        let timeout = self.config.abandoned_timeout();
        let before = self.borrowed.len();
        self.borrowed.retain(|lease, borrowed| {
            let keep = borrowed.borrowed_at.elapsed() <= timeout;
            if !keep {
                tracing::warn!(lease, "Reclaiming abandoned SCM connection");
            }
            keep
        });
        let reclaimed = before.saturating_sub(self.borrowed.len());
        if reclaimed > 0 {
            self.abandoned.fetch_add(reclaimed as u64, Ordering::Relaxed);
        }
    }

    /// Drop idle connections older than the idle limit, returning how many
    pub fn evict_idle(&self) -> usize {
        let max_idle = self.config.max_idle();
        let mut idle = self.idle.lock();
        let before = idle.len();
        idle.retain(|c| c.since.elapsed() <= max_idle);
        let evicted = before - idle.len();
        drop(idle);
        if evicted > 0 {
            self.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
            tracing::debug!(evicted, "Evicted idle SCM connections");
        }
        self.publish_metrics();
        evicted
    }

    /// Periodic idle eviction until `shutdown_rx` flips to true
    pub async fn run_evictor(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.eviction_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if self.closed.load(Ordering::SeqCst) {
                        break;
                    }
                    self.evict_idle();
                }
            }
        }
    }

    /// Get pool statistics
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            num_active: self.borrowed.len(),
            num_idle: self.idle.lock().len(),
            created: self.created.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }

    /// Drop idle connections and refuse further borrows
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.idle.lock().clear();
            self.publish_metrics();
        }
    }

    fn publish_metrics(&self) {
        let stats = self.stats();
        metrics::gauge!("proctor_scm_pool_active").set(stats.num_active as f64);
        metrics::gauge!("proctor_scm_pool_idle").set(stats.num_idle as f64);
    }
}

/// Borrowed connection, returned to the pool on drop
#[derive(Debug)]
pub struct PooledConnection {
    pool: Arc<ConnectionPool>,
    lease: u64,
    connection: Arc<dyn ScmConnection>,
}

impl Deref for PooledConnection {
    type Target = dyn ScmConnection;

    fn deref(&self) -> &Self::Target {
        self.connection.as_ref()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.pool.give_back(self.lease, Arc::clone(&self.connection));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scm::local::LocalRepository;
    use std::time::Duration;
    use tempfile::TempDir;

    fn pool(config: PoolConfig) -> (TempDir, Arc<ConnectionPool>) {
        let dir = TempDir::new().unwrap();
        let repo = LocalRepository::init(dir.path()).unwrap();
        let pool = ConnectionPool::new(Arc::new(repo), Credentials::Anonymous, config);
        (dir, Arc::new(pool))
    }

    #[tokio::test]
    async fn borrow_reuses_returned_connection() {
        let (_dir, pool) = pool(PoolConfig::default());

        let conn = pool.borrow().unwrap();
        assert_eq!(conn.latest_revision().await.unwrap(), 0);
        assert_eq!(pool.stats().num_active, 1);
        drop(conn);

        let stats = pool.stats();
        assert_eq!((stats.num_active, stats.num_idle, stats.created), (0, 1, 1));

        let _again = pool.borrow().unwrap();
        assert_eq!(pool.stats().created, 1);
    }

    #[test]
    fn pool_grows_instead_of_blocking() {
        let (_dir, pool) = pool(PoolConfig::default());
        let leases: Vec<_> = (0..5).map(|_| pool.borrow().unwrap()).collect();

        assert_eq!(pool.stats().num_active, 5);
        assert_eq!(pool.stats().created, 5);
        drop(leases);
        assert_eq!(pool.stats().num_idle, 5);
    }

    #[test]
    fn abandoned_connections_are_reclaimed_on_borrow() {
        let config = PoolConfig::default().with_abandoned_timeout(Duration::from_millis(1));
        let (_dir, pool) = pool(config);

        let stale = pool.borrow().unwrap();
        std::thread::sleep(Duration::from_millis(10));
        let _fresh = pool.borrow().unwrap();

        let stats = pool.stats();
        assert_eq!(stats.abandoned, 1);
        assert_eq!(stats.num_active, 1);

        drop(stale);
        assert_eq!(pool.stats().num_idle, 0);
    }

    #[test]
    fn idle_connections_are_evicted() {
        let config = PoolConfig::default().with_max_idle(Duration::from_millis(1));
        let (_dir, pool) = pool(config);
        drop(pool.borrow().unwrap());
        std::thread::sleep(Duration::from_millis(10));

        assert_eq!(pool.evict_idle(), 1);
        assert_eq!(pool.stats().num_idle, 0);
    }

    #[test]
    fn closed_pool_refuses_borrow() {
        let (_dir, pool) = pool(PoolConfig::default());
        let held = pool.borrow().unwrap();
        pool.close();

        assert!(matches!(pool.borrow(), Err(StoreError::Shutdown(_))));
        drop(held);
        assert_eq!(pool.stats().num_idle, 0);
    }
}
