//! Proctor Store - SCM-backed persistence for test definitions
//!
//! Provides:
//! - A source-control seam ([`scm::ScmConnection`]) with a bundled file-backed repository
//! - Per-identity working directories with age-based eviction
//! - An unbounded connection pool with idle eviction and abandoned reclaim
//! - Read-through content and version caches that never cache "not found"
//! - A persister core that syncs, mutates and commits inside workspaces
//! - A file-based store per environment
//!
//! # Example
//!
//! ```rust,no_run
//! use proctor_store::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> StoreResult<()> {
//! let repository = LocalRepository::open("/var/lib/proctor/trunk")?;
//! let config = StoreConfig::from_env();
//! let core = ScmPersisterCore::open(Arc::new(repository), &config)?;
//! let cached = CachedPersisterCore::new(Arc::new(core), &config.cache);
//! let store = FileBasedProctorStore::new(Arc::new(cached), "trunk");
//!
//! let matrix = store.current_test_matrix().await?;
//! println!("{} tests at r{}", matrix.test_matrix_definition.tests.len(), matrix.version);
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]

pub mod cache;
pub mod cached;
pub mod config;
pub mod environments;
pub mod error;
pub mod persister;
pub mod pool;
pub mod refresher;
pub mod scm;
pub mod store;
pub mod workspace;

pub use cached::CachedPersisterCore;
pub use config::{CacheConfig, PoolConfig, StoreConfig};
pub use environments::EnvironmentStores;
pub use error::{StoreError, StoreResult};
pub use persister::{
    parse_revision, Artifact, ArtifactKind, PersisterCore, ScmPersisterCore, TestMetadata, Updater,
};
pub use pool::{ConnectionPool, PoolStats, PooledConnection};
pub use refresher::TemplateRefresher;
pub use store::{FileBasedProctorStore, ProctorStore};
pub use workspace::WorkspaceProvider;

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with stores
    pub use crate::scm::local::LocalRepository;
    pub use crate::scm::{ConnectionFactory, Credentials};
    pub use crate::{
        CachedPersisterCore, EnvironmentStores, FileBasedProctorStore, PersisterCore, ProctorStore,
        ScmPersisterCore, StoreConfig, StoreError, StoreResult, TestMetadata,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
