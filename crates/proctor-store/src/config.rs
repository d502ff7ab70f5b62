//! Store configuration
//!
//! Durations are stored as whole seconds (or milliseconds for the pool
//! timers used in tests) so the structs read naturally from TOML.

use crate::error::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default directory holding one subdirectory per test
pub const DEFAULT_TEST_DEFINITIONS_DIRECTORY: &str = "test-definitions";

const DEFAULT_CLEANUP_AGE_SECS: u64 = 24 * 60 * 60;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60 * 60;
const DEFAULT_TEMPLATE_REFRESH_SECS: u64 = 5 * 60;
const DEFAULT_CONTENT_CACHE_CAPACITY: u64 = 1024;
const DEFAULT_VERSION_CACHE_CAPACITY: u64 = 50;
const DEFAULT_CACHE_IDLE_SECS: u64 = 60 * 60;
const DEFAULT_POOL_MAX_IDLE_MS: u64 = 60 * 60 * 1000;
const DEFAULT_POOL_EVICTION_INTERVAL_MS: u64 = 10 * 60 * 1000;
const DEFAULT_POOL_ABANDONED_TIMEOUT_MS: u64 = 30 * 60 * 1000;

/// Connection pool timers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Idle connections older than this are evicted
    pub max_idle_ms: u64,
    /// How often idle eviction runs
    pub eviction_interval_ms: u64,
    /// Borrowed connections older than this are reclaimed
    pub abandoned_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_ms: DEFAULT_POOL_MAX_IDLE_MS,
            eviction_interval_ms: DEFAULT_POOL_EVICTION_INTERVAL_MS,
            abandoned_timeout_ms: DEFAULT_POOL_ABANDONED_TIMEOUT_MS,
        }
    }
}

impl PoolConfig {
    /// With idle limit
    #[inline]
    #[must_use]
    pub fn with_max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle_ms = duration_ms(max_idle);
        self
    }

    /// With abandoned timeout
    #[inline]
    #[must_use]
    pub fn with_abandoned_timeout(mut self, timeout: Duration) -> Self {
        self.abandoned_timeout_ms = duration_ms(timeout);
        self
    }

    /// With eviction interval
    #[inline]
    #[must_use]
    pub fn with_eviction_interval(mut self, interval: Duration) -> Self {
        self.eviction_interval_ms = duration_ms(interval);
        self
    }

    /// Idle limit
    #[inline]
    #[must_use]
    pub fn max_idle(&self) -> Duration {
        Duration::from_millis(self.max_idle_ms)
    }

    /// Eviction interval
    #[inline]
    #[must_use]
    pub fn eviction_interval(&self) -> Duration {
        Duration::from_millis(self.eviction_interval_ms.max(1))
    }

    /// Abandoned timeout
    #[inline]
    #[must_use]
    pub fn abandoned_timeout(&self) -> Duration {
        Duration::from_millis(self.abandoned_timeout_ms)
    }
}

/// Content and version cache bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum decoded artifacts kept
    pub content_capacity: u64,
    /// Maximum version listings kept
    pub version_capacity: u64,
    /// Entries untouched for this long expire
    pub idle_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            content_capacity: DEFAULT_CONTENT_CACHE_CAPACITY,
            version_capacity: DEFAULT_VERSION_CACHE_CAPACITY,
            idle_secs: DEFAULT_CACHE_IDLE_SECS,
        }
    }
}

impl CacheConfig {
    /// Idle expiry
    #[inline]
    #[must_use]
    pub fn time_to_idle(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }
}

/// Configuration of one environment's store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root under which per-identity workspaces are created
    pub workspace_root: PathBuf,
    /// Prefix of workspace directory names
    pub workspace_prefix: String,
    /// Workspaces untouched for this long are swept
    pub cleanup_age_secs: u64,
    /// How often the workspace sweep runs
    pub sweep_interval_secs: u64,
    /// How often the template working copy is refreshed
    pub template_refresh_secs: u64,
    /// Directory holding one subdirectory per test
    pub test_definitions_directory: String,
    /// Cache bounds
    pub cache: CacheConfig,
    /// Connection pool timers
    pub pool: PoolConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            workspace_root: std::env::temp_dir().join("proctor-workspaces"),
            workspace_prefix: "scm".to_string(),
            cleanup_age_secs: DEFAULT_CLEANUP_AGE_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            template_refresh_secs: DEFAULT_TEMPLATE_REFRESH_SECS,
            test_definitions_directory: DEFAULT_TEST_DEFINITIONS_DIRECTORY.to_string(),
            cache: CacheConfig::default(),
            pool: PoolConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Create config rooted at `workspace_root`
    #[must_use]
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            ..Self::default()
        }
    }

    /// Read `PROCTOR_*` environment variables, falling back to defaults.
    ///
    /// # Environment Variables
    /// - `PROCTOR_WORKSPACE_ROOT`
    /// - `PROCTOR_WORKSPACE_PREFIX`
    /// - `PROCTOR_WORKSPACE_CLEANUP_AGE_SECS` (default: 86400)
    /// - `PROCTOR_WORKSPACE_SWEEP_INTERVAL_SECS` (default: 3600)
    /// - `PROCTOR_TEMPLATE_REFRESH_SECS` (default: 300)
    /// - `PROCTOR_TEST_DEFINITIONS_DIRECTORY` (default: test-definitions)
    /// - `PROCTOR_CONTENT_CACHE_CAPACITY` (default: 1024)
    /// - `PROCTOR_VERSION_CACHE_CAPACITY` (default: 50)
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            workspace_root: std::env::var("PROCTOR_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            workspace_prefix: std::env::var("PROCTOR_WORKSPACE_PREFIX")
                .unwrap_or(defaults.workspace_prefix),
            cleanup_age_secs: env_or("PROCTOR_WORKSPACE_CLEANUP_AGE_SECS", defaults.cleanup_age_secs),
            sweep_interval_secs: env_or(
                "PROCTOR_WORKSPACE_SWEEP_INTERVAL_SECS",
                defaults.sweep_interval_secs,
            ),
            template_refresh_secs: env_or(
                "PROCTOR_TEMPLATE_REFRESH_SECS",
                defaults.template_refresh_secs,
            ),
            test_definitions_directory: std::env::var("PROCTOR_TEST_DEFINITIONS_DIRECTORY")
                .unwrap_or(defaults.test_definitions_directory),
            cache: CacheConfig {
                content_capacity: env_or(
                    "PROCTOR_CONTENT_CACHE_CAPACITY",
                    defaults.cache.content_capacity,
                ),
                version_capacity: env_or(
                    "PROCTOR_VERSION_CACHE_CAPACITY",
                    defaults.cache.version_capacity,
                ),
                ..defaults.cache
            },
            pool: defaults.pool,
        }
    }

    /// Parse a TOML document; missing keys take their defaults
    pub fn from_toml_str(document: &str) -> StoreResult<Self> {
        toml::from_str(document).map_err(|e| StoreError::Setup(format!("Invalid store configuration: {e}")))
    }

    /// With workspace prefix
    #[inline]
    #[must_use]
    pub fn with_workspace_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.workspace_prefix = prefix.into();
        self
    }

    /// With cache bounds
    #[inline]
    #[must_use]
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// With pool timers
    #[inline]
    #[must_use]
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Workspace cleanup age
    #[inline]
    #[must_use]
    pub fn cleanup_age(&self) -> Duration {
        Duration::from_secs(self.cleanup_age_secs)
    }

    /// Workspace sweep period
    #[inline]
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    /// Template refresh period
    #[inline]
    #[must_use]
    pub fn template_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.template_refresh_secs.max(1))
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = StoreConfig::default();
        assert_eq!(config.cleanup_age(), Duration::from_secs(86_400));
        assert_eq!(config.cache.content_capacity, 1024);
        assert_eq!(config.cache.version_capacity, 50);
        assert_eq!(config.pool.max_idle(), Duration::from_secs(3600));
        assert_eq!(config.pool.eviction_interval(), Duration::from_secs(600));
        assert_eq!(config.pool.abandoned_timeout(), Duration::from_secs(1800));
        assert_eq!(config.test_definitions_directory, "test-definitions");
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = StoreConfig::from_toml_str(
            r#"
            workspace_root = "/var/proctor"
            [cache]
            content_capacity = 10
            "#,
        )
        .unwrap();

        assert_eq!(config.workspace_root, PathBuf::from("/var/proctor"));
        assert_eq!(config.cache.content_capacity, 10);
        assert_eq!(config.cache.version_capacity, 50);
        assert_eq!(config.workspace_prefix, "scm");
    }

    #[test]
    fn malformed_toml_is_setup_error() {
        let err = StoreConfig::from_toml_str("cleanup_age_secs = \"soon\"").unwrap_err();
        assert!(matches!(err, StoreError::Setup(_)));
    }

    #[test]
    fn builders_override() {
        let config = StoreConfig::new("/tmp/x")
            .with_workspace_prefix("svn")
            .with_pool(PoolConfig::default().with_max_idle(Duration::from_secs(5)));
        assert_eq!(config.workspace_prefix, "svn");
        assert_eq!(config.pool.max_idle_ms, 5000);
    }
}
