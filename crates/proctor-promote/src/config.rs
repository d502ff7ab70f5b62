//! Promotion and job engine configuration

use crate::error::{PromoteError, PromoteResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_WORKER_THREADS: usize = 3;
const DEFAULT_JOB_HISTORY_MAX_SIZE: usize = 1000;
const DEFAULT_JOB_REFRESH_INTERVAL_MS: u64 = 1000;
const DEFAULT_ENVIRONMENT_VERSION_TIMEOUT_SECS: u64 = 30;

/// How far automatic promotion trusts its own allocation-only check
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoPromotePolicy {
    /// Run the matrix checker against every hop before writing any of them.
    ///
    /// Off: each hop is checked only when it is written, so a QA hop can land
    /// before a PRODUCTION incompatibility is discovered.
    pub reverify_compatibility: bool,
}

impl AutoPromotePolicy {
    /// Policy that pre-checks every hop
    #[inline]
    #[must_use]
    pub fn strict() -> Self {
        Self {
            reverify_compatibility: true,
        }
    }
}

/// Promotion engine and job manager settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromoteConfig {
    /// Jobs running at once
    pub worker_threads: usize,
    /// Jobs remembered by id
    pub job_history_max_size: usize,
    /// Period of the job-info refresh
    pub job_refresh_interval_ms: u64,
    /// Bound on fetching per-environment versions
    pub environment_version_timeout_secs: u64,
    /// Automatic promotion policy
    pub auto_promote: AutoPromotePolicy,
}

impl Default for PromoteConfig {
    fn default() -> Self {
        Self {
            worker_threads: DEFAULT_WORKER_THREADS,
            job_history_max_size: DEFAULT_JOB_HISTORY_MAX_SIZE,
            job_refresh_interval_ms: DEFAULT_JOB_REFRESH_INTERVAL_MS,
            environment_version_timeout_secs: DEFAULT_ENVIRONMENT_VERSION_TIMEOUT_SECS,
            auto_promote: AutoPromotePolicy::default(),
        }
    }
}

impl PromoteConfig {
    /// Read `PROCTOR_*` environment variables, falling back to defaults.
    ///
    /// # Environment Variables
    /// - `PROCTOR_JOB_WORKERS` (default: 3)
    /// - `PROCTOR_JOB_HISTORY_MAX_SIZE` (default: 1000)
    /// - `PROCTOR_JOB_REFRESH_INTERVAL_MS` (default: 1000)
    /// - `PROCTOR_ENVIRONMENT_VERSION_TIMEOUT_SECS` (default: 30)
    /// - `PROCTOR_AUTO_PROMOTE_REVERIFY` (default: false)
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            worker_threads: env_or("PROCTOR_JOB_WORKERS", defaults.worker_threads),
            job_history_max_size: env_or("PROCTOR_JOB_HISTORY_MAX_SIZE", defaults.job_history_max_size),
            job_refresh_interval_ms: env_or(
                "PROCTOR_JOB_REFRESH_INTERVAL_MS",
                defaults.job_refresh_interval_ms,
            ),
            environment_version_timeout_secs: env_or(
                "PROCTOR_ENVIRONMENT_VERSION_TIMEOUT_SECS",
                defaults.environment_version_timeout_secs,
            ),
            auto_promote: AutoPromotePolicy {
                reverify_compatibility: env_or(
                    "PROCTOR_AUTO_PROMOTE_REVERIFY",
                    defaults.auto_promote.reverify_compatibility,
                ),
            },
        }
    }

    /// Parse a TOML document; missing keys take their defaults
    pub fn from_toml_str(document: &str) -> PromoteResult<Self> {
        let config: Self = toml::from_str(document).map_err(|e| PromoteError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> PromoteResult<()> {
        if self.worker_threads == 0 {
            return Err(PromoteError::Config("worker_threads must be positive".into()));
        }
        if self.job_history_max_size == 0 {
            return Err(PromoteError::Config("job_history_max_size must be positive".into()));
        }
        Ok(())
    }

    /// With worker count
    #[inline]
    #[must_use]
    pub fn with_worker_threads(mut self, workers: usize) -> Self {
        self.worker_threads = workers;
        self
    }

    /// With job history bound
    #[inline]
    #[must_use]
    pub fn with_job_history_max_size(mut self, size: usize) -> Self {
        self.job_history_max_size = size;
        self
    }

    /// With auto-promotion policy
    #[inline]
    #[must_use]
    pub fn with_auto_promote(mut self, policy: AutoPromotePolicy) -> Self {
        self.auto_promote = policy;
        self
    }

    /// Job-info refresh period
    #[inline]
    #[must_use]
    pub fn job_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.job_refresh_interval_ms.max(1))
    }

    /// Per-environment version fetch timeout
    #[inline]
    #[must_use]
    pub fn environment_version_timeout(&self) -> Duration {
        Duration::from_secs(self.environment_version_timeout_secs)
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = PromoteConfig::default();
        assert_eq!(config.worker_threads, 3);
        assert_eq!(config.job_history_max_size, 1000);
        assert_eq!(config.job_refresh_interval(), Duration::from_secs(1));
        assert_eq!(config.environment_version_timeout(), Duration::from_secs(30));
        assert!(!config.auto_promote.reverify_compatibility);
    }

    #[test]
    fn toml_sections() {
        let config = PromoteConfig::from_toml_str(
            r#"
            worker_threads = 5
            [auto_promote]
            reverify_compatibility = true
            "#,
        )
        .unwrap();
        assert_eq!(config.worker_threads, 5);
        assert_eq!(config.auto_promote, AutoPromotePolicy::strict());
        assert_eq!(config.job_history_max_size, 1000);
    }

    #[test]
    fn zero_workers_rejected() {
        let err = PromoteConfig::from_toml_str("worker_threads = 0").unwrap_err();
        assert!(matches!(err, PromoteError::Config(_)));
    }
}
