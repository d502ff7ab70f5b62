//! Configuration file for `proctorctl`

use anyhow::{Context, Result};
use proctor_model::Environment;
use proctor_promote::PromoteConfig;
use proctor_store::StoreConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// `[store]` and `[promote]` sections; absent keys take their defaults
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct CliConfig {
    pub(crate) store: StoreConfig,
    pub(crate) promote: PromoteConfig,
}

impl CliConfig {
    /// Read `path`, or `PROCTOR_*` environment variables when there is none
    pub(crate) fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self {
                store: StoreConfig::from_env(),
                promote: PromoteConfig::from_env(),
            });
        };
        let document = std::fs::read_to_string(path)
            .with_context(|| format!("reading configuration {}", path.display()))?;
        Self::from_toml_str(&document).with_context(|| format!("parsing configuration {}", path.display()))
    }

    pub(crate) fn from_toml_str(document: &str) -> Result<Self> {
        let config: Self = toml::from_str(document)?;
        config.promote.validate()?;
        Ok(config)
    }

    /// Store settings for one environment; workspaces never overlap
    pub(crate) fn store_for(&self, environment: Environment) -> StoreConfig {
        let mut store = self.store.clone();
        store.workspace_root = workspace_root(&self.store.workspace_root, environment);
        store
    }
}

fn workspace_root(root: &Path, environment: Environment) -> PathBuf {
    root.join(environment.name())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn sections_are_optional() {
        let config = CliConfig::from_toml_str(
            r#"
            [store]
            workspace_root = "/srv/proctor/workspaces"

            [promote]
            worker_threads = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.promote.worker_threads, 2);
        assert_eq!(config.promote.job_history_max_size, 1000);
        assert_eq!(
            config.store_for(Environment::Qa).workspace_root,
            PathBuf::from("/srv/proctor/workspaces/qa")
        );
    }

    #[test]
    fn invalid_promote_section_is_rejected() {
        assert!(CliConfig::from_toml_str("[promote]\nworker_threads = 0").is_err());
    }
}
