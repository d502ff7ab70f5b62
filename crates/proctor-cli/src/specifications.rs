//! Client specifications read from a JSON file
//!
//! The file maps environment to `app@version` to specification:
//!
//! ```json
//! { "production": { "web@1.4": { "tests": { "button_color_tst": { "buckets": { "control": 0 } } } } } }
//! ```

use async_trait::async_trait;
use proctor_model::Environment;
use proctor_promote::{AppVersion, ClientSpecification, SpecificationSource};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Re-reads the file on every check so edits apply without a restart
#[derive(Debug, Clone, Default)]
pub(crate) struct FileSpecificationSource {
    path: Option<PathBuf>,
}

impl FileSpecificationSource {
    /// Source over `path`; no file means no active clients
    pub(crate) fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }
}

#[async_trait]
impl SpecificationSource for FileSpecificationSource {
    async fn load_all_successful(&self, environment: Environment) -> BTreeMap<AppVersion, ClientSpecification> {
        let Some(path) = &self.path else {
            return BTreeMap::new();
        };
        let document = match tokio::fs::read_to_string(path).await {
            Ok(document) => document,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Unable to read specifications");
                return BTreeMap::new();
            }
        };
        parse_specifications(&document, environment)
    }
}

/// Specifications of `environment`; malformed entries are skipped
pub(crate) fn parse_specifications(document: &str, environment: Environment) -> BTreeMap<AppVersion, ClientSpecification> {
    let mut all: BTreeMap<Environment, BTreeMap<String, Value>> = match serde_json::from_str(document) {
        Ok(all) => all,
        Err(e) => {
            tracing::warn!(error = %e, "Unable to parse specifications");
            return BTreeMap::new();
        }
    };
    let Some(entries) = all.remove(&environment) else {
        return BTreeMap::new();
    };

    let mut loaded = BTreeMap::new();
    for (key, value) in entries {
        let Some((app, version)) = key.split_once('@') else {
            tracing::warn!(%environment, key, "Skipping specification without app@version key");
            continue;
        };
        match serde_json::from_value::<ClientSpecification>(value) {
            Ok(specification) => {
                loaded.insert(AppVersion::new(app, version), specification);
            }
            Err(e) => tracing::warn!(%environment, key, error = %e, "Skipping unreadable specification"),
        }
    }
    loaded
}
