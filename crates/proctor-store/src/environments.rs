//! One store per environment

use crate::store::ProctorStore;
use proctor_model::Environment;
use std::sync::Arc;

/// The trunk, QA and production stores
#[derive(Debug, Clone)]
pub struct EnvironmentStores {
    working: Arc<dyn ProctorStore>,
    qa: Arc<dyn ProctorStore>,
    production: Arc<dyn ProctorStore>,
}

impl EnvironmentStores {
    /// Create from the three stores
    #[must_use]
    pub fn new(
        working: Arc<dyn ProctorStore>,
        qa: Arc<dyn ProctorStore>,
        production: Arc<dyn ProctorStore>,
    ) -> Self {
        Self { working, qa, production }
    }

    /// Store backing `environment`
    #[inline]
    #[must_use]
    pub fn get(&self, environment: Environment) -> &Arc<dyn ProctorStore> {
        match environment {
            Environment::Working => &self.working,
            Environment::Qa => &self.qa,
            Environment::Production => &self.production,
        }
    }

    /// Every environment with its store, in promotion order
    pub fn iter(&self) -> impl Iterator<Item = (Environment, &Arc<dyn ProctorStore>)> {
        Environment::ALL.into_iter().map(move |env| (env, self.get(env)))
    }

    /// Delete `identity`'s workspace in every environment
    pub fn clean_user_workspaces(&self, identity: &str) -> bool {
        self.iter()
            .map(|(_, store)| store.clean_user_workspace(identity))
            .fold(true, |all, cleaned| all && cleaned)
    }

    /// Close every store
    pub fn close(&self) {
        for (environment, store) in self.iter() {
            tracing::info!(%environment, "Closing store");
            store.close();
        }
    }
}
