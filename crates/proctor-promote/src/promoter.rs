//! Copies a test definition from one environment store to the next

use crate::config::PromoteConfig;
use crate::error::{PromoteError, PromoteResult};
use proctor_model::{
    ChangeMetadata, Environment, EnvironmentVersion, Revision, UNKNOWN_REVISION, UNKNOWN_VERSION,
};
use proctor_store::persister::ADD_TEST_REVISION;
use proctor_store::{EnvironmentStores, TestMetadata};
use std::time::Duration;

/// Latest commit of a test in one environment and the trunk version it carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SingleEnvironmentVersion {
    /// Last commit touching the test, `None` if never present
    pub revision: Option<Revision>,
    /// Effective trunk version, [`UNKNOWN_VERSION`] when unknown
    pub version: String,
}

/// Writes promotions and resolves per-environment versions
#[derive(Debug, Clone)]
pub struct Promoter {
    stores: EnvironmentStores,
    version_timeout: Duration,
}

impl Promoter {
    /// Create over the three environment stores
    #[must_use]
    pub fn new(stores: EnvironmentStores, config: &PromoteConfig) -> Self {
        Self {
            stores,
            version_timeout: config.environment_version_timeout(),
        }
    }

    /// The environment stores
    #[inline]
    #[must_use]
    pub fn stores(&self) -> &EnvironmentStores {
        &self.stores
    }

    /// Latest commit and effective version of `test_name` in `environment`
    pub async fn resolve_last_version(
        &self,
        test_name: &str,
        environment: Environment,
    ) -> PromoteResult<SingleEnvironmentVersion> {
        let store = self.stores.get(environment);
        let Some(latest) = store.history(test_name, 0, 1).await?.into_iter().next() else {
            return Ok(SingleEnvironmentVersion {
                revision: None,
                version: UNKNOWN_VERSION.to_string(),
            });
        };
        let version = match environment {
            Environment::Working => latest.revision.clone(),
            Environment::Qa | Environment::Production => store
                .test_definition(test_name, &latest.revision)
                .await?
                .map(|definition| definition.version)
                .filter(|version| !version.is_empty())
                .unwrap_or_else(|| UNKNOWN_VERSION.to_string()),
        };
        Ok(SingleEnvironmentVersion {
            revision: Some(latest),
            version,
        })
    }

    /// Versions of `test_name` in every environment, fetched concurrently.
    ///
    /// `None` when any lookup fails or the lookups together exceed the
    /// configured timeout.
    pub async fn get_environment_version(&self, test_name: &str) -> Option<EnvironmentVersion> {
        let lookups = futures::future::try_join3(
            self.resolve_last_version(test_name, Environment::Working),
            self.resolve_last_version(test_name, Environment::Qa),
            self.resolve_last_version(test_name, Environment::Production),
        );
        match tokio::time::timeout(self.version_timeout, lookups).await {
            Ok(Ok((trunk, qa, production))) => Some(EnvironmentVersion::new(
                test_name,
                trunk.revision,
                qa.revision,
                qa.version,
                production.revision,
                production.version,
            )),
            Ok(Err(e)) => {
                tracing::error!(test = test_name, error = %e, "Unable to load environment versions");
                None
            }
            Err(_) => {
                tracing::error!(
                    test = test_name,
                    timeout_secs = self.version_timeout.as_secs(),
                    "Timed out loading environment versions"
                );
                None
            }
        }
    }

    /// Copy `test_name` at `source_revision` into `destination`.
    ///
    /// `destination_revision` must be the destination's current revision of
    /// the test, or [`UNKNOWN_REVISION`] when the test is new there.
    pub async fn promote(
        &self,
        test_name: &str,
        source: Environment,
        source_revision: &str,
        destination: Environment,
        destination_revision: &str,
        meta: &ChangeMetadata,
    ) -> PromoteResult<()> {
        tracing::info!(
            "{} : Promoting {test_name} from {source} r{source_revision} to {destination} r{destination_revision}",
            meta.username
        );
        let source_store = self.stores.get(source);
        let destination_store = self.stores.get(destination);

        let mut definition = source_store
            .test_definition(test_name, source_revision)
            .await?
            .ok_or_else(|| {
                PromoteError::NotFound(format!(
                    "could not find {test_name} on {source} with revision {source_revision}"
                ))
            })?;

        let destination_head = destination_store.history(test_name, 0, 1).await?.into_iter().next();
        let revision_given = !destination_revision.is_empty() && destination_revision != UNKNOWN_REVISION;
        match &destination_head {
            None if revision_given => {
                return Err(PromoteError::Promotion(format!(
                    "Positive revision r{destination_revision} given for destination ( {destination} ) but '{test_name}' does not exist."
                )));
            }
            Some(_) if destination_revision.is_empty() => {
                return Err(PromoteError::Promotion(format!(
                    "Non-Positive revision r{destination_revision} given for destination ( {destination} ) but '{test_name}' exists."
                )));
            }
            _ => {}
        }

        let source_version = source_store
            .history_from(test_name, source_revision, 0, 1)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                PromoteError::Promotion(format!(
                    "Could not find history for {test_name} at revision {source_revision}"
                ))
            })?;
        let effective_revision = source_version.revision.as_str();
        if source == Environment::Working {
            definition.version = effective_revision.to_string();
        }

        let commit = meta.clone().with_comment(promotion_commit_message(
            test_name,
            source,
            effective_revision,
            destination,
            &source_version.message,
        ));
        let metadata = TestMetadata::new();

        match destination_head {
            Some(head) => {
                if head.revision != destination_revision {
                    return Err(PromoteError::conflict(format!(
                        "Test '{test_name}' updated since {destination_revision}. Currently at {}",
                        head.revision
                    )));
                }
                if destination_store.current_test_definition(test_name).await?.is_none() {
                    return Err(PromoteError::Promotion(format!(
                        "Test '{test_name}' has been deleted in destination, not allowed to promote again."
                    )));
                }
                tracing::info!(test = test_name, %destination, "Updating promoted definition");
                destination_store
                    .update_test_definition(&commit, destination_revision, test_name, &definition, &metadata)
                    .await?;
            }
            None => {
                tracing::info!(test = test_name, %destination, "Adding promoted definition");
                destination_store
                    .add_test_definition(&commit, ADD_TEST_REVISION, test_name, &definition, &metadata)
                    .await?;
            }
        }
        Ok(())
    }
}

/// Commit message of a promotion.
///
/// The source commit message is appended with `+review` defused so review
/// tooling does not pick the promotion up a second time.
#[must_use]
pub fn promotion_commit_message(
    test_name: &str,
    source: Environment,
    effective_revision: &str,
    destination: Environment,
    source_message: &str,
) -> String {
    let mut message = format!(
        "Promoting {test_name} ({} r{effective_revision}) to {}",
        source.name(),
        destination.name()
    );
    if !source_message.trim().is_empty() {
        message.push_str("\n\n");
        message.push_str(&source_message.replace("+review", "_review"));
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn commit_message_carries_source_message() {
        assert_eq!(
            promotion_commit_message(
                "button_color_tst",
                Environment::Working,
                "12",
                Environment::Qa,
                "Widen allocation +review @bob"
            ),
            "Promoting button_color_tst (trunk r12) to qa\n\nWiden allocation _review @bob"
        );
    }

    #[test]
    fn blank_source_message_is_dropped() {
        assert_eq!(
            promotion_commit_message("t", Environment::Qa, "3", Environment::Production, "  "),
            "Promoting t (qa r3) to production"
        );
    }
}
