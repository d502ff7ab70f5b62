//! Revisions and per-environment version pointers

use crate::environment::Environment;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Revision string for "not present in this environment"
pub const UNKNOWN_REVISION: &str = "-1";

/// Effective version string for "not present in this environment"
pub const UNKNOWN_VERSION: &str = "-1";

/// One SCM commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    /// Commit identity
    pub revision: String,
    /// Committer
    pub author: String,
    /// Commit time
    pub date: DateTime<Utc>,
    /// Commit message
    pub message: String,
}

impl Revision {
    /// Create revision
    #[inline]
    #[must_use]
    pub fn new(
        revision: impl Into<String>,
        author: impl Into<String>,
        date: DateTime<Utc>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            revision: revision.into(),
            author: author.into(),
            date,
            message: message.into(),
        }
    }
}

/// Latest known revision of one test in every environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentVersion {
    /// Test name
    pub test_name: String,
    /// Last commit on trunk
    pub trunk: Option<Revision>,
    /// Last commit on QA
    pub qa: Option<Revision>,
    /// Trunk revision the QA definition was promoted from
    pub qa_effective_revision: String,
    /// Last commit on production
    pub production: Option<Revision>,
    /// Trunk revision the production definition was promoted from
    pub production_effective_revision: String,
}

impl EnvironmentVersion {
    /// Create a version pointer set
    #[must_use]
    pub fn new(
        test_name: impl Into<String>,
        trunk: Option<Revision>,
        qa: Option<Revision>,
        qa_effective_revision: impl Into<String>,
        production: Option<Revision>,
        production_effective_revision: impl Into<String>,
    ) -> Self {
        Self {
            test_name: test_name.into(),
            trunk,
            qa,
            qa_effective_revision: qa_effective_revision.into(),
            production,
            production_effective_revision: production_effective_revision.into(),
        }
    }

    /// Copy with one environment's pointer replaced
    #[must_use]
    pub fn update(
        &self,
        environment: Environment,
        revision: Revision,
        effective_revision: impl Into<String>,
    ) -> Self {
        let mut updated = self.clone();
        let effective_revision = effective_revision.into();
        match environment {
            Environment::Working => updated.trunk = Some(revision),
            Environment::Qa => {
                updated.qa = Some(revision);
                updated.qa_effective_revision = effective_revision;
            }
            Environment::Production => {
                updated.production = Some(revision);
                updated.production_effective_revision = effective_revision;
            }
        }
        updated
    }

    /// Latest commit in `environment`, if any
    #[must_use]
    pub fn latest(&self, environment: Environment) -> Option<&Revision> {
        match environment {
            Environment::Working => self.trunk.as_ref(),
            Environment::Qa => self.qa.as_ref(),
            Environment::Production => self.production.as_ref(),
        }
    }

    /// Revision id in `environment`, [`UNKNOWN_REVISION`] when absent
    #[must_use]
    pub fn revision(&self, environment: Environment) -> &str {
        self.latest(environment)
            .map_or(UNKNOWN_REVISION, |r| r.revision.as_str())
    }

    /// Effective trunk version in `environment`
    #[must_use]
    pub fn version(&self, environment: Environment) -> &str {
        match environment {
            Environment::Working => self.revision(Environment::Working),
            Environment::Qa => &self.qa_effective_revision,
            Environment::Production => &self.production_effective_revision,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rev(id: &str) -> Revision {
        Revision::new(id, "alice", Utc::now(), "msg")
    }

    #[test]
    fn unknown_when_absent() {
        let version = EnvironmentVersion::new("t", Some(rev("5")), None, UNKNOWN_VERSION, None, UNKNOWN_VERSION);

        assert_eq!(version.revision(Environment::Working), "5");
        assert_eq!(version.revision(Environment::Qa), UNKNOWN_REVISION);
        assert_eq!(version.version(Environment::Production), UNKNOWN_VERSION);
    }

    #[test]
    fn update_replaces_only_target() {
        let version = EnvironmentVersion::new("t", Some(rev("5")), None, UNKNOWN_VERSION, None, UNKNOWN_VERSION);
        let updated = version.update(Environment::Qa, rev("7"), "5");

        assert_eq!(updated.revision(Environment::Qa), "7");
        assert_eq!(updated.version(Environment::Qa), "5");
        assert_eq!(updated.revision(Environment::Working), "5");
        assert_eq!(updated.revision(Environment::Production), UNKNOWN_REVISION);
    }
}
