//! Whole-store snapshots

use crate::definition::TestDefinition;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// All test definitions at one revision
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestMatrixDefinition {
    /// Definitions keyed by test name
    pub tests: BTreeMap<String, TestDefinition>,
}

impl TestMatrixDefinition {
    /// Matrix containing a single test
    #[must_use]
    pub fn single(test_name: impl Into<String>, definition: TestDefinition) -> Self {
        let mut tests = BTreeMap::new();
        tests.insert(test_name.into(), definition);
        Self { tests }
    }

    /// Case-insensitive lookup, matching how test names are compared on edit
    #[must_use]
    pub fn find_ignore_case(&self, test_name: &str) -> Option<&TestDefinition> {
        self.tests
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(test_name))
            .map(|(_, definition)| definition)
    }
}

/// Test matrix with commit metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestMatrixVersion {
    /// The tests
    pub test_matrix_definition: TestMatrixDefinition,
    /// Commit time of the matrix revision
    pub published: DateTime<Utc>,
    /// Committer of the matrix revision
    pub author: String,
    /// Matrix revision
    pub version: String,
    /// Commit message of the matrix revision
    pub description: String,
}

/// One test's last-changed revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestVersion {
    /// Test name
    pub test_name: String,
    /// Revision at which the test directory last changed
    pub revision: String,
}

impl TestVersion {
    /// Create entry
    #[inline]
    #[must_use]
    pub fn new(test_name: impl Into<String>, revision: impl Into<String>) -> Self {
        Self {
            test_name: test_name.into(),
            revision: revision.into(),
        }
    }
}

/// Listing of every test at a revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestVersionResult {
    /// Tests with their last-changed revisions
    pub tests: Vec<TestVersion>,
    /// Commit time of the listing revision
    pub published: DateTime<Utc>,
    /// Committer of the listing revision
    pub author: String,
    /// Listing revision
    pub version: String,
    /// Commit message of the listing revision
    pub description: String,
}
