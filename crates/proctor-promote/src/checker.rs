//! Compatibility of a candidate definition with active clients
//!
//! A candidate is wrapped in a single-test matrix and verified against every
//! client application currently loading specifications in the target
//! environment. A `None` candidate models a deletion.

use crate::error::{PromoteError, PromoteResult};
use async_trait::async_trait;
use chrono::Utc;
use proctor_model::{analysis, Environment, TestDefinition, TestMatrixDefinition, TestMatrixVersion};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Client application at one version
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AppVersion {
    /// Application name
    pub app: String,
    /// Deployed version
    pub version: String,
}

impl AppVersion {
    /// Create app version
    #[inline]
    #[must_use]
    pub fn new(app: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for AppVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.app, self.version)
    }
}

/// What a client expects of one test
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSpecification {
    /// Bucket names the client knows, by value
    #[serde(default)]
    pub buckets: BTreeMap<String, i32>,
    /// Value used when the test cannot be loaded
    #[serde(default = "default_fallback")]
    pub fallback_value: i32,
    /// Payload type every bucket must carry, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_type: Option<String>,
}

fn default_fallback() -> i32 {
    -1
}

/// A client's declared requirements
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSpecification {
    /// Required tests by name
    #[serde(default)]
    pub tests: BTreeMap<String, TestSpecification>,
    /// Context variables the client provides to rules, name to type
    #[serde(default)]
    pub provided_context: BTreeMap<String, String>,
    /// Tests carrying any of these meta tags are loaded dynamically
    #[serde(default)]
    pub dynamic_meta_tags: BTreeSet<String>,
}

/// Outcome of verifying a matrix for one client
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadResult {
    /// Tests present but unusable, with the reason
    pub test_errors: BTreeMap<String, String>,
    /// Required tests absent from the matrix
    pub missing_tests: BTreeSet<String>,
}

impl LoadResult {
    /// Whether anything failed
    #[inline]
    #[must_use]
    pub fn has_invalid_tests(&self) -> bool {
        !self.test_errors.is_empty() || !self.missing_tests.is_empty()
    }
}

/// Discovers clients active in an environment
#[async_trait]
pub trait SpecificationSource: Send + Sync {
    /// Specifications that loaded successfully; failures are skipped with a warning
    async fn load_all_successful(&self, environment: Environment) -> BTreeMap<AppVersion, ClientSpecification>;
}

/// Rule and type verification oracle
#[cfg_attr(test, mockall::automock)]
pub trait MatrixVerifier: Send + Sync {
    /// Verify `matrix` for a client requiring `required_tests`.
    ///
    /// `Err` means verification itself could not run.
    fn verify(
        &self,
        matrix: &TestMatrixVersion,
        matrix_source: &str,
        required_tests: &BTreeMap<String, TestSpecification>,
        provided_context: &BTreeMap<String, String>,
    ) -> Result<LoadResult, String>;
}

/// Structural verifier: required tests present, internally consistent,
/// declaring every bucket the client knows and carrying required payloads
#[derive(Debug, Clone, Copy, Default)]
pub struct StructuralVerifier;

impl MatrixVerifier for StructuralVerifier {
    fn verify(
        &self,
        matrix: &TestMatrixVersion,
        _matrix_source: &str,
        required_tests: &BTreeMap<String, TestSpecification>,
        _provided_context: &BTreeMap<String, String>,
    ) -> Result<LoadResult, String> {
        let mut result = LoadResult::default();
        for (test_name, specification) in required_tests {
            let Some(definition) = matrix.test_matrix_definition.tests.get(test_name) else {
                result.missing_tests.insert(test_name.clone());
                continue;
            };
            if let Err(e) = analysis::verify_internally_consistent(test_name, definition) {
                result.test_errors.insert(test_name.clone(), e.to_string());
                continue;
            }
            let unknown = specification
                .buckets
                .iter()
                .find(|(_, value)| definition.bucket(**value).is_none());
            if let Some((name, value)) = unknown {
                result
                    .test_errors
                    .insert(test_name.clone(), format!("bucket '{name}' with value {value} is not defined"));
                continue;
            }
            if let Some(payload_type) = &specification.payload_type {
                if let Some(bucket) = definition.buckets.iter().find(|b| b.payload.is_none()) {
                    result.test_errors.insert(
                        test_name.clone(),
                        format!("bucket '{}' is missing a {payload_type} payload", bucket.name),
                    );
                }
            }
        }
        Ok(result)
    }
}

/// Verdict of [`MatrixChecker::check`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckMatrixResult {
    /// No client reported a problem
    pub valid: bool,
    /// One message per offending client
    pub errors: Vec<String>,
}

/// Verifies candidates against every active client of an environment
#[derive(Clone)]
pub struct MatrixChecker {
    source: Arc<dyn SpecificationSource>,
    verifier: Arc<dyn MatrixVerifier>,
}

impl fmt::Debug for MatrixChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatrixChecker").finish_non_exhaustive()
    }
}

impl MatrixChecker {
    /// Create checker
    #[must_use]
    pub fn new(source: Arc<dyn SpecificationSource>, verifier: Arc<dyn MatrixVerifier>) -> Self {
        Self { source, verifier }
    }

    /// Verify `candidate` as `test_name` against clients active in `environment`
    pub async fn check(
        &self,
        environment: Environment,
        test_name: &str,
        candidate: Option<&TestDefinition>,
    ) -> PromoteResult<CheckMatrixResult> {
        let matrix = synthetic_matrix(test_name, candidate);
        let specifications = self.source.load_all_successful(environment).await;
        if specifications.is_empty() {
            return Ok(CheckMatrixResult {
                valid: true,
                errors: Vec::new(),
            });
        }

        let verifier = Arc::clone(&self.verifier);
        let test_name = test_name.to_string();
        let errors = tokio::task::spawn_blocking(move || {
            specifications
                .into_par_iter()
                .filter_map(|(app_version, specification)| {
                    tracing::info!(%app_version, test = %test_name, "Verifying artifact against cached specification");
                    let required = required_tests(&specification, &test_name, &matrix);
                    let source = app_version.to_string();
                    match verifier.verify(&matrix, &source, &required, &specification.provided_context) {
                        Ok(result) if result.has_invalid_tests() => Some(error_message(&app_version, &result)),
                        Ok(_) => None,
                        Err(message) => {
                            tracing::error!(%app_version, error = %message, "Unable to verify");
                            Some(format!("{app_version} failed. {message}"))
                        }
                    }
                })
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| PromoteError::Verification(e.to_string()))?;

        Ok(CheckMatrixResult {
            valid: errors.is_empty(),
            errors,
        })
    }
}

fn synthetic_matrix(test_name: &str, candidate: Option<&TestDefinition>) -> TestMatrixVersion {
    let test_matrix_definition = candidate
        .map(|definition| TestMatrixDefinition::single(test_name, definition.clone()))
        .unwrap_or_default();
    TestMatrixVersion {
        test_matrix_definition,
        published: Utc::now(),
        author: "author".to_string(),
        version: String::new(),
        description: format!("fake matrix for validation of {test_name}"),
    }
}

/// The client's declared spec for `test_name`, or an empty spec when the
/// candidate matches one of the client's dynamic meta tags
fn required_tests(
    specification: &ClientSpecification,
    test_name: &str,
    matrix: &TestMatrixVersion,
) -> BTreeMap<String, TestSpecification> {
    let mut required = BTreeMap::new();
    if let Some(declared) = specification.tests.get(test_name) {
        required.insert(test_name.to_string(), declared.clone());
    } else if let Some(candidate) = matrix.test_matrix_definition.tests.get(test_name) {
        let dynamic = candidate
            .meta_tags
            .iter()
            .any(|tag| specification.dynamic_meta_tags.contains(tag));
        if dynamic {
            required.insert(test_name.to_string(), TestSpecification::default());
        }
    }
    required
}

/// At most one test is verified, so report its first problem
fn error_message(app_version: &AppVersion, result: &LoadResult) -> String {
    if let Some((test, message)) = result.test_errors.iter().next() {
        format!("{app_version} cannot load test '{test}': {message}")
    } else if let Some(test) = result.missing_tests.iter().next() {
        format!("{app_version} requires test '{test}'")
    } else {
        String::new()
    }
}
