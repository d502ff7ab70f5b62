//! Error types for promotion and jobs
//!
//! Provides:
//! - Validation failures rejected before any SCM interaction
//! - Revision conflicts detected by optimistic concurrency
//! - Incompatibilities reported by the matrix checker
//! - Auto-promotion failures that follow an already committed edit

use proctor_model::ModelError;
use proctor_store::StoreError;

/// Main promotion error type
#[derive(Debug, thiserror::Error)]
pub enum PromoteError {
    /// Bad input
    #[error("{0}")]
    Validation(String),

    /// Supplied revision does not match the current one
    #[error("{0}")]
    Conflict(String),

    /// An active client cannot load the candidate
    #[error("{message}")]
    Incompatible {
        /// Summary shown to the user
        message: String,
        /// One entry per offending client
        errors: Vec<String>,
    },

    /// Promotion preconditions not met in the destination
    #[error("{0}")]
    Promotion(String),

    /// Definition or history missing
    #[error("{0}")]
    NotFound(String),

    /// The edit committed but the follow-up promotion did not
    #[error("{message}")]
    AutoPromote {
        /// Message also used as the job's end message
        message: String,
        /// What went wrong while promoting
        #[source]
        source: Box<PromoteError>,
    },

    /// A job panicked
    #[error("job panicked: {0}")]
    Panicked(String),

    /// Verification task failed to run
    #[error("verification failed: {0}")]
    Verification(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Store failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Model rule violated
    #[error(transparent)]
    Model(#[from] ModelError),
}

impl PromoteError {
    /// Validation error
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Conflict error
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    /// Incompatibility with a summary and per-client errors
    #[must_use]
    pub fn incompatible(message: impl Into<String>, errors: Vec<String>) -> Self {
        Self::Incompatible {
            message: message.into(),
            errors,
        }
    }

    /// Bad input, including model rules such as bucket names
    #[inline]
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::Model(ModelError::InvalidDefinition(_)))
    }

    /// Revision mismatch
    #[inline]
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Rejected by the matrix checker
    #[inline]
    #[must_use]
    pub fn is_incompatible(&self) -> bool {
        matches!(self, Self::Incompatible { .. })
    }

    /// The SCM rejected the credentials
    #[inline]
    #[must_use]
    pub fn is_authorization(&self) -> bool {
        match self {
            Self::Store(e) => e.is_authentication(),
            Self::AutoPromote { source, .. } => source.is_authorization(),
            _ => false,
        }
    }

    /// Edit committed, follow-up promotion failed
    #[inline]
    #[must_use]
    pub fn is_auto_promote(&self) -> bool {
        matches!(self, Self::AutoPromote { .. })
    }

    /// Caused by the request rather than the system; logged at info
    #[must_use]
    pub fn is_expected(&self) -> bool {
        self.is_validation()
            || self.is_conflict()
            || self.is_incompatible()
            || self.is_authorization()
            || matches!(self, Self::Promotion(_) | Self::NotFound(_))
    }

    /// Per-client errors when incompatible
    #[must_use]
    pub fn errors(&self) -> &[String] {
        match self {
            Self::Incompatible { errors, .. } => errors,
            _ => &[],
        }
    }
}

/// Result type for promotion operations
pub type PromoteResult<T> = Result<T, PromoteError>;

/// Message lines of `error` and its causes, outermost first
#[must_use]
pub fn cause_chain(error: &(dyn std::error::Error + 'static)) -> Vec<String> {
    let mut chain = Vec::new();
    let mut current = Some(error);
    while let Some(e) = current {
        chain.push(e.to_string());
        current = e.source();
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(PromoteError::validation("Comment is required.").is_validation());
        assert!(PromoteError::conflict("Test has been updated since 1 currently at 2").is_conflict());
        assert!(PromoteError::Model(ModelError::InvalidDefinition("Salt is required.".into())).is_validation());

        let incompatible = PromoteError::incompatible("nope", vec!["app@1 requires test 'x'".into()]);
        assert!(incompatible.is_incompatible());
        assert!(incompatible.is_expected());
        assert_eq!(incompatible.errors(), ["app@1 requires test 'x'".to_string()]);

        assert!(!PromoteError::Panicked("boom".into()).is_expected());
    }

    #[test]
    fn auto_promote_keeps_cause() {
        let err = PromoteError::AutoPromote {
            message: "Test Creation/Edit succeeded. However, the test was not promoted automatically to QA/Production."
                .into(),
            source: Box::new(PromoteError::NotFound("Test hasn't been created.".into())),
        };
        assert!(err.is_auto_promote());
        assert_eq!(
            cause_chain(&err),
            vec![
                "Test Creation/Edit succeeded. However, the test was not promoted automatically to QA/Production."
                    .to_string(),
                "Test hasn't been created.".to_string(),
            ]
        );
    }

    #[test]
    fn store_errors_pass_through() {
        let err: PromoteError = StoreError::update("Unable to commit").into();
        assert_eq!(err.to_string(), "Unable to commit");
        assert!(!err.is_expected());
    }
}
