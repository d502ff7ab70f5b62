//! Error types for the store
//!
//! Provides:
//! - Read failures (missing paths, undecodable content, bad revisions)
//! - Update failures (credentials, checkout, commit, invalid mutations)
//! - Setup and shutdown failures

use crate::scm::ScmError;
use std::error::Error as StdError;

type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Main store error type
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Reading from the SCM failed
    #[error("{message}")]
    Read {
        /// What was being read
        message: String,
        /// Underlying cause
        #[source]
        source: Option<BoxError>,
    },

    /// Writing through a working directory failed
    #[error("{message}")]
    Update {
        /// What was being written
        message: String,
        /// Underlying cause
        #[source]
        source: Option<BoxError>,
    },

    /// Store is misconfigured
    #[error("{0}")]
    Setup(String),

    /// Component has been closed
    #[error("{0} is shutdown")]
    Shutdown(&'static str),

    /// SCM backend failure outside a read or update
    #[error(transparent)]
    Scm(#[from] ScmError),

    /// Filesystem failure
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Read error without cause
    #[must_use]
    pub fn read(message: impl Into<String>) -> Self {
        Self::Read { message: message.into(), source: None }
    }

    /// Read error wrapping a cause
    #[must_use]
    pub fn read_with(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Read { message: message.into(), source: Some(source.into()) }
    }

    /// Update error without cause
    #[must_use]
    pub fn update(message: impl Into<String>) -> Self {
        Self::Update { message: message.into(), source: None }
    }

    /// Update error wrapping a cause
    #[must_use]
    pub fn update_with(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Update { message: message.into(), source: Some(source.into()) }
    }

    /// Check if this is a read failure
    #[inline]
    #[must_use]
    pub fn is_read(&self) -> bool {
        matches!(self, Self::Read { .. })
    }

    /// Check if this is an update failure
    #[inline]
    #[must_use]
    pub fn is_update(&self) -> bool {
        matches!(self, Self::Update { .. })
    }

    /// Check if credentials were rejected anywhere in the cause chain
    #[must_use]
    pub fn is_authentication(&self) -> bool {
        let mut current: Option<&(dyn StdError + 'static)> = Some(self);
        while let Some(error) = current {
            // transparent variants hide the wrapped ScmError from source()
            let scm = error.downcast_ref::<ScmError>().or_else(|| match error.downcast_ref::<Self>() {
                Some(Self::Scm(scm)) => Some(scm),
                _ => None,
            });
            if scm.is_some_and(ScmError::is_authentication) {
                return true;
            }
            current = error.source();
        }
        false
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;
