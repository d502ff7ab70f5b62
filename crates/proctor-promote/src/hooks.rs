//! Extension points around definition changes
//!
//! Hooks are injected as ordered lists and run by the promotion engine
//! before and after each write. A failing `before` hook aborts the change.

use crate::error::PromoteResult;
use crate::jobs::BackgroundJob;
use proctor_model::{Environment, TestDefinition};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Parameters of the originating request, passed through to hooks
pub type RequestParameters = BTreeMap<String, Vec<String>>;

/// The change a hook is observing
#[derive(Debug, Clone, Copy)]
pub enum ChangeEvent<'a> {
    /// New test
    Create {
        /// Test name
        test_name: &'a str,
        /// Definition being written
        definition: &'a TestDefinition,
    },
    /// Existing test changed
    Edit {
        /// Test name
        test_name: &'a str,
        /// Definition before the edit
        existing: &'a TestDefinition,
        /// Definition being written
        updated: &'a TestDefinition,
    },
    /// Test removed
    Delete {
        /// Test name
        test_name: &'a str,
        /// Definition being removed
        definition: &'a TestDefinition,
    },
    /// Test copied between environments
    Promote {
        /// Test name
        test_name: &'a str,
        /// Definition being promoted
        definition: &'a TestDefinition,
        /// Source environment
        source: Environment,
        /// Destination environment
        destination: Environment,
        /// Triggered by an edit rather than a user
        auto_promote: bool,
    },
}

impl ChangeEvent<'_> {
    /// Test the event concerns
    #[must_use]
    pub fn test_name(&self) -> &str {
        match self {
            Self::Create { test_name, .. }
            | Self::Edit { test_name, .. }
            | Self::Delete { test_name, .. }
            | Self::Promote { test_name, .. } => test_name,
        }
    }
}

/// Writes hook output into the job log
#[derive(Debug, Clone, Copy)]
pub struct ChangeLogger<'a> {
    job: &'a BackgroundJob,
}

impl<'a> ChangeLogger<'a> {
    /// Logger for `job`
    #[inline]
    #[must_use]
    pub fn new(job: &'a BackgroundJob) -> Self {
        Self { job }
    }

    /// Append a line to the job log
    pub fn log(&self, message: impl AsRef<str>) {
        self.job.log(message);
    }
}

/// Runs before a change is written
pub trait OnBeforeChange: Send + Sync {
    /// Inspect or veto the change
    fn before_change(
        &self,
        event: &ChangeEvent<'_>,
        parameters: &RequestParameters,
        logger: &ChangeLogger<'_>,
    ) -> PromoteResult<()>;
}

/// Runs after a change is written
pub trait OnAfterChange: Send + Sync {
    /// React to the change
    fn after_change(
        &self,
        event: &ChangeEvent<'_>,
        parameters: &RequestParameters,
        logger: &ChangeLogger<'_>,
    ) -> PromoteResult<()>;
}

/// Turns a user comment into the full commit message
pub trait CommentFormatter: Send + Sync {
    /// Full commit message for `comment`
    fn format_full_comment(&self, comment: &str, parameters: &RequestParameters) -> String;
}

/// Uses the comment as is
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainCommentFormatter;

impl CommentFormatter for PlainCommentFormatter {
    fn format_full_comment(&self, comment: &str, _parameters: &RequestParameters) -> String {
        comment.to_string()
    }
}

/// Ordered before and after hooks
#[derive(Clone, Default)]
pub struct ChangeHooks {
    before: Vec<Arc<dyn OnBeforeChange>>,
    after: Vec<Arc<dyn OnAfterChange>>,
}

impl fmt::Debug for ChangeHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeHooks")
            .field("before", &self.before.len())
            .field("after", &self.after.len())
            .finish()
    }
}

impl ChangeHooks {
    /// With a hook run before writes
    #[must_use]
    pub fn with_before(mut self, hook: Arc<dyn OnBeforeChange>) -> Self {
        self.before.push(hook);
        self
    }

    /// With a hook run after writes
    #[must_use]
    pub fn with_after(mut self, hook: Arc<dyn OnAfterChange>) -> Self {
        self.after.push(hook);
        self
    }

    /// Any before hook registered
    #[inline]
    #[must_use]
    pub fn has_before(&self) -> bool {
        !self.before.is_empty()
    }

    /// Any after hook registered
    #[inline]
    #[must_use]
    pub fn has_after(&self) -> bool {
        !self.after.is_empty()
    }

    /// Run every before hook in order, stopping at the first error
    pub fn run_before(
        &self,
        event: &ChangeEvent<'_>,
        parameters: &RequestParameters,
        job: &BackgroundJob,
    ) -> PromoteResult<()> {
        let logger = ChangeLogger::new(job);
        self.before
            .iter()
            .try_for_each(|hook| hook.before_change(event, parameters, &logger))
    }

    /// Run every after hook in order, stopping at the first error
    pub fn run_after(
        &self,
        event: &ChangeEvent<'_>,
        parameters: &RequestParameters,
        job: &BackgroundJob,
    ) -> PromoteResult<()> {
        let logger = ChangeLogger::new(job);
        self.after
            .iter()
            .try_for_each(|hook| hook.after_change(event, parameters, &logger))
    }
}
