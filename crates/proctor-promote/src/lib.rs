//! Proctor Promote - moving test definitions through environments
//!
//! Provides:
//! - A matrix checker verifying candidates against every active client
//! - Promotion between environment stores with optimistic concurrency
//! - Create, edit, delete and promote flows with extension hooks
//! - Automatic promotion of allocation-only edits
//! - A bounded background job engine with cancellation and job history
//!
//! # Example
//!
//! ```rust,no_run
//! use proctor_promote::prelude::*;
//! use proctor_model::{Environment, TestDefinition, TestType};
//! use std::sync::Arc;
//!
//! # fn example(stores: proctor_store::EnvironmentStores, source: Arc<dyn SpecificationSource>) {
//! let config = PromoteConfig::default();
//! let checker = MatrixChecker::new(source, Arc::new(StructuralVerifier));
//! let jobs = Arc::new(JobManager::new(&config));
//! let engine = Arc::new(PromotionEngine::new(stores, checker, jobs, &config));
//!
//! let definition = TestDefinition::new(TestType::USER, "button_color_tst");
//! let job = engine.create(
//!     EditRequest::new("button_color_tst", "alice", "secret", definition)
//!         .with_auto_promote(Environment::Qa),
//! );
//! println!("{}", job.title());
//! # }
//! ```

#![warn(unreachable_pub)]

pub mod checker;
pub mod config;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod jobs;
pub mod promoter;

pub use checker::{
    AppVersion, CheckMatrixResult, ClientSpecification, LoadResult, MatrixChecker, MatrixVerifier,
    SpecificationSource, StructuralVerifier, TestSpecification,
};
pub use config::{AutoPromotePolicy, PromoteConfig};
pub use engine::{DefinitionInput, DeleteRequest, EditRequest, PromoteRequest, PromotionEngine};
pub use error::{PromoteError, PromoteResult};
pub use hooks::{
    ChangeEvent, ChangeHooks, ChangeLogger, CommentFormatter, OnAfterChange, OnBeforeChange,
    PlainCommentFormatter, RequestParameters,
};
pub use jobs::{
    BackgroundJob, JobExecutionHook, JobInfo, JobInfoStore, JobManager, JobStatus, JobType, ResultUrl,
};
pub use promoter::{Promoter, SingleEnvironmentVersion};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for promotion
    pub use crate::{
        BackgroundJob, ChangeHooks, DeleteRequest, EditRequest, JobManager, JobStatus, MatrixChecker,
        PromoteConfig, PromoteError, PromoteRequest, PromoteResult, PromotionEngine,
        SpecificationSource, StructuralVerifier,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
