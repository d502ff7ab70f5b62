//! Proctor Model - test definitions and the rules that govern their changes
//!
//! Provides:
//! - The persisted test definition model (buckets, allocations, ranges)
//! - Environments and the legal promotion edges between them
//! - Revisions and per-environment version pointers
//! - Allocation-id bookkeeping (`#A1` style identifiers)
//! - Change analysis used to gate automatic promotion
//!
//! # Example
//!
//! ```rust
//! use proctor_model::{analysis, Allocation, Range, TestBucket, TestDefinition, TestType};
//!
//! let definition = TestDefinition::new(TestType::USER, "salt_example")
//!     .with_bucket(TestBucket::new("inactive", -1))
//!     .with_allocation(Allocation::new(vec![Range::new(-1, 1.0)]));
//!
//! assert!(analysis::is_all_inactive_test(&definition));
//! ```

#![warn(unreachable_pub)]

pub mod allocation_id;
pub mod analysis;
pub mod change;
pub mod definition;
pub mod environment;
pub mod error;
pub mod matrix;
pub mod revision;

pub use change::ChangeMetadata;
pub use definition::{Allocation, Payload, Range, TestBucket, TestDefinition, TestType};
pub use environment::Environment;
pub use error::{ModelError, ModelResult};
pub use matrix::{TestMatrixDefinition, TestMatrixVersion, TestVersion, TestVersionResult};
pub use revision::{EnvironmentVersion, Revision, UNKNOWN_REVISION, UNKNOWN_VERSION};

/// Floating point tolerance used for every range-length comparison
pub const TOLERANCE: f64 = 1e-6;

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with the model
    pub use crate::{
        Allocation, ChangeMetadata, Environment, EnvironmentVersion, Range, Revision, TestBucket, TestDefinition,
        TestType, UNKNOWN_REVISION,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
