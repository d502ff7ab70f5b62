//! Error types for the model crate

/// Model error type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    /// Allocation id does not match `#<LETTERS><digits>`
    #[error("Allocation id format is incorrect {0}")]
    InvalidAllocationId(String),

    /// Letter outside `A..=Z` in an allocation id
    #[error("Invalid letter: {0}, the letter should be upper case A -> Z")]
    InvalidAllocationLetter(char),

    /// Definition rejected by validation
    #[error("{0}")]
    InvalidDefinition(String),

    /// Environment name not recognised
    #[error("unknown environment: {0}")]
    UnknownEnvironment(String),
}

/// Result type for model operations
pub type ModelResult<T> = Result<T, ModelError>;
