//! Error type shared by the model, the adjustment engine and the io helpers.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type AdjustResult<T> = Result<T, AdjustError>;

#[derive(Debug, Error)]
pub enum AdjustError {
    /// Setup errors detected while building or registering the network.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("duplicate {kind} `{name}`")]
    Duplicate { kind: &'static str, name: String },

    #[error("unknown {kind} `{name}`")]
    NotFound { kind: &'static str, name: String },

    /// Configuration values outside of their admissible range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("normal equation system is singular")]
    SingularMatrix,

    #[error("adjustment interrupted")]
    Interrupted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("export of adjustment results failed: {0}")]
    Export(String),
}

impl AdjustError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}
