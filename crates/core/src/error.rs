//! Error types for the speculator.

use thiserror::Error;

use crate::distributed::DistributedError;

/// Result type alias for speculator operations.
pub type Result<T> = std::result::Result<T, SpeculatorError>;

/// Errors raised while building or running the speculator.
///
/// None of these are recovered locally: the caller is expected to abort the
/// decoding step for the affected batch.
#[derive(Error, Debug)]
pub enum SpeculatorError {
    /// Malformed or inconsistent construction parameters.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The same parameter name was found in two different checkpoint files.
    #[error("parameter {name} was found in multiple files: {first} and {second}")]
    RoutingConflict {
        name: String,
        first: String,
        second: String,
    },

    /// Runtime tensor shape inconsistent with the configured dimensions.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Failure downloading checkpoint files from the Hub.
    #[error("hub error: {0}")]
    Hub(String),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("distributed error: {0}")]
    Distributed(#[from] DistributedError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SpeculatorError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub(crate) fn shape(msg: impl Into<String>) -> Self {
        Self::ShapeMismatch(msg.into())
    }
}
