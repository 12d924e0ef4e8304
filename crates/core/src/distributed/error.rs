use thiserror::Error;

/// Errors from sharded layers and collective operations.
#[derive(Error, Debug)]
pub enum DistributedError {
    #[error("invalid rank {rank}: must be < world_size {world_size}")]
    InvalidRank { rank: usize, world_size: usize },

    /// A dimension cannot be split evenly across the group.
    #[error("{what} ({size}) must be divisible by world_size ({world_size})")]
    Indivisible {
        what: &'static str,
        size: usize,
        world_size: usize,
    },

    #[error("tensor shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("tensor error: {0}")]
    TensorError(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, DistributedError>;
