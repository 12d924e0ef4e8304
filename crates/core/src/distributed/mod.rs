//! Sharding support for the speculator's projections and embeddings.
//!
//! - [`ProcessGroup`]: rank and world size of the workers sharing a model
//! - [`DeviceCommunicator`]: the collectives the sharded layers need
//! - [`ColumnParallelLinear`], [`VocabParallelEmbedding`]: the sharded layers
//!
//! With a single-member group every collective is the identity, so the
//! speculator runs unchanged on one device.

mod communicator;
mod error;
mod parallel_layers;
mod process_group;

pub use communicator::{DeviceCommunicator, LocalCommunicator};
pub use error::DistributedError;
pub use parallel_layers::{ColumnParallelLinear, VocabParallelEmbedding};
pub use process_group::{LocalProcessGroup, ProcessGroup};
