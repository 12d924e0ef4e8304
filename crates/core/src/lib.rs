//! MLP speculator for speculative decoding on candle.
//!
//! [`MlpSpeculator`] turns a base model's last hidden state and the token it
//! just emitted into `n_predict` vocabulary distributions, one per future
//! position. [`SpeculatorHead`] pairs it with the base model's LM head and
//! skips speculation for large batches.

pub mod config;
pub mod distributed;
pub mod error;
pub mod layers;
pub mod loader;
pub mod models;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use config::{SpeculationConfig, SpeculatorConfig};
pub use error::{Result, SpeculatorError};
pub use loader::{SpeculatorFiles, WeightRouting};
pub use models::{MlpSpeculator, SpeculatorHead, SpeculatorHeadOutput, TpContext};
