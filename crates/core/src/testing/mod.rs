//! Shared test utilities for speculator-core.
//!
//! Tiny configurations and deterministic synthetic checkpoints, usable from
//! unit tests, integration tests and benches (`test-utils` feature).

mod synthetic;
mod tiny_config;

pub use synthetic::{
    lm_head_weight, synthetic_checkpoint, synthetic_var_builder, write_safetensors,
};
pub use tiny_config::{
    tiny_speculator_config, TINY_EMB_DIM, TINY_INNER_DIM, TINY_N_PREDICT, TINY_VOCAB,
};
