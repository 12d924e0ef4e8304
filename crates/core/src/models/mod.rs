pub mod mlp_speculator;
pub mod speculator_head;
pub mod tp_layers;

pub use mlp_speculator::{
    HeadSlot, HeadStep, MixingWeights, MlpSpeculator, ParameterCounts, SpeculationTrace,
};
pub use speculator_head::{SpeculatorHead, SpeculatorHeadOutput};
pub use tp_layers::{TpContext, TpEmbedding, TpLinear};
