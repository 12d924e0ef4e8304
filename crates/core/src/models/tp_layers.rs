//! Linear and embedding capabilities used by the speculator.
//!
//! Each layer is either a plain candle layer (one device) or a sharded layer
//! from [`crate::distributed`] that finishes with a collective. Callers only
//! see the unsharded mathematical result.

use std::sync::Arc;

use candle_core::{Module, Result, Tensor};
use candle_nn::{Embedding, Linear, VarBuilder};

use crate::distributed::{
    ColumnParallelLinear, DeviceCommunicator, LocalCommunicator, LocalProcessGroup, ProcessGroup,
    VocabParallelEmbedding,
};

/// Communicator plus rank bookkeeping shared by every layer of a model.
#[derive(Clone)]
pub struct TpContext {
    pub communicator: Arc<dyn DeviceCommunicator>,
    pub world_size: usize,
    pub rank: usize,
}

impl TpContext {
    pub fn new(communicator: Arc<dyn DeviceCommunicator>) -> Self {
        let pg = communicator.process_group();
        let world_size = pg.world_size();
        let rank = pg.rank();
        Self {
            communicator,
            world_size,
            rank,
        }
    }

    pub fn single_device() -> Self {
        Self::new(Arc::new(LocalCommunicator::new(LocalProcessGroup::new())))
    }

    pub fn is_single(&self) -> bool {
        self.world_size == 1
    }

    pub fn comm(&self) -> &dyn DeviceCommunicator {
        self.communicator.as_ref()
    }

    pub fn process_group(&self) -> &dyn ProcessGroup {
        self.communicator.process_group()
    }
}

/// Bias-free projection `(..., in) -> (..., out)`.
pub enum TpLinear {
    Regular(Linear),
    ColumnParallel(ColumnParallelLinear),
}

impl TpLinear {
    /// Load `weight` of shape `(out_features, in_features)` from `vb`.
    pub fn new(
        in_features: usize,
        out_features: usize,
        vb: VarBuilder,
        ctx: &TpContext,
    ) -> Result<Self> {
        if ctx.is_single() {
            Ok(Self::Regular(candle_nn::linear_no_bias(
                in_features,
                out_features,
                vb,
            )?))
        } else {
            ColumnParallelLinear::new(in_features, out_features, vb, ctx.process_group())
                .map(Self::ColumnParallel)
                .map_err(|e| candle_core::Error::Msg(format!("column parallel load: {e}")))
        }
    }

    pub fn forward(&self, xs: &Tensor, ctx: &TpContext) -> Result<Tensor> {
        match self {
            Self::Regular(linear) => linear.forward(xs),
            Self::ColumnParallel(layer) => layer
                .forward(xs, ctx.comm())
                .map_err(|e| candle_core::Error::Msg(format!("column parallel: {e}"))),
        }
    }
}

/// Token-id lookup `ids[...] -> (..., hidden)`.
pub enum TpEmbedding {
    Regular(Embedding),
    VocabParallel(VocabParallelEmbedding),
}

impl TpEmbedding {
    pub fn new(vocab_size: usize, hidden_size: usize, vb: VarBuilder, ctx: &TpContext) -> Result<Self> {
        if ctx.is_single() {
            Ok(Self::Regular(candle_nn::embedding(
                vocab_size,
                hidden_size,
                vb,
            )?))
        } else {
            VocabParallelEmbedding::new(vocab_size, hidden_size, vb, ctx.process_group())
                .map(Self::VocabParallel)
                .map_err(|e| candle_core::Error::Msg(format!("vocab parallel load: {e}")))
        }
    }

    pub fn forward(&self, ids: &Tensor, ctx: &TpContext) -> Result<Tensor> {
        match self {
            Self::Regular(emb) => emb.forward(ids),
            Self::VocabParallel(emb) => emb
                .forward(ids, ctx.comm())
                .map_err(|e| candle_core::Error::Msg(format!("vocab parallel: {e}"))),
        }
    }
}
