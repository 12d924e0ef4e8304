//! Language-model head with an attached MLP speculator.
//!
//! Every call produces the base model's logits. When the batch is small
//! enough the greedy next token of each row is fed to the speculator, and its
//! per-head distributions ride along with the logits.
//!
//! Weight paths:
//!   `lm_head.weight`  base vocabulary projection `(vocab, emb_dim)`
//!   `speculator.*`    see [`MlpSpeculator`]

use candle_core::{Tensor, D};
use candle_nn::VarBuilder;

use crate::config::{SpeculationConfig, SpeculatorConfig};
use crate::error::{Result, SpeculatorError};
use crate::models::mlp_speculator::MlpSpeculator;
use crate::models::tp_layers::{TpContext, TpLinear};

/// Result of one [`SpeculatorHead::forward`] call.
#[derive(Debug, Clone)]
pub struct SpeculatorHeadOutput {
    /// `[batch, vocab]`
    pub logits: Tensor,
    /// `[batch, n_predict, vocab]`, absent when speculation was skipped.
    pub speculative: Option<Tensor>,
}

pub struct SpeculatorHead {
    lm_head: TpLinear,
    speculator: MlpSpeculator,
    max_batch_for_speculation: usize,
    ctx: TpContext,
}

impl SpeculatorHead {
    pub fn new(
        lm_head: TpLinear,
        speculator: MlpSpeculator,
        max_batch_for_speculation: usize,
        ctx: TpContext,
    ) -> Self {
        Self {
            lm_head,
            speculator,
            max_batch_for_speculation,
            ctx,
        }
    }

    /// Load `lm_head` and the speculator from a root var builder.
    pub fn load(
        cfg: &SpeculatorConfig,
        policy: &SpeculationConfig,
        vb: VarBuilder,
        ctx: TpContext,
    ) -> Result<Self> {
        let speculator = MlpSpeculator::new(cfg, policy, vb.pp("speculator"), ctx.clone())?;
        let lm_head = TpLinear::new(cfg.emb_dim, cfg.vocab_size, vb.pp("lm_head"), &ctx)?;
        Ok(Self::new(
            lm_head,
            speculator,
            policy.max_batch_for_speculation,
            ctx,
        ))
    }

    /// `hidden_states`: `[batch, emb_dim]`
    pub fn forward(&self, hidden_states: &Tensor) -> Result<SpeculatorHeadOutput> {
        let batch = match hidden_states.dims() {
            &[batch, dim] if dim == self.speculator.emb_dim() => batch,
            other => {
                return Err(SpeculatorError::shape(format!(
                    "hidden states must be [batch, {}], got {other:?}",
                    self.speculator.emb_dim()
                )))
            }
        };
        let logits = self.lm_head.forward(hidden_states, &self.ctx)?;

        if batch > self.max_batch_for_speculation {
            tracing::debug!(
                batch,
                threshold = self.max_batch_for_speculation,
                "batch too large, skipping speculation"
            );
            return Ok(SpeculatorHeadOutput {
                logits,
                speculative: None,
            });
        }

        let next_ids = logits.argmax(D::Minus1)?;
        let speculative = self.speculator.forward(hidden_states, &next_ids)?;
        Ok(SpeculatorHeadOutput {
            logits,
            speculative: Some(speculative),
        })
    }

    pub fn speculator(&self) -> &MlpSpeculator {
        &self.speculator
    }

    pub fn speculator_mut(&mut self) -> &mut MlpSpeculator {
        &mut self.speculator
    }

    pub fn max_batch_for_speculation(&self) -> usize {
        self.max_batch_for_speculation
    }
}
