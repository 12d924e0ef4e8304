//! MLP speculator: predicts N future tokens from one base-model hidden state.
//!
//! Each head blends the previous head's state with the embedding of the
//! current candidate token, normalizes, applies GELU and projects to the
//! vocabulary:
//!
//! ```text
//! z      = emb[i](ids) * emb_weight * sqrt(inner_dim / 2)
//! state  = gelu(ln[i](proj[i](state) * state_weight + z))
//! probs  = softmax(head[i](state))
//! ```
//!
//! The top `k[i]` tokens of every candidate row become the candidates of head
//! `i + 1`, so rows multiply as `prod(k[..=i])`.
//!
//! Reference: "Accelerating Production LLMs with Combined Token/Embedding
//! Speculators" (https://arxiv.org/pdf/2404.19124)

use std::f64::consts::SQRT_2;

use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::VarBuilder;

use crate::config::{SpeculationConfig, SpeculatorConfig};
use crate::error::{Result, SpeculatorError};
use crate::layers::normalization::{affine_rms_norm, AffineRmsNorm};
use crate::models::tp_layers::{TpContext, TpEmbedding, TpLinear};

// ─── Mixing weights ─────────────────────────────────────────────────────────

/// Weights of the state/embedding blend.
///
/// `state^2 + embed^2 = 1`, and `state^N = sqrt(0.5)`: by the last head the
/// original hidden state carries half of the signal energy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MixingWeights {
    pub state: f64,
    pub embed: f64,
}

impl MixingWeights {
    pub fn for_heads(n_predict: usize) -> Self {
        let state = 0.5f64.powf(0.5 / n_predict as f64);
        let embed = (1.0 - state * state).sqrt();
        Self { state, embed }
    }
}

// ─── Head parameters ────────────────────────────────────────────────────────

/// Indices of the parameters used by one head.
///
/// Tied heads point at the same owned instance; nothing is mutated after
/// construction, so sharing needs no synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadSlot {
    pub embedding: usize,
    pub state_projection: usize,
    pub output_projection: usize,
    pub norm: usize,
}

/// Number of distinct owned parameter sets of each kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterCounts {
    pub embeddings: usize,
    pub state_projections: usize,
    pub output_projections: usize,
    pub norms: usize,
}

#[derive(Debug, Clone, Copy)]
struct Dims {
    vocab: usize,
    emb: usize,
    inner: usize,
}

struct HeadParameters {
    embeddings: Vec<TpEmbedding>,
    state_projections: Vec<TpLinear>,
    output_projections: Vec<TpLinear>,
    norms: Vec<AffineRmsNorm>,
    slots: Vec<HeadSlot>,
}

impl HeadParameters {
    /// One embedding, head and norm for every step; `proj.0` for step 0 and
    /// `proj.1` for all later steps.
    fn tied(n_predict: usize, dims: Dims, eps: f64, vb: &VarBuilder, ctx: &TpContext) -> Result<Self> {
        let embeddings = vec![TpEmbedding::new(dims.vocab, dims.inner, vb.pp("emb.0"), ctx)?];

        let mut state_projections = vec![TpLinear::new(dims.emb, dims.inner, vb.pp("proj.0"), ctx)?];
        if n_predict > 1 {
            state_projections.push(TpLinear::new(dims.inner, dims.inner, vb.pp("proj.1"), ctx)?);
        }

        let output_projections = vec![TpLinear::new(dims.inner, dims.vocab, vb.pp("head.0"), ctx)?];
        let norms = vec![affine_rms_norm(dims.inner, eps, vb.pp("ln.0"))?];

        let slots = (0..n_predict)
            .map(|i| HeadSlot {
                embedding: 0,
                state_projection: i.min(1),
                output_projection: 0,
                norm: 0,
            })
            .collect();

        Ok(Self {
            embeddings,
            state_projections,
            output_projections,
            norms,
            slots,
        })
    }

    fn untied(n_predict: usize, dims: Dims, eps: f64, vb: &VarBuilder, ctx: &TpContext) -> Result<Self> {
        let mut embeddings = Vec::with_capacity(n_predict);
        let mut state_projections = Vec::with_capacity(n_predict);
        let mut output_projections = Vec::with_capacity(n_predict);
        let mut norms = Vec::with_capacity(n_predict);

        for i in 0..n_predict {
            let in_dim = if i == 0 { dims.emb } else { dims.inner };
            embeddings.push(TpEmbedding::new(dims.vocab, dims.inner, vb.pp(format!("emb.{i}")), ctx)?);
            state_projections.push(TpLinear::new(in_dim, dims.inner, vb.pp(format!("proj.{i}")), ctx)?);
            output_projections.push(TpLinear::new(dims.inner, dims.vocab, vb.pp(format!("head.{i}")), ctx)?);
            norms.push(affine_rms_norm(dims.inner, eps, vb.pp(format!("ln.{i}")))?);
        }

        let slots = (0..n_predict)
            .map(|i| HeadSlot {
                embedding: i,
                state_projection: i,
                output_projection: i,
                norm: i,
            })
            .collect();

        Ok(Self {
            embeddings,
            state_projections,
            output_projections,
            norms,
            slots,
        })
    }

    fn counts(&self) -> ParameterCounts {
        ParameterCounts {
            embeddings: self.embeddings.len(),
            state_projections: self.state_projections.len(),
            output_projections: self.output_projections.len(),
            norms: self.norms.len(),
        }
    }
}

// ─── Forward bookkeeping ────────────────────────────────────────────────────

/// What one head saw and selected.
#[derive(Debug, Clone)]
pub struct HeadStep {
    /// Candidate rows per original batch row when this head ran.
    pub multiplicity: usize,
    /// Full distribution of every candidate row, `[batch * multiplicity, vocab]`.
    pub probs: Tensor,
    /// Tokens fed to the next head, `[batch * multiplicity * k]`.
    /// Row `r * k + j` holds the `j`-th best token of candidate row `r`.
    pub candidate_ids: Tensor,
}

/// Output of [`MlpSpeculator::forward_with_trace`].
#[derive(Debug, Clone)]
pub struct SpeculationTrace {
    /// `[batch, n_predict, vocab]`
    pub all_probs: Tensor,
    pub steps: Vec<HeadStep>,
}

/// Candidate rows flowing between heads. Layout is batch-major: row `r`
/// belongs to original batch row `r / multiplicity`.
struct Candidates {
    state: Tensor,
    ids: Tensor,
    multiplicity: usize,
}

// ─── Model ──────────────────────────────────────────────────────────────────

pub struct MlpSpeculator {
    params: HeadParameters,
    /// Parameter-free norm applied once to the input when `scale_input` is set.
    input_norm: Option<AffineRmsNorm>,
    mixing: MixingWeights,
    /// `mixing.embed * sqrt(inner_dim / 2)`
    embed_scale: f64,
    top_k_per_head: Vec<usize>,
    n_predict: usize,
    emb_dim: usize,
    inner_dim: usize,
    vocab_size: usize,
    ctx: TpContext,
    device: Device,
}

impl MlpSpeculator {
    /// Build the speculator from weights rooted at the checkpoint's
    /// `speculator` prefix.
    ///
    /// The branching list is validated before any weight is read.
    pub fn new(
        cfg: &SpeculatorConfig,
        policy: &SpeculationConfig,
        vb: VarBuilder,
        ctx: TpContext,
    ) -> Result<Self> {
        cfg.validate()?;
        let n_predict = policy.n_predict(cfg);
        if n_predict == 0 {
            return Err(SpeculatorError::config("num_speculative_tokens must be >= 1"));
        }
        let top_k_per_head = policy.top_k_per_head(n_predict);
        if top_k_per_head.len() != n_predict {
            return Err(SpeculatorError::config(format!(
                "a top-k value is required for each head ({n_predict} heads, {} provided)",
                top_k_per_head.len()
            )));
        }
        check_top_k_values(&top_k_per_head, cfg.vocab_size)?;

        let dims = Dims {
            vocab: cfg.vocab_size,
            emb: cfg.emb_dim,
            inner: cfg.inner_dim(),
        };
        let params = if cfg.tie_weights {
            HeadParameters::tied(n_predict, dims, policy.norm_eps, &vb, &ctx)?
        } else {
            HeadParameters::untied(n_predict, dims, policy.norm_eps, &vb, &ctx)?
        };
        let input_norm = cfg
            .scale_input
            .then(|| AffineRmsNorm::plain(policy.norm_eps));

        let mixing = MixingWeights::for_heads(n_predict);
        let embed_scale = mixing.embed * (dims.inner as f64 / 2.0).sqrt();

        tracing::debug!(
            n_predict,
            tie_weights = cfg.tie_weights,
            scale_input = cfg.scale_input,
            inner_dim = dims.inner,
            state_weight = mixing.state,
            embed_weight = mixing.embed,
            "built MLP speculator"
        );

        Ok(Self {
            params,
            input_norm,
            mixing,
            embed_scale,
            top_k_per_head,
            n_predict,
            emb_dim: dims.emb,
            inner_dim: dims.inner,
            vocab_size: dims.vocab,
            ctx,
            device: vb.device().clone(),
        })
    }

    /// Per-head distributions `[batch, n_predict, vocab]`.
    ///
    /// - `hidden_states`: `[batch, emb_dim]`, last-position states of the base model
    /// - `input_ids`: `[batch]`, the most recently emitted token per row
    pub fn forward(&self, hidden_states: &Tensor, input_ids: &Tensor) -> Result<Tensor> {
        Ok(self.forward_with_trace(hidden_states, input_ids)?.all_probs)
    }

    /// Like [`forward`](Self::forward), also returning every candidate row's
    /// distribution and the tokens selected at each head.
    ///
    /// `all_probs[b, i]` is the distribution of candidate row
    /// `b * multiplicity_i`, the branch that took the best token at every
    /// earlier head. It is therefore the same for any branching list.
    pub fn forward_with_trace(
        &self,
        hidden_states: &Tensor,
        input_ids: &Tensor,
    ) -> Result<SpeculationTrace> {
        if self.top_k_per_head.len() != self.n_predict {
            return Err(SpeculatorError::shape(format!(
                "a top-k value is required for each head ({} heads, {} provided)",
                self.n_predict,
                self.top_k_per_head.len()
            )));
        }
        check_top_k_values(&self.top_k_per_head, self.vocab_size)?;
        let batch = self.check_inputs(hidden_states, input_ids)?;

        if batch == 0 {
            let all_probs = Tensor::zeros(
                (0, self.n_predict, self.vocab_size),
                DType::F32,
                hidden_states.device(),
            )?;
            return Ok(SpeculationTrace {
                all_probs,
                steps: Vec::new(),
            });
        }

        let state = match &self.input_norm {
            Some(norm) => (norm.forward(hidden_states)? / SQRT_2)?,
            None => hidden_states.clone(),
        };
        let mut cand = Candidates {
            state,
            ids: input_ids.to_dtype(DType::U32)?,
            multiplicity: 1,
        };

        let mut per_head = Vec::with_capacity(self.n_predict);
        let mut steps = Vec::with_capacity(self.n_predict);

        for (i, slot) in self.params.slots.iter().enumerate() {
            let k = self.top_k_per_head[i];
            let rows = batch * cand.multiplicity;
            if cand.state.dim(0)? != rows || cand.ids.dim(0)? != rows {
                return Err(SpeculatorError::shape(format!(
                    "head {i}: expected {rows} candidate rows, got state {:?} and ids {:?}",
                    cand.state.dims(),
                    cand.ids.dims()
                )));
            }
            tracing::trace!(head = i, rows, multiplicity = cand.multiplicity, k, "speculator head");

            let z = self.params.embeddings[slot.embedding].forward(&cand.ids, &self.ctx)?;
            let z = (z * self.embed_scale)?;
            let projected =
                self.params.state_projections[slot.state_projection].forward(&cand.state, &self.ctx)?;
            let mixed = ((projected * self.mixing.state)? + z)?;
            let state = self.params.norms[slot.norm].forward(&mixed)?.gelu_erf()?;

            let logits = self.params.output_projections[slot.output_projection]
                .forward(&state, &self.ctx)?
                .to_dtype(DType::F32)?;
            let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
            let probs = log_probs.exp()?;
            per_head.push(first_branch(&probs, batch, cand.multiplicity)?);

            let top = top_k_indices(&log_probs, k)?;
            let next_state = state
                .unsqueeze(1)?
                .broadcast_as((rows, k, self.inner_dim))?
                .contiguous()?
                .reshape((rows * k, self.inner_dim))?;
            let next_ids = top.flatten_all()?;

            steps.push(HeadStep {
                multiplicity: cand.multiplicity,
                probs,
                candidate_ids: next_ids.clone(),
            });
            cand = Candidates {
                state: next_state,
                ids: next_ids,
                multiplicity: cand.multiplicity * k,
            };
        }

        let all_probs = Tensor::stack(&per_head, 1)?;
        Ok(SpeculationTrace { all_probs, steps })
    }

    /// Greedy draft tokens `[batch, n_predict]`.
    pub fn propose(&self, hidden_states: &Tensor, input_ids: &Tensor) -> Result<Tensor> {
        let all_probs = self.forward(hidden_states, input_ids)?;
        Ok(all_probs.argmax(D::Minus1)?)
    }

    /// Replace the branching list. Checked on the next forward call.
    pub fn set_top_k_per_head(&mut self, top_k_per_head: Vec<usize>) {
        self.top_k_per_head = top_k_per_head;
    }

    fn check_inputs(&self, hidden_states: &Tensor, input_ids: &Tensor) -> Result<usize> {
        let (batch, dim) = match hidden_states.dims() {
            &[batch, dim] => (batch, dim),
            other => {
                return Err(SpeculatorError::shape(format!(
                    "hidden states must be [batch, {}], got {other:?}",
                    self.emb_dim
                )))
            }
        };
        if dim != self.emb_dim {
            return Err(SpeculatorError::shape(format!(
                "hidden size {dim} does not match emb_dim {}",
                self.emb_dim
            )));
        }
        if input_ids.dims() != [batch] {
            return Err(SpeculatorError::shape(format!(
                "input ids must be [{batch}], got {:?}",
                input_ids.dims()
            )));
        }
        if input_ids.dtype().is_float() {
            return Err(SpeculatorError::shape(format!(
                "input ids must be integers, got {:?}",
                input_ids.dtype()
            )));
        }
        Ok(batch)
    }

    pub fn n_predict(&self) -> usize {
        self.n_predict
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn emb_dim(&self) -> usize {
        self.emb_dim
    }

    pub fn inner_dim(&self) -> usize {
        self.inner_dim
    }

    pub fn top_k_per_head(&self) -> &[usize] {
        &self.top_k_per_head
    }

    pub fn mixing_weights(&self) -> MixingWeights {
        self.mixing
    }

    pub fn scales_input(&self) -> bool {
        self.input_norm.is_some()
    }

    pub fn head_slot(&self, head: usize) -> Option<HeadSlot> {
        self.params.slots.get(head).copied()
    }

    pub fn parameter_counts(&self) -> ParameterCounts {
        self.params.counts()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

fn check_top_k_values(top_k_per_head: &[usize], vocab_size: usize) -> Result<()> {
    for (head, &k) in top_k_per_head.iter().enumerate() {
        if k == 0 || k > vocab_size {
            return Err(SpeculatorError::config(format!(
                "top-k for head {head} must be in 1..={vocab_size}, got {k}"
            )));
        }
    }
    Ok(())
}

/// Rows `b * multiplicity` of `probs`: one distribution per original row.
fn first_branch(probs: &Tensor, batch: usize, multiplicity: usize) -> Result<Tensor> {
    if multiplicity == 1 {
        return Ok(probs.clone());
    }
    let vocab = probs.dim(1)?;
    Ok(probs
        .reshape((batch, multiplicity, vocab))?
        .narrow(1, 0, 1)?
        .squeeze(1)?)
}

/// Indices of the `k` largest entries per row, best first, as `[rows, k]` u32.
///
/// Equal values keep ascending vocabulary order. `k > 1` is selected on the
/// host so the order does not depend on the device's sort kernel.
fn top_k_indices(log_probs: &Tensor, k: usize) -> Result<Tensor> {
    if k == 1 {
        return Ok(log_probs.argmax_keepdim(D::Minus1)?.to_dtype(DType::U32)?);
    }

    let (rows, vocab) = log_probs.dims2()?;
    let host: Vec<Vec<f32>> = log_probs.to_device(&Device::Cpu)?.to_vec2()?;
    let mut selected = Vec::with_capacity(rows * k);
    for row in &host {
        let by_value = |a: &u32, b: &u32| {
            row[*b as usize]
                .total_cmp(&row[*a as usize])
                .then(a.cmp(b))
        };
        let mut idx: Vec<u32> = (0..vocab as u32).collect();
        if k < vocab {
            idx.select_nth_unstable_by(k - 1, by_value);
            idx.truncate(k);
        }
        idx.sort_by(by_value);
        selected.extend_from_slice(&idx);
    }
    Ok(Tensor::from_vec(selected, (rows, k), log_probs.device())?)
}

// ─── Tests ──────────────────────────────────────────────────────────────────
