use serde::{Deserialize, Serialize};

use crate::error::{Result, SpeculatorError};

/// Default batch size above which speculation is skipped.
pub const DEFAULT_MAX_BATCH_FOR_SPECULATION: usize = 128;

/// Default epsilon of the speculator's RMS normalizers.
pub const DEFAULT_NORM_EPS: f64 = 1e-6;

/// Shape description of an MLP speculator checkpoint (`config.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeculatorConfig {
    pub vocab_size: usize,
    /// Hidden size of the base model whose states the speculator consumes.
    #[serde(alias = "hidden_size")]
    pub emb_dim: usize,
    /// Width of the per-step state. Zero means "same as `emb_dim`".
    #[serde(default)]
    pub inner_dim: usize,
    pub n_predict: usize,
    #[serde(default)]
    pub tie_weights: bool,
    #[serde(default)]
    pub scale_input: bool,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl SpeculatorConfig {
    /// Per-step state width with the zero default resolved.
    pub fn inner_dim(&self) -> usize {
        if self.inner_dim == 0 {
            self.emb_dim
        } else {
            self.inner_dim
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_predict == 0 {
            return Err(SpeculatorError::config("n_predict must be >= 1"));
        }
        if self.vocab_size == 0 {
            return Err(SpeculatorError::config("vocab_size must be > 0"));
        }
        if self.emb_dim == 0 {
            return Err(SpeculatorError::config("emb_dim must be > 0"));
        }
        Ok(())
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(content)?;
        cfg.validate()?;
        Ok(cfg)
    }
}

impl Default for SpeculatorConfig {
    fn default() -> Self {
        // ibm-fms llama3-8b accelerator
        Self {
            vocab_size: 128256,
            emb_dim: 4096,
            inner_dim: 3072,
            n_predict: 4,
            tie_weights: true,
            scale_input: true,
            extra: serde_json::Map::new(),
        }
    }
}

/// Runtime speculation policy, independent of the checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeculationConfig {
    /// Number of heads to run. Defaults to the checkpoint's `n_predict`.
    #[serde(default)]
    pub num_speculative_tokens: Option<usize>,
    /// Branching factor per head. Defaults to one candidate per head.
    #[serde(default)]
    pub top_k_per_head: Option<Vec<usize>>,
    /// Batches larger than this skip speculation entirely.
    #[serde(default = "default_max_batch")]
    pub max_batch_for_speculation: usize,
    #[serde(default = "default_norm_eps")]
    pub norm_eps: f64,
}

fn default_max_batch() -> usize {
    DEFAULT_MAX_BATCH_FOR_SPECULATION
}

fn default_norm_eps() -> f64 {
    DEFAULT_NORM_EPS
}

impl Default for SpeculationConfig {
    fn default() -> Self {
        Self {
            num_speculative_tokens: None,
            top_k_per_head: None,
            max_batch_for_speculation: DEFAULT_MAX_BATCH_FOR_SPECULATION,
            norm_eps: DEFAULT_NORM_EPS,
        }
    }
}

impl SpeculationConfig {
    /// Number of heads to build for the given checkpoint.
    pub fn n_predict(&self, cfg: &SpeculatorConfig) -> usize {
        self.num_speculative_tokens.unwrap_or(cfg.n_predict)
    }

    /// Branching list for `n_predict` heads, all ones unless overridden.
    pub fn top_k_per_head(&self, n_predict: usize) -> Vec<usize> {
        self.top_k_per_head
            .clone()
            .unwrap_or_else(|| vec![1; n_predict])
    }
}
