use crate::config::SpeculatorConfig;

pub const TINY_VOCAB: usize = 64;
pub const TINY_EMB_DIM: usize = 24;
pub const TINY_INNER_DIM: usize = 16;
pub const TINY_N_PREDICT: usize = 4;

/// Four-head speculator small enough to run many forwards per test.
/// `emb_dim` differs from `inner_dim` so a swapped projection fails loudly.
pub fn tiny_speculator_config(tie_weights: bool, scale_input: bool) -> SpeculatorConfig {
    SpeculatorConfig {
        vocab_size: TINY_VOCAB,
        emb_dim: TINY_EMB_DIM,
        inner_dim: TINY_INNER_DIM,
        n_predict: TINY_N_PREDICT,
        tie_weights,
        scale_input,
        extra: serde_json::Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiny_config_is_valid() {
        let cfg = tiny_speculator_config(true, true);
        cfg.validate().expect("valid");
        assert_ne!(cfg.inner_dim(), cfg.emb_dim);
        assert!(cfg.tie_weights && cfg.scale_input);
    }
}
