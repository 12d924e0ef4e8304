use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;

use crate::config::SpeculatorConfig;

/// Smooth, non-constant values so distinct tokens get distinct logits and
/// argmax ties are practically impossible.
fn pattern(shape: &[usize], salt: f32, scale: f32) -> Tensor {
    let len: usize = shape.iter().product();
    let data: Vec<f32> = (0..len)
        .map(|i| ((i as f32) * 0.618_034 + salt).sin() * scale)
        .collect();
    // shape and data length agree by construction
    Tensor::from_vec(data, shape, &Device::Cpu).expect("synthetic tensor")
}

/// Every tensor an MLP speculator checkpoint for `cfg` contains, keyed by
/// full checkpoint name (`speculator.emb.0.weight`, ...).
pub fn synthetic_checkpoint(cfg: &SpeculatorConfig) -> HashMap<String, Tensor> {
    let inner = cfg.inner_dim();
    let vocab = cfg.vocab_size;
    let n = cfg.n_predict;
    let mut tensors = HashMap::new();
    let mut put = |name: String, t: Tensor| {
        tensors.insert(format!("speculator.{name}"), t);
    };

    let (embeddings, projections, heads, norms) = if cfg.tie_weights {
        (1, n.min(2), 1, 1)
    } else {
        (n, n, n, n)
    };

    for i in 0..embeddings {
        let salt = 1.0 + i as f32;
        put(format!("emb.{i}.weight"), pattern(&[vocab, inner], salt, 0.5));
    }
    for i in 0..projections {
        let in_dim = if i == 0 { cfg.emb_dim } else { inner };
        let scale = 1.0 / (in_dim as f32).sqrt();
        put(format!("proj.{i}.weight"), pattern(&[inner, in_dim], 10.0 + i as f32, scale));
    }
    for i in 0..heads {
        let scale = 2.0 / (inner as f32).sqrt();
        put(format!("head.{i}.weight"), pattern(&[vocab, inner], 20.0 + i as f32, scale));
    }
    for i in 0..norms {
        let weight = (pattern(&[inner], 30.0 + i as f32, 0.1) + 1.0).expect("norm weight");
        put(format!("ln.{i}.weight"), weight);
        put(format!("ln.{i}.bias"), pattern(&[inner], 40.0 + i as f32, 0.01));
    }
    tensors
}

/// `lm_head.weight` of a base model matching `cfg`.
pub fn lm_head_weight(cfg: &SpeculatorConfig) -> Tensor {
    pattern(&[cfg.vocab_size, cfg.emb_dim], 50.0, 1.0 / (cfg.emb_dim as f32).sqrt())
}

/// Root var builder over [`synthetic_checkpoint`] plus `lm_head.weight`.
pub fn synthetic_var_builder(cfg: &SpeculatorConfig) -> VarBuilder<'static> {
    let mut tensors = synthetic_checkpoint(cfg);
    tensors.insert("lm_head.weight".to_string(), lm_head_weight(cfg));
    VarBuilder::from_tensors(tensors, DType::F32, &Device::Cpu)
}

/// Write `tensors` as a safetensors file at `path`.
pub fn write_safetensors(tensors: &HashMap<String, Tensor>, path: &Path) -> candle_core::Result<()> {
    candle_core::safetensors::save(tensors, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::tiny_speculator_config;

    #[test]
    fn tied_checkpoint_names() {
        let cfg = tiny_speculator_config(true, false);
        let mut names: Vec<String> = synthetic_checkpoint(&cfg).into_keys().collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "speculator.emb.0.weight",
                "speculator.head.0.weight",
                "speculator.ln.0.bias",
                "speculator.ln.0.weight",
                "speculator.proj.0.weight",
                "speculator.proj.1.weight",
            ]
        );
    }

    #[test]
    fn untied_checkpoint_has_every_head() {
        let cfg = tiny_speculator_config(false, false);
        let tensors = synthetic_checkpoint(&cfg);
        assert_eq!(tensors.len(), 5 * cfg.n_predict);
        assert_eq!(tensors["speculator.proj.0.weight"].dims(), &[cfg.inner_dim(), cfg.emb_dim]);
        assert_eq!(tensors["speculator.proj.3.weight"].dims(), &[cfg.inner_dim(), cfg.inner_dim()]);
    }
}
