//! Criterion benchmarks for the MLP speculator forward pass.
//!
//! Uses a llama3-accelerator-shaped model scaled down to fit comfortably on
//! CPU. Greedy and branching lists run on the same weights, so the gap is
//! the cost of candidate expansion alone.

use std::collections::HashMap;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use speculator_core::testing::synthetic_checkpoint;
use speculator_core::{MlpSpeculator, SpeculationConfig, SpeculatorConfig, TpContext};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const VOCAB: usize = 8_192;
const EMB_DIM: usize = 512;
const INNER_DIM: usize = 384;

fn bench_config() -> SpeculatorConfig {
    SpeculatorConfig {
        vocab_size: VOCAB,
        emb_dim: EMB_DIM,
        inner_dim: INNER_DIM,
        n_predict: 4,
        tie_weights: true,
        scale_input: true,
        extra: serde_json::Map::new(),
    }
}

fn build(top_k: Vec<usize>) -> MlpSpeculator {
    let cfg = bench_config();
    let tensors: HashMap<String, Tensor> = synthetic_checkpoint(&cfg);
    let vb = VarBuilder::from_tensors(tensors, DType::F32, &Device::Cpu);
    let policy = SpeculationConfig {
        top_k_per_head: Some(top_k),
        ..Default::default()
    };
    MlpSpeculator::new(&cfg, &policy, vb.pp("speculator"), TpContext::single_device())
        .expect("failed to build speculator")
}

fn make_inputs(batch: usize) -> (Tensor, Tensor) {
    let data: Vec<f32> = (0..batch * EMB_DIM)
        .map(|i| (i as f32 * 0.013).sin())
        .collect();
    let hidden = Tensor::from_vec(data, (batch, EMB_DIM), &Device::Cpu)
        .expect("failed to create hidden states");
    let ids: Vec<u32> = (0..batch as u32).map(|b| (b * 31) % VOCAB as u32).collect();
    let ids = Tensor::from_vec(ids, batch, &Device::Cpu).expect("failed to create ids");
    (hidden, ids)
}

// ---------------------------------------------------------------------------
// Forward benchmarks
// ---------------------------------------------------------------------------

fn bench_greedy_forward(c: &mut Criterion) {
    let mut group = c.benchmark_group("speculator_greedy");
    let model = build(vec![1, 1, 1, 1]);

    for &batch in &[1usize, 8, 32] {
        let (hidden, ids) = make_inputs(batch);
        group.bench_with_input(BenchmarkId::new("batch", batch), &batch, |b, _| {
            b.iter(|| model.forward(black_box(&hidden), black_box(&ids)).expect("forward"))
        });
    }
    group.finish();
}

fn bench_branching_forward(c: &mut Criterion) {
    let mut group = c.benchmark_group("speculator_branching");

    for top_k in [vec![2, 1, 1, 1], vec![4, 3, 2, 2]] {
        let label = top_k
            .iter()
            .map(|k| k.to_string())
            .collect::<Vec<_>>()
            .join("-");
        let model = build(top_k);
        let (hidden, ids) = make_inputs(4);
        group.bench_function(BenchmarkId::new("top_k", label), |b| {
            b.iter(|| model.forward(black_box(&hidden), black_box(&ids)).expect("forward"))
        });
    }
    group.finish();
}

criterion_group!(speculator, bench_greedy_forward, bench_branching_forward);
criterion_main!(speculator);
