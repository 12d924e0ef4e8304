//! Sharded projection and embedding layers.
//!
//! Checkpoints store full tensors; each rank loads the full tensor and keeps
//! its own slice:
//! - [`ColumnParallelLinear`] keeps rows `[rank * out/ws, (rank + 1) * out/ws)`
//!   of the `(out, in)` weight and gathers the partial outputs.
//! - [`VocabParallelEmbedding`] keeps a contiguous range of vocabulary rows,
//!   zeroes lookups that fall outside it and sums across ranks.

use candle_core::{DType, IndexOp, Tensor};
use candle_nn::VarBuilder;

use super::communicator::DeviceCommunicator;
use super::error::{DistributedError, Result};
use super::process_group::ProcessGroup;

/// Bias-free linear layer split along its output features.
pub struct ColumnParallelLinear {
    /// `[out_features / world_size, in_features]`
    weight: Tensor,
    world_size: usize,
    rank: usize,
}

impl ColumnParallelLinear {
    pub fn new(
        in_features: usize,
        out_features: usize,
        vb: VarBuilder,
        pg: &dyn ProcessGroup,
    ) -> Result<Self> {
        let world_size = pg.world_size();
        let rank = pg.rank();
        if out_features % world_size != 0 {
            return Err(DistributedError::Indivisible {
                what: "out_features",
                size: out_features,
                world_size,
            });
        }
        let shard = out_features / world_size;
        let full = vb.get((out_features, in_features), "weight")?;
        let weight = full.i(rank * shard..(rank + 1) * shard)?.contiguous()?;
        Ok(Self {
            weight,
            world_size,
            rank,
        })
    }

    /// Wrap an already-sharded weight.
    pub fn from_shard(weight: Tensor, world_size: usize, rank: usize) -> Self {
        Self {
            weight,
            world_size,
            rank,
        }
    }

    /// `input[..., in] -> output[..., out]`, gathered across ranks.
    pub fn forward(&self, input: &Tensor, comm: &dyn DeviceCommunicator) -> Result<Tensor> {
        let dims = input.dims().to_vec();
        let (in_features, lead) = match dims.split_last() {
            Some((last, lead)) => (*last, lead),
            None => {
                return Err(DistributedError::ShapeMismatch {
                    expected: vec![self.weight.dim(1)?],
                    actual: dims,
                })
            }
        };
        let rows: usize = lead.iter().product();

        let flat = input.reshape((rows, in_features))?;
        let mut out = flat.matmul(&self.weight.t()?)?;
        if self.world_size > 1 {
            out = comm.all_gather(&out, 1)?;
        }

        let mut out_shape = lead.to_vec();
        out_shape.push(out.dim(1)?);
        Ok(out.reshape(out_shape)?)
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }
}

/// Embedding table split along the vocabulary.
pub struct VocabParallelEmbedding {
    /// `[vocab_end - vocab_start, hidden]`
    embeddings: Tensor,
    world_size: usize,
    vocab_start: usize,
    vocab_end: usize,
}

impl VocabParallelEmbedding {
    pub fn new(
        vocab_size: usize,
        hidden_size: usize,
        vb: VarBuilder,
        pg: &dyn ProcessGroup,
    ) -> Result<Self> {
        let full = vb.get((vocab_size, hidden_size), "weight")?;
        Self::from_full(&full, pg.world_size(), pg.rank())
    }

    /// Keep this rank's slice of a full `(vocab, hidden)` table.
    pub fn from_full(full: &Tensor, world_size: usize, rank: usize) -> Result<Self> {
        let vocab_size = full.dim(0)?;
        let per_rank = vocab_size.div_ceil(world_size);
        let vocab_start = (rank * per_rank).min(vocab_size);
        let vocab_end = ((rank + 1) * per_rank).min(vocab_size);
        let embeddings = full.i(vocab_start..vocab_end)?.contiguous()?;
        Ok(Self {
            embeddings,
            world_size,
            vocab_start,
            vocab_end,
        })
    }

    /// `ids[...] -> embeddings[..., hidden]`
    pub fn forward(&self, ids: &Tensor, comm: &dyn DeviceCommunicator) -> Result<Tensor> {
        let hidden = self.embeddings.dim(1)?;
        let mut out_shape = ids.dims().to_vec();
        out_shape.push(hidden);
        let flat = ids.flatten_all()?;

        if self.world_size == 1 {
            let out = self.embeddings.embedding(&flat)?;
            return Ok(out.reshape(out_shape)?);
        }

        let device = self.embeddings.device();
        let ids_i64 = flat.to_dtype(DType::I64)?;
        let start = Tensor::new(&[self.vocab_start as i64], device)?.broadcast_as(ids_i64.shape())?;
        let end = Tensor::new(&[self.vocab_end as i64], device)?.broadcast_as(ids_i64.shape())?;

        // 1 where the id belongs to this rank's slice
        let owned = ids_i64.ge(&start)?.mul(&ids_i64.lt(&end)?)?;

        let last_local = (self.vocab_end - self.vocab_start).saturating_sub(1) as i64;
        let local = (ids_i64 - &start)?
            .clamp(0i64, last_local)?
            .to_dtype(DType::U32)?;

        let rows = self.embeddings.embedding(&local)?;
        let mask = owned.to_dtype(self.embeddings.dtype())?.unsqueeze(1)?;
        let partial = rows.broadcast_mul(&mask)?;

        let out = comm.all_reduce(&partial)?;
        Ok(out.reshape(out_shape)?)
    }

    pub fn embeddings(&self) -> &Tensor {
        &self.embeddings
    }

    pub fn vocab_range(&self) -> (usize, usize) {
        (self.vocab_start, self.vocab_end)
    }
}
