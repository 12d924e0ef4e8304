//! Collectives used by the sharded speculator layers.

use candle_core::Tensor;

use super::error::Result;
use super::process_group::ProcessGroup;

/// Collective operations over a [`ProcessGroup`].
///
/// The speculator only needs two: vocab-sharded embeddings are combined with
/// `all_reduce`, column-sharded projections with `all_gather`.
pub trait DeviceCommunicator: Send + Sync {
    fn process_group(&self) -> &dyn ProcessGroup;

    /// Sum `tensor` elementwise across all ranks; every rank gets the result.
    fn all_reduce(&self, tensor: &Tensor) -> Result<Tensor>;

    /// Concatenate every rank's `tensor` along `dim`.
    fn all_gather(&self, tensor: &Tensor, dim: usize) -> Result<Tensor>;
}

/// Communicator for a [`LocalProcessGroup`](super::LocalProcessGroup).
///
/// With one rank both collectives are the identity. With a simulated group
/// the shapes match a real collective (gather replicates the local shard),
/// which is enough to validate shard bookkeeping without a second device.
pub struct LocalCommunicator<P: ProcessGroup> {
    process_group: P,
}

impl<P: ProcessGroup> LocalCommunicator<P> {
    pub fn new(process_group: P) -> Self {
        Self { process_group }
    }
}

impl<P: ProcessGroup> DeviceCommunicator for LocalCommunicator<P> {
    fn process_group(&self) -> &dyn ProcessGroup {
        &self.process_group
    }

    fn all_reduce(&self, tensor: &Tensor) -> Result<Tensor> {
        Ok(tensor.clone())
    }

    fn all_gather(&self, tensor: &Tensor, dim: usize) -> Result<Tensor> {
        if self.process_group.is_single() {
            return Ok(tensor.clone());
        }
        let shards: Vec<Tensor> = (0..self.process_group.world_size())
            .map(|_| tensor.clone())
            .collect();
        Ok(Tensor::cat(&shards, dim)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::LocalProcessGroup;
    use candle_core::{DType, Device};

    fn ones(shape: &[usize]) -> Tensor {
        Tensor::ones(shape, DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn single_rank_collectives_are_identity() {
        let comm = LocalCommunicator::new(LocalProcessGroup::new());
        let x = ones(&[2, 5]);

        assert_eq!(comm.all_reduce(&x).unwrap().dims(), &[2, 5]);
        assert_eq!(comm.all_gather(&x, 1).unwrap().dims(), &[2, 5]);
    }

    #[test]
    fn simulated_gather_grows_the_sharded_dim() {
        let pg = LocalProcessGroup::with_rank(0, 4).unwrap();
        let comm = LocalCommunicator::new(pg);

        let out = comm.all_gather(&ones(&[3, 8]), 1).unwrap();
        assert_eq!(out.dims(), &[3, 32]);
    }

    #[test]
    fn process_group_is_visible_through_trait() {
        let pg = LocalProcessGroup::with_rank(2, 8).unwrap();
        let comm = LocalCommunicator::new(pg);
        assert_eq!(comm.process_group().rank(), 2);
        assert_eq!(comm.process_group().world_size(), 8);
    }
}
