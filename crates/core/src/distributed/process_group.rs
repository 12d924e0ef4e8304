//! Rank bookkeeping for a group of workers sharing one speculator.

use super::error::{DistributedError, Result};

/// A set of workers that jointly compute each sharded projection.
pub trait ProcessGroup: Send + Sync {
    /// Rank of this worker (0..world_size).
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    fn is_single(&self) -> bool {
        self.world_size() == 1
    }
}

/// In-process group. With the default constructor the group has one member
/// and every collective is the identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalProcessGroup {
    rank: usize,
    world_size: usize,
}

impl LocalProcessGroup {
    pub fn new() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }

    /// Group that pretends to be one rank out of `world_size`, for exercising
    /// sharding logic on a single device.
    pub fn with_rank(rank: usize, world_size: usize) -> Result<Self> {
        if rank >= world_size {
            return Err(DistributedError::InvalidRank { rank, world_size });
        }
        Ok(Self { rank, world_size })
    }
}

impl Default for LocalProcessGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessGroup for LocalProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_group_is_single_rank_zero() {
        let pg = LocalProcessGroup::default();
        assert_eq!(pg.rank(), 0);
        assert_eq!(pg.world_size(), 1);
        assert!(pg.is_single());
    }

    #[test]
    fn with_rank_reports_membership() {
        let pg = LocalProcessGroup::with_rank(1, 2).unwrap();
        assert_eq!(pg.rank(), 1);
        assert!(!pg.is_single());
    }

    #[test]
    fn rank_out_of_range_is_an_error() {
        let err = LocalProcessGroup::with_rank(4, 4).unwrap_err();
        assert!(matches!(
            err,
            DistributedError::InvalidRank {
                rank: 4,
                world_size: 4
            }
        ));
    }
}
