use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::error::{Error, Result};

/// Splits a dataset of `len` items into equal-length, disjoint-by-position
/// shards, one per rank.
///
/// The permutation depends only on `seed + epoch`, so every rank computes the
/// same global order without communicating. Shards are padded by repeating
/// indices from the start of the permutation until the total is a multiple of
/// the world size.
#[derive(Debug, Clone)]
pub struct DistributedSampler {
    len: usize,
    rank: usize,
    world_size: usize,
    seed: u64,
    shuffle: bool,
}

impl DistributedSampler {
    pub fn new(len: usize, rank: usize, world_size: usize, seed: u64, shuffle: bool) -> Result<Self> {
        if len == 0 {
            return Err(Error::Config("cannot partition an empty dataset".into()));
        }
        if world_size == 0 || rank >= world_size {
            return Err(Error::Config(format!(
                "rank {} out of range for world size {}",
                rank, world_size
            )));
        }
        Ok(Self {
            len,
            rank,
            world_size,
            seed,
            shuffle,
        })
    }

    pub fn num_samples(&self) -> usize {
        self.len.div_ceil(self.world_size)
    }

    pub fn total_size(&self) -> usize {
        self.num_samples() * self.world_size
    }

    /// Indices this rank visits during `epoch`.
    pub fn shard(&self, epoch: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.len).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }

        // Cyclic padding also covers datasets smaller than the world.
        let padding = self.total_size() - self.len;
        for i in 0..padding {
            order.push(order[i % self.len]);
        }

        order
            .into_iter()
            .skip(self.rank)
            .step_by(self.world_size)
            .collect()
    }

    /// The shard cut into minibatches; every rank gets the same batch count
    /// and the same length for the trailing batch.
    pub fn batches(&self, epoch: usize, batch_size: usize) -> Vec<Vec<usize>> {
        self.shard(epoch)
            .chunks(batch_size.max(1))
            .map(|c| c.to_vec())
            .collect()
    }

    pub fn num_batches(&self, batch_size: usize) -> usize {
        self.num_samples().div_ceil(batch_size.max(1))
    }
}
