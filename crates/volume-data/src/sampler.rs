//! Sharding of dataset indices across distributed replicas.

use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};

use crate::error::{DataError, Result};

/// Splits `0..dataset_len` into `num_replicas` interleaved shards.
///
/// Every replica sees `ceil(len / replicas)` indices when `make_even` is
/// set: the index list is padded to `total_size` with its own head when the
/// shortfall is smaller than the list, otherwise with indices resampled from
/// the epoch generator. Shuffling is seeded by the epoch, so all replicas
/// agree on the permutation.
#[derive(Debug, Clone)]
pub struct DistributedSampler {
    dataset_len: usize,
    num_replicas: usize,
    rank: usize,
    shuffle: bool,
    make_even: bool,
    epoch: u64,
    num_samples: usize,
    total_size: usize,
    valid_length: usize,
}

impl DistributedSampler {
    pub fn new(
        dataset_len: usize,
        num_replicas: usize,
        rank: usize,
        shuffle: bool,
        make_even: bool,
    ) -> Result<Self> {
        if num_replicas == 0 {
            return Err(DataError::sampler("num_replicas must be greater than 0"));
        }
        if rank >= num_replicas {
            return Err(DataError::sampler(format!(
                "rank {rank} is out of range for {num_replicas} replicas"
            )));
        }
        let num_samples = dataset_len.div_ceil(num_replicas);
        let valid_length = if rank < dataset_len {
            (dataset_len - rank).div_ceil(num_replicas)
        } else {
            0
        };
        Ok(Self {
            dataset_len,
            num_replicas,
            rank,
            shuffle,
            make_even,
            epoch: 0,
            num_samples,
            total_size: num_samples * num_replicas,
            valid_length,
        })
    }

    pub fn set_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn num_replicas(&self) -> usize {
        self.num_replicas
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Shard length before padding.
    pub fn valid_length(&self) -> usize {
        self.valid_length
    }

    /// Number of indices [`indices`](Self::indices) yields.
    pub fn shard_len(&self) -> usize {
        if self.make_even {
            self.num_samples
        } else {
            self.valid_length
        }
    }

    /// This replica's indices for the current epoch.
    pub fn indices(&self) -> Vec<usize> {
        let mut rng = StdRng::seed_from_u64(self.epoch);
        let len = self.dataset_len;
        let mut indices: Vec<usize> = (0..len).collect();
        if self.shuffle {
            indices.shuffle(&mut rng);
        }

        if self.make_even && len < self.total_size {
            let deficit = self.total_size - len;
            if deficit < len {
                indices.extend_from_within(..deficit);
            } else {
                for _ in 0..deficit {
                    let pick = indices[rng.gen_range(0..len)];
                    indices.push(pick);
                }
            }
        }

        indices
            .into_iter()
            .take(self.total_size)
            .skip(self.rank)
            .step_by(self.num_replicas)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_deficit_repeats_the_head() -> Result<()> {
        let shards: Vec<Vec<usize>> = (0..3)
            .map(|rank| DistributedSampler::new(10, 3, rank, false, true).map(|s| s.indices()))
            .collect::<Result<_>>()?;
        assert_eq!(shards[0], vec![0, 3, 6, 9]);
        assert_eq!(shards[1], vec![1, 4, 7, 0]);
        assert_eq!(shards[2], vec![2, 5, 8, 1]);
        Ok(())
    }

    #[test]
    fn valid_length_counts_unpadded_indices() -> Result<()> {
        let lengths: Vec<usize> = (0..3)
            .map(|rank| DistributedSampler::new(10, 3, rank, true, true).map(|s| s.valid_length()))
            .collect::<Result<_>>()?;
        assert_eq!(lengths, vec![4, 3, 3]);
        Ok(())
    }

    #[test]
    fn without_make_even_shards_stay_uneven() -> Result<()> {
        let sampler = DistributedSampler::new(10, 3, 1, false, false)?;
        assert_eq!(sampler.indices(), vec![1, 4, 7]);
        assert_eq!(sampler.shard_len(), 3);
        Ok(())
    }

    #[test]
    fn large_deficit_resamples_existing_indices() -> Result<()> {
        for rank in 0..5 {
            let sampler = DistributedSampler::new(2, 5, rank, true, true)?;
            let shard = sampler.indices();
            assert_eq!(shard.len(), 1);
            assert!(shard[0] < 2);
        }
        Ok(())
    }

    #[test]
    fn shuffled_shards_partition_the_dataset() -> Result<()> {
        let mut seen: Vec<usize> = Vec::new();
        for rank in 0..4 {
            let mut sampler = DistributedSampler::new(12, 4, rank, true, true)?;
            sampler.set_epoch(3);
            seen.extend(sampler.indices());
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..12).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn epoch_controls_the_permutation() -> Result<()> {
        let mut sampler = DistributedSampler::new(32, 1, 0, true, true)?;
        let first = sampler.indices();
        assert_eq!(first, sampler.indices());
        sampler.set_epoch(1);
        assert_ne!(first, sampler.indices());
        Ok(())
    }

    #[test]
    fn invalid_topology_is_rejected() {
        assert!(matches!(
            DistributedSampler::new(4, 0, 0, false, true),
            Err(DataError::Sampler(_))
        ));
        assert!(matches!(
            DistributedSampler::new(4, 2, 2, false, true),
            Err(DataError::Sampler(_))
        ));
    }
}
