//! Indexed access to transformed volumes.

use std::sync::Arc;

use candle_core::Device;
use rand::{rngs::StdRng, SeedableRng};
use rayon::prelude::*;

use crate::{
    datalist::DataItem,
    error::{DataError, Result},
    transforms::{Compose, VolumeTransform},
    volume::Volume,
};

pub trait Dataset: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Loads and transforms item `index`, drawing randomness from `rng`.
    fn get(&self, index: usize, rng: &mut StdRng) -> Result<Volume>;
}

fn check_index(index: usize, len: usize) -> Result<()> {
    if index < len {
        Ok(())
    } else {
        Err(DataError::OutOfRange { index, len })
    }
}

/// Reads every volume from disk and runs the full pipeline on each access.
pub struct VolumeDataset {
    items: Vec<DataItem>,
    transform: Arc<Compose>,
    device: Device,
}

impl VolumeDataset {
    pub fn new(items: Vec<DataItem>, transform: Arc<Compose>, device: Device) -> Self {
        Self {
            items,
            transform,
            device,
        }
    }

    pub fn items(&self) -> &[DataItem] {
        &self.items
    }
}

impl Dataset for VolumeDataset {
    fn len(&self) -> usize {
        self.items.len()
    }

    fn get(&self, index: usize, rng: &mut StdRng) -> Result<Volume> {
        check_index(index, self.items.len())?;
        let volume = Volume::load(&self.items[index], &self.device)?;
        self.transform.apply(volume, rng)
    }
}

/// Keeps the output of the deterministic head of the pipeline in memory.
///
/// The first `min(cache_num, floor(len * cache_rate))` items are loaded and
/// run up to the first random transform at construction; accesses replay
/// only the random tail. Items past the cache take the full path.
pub struct CachedDataset {
    items: Vec<DataItem>,
    transform: Arc<Compose>,
    device: Device,
    cache: Vec<Volume>,
    split: usize,
}

impl CachedDataset {
    /// `workers > 1` fills the cache on a dedicated thread pool.
    pub fn new(
        items: Vec<DataItem>,
        transform: Arc<Compose>,
        cache_num: usize,
        cache_rate: f32,
        workers: usize,
        device: Device,
    ) -> Result<Self> {
        let by_rate = (items.len() as f64 * f64::from(cache_rate)) as usize;
        let cache_len = cache_num.min(by_rate).min(items.len());
        let split = transform.first_random();

        let prepare = |item: &DataItem| -> Result<Volume> {
            let volume = Volume::load(item, &device)?;
            // Deterministic transforms ignore the generator.
            let mut rng = StdRng::seed_from_u64(0);
            transform.apply_range(volume, 0, split, &mut rng)
        };
        let head = &items[..cache_len];
        let cache = if workers > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(workers)
                .build()
                .map_err(|err| DataError::Workers(err.to_string()))?;
            pool.install(|| head.par_iter().map(prepare).collect::<Result<Vec<_>>>())?
        } else {
            head.iter().map(prepare).collect::<Result<Vec<_>>>()?
        };
        log::info!(
            "cached {} of {} volumes ({} deterministic transforms)",
            cache.len(),
            items.len(),
            split
        );

        Ok(Self {
            items,
            transform,
            device,
            cache,
            split,
        })
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }
}

impl Dataset for CachedDataset {
    fn len(&self) -> usize {
        self.items.len()
    }

    fn get(&self, index: usize, rng: &mut StdRng) -> Result<Volume> {
        check_index(index, self.items.len())?;
        match self.cache.get(index) {
            Some(volume) => {
                log::debug!("cache hit for item {index}");
                self.transform
                    .apply_range(volume.clone(), self.split, self.transform.len(), rng)
            }
            None => {
                log::debug!("cache miss for item {index}");
                let volume = Volume::load(&self.items[index], &self.device)?;
                self.transform.apply(volume, rng)
            }
        }
    }
}
