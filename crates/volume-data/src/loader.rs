//! Batching of dataset items, plus the train/validation/test loader setup.

use std::sync::Arc;

use candle_core::{Device, Tensor};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::{
    config::PipelineConfig,
    datalist::load_decathlon_datalist,
    dataset::{CachedDataset, Dataset, VolumeDataset},
    error::{DataError, Result},
    sampler::DistributedSampler,
    transforms::{eval_pipeline, train_pipeline},
    volume::Volume,
};

/// Stacked volumes: `image` is `[B, C, H, W, D]`; `label` is present when
/// every item has one.
#[derive(Debug, Clone)]
pub struct Batch {
    pub image: Tensor,
    pub label: Option<Tensor>,
    /// Dataset indices of the stacked items, in batch order.
    pub indices: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    fn stack(volumes: Vec<Volume>, indices: Vec<usize>) -> Result<Self> {
        let Some(first) = volumes.first() else {
            return Err(DataError::volume("cannot stack an empty batch"));
        };
        let shape = first.image.dims().to_vec();
        if let Some(other) = volumes.iter().find(|v| v.image.dims() != shape.as_slice()) {
            return Err(DataError::volume(format!(
                "batch items differ in shape: {:?} vs {:?}",
                shape,
                other.image.dims()
            )));
        }

        let labelled = volumes.iter().filter(|v| v.label.is_some()).count();
        if labelled != 0 && labelled != volumes.len() {
            return Err(DataError::volume(
                "either every batch item or none must carry a label",
            ));
        }

        let images: Vec<Tensor> = volumes.iter().map(|v| v.image.clone()).collect();
        let labels: Vec<Tensor> = volumes.into_iter().filter_map(|v| v.label).collect();
        let label = if labels.is_empty() {
            None
        } else {
            Some(Tensor::stack(&labels, 0)?)
        };
        Ok(Self {
            image: Tensor::stack(&images, 0)?,
            label,
            indices,
        })
    }
}

/// Iterates a dataset in batches, in sampler order, shuffled order or
/// index order.
pub struct VolumeLoader {
    dataset: Arc<dyn Dataset>,
    batch_size: usize,
    shuffle: bool,
    sampler: Option<DistributedSampler>,
    seed: u64,
    epoch: u64,
}

impl std::fmt::Debug for VolumeLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeLoader")
            .field("items", &self.dataset.len())
            .field("batch_size", &self.batch_size)
            .field("shuffle", &self.shuffle)
            .field("sampler", &self.sampler)
            .field("epoch", &self.epoch)
            .finish()
    }
}

impl VolumeLoader {
    pub fn new(dataset: Arc<dyn Dataset>, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(DataError::Validation(vec![
                "batch_size must be greater than 0".to_string(),
            ]));
        }
        Ok(Self {
            dataset,
            batch_size,
            shuffle: false,
            sampler: None,
            seed: 0,
            epoch: 0,
        })
    }

    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    /// A sampler decides the order, so loader-level shuffling is turned off.
    pub fn with_sampler(mut self, sampler: DistributedSampler) -> Self {
        self.sampler = Some(sampler);
        self.shuffle = false;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn dataset(&self) -> &Arc<dyn Dataset> {
        &self.dataset
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn is_shuffled(&self) -> bool {
        self.shuffle
    }

    pub fn sampler(&self) -> Option<&DistributedSampler> {
        self.sampler.as_ref()
    }

    pub fn set_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
        if let Some(sampler) = self.sampler.as_mut() {
            sampler.set_epoch(epoch);
        }
    }

    /// Items visited this epoch.
    pub fn num_items(&self) -> usize {
        match &self.sampler {
            Some(sampler) => sampler.shard_len(),
            None => self.dataset.len(),
        }
    }

    /// Batches per epoch; the last batch may be short.
    pub fn len(&self) -> usize {
        self.num_items().div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn epoch_plan(&self) -> (Vec<usize>, StdRng) {
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.epoch));
        let order = match &self.sampler {
            Some(sampler) => sampler.indices(),
            None => {
                let mut order: Vec<usize> = (0..self.dataset.len()).collect();
                if self.shuffle {
                    order.shuffle(&mut rng);
                }
                order
            }
        };
        (order, rng)
    }

    /// Dataset indices in the order this epoch visits them.
    pub fn epoch_order(&self) -> Vec<usize> {
        self.epoch_plan().0
    }

    pub fn iter(&self) -> BatchIter<'_> {
        let (order, rng) = self.epoch_plan();
        log::debug!(
            "epoch {} loader: {} items in batches of {}",
            self.epoch,
            order.len(),
            self.batch_size
        );
        BatchIter {
            loader: self,
            order,
            cursor: 0,
            rng,
        }
    }
}

impl<'a> IntoIterator for &'a VolumeLoader {
    type Item = Result<Batch>;
    type IntoIter = BatchIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// One epoch of batches. Transform randomness is seeded from the loader's
/// seed and epoch.
pub struct BatchIter<'a> {
    loader: &'a VolumeLoader,
    order: Vec<usize>,
    cursor: usize,
    rng: StdRng,
}

impl Iterator for BatchIter<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.loader.batch_size).min(self.order.len());
        let indices = self.order[self.cursor..end].to_vec();
        self.cursor = end;

        let mut volumes = Vec::with_capacity(indices.len());
        for &index in &indices {
            match self.loader.dataset.get(index, &mut self.rng) {
                Ok(volume) => volumes.push(volume),
                Err(err) => return Some(Err(err)),
            }
        }
        Some(Batch::stack(volumes, indices))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.order.len() - self.cursor).div_ceil(self.loader.batch_size);
        (remaining, Some(remaining))
    }
}

/// Loaders built from a [`PipelineConfig`].
#[derive(Debug)]
pub enum Loaders {
    Train {
        train: VolumeLoader,
        val: VolumeLoader,
    },
    Test(VolumeLoader),
}

fn eval_loader(
    config: &PipelineConfig,
    split: &str,
    device: &Device,
) -> Result<VolumeLoader> {
    let items = load_decathlon_datalist(config.datalist_path(), split, Some(&config.data_dir))?;
    let dataset = VolumeDataset::new(items, Arc::new(eval_pipeline()), device.clone());
    let len = dataset.len();
    let mut loader = VolumeLoader::new(Arc::new(dataset), 1)?.with_seed(config.seed);
    if let Some(distributed) = config.distributed {
        loader = loader.with_sampler(DistributedSampler::new(
            len,
            distributed.world_size,
            distributed.rank,
            false,
            true,
        )?);
    }
    Ok(loader)
}

/// Builds the training and validation loaders, or a single test loader
/// over the validation list when `test_mode` is set.
///
/// Validation and test loaders use batch size 1 and never shuffle. The
/// training loader shuffles unless a distributed sampler is configured.
pub fn build_loaders(config: &PipelineConfig, device: &Device) -> Result<Loaders> {
    config.validate()?;
    if config.test_mode {
        return Ok(Loaders::Test(eval_loader(config, "validation", device)?));
    }

    let items =
        load_decathlon_datalist(config.datalist_path(), "training", Some(&config.data_dir))?;
    let transform = Arc::new(train_pipeline(config.roi, &config.augmentation));
    let dataset: Arc<dyn Dataset> = if config.use_normal_dataset {
        Arc::new(VolumeDataset::new(items, transform, device.clone()))
    } else {
        Arc::new(CachedDataset::new(
            items,
            transform,
            config.cache_num,
            config.cache_rate,
            config.workers,
            device.clone(),
        )?)
    };

    let len = dataset.len();
    let mut train = VolumeLoader::new(dataset, config.batch_size)?.with_seed(config.seed);
    train = match config.distributed {
        Some(distributed) => train.with_sampler(DistributedSampler::new(
            len,
            distributed.world_size,
            distributed.rank,
            true,
            true,
        )?),
        None => train.with_shuffle(true),
    };

    let val = eval_loader(config, "validation", device)?;
    log::info!(
        "loaders ready: {} training batches, {} validation batches",
        train.len(),
        val.len()
    );
    Ok(Loaders::Train { train, val })
}
