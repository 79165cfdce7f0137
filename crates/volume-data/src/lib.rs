//! Volumetric scan loading for the triaxial encoder: decathlon datalists,
//! safetensors volumes, augmentation pipelines, caching, distributed
//! sharding and batching.

pub mod config;
pub mod datalist;
pub mod dataset;
pub mod error;
pub mod loader;
pub mod sampler;
pub mod transforms;
pub mod volume;

pub use config::{AugmentationConfig, DistributedConfig, PipelineConfig};
pub use datalist::{load_decathlon_datalist, DataItem};
pub use dataset::{CachedDataset, Dataset, VolumeDataset};
pub use error::{DataError, Result};
pub use loader::{build_loaders, Batch, BatchIter, Loaders, VolumeLoader};
pub use sampler::DistributedSampler;
pub use transforms::{eval_pipeline, train_pipeline, Compose, VolumeTransform};
pub use volume::Volume;
