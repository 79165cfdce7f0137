use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::error::{DataError, Result};

/// Data pipeline settings: where the datalist lives, crop size, batching,
/// caching and augmentation strength.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    /// Datalist file name, relative to `data_dir`.
    #[serde(default = "default_json_list")]
    pub json_list: PathBuf,
    /// Training crop size `[x, y, z]`; foreground crops are padded to multiples of it.
    #[serde(default = "default_roi")]
    pub roi: [usize; 3],
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Threads used to fill the dataset cache.
    #[serde(default)]
    pub workers: usize,
    #[serde(default)]
    pub distributed: Option<DistributedConfig>,
    /// Skip caching and run the full pipeline on every access.
    #[serde(default)]
    pub use_normal_dataset: bool,
    #[serde(default = "default_cache_num")]
    pub cache_num: usize,
    #[serde(default = "default_cache_rate")]
    pub cache_rate: f32,
    /// Build a single loader over the validation list instead of train/val.
    #[serde(default)]
    pub test_mode: bool,
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub augmentation: AugmentationConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedConfig {
    pub world_size: usize,
    pub rank: usize,
}

/// Probabilities and magnitudes of the random training transforms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentationConfig {
    pub flip_prob: f32,
    pub scale_factors: f32,
    pub scale_prob: f32,
    pub shift_offsets: f32,
    pub shift_prob: f32,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            flip_prob: 0.5,
            scale_factors: 0.1,
            scale_prob: 1.0,
            shift_offsets: 0.1,
            shift_prob: 1.0,
        }
    }
}

impl PipelineConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            json_list: default_json_list(),
            roi: default_roi(),
            batch_size: default_batch_size(),
            workers: 0,
            distributed: None,
            use_normal_dataset: false,
            cache_num: default_cache_num(),
            cache_rate: default_cache_rate(),
            test_mode: false,
            seed: 0,
            augmentation: AugmentationConfig::default(),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: PipelineConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(DataError::ConfigFormat(format!(
                    "unsupported configuration extension '{other}'"
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;
        Ok(config)
    }

    fn apply_base_path(&mut self, base: &Path) {
        if self.data_dir.is_relative() {
            self.data_dir = base.join(&self.data_dir);
        }
    }

    pub fn datalist_path(&self) -> PathBuf {
        self.data_dir.join(&self.json_list)
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.roi.iter().any(|extent| *extent == 0) {
            errors.push(format!("roi extents must be greater than 0, got {:?}", self.roi));
        }
        if self.batch_size == 0 {
            errors.push("batch_size must be greater than 0".to_string());
        }
        if !self.cache_rate.is_finite() || !(0.0..=1.0).contains(&self.cache_rate) {
            errors.push(format!("cache_rate must be in [0, 1], got {}", self.cache_rate));
        }
        if let Some(distributed) = self.distributed {
            if distributed.world_size == 0 {
                errors.push("distributed.world_size must be greater than 0".to_string());
            } else if distributed.rank >= distributed.world_size {
                errors.push(format!(
                    "distributed.rank ({}) must be below world_size ({})",
                    distributed.rank, distributed.world_size
                ));
            }
        }

        let aug = &self.augmentation;
        for (name, value) in [
            ("flip_prob", aug.flip_prob),
            ("scale_prob", aug.scale_prob),
            ("shift_prob", aug.shift_prob),
        ] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                errors.push(format!("augmentation.{name} must be in [0, 1], got {value}"));
            }
        }
        for (name, value) in [
            ("scale_factors", aug.scale_factors),
            ("shift_offsets", aug.shift_offsets),
        ] {
            if !value.is_finite() || value < 0.0 {
                errors.push(format!(
                    "augmentation.{name} must be finite and non-negative, got {value}"
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(DataError::Validation(errors))
        }
    }
}

fn default_json_list() -> PathBuf {
    PathBuf::from("dataset_0.json")
}

fn default_roi() -> [usize; 3] {
    [96, 96, 96]
}

fn default_batch_size() -> usize {
    1
}

fn default_cache_num() -> usize {
    24
}

fn default_cache_rate() -> f32 {
    1.0
}
