use std::{fs, path::Path};

use embedding::AxisEmbeddingConfig;
use serde::{Deserialize, Serialize};

use crate::error::GroupError;

/// How the three blocks of one stage are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Sequential,
    /// Evaluate the blocks of a stage on the rayon thread pool.
    Parallel,
}

/// Hyper-parameters shared by the six blocks of the group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupConfig {
    pub hidden_size: usize,
    pub mlp_dim: usize,
    pub num_heads: usize,
    #[serde(default)]
    pub dropout_rate: f32,
    /// Base seed for the per-block dropout RNGs.
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub execution: ExecutionMode,
}

impl GroupConfig {
    pub fn new(hidden_size: usize, mlp_dim: usize, num_heads: usize, dropout_rate: f32) -> Self {
        Self {
            hidden_size,
            mlp_dim,
            num_heads,
            dropout_rate,
            seed: 0,
            execution: ExecutionMode::Sequential,
        }
    }

    pub fn with_execution(mut self, execution: ExecutionMode) -> Self {
        self.execution = execution;
        self
    }

    pub fn head_dim(&self) -> usize {
        if self.num_heads == 0 {
            0
        } else {
            self.hidden_size / self.num_heads
        }
    }

    /// Dropout as the optional probability the layer primitives expect.
    pub(crate) fn dropout_p(&self) -> Option<f32> {
        (self.dropout_rate > 0.0).then_some(self.dropout_rate)
    }

    pub fn validate(&self) -> Result<(), GroupError> {
        let errors = self.collect_errors();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(GroupError::Config(errors.join("; ")))
        }
    }

    fn collect_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.hidden_size == 0 {
            errors.push("hidden_size must be greater than 0".to_string());
        }
        if self.mlp_dim == 0 {
            errors.push("mlp_dim must be greater than 0".to_string());
        }
        if self.num_heads == 0 {
            errors.push("num_heads must be greater than 0".to_string());
        } else if self.hidden_size % self.num_heads != 0 {
            errors.push(format!(
                "hidden_size ({}) must be divisible by num_heads ({})",
                self.hidden_size, self.num_heads
            ));
        }
        if !self.dropout_rate.is_finite() || !(0.0..=1.0).contains(&self.dropout_rate) {
            errors.push(format!(
                "dropout_rate must be finite and in [0, 1], got {}",
                self.dropout_rate
            ));
        }
        errors
    }
}

/// Full encoder description: volume geometry plus group hyper-parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Spatial extent `[height, width, depth]` of the input volumes.
    pub volume: [usize; 3],
    #[serde(default)]
    pub token_count: Option<usize>,
    #[serde(default)]
    pub embedding_dropout: Option<f32>,
    pub group: GroupConfig,
}

impl EncoderConfig {
    pub fn new(volume: [usize; 3], group: GroupConfig) -> Self {
        Self {
            volume,
            token_count: None,
            embedding_dropout: None,
            group,
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, GroupError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: EncoderConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(GroupError::ConfigFormat(format!(
                    "unsupported configuration extension '{other}'"
                )));
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn embedding_config(&self) -> AxisEmbeddingConfig {
        AxisEmbeddingConfig {
            volume: self.volume,
            hidden_size: self.group.hidden_size,
            token_count: self.token_count,
            dropout_p: self.embedding_dropout,
        }
    }

    pub fn validate(&self) -> Result<(), GroupError> {
        let mut errors = self.group.collect_errors();
        if let Err(err) = self.embedding_config().validate() {
            errors.push(format!("embedding: {err}"));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(GroupError::Config(errors.join("; ")))
        }
    }
}
