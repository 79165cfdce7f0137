use std::path::PathBuf;

/// Errors raised while reading datalists, loading volumes or batching them.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to parse toml: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("failed to parse config: {0}")]
    ConfigFormat(String),
    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("datalist {path} has no '{split}' list")]
    MissingSplit { split: String, path: PathBuf },
    #[error("invalid volume: {0}")]
    Volume(String),
    #[error("index {index} out of range for dataset of {len} items")]
    OutOfRange { index: usize, len: usize },
    #[error("failed to start cache workers: {0}")]
    Workers(String),
    #[error("sampler error: {0}")]
    Sampler(String),
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

impl DataError {
    pub fn volume(message: impl Into<String>) -> Self {
        Self::Volume(message.into())
    }

    pub fn sampler(message: impl Into<String>) -> Self {
        Self::Sampler(message.into())
    }
}

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, DataError>;
