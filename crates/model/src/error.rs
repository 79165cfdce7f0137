//! Errors raised while building or evaluating the attention group.

use attention::AttentionError;
use thiserror::Error;

use crate::stage::Stage;

#[derive(Debug, Error)]
pub enum GroupError {
    /// Hyper-parameters that cannot build a valid group.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Two tensors that must be combined element-wise differ in shape.
    #[error("shape mismatch: {left} has shape {left_shape:?} but {right} has shape {right_shape:?}")]
    ShapeMismatch {
        left: Stage,
        right: Stage,
        left_shape: Vec<usize>,
        right_shape: Vec<usize>,
    },
    /// An empty batch or a zero-length axis sequence.
    #[error("degenerate input for stage {stage}: shape {dims:?} has an empty batch or sequence")]
    DegenerateInput { stage: Stage, dims: Vec<usize> },
    /// Input that does not follow the `[batch, seq, hidden]` layout.
    #[error("invalid input for stage {stage}: {message}")]
    InvalidInput { stage: Stage, message: String },
    #[error(transparent)]
    Attention(#[from] AttentionError),
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ConfigFormat(String),
}

impl From<toml::de::Error> for GroupError {
    fn from(value: toml::de::Error) -> Self {
        GroupError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for GroupError {
    fn from(value: serde_json::Error) -> Self {
        GroupError::ConfigFormat(value.to_string())
    }
}
