//! Run-time knobs shared by attention implementations.

/// Configuration driving attention behaviour.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Config {
    /// Dropout applied to attention probabilities while training.
    pub dropout_p: Option<f32>,
    /// Training mode enables dropout; evaluation mode is deterministic.
    pub training: bool,
}

impl Config {
    pub fn with_dropout(dropout_p: Option<f32>) -> Self {
        Self {
            dropout_p,
            ..Self::default()
        }
    }

    /// Dropout probability that will actually be applied, if any.
    pub fn effective_dropout(&self) -> Option<f32> {
        match self.dropout_p {
            Some(p) if self.training && p > 0.0 => Some(p),
            _ => None,
        }
    }
}
