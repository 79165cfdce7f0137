//! Residual connections and the seeded dropout they apply to branches.
//!
//! Residual branches combine tensors of shape `(batch, seq, hidden)`. Each
//! [`Dropout`] owns its RNG so blocks sampling masks concurrently never touch
//! shared state, and a seed reproduces the exact mask sequence. Dropout is
//! the identity whenever the layer is in evaluation mode.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

use candle_core::{bail, DType, Error, Result, Tensor};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{checks, dtypes::PrecisionPolicy};

/// Validates a dropout probability: finite and within `[0, 1]`.
pub fn validate_probability(name: &str, probability: f32) -> Result<()> {
    if probability.is_finite() && (0.0..=1.0).contains(&probability) {
        Ok(())
    } else {
        bail!("{name}: dropout probability must be finite and in [0, 1], got {probability}")
    }
}

/// Inverted dropout with a private, seeded RNG and a train/eval switch.
pub struct Dropout {
    probability: f32,
    rng: Mutex<StdRng>,
    training: AtomicBool,
}

impl fmt::Debug for Dropout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dropout")
            .field("probability", &self.probability)
            .field("training", &self.is_training())
            .finish()
    }
}

impl Dropout {
    /// `None` behaves like a probability of zero. Layers start in training mode.
    pub fn new(probability: Option<f32>, seed: u64) -> Result<Self> {
        let probability = probability.unwrap_or(0.0);
        validate_probability("dropout", probability)?;
        Ok(Self {
            probability,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            training: AtomicBool::new(true),
        })
    }

    pub fn probability(&self) -> f32 {
        self.probability
    }

    pub fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::Relaxed);
    }

    pub fn is_training(&self) -> bool {
        self.training.load(Ordering::Relaxed)
    }

    /// Applies dropout to a tensor of any rank.
    ///
    /// Kept elements are scaled by `1 / (1 - p)`; with `p == 1` every element
    /// is dropped and the result is all zeros.
    pub fn forward(&self, tensor: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        if !self.is_training() || self.probability == 0.0 {
            return Ok(tensor.clone());
        }
        if self.probability >= 1.0 {
            return tensor.zeros_like();
        }

        let keep_prob = 1.0 - self.probability;
        let total = tensor.elem_count();
        let mask_data = {
            let mut rng = self
                .rng
                .lock()
                .map_err(|_| Error::Msg("dropout RNG mutex poisoned".into()))?;
            (0..total)
                .map(|_| {
                    if rng.gen::<f32>() < keep_prob {
                        1.0 / keep_prob
                    } else {
                        0.0
                    }
                })
                .collect::<Vec<f32>>()
        };

        let dtype = policy.compute();
        checks::ensure_cast_supported("dropout.mask", DType::F32, dtype)?;
        let mask = Tensor::from_vec(mask_data, tensor.dims(), tensor.device())?.to_dtype(dtype)?;
        let dropped = policy.cast_for_matmul(tensor)?.mul(&mask)?;
        policy.cast_to_storage(&dropped)
    }
}

/// Configuration describing how a residual branch is merged.
#[derive(Debug, Clone, PartialEq)]
pub struct ResidualConfig {
    /// Dropout probability applied to the branch during training.
    pub dropout_p: Option<f32>,
    /// Optional factor applied to the branch before the addition.
    pub residual_scale: Option<f32>,
}

impl ResidualConfig {
    pub fn new(dropout_p: Option<f32>) -> Self {
        Self {
            dropout_p,
            residual_scale: None,
        }
    }
}

/// Residual add helper: `residual + scale * dropout(branch)`.
#[derive(Debug)]
pub struct Residual {
    config: ResidualConfig,
    dropout: Dropout,
}

impl Residual {
    pub fn new(config: ResidualConfig, seed: u64) -> Result<Self> {
        let dropout = Dropout::new(config.dropout_p, seed)?;
        Ok(Self { config, dropout })
    }

    pub fn config(&self) -> &ResidualConfig {
        &self.config
    }

    pub fn set_training(&self, training: bool) {
        self.dropout.set_training(training);
    }

    /// Drops out `branch`, then adds it onto `residual`.
    pub fn step(&self, branch: &Tensor, residual: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let branch = self.dropout.forward(branch, policy)?;
        self.add(&branch, residual, policy)
    }

    /// Adds `branch` to `residual`, applying scaling when requested.
    pub fn add(&self, branch: &Tensor, residual: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let expected = residual.dims();
        checks::expect_rank("residual.input", residual, 3)?;
        checks::expect_shape("residual.branch", branch, expected)?;
        checks::expect_same_dtype("residual.branch", branch, "residual.input", residual)?;

        let mut branch = policy.cast_for_matmul(branch)?;
        if let Some(scale) = self.config.residual_scale {
            branch = branch.affine(f64::from(scale), 0.0)?;
        }
        let added = branch.add(&policy.cast_for_matmul(residual)?)?;
        policy.cast_to_storage(&added)
    }
}
