//! Layer normalisation for the pre-norm encoder blocks.
//!
//! Inputs follow the `(batch, seq, hidden)` convention and are normalised
//! along the last axis. Mean and variance are computed in
//! [`PrecisionPolicy::reduction`] before the affine step runs in the compute
//! dtype.

use candle_core::{bail, DType, Device, Result, Tensor, D};

use crate::{checks, dtypes::PrecisionPolicy};

/// Configuration for [`LayerNorm`].
#[derive(Debug, Clone, PartialEq)]
pub struct NormConfig {
    pub hidden_size: usize,
    /// Numeric stabiliser added to the variance.
    pub epsilon: f64,
    /// Whether learnable scale and shift are applied after normalising.
    pub elementwise_affine: bool,
}

impl NormConfig {
    pub fn new(hidden_size: usize) -> Self {
        Self {
            hidden_size,
            epsilon: 1e-5,
            elementwise_affine: true,
        }
    }
}

/// Shared interface for normalisation layers used inside encoder blocks.
pub trait NormalizationLayer: Send + Sync {
    fn config(&self) -> &NormConfig;

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

/// LayerNorm with optional affine parameters.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    config: NormConfig,
    affine: Option<(Tensor, Tensor)>,
}

impl LayerNorm {
    /// Constructs a LayerNorm with learnable scale and bias.
    pub fn new(weight: Tensor, bias: Tensor, mut config: NormConfig) -> Result<Self> {
        for (name, param) in [("norm.weight", &weight), ("norm.bias", &bias)] {
            checks::expect_shape(name, param, &[config.hidden_size])?;
            checks::expect_dtype_in(name, param, &[DType::F16, DType::BF16, DType::F32, DType::F64])?;
            checks::expect_contiguous(name, param)?;
        }
        config.elementwise_affine = true;
        Ok(Self {
            config,
            affine: Some((weight, bias)),
        })
    }

    /// Unit scale and zero shift, the usual starting point for a fresh block.
    pub fn identity_init(config: NormConfig, dtype: DType, device: &Device) -> Result<Self> {
        let weight = Tensor::ones(config.hidden_size, dtype, device)?;
        let bias = Tensor::zeros(config.hidden_size, dtype, device)?;
        Self::new(weight, bias, config)
    }

    /// Constructs a LayerNorm without affine parameters.
    pub fn without_affine(mut config: NormConfig) -> Result<Self> {
        if config.hidden_size == 0 {
            bail!("norm hidden_size must be non-zero");
        }
        config.elementwise_affine = false;
        Ok(Self {
            config,
            affine: None,
        })
    }
}

impl NormalizationLayer for LayerNorm {
    fn config(&self) -> &NormConfig {
        &self.config
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_batch_seq_hidden("norm.input", hidden, self.config.hidden_size)?;

        let hidden_size = self.config.hidden_size as f64;
        let compute = policy.cast_for_reduction(hidden)?;
        let mean = (compute.sum_keepdim(D::Minus1)? / hidden_size)?;
        let centered = compute.broadcast_sub(&mean)?;
        let variance = (centered.sqr()?.sum_keepdim(D::Minus1)? / hidden_size)?;
        let denom = (variance + self.config.epsilon)?.sqrt()?;
        let mut normalized = centered
            .broadcast_div(&denom)?
            .to_dtype(policy.compute())?;

        if let Some((weight, bias)) = &self.affine {
            normalized = normalized
                .broadcast_mul(&weight.to_dtype(policy.compute())?)?
                .broadcast_add(&bias.to_dtype(policy.compute())?)?;
        }

        policy.cast_to_storage(&normalized)
    }
}
