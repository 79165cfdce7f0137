//! Position-wise feed-forward sublayer of the encoder block.
//!
//! `hidden -> mlp_dim -> hidden` with GELU between the projections
//! and dropout after each of them, as in the original ViT MLP head. Inputs
//! and outputs are shaped `(batch, seq, hidden)`.

use candle_core::{bail, DType, Device, Result, Tensor};

use crate::{
    activations,
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit, LinearLayer},
    residual::Dropout,
};

/// Configuration of the feed-forward sublayer.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedForwardConfig {
    pub hidden_size: usize,
    /// Width of the inner projection.
    pub mlp_dim: usize,
    pub dropout_p: Option<f32>,
}

impl FeedForwardConfig {
    pub fn new(hidden_size: usize, mlp_dim: usize) -> Self {
        Self {
            hidden_size,
            mlp_dim,
            dropout_p: None,
        }
    }
}

/// Shared interface for feed-forward stacks.
pub trait FeedForwardLayer: Send + Sync {
    fn config(&self) -> &FeedForwardConfig;

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;

    fn set_training(&self, training: bool);
}

/// Two-projection MLP with activation and dropout.
pub struct FeedForward {
    config: FeedForwardConfig,
    up: Linear,
    down: Linear,
    dropout_inner: Dropout,
    dropout_out: Dropout,
}

impl std::fmt::Debug for FeedForward {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedForward")
            .field("config", &self.config)
            .finish()
    }
}

impl FeedForward {
    pub fn with_init(
        config: FeedForwardConfig,
        init: &LinearInit,
        seed: u64,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        if config.hidden_size == 0 || config.mlp_dim == 0 {
            bail!("feed-forward sizes must be non-zero, got {:?}", config);
        }
        let up = Linear::with_init(
            LinearConfig::new(config.hidden_size, config.mlp_dim),
            init,
            device,
            dtype,
        )?;
        let down = Linear::with_init(
            LinearConfig::new(config.mlp_dim, config.hidden_size),
            init,
            device,
            dtype,
        )?;
        let dropout_inner = Dropout::new(config.dropout_p, seed)?;
        let dropout_out = Dropout::new(config.dropout_p, seed.wrapping_add(1))?;
        Ok(Self {
            config,
            up,
            down,
            dropout_inner,
            dropout_out,
        })
    }
}

impl FeedForwardLayer for FeedForward {
    fn config(&self) -> &FeedForwardConfig {
        &self.config
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let inner = self.up.forward(hidden, policy)?;
        let inner = activations::gelu(&inner, policy)?;
        let inner = self.dropout_inner.forward(&inner, policy)?;
        let out = self.down.forward(&inner, policy)?;
        self.dropout_out.forward(&out, policy)
    }

    fn set_training(&self, training: bool) {
        self.dropout_inner.set_training(training);
        self.dropout_out.set_training(training);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_preserves_layout() -> Result<()> {
        let device = Device::Cpu;
        let mlp = FeedForward::with_init(
            FeedForwardConfig::new(16, 32),
            &LinearInit::TruncatedNormal { std: 0.02 },
            0,
            &device,
            DType::F32,
        )?;
        let input = Tensor::randn(0f32, 1.0, (2, 8, 16), &device)?;
        let out = mlp.forward(&input, &PrecisionPolicy::from_parameter_dtype(DType::F32))?;
        assert_eq!(out.dims(), &[2, 8, 16]);
        Ok(())
    }

    #[test]
    fn evaluation_mode_is_deterministic() -> Result<()> {
        let device = Device::Cpu;
        let mut config = FeedForwardConfig::new(8, 16);
        config.dropout_p = Some(0.5);
        let mlp = FeedForward::with_init(config, &LinearInit::XavierUniform, 3, &device, DType::F32)?;
        mlp.set_training(false);
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let input = Tensor::randn(0f32, 1.0, (1, 4, 8), &device)?;
        let a = mlp.forward(&input, &policy)?.flatten_all()?.to_vec1::<f32>()?;
        let b = mlp.forward(&input, &policy)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(a, b);
        Ok(())
    }
}
