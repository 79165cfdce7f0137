//! Dense projections used for token embedding, QKV and feed-forward layers.
//!
//! Linear layers expect inputs shaped `(batch, seq, in_dim)` and return
//! `(batch, seq, out_dim)`; 2D `(rows, in_dim)` inputs are also accepted.
//! The fused variant packs `fused_projections` outputs side by side along the
//! last axis so the attention block can split queries, keys and values with
//! `narrow`. Weights and activations are cast to
//! [`PrecisionPolicy::compute`] for the matmul and back to storage after.

use candle_core::{bail, DType, Device, Result, Tensor};

use crate::{checks, dtypes::PrecisionPolicy};

const PARAM_DTYPES: &[DType] = &[DType::F16, DType::BF16, DType::F32, DType::F64];

/// Configuration shared by dense projection layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearConfig {
    pub input_dim: usize,
    /// Output feature dimension per projection shard.
    pub output_dim: usize,
    pub bias: bool,
    /// Number of projections fused together (1 for a plain linear).
    pub fused_projections: usize,
}

impl LinearConfig {
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: true,
            fused_projections: 1,
        }
    }

    /// Packs `count` projections of `output_dim` features into one weight.
    pub fn fused(input_dim: usize, output_dim: usize, count: usize) -> Self {
        Self {
            fused_projections: count,
            ..Self::new(input_dim, output_dim)
        }
    }

    pub fn total_output_dim(&self) -> usize {
        self.output_dim * self.fused_projections
    }
}

/// Shared interface for affine projections.
pub trait LinearLayer: Send + Sync {
    fn config(&self) -> &LinearConfig;

    /// Applies the projection, promoting to the compute dtype when needed.
    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

/// Weight initialisation policies.
#[derive(Debug, Clone)]
pub enum LinearInit {
    /// Xavier/Glorot uniform initialisation.
    XavierUniform,
    /// Normal samples clipped to two standard deviations, the usual ViT
    /// recipe (`std = 0.02`).
    TruncatedNormal { std: f64 },
}

impl LinearInit {
    /// Samples an `(out_dim, in_dim)` weight in `f32` then casts to `dtype`.
    pub fn sample(&self, shape: (usize, usize), device: &Device, dtype: DType) -> Result<Tensor> {
        let (out_dim, in_dim) = shape;
        let (fan_in, fan_out) = (in_dim as f64, out_dim as f64);
        let weight = match self {
            LinearInit::XavierUniform => {
                let bound = (6.0 / (fan_in + fan_out)).sqrt() as f32;
                Tensor::rand(-bound, bound, shape, device)?
            }
            LinearInit::TruncatedNormal { std } => {
                let std = *std as f32;
                Tensor::randn(0f32, std, shape, device)?.clamp(-2.0 * std, 2.0 * std)?
            }
        };
        if dtype == DType::F32 {
            Ok(weight)
        } else {
            checks::ensure_cast_supported("linear.init", DType::F32, dtype)?;
            weight.to_dtype(dtype)
        }
    }
}

/// Dense affine projection with optional bias.
///
/// Each instance owns its parameters; blocks of the group never share them.
#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Linear {
    /// Constructs a linear layer from pre-existing parameters.
    pub fn new(config: LinearConfig, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        Self::validate_weight(&config, &weight)?;
        Self::validate_bias(&config, bias.as_ref())?;
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    /// Builds a linear layer with weights sampled from `init` and a zero bias.
    pub fn with_init(
        config: LinearConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        if config.input_dim == 0 || config.total_output_dim() == 0 {
            bail!(
                "linear dimensions must be non-zero, got {} -> {}",
                config.input_dim,
                config.total_output_dim()
            );
        }
        let weight = init.sample((config.total_output_dim(), config.input_dim), device, dtype)?;
        let bias = if config.bias {
            Some(Tensor::zeros(config.total_output_dim(), dtype, device)?)
        } else {
            None
        };
        Self::new(config, weight, bias)
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    fn validate_weight(config: &LinearConfig, weight: &Tensor) -> Result<()> {
        checks::expect_rank("linear.weight", weight, 2)?;
        checks::expect_shape(
            "linear.weight",
            weight,
            &[config.total_output_dim(), config.input_dim],
        )?;
        checks::expect_dtype_in("linear.weight", weight, PARAM_DTYPES)?;
        checks::expect_contiguous("linear.weight", weight)
    }

    fn validate_bias(config: &LinearConfig, bias: Option<&Tensor>) -> Result<()> {
        match (config.bias, bias) {
            (true, Some(tensor)) => {
                checks::expect_shape("linear.bias", tensor, &[config.total_output_dim()])?;
                checks::expect_dtype_in("linear.bias", tensor, PARAM_DTYPES)?;
                checks::expect_contiguous("linear.bias", tensor)
            }
            (false, Some(_)) => bail!("bias provided but config disables bias"),
            (true, None) => bail!("config expects bias but none supplied"),
            (false, None) => Ok(()),
        }
    }

    fn validate_input(&self, hidden: &Tensor) -> Result<()> {
        match hidden.dims() {
            [_, _, _] => {
                checks::expect_batch_seq_hidden("linear.input", hidden, self.config.input_dim)?;
                checks::expect_non_empty_sequence("linear.input", hidden)
            }
            [rows, hidden_dim] => {
                if *hidden_dim != self.config.input_dim {
                    bail!(
                        "linear.input: expected last dim {} but received {}",
                        self.config.input_dim,
                        hidden_dim
                    );
                }
                if *rows == 0 {
                    bail!("linear.input: row dimension must be non-zero");
                }
                Ok(())
            }
            dims => bail!(
                "linear expects input shaped [B, T, H_in] or [T, H_in], got {:?}",
                dims
            ),
        }
    }
}

impl LinearLayer for Linear {
    fn config(&self) -> &LinearConfig {
        &self.config
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        self.validate_input(hidden)?;

        let input = policy.cast_for_matmul(hidden)?;
        let weight_t = policy.cast_for_matmul(&self.weight)?.t()?;
        let out_dim = self.config.total_output_dim();

        let mut output = match input.dims() {
            &[batch, seq, in_dim] => input
                .reshape((batch * seq, in_dim))?
                .matmul(&weight_t)?
                .reshape((batch, seq, out_dim))?,
            _ => input.matmul(&weight_t)?,
        };

        if let Some(bias) = &self.bias {
            output = output.broadcast_add(&policy.cast_for_matmul(bias)?)?;
        }

        policy.cast_to_storage(&output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor_stats(tensor: &Tensor) -> Result<(f64, f64)> {
        let values = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let n = values.len() as f64;
        let mean = values.iter().map(|v| f64::from(*v)).sum::<f64>() / n;
        let var = values
            .iter()
            .map(|v| (f64::from(*v) - mean).powi(2))
            .sum::<f64>()
            / n;
        Ok((mean, var.sqrt()))
    }

    #[test]
    fn fused_projection_matches_manual_matmul() -> Result<()> {
        let device = Device::Cpu;
        let config = LinearConfig::fused(8, 4, 3);
        let weight = Tensor::randn(0f32, 0.05, (12, 8), &device)?;
        let bias = Tensor::randn(0f32, 0.02, 12, &device)?;
        let linear = Linear::new(config, weight.clone(), Some(bias.clone()))?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);

        let input = Tensor::randn(0f32, 1.0, (2, 5, 8), &device)?;
        let output = linear.forward(&input, &policy)?;
        assert_eq!(output.dims(), &[2, 5, 12]);

        let reference = input
            .reshape((10, 8))?
            .matmul(&weight.t()?)?
            .broadcast_add(&bias)?
            .reshape((2, 5, 12))?;
        let diff = output.sub(&reference)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 1e-5);
        Ok(())
    }

    #[test]
    fn half_precision_output_keeps_storage_dtype() -> Result<()> {
        let device = Device::Cpu;
        let linear = Linear::with_init(
            LinearConfig::new(16, 8),
            &LinearInit::XavierUniform,
            &device,
            DType::BF16,
        )?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::BF16);
        let input = Tensor::randn(0f32, 1.0, (1, 3, 16), &device)?.to_dtype(DType::BF16)?;
        let out = linear.forward(&input, &policy)?;
        assert_eq!(out.dtype(), DType::BF16);
        assert_eq!(out.dims(), &[1, 3, 8]);
        Ok(())
    }

    #[test]
    fn truncated_normal_is_clipped() -> Result<()> {
        let device = Device::Cpu;
        let linear = Linear::with_init(
            LinearConfig::new(128, 64),
            &LinearInit::TruncatedNormal { std: 0.02 },
            &device,
            DType::F32,
        )?;
        let max = linear.weight().abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(max <= 0.04 + 1e-7);
        let (mean, std) = tensor_stats(linear.weight())?;
        assert!(mean.abs() < 5e-3);
        assert!(std < 0.02);
        Ok(())
    }

    #[test]
    fn rejects_empty_sequences_and_wrong_width() -> Result<()> {
        let device = Device::Cpu;
        let linear = Linear::with_init(
            LinearConfig::new(4, 4),
            &LinearInit::XavierUniform,
            &device,
            DType::F32,
        )?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let empty = Tensor::zeros((1, 0, 4), DType::F32, &device)?;
        assert!(linear.forward(&empty, &policy).is_err());
        let wide = Tensor::zeros((1, 2, 5), DType::F32, &device)?;
        assert!(linear.forward(&wide, &policy).is_err());
        Ok(())
    }
}
