//! Reference attention kernel.
//!
//! The exact path materialises the full `[batch, heads, q_len, k_len]` score
//! matrix. For an axis of length `L` that is `O(L^2)` per head, which is the
//! cost the triaxial group pays per block instead of `O((H*W*D)^2)`.

use std::sync::OnceLock;

use candle_core::{DType, Tensor};
use candle_nn::ops::{dropout, softmax_last_dim};

use crate::core::{Attention, AttentionError, Config};

/// Numerically stable, portable multi-head attention kernel.
#[derive(Debug, Default)]
pub struct ExactAttention {
    first_call: OnceLock<()>,
}

impl ExactAttention {
    pub fn new() -> Self {
        Self::default()
    }

    /// Input dtypes the kernel accepts. Scores are always computed in `f32`.
    pub fn supports_dtype(dtype: DType) -> bool {
        matches!(dtype, DType::F32 | DType::F16 | DType::BF16)
    }
}

fn dims4(name: &str, tensor: &Tensor) -> Result<(usize, usize, usize, usize), AttentionError> {
    tensor.dims4().map_err(|_| {
        AttentionError::shape(format!(
            "{name} must have shape [batch, heads, seq_len, head_dim], got {:?}",
            tensor.dims()
        ))
    })
}

impl Attention for ExactAttention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        config: &Config,
    ) -> Result<Tensor, AttentionError> {
        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::reference init dtype={:?} dropout={:?}",
                q.dtype(),
                config.dropout_p
            );
        }

        if let Some(p) = config.dropout_p {
            if !p.is_finite() || !(0.0..=1.0).contains(&p) {
                return Err(AttentionError::InvalidConfig {
                    context: format!("dropout probability must be in [0, 1], got {p}"),
                });
            }
        }

        let device = q.device();
        if !device.same_device(k.device()) || !device.same_device(v.device()) {
            return Err(AttentionError::shape("q, k, v must reside on the same device"));
        }

        let dtype = q.dtype();
        if dtype != k.dtype() || dtype != v.dtype() {
            return Err(AttentionError::shape("q, k, v must share the same dtype"));
        }
        if !Self::supports_dtype(dtype) {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("{dtype:?}"),
            });
        }

        let (batch, heads, q_len, head_dim) = dims4("q", q)?;
        let (kb, kh, k_len, kd) = dims4("k", k)?;
        let (vb, vh, v_len, vd) = dims4("v", v)?;

        if kb != batch || kh != heads || kd != head_dim {
            return Err(AttentionError::shape(format!(
                "k shape mismatch: expected [{batch}, {heads}, ?, {head_dim}] got [{kb}, {kh}, {k_len}, {kd}]"
            )));
        }
        if vb != batch || vh != heads || v_len != k_len || vd != head_dim {
            return Err(AttentionError::shape(format!(
                "v shape mismatch: expected [{batch}, {heads}, {k_len}, {head_dim}] got [{vb}, {vh}, {v_len}, {vd}]"
            )));
        }
        if batch == 0 || heads == 0 || q_len == 0 || k_len == 0 || head_dim == 0 {
            return Err(AttentionError::shape(format!(
                "attention requires non-empty inputs, got q [{batch}, {heads}, {q_len}, {head_dim}] and k_len {k_len}"
            )));
        }

        let (q_work, k_work, v_work) = (
            q.to_dtype(DType::F32)?,
            k.to_dtype(DType::F32)?,
            v.to_dtype(DType::F32)?,
        );

        let merged = batch * heads;
        let q_view = q_work.contiguous()?.reshape((merged, q_len, head_dim))?;
        let k_view = k_work.contiguous()?.reshape((merged, k_len, head_dim))?;
        let v_view = v_work.contiguous()?.reshape((merged, k_len, head_dim))?;

        let scale = 1.0 / (head_dim as f64).sqrt();
        let scores = q_view
            .matmul(&k_view.t()?.contiguous()?)?
            .affine(scale, 0.0)?;
        let probs = softmax_last_dim(&scores)?;

        let probs = match config.effective_dropout() {
            Some(p) if p >= 1.0 => probs.zeros_like()?,
            Some(p) => dropout(&probs, p)?,
            None => probs,
        };

        let output = probs
            .matmul(&v_view)?
            .reshape((batch, heads, q_len, head_dim))?;
        Ok(output.to_dtype(dtype)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Result as CandleResult};

    fn build_inputs(device: &Device, seq: usize) -> CandleResult<(Tensor, Tensor, Tensor)> {
        let shape = (1, 2, seq, 8);
        let n = 2 * seq * 8;
        let q: Vec<f32> = (0..n).map(|i| i as f32 * 0.01).collect();
        let k: Vec<f32> = (0..n).map(|i| (i * 7 % 13) as f32 * 0.05).collect();
        let v: Vec<f32> = (0..n).map(|i| (i % 5) as f32 - 2.0).collect();
        let q = Tensor::from_vec(q, shape, device)?;
        let k = Tensor::from_vec(k, shape, device)?;
        let v = Tensor::from_vec(v, shape, device)?;
        Ok((q, k, v))
    }

    fn naive_attention(q: &Tensor, k: &Tensor, v: &Tensor) -> CandleResult<Vec<f32>> {
        let (batch, heads, q_len, head_dim) = q.dims4()?;
        let (_, _, k_len, _) = k.dims4()?;
        let q = q.flatten_all()?.to_vec1::<f32>()?;
        let k = k.flatten_all()?.to_vec1::<f32>()?;
        let v = v.flatten_all()?.to_vec1::<f32>()?;
        let scale = 1.0 / (head_dim as f32).sqrt();
        let mut output = vec![0f32; batch * heads * q_len * head_dim];

        for bh in 0..batch * heads {
            for qi in 0..q_len {
                let scores = (0..k_len)
                    .map(|ki| {
                        (0..head_dim)
                            .map(|d| {
                                let qv = q[(bh * q_len + qi) * head_dim + d];
                                qv * k[(bh * k_len + ki) * head_dim + d]
                            })
                            .sum::<f32>()
                            * scale
                    })
                    .collect::<Vec<_>>();
                let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let exp = scores.iter().map(|s| (s - max).exp()).collect::<Vec<_>>();
                let denom = exp.iter().sum::<f32>();
                for d in 0..head_dim {
                    output[(bh * q_len + qi) * head_dim + d] = (0..k_len)
                        .map(|ki| exp[ki] / denom * v[(bh * k_len + ki) * head_dim + d])
                        .sum();
                }
            }
        }
        Ok(output)
    }

    #[test]
    fn exact_attention_matches_naive() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device, 4)?;
        let output = ExactAttention::new()
            .attend(&q, &k, &v, &Config::default())
            .unwrap();
        let expected = naive_attention(&q, &k, &v)?;
        let actual = output.flatten_all()?.to_vec1::<f32>()?;
        let max = actual
            .iter()
            .zip(expected.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0f32, f32::max);
        assert!(max < 1e-4, "max diff {max}");
        Ok(())
    }

    #[test]
    fn every_query_sees_every_key() -> CandleResult<()> {
        // With identical keys the softmax is uniform, so each output row is
        // the mean of all value rows, including later positions.
        let device = Device::Cpu;
        let q = Tensor::ones((1, 1, 3, 2), DType::F32, &device)?;
        let k = Tensor::ones((1, 1, 3, 2), DType::F32, &device)?;
        let v = Tensor::from_vec(vec![0f32, 0., 3., 3., 6., 6.], (1, 1, 3, 2), &device)?;
        let out = ExactAttention::new()
            .attend(&q, &k, &v, &Config::default())
            .unwrap()
            .flatten_all()?
            .to_vec1::<f32>()?;
        assert!(out.iter().all(|x| (x - 3.0).abs() < 1e-5));
        Ok(())
    }

    #[test]
    fn mismatched_shapes_error() {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 2, 4, 8), DType::F32, &device).unwrap();
        let k = Tensor::zeros((1, 2, 5, 8), DType::F32, &device).unwrap();
        let v = Tensor::zeros((1, 2, 4, 8), DType::F32, &device).unwrap();
        let err = ExactAttention::new()
            .attend(&q, &k, &v, &Config::default())
            .unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));
    }

    #[test]
    fn empty_sequences_error() {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 2, 0, 8), DType::F32, &device).unwrap();
        let err = ExactAttention::new()
            .attend(&q, &q, &q, &Config::default())
            .unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));
    }

    #[test]
    fn half_precision_tracks_f32() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device, 4)?;
        let reference = ExactAttention::new()
            .attend(&q, &k, &v, &Config::default())
            .unwrap();
        for dtype in [DType::BF16, DType::F16] {
            let out = ExactAttention::new()
                .attend(
                    &q.to_dtype(dtype)?,
                    &k.to_dtype(dtype)?,
                    &v.to_dtype(dtype)?,
                    &Config::default(),
                )
                .unwrap();
            assert_eq!(out.dtype(), dtype);
            let max = out
                .to_dtype(DType::F32)?
                .sub(&reference)?
                .abs()?
                .max_all()?
                .to_vec0::<f32>()?;
            assert!(max < 5e-2, "dtype {dtype:?} diverged by {max}");
        }
        Ok(())
    }

    #[test]
    fn numerical_stability() -> CandleResult<()> {
        let device = Device::Cpu;
        let q = Tensor::full(10_000.0f32, (1, 1, 4, 4), &device)?;
        let k = Tensor::full(-10_000.0f32, (1, 1, 4, 4), &device)?;
        let v = Tensor::ones((1, 1, 4, 4), DType::F32, &device)?;
        let out = ExactAttention::new()
            .attend(&q, &k, &v, &Config::default())
            .unwrap()
            .flatten_all()?
            .to_vec1::<f32>()?;
        assert!(out.iter().all(|value| value.is_finite()));
        Ok(())
    }

    #[test]
    fn dropout_is_ignored_outside_training() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device, 4)?;
        let eval = Config::with_dropout(Some(0.9));
        let a = ExactAttention::new().attend(&q, &k, &v, &eval).unwrap();
        let b = ExactAttention::new()
            .attend(&q, &k, &v, &Config::default())
            .unwrap();
        let diff = a.sub(&b)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }

    #[test]
    fn f64_inputs_are_rejected() {
        assert!(!ExactAttention::supports_dtype(DType::F64));
        let q = Tensor::zeros((1, 1, 2, 2), DType::F64, &Device::Cpu).unwrap();
        let err = ExactAttention::new()
            .attend(&q, &q, &q, &Config::default())
            .unwrap_err();
        assert!(matches!(err, AttentionError::UnsupportedDType { .. }));
    }

    #[test]
    fn out_of_range_dropout_is_a_config_error() {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 1, 2, 2), DType::F32, &device).unwrap();
        let config = Config::with_dropout(Some(1.5));
        let err = ExactAttention::new().attend(&q, &q, &q, &config).unwrap_err();
        assert!(matches!(err, AttentionError::InvalidConfig { .. }));
    }
}
