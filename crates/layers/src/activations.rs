//! Non-linearity used inside the encoder feed-forward sublayer.
//!
//! The vision-transformer blocks of the group use the exact (erf based) GELU,
//! `0.5 * x * (1 + erf(x / sqrt(2)))`. Inputs are promoted to the compute
//! dtype before evaluation and cast back to the storage dtype afterwards.

use candle_core::{Result, Tensor};

use crate::dtypes::PrecisionPolicy;

/// Applies the erf GELU to `input` using the precision rules in `policy`.
pub fn gelu(input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
    let compute = policy.cast_for_matmul(input)?;
    policy.cast_to_storage(&compute.gelu_erf()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use std::f64::consts::SQRT_2;

    #[test]
    fn gelu_matches_erf_formula() -> Result<()> {
        let device = Device::Cpu;
        let input = Tensor::from_slice(&[-2.5f32, -0.5, 0.0, 1.0, 3.0], (5,), &device)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let output = gelu(&input, &policy)?;

        let erf = input.affine(1.0 / SQRT_2, 0.0)?.erf()?;
        let reference = input.affine(0.5, 0.0)?.mul(&erf.affine(1.0, 1.0)?)?;

        let diff = output.sub(&reference)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 5e-6);
        Ok(())
    }

    #[test]
    fn half_precision_keeps_storage_dtype() -> Result<()> {
        let device = Device::Cpu;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F16);
        let input = Tensor::from_slice(&[0.0f32, 2.0], (2,), &device)?.to_dtype(DType::F16)?;
        let output = gelu(&input, &policy)?;
        assert_eq!(output.dtype(), DType::F16);
        let values = output.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        assert_eq!(values[0], 0.0);
        assert!((values[1] - 1.9545).abs() < 1e-2);
        Ok(())
    }
}
