//! Lightweight validation helpers shared across layer components.
//!
//! These routines provide concise shape and dtype assertions that can be wired
//! into constructors or forward paths. They return `candle_core::Result<()>`
//! so call sites can propagate errors without panicking. The `name` argument
//! is a dotted label (`"linear.weight"`) that ends up in the message.

use candle_core::{bail, DType, Result, Tensor};

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(name: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    let actual = tensor.dims();
    if actual == expected {
        Ok(())
    } else {
        bail!("{name}: expected shape {:?}, got {:?}", expected, actual)
    }
}

/// Ensures a tensor has exactly `rank` dimensions.
pub fn expect_rank(name: &str, tensor: &Tensor, rank: usize) -> Result<()> {
    let actual = tensor.rank();
    if actual == rank {
        Ok(())
    } else {
        bail!(
            "{name}: expected rank {rank}, got rank {actual} with shape {:?}",
            tensor.dims()
        )
    }
}

/// Validates the `(batch, seq, hidden)` convention with a known hidden size.
pub fn expect_batch_seq_hidden(name: &str, tensor: &Tensor, hidden: usize) -> Result<()> {
    match tensor.dims() {
        [_, _, actual_hidden] if *actual_hidden == hidden => Ok(()),
        dims => bail!("{name}: expected (batch, seq, {hidden}) layout, got {:?}", dims),
    }
}

/// Rejects `(batch, seq, hidden)` tensors with an empty batch or sequence.
pub fn expect_non_empty_sequence(name: &str, tensor: &Tensor) -> Result<()> {
    match tensor.dims() {
        [batch, seq, _] if *batch > 0 && *seq > 0 => Ok(()),
        dims => bail!("{name}: batch and sequence dimensions must be non-zero, got {:?}", dims),
    }
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(name: &str, tensor: &Tensor, allowed: &[DType]) -> Result<()> {
    let dtype = tensor.dtype();
    if allowed.contains(&dtype) {
        Ok(())
    } else {
        bail!("{name}: expected dtype in {:?}, got {:?}", allowed, dtype)
    }
}

/// Checks two tensors share a dtype.
pub fn expect_same_dtype(
    left_name: &str,
    left: &Tensor,
    right_name: &str,
    right: &Tensor,
) -> Result<()> {
    if left.dtype() == right.dtype() {
        Ok(())
    } else {
        bail!(
            "{left_name} has dtype {:?} but {right_name} has dtype {:?}",
            left.dtype(),
            right.dtype()
        )
    }
}

/// Parameters handed to constructors must be laid out contiguously.
pub fn expect_contiguous(name: &str, tensor: &Tensor) -> Result<()> {
    if tensor.is_contiguous() {
        Ok(())
    } else {
        bail!("{name}: tensor must be contiguous")
    }
}

/// Only float dtypes take part in parameter and activation casts.
pub fn ensure_cast_supported(name: &str, from: DType, to: DType) -> Result<()> {
    let float = |dtype: DType| matches!(dtype, DType::F16 | DType::BF16 | DType::F32 | DType::F64);
    if float(from) && float(to) {
        Ok(())
    } else {
        bail!("{name}: unsupported cast from {:?} to {:?}", from, to)
    }
}
