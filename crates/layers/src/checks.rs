//! Lightweight validation helpers shared across layer components.
//!
//! These routines provide concise shape and dtype assertions that can be wired
//! into constructors or forward paths. They return `candle_core::Result<()>`
//! so call sites can propagate errors without panicking. Every helper takes a
//! label naming the tensor so failures point at the offending argument.

use candle_core::{DType, Error, Result, Tensor};

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(label: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    let actual = tensor.dims();
    if actual == expected {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{}: expected shape {:?}, got {:?}",
            label, expected, actual
        )))
    }
}

/// Ensures a tensor has exactly `rank` dimensions.
pub fn expect_rank(label: &str, tensor: &Tensor, rank: usize) -> Result<()> {
    if tensor.rank() == rank {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{}: expected rank {}, got {:?}",
            label,
            rank,
            tensor.dims()
        )))
    }
}

/// Ensures the trailing dimension equals `size`.
pub fn expect_last_dim(label: &str, tensor: &Tensor, size: usize) -> Result<()> {
    match tensor.dims().last() {
        Some(&last) if last == size => Ok(()),
        _ => Err(Error::Msg(format!(
            "{}: expected trailing dim {}, got {:?}",
            label,
            size,
            tensor.dims()
        ))),
    }
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(label: &str, tensor: &Tensor, allowed: &[DType]) -> Result<()> {
    let dtype = tensor.dtype();
    if allowed.iter().copied().any(|allowed| allowed == dtype) {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{}: expected dtype in {:?}, got {:?}",
            label, allowed, dtype
        )))
    }
}

/// Requires two tensors to share a dtype.
pub fn expect_same_dtype(
    lhs_label: &str,
    lhs: &Tensor,
    rhs_label: &str,
    rhs: &Tensor,
) -> Result<()> {
    if lhs.dtype() == rhs.dtype() {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{} has dtype {:?} but {} has dtype {:?}",
            lhs_label,
            lhs.dtype(),
            rhs_label,
            rhs.dtype()
        )))
    }
}

/// Rejects casts between integer and floating formats.
pub fn ensure_cast_supported(label: &str, from: DType, to: DType) -> Result<()> {
    if from.is_float() == to.is_float() {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{}: unsupported cast from {:?} to {:?}",
            label, from, to
        )))
    }
}
