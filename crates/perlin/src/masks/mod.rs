//! Additive attention masks and the per-dtype blocking sentinel.
//!
//! Masks are shaped `[batch, 1, q_len | 1, k_len]` and hold exactly two
//! values: `0.0` where attention is allowed and [`fp_min`] where it is
//! blocked. Any entry greater than `-1` is treated as open. Masks are built in
//! the dtype of the activations they are added to so the sentinel survives
//! the round trip unchanged.

pub mod causal;
pub mod padding;

use candle_core::{DType, Result, Tensor, D};

use crate::core::{PerlinError, PerlinResult};

pub use causal::build_causal_mask;
pub use padding::padding_mask_from_lengths;

/// Threshold separating open (`> OPEN_THRESHOLD`) from blocked entries.
pub const OPEN_THRESHOLD: f64 = -1.0;

/// Large negative value used to block attention in `dtype`.
///
/// Half formats use `-32752`, which stays finite after adding a score of
/// ordinary magnitude; `f32` uses half of its most negative finite value.
pub fn fp_min(dtype: DType) -> PerlinResult<f64> {
    match dtype {
        DType::F16 | DType::BF16 => Ok(-32752.0),
        DType::F32 => Ok(f64::from(f32::MIN) / 2.0),
        other => Err(PerlinError::UnsupportedDType(other)),
    }
}

/// `1.0` where `mask` is open and `0.0` where it is blocked, in `f32`.
pub fn open_positions(mask: &Tensor) -> Result<Tensor> {
    mask.gt(OPEN_THRESHOLD)?.to_dtype(DType::F32)
}

/// Converts a `{0, 1}` open map into an additive mask in `dtype`.
pub fn additive_from_open(open: &Tensor, dtype: DType) -> PerlinResult<Tensor> {
    let sentinel = fp_min(dtype)?;
    let additive = open.to_dtype(DType::F32)?.affine(-sentinel, sentinel)?;
    Ok(additive.to_dtype(dtype)?)
}

/// Intersects two additive masks; the result is open only where both are.
pub fn combine_masks(lhs: &Tensor, rhs: &Tensor) -> Result<Tensor> {
    lhs.broadcast_minimum(rhs)
}

/// Per-key validity `[batch, k_len]` in `f32`: a key is valid when any query may attend to it.
pub fn key_validity(mask: &Tensor) -> Result<Tensor> {
    let (batch, _, _, k_len) = mask.dims4()?;
    open_positions(mask)?
        .max_keepdim(2)?
        .max_keepdim(1)?
        .reshape((batch, k_len))
}

/// Number of valid keys in each batch element.
pub fn valid_key_counts(mask: &Tensor) -> Result<Vec<usize>> {
    let counts = key_validity(mask)?.sum(D::Minus1)?.to_vec1::<f32>()?;
    Ok(counts.into_iter().map(|count| count.round() as usize).collect())
}

#[cfg(test)]
mod tests;
