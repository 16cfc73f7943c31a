//! Builders for causal attention masks.

use candle_core::{DType, Device, Tensor};

use crate::core::PerlinResult;

use super::fp_min;

/// Causal mask `[batch, 1, q_len, k_len]`.
///
/// When `k_len > q_len`, queries are aligned with the most recent `q_len` keys.
pub fn build_causal_mask(
    device: &Device,
    dtype: DType,
    batch: usize,
    q_len: usize,
    k_len: usize,
) -> PerlinResult<Tensor> {
    let sentinel = fp_min(dtype)? as f32;
    let offset = k_len.saturating_sub(q_len);
    let row = (0..q_len)
        .flat_map(|q| (0..k_len).map(move |k| if k > q + offset { sentinel } else { 0.0 }))
        .collect::<Vec<_>>();
    let data = row.repeat(batch);
    let mask = Tensor::from_vec(data, (batch, 1, q_len, k_len), device)?;
    Ok(mask.to_dtype(dtype)?)
}
