//! Builders for padding masks used to drop padded keys.

use candle_core::{DType, Device, Tensor};

use crate::core::PerlinResult;

use super::fp_min;

/// Padding mask `[batch, 1, q_len, k_len]` from per-batch valid key lengths.
pub fn padding_mask_from_lengths(
    device: &Device,
    dtype: DType,
    key_lengths: &[usize],
    q_len: usize,
    k_len: usize,
) -> PerlinResult<Tensor> {
    let sentinel = fp_min(dtype)? as f32;
    let batch = key_lengths.len();
    let mut data = vec![0f32; batch * q_len * k_len];

    for (b, &valid) in key_lengths.iter().enumerate() {
        let valid = valid.min(k_len);
        for q in 0..q_len {
            let row_start = (b * q_len + q) * k_len;
            data[row_start + valid..row_start + k_len].fill(sentinel);
        }
    }

    let mask = Tensor::from_vec(data, (batch, 1, q_len, k_len), device)?;
    Ok(mask.to_dtype(dtype)?)
}
