//! Fixed-budget sparse mask synthesis from predicted scores.
//!
//! Scores arrive at predictor resolution `R` along the key axis. Blocked keys
//! (per the attention mask resized to `R`) are filled with the sentinel before
//! a softmax turns each row into estimated probabilities. A top-k selection
//! then opens `clamp(round(k * R / T), 1, R)` slots per row, either per row or
//! over a flattened `(head x) query x key` view. The selection is resized back
//! to `T x T` with nearest sampling and intersected with the attention mask.

use candle_core::{DType, Device, Tensor, D};
use candle_nn::ops::softmax;

use crate::{
    core::{FlattenDim, PerlinConfig, PerlinError, PerlinResult},
    masks::{additive_from_open, fp_min, key_validity, open_positions, valid_key_counts, OPEN_THRESHOLD},
    resize::{interpolate, ResizeMode},
};

/// Ranks are stored in `f32`, which is exact up to this many slots.
const MAX_FLAT_EXTENT: usize = 1 << 24;

/// Per-row budget at predictor resolution.
pub fn budget(k: usize, resolution: usize, seq_len: usize) -> usize {
    let scaled = (k as f64 * resolution as f64 / seq_len as f64).round_ties_even() as usize;
    scaled.clamp(1, resolution)
}

/// Result of one synthesis pass.
#[derive(Debug, Clone)]
pub struct SparseMask {
    /// Additive mask `[batch, heads, T, T]` in the activation dtype.
    pub mask: Tensor,
    /// `1.0` where the final mask is open, `[batch, heads, T, T]` in `f32`.
    pub open: Tensor,
    /// Selected slots at predictor resolution `[batch, heads, T, R]` in `f32`.
    pub selected: Tensor,
    /// Row-wise softmax of the masked scores `[batch, heads, T, R]` in `f32`.
    pub estimated_probs: Tensor,
    pub top_k: usize,
}

/// Turns predicted scores into a top-k additive mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskSynthesizer {
    k: usize,
    flatten: Option<FlattenDim>,
}

impl MaskSynthesizer {
    pub fn new(k: usize, flatten: Option<FlattenDim>) -> Self {
        Self { k, flatten }
    }

    pub fn from_config(config: &PerlinConfig) -> Self {
        Self::new(config.k, config.k_flatten.then_some(config.k_flatten_dim))
    }

    /// Builds the sparse mask for `scores` `[batch, heads, T, R]` under
    /// `attention_mask` `[batch, 1, T | 1, T]`. The returned additive mask uses `dtype`.
    pub fn synthesize(
        &self,
        scores: &Tensor,
        attention_mask: &Tensor,
        dtype: DType,
    ) -> PerlinResult<SparseMask> {
        fp_min(dtype)?;
        let (batch, heads, seq, resolution) = scores.dims4()?;
        let (mb, mh, mq, mk) = attention_mask.dims4()?;
        if mb != batch || mh != 1 || (mq != 1 && mq != seq) || mk != seq {
            return Err(PerlinError::shape(format!(
                "attention mask {:?} incompatible with scores {:?}",
                attention_mask.dims(),
                scores.dims()
            )));
        }
        let device = scores.device();
        let shape = (batch, heads, seq, resolution);

        let mask_small = interpolate(
            &attention_mask.to_dtype(DType::F32)?,
            (mq, resolution),
            Some(ResizeMode::Nearest),
        )?;
        let blocked = mask_small
            .le(OPEN_THRESHOLD)?
            .broadcast_as(shape)?
            .contiguous()?;
        let fill = Tensor::full(fp_min(DType::F32)? as f32, shape, device)?;
        let masked = blocked.where_cond(&fill, &scores.to_dtype(DType::F32)?)?;
        let estimated_probs = softmax(&masked, D::Minus1)?;

        let top_k = budget(self.k, resolution, seq);
        let ranking = estimated_probs.detach();
        let selected = match self.flatten {
            None => select_per_row(&ranking, top_k)?,
            Some(dim) => {
                let weighted = ranking
                    .broadcast_mul(&open_positions(&mask_small)?)?
                    .broadcast_mul(&key_validity(attention_mask)?.reshape((batch, 1, seq, 1))?)?;
                let token_lengths = valid_key_counts(attention_mask)?;
                select_flattened(&weighted, top_k, dim, &token_lengths)?
            }
        };

        let selected_full = interpolate(&selected, (seq, seq), Some(ResizeMode::Nearest))?;
        let open = selected_full.broadcast_mul(&open_positions(attention_mask)?)?;
        let mask = additive_from_open(&open, dtype)?;

        Ok(SparseMask {
            mask,
            open,
            selected,
            estimated_probs,
            top_k,
        })
    }
}

/// Opens the `top_k` most probable slots of every row.
fn select_per_row(probs: &Tensor, top_k: usize) -> PerlinResult<Tensor> {
    let (batch, heads, seq, resolution) = probs.dims4()?;
    let device = probs.device();
    let chosen = probs
        .contiguous()?
        .arg_sort_last_dim(false)?
        .narrow(3, 0, top_k)?
        .contiguous()?;
    let ones = Tensor::ones((batch, heads, seq, top_k), DType::F32, device)?;
    let selected = Tensor::zeros((batch, heads, seq, resolution), DType::F32, device)?
        .scatter_add(&chosen, &ones, 3)?;
    Ok(selected)
}

/// Global top-k over a flattened view with the per-token dead-slot correction.
///
/// A slot of rank `r` (1-based) survives when `r <= tokens * top_k * heads_per_row`.
fn select_flattened(
    probs: &Tensor,
    top_k: usize,
    dim: FlattenDim,
    token_lengths: &[usize],
) -> PerlinResult<Tensor> {
    let (batch, heads, seq, resolution) = probs.dims4()?;
    let device = probs.device();
    let (rows, extent, heads_per_row) = match dim {
        FlattenDim::Batch => (batch, heads * seq * resolution, heads),
        FlattenDim::Head => (batch * heads, seq * resolution, 1),
    };
    if extent > MAX_FLAT_EXTENT {
        return Err(PerlinError::shape(format!(
            "flattened top-k extent {} exceeds {}",
            extent, MAX_FLAT_EXTENT
        )));
    }

    let requested = top_k * seq * heads_per_row;
    let count = requested.min(extent);
    if count < requested {
        log::debug!(
            "perlin flattened budget clamped from {} to {} slots",
            requested,
            count
        );
    }

    let flat = probs.reshape((rows, extent))?.contiguous()?;
    let order = flat
        .arg_sort_last_dim(false)?
        .narrow(1, 0, count)?
        .contiguous()?;
    let ranks = Tensor::arange(1u32, count as u32 + 1, device)?
        .to_dtype(DType::F32)?
        .reshape((1, count))?
        .broadcast_as((rows, count))?
        .contiguous()?;
    let rank_map =
        Tensor::zeros((rows, extent), DType::F32, device)?.scatter_add(&order, &ranks, 1)?;

    let limits = row_limits(rows, dim, heads, top_k, heads_per_row, token_lengths, device)?;
    let alive = rank_map
        .ge(1.0)?
        .to_dtype(DType::F32)?
        .mul(&rank_map.broadcast_le(&limits)?.to_dtype(DType::F32)?)?;
    Ok(alive.reshape((batch, heads, seq, resolution))?)
}

fn row_limits(
    rows: usize,
    dim: FlattenDim,
    heads: usize,
    top_k: usize,
    heads_per_row: usize,
    token_lengths: &[usize],
    device: &Device,
) -> PerlinResult<Tensor> {
    let limits = (0..rows)
        .map(|row| {
            let batch_index = match dim {
                FlattenDim::Batch => row,
                FlattenDim::Head => row / heads,
            };
            (token_lengths[batch_index] * top_k * heads_per_row) as f32
        })
        .collect::<Vec<_>>();
    Ok(Tensor::from_vec(limits, (rows, 1), device)?)
}
