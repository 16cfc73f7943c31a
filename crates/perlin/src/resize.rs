//! Resampling of the last two axes of `[batch, channels, height, width]` tensors.
//!
//! Nearest mode is a pure gather and preserves the exact set of input values,
//! which keeps additive masks two-valued. Bilinear and area modes are expressed
//! as per-axis weight matrices applied with matmuls so they stay differentiable.
//! `bf16` inputs are resized in `f16` for the matmul modes and cast back.

use candle_core::{DType, Device, Result, Tensor};

/// Resampling algorithm for [`interpolate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeMode {
    /// Index copy from `floor(dst * in / out)`.
    Nearest,
    /// Linear blend with half-pixel centres (`align_corners = false`).
    Bilinear,
    /// Adaptive average pooling over the covered source span.
    Area,
}

impl ResizeMode {
    /// Bilinear when the width grows (or stays), area when it shrinks.
    pub fn auto(input_width: usize, output_width: usize) -> Self {
        if output_width >= input_width {
            ResizeMode::Bilinear
        } else {
            ResizeMode::Area
        }
    }
}

/// Resizes the last two axes of a rank-4 tensor to `size = (height, width)`.
///
/// With `mode = None` the mode is picked by [`ResizeMode::auto`].
pub fn interpolate(input: &Tensor, size: (usize, usize), mode: Option<ResizeMode>) -> Result<Tensor> {
    let (batch, channels, in_h, in_w) = input.dims4()?;
    let (out_h, out_w) = size;
    if (in_h, in_w) == (out_h, out_w) {
        return Ok(input.clone());
    }
    let mode = mode.unwrap_or_else(|| ResizeMode::auto(in_w, out_w));

    if mode == ResizeMode::Nearest {
        let device = input.device();
        let rows = nearest_indices(in_h, out_h, device)?;
        let cols = nearest_indices(in_w, out_w, device)?;
        return input
            .contiguous()?
            .index_select(&rows, 2)?
            .index_select(&cols, 3);
    }

    let original = input.dtype();
    let work_dtype = match original {
        DType::BF16 => DType::F16,
        DType::F16 | DType::F32 | DType::F64 => original,
        other => candle_core::bail!("{:?} resize does not support dtype {:?}", mode, other),
    };
    let work = input.to_dtype(work_dtype)?;
    let device = input.device();
    let width = axis_weights(mode, in_w, out_w, device)?.to_dtype(work_dtype)?;
    let height = axis_weights(mode, in_h, out_h, device)?.to_dtype(work_dtype)?;

    let flat = work.reshape((batch * channels, in_h, in_w))?;
    let resized_w = flat.broadcast_matmul(&width.t()?.contiguous()?)?;
    let resized = height.broadcast_matmul(&resized_w)?;
    resized
        .reshape((batch, channels, out_h, out_w))?
        .to_dtype(original)
}

fn nearest_indices(input: usize, output: usize, device: &Device) -> Result<Tensor> {
    let indices = (0..output)
        .map(|dst| ((dst * input) / output).min(input - 1) as u32)
        .collect::<Vec<_>>();
    Tensor::from_vec(indices, output, device)
}

/// Dense `(output, input)` weight matrix for one axis.
fn axis_weights(mode: ResizeMode, input: usize, output: usize, device: &Device) -> Result<Tensor> {
    let mut weights = vec![0f32; output * input];
    let scale = input as f64 / output as f64;
    for dst in 0..output {
        let row = &mut weights[dst * input..(dst + 1) * input];
        match mode {
            ResizeMode::Bilinear => {
                let src = ((dst as f64 + 0.5) * scale - 0.5).max(0.0);
                let lo = (src.floor() as usize).min(input - 1);
                let hi = (lo + 1).min(input - 1);
                let frac = (src - lo as f64) as f32;
                row[lo] += 1.0 - frac;
                row[hi] += frac;
            }
            ResizeMode::Area => {
                let start = (dst * input) / output;
                let end = ((dst + 1) * input).div_ceil(output);
                let share = 1.0 / (end - start) as f32;
                row[start..end].fill(share);
            }
            ResizeMode::Nearest => row[((dst * input) / output).min(input - 1)] = 1.0,
        }
    }
    Tensor::from_vec(weights, (output, input), device)
}
