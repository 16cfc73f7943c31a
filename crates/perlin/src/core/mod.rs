//! Core types shared across the Perlin attention pipeline.
//!
//! Per-head tensors use the layout `[batch, heads, seq_len, head_dim]`; merged
//! outputs use `[batch, seq_len, heads * head_dim]`.

pub mod config;
pub mod errors;

use candle_core::{Result, Tensor};

pub use config::{FlattenDim, PerlinConfig, PredictorMethod};
pub use errors::{PerlinError, PerlinResult};

/// Folds `[batch, heads, seq, dim]` into `[batch, seq, heads * dim]`.
pub fn merge_heads(tensor: &Tensor) -> Result<Tensor> {
    let (batch, heads, seq, dim) = tensor.dims4()?;
    tensor
        .permute((0, 2, 1, 3))?
        .contiguous()?
        .reshape((batch, seq, heads * dim))
}

/// Splits `[batch, seq, heads * dim]` into `[batch, heads, seq, dim]`.
pub fn split_heads(tensor: &Tensor, heads: usize) -> Result<Tensor> {
    let (batch, seq, hidden) = tensor.dims3()?;
    tensor
        .reshape((batch, seq, heads, hidden / heads))?
        .permute((0, 2, 1, 3))?
        .contiguous()
}
