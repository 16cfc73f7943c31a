//! Perlin attention: a learned sparse approximation of softmax self-attention.
//!
//! A Performer-style low-rank estimator approximates each head's context in
//! linear time. A small predictor turns that context into a coarse score grid
//! of width `attention_predictor_length`, from which a fixed-budget top-k mask
//! is synthesized and resized to the true sequence length. The composer runs
//! exact attention only through the open slots, blends in an average-pooled
//! fallback and optional random lookups, and (in training) returns a
//! distillation loss against a dense teacher.
//!
//! Per-head tensors use `[batch, heads, seq_len, head_dim]`. Additive masks
//! use `0` for open and [`masks::fp_min`] for blocked positions, shaped
//! `[batch, 1, seq_len | 1, seq_len]`. The estimator and all loss reductions
//! run in `f32` regardless of the activation dtype.

pub mod attention;
pub mod composer;
pub mod core;
pub mod diagnostics;
pub mod estimator;
pub mod loss;
pub mod masks;
pub mod predictor;
pub mod reference;
pub mod resize;
pub mod sparse;

pub use attention::{PerlinAttention, PerlinAttentionOutput, PerlinInputs, TeacherTargets};
pub use crate::core::{FlattenDim, PerlinConfig, PerlinError, PerlinResult, PredictorMethod};
pub use loss::LossTerms;
pub use reference::{DenseAttention, ExactAttention};
