//! Knock-off distillation loss between the sparse student and a dense teacher.
//!
//! All reductions run in `f32` regardless of the activation dtype.

use candle_core::{DType, Result, Tensor, D};
use candle_nn::ops::{log_softmax, softmax};

use crate::masks::{key_validity, open_positions};

const KL_WEIGHT: f64 = 0.1;
const SCORES_WEIGHT: f64 = 0.5;
const LOG_EPSILON: f64 = 1e-12;

/// Scalar values of the four loss terms, after weighting.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LossTerms {
    pub kl: f32,
    pub probs_mse: f32,
    pub scores_mse: f32,
    pub context_mse: f32,
}

impl LossTerms {
    pub fn total(&self) -> f32 {
        self.kl + self.probs_mse + self.scores_mse + self.context_mse
    }
}

/// Tensors entering the loss. Scores are raw (pre-mask) `[batch, heads, T, T]`.
#[derive(Debug)]
pub struct LossInputs<'a> {
    /// Predicted scores resized to `T x T`.
    pub estimated_scores: &'a Tensor,
    /// Dense student scores `q k^T / sqrt(d)`.
    pub dense_scores: &'a Tensor,
    pub teacher_scores: &'a Tensor,
    /// Final merged context `[batch, T, hidden]`.
    pub context: &'a Tensor,
    pub teacher_context: &'a Tensor,
    /// Additive attention mask `[batch, 1, T | 1, T]`.
    pub attention_mask: &'a Tensor,
}

/// Loss scalar plus its per-term breakdown.
#[derive(Debug, Clone)]
pub struct DistillationLoss {
    pub total: Tensor,
    pub terms: LossTerms,
    /// `softmax(estimated_scores + mask)`, reused for diagnostics.
    pub estimated_probs: Tensor,
}

/// `0.1 * KL(teacher || estimate)` averaged over unpadded query rows, plus
/// `MSE(estimate, teacher)` on probabilities, `0.5 * MSE` on blocked-zeroed
/// dense scores, and `MSE` on the final context.
pub fn distillation_loss(inputs: &LossInputs<'_>) -> Result<DistillationLoss> {
    let mask = inputs.attention_mask.to_dtype(DType::F32)?;
    let estimated = inputs
        .estimated_scores
        .to_dtype(DType::F32)?
        .broadcast_add(&mask)?;
    let teacher = inputs
        .teacher_scores
        .to_dtype(DType::F32)?
        .broadcast_add(&mask)?;

    let teacher_probs = softmax(&teacher, D::Minus1)?.detach();
    let estimated_log = log_softmax(&estimated, D::Minus1)?;
    let estimated_probs = softmax(&estimated, D::Minus1)?;

    let open = open_positions(&mask)?;
    let (batch, heads, seq, _) = estimated.dims4()?;
    let row_valid = key_validity(&mask)?
        .reshape((batch, 1, seq, 1))?
        .broadcast_as((batch, heads, seq, 1))?;
    let kl_rows = teacher_probs
        .mul(&((&teacher_probs + LOG_EPSILON)?.log()? - &estimated_log)?)?
        .sum_keepdim(D::Minus1)?
        .mul(&row_valid)?;
    let valid_rows = row_valid.sum_all()?.maximum(1.0)?;
    let kl = (kl_rows.sum_all()?.div(&valid_rows)? * KL_WEIGHT)?;

    let probs_mse = mse(&estimated_probs, &teacher_probs)?;

    let dense = inputs.dense_scores.to_dtype(DType::F32)?.broadcast_mul(&open)?;
    let teacher_dense = inputs
        .teacher_scores
        .to_dtype(DType::F32)?
        .broadcast_mul(&open)?
        .detach();
    let scores_mse = (mse(&dense, &teacher_dense)? * SCORES_WEIGHT)?;

    let context_mse = mse(
        &inputs.context.to_dtype(DType::F32)?,
        &inputs.teacher_context.to_dtype(DType::F32)?.detach(),
    )?;

    let terms = LossTerms {
        kl: kl.to_vec0::<f32>()?,
        probs_mse: probs_mse.to_vec0::<f32>()?,
        scores_mse: scores_mse.to_vec0::<f32>()?,
        context_mse: context_mse.to_vec0::<f32>()?,
    };
    let total = (((kl + probs_mse)? + scores_mse)? + context_mse)?;
    Ok(DistillationLoss {
        total,
        terms,
        estimated_probs,
    })
}

fn mse(lhs: &Tensor, rhs: &Tensor) -> Result<Tensor> {
    lhs.sub(rhs)?.sqr()?.mean_all()
}
