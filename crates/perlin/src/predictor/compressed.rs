//! Codebook predictor: scores are stitched together from soft codebook patches.

use candle_core::{DType, Device, Result, Tensor, Var, D};
use candle_nn::ops::softmax;
use layers::{scoped, Linear, LinearConfig, LinearInit, PrecisionPolicy};

use super::ScorePredictor;
use crate::core::PredictorMethod;

/// Each query emits logits over `book_size` codes for each of `patch_count`
/// patches. A patch is the softmax-weighted mixture of the learned codebook
/// rows, so the decoder stays differentiable. The patches concatenate into a
/// `patch_count * patch_size` score row.
#[derive(Debug, Clone)]
pub struct CompressedPredictor {
    patch_decoder: Linear,
    codebook: Var,
    patch_count: usize,
    patch_size: usize,
    book_size: usize,
}

impl CompressedPredictor {
    pub fn new(
        encoded_dim: usize,
        patch_count: usize,
        patch_size: usize,
        book_size: usize,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let patch_decoder = Linear::with_init(
            LinearConfig::new(encoded_dim, patch_count * book_size),
            &LinearInit::default(),
            device,
            dtype,
        )?;
        let codebook = Var::randn(0f32, 1f32, (book_size, patch_size), device)?;
        let codebook = if dtype == DType::F32 {
            codebook
        } else {
            Var::from_tensor(&codebook.to_dtype(dtype)?)?
        };
        Ok(Self {
            patch_decoder,
            codebook,
            patch_count,
            patch_size,
            book_size,
        })
    }
}

impl ScorePredictor for CompressedPredictor {
    fn method(&self) -> PredictorMethod {
        PredictorMethod::Comp
    }

    fn resolution(&self) -> usize {
        self.patch_count * self.patch_size
    }

    fn predict(&self, encoded: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let (batch, heads, seq, _) = encoded.dims4()?;
        let logits = self.patch_decoder.forward(encoded, policy)?;
        let logits = policy
            .cast_for_matmul(&logits)?
            .reshape((batch * heads * seq * self.patch_count, self.book_size))?;
        let weights = softmax(&logits, D::Minus1)?;
        let codebook = policy.cast_for_matmul(self.codebook.as_tensor())?;
        let patches = weights.matmul(&codebook)?;
        let scores = patches.reshape((batch, heads, seq, self.resolution()))?;
        policy.cast_to_storage(&scores)
    }

    fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        let mut params = self
            .patch_decoder
            .named_parameters(&scoped(scope, "patch_decoder"));
        params.push((scoped(scope, "codebook"), self.codebook.clone()));
        params
    }
}
