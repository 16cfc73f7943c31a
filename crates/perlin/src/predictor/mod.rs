//! Learned score predictor.
//!
//! The predictor reads the low-rank context (identity probe block plus value
//! block) concatenated with the exact values, all gradient-detached, encodes it
//! per query, and decodes raw key scores at the predictor resolution through a
//! [`ScorePredictor`] strategy chosen once at construction. A small scaler
//! head reads the same encoding and emits two gate logits per query.

pub mod compressed;
pub mod direct;

use std::{fmt, sync::Arc};

use candle_core::{DType, Device, Result, Tensor, Var};
use layers::{
    builtin, scoped, Activation, ActivationKind, Dropout, LayerNorm, Linear, LinearConfig,
    LinearInit, NormConfig, PrecisionPolicy,
};

use crate::core::{PerlinConfig, PerlinResult, PredictorMethod};

pub use compressed::CompressedPredictor;
pub use direct::DirectPredictor;

/// Decoder strategy turning the encoded context into raw scores.
pub trait ScorePredictor: Send + Sync + fmt::Debug {
    fn method(&self) -> PredictorMethod;

    /// Number of predicted key slots per query.
    fn resolution(&self) -> usize;

    /// Maps `[batch, heads, seq, encoded_dim]` to raw scores `[batch, heads, seq, resolution]`.
    fn predict(&self, encoded: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;

    fn named_parameters(&self, scope: &str) -> Vec<(String, Var)>;
}

/// Builds the decoder strategy selected by `config`.
pub fn build_score_predictor(
    config: &PerlinConfig,
    heads: usize,
    encoded_dim: usize,
    device: &Device,
    dtype: DType,
) -> Result<Box<dyn ScorePredictor>> {
    Ok(match config.attention_predictor_method {
        PredictorMethod::Mlp => Box::new(DirectPredictor::new(
            heads,
            encoded_dim,
            config.attention_predictor_length,
            device,
            dtype,
        )?),
        PredictorMethod::Comp => Box::new(CompressedPredictor::new(
            encoded_dim,
            config.attention_predictor_comp_patch_count,
            config.attention_predictor_comp_patch_size,
            config.attention_predictor_comp_book_size,
            device,
            dtype,
        )?),
    })
}

/// Raw predictor outputs for one forward pass.
#[derive(Debug, Clone)]
pub struct PredictorOutput {
    /// Pre-mask, pre-softmax scores `[batch, heads, seq, resolution]`.
    pub scores: Tensor,
    /// Gate logits `[batch, heads, seq, 2]`; channel 0 rescales sparse probabilities,
    /// channel 1 blends sparse and average contexts.
    pub scaler_logits: Tensor,
}

pub struct AttentionPredictor {
    dropout: Dropout,
    encoder: Linear,
    encoder_norm: LayerNorm,
    activation: Arc<dyn Activation>,
    decoder: Box<dyn ScorePredictor>,
    scaler: Linear,
    policy: PrecisionPolicy,
}

impl fmt::Debug for AttentionPredictor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttentionPredictor")
            .field("dropout", &self.dropout)
            .field("encoder", &self.encoder)
            .field("decoder", &self.decoder)
            .field("activation", &self.activation.kind())
            .finish()
    }
}

impl AttentionPredictor {
    /// Input width is `3 * head_dim` (probe, value context, exact value); encoding width `2 * head_dim`.
    pub fn new(
        config: &PerlinConfig,
        heads: usize,
        head_dim: usize,
        device: &Device,
        dtype: DType,
    ) -> PerlinResult<Self> {
        let encoded_dim = 2 * head_dim;
        let init = LinearInit::default();
        Ok(Self {
            dropout: Dropout::new(config.predictor_dropout)?,
            encoder: Linear::with_init(
                LinearConfig::new(3 * head_dim, encoded_dim),
                &init,
                device,
                dtype,
            )?,
            encoder_norm: LayerNorm::new(NormConfig::new(encoded_dim), device, dtype)?,
            activation: builtin(ActivationKind::Gelu),
            decoder: build_score_predictor(config, heads, encoded_dim, device, dtype)?,
            scaler: Linear::with_init(LinearConfig::new(encoded_dim, 2), &init, device, dtype)?,
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
        })
    }

    pub fn method(&self) -> PredictorMethod {
        self.decoder.method()
    }

    pub fn resolution(&self) -> usize {
        self.decoder.resolution()
    }

    pub fn set_training(&self, training: bool) {
        self.dropout.set_training(training);
    }

    /// Encodes `features` `[batch, heads, seq, 3 * head_dim]` and decodes scores and gates.
    pub fn forward(&self, features: &Tensor) -> PerlinResult<PredictorOutput> {
        let policy = &self.policy;
        let hidden = self.dropout.forward(features)?;
        let hidden = self.encoder.forward(&hidden, policy)?;
        let hidden = self.encoder_norm.forward(&hidden, policy)?;
        let encoded = self.activation.forward(&hidden, policy)?;

        Ok(PredictorOutput {
            scores: self.decoder.predict(&encoded, policy)?,
            scaler_logits: self.scaler.forward(&encoded, policy)?,
        })
    }

    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        let mut params = self.encoder.named_parameters(&scoped(scope, "encoder"));
        params.extend(self.encoder_norm.named_parameters(&scoped(scope, "encoder_norm")));
        params.extend(self.decoder.named_parameters(&scoped(scope, "decoder")));
        params.extend(self.scaler.named_parameters(&scoped(scope, "scaler")));
        params
    }
}
