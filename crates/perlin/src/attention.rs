//! The Perlin attention module: low-rank estimation, score prediction, top-k
//! mask synthesis and context composition wired into one forward pass.
//!
//! Two entry points share the pipeline. [`PerlinAttention::forward_train`]
//! takes teacher targets and returns the distillation loss together with
//! dense diagnostics; [`PerlinAttention::forward_infer`] skips both.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    OnceLock,
};

use candle_core::{DType, Device, Tensor, Var, D};
use candle_nn::ops::softmax;
use layers::scoped;

use crate::{
    composer::{ComposerInputs, ContextComposer},
    core::{PerlinConfig, PerlinError, PerlinResult},
    diagnostics::FiniteGuard,
    estimator::LowRankEstimator,
    loss::{distillation_loss, LossInputs, LossTerms},
    masks::{fp_min, key_validity},
    predictor::AttentionPredictor,
    resize::{interpolate, ResizeMode},
    sparse::MaskSynthesizer,
};

const PROJECTION_BUFFER: &str = "estimator.projection";

/// The three views of query/key/value consumed by one call, plus the additive mask.
///
/// All tensors share `[batch, heads, T, head_dim]`, the same dtype and device.
/// The mask is `[batch, 1, T | 1, T]` with the `0 / fp_min` convention.
#[derive(Debug, Clone)]
pub struct PerlinInputs {
    pub value: Tensor,
    pub query_for_estimator: Tensor,
    pub key_for_estimator: Tensor,
    pub value_for_estimator: Tensor,
    pub query_for_score: Tensor,
    pub key_for_score: Tensor,
    pub attention_mask: Tensor,
}

impl PerlinInputs {
    /// Uses the same query, key and value for every view.
    pub fn from_qkv(query: &Tensor, key: &Tensor, value: &Tensor, attention_mask: &Tensor) -> Self {
        Self {
            value: value.clone(),
            query_for_estimator: query.clone(),
            key_for_estimator: key.clone(),
            value_for_estimator: value.clone(),
            query_for_score: query.clone(),
            key_for_score: key.clone(),
            attention_mask: attention_mask.clone(),
        }
    }
}

/// Dense teacher outputs the student is distilled against.
#[derive(Debug, Clone)]
pub struct TeacherTargets {
    /// Raw scaled scores `[batch, heads, T, T]`.
    pub scores: Tensor,
    /// Final context `[batch, T, heads * head_dim]`.
    pub context: Tensor,
}

#[derive(Debug, Clone)]
pub struct PerlinAttentionOutput {
    /// Scalar `f32` loss; exactly zero from [`PerlinAttention::forward_infer`].
    pub loss: Tensor,
    pub loss_terms: Option<LossTerms>,
    /// `[batch, T, heads * head_dim]` in the input dtype.
    pub context: Tensor,
    /// Sparse attention probabilities `[batch, heads, T, T]`; training only.
    pub partial_attention_probs: Option<Tensor>,
    /// Estimated probabilities resized to `[batch, heads, T, T]`.
    pub estimated_attention_probs: Tensor,
    /// Masked softmax of the dense student scores; training only.
    pub dense_attention_probs: Option<Tensor>,
    pub key_for_score: Tensor,
}

#[derive(Debug)]
pub struct PerlinAttention {
    heads: usize,
    head_dim: usize,
    config: PerlinConfig,
    estimator: LowRankEstimator,
    predictor: AttentionPredictor,
    synthesizer: MaskSynthesizer,
    composer: ContextComposer,
    guard: FiniteGuard,
    training: AtomicBool,
    first_call: OnceLock<()>,
}

impl PerlinAttention {
    pub fn new(
        heads: usize,
        head_dim: usize,
        config: PerlinConfig,
        device: &Device,
        dtype: DType,
    ) -> PerlinResult<Self> {
        Self::with_seed(heads, head_dim, config, 0, device, dtype)
    }

    /// Builds the module with `seed` driving projection sampling and random lookups.
    ///
    /// Configuration and dtype are validated before any parameter is allocated.
    pub fn with_seed(
        heads: usize,
        head_dim: usize,
        config: PerlinConfig,
        seed: u64,
        device: &Device,
        dtype: DType,
    ) -> PerlinResult<Self> {
        config.validate()?;
        fp_min(dtype)?;
        if heads == 0 || head_dim == 0 {
            return Err(PerlinError::InvalidConfig(vec![format!(
                "heads and head_dim must be positive, got {heads} and {head_dim}"
            )]));
        }

        let estimator = LowRankEstimator::new(
            head_dim,
            config.performer_nb_factor,
            config.redraw_interval,
            seed,
            device,
        )?;
        let predictor = AttentionPredictor::new(&config, heads, head_dim, device, dtype)?;
        let composer =
            ContextComposer::new(&config, heads, head_dim, seed.wrapping_add(1), device, dtype)?;
        let module = Self {
            heads,
            head_dim,
            synthesizer: MaskSynthesizer::from_config(&config),
            guard: FiniteGuard::from_env(config.check_finite),
            config,
            estimator,
            predictor,
            composer,
            training: AtomicBool::new(true),
            first_call: OnceLock::new(),
        };
        module.set_training(true);
        Ok(module)
    }

    pub fn config(&self) -> &PerlinConfig {
        &self.config
    }

    pub fn heads(&self) -> usize {
        self.heads
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    pub fn estimator(&self) -> &LowRankEstimator {
        &self.estimator
    }

    pub fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::Relaxed);
        self.predictor.set_training(training);
    }

    pub fn is_training(&self) -> bool {
        self.training.load(Ordering::Relaxed)
    }

    /// Maintenance hook invoked once per optimizer step; resamples the
    /// estimator basis every `redraw_interval` calls while training.
    pub fn redraw_projections(&self, device: &Device) -> PerlinResult<bool> {
        self.estimator
            .redraw_projections(self.is_training(), device)
    }

    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        let mut params = self.predictor.named_parameters(&scoped(scope, "predictor"));
        params.extend(self.composer.named_parameters(&scoped(scope, "composer")));
        params
    }

    /// Non-trainable state that must survive a checkpoint round trip.
    pub fn named_buffers(&self, scope: &str) -> PerlinResult<Vec<(String, Tensor)>> {
        Ok(vec![(
            scoped(scope, PROJECTION_BUFFER),
            self.estimator.projection()?,
        )])
    }

    /// Restores a buffer produced by [`Self::named_buffers`]. Returns whether `name` was recognised.
    pub fn load_buffer(&self, scope: &str, name: &str, tensor: &Tensor) -> PerlinResult<bool> {
        if name != scoped(scope, PROJECTION_BUFFER) {
            return Ok(false);
        }
        self.estimator.set_projection(tensor)?;
        Ok(true)
    }

    pub fn forward_train(
        &self,
        inputs: &PerlinInputs,
        targets: &TeacherTargets,
    ) -> PerlinResult<PerlinAttentionOutput> {
        self.run(inputs, Some(targets))
    }

    pub fn forward_infer(&self, inputs: &PerlinInputs) -> PerlinResult<PerlinAttentionOutput> {
        self.run(inputs, None)
    }

    fn run(
        &self,
        inputs: &PerlinInputs,
        targets: Option<&TeacherTargets>,
    ) -> PerlinResult<PerlinAttentionOutput> {
        let value = &inputs.value;
        let dtype = value.dtype();
        fp_min(dtype)?;
        let (batch, heads, seq, dim) = self.check_inputs(inputs)?;
        let device = value.device();
        let mask = &inputs.attention_mask;

        let key_gate = key_validity(mask)?
            .reshape((batch, 1, seq, 1))?
            .to_dtype(dtype)?;
        let probe = self
            .identity_probe(seq, device)?
            .to_dtype(dtype)?
            .broadcast_as((batch, heads, seq, dim))?;
        let augmented =
            Tensor::cat(&[&probe, &inputs.value_for_estimator], 3)?.broadcast_mul(&key_gate)?;
        let performer_context = self.estimator.forward(
            &inputs.query_for_estimator,
            &inputs.key_for_estimator,
            &augmented,
        )?;
        self.guard.check("performer_context", &performer_context)?;

        let features = Tensor::cat(&[&performer_context, value], 3)?.detach();
        let prediction = self.predictor.forward(&features)?;
        self.guard.check("estimated_scores", &prediction.scores)?;

        let sparse = self.synthesizer.synthesize(&prediction.scores, mask, dtype)?;
        if self.first_call.set(()).is_ok() {
            log::info!(
                "perlin::attention init dtype={dtype:?} heads={heads} head_dim={dim} method={} resolution={} k={} top_k={} seq={seq} flatten={:?} features={}",
                self.predictor.method(),
                self.predictor.resolution(),
                self.config.k,
                sparse.top_k,
                self.config.k_flatten.then_some(self.config.k_flatten_dim),
                self.estimator.nb_features(),
            );
        }

        let composed = self.composer.compose(&ComposerInputs {
            query: &inputs.query_for_score,
            key: &inputs.key_for_score,
            value,
            attention_mask: mask,
            sparse: &sparse,
            scaler_logits: &prediction.scaler_logits,
            performer_context: &performer_context,
        })?;
        self.guard.check("context", &composed.context)?;

        let Some(targets) = targets else {
            let estimated = interpolate(
                &sparse.estimated_probs,
                (seq, seq),
                Some(ResizeMode::Nearest),
            )?;
            return Ok(PerlinAttentionOutput {
                loss: Tensor::zeros((), DType::F32, device)?,
                loss_terms: None,
                context: composed.context,
                partial_attention_probs: None,
                estimated_attention_probs: estimated,
                dense_attention_probs: None,
                key_for_score: inputs.key_for_score.clone(),
            });
        };

        if targets.scores.dims() != [batch, heads, seq, seq] {
            return Err(PerlinError::shape(format!(
                "teacher scores {:?}, expected [{batch}, {heads}, {seq}, {seq}]",
                targets.scores.dims()
            )));
        }
        if targets.context.dims() != composed.context.dims() {
            return Err(PerlinError::shape(format!(
                "teacher context {:?}, expected {:?}",
                targets.context.dims(),
                composed.context.dims()
            )));
        }

        let estimated_scores = interpolate(
            &prediction.scores.to_dtype(DType::F32)?,
            (seq, seq),
            Some(ResizeMode::Nearest),
        )?;
        let loss = distillation_loss(&LossInputs {
            estimated_scores: &estimated_scores,
            dense_scores: &composed.dense_scores,
            teacher_scores: &targets.scores,
            context: &composed.context,
            teacher_context: &targets.context,
            attention_mask: mask,
        })?;
        self.guard.check("loss", &loss.total)?;

        let dense_probs = softmax(
            &composed
                .dense_scores
                .broadcast_add(&mask.to_dtype(DType::F32)?)?,
            D::Minus1,
        )?;

        Ok(PerlinAttentionOutput {
            loss: loss.total,
            loss_terms: Some(loss.terms),
            context: composed.context,
            partial_attention_probs: Some(composed.partial_probs),
            estimated_attention_probs: loss.estimated_probs,
            dense_attention_probs: Some(dense_probs),
            key_for_score: inputs.key_for_score.clone(),
        })
    }

    fn check_inputs(&self, inputs: &PerlinInputs) -> PerlinResult<(usize, usize, usize, usize)> {
        let value = &inputs.value;
        let (batch, heads, seq, dim) = value.dims4().map_err(|_| {
            PerlinError::shape("value must have shape [batch, heads, seq_len, head_dim]")
        })?;
        if heads != self.heads || dim != self.head_dim {
            return Err(PerlinError::shape(format!(
                "value {:?} does not match {} heads of width {}",
                value.dims(),
                self.heads,
                self.head_dim
            )));
        }
        let views = [
            ("query_for_estimator", &inputs.query_for_estimator),
            ("key_for_estimator", &inputs.key_for_estimator),
            ("value_for_estimator", &inputs.value_for_estimator),
            ("query_for_score", &inputs.query_for_score),
            ("key_for_score", &inputs.key_for_score),
        ];
        for (label, view) in views {
            if view.dims() != value.dims() {
                return Err(PerlinError::shape(format!(
                    "{label} {:?} does not match value {:?}",
                    view.dims(),
                    value.dims()
                )));
            }
            if view.dtype() != value.dtype() {
                return Err(PerlinError::shape(format!(
                    "{label} dtype {:?} differs from value dtype {:?}",
                    view.dtype(),
                    value.dtype()
                )));
            }
        }
        let (mb, mh, mq, mk) = inputs.attention_mask.dims4().map_err(|_| {
            PerlinError::shape("attention mask must have shape [batch, 1, q_len | 1, k_len]")
        })?;
        if mb != batch || mh != 1 || (mq != 1 && mq != seq) || mk != seq {
            return Err(PerlinError::shape(format!(
                "attention mask {:?}, expected [{batch}, 1, 1 | {seq}, {seq}]",
                inputs.attention_mask.dims()
            )));
        }
        Ok((batch, heads, seq, dim))
    }

    /// Identity matrix of side `v_eye_length`, nearest-resized to `[1, 1, T, head_dim]`.
    fn identity_probe(&self, seq: usize, device: &Device) -> PerlinResult<Tensor> {
        let side = self.config.v_eye_length;
        let eye = (0..side * side)
            .map(|index| if index / side == index % side { 1f32 } else { 0.0 })
            .collect::<Vec<_>>();
        let eye = Tensor::from_vec(eye, (1, 1, side, side), device)?;
        Ok(interpolate(
            &eye,
            (seq, self.head_dim),
            Some(ResizeMode::Nearest),
        )?)
    }
}
