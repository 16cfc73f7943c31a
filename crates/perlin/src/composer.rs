//! Blends sparse exact attention, an average-pooled fallback and optional
//! random lookups into the final context.

use std::sync::Mutex;

use candle_core::{DType, Device, Error, Tensor, Var, D};
use candle_nn::ops::{sigmoid, softmax};
use layers::{scoped, LayerNorm, NormConfig, PrecisionPolicy};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    core::{merge_heads, PerlinConfig, PerlinResult},
    masks::{key_validity, open_positions},
    resize::{interpolate, ResizeMode},
    sparse::SparseMask,
};

/// Borrowed tensors consumed by [`ContextComposer::compose`].
#[derive(Debug)]
pub struct ComposerInputs<'a> {
    /// Scoring views `[batch, heads, T, head_dim]`.
    pub query: &'a Tensor,
    pub key: &'a Tensor,
    pub value: &'a Tensor,
    pub attention_mask: &'a Tensor,
    pub sparse: &'a SparseMask,
    /// Gate logits `[batch, heads, T, 2]` from the predictor.
    pub scaler_logits: &'a Tensor,
    /// Low-rank context `[batch, heads, T, 2 * head_dim]` (probe block, value block).
    pub performer_context: &'a Tensor,
}

#[derive(Debug, Clone)]
pub struct ComposedContext {
    /// Final context `[batch, T, heads * head_dim]` in the storage dtype.
    pub context: Tensor,
    /// Unmasked scaled scores `[batch, heads, T, T]` in `f32`.
    pub dense_scores: Tensor,
    /// Sparse attention probabilities `[batch, heads, T, T]` in `f32`.
    pub partial_probs: Tensor,
}

#[derive(Debug)]
pub struct ContextComposer {
    head_dim: usize,
    partial_attention_scaler: bool,
    random_lookup_count: Option<usize>,
    norm_partial: LayerNorm,
    norm_random: Option<LayerNorm>,
    norm_performer: Option<LayerNorm>,
    norm: Option<LayerNorm>,
    rng: Mutex<StdRng>,
    policy: PrecisionPolicy,
}

impl ContextComposer {
    pub fn new(
        config: &PerlinConfig,
        heads: usize,
        head_dim: usize,
        seed: u64,
        device: &Device,
        dtype: DType,
    ) -> PerlinResult<Self> {
        let hidden = heads * head_dim;
        let build = |enabled: bool| -> candle_core::Result<Option<LayerNorm>> {
            enabled
                .then(|| LayerNorm::new(NormConfig::new(hidden), device, dtype))
                .transpose()
        };
        Ok(Self {
            head_dim,
            partial_attention_scaler: config.partial_attention_scaler,
            random_lookup_count: config.random_lookup.then_some(config.random_lookup_count),
            norm_partial: LayerNorm::new(NormConfig::new(hidden), device, dtype)?,
            norm_random: build(config.random_lookup)?,
            norm_performer: build(config.out_add_performer_context)?,
            norm: build(config.out_norm)?,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
        })
    }

    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        let mut params = self
            .norm_partial
            .named_parameters(&scoped(scope, "norm_partial"));
        let optional = [
            ("norm_random", &self.norm_random),
            ("norm_performer", &self.norm_performer),
            ("norm", &self.norm),
        ];
        for (name, norm) in optional {
            if let Some(norm) = norm {
                params.extend(norm.named_parameters(&scoped(scope, name)));
            }
        }
        params
    }

    pub fn compose(&self, inputs: &ComposerInputs<'_>) -> PerlinResult<ComposedContext> {
        let policy = &self.policy;
        let (batch, heads, seq, dim) = inputs.value.dims4()?;
        let merged_rows = batch * heads;

        let query = policy
            .cast_for_matmul(inputs.query)?
            .reshape((merged_rows, seq, dim))?;
        let key = policy
            .cast_for_matmul(inputs.key)?
            .reshape((merged_rows, seq, dim))?;
        let value = policy.cast_for_matmul(inputs.value)?;
        let value_rows = value.reshape((merged_rows, seq, dim))?;

        let dense_scores = query
            .matmul(&key.transpose(1, 2)?.contiguous()?)?
            .affine(1.0 / (dim as f64).sqrt(), 0.0)?
            .reshape((batch, heads, seq, seq))?;
        let sparse_mask = inputs.sparse.mask.to_dtype(DType::F32)?;
        // Fully blocked rows softmax to a uniform row; the open map zeroes them.
        let mut partial_probs = softmax(&dense_scores.broadcast_add(&sparse_mask)?, D::Minus1)?
            .mul(&inputs.sparse.open)?;

        let gates = sigmoid(&policy.cast_for_matmul(inputs.scaler_logits)?)?;
        if self.partial_attention_scaler {
            partial_probs = partial_probs.broadcast_mul(&gates.narrow(3, 0, 1)?)?;
        }

        let partial = partial_probs
            .reshape((merged_rows, seq, seq))?
            .matmul(&value_rows)?
            .reshape((batch, heads, seq, dim))?;

        let key_valid = key_validity(inputs.attention_mask)?;
        let average = self.average_context(inputs.sparse, &key_valid, &value_rows, (batch, heads, seq))?;
        let blend = gates.narrow(3, 1, 1)?;
        let partial = (partial.broadcast_mul(&blend)?
            + blend.affine(-1.0, 1.0)?.broadcast_mul(&average)?)?;

        let merged = policy.cast_to_storage(&merge_heads(&partial)?)?;
        let mut context = (self.norm_partial.forward(&merged, policy)? + &merged)?;

        if let (Some(draws), Some(norm)) = (self.random_lookup_count, &self.norm_random) {
            let random = self.random_context(&value, inputs, &key_valid, draws)?;
            let random = policy.cast_to_storage(&merge_heads(&random)?)?;
            context = (context + norm.forward(&random, policy)?)?;
        }

        if let Some(norm) = &self.norm_performer {
            let performer_value = inputs
                .performer_context
                .narrow(3, self.head_dim, self.head_dim)?;
            let performer_value = merge_heads(&performer_value)?;
            context = (context + norm.forward(&performer_value, policy)?)?;
        }

        if let Some(norm) = &self.norm {
            context = norm.forward(&context, policy)?;
        }

        Ok(ComposedContext {
            context,
            dense_scores,
            partial_probs,
        })
    }

    /// Values weighted by the query-averaged estimated probabilities, resized to `T`.
    fn average_context(
        &self,
        sparse: &SparseMask,
        key_valid: &Tensor,
        value_rows: &Tensor,
        (batch, heads, seq): (usize, usize, usize),
    ) -> PerlinResult<Tensor> {
        let mean_probs = sparse.estimated_probs.mean_keepdim(2)?;
        let spread = interpolate(&mean_probs, (1, seq), None)?
            .broadcast_mul(&key_valid.reshape((batch, 1, 1, seq))?)?;
        let dim = value_rows.dim(2)?;
        Ok(spread
            .reshape((batch * heads, 1, seq))?
            .matmul(value_rows)?
            .reshape((batch, heads, 1, dim))?)
    }

    /// Sums `draws` uniformly sampled valid keys per query, each weighted by its
    /// estimated probability when the key is visible but outside the sparse selection.
    fn random_context(
        &self,
        value: &Tensor,
        inputs: &ComposerInputs<'_>,
        key_valid: &Tensor,
        draws: usize,
    ) -> PerlinResult<Tensor> {
        let (batch, heads, seq, dim) = value.dims4()?;
        let device = value.device();

        let estimated = interpolate(
            &inputs.sparse.estimated_probs,
            (seq, seq),
            Some(ResizeMode::Nearest),
        )?;
        let candidates = estimated
            .broadcast_mul(&open_positions(inputs.attention_mask)?)?
            .mul(&inputs.sparse.open.affine(-1.0, 1.0)?)?;

        let valid_keys = key_valid
            .to_vec2::<f32>()?
            .into_iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .filter(|(_, &flag)| flag > 0.5)
                    .map(|(index, _)| index as u32)
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();

        let mut rng = self
            .rng
            .lock()
            .map_err(|_| Error::Msg("random lookup rng mutex poisoned".into()))?;
        let mut total = Tensor::zeros((batch, heads, seq, dim), DType::F32, device)?;
        for _ in 0..draws {
            let picks = valid_keys
                .iter()
                .flat_map(|keys| {
                    (0..heads * seq)
                        .map(|_| {
                            if keys.is_empty() {
                                0
                            } else {
                                keys[rng.gen_range(0..keys.len())]
                            }
                        })
                        .collect::<Vec<_>>()
                })
                .collect::<Vec<_>>();
            let index = Tensor::from_vec(picks, (batch, heads, seq, 1), device)?;
            let weight = candidates.gather(&index, 3)?;
            let gathered = value.gather(
                &index.broadcast_as((batch, heads, seq, dim))?.contiguous()?,
                2,
            )?;
            total = (total + gathered.broadcast_mul(&weight)?)?;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        masks::{build_causal_mask, combine_masks, padding_mask_from_lengths},
        reference::ExactAttention,
        sparse::MaskSynthesizer,
    };

    fn inputs_for(
        batch: usize,
        heads: usize,
        seq: usize,
        dim: usize,
        device: &Device,
    ) -> candle_core::Result<(Tensor, Tensor, Tensor, Tensor, Tensor, Tensor)> {
        Ok((
            Tensor::randn(0f32, 1.0, (batch, heads, seq, dim), device)?,
            Tensor::randn(0f32, 1.0, (batch, heads, seq, dim), device)?,
            Tensor::randn(0f32, 1.0, (batch, heads, seq, dim), device)?,
            Tensor::randn(0f32, 1.0, (batch, heads, seq, 8), device)?,
            Tensor::randn(0f32, 1.0, (batch, heads, seq, 2), device)?,
            Tensor::randn(0f32, 1.0, (batch, heads, seq, 2 * dim), device)?,
        ))
    }

    #[test]
    fn every_option_keeps_context_shape() -> PerlinResult<()> {
        let device = Device::Cpu;
        let (q, k, v, scores, gates, performer) = inputs_for(2, 2, 10, 4, &device)?;
        let mask = padding_mask_from_lengths(&device, DType::F32, &[10, 7], 1, 10)?;
        let sparse = MaskSynthesizer::new(3, None).synthesize(&scores, &mask, DType::F32)?;

        let config = PerlinConfig {
            random_lookup: true,
            out_add_performer_context: true,
            out_norm: true,
            ..PerlinConfig::default()
        };
        let composer = ContextComposer::new(&config, 2, 4, 0, &device, DType::F32)?;
        let out = composer.compose(&ComposerInputs {
            query: &q,
            key: &k,
            value: &v,
            attention_mask: &mask,
            sparse: &sparse,
            scaler_logits: &gates,
            performer_context: &performer,
        })?;
        assert_eq!(out.context.dims(), &[2, 10, 8]);
        assert_eq!(out.partial_probs.dims(), &[2, 2, 10, 10]);
        assert_eq!(composer.named_parameters("composer").len(), 8);
        Ok(())
    }

    #[test]
    fn partial_probabilities_live_on_open_slots() -> PerlinResult<()> {
        let device = Device::Cpu;
        let (q, k, v, scores, gates, performer) = inputs_for(1, 2, 8, 4, &device)?;
        let mask = padding_mask_from_lengths(&device, DType::F32, &[6], 1, 8)?;
        let sparse = MaskSynthesizer::new(4, None).synthesize(&scores, &mask, DType::F32)?;
        let config = PerlinConfig {
            partial_attention_scaler: false,
            ..PerlinConfig::default()
        };
        let composer = ContextComposer::new(&config, 2, 4, 0, &device, DType::F32)?;
        let out = composer.compose(&ComposerInputs {
            query: &q,
            key: &k,
            value: &v,
            attention_mask: &mask,
            sparse: &sparse,
            scaler_logits: &gates,
            performer_context: &performer,
        })?;

        let probs = out.partial_probs.flatten_all()?.to_vec1::<f32>()?;
        let open = sparse.open.flatten_all()?.to_vec1::<f32>()?;
        for (p, o) in probs.iter().zip(&open) {
            if *o == 0.0 {
                assert_eq!(*p, 0.0);
            }
        }
        for row in probs.chunks(8) {
            let total: f32 = row.iter().sum();
            assert!((total - 1.0).abs() < 1e-5);
        }
        Ok(())
    }

    fn random_lookup_composer(
        heads: usize,
        head_dim: usize,
        device: &Device,
    ) -> PerlinResult<ContextComposer> {
        let config = PerlinConfig {
            random_lookup: true,
            ..PerlinConfig::default()
        };
        ContextComposer::new(&config, heads, head_dim, 3, device, DType::F32)
    }

    #[test]
    fn random_lookups_vanish_when_every_slot_is_selected() -> PerlinResult<()> {
        let device = Device::Cpu;
        let (q, k, v, scores, gates, performer) = inputs_for(2, 2, 8, 4, &device)?;
        let mask = padding_mask_from_lengths(&device, DType::F32, &[8, 5], 1, 8)?;
        let sparse = MaskSynthesizer::new(8, None).synthesize(&scores, &mask, DType::F32)?;
        assert_eq!(sparse.top_k, 8);

        let composer = random_lookup_composer(2, 4, &device)?;
        let inputs = ComposerInputs {
            query: &q,
            key: &k,
            value: &v,
            attention_mask: &mask,
            sparse: &sparse,
            scaler_logits: &gates,
            performer_context: &performer,
        };
        let random = composer.random_context(&v, &inputs, &key_validity(&mask)?, 4)?;
        assert_eq!(random.dims(), &[2, 2, 8, 4]);
        let values = random.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|&x| x == 0.0));
        Ok(())
    }

    #[test]
    fn random_lookups_only_reach_visible_unselected_keys() -> PerlinResult<()> {
        let device = Device::Cpu;
        let (heads, seq) = (2, 8);
        let padding = padding_mask_from_lengths(&device, DType::F32, &[6], 1, seq)?;
        let causal = build_causal_mask(&device, DType::F32, 1, seq, seq)?;
        let mask = combine_masks(&padding, &causal)?;
        let scores = Tensor::randn(0f32, 1.0, (1, heads, seq, seq), &device)?;
        let sparse = MaskSynthesizer::new(2, None).synthesize(&scores, &mask, DType::F32)?;

        // One-hot values: column `j` of the result counts weighted draws of key `j`.
        let eye = (0..seq * seq)
            .map(|index| if index / seq == index % seq { 1f32 } else { 0.0 })
            .collect::<Vec<_>>();
        let value = Tensor::from_vec(eye, (1, 1, seq, seq), &device)?
            .broadcast_as((1, heads, seq, seq))?
            .contiguous()?;
        let gates = Tensor::zeros((1, heads, seq, 2), DType::F32, &device)?;
        let performer = Tensor::zeros((1, heads, seq, 2 * seq), DType::F32, &device)?;

        let composer = random_lookup_composer(heads, seq, &device)?;
        let inputs = ComposerInputs {
            query: &value,
            key: &value,
            value: &value,
            attention_mask: &mask,
            sparse: &sparse,
            scaler_logits: &gates,
            performer_context: &performer,
        };
        let random = composer
            .random_context(&value, &inputs, &key_validity(&mask)?, 16)?
            .flatten_all()?
            .to_vec1::<f32>()?;

        let visible = open_positions(&mask)?
            .broadcast_as((1, heads, seq, seq))?
            .flatten_all()?
            .to_vec1::<f32>()?;
        let selected = sparse.open.flatten_all()?.to_vec1::<f32>()?;
        for ((weight, open), chosen) in random.iter().zip(&visible).zip(&selected) {
            if *open == 0.0 || *chosen == 1.0 {
                assert_eq!(*weight, 0.0);
            }
        }
        // Padded keys 6 and 7 never contribute.
        for row in random.chunks(seq) {
            assert!(row[6..].iter().all(|&x| x == 0.0));
        }
        assert!(random.iter().any(|&x| x > 0.0));
        Ok(())
    }

    #[test]
    fn full_budget_context_matches_dense_attention() -> PerlinResult<()> {
        let device = Device::Cpu;
        let (q, k, v, _, _, performer) = inputs_for(1, 2, 16, 8, &device)?;
        let mask = padding_mask_from_lengths(&device, DType::F32, &[12], 1, 16)?;
        let scores = Tensor::randn(0f32, 1.0, (1, 2, 16, 16), &device)?;
        let sparse = MaskSynthesizer::new(16, None).synthesize(&scores, &mask, DType::F32)?;
        // Saturated blend gate: the average-pooled fallback gets no weight.
        let gates = Tensor::full(30f32, (1, 2, 16, 2), &device)?;

        let config = PerlinConfig {
            partial_attention_scaler: false,
            ..PerlinConfig::default()
        };
        let composer = ContextComposer::new(&config, 2, 8, 0, &device, DType::F32)?;
        let out = composer.compose(&ComposerInputs {
            query: &q,
            key: &k,
            value: &v,
            attention_mask: &mask,
            sparse: &sparse,
            scaler_logits: &gates,
            performer_context: &performer,
        })?;

        let dense = ExactAttention::new().attend(&q, &k, &v, Some(&mask))?.context;
        let expected = (composer.norm_partial.forward(&dense, &composer.policy)? + &dense)?;
        let diff = out
            .context
            .sub(&expected)?
            .abs()?
            .flatten_all()?
            .max(0)?
            .to_scalar::<f32>()?;
        assert!(diff < 1e-4, "max diff {diff}");
        Ok(())
    }
}
