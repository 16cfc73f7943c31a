use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use perlin::{
    estimator::LowRankEstimator,
    masks::{fp_min, padding_mask_from_lengths},
    resize::{interpolate, ResizeMode},
    ExactAttention, FlattenDim, PerlinAttention, PerlinConfig, PerlinError, PerlinInputs,
    PredictorMethod, TeacherTargets,
};

fn small_config() -> PerlinConfig {
    PerlinConfig {
        k: 4,
        attention_predictor_length: 8,
        attention_predictor_comp_patch_count: 2,
        attention_predictor_comp_patch_size: 4,
        attention_predictor_comp_book_size: 4,
        v_eye_length: 16,
        predictor_dropout: 0.0,
        ..PerlinConfig::default()
    }
}

fn random_inputs(
    batch: usize,
    heads: usize,
    seq: usize,
    head_dim: usize,
    lengths: &[usize],
    device: &Device,
) -> Result<PerlinInputs> {
    let shape = (batch, heads, seq, head_dim);
    let q = Tensor::randn(0f32, 1.0, shape, device)?;
    let k = Tensor::randn(0f32, 1.0, shape, device)?;
    let v = Tensor::randn(0f32, 1.0, shape, device)?;
    let mask = padding_mask_from_lengths(device, DType::F32, lengths, 1, seq)?;
    Ok(PerlinInputs::from_qkv(&q, &k, &v, &mask))
}

fn teacher_for(inputs: &PerlinInputs) -> Result<TeacherTargets> {
    let device = inputs.value.device();
    let dims = inputs.value.dims4()?;
    let q = Tensor::randn(0f32, 1.0, dims, device)?;
    let k = Tensor::randn(0f32, 1.0, dims, device)?;
    let dense = ExactAttention::new().attend(&q, &k, &inputs.value, Some(&inputs.attention_mask))?;
    Ok(TeacherTargets {
        scores: dense.scores,
        context: dense.context,
    })
}

#[test]
fn nearest_resize_keeps_mask_two_valued() -> Result<()> {
    let device = Device::Cpu;
    let sentinel = fp_min(DType::F32)? as f32;
    let mask = Tensor::from_vec(vec![0f32, sentinel, sentinel, 0.0], (1, 1, 2, 2), &device)?;
    let resized = interpolate(&mask, (4, 4), Some(ResizeMode::Nearest))?;
    assert_eq!(resized.dims(), &[1, 1, 4, 4]);
    let values = resized.flatten_all()?.to_vec1::<f32>()?;
    assert!(values.iter().all(|&v| v == 0.0 || v == sentinel));
    assert_eq!(values.iter().filter(|&&v| v == 0.0).count(), 8);
    Ok(())
}

#[test]
fn context_shape_is_independent_of_method_and_flattening() -> Result<()> {
    let device = Device::Cpu;
    let inputs = random_inputs(2, 2, 12, 8, &[12, 9], &device)?;
    for method in [PredictorMethod::Mlp, PredictorMethod::Comp] {
        for flatten in [None, Some(FlattenDim::Head), Some(FlattenDim::Batch)] {
            let config = PerlinConfig {
                attention_predictor_method: method,
                k_flatten: flatten.is_some(),
                k_flatten_dim: flatten.unwrap_or(FlattenDim::Batch),
                ..small_config()
            };
            let attention = PerlinAttention::new(2, 8, config, &device, DType::F32)?;
            let out = attention.forward_infer(&inputs)?;
            assert_eq!(out.context.dims(), &[2, 12, 16], "{method} {flatten:?}");
            assert_eq!(out.estimated_attention_probs.dims(), &[2, 2, 12, 12]);
        }
    }
    Ok(())
}

#[test]
fn inference_loss_is_zero_and_training_loss_is_positive() -> Result<()> {
    let device = Device::Cpu;
    let inputs = random_inputs(1, 2, 16, 8, &[16], &device)?;
    let targets = teacher_for(&inputs)?;
    let attention = PerlinAttention::new(2, 8, small_config(), &device, DType::F32)?;

    let infer = attention.forward_infer(&inputs)?;
    assert_eq!(infer.loss.to_vec0::<f32>()?, 0.0);
    assert!(infer.loss_terms.is_none());
    assert!(infer.partial_attention_probs.is_none());
    assert!(infer.dense_attention_probs.is_none());

    let train = attention.forward_train(&inputs, &targets)?;
    let loss = train.loss.to_vec0::<f32>()?;
    assert!(loss.is_finite() && loss > 0.0, "loss = {loss}");
    let terms = train.loss_terms.expect("training returns loss terms");
    assert!((terms.total() - loss).abs() < 1e-4);
    assert!(train.partial_attention_probs.is_some());
    assert!(train.dense_attention_probs.is_some());
    assert_eq!(train.key_for_score.dims(), inputs.key_for_score.dims());
    Ok(())
}

#[test]
fn training_loss_reaches_every_parameter() -> Result<()> {
    let device = Device::Cpu;
    let inputs = random_inputs(1, 2, 8, 4, &[8], &device)?;
    let targets = teacher_for(&inputs)?;
    let config = PerlinConfig {
        k: 2,
        attention_predictor_length: 8,
        v_eye_length: 8,
        predictor_dropout: 0.0,
        ..PerlinConfig::default()
    };
    let attention = PerlinAttention::new(2, 4, config, &device, DType::F32)?;
    let out = attention.forward_train(&inputs, &targets)?;
    let grads = out.loss.backward()?;
    for (name, var) in attention.named_parameters("attn") {
        assert!(grads.get(var.as_tensor()).is_some(), "{name} has no gradient");
    }
    Ok(())
}

#[test]
fn full_budget_matches_dense_attention() -> Result<()> {
    let device = Device::Cpu;
    let inputs = random_inputs(1, 2, 16, 8, &[12], &device)?;
    let targets = teacher_for(&inputs)?;
    let config = PerlinConfig {
        k: 64,
        attention_predictor_length: 16,
        partial_attention_scaler: false,
        ..small_config()
    };
    let attention = PerlinAttention::new(2, 8, config, &device, DType::F32)?;
    let out = attention.forward_train(&inputs, &targets)?;

    let dense = ExactAttention::new().attend(
        &inputs.query_for_score,
        &inputs.key_for_score,
        &inputs.value,
        Some(&inputs.attention_mask),
    )?;
    let partial = out
        .partial_attention_probs
        .expect("training returns partial probabilities")
        .flatten_all()?
        .to_vec1::<f32>()?;
    let expected = dense.probs.flatten_all()?.to_vec1::<f32>()?;
    for (a, b) in partial.iter().zip(&expected) {
        assert!((a - b).abs() < 1e-5, "{a} vs {b}");
    }
    Ok(())
}

#[test]
fn estimator_is_deterministic_for_a_fixed_basis() -> Result<()> {
    let device = Device::Cpu;
    let q = Tensor::randn(0f32, 1.0, (1, 2, 10, 8), &device)?;
    let k = Tensor::randn(0f32, 1.0, (1, 2, 10, 8), &device)?;
    let v = Tensor::randn(0f32, 1.0, (1, 2, 10, 16), &device)?;

    let estimator = LowRankEstimator::new(8, 1.0, 1000, 7, &device)?;
    let first = estimator.forward(&q, &k, &v)?.flatten_all()?.to_vec1::<f32>()?;
    let second = estimator.forward(&q, &k, &v)?.flatten_all()?.to_vec1::<f32>()?;
    assert_eq!(first, second);

    let twin = LowRankEstimator::new(8, 1.0, 1000, 7, &device)?;
    let third = twin.forward(&q, &k, &v)?.flatten_all()?.to_vec1::<f32>()?;
    assert_eq!(first, third);
    Ok(())
}

#[test]
fn projection_buffer_round_trips_between_modules() -> Result<()> {
    let device = Device::Cpu;
    let source = PerlinAttention::with_seed(2, 8, small_config(), 3, &device, DType::F32)?;
    let target = PerlinAttention::with_seed(2, 8, small_config(), 11, &device, DType::F32)?;

    let buffers = source.named_buffers("layer0")?;
    assert_eq!(buffers.len(), 1);
    for (name, tensor) in &buffers {
        assert!(target.load_buffer("layer0", name, tensor)?);
    }
    assert!(!target.load_buffer("layer0", "layer0.unknown", &buffers[0].1)?);

    let a = source.estimator().projection()?.flatten_all()?.to_vec1::<f32>()?;
    let b = target.estimator().projection()?.flatten_all()?.to_vec1::<f32>()?;
    assert_eq!(a, b);
    Ok(())
}

#[test]
fn redraw_only_happens_while_training() -> Result<()> {
    let device = Device::Cpu;
    let config = PerlinConfig {
        redraw_interval: 1,
        ..small_config()
    };
    let attention = PerlinAttention::new(2, 8, config, &device, DType::F32)?;
    attention.set_training(false);
    for _ in 0..3 {
        assert!(!attention.redraw_projections(&device)?);
    }
    attention.set_training(true);
    let redraws = (0..4)
        .map(|_| attention.redraw_projections(&device))
        .collect::<Result<Vec<_>, _>>()?;
    assert!(redraws.iter().any(|&drawn| drawn));
    Ok(())
}

#[test]
fn zero_budget_is_rejected_before_allocation() {
    let config = PerlinConfig {
        k: 0,
        ..PerlinConfig::default()
    };
    let err = PerlinAttention::new(2, 8, config, &Device::Cpu, DType::F32).unwrap_err();
    assert!(matches!(err, PerlinError::InvalidConfig(_)), "{err}");
}

#[test]
fn integer_dtype_is_unsupported() {
    let err = PerlinAttention::new(2, 8, small_config(), &Device::Cpu, DType::U32).unwrap_err();
    assert!(matches!(err, PerlinError::UnsupportedDType(DType::U32)), "{err}");
}

#[test]
fn half_precision_pipeline_produces_half_context() -> Result<()> {
    let device = Device::Cpu;
    let inputs = random_inputs(1, 2, 8, 8, &[8], &device)?;
    let half = PerlinInputs {
        value: inputs.value.to_dtype(DType::F16)?,
        query_for_estimator: inputs.query_for_estimator.to_dtype(DType::F16)?,
        key_for_estimator: inputs.key_for_estimator.to_dtype(DType::F16)?,
        value_for_estimator: inputs.value_for_estimator.to_dtype(DType::F16)?,
        query_for_score: inputs.query_for_score.to_dtype(DType::F16)?,
        key_for_score: inputs.key_for_score.to_dtype(DType::F16)?,
        attention_mask: padding_mask_from_lengths(&device, DType::F16, &[8], 1, 8)?,
    };
    let attention = PerlinAttention::new(2, 8, small_config(), &device, DType::F16)?;
    let out = attention.forward_infer(&half)?;
    assert_eq!(out.context.dtype(), DType::F16);
    let values = out.context.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    assert!(values.iter().all(|v| v.is_finite()));
    Ok(())
}

#[test]
fn coarse_estimates_repeat_predicted_values_at_full_length() -> Result<()> {
    let device = Device::Cpu;
    let inputs = random_inputs(1, 2, 16, 8, &[16], &device)?;
    let targets = teacher_for(&inputs)?;
    let config = PerlinConfig {
        attention_predictor_length: 4,
        ..small_config()
    };
    let attention = PerlinAttention::new(2, 8, config, &device, DType::F32)?;

    let infer = attention.forward_infer(&inputs)?;
    let train = attention.forward_train(&inputs, &targets)?;
    for probs in [infer.estimated_attention_probs, train.estimated_attention_probs] {
        assert_eq!(probs.dims(), &[1, 2, 16, 16]);
        for row in probs.flatten_all()?.to_vec1::<f32>()?.chunks(16) {
            let mut distinct = row.to_vec();
            distinct.sort_by(|a, b| a.total_cmp(b));
            distinct.dedup();
            assert!(distinct.len() <= 4, "row has {} distinct values", distinct.len());
        }
    }
    Ok(())
}
