use std::path::{Path, PathBuf};

use candle_core::{backprop::GradStore, DType, Device, Tensor, D};
use candle_nn::ops::softmax;
use perlin::{LossTerms, PerlinAttention};

use crate::{
    checkpoint::{self, LoadOutcome, ProgressSnapshot, SaveRequest},
    config::to_runtime_error,
    data::{DistillBatch, SyntheticBatchSource},
    logging::{Logger, LoggingSettings},
    metrics::{DistillMetrics, EvaluationMetrics, EvaluationSummary},
    optimizer::{AdamWConfig, DistillOptimizer, DistillOptimizerOptions, GradientScaler},
    teacher::DenseTeacher,
    DistillConfig, DistillError,
};

const TEACHER_SEED_OFFSET: u64 = 0;
const STUDENT_SEED_OFFSET: u64 = 1;
const TRAIN_DATA_SEED_OFFSET: u64 = 2;
const VALIDATION_DATA_SEED_OFFSET: u64 = 3;

/// Distills the dense teacher into a [`PerlinAttention`] student.
pub struct Trainer {
    config: DistillConfig,
    device: Device,
    teacher: DenseTeacher,
    student: PerlinAttention,
    optimizer: DistillOptimizer,
    gradient_scaler: GradientScaler,
    parameter_tensors: Vec<Tensor>,
    source: SyntheticBatchSource,
    progress: ProgressSnapshot,
    checkpoint: Option<CheckpointSettings>,
    optimizer_steps: usize,
    metrics: DistillMetrics,
    logger: Logger,
}

#[derive(Debug, Clone)]
struct CheckpointSettings {
    directory: PathBuf,
    every_n_steps: usize,
    max_keep: Option<usize>,
}

impl Trainer {
    pub fn new(config: DistillConfig) -> Result<Self, DistillError> {
        config.validate()?;

        let device = Device::Cpu;
        let dtype = config.runtime.precision.dtype();
        let seed = config.runtime.seed;
        let heads = config.model.num_attention_heads;

        let teacher = DenseTeacher::new(
            config.model.hidden_size,
            heads,
            seed.wrapping_add(TEACHER_SEED_OFFSET),
            &device,
            dtype,
        )?;
        let student = PerlinAttention::with_seed(
            heads,
            config.head_dim(),
            config.perlin.clone(),
            seed.wrapping_add(STUDENT_SEED_OFFSET),
            &device,
            dtype,
        )?;

        let named_parameters = student.named_parameters(checkpoint::MODEL_SCOPE);
        let parameter_tensors = named_parameters
            .iter()
            .map(|(_, var)| var.as_tensor().clone())
            .collect();
        let optimizer = DistillOptimizer::new(
            named_parameters,
            AdamWConfig::from(&config.optimizer),
            DistillOptimizerOptions::from(&config.optimizer),
        )?;
        let gradient_scaler = GradientScaler::new(config.runtime.precision);

        let source = SyntheticBatchSource::new(
            &config,
            seed.wrapping_add(TRAIN_DATA_SEED_OFFSET),
            &device,
            dtype,
        );
        let logger = Logger::new(LoggingSettings::from(&config.runtime.logging))?;
        let checkpoint = config
            .runtime
            .checkpoint
            .as_ref()
            .map(|cfg| CheckpointSettings {
                directory: cfg.directory.clone(),
                every_n_steps: cfg.every_n_steps,
                max_keep: cfg.max_keep,
            });

        Ok(Self {
            progress: ProgressSnapshot {
                micro_batches_per_step: config.data.gradient_accumulation_steps.max(1),
                ..ProgressSnapshot::default()
            },
            config,
            device,
            teacher,
            student,
            optimizer,
            gradient_scaler,
            parameter_tensors,
            source,
            checkpoint,
            optimizer_steps: 0,
            metrics: DistillMetrics::new(),
            logger,
        })
    }

    pub fn config(&self) -> &DistillConfig {
        &self.config
    }

    pub fn student(&self) -> &PerlinAttention {
        &self.student
    }

    pub fn optimizer_steps(&self) -> usize {
        self.optimizer_steps
    }

    pub fn progress(&self) -> &ProgressSnapshot {
        &self.progress
    }

    pub fn resume_from_latest(
        &mut self,
    ) -> Result<Option<checkpoint::CheckpointDescriptor>, DistillError> {
        let Some(settings) = &self.checkpoint else {
            return Ok(None);
        };
        let Some(descriptor) = checkpoint::latest_checkpoint(&settings.directory)? else {
            return Ok(None);
        };
        println!(
            "resuming from checkpoint {} (optimizer step {})",
            descriptor.directory.display(),
            descriptor.manifest.progress.optimizer_step
        );
        let outcome = checkpoint::load_checkpoint(&descriptor.directory, &self.config)?;
        self.apply_checkpoint(outcome)?;
        Ok(Some(descriptor))
    }

    pub fn resume_from_path(
        &mut self,
        directory: &Path,
    ) -> Result<checkpoint::CheckpointDescriptor, DistillError> {
        let outcome = checkpoint::load_checkpoint(directory, &self.config)?;
        let manifest = outcome.manifest.clone();
        self.apply_checkpoint(outcome)?;
        Ok(checkpoint::CheckpointDescriptor {
            directory: directory.to_path_buf(),
            manifest,
        })
    }

    /// Runs the student in inference mode over `max_batches` validation batches
    /// (the configured count when `None`).
    pub fn evaluate(&mut self, max_batches: Option<usize>) -> Result<EvaluationSummary, DistillError> {
        let was_training = self.student.is_training();
        self.student.set_training(false);
        let result = self.evaluate_internal(
            max_batches.unwrap_or(self.config.data.validation_batches),
        );
        self.student.set_training(was_training);
        result
    }

    pub fn train(&mut self) -> Result<(), DistillError> {
        self.train_with_shutdown(|| false)
    }

    pub fn train_with_shutdown<F>(&mut self, mut should_stop: F) -> Result<(), DistillError>
    where
        F: FnMut() -> bool,
    {
        self.student.set_training(true);
        let mut accumulated_grads: Option<GradStore> = None;
        let mut step_metrics = StepMetrics::default();

        println!(
            "starting distillation on {:?} (precision={:?}, heads={}, head_dim={}, seq={}, k={})",
            self.device,
            self.config.runtime.precision,
            self.student.heads(),
            self.student.head_dim(),
            self.config.model.sequence_length,
            self.config.perlin.k
        );

        loop {
            if should_stop() {
                println!("stop requested after step {}", self.optimizer_steps);
                break;
            }
            if let Some(limit) = self.config.runtime.max_steps {
                if self.optimizer_steps >= limit {
                    break;
                }
            }

            let batch = self.source.next_batch()?;
            if batch.epoch >= self.config.runtime.epochs {
                break;
            }

            let teacher = self.teacher.forward(&batch.hidden, &batch.attention_mask)?;
            let output = self
                .student
                .forward_train(&teacher.inputs, &teacher.targets)?;
            let loss_value = output
                .loss
                .to_dtype(DType::F32)
                .and_then(|loss| loss.to_vec0::<f32>())
                .map_err(to_runtime_error)?;
            step_metrics.accumulate(
                loss_value as f64,
                output.loss_terms.unwrap_or_default(),
                batch.tokens(),
            );

            let accumulation = batch.micro_batches_per_step.max(1) as f64;
            let normalized_loss = output
                .loss
                .affine(1.0 / accumulation, 0.0)
                .map_err(to_runtime_error)?;
            let scaled_loss = self.gradient_scaler.scale(&normalized_loss)?;
            let micro_grads = scaled_loss.backward().map_err(to_runtime_error)?;

            if let Some(existing) = accumulated_grads.as_mut() {
                self.merge_gradient_store(existing, micro_grads)?;
            } else {
                accumulated_grads = Some(micro_grads);
            }

            let is_step_boundary =
                batch.micro_batch_index + 1 == batch.micro_batches_per_step.max(1);
            if !is_step_boundary {
                continue;
            }
            let Some(mut grads) = accumulated_grads.take() else {
                continue;
            };

            self.optimizer
                .unscale_gradients(&mut grads, &self.gradient_scaler)?;
            let found_inf = self
                .gradient_scaler
                .has_overflow(self.optimizer.gradients(&grads))?
                || !step_metrics.average_loss().is_finite();
            self.gradient_scaler.update(found_inf);

            if found_inf {
                self.optimizer.zero_grad(&mut grads);
                let skipped = self.metrics.record_skipped();
                self.logger.log_skipped_step(
                    self.optimizer_steps,
                    self.gradient_scaler.loss_scale(),
                    skipped,
                );
                step_metrics = StepMetrics::default();
                continue;
            }

            let lr = self.optimizer.learning_rate();
            let grad_norm = self.optimizer.step(&mut grads)?;
            self.optimizer_steps += 1;
            self.student.redraw_projections(&self.device)?;
            self.record_progress(&batch);

            let snapshot = self.metrics.record_step(
                step_metrics.tokens as u64,
                step_metrics.average_loss(),
                grad_norm,
                step_metrics.average_terms(),
            );
            let log_every = self.config.runtime.log_every_n_steps.max(1);
            if self.optimizer_steps % log_every == 0 || self.optimizer_steps == 1 {
                self.logger
                    .log_training_step(self.optimizer_steps, lr, &snapshot);
            }

            self.maybe_checkpoint()?;
            self.maybe_evaluate()?;
            step_metrics = StepMetrics::default();
        }

        self.logger.flush();
        Ok(())
    }

    fn merge_gradient_store(
        &self,
        accum: &mut GradStore,
        mut new_grads: GradStore,
    ) -> Result<(), DistillError> {
        for tensor in &self.parameter_tensors {
            if let Some(grad) = new_grads.remove(tensor) {
                let combined = match accum.remove(tensor) {
                    Some(existing) => existing.add(&grad).map_err(to_runtime_error)?,
                    None => grad,
                };
                accum.insert(tensor, combined);
            }
        }
        Ok(())
    }

    fn record_progress(&mut self, batch: &DistillBatch) {
        self.progress.optimizer_step = self.optimizer_steps;
        self.progress.global_step = batch.global_step + 1;
        self.progress.epoch = batch.epoch;
        self.progress.micro_batches_per_step = batch.micro_batches_per_step;
    }

    fn maybe_checkpoint(&mut self) -> Result<(), DistillError> {
        let Some(settings) = &self.checkpoint else {
            return Ok(());
        };
        if settings.every_n_steps == 0 || self.optimizer_steps % settings.every_n_steps != 0 {
            return Ok(());
        }

        let descriptor = checkpoint::save_checkpoint(SaveRequest {
            base_dir: &settings.directory,
            config: &self.config,
            model: &self.student,
            optimizer: &self.optimizer,
            scaler: &self.gradient_scaler,
            progress: self.progress.clone(),
            max_keep: settings.max_keep,
        })?;
        println!(
            "checkpoint saved at step {} -> {}",
            self.optimizer_steps,
            descriptor.directory.display()
        );
        Ok(())
    }

    fn maybe_evaluate(&mut self) -> Result<(), DistillError> {
        let Some(every) = self.config.runtime.evaluation.every_n_steps else {
            return Ok(());
        };
        if every == 0 || self.optimizer_steps % every != 0 {
            return Ok(());
        }
        let summary = self.evaluate(self.config.runtime.evaluation.max_batches)?;
        self.logger.log_evaluation(self.optimizer_steps, &summary);
        self.logger.flush();
        Ok(())
    }

    /// Validation batches come from a fresh source each time so every
    /// evaluation sees the same sequences.
    fn evaluate_internal(&self, max_batches: usize) -> Result<EvaluationSummary, DistillError> {
        let mut source = SyntheticBatchSource::new(
            &self.config,
            self.config
                .runtime
                .seed
                .wrapping_add(VALIDATION_DATA_SEED_OFFSET),
            &self.device,
            self.config.runtime.precision.dtype(),
        );
        let mut metrics = EvaluationMetrics::default();

        for _ in 0..max_batches {
            let batch = source.next_batch()?;
            let teacher = self.teacher.forward(&batch.hidden, &batch.attention_mask)?;
            let output = self.student.forward_infer(&teacher.inputs)?;

            let context_mse = mean_squared_error(&output.context, &teacher.targets.context)?;
            let teacher_probs = teacher
                .targets
                .scores
                .to_dtype(DType::F32)
                .and_then(|scores| {
                    scores.broadcast_add(&batch.attention_mask.to_dtype(DType::F32)?)
                })
                .and_then(|scores| softmax(&scores, D::Minus1))
                .map_err(to_runtime_error)?;
            let probs_mse = mean_squared_error(&output.estimated_attention_probs, &teacher_probs)?;

            metrics.update(context_mse, probs_mse, batch.tokens() as u64);
        }

        metrics
            .finalize()
            .ok_or_else(|| DistillError::runtime("evaluation produced no tokens"))
    }

    fn apply_checkpoint(&mut self, outcome: LoadOutcome) -> Result<(), DistillError> {
        let LoadOutcome {
            manifest,
            optimizer_state,
            scaler_state,
            model_weights_path,
        } = outcome;

        checkpoint::apply_model_weights(&self.student, &model_weights_path, &self.device)?;
        self.optimizer.load_state(optimizer_state)?;
        self.gradient_scaler.load_state(&scaler_state)?;

        if manifest.progress.global_step > 0 {
            println!(
                "fast-forwarding synthetic data to micro-batch {}",
                manifest.progress.global_step
            );
        }
        self.source.fast_forward(manifest.progress.global_step)?;

        self.progress = manifest.progress;
        self.optimizer_steps = self.progress.optimizer_step;
        Ok(())
    }
}

fn mean_squared_error(lhs: &Tensor, rhs: &Tensor) -> Result<f64, DistillError> {
    let lhs = lhs.to_dtype(DType::F32).map_err(to_runtime_error)?;
    let rhs = rhs.to_dtype(DType::F32).map_err(to_runtime_error)?;
    let value = lhs
        .sub(&rhs)
        .and_then(|diff| diff.sqr())
        .and_then(|sq| sq.mean_all())
        .and_then(|mean| mean.to_vec0::<f32>())
        .map_err(to_runtime_error)?;
    Ok(value as f64)
}

/// Loss statistics of the micro-batches in the current accumulation window.
#[derive(Default)]
struct StepMetrics {
    loss_sum: f64,
    terms_sum: LossTerms,
    micro_batches: usize,
    tokens: usize,
}

impl StepMetrics {
    fn accumulate(&mut self, loss: f64, terms: LossTerms, tokens: usize) {
        self.loss_sum += loss;
        self.terms_sum.kl += terms.kl;
        self.terms_sum.probs_mse += terms.probs_mse;
        self.terms_sum.scores_mse += terms.scores_mse;
        self.terms_sum.context_mse += terms.context_mse;
        self.micro_batches += 1;
        self.tokens += tokens;
    }

    fn average_loss(&self) -> f64 {
        self.loss_sum / self.micro_batches.max(1) as f64
    }

    fn average_terms(&self) -> LossTerms {
        let n = self.micro_batches.max(1) as f32;
        LossTerms {
            kl: self.terms_sum.kl / n,
            probs_mse: self.terms_sum.probs_mse / n,
            scores_mse: self.terms_sum.scores_mse / n,
            context_mse: self.terms_sum.context_mse / n,
        }
    }
}
