use std::time::{Duration, Instant};

use perlin::LossTerms;

#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    alpha: f64,
    value: Option<f64>,
}

impl ExponentialMovingAverage {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let v = match self.value {
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
            None => sample,
        };
        self.value = Some(v);
        v
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Running statistics over optimizer steps.
#[derive(Debug)]
pub struct DistillMetrics {
    step_timer: Instant,
    start_time: Instant,
    tokens_processed: u64,
    skipped_steps: u64,
    loss_ema: ExponentialMovingAverage,
    throughput_ema: ExponentialMovingAverage,
}

impl Default for DistillMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl DistillMetrics {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            step_timer: now,
            start_time: now,
            tokens_processed: 0,
            skipped_steps: 0,
            loss_ema: ExponentialMovingAverage::new(0.1),
            throughput_ema: ExponentialMovingAverage::new(0.1),
        }
    }

    /// `terms` are averaged over the micro-batches of the window.
    pub fn record_step(
        &mut self,
        tokens: u64,
        loss: f64,
        grad_norm: f64,
        terms: LossTerms,
    ) -> StepSnapshot {
        let now = Instant::now();
        let step_duration = now.duration_since(self.step_timer);
        self.step_timer = now;

        self.tokens_processed = self.tokens_processed.saturating_add(tokens);
        let step_tokens_per_sec = if step_duration > Duration::ZERO {
            tokens as f64 / step_duration.as_secs_f64()
        } else {
            0.0
        };

        StepSnapshot {
            loss: self.loss_ema.update(loss),
            step_loss: loss,
            terms,
            tokens,
            tokens_per_sec: self.throughput_ema.update(step_tokens_per_sec),
            grad_norm,
            total_tokens: self.tokens_processed,
            wall_time: now.duration_since(self.start_time),
        }
    }

    /// Counts a window whose gradients overflowed; the timer restarts so the
    /// next step's throughput is not diluted.
    pub fn record_skipped(&mut self) -> u64 {
        self.step_timer = Instant::now();
        self.skipped_steps += 1;
        self.skipped_steps
    }

    pub fn skipped_steps(&self) -> u64 {
        self.skipped_steps
    }
}

#[derive(Debug, Clone)]
pub struct StepSnapshot {
    /// Exponential moving average of the step loss.
    pub loss: f64,
    pub step_loss: f64,
    pub terms: LossTerms,
    pub tokens: u64,
    pub tokens_per_sec: f64,
    pub grad_norm: f64,
    pub total_tokens: u64,
    pub wall_time: Duration,
}

/// Token-weighted averages over validation batches run in inference mode.
#[derive(Debug, Default)]
pub struct EvaluationMetrics {
    context_sq_error: f64,
    probs_sq_error: f64,
    token_count: u64,
    batches: usize,
}

impl EvaluationMetrics {
    pub fn update(&mut self, context_mse: f64, probs_mse: f64, tokens: u64) {
        self.context_sq_error += context_mse * tokens as f64;
        self.probs_sq_error += probs_mse * tokens as f64;
        self.token_count += tokens;
        self.batches += 1;
    }

    pub fn finalize(self) -> Option<EvaluationSummary> {
        if self.token_count == 0 {
            return None;
        }
        let tokens = self.token_count as f64;
        Some(EvaluationSummary {
            context_mse: self.context_sq_error / tokens,
            probs_mse: self.probs_sq_error / tokens,
            batches: self.batches,
            tokens: self.token_count,
        })
    }
}

#[derive(Debug, Clone)]
pub struct EvaluationSummary {
    /// Context error against the teacher, in the teacher's output space.
    pub context_mse: f64,
    /// Error of the estimated attention probabilities against the dense ones.
    pub probs_mse: f64,
    pub batches: usize,
    pub tokens: u64,
}
