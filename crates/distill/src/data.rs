//! Seeded synthetic batches standing in for a host model's hidden states.

use candle_core::{DType, Device, Tensor};
use perlin::masks::{build_causal_mask, combine_masks, padding_mask_from_lengths};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};

use crate::{
    config::{to_runtime_error, DataConfig, DistillConfig},
    DistillError,
};

pub type Result<T> = std::result::Result<T, DistillError>;

/// One micro-batch together with its position in the accumulation window.
#[derive(Debug)]
pub struct DistillBatch {
    /// `[batch, seq_len, hidden]`, zero at padded positions.
    pub hidden: Tensor,
    /// Additive mask `[batch, 1, 1 | seq_len, seq_len]`.
    pub attention_mask: Tensor,
    pub lengths: Vec<usize>,
    pub micro_batch_index: usize,
    pub micro_batches_per_step: usize,
    pub global_step: usize,
    pub epoch: usize,
}

impl DistillBatch {
    pub fn tokens(&self) -> usize {
        self.lengths.iter().sum()
    }
}

/// Endless stream of padded random sequences, deterministic for a given seed.
#[derive(Debug)]
pub struct SyntheticBatchSource {
    rng: StdRng,
    device: Device,
    dtype: DType,
    data: DataConfig,
    hidden_size: usize,
    sequence_length: usize,
    global_step: usize,
}

impl SyntheticBatchSource {
    pub fn new(config: &DistillConfig, seed: u64, device: &Device, dtype: DType) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            device: device.clone(),
            dtype,
            data: config.data.clone(),
            hidden_size: config.model.hidden_size,
            sequence_length: config.model.sequence_length,
            global_step: 0,
        }
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn next_batch(&mut self) -> Result<DistillBatch> {
        let batch_size = self.data.batch_size;
        let seq = self.sequence_length;
        let shortest = ((seq as f32 * self.data.min_fill).ceil() as usize).clamp(1, seq);

        let lengths = (0..batch_size)
            .map(|_| self.rng.gen_range(shortest..=seq))
            .collect::<Vec<_>>();

        let mut values = Vec::with_capacity(batch_size * seq * self.hidden_size);
        for &length in &lengths {
            for position in 0..seq {
                for _ in 0..self.hidden_size {
                    let sample: f32 = StandardNormal.sample(&mut self.rng);
                    values.push(if position < length { sample } else { 0.0 });
                }
            }
        }
        let hidden = Tensor::from_vec(values, (batch_size, seq, self.hidden_size), &self.device)
            .and_then(|t| t.to_dtype(self.dtype))
            .map_err(to_runtime_error)?;

        let padding = padding_mask_from_lengths(&self.device, self.dtype, &lengths, 1, seq)?;
        let attention_mask = if self.data.causal {
            let causal = build_causal_mask(&self.device, self.dtype, batch_size, seq, seq)?;
            combine_masks(&padding, &causal).map_err(to_runtime_error)?
        } else {
            padding
        };

        let window = self.data.gradient_accumulation_steps.max(1);
        let global_step = self.global_step;
        self.global_step += 1;

        Ok(DistillBatch {
            hidden,
            attention_mask,
            lengths,
            micro_batch_index: global_step % window,
            micro_batches_per_step: window,
            global_step,
            epoch: global_step / self.data.batches_per_epoch.max(1),
        })
    }

    /// Draws and discards batches until `global_step` micro-batches have been produced.
    pub fn fast_forward(&mut self, global_step: usize) -> Result<()> {
        while self.global_step < global_step {
            self.next_batch()?;
        }
        Ok(())
    }
}
