//! Frozen dense attention layer whose scores and context the student imitates.

use candle_core::{DType, Device, Tensor};
use layers::{Linear, LinearConfig, PrecisionPolicy};
use perlin::{core::split_heads, ExactAttention, PerlinInputs, TeacherTargets};
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::{config::to_runtime_error, DistillError};

/// Projected views handed to the student together with the teacher's targets.
#[derive(Debug, Clone)]
pub struct TeacherOutput {
    pub inputs: PerlinInputs,
    pub targets: TeacherTargets,
}

#[derive(Debug)]
pub struct DenseTeacher {
    heads: usize,
    query: Linear,
    key: Linear,
    value: Linear,
    attention: ExactAttention,
    policy: PrecisionPolicy,
}

impl DenseTeacher {
    /// Draws `N(0, 1/hidden)` projection weights from `seed`.
    pub fn new(
        hidden: usize,
        heads: usize,
        seed: u64,
        device: &Device,
        dtype: DType,
    ) -> Result<Self, DistillError> {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0f32, (1.0 / hidden as f32).sqrt())
            .map_err(|err| DistillError::initialization(format!("teacher init: {err}")))?;
        let mut projection = || -> Result<Linear, DistillError> {
            let weight = (0..hidden * hidden)
                .map(|_| normal.sample(&mut rng))
                .collect::<Vec<_>>();
            let weight = Tensor::from_vec(weight, (hidden, hidden), device)
                .and_then(|t| t.to_dtype(dtype))
                .map_err(to_runtime_error)?;
            let bias = Tensor::zeros(hidden, dtype, device).map_err(to_runtime_error)?;
            Linear::from_tensors(LinearConfig::new(hidden, hidden), weight, Some(bias))
                .map_err(to_runtime_error)
        };
        Ok(Self {
            heads,
            query: projection()?,
            key: projection()?,
            value: projection()?,
            attention: ExactAttention::new(),
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
        })
    }

    /// Projects `hidden` `[batch, seq, hidden]` and runs dense attention under `mask`.
    ///
    /// Every returned tensor is detached.
    pub fn forward(&self, hidden: &Tensor, mask: &Tensor) -> Result<TeacherOutput, DistillError> {
        let project = |layer: &Linear| -> Result<Tensor, DistillError> {
            let projected = layer
                .forward(hidden, &self.policy)
                .map_err(to_runtime_error)?;
            Ok(split_heads(&projected, self.heads)
                .map_err(to_runtime_error)?
                .detach())
        };
        let query = project(&self.query)?;
        let key = project(&self.key)?;
        let value = project(&self.value)?;

        let dense = self.attention.attend(&query, &key, &value, Some(mask))?;
        Ok(TeacherOutput {
            inputs: PerlinInputs::from_qkv(&query, &key, &value, mask),
            targets: TeacherTargets {
                scores: dense.scores.detach(),
                context: dense.context.detach(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use perlin::masks::padding_mask_from_lengths;

    #[test]
    fn teacher_outputs_match_student_contract() -> Result<(), DistillError> {
        let device = Device::Cpu;
        let teacher = DenseTeacher::new(8, 2, 3, &device, DType::F32)?;
        let hidden = Tensor::randn(0f32, 1.0, (2, 6, 8), &device).map_err(to_runtime_error)?;
        let mask = padding_mask_from_lengths(&device, DType::F32, &[6, 4], 1, 6)?;
        let out = teacher.forward(&hidden, &mask)?;
        assert_eq!(out.inputs.value.dims(), &[2, 2, 6, 4]);
        assert_eq!(out.targets.scores.dims(), &[2, 2, 6, 6]);
        assert_eq!(out.targets.context.dims(), &[2, 6, 8]);
        Ok(())
    }

    #[test]
    fn same_seed_builds_same_teacher() -> Result<(), DistillError> {
        let device = Device::Cpu;
        let a = DenseTeacher::new(8, 2, 9, &device, DType::F32)?;
        let b = DenseTeacher::new(8, 2, 9, &device, DType::F32)?;
        let wa = a.query.weight().flatten_all().and_then(|t| t.to_vec1::<f32>()).map_err(to_runtime_error)?;
        let wb = b.query.weight().flatten_all().and_then(|t| t.to_vec1::<f32>()).map_err(to_runtime_error)?;
        assert_eq!(wa, wb);
        Ok(())
    }
}
