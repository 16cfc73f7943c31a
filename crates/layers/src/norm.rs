//! Layer normalisation over the trailing axis.
//!
//! Statistics (mean, variance) are computed in [`PrecisionPolicy::reduction`]
//! and the affine transform runs in the compute dtype before casting back to
//! storage. Inputs may have any rank.

use candle_core::{DType, Device, Result, Tensor, Var, D};

use crate::{checks, dtypes::PrecisionPolicy, scoped};

/// Configuration for a [`LayerNorm`].
#[derive(Debug, Clone, PartialEq)]
pub struct NormConfig {
    /// Size of the normalised trailing dimension.
    pub hidden_size: usize,
    /// Numeric stabiliser added to the variance.
    pub epsilon: f64,
}

impl NormConfig {
    /// Creates a configuration with the conventional `1e-5` epsilon.
    pub fn new(hidden_size: usize) -> Self {
        Self {
            hidden_size,
            epsilon: 1e-5,
        }
    }
}

/// LayerNorm with a learnable scale (ones) and shift (zeros).
#[derive(Debug, Clone)]
pub struct LayerNorm {
    config: NormConfig,
    weight: Var,
    bias: Var,
}

impl LayerNorm {
    /// Constructs a LayerNorm initialised to the identity affine map.
    pub fn new(config: NormConfig, device: &Device, dtype: DType) -> Result<Self> {
        let weight = Var::ones(config.hidden_size, dtype, device)?;
        let bias = Var::zeros(config.hidden_size, dtype, device)?;
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    /// Constructs a LayerNorm from explicit affine parameters.
    pub fn from_tensors(config: NormConfig, weight: Tensor, bias: Tensor) -> Result<Self> {
        checks::expect_shape("norm.weight", &weight, &[config.hidden_size])?;
        checks::expect_shape("norm.bias", &bias, &[config.hidden_size])?;
        Ok(Self {
            config,
            weight: Var::from_tensor(&weight)?,
            bias: Var::from_tensor(&bias)?,
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &NormConfig {
        &self.config
    }

    /// Trainable parameters as `(scope.weight, scope.bias)`.
    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        vec![
            (scoped(scope, "weight"), self.weight.clone()),
            (scoped(scope, "bias"), self.bias.clone()),
        ]
    }

    /// Normalises `hidden` along its last axis.
    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_last_dim("norm.input", hidden, self.config.hidden_size)?;

        let hidden_size = self.config.hidden_size as f64;
        let compute = policy.cast_for_reduction(hidden)?;
        let mean = (compute.sum_keepdim(D::Minus1)? / hidden_size)?;
        let centered = compute.broadcast_sub(&mean)?;
        let variance = (centered.sqr()?.sum_keepdim(D::Minus1)? / hidden_size)?;
        let denom = (variance + self.config.epsilon)?.sqrt()?;
        let normalized = policy.cast_for_matmul(&centered.broadcast_div(&denom)?)?;

        let weight = policy.cast_for_matmul(self.weight.as_tensor())?;
        let bias = policy.cast_for_matmul(self.bias.as_tensor())?;
        let output = normalized.broadcast_mul(&weight)?.broadcast_add(&bias)?;
        policy.cast_to_storage(&output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::ops;

    fn build_input(device: &Device, dtype: DType, dims: &[usize]) -> Result<Tensor> {
        let total = dims.iter().product::<usize>();
        let data = (0..total)
            .map(|i| (i as f32 * 0.25_f32) - 1.5_f32)
            .collect::<Vec<_>>();
        Tensor::from_vec(data, dims, device)?.to_dtype(dtype)
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        a.to_dtype(DType::F32)?
            .sub(&b.to_dtype(DType::F32)?)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()
    }

    #[test]
    fn layer_norm_matches_reference_across_dtypes() -> Result<()> {
        let device = Device::Cpu;
        let hidden = 4;
        let config = NormConfig::new(hidden);
        let weight_f32 = Tensor::from_vec(vec![1.0f32, 0.5, -0.25, 1.5], (hidden,), &device)?;
        let bias_f32 = Tensor::from_vec(vec![0.1f32, -0.2, 0.05, 0.0], (hidden,), &device)?;

        for &dtype in &[DType::F32, DType::F16, DType::BF16] {
            let input = build_input(&device, dtype, &[2, 3, hidden])?;
            let weight = weight_f32.to_dtype(dtype)?;
            let bias = bias_f32.to_dtype(dtype)?;
            let layer = LayerNorm::from_tensors(config.clone(), weight.clone(), bias.clone())?;
            let policy = PrecisionPolicy::from_parameter_dtype(dtype);
            let output = layer.forward(&input, &policy)?;

            assert_eq!(output.dims(), input.dims());
            assert_eq!(output.dtype(), dtype);

            let reference = ops::layer_norm(&input, &weight, &bias, config.epsilon as f32)?;
            let tol = match dtype {
                DType::F16 => 1e-2,
                DType::BF16 => 5e-2,
                _ => 5e-4,
            };
            let diff = max_diff(&output, &reference)?;
            assert!(diff < tol, "max diff {} for dtype {:?}", diff, dtype);
        }
        Ok(())
    }

    #[test]
    fn fresh_norm_standardises_rank_four_input() -> Result<()> {
        let device = Device::Cpu;
        let layer = LayerNorm::new(NormConfig::new(6), &device, DType::F32)?;
        let input = build_input(&device, DType::F32, &[1, 2, 3, 6])?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let output = layer.forward(&input, &policy)?;

        let mean = output.mean_keepdim(D::Minus1)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(mean < 1e-5);
        let var = output.sqr()?.mean_keepdim(D::Minus1)?.flatten_all()?.to_vec1::<f32>()?;
        assert!(var.iter().all(|v| (v - 1.0).abs() < 1e-3));
        Ok(())
    }
}
