//! Same-padded 2-D convolutions over `(batch, channels, height, width)` grids.
//!
//! The predictor refines its `(query, predicted key)` score grid with a short
//! stack of these, using attention heads as channels.

use std::{fmt, sync::Arc};

use candle_core::{DType, Device, Error, Result, Tensor, Var};

use crate::{
    activations::{builtin, Activation, ActivationKind},
    checks,
    dtypes::PrecisionPolicy,
    scoped,
};

/// Shape of a single convolution layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conv2dConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    /// Square kernel size; must be odd so `padding = kernel_size / 2` keeps the grid size.
    pub kernel_size: usize,
}

impl Conv2dConfig {
    pub fn same(in_channels: usize, out_channels: usize, kernel_size: usize) -> Self {
        Self {
            in_channels,
            out_channels,
            kernel_size,
        }
    }

    fn padding(&self) -> usize {
        self.kernel_size / 2
    }
}

/// Trainable 2-D convolution with bias and stride 1.
#[derive(Debug, Clone)]
pub struct Conv2d {
    config: Conv2dConfig,
    weight: Var,
    bias: Var,
}

impl Conv2d {
    /// Initialises weights and bias from `U(-1/sqrt(fan_in), 1/sqrt(fan_in))`.
    pub fn new(config: Conv2dConfig, device: &Device, dtype: DType) -> Result<Self> {
        if config.kernel_size % 2 == 0 {
            return Err(Error::Msg(format!(
                "conv2d requires an odd kernel size for same padding, got {}",
                config.kernel_size
            )));
        }
        let fan_in = (config.in_channels * config.kernel_size * config.kernel_size) as f64;
        let bound = (1.0 / fan_in.sqrt()) as f32;
        let shape = (
            config.out_channels,
            config.in_channels,
            config.kernel_size,
            config.kernel_size,
        );
        let weight = Tensor::rand(-bound, bound, shape, device)?.to_dtype(dtype)?;
        let bias = Tensor::rand(-bound, bound, config.out_channels, device)?.to_dtype(dtype)?;
        Ok(Self {
            config,
            weight: Var::from_tensor(&weight)?,
            bias: Var::from_tensor(&bias)?,
        })
    }

    pub fn config(&self) -> &Conv2dConfig {
        &self.config
    }

    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        vec![
            (scoped(scope, "weight"), self.weight.clone()),
            (scoped(scope, "bias"), self.bias.clone()),
        ]
    }

    /// Convolves `input` shaped `(batch, in_channels, h, w)` into `(batch, out_channels, h, w)`.
    pub fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_rank("conv2d.input", input, 4)?;
        let (_, channels, _, _) = input.dims4()?;
        if channels != self.config.in_channels {
            return Err(Error::Msg(format!(
                "conv2d expected {} input channels, got {}",
                self.config.in_channels, channels
            )));
        }
        let input = policy.cast_for_matmul(input)?.contiguous()?;
        let weight = policy.cast_for_matmul(self.weight.as_tensor())?;
        let bias = policy
            .cast_for_matmul(self.bias.as_tensor())?
            .reshape((1, self.config.out_channels, 1, 1))?;
        let output = input
            .conv2d(&weight, self.config.padding(), 1, 1, 1)?
            .broadcast_add(&bias)?;
        policy.cast_to_storage(&output)
    }
}

/// A sequence of same-padded convolutions, each followed by an activation.
#[derive(Clone)]
pub struct ConvStack {
    layers: Vec<Conv2d>,
    activation: Arc<dyn Activation>,
}

impl fmt::Debug for ConvStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConvStack")
            .field("layers", &self.layers)
            .field("activation", &self.activation.kind())
            .finish()
    }
}

impl ConvStack {
    /// Builds `depth` layers of `channels -> channels` convolutions.
    pub fn new(
        depth: usize,
        channels: usize,
        kernel_size: usize,
        activation: ActivationKind,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let layers = (0..depth)
            .map(|_| Conv2d::new(Conv2dConfig::same(channels, channels, kernel_size), device, dtype))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            layers,
            activation: builtin(activation),
        })
    }

    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        self.layers
            .iter()
            .enumerate()
            .flat_map(|(idx, layer)| layer.named_parameters(&scoped(scope, &idx.to_string())))
            .collect()
    }

    pub fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let mut hidden = input.clone();
        for layer in &self.layers {
            hidden = layer.forward(&hidden, policy)?;
            hidden = self.activation.forward(&hidden, policy)?;
        }
        Ok(hidden)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_padding_preserves_grid() -> Result<()> {
        let device = Device::Cpu;
        let stack = ConvStack::new(5, 2, 3, ActivationKind::Gelu, &device, DType::F32)?;
        let input = Tensor::randn(0f32, 1.0, (3, 2, 7, 11), &device)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let output = stack.forward(&input, &policy)?;
        assert_eq!(output.dims(), &[3, 2, 7, 11]);
        assert_eq!(stack.named_parameters("conv").len(), 10);
        assert_eq!(stack.named_parameters("conv")[9].0, "conv.4.bias");
        Ok(())
    }

    #[test]
    fn identity_kernel_reproduces_input() -> Result<()> {
        let device = Device::Cpu;
        let conv = Conv2d::new(Conv2dConfig::same(1, 1, 3), &device, DType::F32)?;
        let mut kernel = vec![0f32; 9];
        kernel[4] = 1.0;
        conv.weight
            .set(&Tensor::from_vec(kernel, (1, 1, 3, 3), &device)?)?;
        conv.bias.set(&Tensor::zeros(1, DType::F32, &device)?)?;

        let input = Tensor::randn(0f32, 1.0, (1, 1, 4, 5), &device)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let diff = conv
            .forward(&input, &policy)?
            .sub(&input)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }

    #[test]
    fn even_kernels_are_rejected() {
        let result = Conv2d::new(Conv2dConfig::same(1, 1, 4), &Device::Cpu, DType::F32);
        assert!(result.is_err());
    }
}
