//! Trainable affine projections.
//!
//! Inputs may have any rank as long as the trailing dimension equals
//! `input_dim`; leading dimensions are flattened for the matmul and restored
//! afterwards. Weights are cast to [`PrecisionPolicy::compute`] for the matmul
//! and the result is returned in the storage dtype.

use candle_core::{DType, Device, Error, Result, Tensor, Var};

use crate::{checks, dtypes::PrecisionPolicy, scoped};

/// Configuration shared by dense projection layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearConfig {
    /// Incoming feature dimension.
    pub input_dim: usize,
    /// Output feature dimension.
    pub output_dim: usize,
    /// Whether a learnable bias vector should be applied.
    pub bias: bool,
}

impl LinearConfig {
    /// Creates a configuration for a biased projection.
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: true,
        }
    }
}

/// Supported weight initialisation policies.
#[derive(Debug, Clone)]
pub enum LinearInit {
    /// Xavier/Glorot uniform initialisation.
    XavierUniform,
    /// Xavier/Glorot normal initialisation.
    XavierNormal,
    /// Kaiming/He uniform initialisation.
    KaimingUniform { negative_slope: f64 },
    /// Scales another policy.
    Scaled { base: Box<LinearInit>, scale: f64 },
}

impl Default for LinearInit {
    /// `U(-1/sqrt(fan_in), 1/sqrt(fan_in))`, the usual default for dense layers.
    fn default() -> Self {
        LinearInit::KaimingUniform {
            negative_slope: 5f64.sqrt(),
        }
    }
}

impl LinearInit {
    /// Convenience helper to scale an existing policy.
    pub fn scaled(base: LinearInit, scale: f64) -> Self {
        Self::Scaled {
            base: Box::new(base),
            scale,
        }
    }

    /// Samples a `(out_dim, in_dim)` weight matrix in `dtype`.
    pub fn sample(&self, shape: (usize, usize), device: &Device, dtype: DType) -> Result<Tensor> {
        let (out_dim, in_dim) = shape;
        let (fan_in, fan_out) = (in_dim as f64, out_dim as f64);
        let weight_f32 = match self {
            LinearInit::XavierUniform => {
                let bound = (6.0f64 / (fan_in + fan_out)).sqrt();
                Tensor::rand(-bound as f32, bound as f32, shape, device)?
            }
            LinearInit::XavierNormal => {
                let std = (2.0f64 / (fan_in + fan_out)).sqrt();
                Tensor::randn(0f32, std as f32, shape, device)?
            }
            LinearInit::KaimingUniform { negative_slope } => {
                let gain = (2.0f64 / (1.0 + negative_slope.powi(2))).sqrt();
                let bound = 3.0f64.sqrt() * gain / fan_in.sqrt();
                Tensor::rand(-bound as f32, bound as f32, shape, device)?
            }
            LinearInit::Scaled { base, scale } => {
                base.sample(shape, device, DType::F32)?.affine(*scale, 0.0)?
            }
        };
        if dtype == DType::F32 {
            Ok(weight_f32)
        } else {
            checks::ensure_cast_supported("linear.init", DType::F32, dtype)?;
            weight_f32.to_dtype(dtype)
        }
    }
}

/// Dense affine projection with optional bias.
#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    weight: Var,
    bias: Option<Var>,
}

impl Linear {
    /// Builds a linear layer from explicit weight `(out, in)` and bias `(out,)` tensors.
    pub fn from_tensors(config: LinearConfig, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        Self::validate_weight(&config, &weight)?;
        match (config.bias, bias.as_ref()) {
            (true, Some(tensor)) => {
                checks::expect_shape("linear.bias", tensor, &[config.output_dim])?;
                checks::expect_same_dtype("linear.bias", tensor, "linear.weight", &weight)?;
            }
            (false, Some(_)) => {
                return Err(Error::Msg("bias provided but config disables bias".into()))
            }
            (true, None) => return Err(Error::Msg("config expects bias but none supplied".into())),
            (false, None) => {}
        }
        Ok(Self {
            config,
            weight: Var::from_tensor(&weight)?,
            bias: bias.map(|b| Var::from_tensor(&b)).transpose()?,
        })
    }

    /// Builds a linear layer with randomly initialised weights and a zero bias.
    pub fn with_init(
        config: LinearConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let weight = init.sample((config.output_dim, config.input_dim), device, dtype)?;
        let bias = if config.bias {
            Some(Tensor::zeros(config.output_dim, dtype, device)?)
        } else {
            None
        };
        Self::from_tensors(config, weight, bias)
    }

    /// Returns the layer configuration.
    pub fn config(&self) -> &LinearConfig {
        &self.config
    }

    /// Returns the weight tensor.
    pub fn weight(&self) -> &Tensor {
        self.weight.as_tensor()
    }

    /// Returns the bias tensor if present.
    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref().map(Var::as_tensor)
    }

    /// Trainable parameters as `(scope.weight, scope.bias)`.
    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        let mut params = vec![(scoped(scope, "weight"), self.weight.clone())];
        if let Some(bias) = &self.bias {
            params.push((scoped(scope, "bias"), bias.clone()));
        }
        params
    }

    /// Projects the trailing dimension from `input_dim` to `output_dim`.
    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_last_dim("linear.input", hidden, self.config.input_dim)?;
        let dims = hidden.dims();
        let rows = hidden.elem_count() / self.config.input_dim;

        let input = policy
            .cast_for_matmul(hidden)?
            .reshape((rows, self.config.input_dim))?;
        let weight = policy.cast_for_matmul(self.weight.as_tensor())?;
        let mut output = input.matmul(&weight.t()?)?;

        if let Some(bias) = &self.bias {
            let bias = policy.cast_for_matmul(bias.as_tensor())?;
            output = output.broadcast_add(&bias)?;
        }

        let mut out_dims = dims[..dims.len() - 1].to_vec();
        out_dims.push(self.config.output_dim);
        policy.cast_to_storage(&output.reshape(out_dims)?)
    }

    fn validate_weight(config: &LinearConfig, weight: &Tensor) -> Result<()> {
        checks::expect_rank("linear.weight", weight, 2)?;
        checks::expect_shape("linear.weight", weight, &[config.output_dim, config.input_dim])?;
        checks::expect_dtype_in(
            "linear.weight",
            weight,
            &[DType::F16, DType::BF16, DType::F32],
        )
    }
}
