//! Full-resolution predictor: per-query MLP decode followed by 2-D refinement.

use candle_core::{DType, Device, Result, Tensor, Var};
use layers::{scoped, ActivationKind, ConvStack, Linear, LinearConfig, LinearInit, PrecisionPolicy};

use super::ScorePredictor;
use crate::core::PredictorMethod;

const REFINE_DEPTH: usize = 5;
const REFINE_KERNEL: usize = 3;

/// Decodes each query into `length` key scores, then lets a conv stack over
/// the `(query, key)` grid (heads as channels) share evidence between
/// neighbouring positions.
#[derive(Debug, Clone)]
pub struct DirectPredictor {
    row_decoder: Linear,
    refine: ConvStack,
    length: usize,
}

impl DirectPredictor {
    pub fn new(
        heads: usize,
        encoded_dim: usize,
        length: usize,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let row_decoder = Linear::with_init(
            LinearConfig::new(encoded_dim, length),
            &LinearInit::default(),
            device,
            dtype,
        )?;
        let refine = ConvStack::new(
            REFINE_DEPTH,
            heads,
            REFINE_KERNEL,
            ActivationKind::Gelu,
            device,
            dtype,
        )?;
        Ok(Self {
            row_decoder,
            refine,
            length,
        })
    }
}

impl ScorePredictor for DirectPredictor {
    fn method(&self) -> PredictorMethod {
        PredictorMethod::Mlp
    }

    fn resolution(&self) -> usize {
        self.length
    }

    fn predict(&self, encoded: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let rows = self.row_decoder.forward(encoded, policy)?;
        self.refine.forward(&rows, policy)
    }

    fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        let mut params = self.row_decoder.named_parameters(&scoped(scope, "row_decoder"));
        params.extend(self.refine.named_parameters(&scoped(scope, "refine")));
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_to_configured_length() -> Result<()> {
        let device = Device::Cpu;
        let predictor = DirectPredictor::new(3, 10, 24, &device, DType::F32)?;
        let encoded = Tensor::randn(0f32, 1.0, (2, 3, 7, 10), &device)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let scores = predictor.predict(&encoded, &policy)?;
        assert_eq!(scores.dims(), &[2, 3, 7, 24]);
        assert_eq!(predictor.resolution(), 24);
        // Row decoder weight + bias, five conv layers with weight + bias each.
        assert_eq!(predictor.named_parameters("dec").len(), 12);
        Ok(())
    }
}
