//! Optional finite-value guard over named pipeline intermediates.

use candle_core::{DType, Tensor};

use crate::core::{PerlinError, PerlinResult};

/// Environment switch that forces finite checks on regardless of configuration.
pub const CHECK_FINITE_ENV: &str = "PERLIN_CHECK_FINITE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FiniteGuard {
    enabled: bool,
}

impl FiniteGuard {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Enabled when `configured` is set or the environment switch reads `1`/`true`.
    pub fn from_env(configured: bool) -> Self {
        let forced = std::env::var(CHECK_FINITE_ENV)
            .map(|value| matches!(value.trim(), "1" | "true" | "TRUE"))
            .unwrap_or(false);
        Self::new(configured || forced)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Fails with [`PerlinError::NonFinite`] when `tensor` holds NaN or infinity.
    pub fn check(&self, stage: &str, tensor: &Tensor) -> PerlinResult<()> {
        if !self.enabled {
            return Ok(());
        }
        let total = tensor
            .to_dtype(DType::F32)?
            .flatten_all()?
            .sum_all()?
            .to_scalar::<f32>()?;
        // Opposite infinities can cancel to NaN and a finite sum may still hide a NaN.
        let peak = tensor
            .to_dtype(DType::F32)?
            .flatten_all()?
            .abs()?
            .max(0)?
            .to_scalar::<f32>()?;
        if total.is_finite() && peak.is_finite() {
            Ok(())
        } else {
            log::debug!("perlin::diagnostics non-finite stage={stage}");
            Err(PerlinError::NonFinite {
                stage: stage.to_string(),
            })
        }
    }
}
