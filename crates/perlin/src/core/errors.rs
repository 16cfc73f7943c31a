//! Error types emitted by the Perlin attention pipeline.

use candle_core::DType;
use thiserror::Error;

/// Failure categories surfaced by configuration, validation and forward passes.
#[derive(Debug, Error)]
pub enum PerlinError {
    /// One or more configuration values are out of range. All problems are reported together.
    #[error("invalid perlin configuration: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),
    /// The dtype has no mask sentinel (only f16, bf16 and f32 are supported).
    #[error("unsupported dtype {0:?}")]
    UnsupportedDType(DType),
    /// The supplied tensor shapes do not align with the documented contract.
    #[error("invalid tensor shape for {context}")]
    InvalidShape { context: String },
    /// A named intermediate contained NaN or infinity while finite checks were enabled.
    #[error("non-finite values detected in {stage}")]
    NonFinite { stage: String },
    /// A backend-specific failure propagated to the caller.
    #[error(transparent)]
    Backend(#[from] candle_core::Error),
}

impl PerlinError {
    pub(crate) fn shape(context: impl Into<String>) -> Self {
        Self::InvalidShape {
            context: context.into(),
        }
    }
}

/// Convenience alias for results produced by this crate.
pub type PerlinResult<T> = std::result::Result<T, PerlinError>;
