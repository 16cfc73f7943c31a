//! Activation catalogue for the predictor and gating heads.
//!
//! Each implementation promotes inputs to the compute dtype requested by
//! [`PrecisionPolicy`] before evaluating the non-linearity, then casts the
//! result back to the storage dtype.
//!
//! # Built-in formulas
//!
//! * **GELU** uses the erf form `0.5 * x * (1 + erf(x / sqrt(2)))`.
//! * **Sigmoid** maps logits into `(0, 1)` and backs the learned gates.

use std::sync::Arc;

use candle_core::{Result, Tensor};

use crate::dtypes::PrecisionPolicy;

/// Identifies which non-linearity is implemented by an [`Activation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationKind {
    /// Identity function, useful for debugging or wiring custom stacks.
    Identity,
    /// Exact (erf based) GELU.
    Gelu,
    /// Logistic sigmoid.
    Sigmoid,
    /// ReLU.
    Relu,
}

/// Common interface shared by activation functions.
pub trait Activation: Send + Sync {
    /// Returns the [`ActivationKind`] for introspection when wiring composite blocks.
    fn kind(&self) -> ActivationKind;

    /// Applies the activation to `input` using the precision rules in `policy`.
    fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

struct BuiltinActivation {
    kind: ActivationKind,
}

impl Activation for BuiltinActivation {
    fn kind(&self) -> ActivationKind {
        self.kind
    }

    fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let compute = policy.cast_for_matmul(input)?;
        let activated = match self.kind {
            ActivationKind::Identity => compute,
            ActivationKind::Gelu => compute.gelu_erf()?,
            ActivationKind::Sigmoid => candle_nn::ops::sigmoid(&compute)?,
            ActivationKind::Relu => compute.relu()?,
        };
        policy.cast_to_storage(&activated)
    }
}

/// Returns a shared built-in activation implementation.
pub fn builtin(kind: ActivationKind) -> Arc<dyn Activation> {
    Arc::new(BuiltinActivation { kind })
}
