//! Trainable building blocks shared by the Perlin attention crates.
//!
//! Every layer keeps its weights in [`candle_core::Var`]s so gradients can be
//! collected through `Tensor::backward` and exposes them via
//! `named_parameters(scope)` for optimizers and checkpointing.

pub mod activations;
pub mod checks;
pub mod conv;
pub mod dropout;
pub mod dtypes;
pub mod linear;
pub mod norm;

pub use activations::{builtin, Activation, ActivationKind};
pub use conv::{Conv2d, Conv2dConfig, ConvStack};
pub use dropout::Dropout;
pub use dtypes::{tolerance_for, PrecisionPolicy};
pub use linear::{Linear, LinearConfig, LinearInit};
pub use norm::{LayerNorm, NormConfig};

/// Joins a parameter scope and a local name with a dot separator.
pub fn scoped(scope: &str, name: &str) -> String {
    if scope.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", scope, name)
    }
}
