//! Dense attention used as the distillation target and as a numerical baseline.

pub mod exact;

pub use exact::{DenseAttention, ExactAttention};
