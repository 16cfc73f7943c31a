//! Training driver that distills a dense attention teacher into
//! [`perlin::PerlinAttention`].
//!
//! The driver owns everything outside the attention core: configuration
//! loading, a synthetic batch source, the frozen teacher, AdamW with loss
//! scaling and gradient accumulation, the projection-redraw maintenance hook,
//! evaluation, metrics, logging sinks and checkpoints.

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod logging;
pub mod metrics;
pub mod optimizer;
pub mod teacher;
pub mod trainer;

pub use config::{DistillConfig, DistillError};
pub use data::{DistillBatch, SyntheticBatchSource};
pub use optimizer::{
    AdamWConfig, DistillOptimizer, DistillOptimizerOptions, GradientScaler, GradientScalerState,
    OptimizerState,
};
pub use teacher::{DenseTeacher, TeacherOutput};
pub use trainer::Trainer;
