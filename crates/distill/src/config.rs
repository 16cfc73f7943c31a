use std::{
    fs,
    path::{Path, PathBuf},
};

use candle_core::DType;
use perlin::{PerlinConfig, PerlinError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DistillConfig {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub perlin: PerlinConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl DistillConfig {
    /// Reads TOML (default) or JSON by extension, resolves relative paths against
    /// the file's directory and validates the result.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, DistillError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: DistillConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(DistillError::ConfigFormat(format!(
                    "unsupported configuration extension '{other}'"
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.runtime.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, DistillError> {
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<(), DistillError> {
        let mut errors = Vec::new();

        if let Err(PerlinError::InvalidConfig(problems)) = self.perlin.validate() {
            errors.extend(problems.into_iter().map(|p| format!("perlin: {p}")));
        }

        if self.model.num_attention_heads == 0 {
            errors.push("model.num_attention_heads must be greater than 0".to_string());
        } else if self.model.hidden_size % self.model.num_attention_heads != 0 {
            errors.push(format!(
                "model.hidden_size {} must be divisible by model.num_attention_heads {}",
                self.model.hidden_size, self.model.num_attention_heads
            ));
        }
        if self.model.hidden_size == 0 {
            errors.push("model.hidden_size must be greater than 0".to_string());
        }
        if self.model.sequence_length == 0 {
            errors.push("model.sequence_length must be greater than 0".to_string());
        }

        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }
        if self.data.gradient_accumulation_steps == 0 {
            errors.push("data.gradient_accumulation_steps must be greater than 0".to_string());
        }
        if self.data.batches_per_epoch == 0 {
            errors.push("data.batches_per_epoch must be greater than 0".to_string());
        }
        if !(self.data.min_fill > 0.0 && self.data.min_fill <= 1.0) {
            errors.push("data.min_fill must be in (0, 1]".to_string());
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }
        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }
        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }
        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }
        if self.optimizer.high_lr_multiplier <= 0.0 {
            errors.push("optimizer.high_lr_multiplier must be greater than 0".to_string());
        }
        if let Some(norm) = self.optimizer.max_grad_norm {
            if norm <= 0.0 {
                errors.push("optimizer.max_grad_norm must be greater than 0".to_string());
            }
        }

        if self.runtime.epochs == 0 {
            errors.push("runtime.epochs must be greater than 0".to_string());
        }
        if let Some(0) = self.runtime.max_steps {
            errors.push("runtime.max_steps must be greater than 0".to_string());
        }
        if self.runtime.log_every_n_steps == 0 {
            errors.push("runtime.log_every_n_steps must be greater than 0".to_string());
        }
        if let Some(checkpoint) = &self.runtime.checkpoint {
            if checkpoint.directory.as_os_str().is_empty() {
                errors.push("runtime.checkpoint.directory must not be empty".to_string());
            }
            if checkpoint.every_n_steps == 0 {
                errors.push("runtime.checkpoint.every_n_steps must be greater than 0".to_string());
            }
            if let Some(0) = checkpoint.max_keep {
                errors.push("runtime.checkpoint.max_keep must be greater than 0".to_string());
            }
        }
        if let Some(0) = self.runtime.evaluation.every_n_steps {
            errors.push("runtime.evaluation.every_n_steps must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(DistillError::Validation(errors))
        }
    }

    pub fn head_dim(&self) -> usize {
        self.model.hidden_size / self.model.num_attention_heads.max(1)
    }
}

/// Shape of the synthetic host layer whose attention is replaced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "default_num_heads")]
    pub num_attention_heads: usize,
    #[serde(default = "default_sequence_length")]
    pub sequence_length: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            hidden_size: default_hidden_size(),
            num_attention_heads: default_num_heads(),
            sequence_length: default_sequence_length(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_gradient_accumulation_steps")]
    pub gradient_accumulation_steps: usize,
    /// Micro-batches drawn per epoch.
    #[serde(default = "default_batches_per_epoch")]
    pub batches_per_epoch: usize,
    #[serde(default = "default_validation_batches")]
    pub validation_batches: usize,
    /// Lower bound on the fraction of real tokens in each padded row.
    #[serde(default = "default_min_fill")]
    pub min_fill: f32,
    #[serde(default)]
    pub causal: bool,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            gradient_accumulation_steps: default_gradient_accumulation_steps(),
            batches_per_epoch: default_batches_per_epoch(),
            validation_batches: default_validation_batches(),
            min_fill: default_min_fill(),
            causal: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f32,
    #[serde(default = "default_beta1")]
    pub beta1: f32,
    #[serde(default = "default_beta2")]
    pub beta2: f32,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f32,
    /// Parameters whose names contain any of these patterns skip weight decay.
    #[serde(default = "default_no_decay")]
    pub no_decay: Vec<String>,
    /// Parameters whose names contain any of these patterns train at `high_lr_multiplier * lr`.
    #[serde(default = "default_high_lr_names")]
    pub high_lr_names: Vec<String>,
    #[serde(default = "default_high_lr_multiplier")]
    pub high_lr_multiplier: f32,
    #[serde(default)]
    pub max_grad_norm: Option<f32>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            weight_decay: default_weight_decay(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
            no_decay: default_no_decay(),
            high_lr_names: default_high_lr_names(),
            high_lr_multiplier: default_high_lr_multiplier(),
            max_grad_norm: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub precision: Precision,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default)]
    pub max_steps: Option<usize>,
    #[serde(default = "default_log_every_n_steps")]
    pub log_every_n_steps: usize,
    #[serde(default)]
    pub checkpoint: Option<CheckpointConfig>,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            precision: Precision::default(),
            epochs: default_epochs(),
            max_steps: None,
            log_every_n_steps: default_log_every_n_steps(),
            checkpoint: None,
            evaluation: EvaluationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl RuntimeConfig {
    fn apply_base_path(&mut self, base: &Path) {
        if let Some(checkpoint) = self.checkpoint.as_mut() {
            absolutize_in_place(&mut checkpoint.directory, base);
        }
        if let Some(dir) = self.logging.tensorboard.as_mut() {
            absolutize_in_place(dir, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub directory: PathBuf,
    #[serde(default = "default_checkpoint_every")]
    pub every_n_steps: usize,
    #[serde(default)]
    pub max_keep: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvaluationConfig {
    #[serde(default)]
    pub every_n_steps: Option<usize>,
    #[serde(default)]
    pub max_batches: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_true")]
    pub enable_stdout: bool,
    #[serde(default)]
    pub tensorboard: Option<PathBuf>,
    #[serde(default = "default_tensorboard_flush")]
    pub tensorboard_flush_every_n: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable_stdout: true,
            tensorboard: None,
            tensorboard_flush_every_n: default_tensorboard_flush(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    Fp32,
    Fp16,
    Bf16,
}

impl Precision {
    pub fn dtype(self) -> DType {
        match self {
            Precision::Fp32 => DType::F32,
            Precision::Fp16 => DType::F16,
            Precision::Bf16 => DType::BF16,
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_hidden_size() -> usize {
    64
}

fn default_num_heads() -> usize {
    4
}

fn default_sequence_length() -> usize {
    128
}

fn default_batch_size() -> usize {
    4
}

fn default_gradient_accumulation_steps() -> usize {
    1
}

fn default_batches_per_epoch() -> usize {
    64
}

fn default_validation_batches() -> usize {
    4
}

fn default_min_fill() -> f32 {
    0.5
}

fn default_learning_rate() -> f32 {
    1e-4
}

fn default_weight_decay() -> f32 {
    1e-2
}

fn default_beta1() -> f32 {
    0.9
}

fn default_beta2() -> f32 {
    0.999
}

fn default_adam_eps() -> f32 {
    1e-8
}

fn default_no_decay() -> Vec<String> {
    vec!["bias".to_string(), "norm".to_string()]
}

fn default_high_lr_names() -> Vec<String> {
    vec!["predictor".to_string()]
}

fn default_high_lr_multiplier() -> f32 {
    10.0
}

fn default_seed() -> u64 {
    42
}

fn default_epochs() -> usize {
    1
}

fn default_log_every_n_steps() -> usize {
    10
}

fn default_checkpoint_every() -> usize {
    100
}

fn default_true() -> bool {
    true
}

fn default_tensorboard_flush() -> usize {
    10
}

#[derive(Debug, Error)]
pub enum DistillError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ConfigFormat(String),
    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("distiller initialization failed: {0}")]
    Initialization(String),
    #[error("distillation failed: {0}")]
    Runtime(String),
    #[error(transparent)]
    Perlin(#[from] PerlinError),
}

impl DistillError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }
}

impl From<toml::de::Error> for DistillError {
    fn from(value: toml::de::Error) -> Self {
        DistillError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for DistillError {
    fn from(value: serde_json::Error) -> Self {
        DistillError::ConfigFormat(value.to_string())
    }
}

pub(crate) fn to_runtime_error(err: candle_core::Error) -> DistillError {
    DistillError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_uses_defaults() {
        let config: DistillConfig = toml::from_str("").unwrap();
        config.validate().unwrap();
        assert_eq!(config.head_dim(), 16);
        assert_eq!(config.optimizer.high_lr_multiplier, 10.0);
        assert_eq!(config.perlin.k, 64);
    }

    #[test]
    fn sections_override_defaults() {
        let config: DistillConfig = toml::from_str(
            r#"
            [model]
            hidden_size = 32
            num_attention_heads = 2
            sequence_length = 16

            [perlin]
            k = 4
            attention_predictor_method = "comp"

            [runtime]
            precision = "bf16"
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.head_dim(), 16);
        assert_eq!(config.perlin.k, 4);
        assert_eq!(config.runtime.precision.dtype(), DType::BF16);
    }

    #[test]
    fn validation_reports_nested_problems() {
        let mut config = DistillConfig::default();
        config.perlin.k = 0;
        config.model.hidden_size = 30;
        config.data.batch_size = 0;
        match config.validate() {
            Err(DistillError::Validation(errors)) => {
                assert!(errors.iter().any(|e| e.starts_with("perlin: k")));
                assert!(errors.iter().any(|e| e.contains("divisible")));
                assert!(errors.iter().any(|e| e.contains("batch_size")));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn relative_paths_follow_config_file() {
        let dir = std::env::temp_dir().join(format!("distill-config-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("run.toml");
        fs::write(
            &path,
            "[runtime.checkpoint]\ndirectory = \"ckpt\"\nevery_n_steps = 5\n",
        )
        .unwrap();
        let config = DistillConfig::load(&path).unwrap();
        let checkpoint = config.runtime.checkpoint.unwrap();
        assert_eq!(checkpoint.directory, dir.join("ckpt"));
        fs::remove_dir_all(&dir).unwrap();
    }
}
