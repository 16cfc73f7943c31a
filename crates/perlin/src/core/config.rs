//! Configuration for a Perlin attention module.
//!
//! [`PerlinConfig`] is built once per model and read-only afterwards. Every
//! field has a default so partial TOML/JSON documents deserialize cleanly.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use super::errors::{PerlinError, PerlinResult};

/// How the score predictor decodes the encoded low-rank context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictorMethod {
    /// Per-query MLP head followed by a 2-D convolution stack at full predictor length.
    Mlp,
    /// Softmax-weighted mixture over a learned codebook of patches.
    Comp,
}

impl FromStr for PredictorMethod {
    type Err = PerlinError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "mlp" => Ok(Self::Mlp),
            "comp" => Ok(Self::Comp),
            other => Err(PerlinError::InvalidConfig(vec![format!(
                "attention_predictor_method must be \"mlp\" or \"comp\", got {:?}",
                other
            )])),
        }
    }
}

impl fmt::Display for PredictorMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mlp => f.write_str("mlp"),
            Self::Comp => f.write_str("comp"),
        }
    }
}

/// Axis collapsed by flattened top-k selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlattenDim {
    /// Select per `(batch, head)` over `query x key`.
    Head,
    /// Select per batch over `head x query x key`.
    Batch,
}

impl FromStr for FlattenDim {
    type Err = PerlinError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "head" => Ok(Self::Head),
            "batch" => Ok(Self::Batch),
            other => Err(PerlinError::InvalidConfig(vec![format!(
                "k_flatten_dim must be \"head\" or \"batch\", got {:?}",
                other
            )])),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerlinConfig {
    /// Sparse budget per query row, expressed at true sequence resolution.
    #[serde(default = "default_k")]
    pub k: usize,
    /// Key resolution of the direct predictor.
    #[serde(default = "default_predictor_length")]
    pub attention_predictor_length: usize,
    #[serde(default = "default_predictor_method")]
    pub attention_predictor_method: PredictorMethod,
    #[serde(default = "default_comp_patch_count")]
    pub attention_predictor_comp_patch_count: usize,
    #[serde(default = "default_comp_patch_size")]
    pub attention_predictor_comp_patch_size: usize,
    #[serde(default = "default_comp_book_size")]
    pub attention_predictor_comp_book_size: usize,
    #[serde(default)]
    pub k_flatten: bool,
    #[serde(default = "default_flatten_dim")]
    pub k_flatten_dim: FlattenDim,
    #[serde(default)]
    pub random_lookup: bool,
    #[serde(default = "default_random_lookup_count")]
    pub random_lookup_count: usize,
    #[serde(default = "default_true")]
    pub partial_attention_scaler: bool,
    #[serde(default)]
    pub out_add_performer_context: bool,
    #[serde(default)]
    pub out_norm: bool,
    /// Divides `d * ln(d)` to obtain the estimator's random feature count.
    #[serde(default = "default_nb_factor")]
    pub performer_nb_factor: f64,
    /// Side length of the identity probe before it is resized to `(T, head_dim)`.
    #[serde(default = "default_v_eye_length")]
    pub v_eye_length: usize,
    /// Number of redraw calls between projection resamples.
    #[serde(default = "default_redraw_interval")]
    pub redraw_interval: usize,
    #[serde(default = "default_predictor_dropout")]
    pub predictor_dropout: f32,
    /// Fail fast on NaN/inf in named intermediates.
    #[serde(default)]
    pub check_finite: bool,
}

fn default_k() -> usize {
    64
}

fn default_predictor_length() -> usize {
    128
}

fn default_predictor_method() -> PredictorMethod {
    PredictorMethod::Mlp
}

fn default_comp_patch_count() -> usize {
    16
}

fn default_comp_patch_size() -> usize {
    16
}

fn default_comp_book_size() -> usize {
    8
}

fn default_flatten_dim() -> FlattenDim {
    FlattenDim::Batch
}

fn default_random_lookup_count() -> usize {
    3
}

fn default_true() -> bool {
    true
}

fn default_nb_factor() -> f64 {
    1.0
}

fn default_v_eye_length() -> usize {
    128
}

fn default_redraw_interval() -> usize {
    1000
}

fn default_predictor_dropout() -> f32 {
    0.1
}

impl Default for PerlinConfig {
    fn default() -> Self {
        Self {
            k: default_k(),
            attention_predictor_length: default_predictor_length(),
            attention_predictor_method: default_predictor_method(),
            attention_predictor_comp_patch_count: default_comp_patch_count(),
            attention_predictor_comp_patch_size: default_comp_patch_size(),
            attention_predictor_comp_book_size: default_comp_book_size(),
            k_flatten: false,
            k_flatten_dim: default_flatten_dim(),
            random_lookup: false,
            random_lookup_count: default_random_lookup_count(),
            partial_attention_scaler: true,
            out_add_performer_context: false,
            out_norm: false,
            performer_nb_factor: default_nb_factor(),
            v_eye_length: default_v_eye_length(),
            redraw_interval: default_redraw_interval(),
            predictor_dropout: default_predictor_dropout(),
            check_finite: false,
        }
    }
}

impl PerlinConfig {
    /// Key-axis resolution of the predicted score grid.
    pub fn predictor_resolution(&self) -> usize {
        match self.attention_predictor_method {
            PredictorMethod::Mlp => self.attention_predictor_length,
            PredictorMethod::Comp => {
                self.attention_predictor_comp_patch_count * self.attention_predictor_comp_patch_size
            }
        }
    }

    pub fn validate(&self) -> PerlinResult<()> {
        let mut errors = Vec::new();

        if self.k == 0 {
            errors.push("k must be greater than 0".to_string());
        }

        match self.attention_predictor_method {
            PredictorMethod::Mlp => {
                if self.attention_predictor_length == 0 {
                    errors.push("attention_predictor_length must be greater than 0".to_string());
                }
            }
            PredictorMethod::Comp => {
                if self.attention_predictor_comp_patch_count == 0 {
                    errors.push(
                        "attention_predictor_comp_patch_count must be greater than 0".to_string(),
                    );
                }
                if self.attention_predictor_comp_patch_size == 0 {
                    errors.push(
                        "attention_predictor_comp_patch_size must be greater than 0".to_string(),
                    );
                }
                if self.attention_predictor_comp_book_size == 0 {
                    errors.push(
                        "attention_predictor_comp_book_size must be greater than 0".to_string(),
                    );
                }
            }
        }

        if self.random_lookup && self.random_lookup_count == 0 {
            errors.push("random_lookup_count must be greater than 0 when random_lookup is enabled".to_string());
        }

        if !(self.performer_nb_factor.is_finite() && self.performer_nb_factor > 0.0) {
            errors.push("performer_nb_factor must be a positive finite number".to_string());
        }

        if self.v_eye_length == 0 {
            errors.push("v_eye_length must be greater than 0".to_string());
        }

        if self.redraw_interval == 0 {
            errors.push("redraw_interval must be greater than 0".to_string());
        }

        if !(0.0..1.0).contains(&self.predictor_dropout) {
            errors.push("predictor_dropout must be in [0, 1)".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(PerlinError::InvalidConfig(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PerlinConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.predictor_resolution(), 128);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: PerlinConfig = toml::from_str(
            r#"
            k = 32
            attention_predictor_method = "comp"
            k_flatten = true
            k_flatten_dim = "head"
            "#,
        )
        .unwrap();
        assert_eq!(config.k, 32);
        assert_eq!(config.attention_predictor_method, PredictorMethod::Comp);
        assert_eq!(config.k_flatten_dim, FlattenDim::Head);
        assert_eq!(config.predictor_resolution(), 256);
        assert_eq!(config.v_eye_length, 128);
    }

    #[test]
    fn unknown_predictor_method_is_rejected() {
        let parsed: Result<PerlinConfig, _> =
            serde_json::from_str(r#"{"attention_predictor_method": "lstm"}"#);
        assert!(parsed.is_err());
        assert!(matches!(
            "lstm".parse::<PredictorMethod>(),
            Err(PerlinError::InvalidConfig(_))
        ));
    }

    #[test]
    fn validation_collects_every_problem() {
        let config = PerlinConfig {
            k: 0,
            performer_nb_factor: 0.0,
            predictor_dropout: 1.0,
            ..PerlinConfig::default()
        };
        match config.validate() {
            Err(PerlinError::InvalidConfig(errors)) => assert_eq!(errors.len(), 3),
            other => panic!("expected InvalidConfig, got {:?}", other),
        }
    }
}
