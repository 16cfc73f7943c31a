//! AdamW with fp32 master weights, pattern-based weight-decay exclusion and a
//! boosted learning rate for the score predictor.

use std::collections::HashMap;

pub mod scaler;

pub use scaler::{GradientScaler, GradientScalerState, LossScaleConfig};

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::{
    config::{self, to_runtime_error},
    DistillError,
};

const EPS: f64 = 1e-12;

#[derive(Debug, Clone, Copy)]
pub struct AdamWConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

impl From<&config::OptimizerConfig> for AdamWConfig {
    fn from(value: &config::OptimizerConfig) -> Self {
        Self {
            learning_rate: value.learning_rate as f64,
            beta1: value.beta1 as f64,
            beta2: value.beta2 as f64,
            epsilon: value.epsilon as f64,
            weight_decay: value.weight_decay as f64,
        }
    }
}

/// Parameter grouping and clipping options derived from the optimizer section.
#[derive(Debug, Clone)]
pub struct DistillOptimizerOptions {
    pub use_master_weights: bool,
    pub clip_global_norm: Option<f64>,
    pub weight_decay_exclude: Vec<String>,
    pub high_lr_names: Vec<String>,
    pub high_lr_multiplier: f64,
}

impl Default for DistillOptimizerOptions {
    fn default() -> Self {
        Self {
            use_master_weights: true,
            clip_global_norm: None,
            weight_decay_exclude: vec![],
            high_lr_names: vec![],
            high_lr_multiplier: 1.0,
        }
    }
}

impl From<&config::OptimizerConfig> for DistillOptimizerOptions {
    fn from(value: &config::OptimizerConfig) -> Self {
        Self {
            use_master_weights: true,
            clip_global_norm: value.max_grad_norm.map(f64::from),
            weight_decay_exclude: value.no_decay.clone(),
            high_lr_names: value.high_lr_names.clone(),
            high_lr_multiplier: value.high_lr_multiplier as f64,
        }
    }
}

#[derive(Debug)]
pub struct DistillOptimizer {
    config: AdamWConfig,
    params: Vec<ParameterSlot>,
    step: usize,
    clip_global_norm: Option<f64>,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    dtype: DType,
    master: Option<Var>,
    first_moment: Tensor,
    second_moment: Tensor,
    apply_weight_decay: bool,
    lr_multiplier: f64,
}

impl DistillOptimizer {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        config: AdamWConfig,
        options: DistillOptimizerOptions,
    ) -> Result<Self, DistillError> {
        if named_parameters.is_empty() {
            return Err(DistillError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if !tensor.dtype().is_float() {
                return Err(DistillError::initialization(format!(
                    "optimizer received non-floating parameter '{}'",
                    name
                )));
            }
            let device = tensor.device();
            let shape = tensor.dims().to_vec();
            let dtype = tensor.dtype();

            let first_moment =
                Tensor::zeros(shape.as_slice(), DType::F32, device).map_err(to_runtime_error)?;
            let second_moment =
                Tensor::zeros(shape.as_slice(), DType::F32, device).map_err(to_runtime_error)?;

            let master = if options.use_master_weights && dtype != DType::F32 {
                let fp32 = tensor.to_dtype(DType::F32).map_err(to_runtime_error)?;
                Some(Var::from_tensor(&fp32).map_err(to_runtime_error)?)
            } else {
                None
            };

            let apply_weight_decay = !matches_any(&name, &options.weight_decay_exclude);
            let lr_multiplier = if matches_any(&name, &options.high_lr_names) {
                options.high_lr_multiplier
            } else {
                1.0
            };

            params.push(ParameterSlot {
                name,
                param: var,
                dtype,
                master,
                first_moment,
                second_moment,
                apply_weight_decay,
                lr_multiplier,
            });
        }

        log::debug!(
            "optimizer tracks {} parameters, {} with boosted learning rate",
            params.len(),
            params.iter().filter(|slot| slot.lr_multiplier != 1.0).count()
        );

        Ok(Self {
            config,
            params,
            step: 0,
            clip_global_norm: options.clip_global_norm,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }

    pub fn steps(&self) -> usize {
        self.step
    }

    /// Effective learning rate applied to `name`, if it is tracked.
    pub fn learning_rate_for(&self, name: &str) -> Option<f64> {
        self.params
            .iter()
            .find(|slot| slot.name == name)
            .map(|slot| self.config.learning_rate * slot.lr_multiplier)
    }

    /// Gradients currently held for the tracked parameters.
    pub fn gradients(&self, grads: &GradStore) -> Vec<Tensor> {
        self.params
            .iter()
            .filter_map(|slot| grads.get(slot.param.as_tensor()).cloned())
            .collect()
    }

    /// Divides every tracked gradient by the loss scale in place.
    pub fn unscale_gradients(
        &self,
        grads: &mut GradStore,
        scaler: &GradientScaler,
    ) -> Result<(), DistillError> {
        if !scaler.is_enabled() {
            return Ok(());
        }
        for slot in &self.params {
            let tensor = slot.param.as_tensor();
            if let Some(grad) = grads.remove(tensor) {
                grads.insert(tensor, scaler.unscale(&grad)?);
            }
        }
        Ok(())
    }

    /// Applies one AdamW update and returns the global gradient norm before clipping.
    pub fn step(&mut self, grads: &mut GradStore) -> Result<f64, DistillError> {
        let mut processed = Vec::new();

        for (idx, slot) in self.params.iter().enumerate() {
            let grad = match grads.remove(slot.param.as_tensor()) {
                Some(grad) => grad,
                None => continue,
            };
            let grad = grad.to_dtype(DType::F32).map_err(to_runtime_error)?;
            let norm = tensor_l2_norm(&grad)?;
            processed.push(ProcessedGradient {
                index: idx,
                grad,
                norm,
            });
        }

        if processed.is_empty() {
            return Ok(0.0);
        }

        let total_norm = processed
            .iter()
            .map(|g| g.norm * g.norm)
            .sum::<f64>()
            .sqrt();
        if let Some(max_norm) = self.clip_global_norm {
            if total_norm > max_norm {
                let scale = max_norm / (total_norm + EPS);
                for item in &mut processed {
                    item.grad = item.grad.affine(scale, 0.0).map_err(to_runtime_error)?;
                }
            }
        }

        self.step += 1;
        self.step_adamw(processed)?;
        Ok(total_norm)
    }

    fn step_adamw(&mut self, processed: Vec<ProcessedGradient>) -> Result<(), DistillError> {
        let cfg = self.config;
        let bias_correction1 = 1.0 - cfg.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - cfg.beta2.powi(self.step as i32);
        let scale_m = if bias_correction1.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction1
        };
        let scale_v = if bias_correction2.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction2
        };

        for item in processed {
            let slot = &mut self.params[item.index];
            let learning_rate = cfg.learning_rate * slot.lr_multiplier;

            let new_m = slot
                .first_moment
                .affine(cfg.beta1, 0.0)
                .and_then(|m| m.add(&item.grad.affine(1.0 - cfg.beta1, 0.0)?))
                .map_err(to_runtime_error)?;
            let new_v = slot
                .second_moment
                .affine(cfg.beta2, 0.0)
                .and_then(|v| v.add(&item.grad.sqr()?.affine(1.0 - cfg.beta2, 0.0)?))
                .map_err(to_runtime_error)?;

            let denom = new_v
                .affine(scale_v, 0.0)
                .and_then(|v| v.sqrt())
                .and_then(|v| v.affine(1.0, cfg.epsilon))
                .map_err(to_runtime_error)?;
            let update = new_m
                .affine(scale_m, 0.0)
                .and_then(|m| m.div(&denom))
                .and_then(|u| u.affine(learning_rate, 0.0))
                .map_err(to_runtime_error)?;

            let base = match slot.master.as_ref() {
                Some(master) => master.as_tensor().clone(),
                None => slot
                    .param
                    .as_tensor()
                    .to_dtype(DType::F32)
                    .map_err(to_runtime_error)?,
            };
            let decayed = if slot.apply_weight_decay && cfg.weight_decay != 0.0 {
                base.affine(1.0 - learning_rate * cfg.weight_decay, 0.0)
                    .map_err(to_runtime_error)?
            } else {
                base
            };
            let next = decayed.sub(&update).map_err(to_runtime_error)?;

            if let Some(master) = slot.master.as_ref() {
                master.set(&next).map_err(to_runtime_error)?;
            }
            let cast = next.to_dtype(slot.dtype).map_err(to_runtime_error)?;
            slot.param.set(&cast).map_err(to_runtime_error)?;

            slot.first_moment = new_m;
            slot.second_moment = new_v;
        }

        Ok(())
    }

    pub fn zero_grad(&self, grads: &mut GradStore) {
        for slot in &self.params {
            let _ = grads.remove(slot.param.as_tensor());
        }
    }

    pub fn state(&self) -> Result<OptimizerState, DistillError> {
        let mut parameters = Vec::with_capacity(self.params.len());
        for slot in &self.params {
            let shape = slot.param.as_tensor().dims().to_vec();
            let numel = numel(&shape);
            let master = match &slot.master {
                Some(master) => Some(flatten_to_vec(master.as_tensor(), numel)?),
                None => None,
            };
            parameters.push(ParameterState {
                name: slot.name.clone(),
                shape,
                first_moment: flatten_to_vec(&slot.first_moment, numel)?,
                second_moment: flatten_to_vec(&slot.second_moment, numel)?,
                master,
            });
        }

        Ok(OptimizerState {
            step: self.step,
            learning_rate: self.config.learning_rate,
            parameters,
        })
    }

    pub fn load_state(&mut self, state: OptimizerState) -> Result<(), DistillError> {
        self.step = state.step;
        self.config.learning_rate = state.learning_rate;
        let mut by_name: HashMap<_, _> = state
            .parameters
            .into_iter()
            .map(|param| (param.name.clone(), param))
            .collect();

        for slot in &mut self.params {
            let state = by_name.remove(&slot.name).ok_or_else(|| {
                DistillError::runtime(format!("optimizer state missing parameter '{}'", slot.name))
            })?;

            let dims = slot.param.as_tensor().dims().to_vec();
            let expected = numel(&dims);
            if dims != state.shape {
                return Err(DistillError::runtime(format!(
                    "optimizer state shape mismatch for '{}'",
                    slot.name
                )));
            }
            if expected != state.first_moment.len()
                || expected != state.second_moment.len()
                || state.master.as_ref().is_some_and(|m| m.len() != expected)
            {
                return Err(DistillError::runtime(format!(
                    "optimizer state size mismatch for '{}'",
                    slot.name
                )));
            }

            let device = slot.param.as_tensor().device().clone();
            let restore = |values: Vec<f32>| {
                Tensor::from_vec(values, expected, &device)
                    .and_then(|t| t.reshape(dims.as_slice()))
                    .map_err(to_runtime_error)
            };
            slot.first_moment = restore(state.first_moment)?;
            slot.second_moment = restore(state.second_moment)?;

            match (&slot.master, state.master) {
                (Some(master), Some(values)) => {
                    let tensor = restore(values)?;
                    master.set(&tensor).map_err(to_runtime_error)?;
                    let cast = tensor.to_dtype(slot.dtype).map_err(to_runtime_error)?;
                    slot.param.set(&cast).map_err(to_runtime_error)?;
                }
                (None, None) => {}
                (Some(_), None) => {
                    return Err(DistillError::runtime(format!(
                        "optimizer state missing master weights for '{}'",
                        slot.name
                    )))
                }
                (None, Some(_)) => {
                    return Err(DistillError::runtime(format!(
                        "optimizer state contains master weights for '{}' but optimizer is not using them",
                        slot.name
                    )))
                }
            }
        }

        if !by_name.is_empty() {
            return Err(DistillError::runtime(
                "optimizer state has extra parameters not present in the model",
            ));
        }

        Ok(())
    }
}

struct ProcessedGradient {
    index: usize,
    grad: Tensor,
    norm: f64,
}

fn matches_any(name: &str, patterns: &[String]) -> bool {
    patterns
        .iter()
        .any(|pattern| !pattern.is_empty() && name.contains(pattern.as_str()))
}

fn tensor_l2_norm(tensor: &Tensor) -> Result<f64, DistillError> {
    let value = tensor
        .sqr()
        .and_then(|t| t.sum_all())
        .and_then(|t| t.to_vec0::<f32>())
        .map_err(to_runtime_error)?;
    Ok((value as f64).sqrt())
}

fn flatten_to_vec(tensor: &Tensor, expected: usize) -> Result<Vec<f32>, DistillError> {
    let flat = tensor
        .flatten_all()
        .and_then(|t| t.to_dtype(DType::F32))
        .and_then(|t| t.to_vec1::<f32>())
        .map_err(to_runtime_error)?;
    if flat.len() != expected {
        return Err(DistillError::runtime(
            "unexpected element count during serialization",
        ));
    }
    Ok(flat)
}

fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerState {
    pub step: usize,
    pub learning_rate: f64,
    pub parameters: Vec<ParameterState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterState {
    pub name: String,
    pub shape: Vec<usize>,
    pub first_moment: Vec<f32>,
    pub second_moment: Vec<f32>,
    pub master: Option<Vec<f32>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn var(values: &[f32]) -> Var {
        Var::from_tensor(&Tensor::from_slice(values, values.len(), &Device::Cpu).unwrap()).unwrap()
    }

    fn adamw() -> AdamWConfig {
        AdamWConfig {
            learning_rate: 0.1,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
        }
    }

    #[test]
    fn predictor_parameters_get_boosted_learning_rate() {
        let options = DistillOptimizerOptions {
            high_lr_names: vec!["predictor".into()],
            high_lr_multiplier: 10.0,
            ..DistillOptimizerOptions::default()
        };
        let optimizer = DistillOptimizer::new(
            vec![
                ("perlin.predictor.out.weight".into(), var(&[1.0])),
                ("perlin.composer.norm_partial.weight".into(), var(&[1.0])),
            ],
            adamw(),
            options,
        )
        .unwrap();

        let boosted = optimizer.learning_rate_for("perlin.predictor.out.weight").unwrap();
        let plain = optimizer
            .learning_rate_for("perlin.composer.norm_partial.weight")
            .unwrap();
        assert!((boosted - 1.0).abs() < 1e-12);
        assert!((plain - 0.1).abs() < 1e-12);
    }

    #[test]
    fn step_moves_against_gradient_and_reports_norm() {
        let param = var(&[1.0, -1.0]);
        let mut optimizer =
            DistillOptimizer::new(vec![("w".into(), param.clone())], adamw(), Default::default())
                .unwrap();

        let loss = param.as_tensor().sqr().unwrap().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();
        let norm = optimizer.step(&mut grads).unwrap();

        assert!((norm - 8f64.sqrt()).abs() < 1e-5);
        let updated = param.as_tensor().to_vec1::<f32>().unwrap();
        assert!(updated[0] < 1.0);
        assert!(updated[1] > -1.0);
        assert_eq!(optimizer.steps(), 1);
    }

    #[test]
    fn state_restores_moments_into_fresh_optimizer() {
        let param = var(&[0.5, 0.25]);
        let mut optimizer =
            DistillOptimizer::new(vec![("w".into(), param.clone())], adamw(), Default::default())
                .unwrap();
        let loss = param.as_tensor().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();
        optimizer.step(&mut grads).unwrap();
        let saved = optimizer.state().unwrap();

        let mut fresh =
            DistillOptimizer::new(vec![("w".into(), var(&[0.5, 0.25]))], adamw(), Default::default())
                .unwrap();
        fresh.load_state(saved.clone()).unwrap();
        let restored = fresh.state().unwrap();
        assert_eq!(restored.step, 1);
        assert_eq!(restored.parameters[0].first_moment, saved.parameters[0].first_moment);

        let mut mismatched =
            DistillOptimizer::new(vec![("v".into(), var(&[0.0, 0.0]))], adamw(), Default::default())
                .unwrap();
        assert!(mismatched.load_state(saved).is_err());
    }
}
