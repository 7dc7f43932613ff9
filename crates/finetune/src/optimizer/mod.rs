use std::collections::HashMap;

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::{config::OptimizerKind, TrainingError};

const EPS: f64 = 1e-12;

#[derive(Debug, Clone, Copy)]
pub enum OptimizerConfig {
    AdamW(AdamConfig),
    Adam(AdamConfig),
    Sgd(SgdConfig),
    RmsProp(RmsPropConfig),
}

#[derive(Debug, Clone, Copy)]
pub struct AdamConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct SgdConfig {
    pub learning_rate: f64,
    pub momentum: f64,
    pub weight_decay: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct RmsPropConfig {
    pub learning_rate: f64,
    pub alpha: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

impl OptimizerConfig {
    /// Optimizer selected by name with PyTorch's default hyperparameters.
    pub fn from_kind(kind: OptimizerKind, learning_rate: f64) -> Self {
        match kind {
            OptimizerKind::AdamW => OptimizerConfig::AdamW(AdamConfig {
                learning_rate,
                beta1: 0.9,
                beta2: 0.999,
                epsilon: 1e-8,
                weight_decay: 0.01,
            }),
            OptimizerKind::Adam => OptimizerConfig::Adam(AdamConfig {
                learning_rate,
                beta1: 0.9,
                beta2: 0.999,
                epsilon: 1e-8,
                weight_decay: 0.0,
            }),
            OptimizerKind::Sgd => OptimizerConfig::Sgd(SgdConfig {
                learning_rate,
                momentum: 0.0,
                weight_decay: 0.0,
            }),
            OptimizerKind::RmsProp => OptimizerConfig::RmsProp(RmsPropConfig {
                learning_rate,
                alpha: 0.99,
                epsilon: 1e-8,
                weight_decay: 0.0,
            }),
        }
    }

    fn learning_rate(&self) -> f64 {
        match self {
            OptimizerConfig::AdamW(cfg) | OptimizerConfig::Adam(cfg) => cfg.learning_rate,
            OptimizerConfig::Sgd(cfg) => cfg.learning_rate,
            OptimizerConfig::RmsProp(cfg) => cfg.learning_rate,
        }
    }

    fn set_learning_rate(&mut self, lr: f64) {
        match self {
            OptimizerConfig::AdamW(cfg) | OptimizerConfig::Adam(cfg) => cfg.learning_rate = lr,
            OptimizerConfig::Sgd(cfg) => cfg.learning_rate = lr,
            OptimizerConfig::RmsProp(cfg) => cfg.learning_rate = lr,
        }
    }
}

/// First-order optimizer over named parameters, with fp32 master copies for
/// low-precision parameters.
#[derive(Debug)]
pub struct TrainerOptimizer {
    config: OptimizerConfig,
    params: Vec<ParameterSlot>,
    step: usize,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    dtype: DType,
    master: Option<Var>,
    /// Adam first moment or SGD momentum buffer.
    first_moment: Tensor,
    /// Adam second moment or RMSprop square average.
    second_moment: Tensor,
}

impl TrainerOptimizer {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        config: OptimizerConfig,
    ) -> Result<Self, TrainingError> {
        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if !tensor.dtype().is_float() {
                return Err(TrainingError::initialization(format!(
                    "optimizer received non-floating parameter '{}'",
                    name
                )));
            }
            let device = tensor.device();
            let shape = tensor.dims().to_vec();
            let dtype = tensor.dtype();

            let first_moment = Tensor::zeros(shape.as_slice(), DType::F32, device)?;
            let second_moment = Tensor::zeros(shape.as_slice(), DType::F32, device)?;

            let master = if dtype != DType::F32 {
                let fp32 = tensor.to_dtype(DType::F32)?;
                Some(Var::from_tensor(&fp32)?)
            } else {
                None
            };

            params.push(ParameterSlot {
                name,
                param: var,
                dtype,
                master,
                first_moment,
                second_moment,
            });
        }

        Ok(Self {
            config,
            params,
            step: 0,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate()
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.set_learning_rate(lr);
    }

    /// Applies one update to every parameter with a gradient in `grads`,
    /// consuming those gradients.
    pub fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainingError> {
        let mut pending = Vec::new();
        for (index, slot) in self.params.iter().enumerate() {
            if let Some(grad) = grads.remove(slot.param.as_tensor()) {
                pending.push((index, grad.to_dtype(DType::F32)?));
            }
        }
        if pending.is_empty() {
            return Ok(());
        }

        self.step += 1;
        let config = self.config;
        let step = self.step;
        for (index, grad) in pending {
            let slot = &mut self.params[index];
            let base = slot.fp32_value()?;
            let next = match config {
                OptimizerConfig::AdamW(cfg) => slot.adam_update(&cfg, step, grad, &base, true)?,
                OptimizerConfig::Adam(cfg) => slot.adam_update(&cfg, step, grad, &base, false)?,
                OptimizerConfig::Sgd(cfg) => slot.sgd_update(&cfg, grad, &base)?,
                OptimizerConfig::RmsProp(cfg) => slot.rmsprop_update(&cfg, grad, &base)?,
            };
            slot.write_back(next)?;
        }
        Ok(())
    }

    pub fn state(&self) -> Result<OptimizerState, TrainingError> {
        let mut parameters = Vec::with_capacity(self.params.len());
        for slot in &self.params {
            let shape = slot.param.as_tensor().dims().to_vec();
            let numel = numel(&shape);
            let first = flatten_to_vec(&slot.first_moment, numel)?;
            let second = flatten_to_vec(&slot.second_moment, numel)?;
            let master = if let Some(master) = &slot.master {
                Some(flatten_to_vec(master.as_tensor(), numel)?)
            } else {
                None
            };
            parameters.push(ParameterState {
                name: slot.name.clone(),
                shape,
                first_moment: first,
                second_moment: second,
                master,
            });
        }

        Ok(OptimizerState {
            step: self.step,
            parameters,
        })
    }

    pub fn load_state(&mut self, state: OptimizerState) -> Result<(), TrainingError> {
        self.step = state.step;
        let mut by_name: HashMap<_, _> = state
            .parameters
            .into_iter()
            .map(|param| (param.name.clone(), param))
            .collect();

        for slot in &mut self.params {
            let state = by_name.remove(&slot.name).ok_or_else(|| {
                TrainingError::runtime(format!("optimizer state missing parameter '{}'", slot.name))
            })?;

            let dims = slot.param.as_tensor().dims().to_vec();
            let expected = numel(&dims);
            if dims != state.shape {
                return Err(TrainingError::runtime(format!(
                    "optimizer state shape mismatch for '{}'",
                    slot.name
                )));
            }
            if expected != state.first_moment.len()
                || expected != state.second_moment.len()
                || state.master.as_ref().map_or(false, |m| m.len() != expected)
            {
                return Err(TrainingError::runtime(format!(
                    "optimizer state size mismatch for '{}'",
                    slot.name
                )));
            }

            let device = slot.param.as_tensor().device().clone();
            slot.first_moment =
                Tensor::from_vec(state.first_moment, expected, &device)?.reshape(dims.as_slice())?;
            slot.second_moment =
                Tensor::from_vec(state.second_moment, expected, &device)?.reshape(dims.as_slice())?;

            match (&slot.master, state.master) {
                (Some(_), Some(values)) => {
                    let tensor =
                        Tensor::from_vec(values, expected, &device)?.reshape(dims.as_slice())?;
                    slot.write_back(tensor)?;
                }
                (None, None) => {}
                (Some(_), None) => {
                    return Err(TrainingError::runtime(format!(
                        "optimizer state missing master weights for '{}'",
                        slot.name
                    )))
                }
                (None, Some(_)) => {
                    return Err(TrainingError::runtime(format!(
                        "optimizer state contains master weights for '{}' but the parameter is fp32",
                        slot.name
                    )))
                }
            }
        }

        if !by_name.is_empty() {
            return Err(TrainingError::runtime(
                "optimizer state has extra parameters not present in the model",
            ));
        }

        Ok(())
    }
}

impl ParameterSlot {
    fn fp32_value(&self) -> Result<Tensor, TrainingError> {
        Ok(match &self.master {
            Some(master) => master.as_tensor().clone(),
            None => self.param.as_tensor().to_dtype(DType::F32)?,
        })
    }

    fn adam_update(
        &mut self,
        cfg: &AdamConfig,
        step: usize,
        grad: Tensor,
        base: &Tensor,
        decoupled: bool,
    ) -> Result<Tensor, TrainingError> {
        let grad = if !decoupled && cfg.weight_decay != 0.0 {
            (grad + base.affine(cfg.weight_decay, 0.0)?)?
        } else {
            grad
        };

        let bias_correction1 = 1.0 - cfg.beta1.powi(step as i32);
        let bias_correction2 = 1.0 - cfg.beta2.powi(step as i32);
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

        let new_m = (self.first_moment.affine(cfg.beta1, 0.0)?
            + grad.affine(1.0 - cfg.beta1, 0.0)?)?;
        let new_v = (self.second_moment.affine(cfg.beta2, 0.0)?
            + grad.sqr()?.affine(1.0 - cfg.beta2, 0.0)?)?;

        let m_hat = new_m.affine(scale_m, 0.0)?;
        let denom = new_v.affine(scale_v, 0.0)?.sqrt()?.affine(1.0, cfg.epsilon)?;
        let update = m_hat.div(&denom)?.affine(cfg.learning_rate, 0.0)?;

        let decayed = if decoupled && cfg.weight_decay != 0.0 {
            base.affine(1.0 - cfg.learning_rate * cfg.weight_decay, 0.0)?
        } else {
            base.clone()
        };

        self.first_moment = new_m;
        self.second_moment = new_v;
        Ok(decayed.sub(&update)?)
    }

    fn sgd_update(
        &mut self,
        cfg: &SgdConfig,
        grad: Tensor,
        base: &Tensor,
    ) -> Result<Tensor, TrainingError> {
        let grad = if cfg.weight_decay != 0.0 {
            (grad + base.affine(cfg.weight_decay, 0.0)?)?
        } else {
            grad
        };
        let direction = if cfg.momentum != 0.0 {
            let buffer = (self.first_moment.affine(cfg.momentum, 0.0)? + grad)?;
            self.first_moment = buffer.clone();
            buffer
        } else {
            grad
        };
        Ok(base.sub(&direction.affine(cfg.learning_rate, 0.0)?)?)
    }

    fn rmsprop_update(
        &mut self,
        cfg: &RmsPropConfig,
        grad: Tensor,
        base: &Tensor,
    ) -> Result<Tensor, TrainingError> {
        let grad = if cfg.weight_decay != 0.0 {
            (grad + base.affine(cfg.weight_decay, 0.0)?)?
        } else {
            grad
        };
        let square_avg = (self.second_moment.affine(cfg.alpha, 0.0)?
            + grad.sqr()?.affine(1.0 - cfg.alpha, 0.0)?)?;
        let denom = square_avg.sqrt()?.affine(1.0, cfg.epsilon)?;
        let update = grad.div(&denom)?.affine(cfg.learning_rate, 0.0)?;
        self.second_moment = square_avg;
        Ok(base.sub(&update)?)
    }

    fn write_back(&mut self, next: Tensor) -> Result<(), TrainingError> {
        if let Some(master) = self.master.as_ref() {
            master.set(&next)?;
        }
        let cast = if self.dtype == DType::F32 {
            next
        } else {
            next.to_dtype(self.dtype)?
        };
        self.param.set(&cast)?;
        Ok(())
    }
}

fn flatten_to_vec(tensor: &Tensor, expected: usize) -> Result<Vec<f32>, TrainingError> {
    let flat = tensor
        .to_dtype(DType::F32)?
        .flatten_all()?
        .to_vec1::<f32>()?;
    if flat.len() != expected {
        return Err(TrainingError::runtime(
            "unexpected element count during serialization",
        ));
    }
    Ok(flat)
}

fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub step: usize,
    pub parameters: Vec<ParameterState>,
}

impl OptimizerState {
    /// Reassembles per-worker partial states into one state ordered by `order`.
    ///
    /// Every name in `order` must appear in exactly one part.
    pub fn merge(parts: Vec<OptimizerState>, order: &[String]) -> Result<Self, TrainingError> {
        let step = parts.iter().map(|part| part.step).max().unwrap_or(0);
        let mut by_name = HashMap::new();
        for part in parts {
            for param in part.parameters {
                let name = param.name.clone();
                if by_name.insert(name.clone(), param).is_some() {
                    return Err(TrainingError::runtime(format!(
                        "optimizer state for '{}' is owned by more than one worker",
                        name
                    )));
                }
            }
        }
        let mut parameters = Vec::with_capacity(order.len());
        for name in order {
            let param = by_name.remove(name).ok_or_else(|| {
                TrainingError::runtime(format!("no worker holds optimizer state for '{}'", name))
            })?;
            parameters.push(param);
        }
        if !by_name.is_empty() {
            return Err(TrainingError::runtime(
                "gathered optimizer state has parameters outside the shard plan",
            ));
        }
        Ok(Self { step, parameters })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterState {
    pub name: String,
    pub shape: Vec<usize>,
    pub first_moment: Vec<f32>,
    pub second_moment: Vec<f32>,
    pub master: Option<Vec<f32>>,
}
