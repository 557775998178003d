/// Adam optimizer implementation
///
/// Adam with L2 weight decay folded into the gradient (amsgrad off). Moment
/// tensors are keyed by parameter name so they can be checkpointed and
/// restored against a freshly built model.
use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::TrainError;

/// Adam optimizer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdamConfig {
    /// Learning rate
    pub lr: f64,
    /// Coefficient for computing running averages of gradient (beta1)
    pub beta1: f64,
    /// Coefficient for computing running averages of squared gradient (beta2)
    pub beta2: f64,
    /// Term added to denominator for numerical stability
    pub eps: f64,
    /// L2 penalty added to the gradient
    pub weight_decay: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

/// Parameter state for Adam
#[derive(Debug, Clone)]
pub struct ParamState {
    /// First moment estimate (exponential moving average of gradients)
    pub exp_avg: Tensor,
    /// Second moment estimate (exponential moving average of squared gradients)
    pub exp_avg_sq: Tensor,
}

/// Scalar optimizer state; moment tensors travel separately
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdamState {
    pub step: usize,
    pub config: AdamConfig,
}

/// Adam optimizer
pub struct Adam {
    config: AdamConfig,
    params: Vec<(String, Var)>,
    states: BTreeMap<String, ParamState>,
    step: usize,
}

impl Adam {
    /// Create new Adam optimizer
    ///
    /// # Arguments
    /// * `params` - Named parameters to optimize
    /// * `config` - Optimizer configuration
    pub fn new(params: Vec<(String, Var)>, config: AdamConfig) -> crate::Result<Self> {
        if params.is_empty() {
            return Err(TrainError::Config(
                "optimizer requires at least one parameter".to_string(),
            ));
        }
        Ok(Self {
            config,
            params,
            states: BTreeMap::new(),
            step: 0,
        })
    }

    /// Perform a single optimization step
    ///
    /// Parameters without a gradient in `grads` are left untouched.
    pub fn step(&mut self, grads: &GradStore) -> crate::Result<()> {
        self.step += 1;
        let bias_correction1 = 1.0 - self.config.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - self.config.beta2.powi(self.step as i32);
        let step_size = self.config.lr / bias_correction1;

        for (name, var) in &self.params {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };
            let param = var.as_tensor().detach();

            let grad = if self.config.weight_decay != 0.0 {
                (grad + param.affine(self.config.weight_decay, 0.0)?)?
            } else {
                grad.clone()
            };

            let state = match self.states.remove(name) {
                Some(state) => state,
                None => ParamState {
                    exp_avg: param.zeros_like()?,
                    exp_avg_sq: param.zeros_like()?,
                },
            };

            // m = beta1 * m + (1 - beta1) * grad
            let exp_avg = (state.exp_avg.affine(self.config.beta1, 0.0)?
                + grad.affine(1.0 - self.config.beta1, 0.0)?)?;
            // v = beta2 * v + (1 - beta2) * grad^2
            let exp_avg_sq = (state.exp_avg_sq.affine(self.config.beta2, 0.0)?
                + grad.sqr()?.affine(1.0 - self.config.beta2, 0.0)?)?;

            // denom = sqrt(v) / sqrt(bc2) + eps
            let denom = exp_avg_sq
                .sqrt()?
                .affine(1.0 / bias_correction2.sqrt(), self.config.eps)?;
            let update = exp_avg.div(&denom)?.affine(step_size, 0.0)?;

            var.set(&(param - update)?)?;

            self.states.insert(
                name.clone(),
                ParamState {
                    exp_avg,
                    exp_avg_sq,
                },
            );
        }

        Ok(())
    }

    /// Get current learning rate
    pub fn learning_rate(&self) -> f64 {
        self.config.lr
    }

    /// Set learning rate
    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.lr = lr;
    }

    /// Number of steps taken so far
    pub fn step_count(&self) -> usize {
        self.step
    }

    pub fn param_state(&self, name: &str) -> Option<&ParamState> {
        self.states.get(name)
    }

    /// Scalar state plus moment tensors keyed by parameter name
    pub fn state(&self) -> (AdamState, &BTreeMap<String, ParamState>) {
        (
            AdamState {
                step: self.step,
                config: self.config.clone(),
            },
            &self.states,
        )
    }

    /// Restore from a checkpoint
    ///
    /// Moments may be missing for parameters that never received a gradient;
    /// unknown names or shape mismatches are rejected.
    pub fn load_state(
        &mut self,
        state: AdamState,
        mut moments: BTreeMap<String, ParamState>,
    ) -> crate::Result<()> {
        let mut states = BTreeMap::new();
        for (name, var) in &self.params {
            let Some(moment) = moments.remove(name) else {
                continue;
            };
            let dims = var.as_tensor().dims();
            if moment.exp_avg.dims() != dims || moment.exp_avg_sq.dims() != dims {
                return Err(TrainError::CorruptCheckpoint(format!(
                    "optimizer state shape mismatch for '{}'",
                    name
                )));
            }
            let device = var.as_tensor().device();
            let dtype = var.as_tensor().dtype();
            states.insert(
                name.clone(),
                ParamState {
                    exp_avg: moment.exp_avg.to_device(device)?.to_dtype(dtype)?,
                    exp_avg_sq: moment.exp_avg_sq.to_device(device)?.to_dtype(dtype)?,
                },
            );
        }
        if let Some(extra) = moments.keys().next() {
            return Err(TrainError::CorruptCheckpoint(format!(
                "optimizer state has unknown parameter '{}'",
                extra
            )));
        }

        self.step = state.step;
        self.config = state.config;
        self.states = states;
        Ok(())
    }
}
