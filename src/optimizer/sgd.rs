//! SGD optimizer with momentum
//!
//! Implements stochastic gradient descent with optional momentum and weight decay.
//! Follows PyTorch's SGD semantics with Nesterov momentum support.

use std::collections::HashMap;

use ndarray::Zip;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::optimizer::traits::Optimizer;
use crate::tensor::Tensor;

/// SGD configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SgdConfig {
    pub lr: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    pub dampening: f64,
    pub nesterov: bool,
}

impl Default for SgdConfig {
    fn default() -> Self {
        Self {
            lr: 0.01,
            momentum: 0.0,
            weight_decay: 0.0,
            dampening: 0.0,
            nesterov: false,
        }
    }
}

/// SGD optimizer with optional momentum
///
/// When `momentum > 0`, maintains a velocity buffer per parameter.
///
/// Update rules (following PyTorch):
/// - L2 weight decay: `grad = grad + weight_decay * param`
/// - Momentum: `buf = momentum * buf + (1 - dampening) * grad` (first step: `buf = grad`)
/// - Nesterov: `update = grad + momentum * buf`
/// - Standard: `update = buf`
/// - Parameter: `param = param - lr * update`
#[derive(Debug, Clone)]
pub struct Sgd {
    config: SgdConfig,
    velocity: HashMap<String, Tensor>,
}

impl Sgd {
    pub fn new(config: SgdConfig) -> Result<Self> {
        if config.nesterov && (config.momentum <= 0.0 || config.dampening != 0.0) {
            return Err(Error::Configuration {
                reason: "nesterov momentum requires momentum > 0 and zero dampening".to_string(),
            });
        }
        Ok(Self {
            config,
            velocity: HashMap::new(),
        })
    }

    pub fn config(&self) -> &SgdConfig {
        &self.config
    }
}

impl Optimizer for Sgd {
    fn update_param(&mut self, name: &str, value: &mut Tensor, grad: &Tensor) -> Result<()> {
        if grad.shape() != value.shape() {
            return Err(Error::Shape {
                reason: format!(
                    "gradient for '{name}' has shape {:?}, parameter has {:?}",
                    grad.shape(),
                    value.shape()
                ),
            });
        }

        let lr = self.config.lr as f32;
        let momentum = self.config.momentum as f32;
        let wd = self.config.weight_decay as f32;
        let dampening = self.config.dampening as f32;
        let nesterov = self.config.nesterov;

        let mut d_p = grad.clone();
        if wd != 0.0 {
            Zip::from(&mut d_p).and(&*value).for_each(|g, &p| *g += wd * p);
        }

        if momentum > 0.0 {
            match self.velocity.get_mut(name) {
                Some(buf) => {
                    if buf.shape() != value.shape() {
                        return Err(Error::State {
                            reason: format!(
                                "velocity for '{name}' has shape {:?}, parameter has {:?}",
                                buf.shape(),
                                value.shape()
                            ),
                        });
                    }
                    Zip::from(&mut *buf)
                        .and(&d_p)
                        .for_each(|b, &g| *b = momentum * *b + (1.0 - dampening) * g);
                }
                None => {
                    self.velocity.insert(name.to_string(), d_p.clone());
                }
            }
            let buf = self.velocity.get(name).ok_or_else(|| Error::State {
                reason: format!("velocity for '{name}' missing after update"),
            })?;
            if nesterov {
                Zip::from(&mut d_p).and(buf).for_each(|g, &b| *g += momentum * b);
            } else {
                d_p.assign(buf);
            }
        }

        Zip::from(value).and(&d_p).for_each(|p, &u| *p -= lr * u);
        Ok(())
    }

    fn state_of(&self, name: &str) -> Vec<&Tensor> {
        self.velocity.get(name).into_iter().collect()
    }

    fn state_keys(&self) -> Vec<&str> {
        self.velocity.keys().map(String::as_str).collect()
    }

    fn set_lr(&mut self, lr: f64) {
        self.config.lr = lr;
    }

    fn lr(&self) -> f64 {
        self.config.lr
    }

    fn reset(&mut self) {
        self.velocity.clear();
    }
}
