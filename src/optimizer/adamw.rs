//! AdamW optimizer
//!
//! Implements decoupled weight decay regularization (Loshchilov & Hutter, 2019).
//! Bias correction uses a per-parameter update count, so a parameter whose
//! state is created late (or on a different worker) follows the same
//! schedule as it would on a single device.

use std::collections::HashMap;

use ndarray::Zip;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::optimizer::traits::Optimizer;
use crate::tensor::Tensor;

/// AdamW configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdamWConfig {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.01,
        }
    }
}

/// Per-parameter optimizer state
#[derive(Debug, Clone)]
struct ParamState {
    m: Tensor,
    v: Tensor,
    step: u64,
}

/// AdamW optimizer with decoupled weight decay
///
/// Maintains first moment (m) and second moment (v) estimates per parameter.
/// State is lazily initialized on the first update of each parameter.
#[derive(Debug, Clone)]
pub struct AdamW {
    config: AdamWConfig,
    state: HashMap<String, ParamState>,
}

impl AdamW {
    pub fn new(config: AdamWConfig) -> Self {
        Self {
            config,
            state: HashMap::new(),
        }
    }

    pub fn config(&self) -> &AdamWConfig {
        &self.config
    }

    /// Number of updates applied to `name` so far.
    pub fn param_step(&self, name: &str) -> Option<u64> {
        self.state.get(name).map(|s| s.step)
    }
}

impl Optimizer for AdamW {
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

        let state = self
            .state
            .entry(name.to_string())
            .or_insert_with(|| ParamState {
                m: Tensor::zeros(value.raw_dim()),
                v: Tensor::zeros(value.raw_dim()),
                step: 0,
            });
        if state.m.shape() != value.shape() {
            return Err(Error::State {
                reason: format!(
                    "state for '{name}' has shape {:?}, parameter has {:?}",
                    state.m.shape(),
                    value.shape()
                ),
            });
        }

        state.step += 1;
        let t = state.step as i32;

        let AdamWConfig {
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.config;

        // Bias correction factors
        let bc1 = 1.0 - beta1.powi(t);
        let bc2 = 1.0 - beta2.powi(t);

        // Corrected learning rate: lr * sqrt(1 - beta2^t) / (1 - beta1^t)
        let step_size = (lr * bc2.sqrt() / bc1) as f32;
        let eps_hat = (eps * bc2.sqrt()) as f32;
        let decay = (1.0 - lr * weight_decay) as f32;
        let (b1, b2) = (beta1 as f32, beta2 as f32);

        Zip::from(value)
            .and(grad)
            .and(&mut state.m)
            .and(&mut state.v)
            .for_each(|p, &g, m, v| {
                *p *= decay;
                *m = b1 * *m + (1.0 - b1) * g;
                *v = b2 * *v + (1.0 - b2) * g * g;
                *p -= step_size * *m / (v.sqrt() + eps_hat);
            });

        Ok(())
    }

    fn state_of(&self, name: &str) -> Vec<&Tensor> {
        self.state
            .get(name)
            .map(|s| vec![&s.m, &s.v])
            .unwrap_or_default()
    }

    fn state_keys(&self) -> Vec<&str> {
        self.state.keys().map(String::as_str).collect()
    }

    fn set_lr(&mut self, lr: f64) {
        self.config.lr = lr;
    }

    fn lr(&self) -> f64 {
        self.config.lr
    }

    fn reset(&mut self) {
        self.state.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::{Linear, Module, Parameter};
    use crate::tensor::from_vec;

    #[test]
    fn test_adamw_default_config() {
        let config = AdamWConfig::default();
        assert_eq!(config.lr, 1e-3);
        assert_eq!(config.beta1, 0.9);
        assert_eq!(config.beta2, 0.999);
        assert_eq!(config.eps, 1e-8);
        assert_eq!(config.weight_decay, 0.01);
    }

    #[test]
    fn test_adamw_first_step_matches_closed_form() {
        // On step 1, m_hat / sqrt(v_hat) = sign(g), so
        // p1 = p0 * (1 - lr*wd) - lr * g / (|g| + eps)
        let config = AdamWConfig {
            lr: 0.1,
            weight_decay: 0.5,
            ..Default::default()
        };
        let mut opt = AdamW::new(config);
        let mut value = from_vec(vec![1.0, -2.0], &[2]).unwrap();
        let grad = from_vec(vec![0.3, -4.0], &[2]).unwrap();
        opt.update_param("w", &mut value, &grad).unwrap();

        let expected = [1.0 * 0.95 - 0.1, -2.0 * 0.95 + 0.1];
        for (got, want) in value.iter().zip(expected) {
            assert!((got - want).abs() < 1e-5, "got {got}, want {want}");
        }
        assert_eq!(opt.param_step("w"), Some(1));
    }

    #[test]
    fn test_adamw_single_step_on_layer() {
        let mut linear = Linear::from_tensors(
            from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap(),
            Tensor::zeros(vec![2]),
        );
        let x = from_vec(vec![0.5, 0.5, 0.5, 0.5], &[2, 2]).unwrap();
        linear.backward(&x, &Tensor::ones(vec![2, 2])).unwrap();

        let mut opt = AdamW::new(AdamWConfig::default());
        opt.step(&mut linear.parameters_mut()).unwrap();

        let updated = linear.weight().value().as_slice().unwrap().to_vec();
        assert_ne!(updated, vec![1.0f32, 2.0, 3.0, 4.0], "params should change after step");
        assert_eq!(opt.state_of("weight").len(), 2);
        assert_eq!(opt.state_of("bias").len(), 2);
    }

    #[test]
    fn test_adamw_multiple_steps_decrease_loss() {
        // minimize ||w - target||^2
        let target = from_vec(vec![1.0, 0.0, 0.0, 1.0], &[2, 2]).unwrap();
        let mut w = Parameter::new("w", Tensor::zeros(vec![2, 2]));
        let config = AdamWConfig {
            lr: 0.1,
            weight_decay: 0.0,
            ..Default::default()
        };
        let mut opt = AdamW::new(config);

        let loss = |w: &Parameter| -> f32 {
            (w.value() - &target).mapv(|d| d * d).mean().unwrap_or(0.0)
        };
        let first_loss = loss(&w);
        for _ in 0..20 {
            let grad = (w.value() - &target).mapv(|d| d * 0.5);
            w.accumulate_grad(grad).unwrap();
            opt.step(&mut [&mut w]).unwrap();
            w.clear_grad();
        }
        let last_loss = loss(&w);
        assert!(
            last_loss < first_loss * 0.1,
            "loss should decrease significantly: first={first_loss} last={last_loss}"
        );
    }

    #[test]
    fn test_adamw_weight_decay() {
        let mut value = from_vec(vec![5.0, 5.0], &[2]).unwrap();
        let grad = Tensor::zeros(vec![2]);
        let config = AdamWConfig {
            lr: 0.1,
            weight_decay: 0.1,
            ..Default::default()
        };
        let mut opt = AdamW::new(config);
        opt.update_param("w", &mut value, &grad).unwrap();

        // zero grad: only decay applies, 5.0 * (1 - 0.01) = 4.95
        let got = value.as_slice().unwrap()[0];
        assert!((got - 4.95).abs() < 1e-6, "got {got}");
    }

    #[test]
    fn test_adamw_skips_missing_grads() {
        let mut w = Parameter::new("w", from_vec(vec![1.0, 2.0], &[2]).unwrap());
        let mut opt = AdamW::new(AdamWConfig::default());
        opt.step(&mut [&mut w]).unwrap();
        assert_eq!(w.value().as_slice().unwrap(), &[1.0, 2.0]);
        assert!(opt.state_of("w").is_empty());
    }

    #[test]
    fn test_adamw_skips_frozen_params() {
        let mut w = Parameter::new("w", from_vec(vec![1.0], &[1]).unwrap()).with_trainable(false);
        w.accumulate_grad(from_vec(vec![1.0], &[1]).unwrap()).unwrap();
        let mut opt = AdamW::new(AdamWConfig::default());
        opt.step(&mut [&mut w]).unwrap();
        assert_eq!(w.value().as_slice().unwrap(), &[1.0]);
    }

    #[test]
    fn test_adamw_reset_and_set_lr() {
        let mut opt = AdamW::new(AdamWConfig::default());
        let mut value = Tensor::zeros(vec![1]);
        opt.update_param("w", &mut value, &Tensor::ones(vec![1])).unwrap();
        assert_eq!(opt.state_keys(), vec!["w"]);
        opt.reset();
        assert!(opt.state_keys().is_empty());

        opt.set_lr(0.01);
        assert_eq!(opt.lr(), 0.01);
    }

    #[test]
    fn test_adamw_state_shape_mismatch() {
        let mut opt = AdamW::new(AdamWConfig::default());
        let mut a = Tensor::zeros(vec![2]);
        opt.update_param("w", &mut a, &Tensor::ones(vec![2])).unwrap();
        let mut b = Tensor::zeros(vec![3]);
        let err = opt
            .update_param("w", &mut b, &Tensor::ones(vec![3]))
            .unwrap_err();
        assert!(matches!(err, Error::State { .. }));
    }
}
