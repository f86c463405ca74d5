//! Optimizer trait abstraction
//!
//! Defines a common interface for all optimizers so trainers and the sharded
//! wrapper can be optimizer-agnostic. The per-parameter rule
//! ([`Optimizer::update_param`]) is the unit the sharded wrapper delegates to;
//! the wrapper only decides *which worker* runs it.

use crate::error::Result;
use crate::nn::Parameter;
use crate::tensor::Tensor;

/// Trait for parameter optimizers.
///
/// State is keyed by parameter name and created lazily on the first update
/// of that parameter.
pub trait Optimizer {
    /// Update one parameter in place from its gradient.
    fn update_param(&mut self, name: &str, value: &mut Tensor, grad: &Tensor) -> Result<()>;

    /// Optimizer state tensors held for `name` (empty if none allocated).
    fn state_of(&self, name: &str) -> Vec<&Tensor>;

    /// Names of all parameters that have state allocated.
    fn state_keys(&self) -> Vec<&str>;

    /// Set the learning rate.
    fn set_lr(&mut self, lr: f64);

    /// Get the current learning rate.
    fn lr(&self) -> f64;

    /// Reset all optimizer state (moments, velocities, counters).
    fn reset(&mut self);

    /// Perform one optimization step.
    ///
    /// Updates every trainable parameter that has a gradient.
    /// Parameters without gradients are skipped.
    fn step(&mut self, params: &mut [&mut Parameter]) -> Result<()> {
        for param in params.iter_mut() {
            if !param.is_trainable() {
                continue;
            }
            let (name, value, grad) = param.parts_mut();
            if let Some(grad) = grad {
                self.update_param(name, value, grad)?;
            }
        }
        Ok(())
    }
}

impl<O: Optimizer + ?Sized> Optimizer for Box<O> {
    fn update_param(&mut self, name: &str, value: &mut Tensor, grad: &Tensor) -> Result<()> {
        (**self).update_param(name, value, grad)
    }

    fn state_of(&self, name: &str) -> Vec<&Tensor> {
        (**self).state_of(name)
    }

    fn state_keys(&self) -> Vec<&str> {
        (**self).state_keys()
    }

    fn set_lr(&mut self, lr: f64) {
        (**self).set_lr(lr)
    }

    fn lr(&self) -> f64 {
        (**self).lr()
    }

    fn reset(&mut self) {
        (**self).reset()
    }

    fn step(&mut self, params: &mut [&mut Parameter]) -> Result<()> {
        (**self).step(params)
    }
}
