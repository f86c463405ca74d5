//! Named trainable tensors with gradient buffers and mesh placement.

use crate::distributed::placement::Placement;
use crate::error::{Error, Result};
use crate::tensor::Tensor;

/// A named tensor owned by one layer.
///
/// After [`shard_layer`](crate::distributed::shard_layer) the value holds only
/// this worker's local slice and `placement` describes the global tensor.
/// Gradients accumulate across backward passes until [`clear_grad`] is
/// called, the same way framework gradients do.
///
/// [`clear_grad`]: Parameter::clear_grad
#[derive(Debug, Clone)]
pub struct Parameter {
    name: String,
    value: Tensor,
    grad: Option<Tensor>,
    trainable: bool,
    placement: Option<Placement>,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: Tensor) -> Self {
        Self {
            name: name.into(),
            value,
            grad: None,
            trainable: true,
            placement: None,
        }
    }

    /// Mark the parameter frozen (`false`) or trainable.
    pub fn with_trainable(mut self, trainable: bool) -> Self {
        self.trainable = trainable;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &Tensor {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut Tensor {
        &mut self.value
    }

    pub fn is_trainable(&self) -> bool {
        self.trainable
    }

    pub fn grad(&self) -> Option<&Tensor> {
        self.grad.as_ref()
    }

    pub fn grad_mut(&mut self) -> Option<&mut Tensor> {
        self.grad.as_mut()
    }

    /// Split borrow for in-place updates: `(name, value, grad)`.
    pub fn parts_mut(&mut self) -> (&str, &mut Tensor, Option<&Tensor>) {
        (&self.name, &mut self.value, self.grad.as_ref())
    }

    pub fn placement(&self) -> Option<&Placement> {
        self.placement.as_ref()
    }

    /// Add `grad` into the gradient buffer (allocating it on first use).
    pub fn accumulate_grad(&mut self, grad: Tensor) -> Result<()> {
        if grad.shape() != self.value.shape() {
            return Err(Error::Shape {
                reason: format!(
                    "gradient for '{}' has shape {:?}, parameter has {:?}",
                    self.name,
                    grad.shape(),
                    self.value.shape()
                ),
            });
        }
        match &mut self.grad {
            Some(g) => *g += &grad,
            None => self.grad = Some(grad),
        }
        Ok(())
    }

    /// Release the gradient buffer.
    pub fn clear_grad(&mut self) {
        self.grad = None;
    }

    pub(crate) fn place(&mut self, placement: Placement, local: Tensor) {
        self.placement = Some(placement);
        self.value = local;
        self.grad = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::from_vec;

    #[test]
    fn test_grad_accumulates_until_cleared() {
        let mut p = Parameter::new("w", from_vec(vec![0.0, 0.0], &[2]).unwrap());
        assert!(p.grad().is_none());

        p.accumulate_grad(from_vec(vec![1.0, 2.0], &[2]).unwrap())
            .unwrap();
        p.accumulate_grad(from_vec(vec![1.0, 2.0], &[2]).unwrap())
            .unwrap();
        assert_eq!(p.grad().unwrap().as_slice().unwrap(), &[2.0, 4.0]);

        p.clear_grad();
        assert!(p.grad().is_none());
    }

    #[test]
    fn test_grad_shape_checked() {
        let mut p = Parameter::new("w", from_vec(vec![0.0, 0.0], &[2]).unwrap());
        let err = p
            .accumulate_grad(from_vec(vec![1.0], &[1]).unwrap())
            .unwrap_err();
        assert!(matches!(err, Error::Shape { .. }));
    }
}
