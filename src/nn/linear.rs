//! Dense linear layer with explicit backward

use ndarray::{Axis, Ix1, Ix2};
use rand::Rng;

use crate::error::{Error, Result};
use crate::nn::{Module, Parameter};
use crate::tensor::Tensor;

/// Dense linear layer: output = input @ weight + bias
///
/// `weight` is `[in_features, out_features]`, `bias` is `[out_features]`.
/// Gradients are accumulated into the parameters' buffers by [`backward`].
///
/// [`backward`]: Linear::backward
#[derive(Debug, Clone)]
pub struct Linear {
    weight: Parameter,
    bias: Parameter,
}

impl Linear {
    /// Xavier-uniform weight, zero bias.
    pub fn new<G: Rng>(in_features: usize, out_features: usize, rng: &mut G) -> Self {
        let bound = (6.0 / (in_features + out_features) as f64).sqrt() as f32;
        let weight = Tensor::from_shape_simple_fn(vec![in_features, out_features], || {
            rng.random_range(-bound..bound)
        });
        let bias = Tensor::zeros(vec![out_features]);
        Self::from_tensors(weight, bias)
    }

    /// Build from existing tensors.
    pub fn from_tensors(weight: Tensor, bias: Tensor) -> Self {
        Self {
            weight: Parameter::new("weight", weight),
            bias: Parameter::new("bias", bias),
        }
    }

    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    pub fn bias(&self) -> &Parameter {
        &self.bias
    }

    /// input `[batch, in]` → output `[batch, out]`
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        affine(input, self.weight.value(), self.bias.value())
    }

    /// Accumulate `dW = x^T @ dy` and `db = sum_rows(dy)`.
    pub fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> Result<()> {
        let (dw, db) = affine_grads(input, grad_output)?;
        self.weight.accumulate_grad(dw)?;
        self.bias.accumulate_grad(db)?;
        Ok(())
    }
}

impl Module for Linear {
    fn parameters(&self) -> Vec<&Parameter> {
        vec![&self.weight, &self.bias]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        vec![&mut self.weight, &mut self.bias]
    }
}

/// `input @ weight + bias` on full (unsharded) tensors.
pub(crate) fn affine(input: &Tensor, weight: &Tensor, bias: &Tensor) -> Result<Tensor> {
    let x = input.view().into_dimensionality::<Ix2>()?;
    let w = weight.view().into_dimensionality::<Ix2>()?;
    let b = bias.view().into_dimensionality::<Ix1>()?;
    if x.ncols() != w.nrows() || w.ncols() != b.len() {
        return Err(Error::Shape {
            reason: format!(
                "linear shapes don't line up: input {:?}, weight {:?}, bias {:?}",
                input.shape(),
                weight.shape(),
                bias.shape()
            ),
        });
    }
    let y = x.dot(&w) + &b;
    Ok(y.into_dyn())
}

/// Full-shape `(dW, db)` for `y = x @ W + b` given upstream `dy`.
pub(crate) fn affine_grads(input: &Tensor, grad_output: &Tensor) -> Result<(Tensor, Tensor)> {
    let x = input.view().into_dimensionality::<Ix2>()?;
    let dy = grad_output.view().into_dimensionality::<Ix2>()?;
    if x.nrows() != dy.nrows() {
        return Err(Error::Shape {
            reason: format!(
                "batch mismatch: input {:?}, grad_output {:?}",
                input.shape(),
                grad_output.shape()
            ),
        });
    }
    let dw = x.t().dot(&dy);
    let db = dy.sum_axis(Axis(0));
    Ok((dw.into_dyn(), db.into_dyn()))
}
