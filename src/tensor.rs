//! Small ndarray helpers shared by the layer, placement and collective code.

use ndarray::{ArrayD, Axis, IxDyn, Slice};

use crate::error::{Error, Result};

/// Dense f32 tensor used throughout the crate.
pub type Tensor = ArrayD<f32>;

/// Build a tensor from a flat buffer and a shape.
pub fn from_vec(data: Vec<f32>, shape: &[usize]) -> Result<Tensor> {
    Ok(ArrayD::from_shape_vec(IxDyn(shape), data)?)
}

/// Flatten a tensor into a row-major buffer.
pub fn to_vec(t: &Tensor) -> Vec<f32> {
    t.iter().copied().collect()
}

/// Copy `len` elements starting at `start` along `axis`, in row-major layout.
pub fn narrow(t: &Tensor, axis: usize, start: usize, len: usize) -> Result<Tensor> {
    if axis >= t.ndim() {
        return Err(Error::shape(format!(
            "narrow axis {axis} out of range for {}D tensor",
            t.ndim()
        )));
    }
    if start + len > t.shape()[axis] {
        return Err(Error::shape(format!(
            "narrow [{start}, {}) exceeds axis {axis} of length {}",
            start + len,
            t.shape()[axis]
        )));
    }
    Ok(t.slice_axis(Axis(axis), Slice::from(start..start + len))
        .as_standard_layout()
        .into_owned())
}

/// Concatenate tensors along `axis`.
pub fn concat(axis: usize, parts: &[Tensor]) -> Result<Tensor> {
    let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
    Ok(ndarray::concatenate(Axis(axis), &views)?)
}

/// Element-wise closeness with numpy's `assert_allclose` semantics:
/// `|actual - desired| <= atol + rtol * |desired|`.
///
/// Returns the first offending flat index and values on failure.
pub fn allclose(actual: &Tensor, desired: &Tensor, rtol: f64, atol: f64) -> Result<()> {
    if actual.shape() != desired.shape() {
        return Err(Error::shape(format!(
            "shape mismatch: {:?} vs {:?}",
            actual.shape(),
            desired.shape()
        )));
    }
    for (i, (&a, &d)) in actual.iter().zip(desired.iter()).enumerate() {
        let (a, d) = (a as f64, d as f64);
        let tol = atol + rtol * d.abs();
        if !((a - d).abs() <= tol) {
            return Err(Error::shape(format!(
                "not close at flat index {i}: actual={a}, desired={d}, |diff|={}, tol={tol}",
                (a - d).abs()
            )));
        }
    }
    Ok(())
}

/// Panicking wrapper around [`allclose`] for tests.
#[track_caller]
pub fn assert_allclose(actual: &Tensor, desired: &Tensor, rtol: f64, atol: f64) {
    if let Err(e) = allclose(actual, desired, rtol, atol) {
        panic!("{e}");
    }
}
