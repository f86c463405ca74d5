//! Gradient clipping utilities
//!
//! Clip gradients by global norm to prevent exploding gradients during training.

use crate::error::{Error, Result};
use crate::nn::Parameter;

/// Clip gradients in-place by global L2 norm.
///
/// Computes the global norm across all trainable gradients, then scales each
/// gradient so the global norm does not exceed `max_norm`.
///
/// Returns the original global norm (before clipping).
pub fn clip_grad_norm(params: &mut [&mut Parameter], max_norm: f64) -> Result<f64> {
    check_max_norm(max_norm)?;

    let total_norm_sq: f64 = params
        .iter()
        .filter(|p| p.is_trainable())
        .filter_map(|p| p.grad())
        .map(|g| g.iter().map(|&v| (v as f64) * (v as f64)).sum::<f64>())
        .sum();
    let total_norm = total_norm_sq.sqrt();

    scale_grads(params, total_norm, max_norm);
    Ok(total_norm)
}

pub(crate) fn check_max_norm(max_norm: f64) -> Result<()> {
    if max_norm <= 0.0 {
        return Err(Error::Configuration {
            reason: format!("max_norm must be positive, got {max_norm}"),
        });
    }
    Ok(())
}

pub(crate) fn scale_grads(params: &mut [&mut Parameter], total_norm: f64, max_norm: f64) {
    if total_norm > max_norm {
        let scale = (max_norm / (total_norm + 1e-6)) as f32;
        for p in params.iter_mut().filter(|p| p.is_trainable()) {
            if let Some(g) = p.grad_mut() {
                g.mapv_inplace(|v| v * scale);
            }
        }
    }
}
