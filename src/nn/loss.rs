//! Losses over a (possibly batch-sharded) output tensor.
//!
//! Each function returns the *local* contribution to the loss together with
//! the upstream gradient for the local rows. `global_count` is the number of
//! output elements across all batch shards, so mean-style losses normalize
//! the same way no matter how the batch is split.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::tensor::Tensor;

/// Loss applied to the layer output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    /// `sum(y)`; upstream gradient of ones.
    #[default]
    Sum,
    /// `mean(y^2)`; upstream gradient `2y / N`.
    MeanSquare,
}

/// Local loss contribution and upstream gradient.
pub fn loss_and_grad(kind: LossKind, output: &Tensor, global_count: usize) -> Result<(f64, Tensor)> {
    match kind {
        LossKind::Sum => {
            let loss = output.iter().map(|&v| v as f64).sum();
            Ok((loss, Tensor::ones(output.raw_dim())))
        }
        LossKind::MeanSquare => {
            let n = global_count.max(1) as f64;
            let loss = output.iter().map(|&v| (v as f64) * (v as f64)).sum::<f64>() / n;
            let scale = (2.0 / n) as f32;
            Ok((loss, output.mapv(|v| v * scale)))
        }
    }
}
