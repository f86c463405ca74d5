//! Training loops: a single-device reference run and the sharded run.

pub mod config;
pub mod context;
pub mod sharded;
pub mod simple;

pub use config::{Backend, OptimizerKind, RunConfig, TrainLayout, TrainingMetrics};
pub use context::RunContext;
pub use sharded::train_sharded;
pub use simple::train_single_device;

use crate::tensor::Tensor;

/// Final full parameters and per-step metrics of a run.
#[derive(Debug, Clone)]
pub struct TrainOutcome {
    /// Full weight `[in, out]`.
    pub weight: Tensor,
    /// Full bias `[out]`.
    pub bias: Tensor,
    pub metrics: Vec<TrainingMetrics>,
}

impl TrainOutcome {
    /// Loss recorded at each step, in order.
    pub fn losses(&self) -> Vec<f64> {
        self.metrics.iter().map(|m| m.loss).collect()
    }
}
