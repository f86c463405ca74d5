//! Module trait for parameter access.

use crate::nn::Parameter;

/// Core trait for layers that own parameters.
///
/// Parameters are returned in declaration order; that order is what the
/// sharded optimizer uses to assign optimizer-state ownership, so it must be
/// stable across calls and identical on every worker.
///
/// Forward passes stay as inherent methods on each layer because
/// signatures differ.
pub trait Module {
    /// All parameters, in declaration order.
    fn parameters(&self) -> Vec<&Parameter>;

    /// Mutable access to all parameters, in declaration order.
    fn parameters_mut(&mut self) -> Vec<&mut Parameter>;

    /// Total number of scalar parameters held locally.
    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|p| p.value().len()).sum()
    }

    /// Release every gradient buffer.
    fn clear_grad(&mut self) {
        for p in self.parameters_mut() {
            p.clear_grad();
        }
    }
}
