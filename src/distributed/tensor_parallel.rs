//! Mesh-placed linear layer
//!
//! [`DistLinear`] wraps a [`Linear`] whose weight and bias are placed on a
//! mesh by a [`ShardPlan`]. Forward gathers the full parameters and applies
//! them to the local input rows. Backward computes full-shape partial
//! gradients from the local rows, sums them across the batch-sharding
//! dimension (if any) and keeps only the slice each worker holds.
//!
//! With a replicated batch no gradient communication happens at all, and the
//! result is bit-identical to the single-device layer.

use tracing::trace;

use crate::distributed::comm::{MeshComms, ReduceOp};
use crate::distributed::comm_utils::{all_reduce_tensor, gather_full};
use crate::distributed::placement::{ShardPlan, shard_layer, shard_range};
use crate::error::{Error, Result};
use crate::nn::linear::{affine, affine_grads};
use crate::nn::{Linear, Module, Parameter};
use crate::tensor::{Tensor, narrow};

/// Linear layer with parameters sharded across a process mesh.
pub struct DistLinear {
    layer: Linear,
    comms: MeshComms,
    batch_dim: Option<String>,
}

impl DistLinear {
    /// Place `layer` on `comms`' mesh according to `plan`.
    ///
    /// `batch_dim` names the mesh dimension the input batch is split along;
    /// `None` means every worker sees the full batch.
    pub fn new(
        mut layer: Linear,
        plan: &ShardPlan,
        comms: MeshComms,
        batch_dim: Option<String>,
    ) -> Result<Self> {
        if let Some(dim) = &batch_dim {
            comms.mesh().dim_index(dim)?;
        }
        shard_layer(&mut layer, comms.mesh(), plan, comms.rank())?;
        Ok(Self {
            layer,
            comms,
            batch_dim,
        })
    }

    pub fn layer(&self) -> &Linear {
        &self.layer
    }

    pub fn comms(&self) -> &MeshComms {
        &self.comms
    }

    pub fn batch_dim(&self) -> Option<&str> {
        self.batch_dim.as_deref()
    }

    /// Rows of the full batch this worker processes.
    pub fn shard_input(&self, full: &Tensor) -> Result<Tensor> {
        let Some(dim) = &self.batch_dim else {
            return Ok(full.clone());
        };
        let parts = self.comms.mesh().dim_size(dim)?;
        let rows = full.shape().first().copied().unwrap_or(0);
        if rows < parts {
            return Err(Error::shape(format!(
                "batch of {rows} rows cannot be split over '{dim}' of size {parts}"
            )));
        }
        let (start, len) = shard_range(rows, parts, self.comms.coord(dim)?);
        narrow(full, 0, start, len)
    }

    /// Local input rows `[b, in]` → local output rows `[b, out]`.
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let weight = self.full_weight()?;
        let bias = self.full_bias()?;
        affine(input, &weight, &bias)
    }

    /// Accumulate this worker's gradient slices for the local rows.
    pub fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> Result<()> {
        let (mut dw, mut db) = affine_grads(input, grad_output)?;
        if let Some(dim) = &self.batch_dim {
            let comm = self.comms.along(dim)?;
            all_reduce_tensor(comm, &mut dw, ReduceOp::Sum)?;
            all_reduce_tensor(comm, &mut db, ReduceOp::Sum)?;
            trace!(rank = self.comms.rank(), dim = %dim, "partial grads reduced");
        }

        let rank = self.comms.rank();
        for (param, full_grad) in self.layer.parameters_mut().into_iter().zip([dw, db]) {
            let placement = param.placement().ok_or_else(|| {
                Error::state(format!("parameter '{}' lost its placement", param.name()))
            })?;
            let local = placement.local_slice(&full_grad, rank)?;
            param.accumulate_grad(local)?;
        }
        Ok(())
    }

    /// Gather the full weight `[in, out]`. Collective over the mesh.
    pub fn full_weight(&self) -> Result<Tensor> {
        gather_param(self.layer.weight(), &self.comms)
    }

    /// Gather the full bias `[out]`. Collective over the mesh.
    pub fn full_bias(&self) -> Result<Tensor> {
        gather_param(self.layer.bias(), &self.comms)
    }
}

fn gather_param(param: &Parameter, comms: &MeshComms) -> Result<Tensor> {
    let placement = param
        .placement()
        .ok_or_else(|| Error::state(format!("parameter '{}' lost its placement", param.name())))?;
    gather_full(param.value(), placement, comms)
}

impl Module for DistLinear {
    fn parameters(&self) -> Vec<&Parameter> {
        self.layer.parameters()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.layer.parameters_mut()
    }
}
