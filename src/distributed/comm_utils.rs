//! Tensor-level wrappers around the slice-based `Communicator` trait.
//!
//! Provides helpers so other distributed modules don't repeat the
//! contiguity-check → borrow-buffer → collective → reshape pattern.

use crate::distributed::comm::{Communicator, MeshComms, ReduceOp};
use crate::distributed::placement::{Placement, shard_range};
use crate::error::{Error, Result};
use crate::tensor::{Tensor, concat, from_vec, to_vec};

/// All-reduce a single tensor in-place with the given reduction op.
pub fn all_reduce_tensor(comm: &dyn Communicator, tensor: &mut Tensor, op: ReduceOp) -> Result<()> {
    let buf = tensor.as_slice_mut().ok_or_else(|| Error::Communication {
        reason: "all_reduce requires contiguous tensor".to_string(),
    })?;
    comm.all_reduce(buf, op)
}

/// Broadcast a tensor from root member to all members, in place.
pub fn broadcast_tensor(comm: &dyn Communicator, tensor: &mut Tensor, root: usize) -> Result<()> {
    let buf = tensor.as_slice_mut().ok_or_else(|| Error::Communication {
        reason: "broadcast requires contiguous tensor".to_string(),
    })?;
    comm.broadcast(buf, root)
}

/// Gather the slices of `axis` held by every member and concatenate them in
/// member order.
///
/// `axis_len` is the full (gathered) length of `axis`; member `i` is expected
/// to hold part `i` of its balanced partition.
pub fn all_gather_along(
    comm: &dyn Communicator,
    local: &Tensor,
    axis: usize,
    axis_len: usize,
) -> Result<Tensor> {
    let parts = comm.world_size();
    if parts == 1 {
        return Ok(local.clone());
    }

    let gathered = comm.all_gather(&to_vec(local))?;
    let mut pieces = Vec::with_capacity(parts);
    for (member, data) in gathered.into_iter().enumerate() {
        let mut shape = local.shape().to_vec();
        shape[axis] = shard_range(axis_len, parts, member).1;
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(Error::Communication {
                reason: format!(
                    "all_gather piece from member {member} has {} elements, expected {expected} for shape {shape:?}",
                    data.len()
                ),
            });
        }
        pieces.push(from_vec(data, &shape)?);
    }
    concat(axis, &pieces)
}

/// Reconstruct the full tensor from this worker's local slice by gathering
/// along every sharded mesh dimension of `placement`.
pub fn gather_full(local: &Tensor, placement: &Placement, comms: &MeshComms) -> Result<Tensor> {
    let mut full = local.clone();
    for split in placement.spec().splits() {
        let comm = comms.along(&split.mesh_dim)?;
        let axis_len = placement.global_shape()[split.tensor_axis];
        full = all_gather_along(comm, &full, split.tensor_axis, axis_len)?;
    }
    if full.shape() != placement.global_shape() {
        return Err(Error::shape(format!(
            "gathered shape {:?} doesn't match global shape {:?}",
            full.shape(),
            placement.global_shape()
        )));
    }
    Ok(full)
}
