//! Parameter and gradient synchronization over a mesh
//!
//! Placement-aware helpers: a collective is only issued along the mesh
//! dimensions where it makes sense for each parameter (broadcast along the
//! dimensions it is replicated on, norm reduction along the ones it is split
//! on). Every worker walks the same parameter list with the same placements,
//! so the collective schedule lines up without coordination.

use tracing::debug;

use crate::distributed::comm::{MeshComms, ReduceOp};
use crate::distributed::comm_utils::broadcast_tensor;
use crate::error::{Error, Result};
use crate::nn::Parameter;
use crate::optimizer::grad_clip::{check_max_norm, scale_grads};

/// Broadcast every parameter from coordinate 0 along each mesh dimension it
/// is replicated on, so replicas start from identical values.
///
/// Dimensions a parameter is split along are skipped: the members there hold
/// different slices.
pub fn broadcast_params(params: &mut [&mut Parameter], comms: &MeshComms) -> Result<()> {
    let dims = comms.mesh().dim_names().to_vec();
    for param in params.iter_mut() {
        let placement = param.placement().cloned().ok_or_else(|| Error::Configuration {
            reason: format!("parameter '{}' has no mesh placement", param.name()),
        })?;
        for dim in dims.iter().filter(|d| !placement.is_sharded_along(d)) {
            broadcast_tensor(comms.along(dim)?, param.value_mut(), 0)?;
        }
    }
    debug!(rank = comms.rank(), count = params.len(), "parameters broadcast");
    Ok(())
}

/// Clip gradients by the global L2 norm of the *full* (unsharded) gradients.
///
/// Each parameter's squared norm is summed across the mesh dimensions it is
/// split along; replicated parameters are counted once. A missing gradient
/// contributes zero. Returns the global norm before clipping, identical on
/// every worker.
pub fn clip_grad_norm_sharded(
    params: &mut [&mut Parameter],
    max_norm: f64,
    comms: &MeshComms,
) -> Result<f64> {
    check_max_norm(max_norm)?;

    let mut total_norm_sq = 0.0f64;
    for param in params.iter().filter(|p| p.is_trainable()) {
        let local_sq = param
            .grad()
            .map(|g| g.iter().map(|&v| (v as f64) * (v as f64)).sum::<f64>())
            .unwrap_or(0.0);
        let mut buf = [local_sq as f32];
        if let Some(placement) = param.placement() {
            for split in placement.spec().splits() {
                comms.along(&split.mesh_dim)?.all_reduce(&mut buf, ReduceOp::Sum)?;
            }
        }
        total_norm_sq += buf[0] as f64;
    }
    let total_norm = total_norm_sq.sqrt();

    scale_grads(params, total_norm, max_norm);
    Ok(total_norm)
}
