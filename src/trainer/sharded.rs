//! Sharded training loop: one thread per mesh rank.
//!
//! Every rank seeds its own [`RunContext`] from the same config, so all of
//! them draw the same initial layer and batch as the single-device run. Each
//! rank then keeps only its slices, trains with the stage 1 wrapper and, at
//! the end, gathers the full parameters back for comparison.

use std::sync::Arc;
use std::thread;

use tracing::{debug, info, warn};

use crate::distributed::{
    DistLinear, LocalCluster, MeshComms, ProcessMesh, ReduceOp, broadcast_params,
    clip_grad_norm_sharded, shard_optimizer,
};
use crate::error::{Error, Result};
use crate::nn::{Module, loss_and_grad};
use crate::trainer::TrainOutcome;
use crate::trainer::config::{RunConfig, TrainLayout, TrainingMetrics};
use crate::trainer::context::RunContext;
use crate::trainer::simple::init_run;

/// Train `layout` across its mesh with optimizer state sharded by stage 1.
///
/// Fails if any rank fails; a failing rank aborts its communication groups
/// so peers stop instead of waiting out their timeout. The returned error is
/// the root cause when one is known (a non-communication error), otherwise
/// the first rank's error.
pub fn train_sharded(config: &RunConfig, layout: &TrainLayout) -> Result<TrainOutcome> {
    config.validate()?;
    let mesh = Arc::new(ProcessMesh::grid(&layout.mesh_shape, &layout.mesh_dims)?);
    let cluster = LocalCluster::build(mesh.clone(), config.collective_timeout())?;
    info!(
        mesh = ?mesh.shape(),
        dims = ?mesh.dim_names(),
        steps = config.steps,
        "starting sharded run"
    );

    let results: Vec<Result<TrainOutcome>> = thread::scope(|s| {
        let mut handles = Vec::with_capacity(cluster.len());
        for comms in cluster {
            let guard = comms.clone();
            let spawned = thread::Builder::new()
                .name(format!("rank-{}", comms.rank()))
                .spawn_scoped(s, move || run_rank(config, layout, comms));
            match spawned {
                Ok(handle) => handles.push(Ok(handle)),
                Err(e) => {
                    guard.abort_all(&format!("failed to spawn rank {}", guard.rank()));
                    handles.push(Err(Error::Io(e)));
                }
            }
        }
        handles
            .into_iter()
            .map(|h| {
                h.and_then(|h| {
                    h.join().unwrap_or_else(|_| {
                        Err(Error::comm("rank thread panicked"))
                    })
                })
            })
            .collect()
    });

    let mut outcomes = Vec::with_capacity(results.len());
    let mut errors = Vec::new();
    for result in results {
        match result {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => errors.push(e),
        }
    }
    if !errors.is_empty() {
        let root = errors
            .iter()
            .position(|e| !e.is_communication())
            .unwrap_or(0);
        return Err(errors.swap_remove(root));
    }

    let mut outcomes = outcomes.into_iter();
    let first = outcomes
        .next()
        .ok_or_else(|| Error::config("mesh has no ranks"))?;
    for (rank, other) in outcomes.enumerate() {
        if other.weight != first.weight || other.bias != first.bias {
            return Err(Error::State {
                reason: format!("rank {} finished with different parameters than rank 0", rank + 1),
            });
        }
    }
    Ok(first)
}

fn run_rank(config: &RunConfig, layout: &TrainLayout, comms: MeshComms) -> Result<TrainOutcome> {
    let result = rank_loop(config, layout, comms.clone());
    if let Err(e) = &result {
        if !e.is_communication() {
            warn!(rank = comms.rank(), error = %e, "rank failed, aborting its groups");
        }
        comms.abort_all(&e.to_string());
    }
    result
}

fn rank_loop(config: &RunConfig, layout: &TrainLayout, comms: MeshComms) -> Result<TrainOutcome> {
    let rank = comms.rank();
    let mut ctx = RunContext::new(config.clone())?;
    let (linear, batch) = init_run(&mut ctx, layout);

    let mut layer = DistLinear::new(linear, &layout.plan, comms.clone(), layout.batch_dim.clone())?;
    broadcast_params(&mut layer.parameters_mut(), &comms)?;
    let input = layer.shard_input(&batch)?;

    let mut optimizer = shard_optimizer(
        config.build_optimizer()?,
        layout.strategy.clone(),
        &layer.parameters(),
        comms.clone(),
    )?;
    let global_count = layout.batch_size * layout.out_features;

    let mut metrics = Vec::with_capacity(config.steps);
    for step in 1..=config.steps as u64 {
        let output = layer.forward(&input)?;
        let (local_loss, grad_output) = loss_and_grad(layout.loss, &output, global_count)?;
        layer.backward(&input, &grad_output)?;

        let grad_norm = match config.max_grad_norm {
            Some(max_norm) => Some(clip_grad_norm_sharded(
                &mut layer.parameters_mut(),
                max_norm,
                &comms,
            )?),
            None => None,
        };
        optimizer.step(&mut layer.parameters_mut())?;
        optimizer.clear_grad(&mut layer.parameters_mut());

        let loss = match layout.batch_dim.as_deref() {
            Some(dim) => {
                let mut buf = [local_loss as f32];
                comms.along(dim)?.all_reduce(&mut buf, ReduceOp::Sum)?;
                buf[0] as f64
            }
            None => local_loss,
        };
        debug!(rank, step, loss, "sharded step");
        metrics.push(TrainingMetrics {
            step,
            loss,
            grad_norm,
            lr: optimizer.lr(),
        });
    }

    Ok(TrainOutcome {
        weight: layer.full_weight()?,
        bias: layer.full_bias()?,
        metrics,
    })
}
