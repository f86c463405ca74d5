//! Stage 1 sharded optimizer: shards optimizer state across a mesh dimension
//!
//! Each worker only stores optimizer state (AdamW `m`/`v`, SGD velocity) for
//! the parameters it owns along the sharding dimension. After the owner's
//! update, the new parameter value is broadcast to the other workers of its
//! line, so every worker holds identical, fully-updated parameters. This
//! reduces optimizer memory by the size of the sharding dimension without
//! touching how the parameters themselves are sharded.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::distributed::comm::{MeshComms, ReduceOp};
use crate::distributed::comm_utils::broadcast_tensor;
use crate::distributed::ownership::{OwnershipPolicy, OwnershipTable, StateOwner};
use crate::error::{Error, Result};
use crate::nn::Parameter;
use crate::optimizer::Optimizer;

/// Stage 1 options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardingStage1 {
    /// Mesh dimension to partition optimizer state over.
    /// Defaults to the first dimension of the mesh.
    pub mesh_dim: Option<String>,
    /// How replicated parameters are assigned an owner coordinate.
    pub policy: OwnershipPolicy,
}

impl ShardingStage1 {
    /// Shard over the first mesh dimension with round-robin ownership.
    pub fn new() -> Self {
        Self::default()
    }

    /// Shard over `mesh_dim` instead of the first mesh dimension.
    pub fn on_dim(mut self, mesh_dim: impl Into<String>) -> Self {
        self.mesh_dim = Some(mesh_dim.into());
        self
    }

    /// Use `policy` to assign owners.
    pub fn with_policy(mut self, policy: OwnershipPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Sharding strategies a caller can ask for. Only stage 1 is implemented.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardingStrategy {
    /// Optimizer state partitioning.
    Stage1(ShardingStage1),
    /// Optimizer state + gradient partitioning.
    Stage2,
    /// Optimizer state + gradient + parameter partitioning.
    Stage3,
}

impl From<ShardingStage1> for ShardingStrategy {
    fn from(stage: ShardingStage1) -> Self {
        ShardingStrategy::Stage1(stage)
    }
}

/// Wrap `base` so that optimizer state is partitioned across `comms`' mesh.
///
/// `params` must be the parameters later passed to [`ShardedOptimizer::step`],
/// in the same order, each already placed on the mesh. Validation happens
/// here, never later: a parameter without placement, a placement on another
/// mesh, a local value that doesn't match its placement, duplicate names, an
/// unknown sharding dimension or an unsupported strategy are all
/// configuration errors.
pub fn shard_optimizer<O: Optimizer>(
    base: O,
    strategy: impl Into<ShardingStrategy>,
    params: &[&Parameter],
    comms: MeshComms,
) -> Result<ShardedOptimizer<O>> {
    let stage = match strategy.into() {
        ShardingStrategy::Stage1(stage) => stage,
        other => {
            return Err(Error::Configuration {
                reason: format!("unsupported sharding strategy {other:?}; only stage 1 is available"),
            });
        }
    };

    let mesh = comms.mesh().clone();
    let sharding_dim = match stage.mesh_dim {
        Some(dim) => dim,
        None => mesh
            .dim_names()
            .first()
            .cloned()
            .ok_or_else(|| Error::config("mesh has no dimensions"))?,
    };
    let dim_size = mesh.dim_size(&sharding_dim)?;
    let coord = comms.coord(&sharding_dim)?;

    for (i, param) in params.iter().enumerate() {
        if params[..i].iter().any(|p| p.name() == param.name()) {
            return Err(Error::Configuration {
                reason: format!("duplicate parameter name '{}'", param.name()),
            });
        }
        let placement = param.placement().ok_or_else(|| Error::Configuration {
            reason: format!("parameter '{}' has no mesh placement", param.name()),
        })?;
        if **placement.mesh() != *mesh {
            return Err(Error::Configuration {
                reason: format!(
                    "parameter '{}' is placed on a different mesh than the communicators",
                    param.name()
                ),
            });
        }
        let expected = placement.local_shape(comms.rank())?;
        if param.value().shape() != expected.as_slice() {
            return Err(Error::Configuration {
                reason: format!(
                    "parameter '{}' holds shape {:?}, rank {} should hold {:?}",
                    param.name(),
                    param.value().shape(),
                    comms.rank(),
                    expected
                ),
            });
        }
    }

    let table = OwnershipTable::build(params, &sharding_dim, dim_size, stage.policy)?;
    info!(
        rank = comms.rank(),
        sharding_dim = %sharding_dim,
        owned = ?table.owned_by(coord),
        "sharded optimizer ready"
    );

    Ok(ShardedOptimizer {
        base,
        comms,
        sharding_dim,
        coord,
        table,
        timestep: 0,
    })
}

/// Stage 1 wrapper around a base optimizer.
///
/// Exposes the same `step` / `clear_grad` contract as the base optimizer.
/// With a sharding dimension of size 1 this degenerates to the plain base
/// optimizer plus no-op collectives.
pub struct ShardedOptimizer<O> {
    base: O,
    comms: MeshComms,
    sharding_dim: String,
    coord: usize,
    table: OwnershipTable,
    timestep: u64,
}

impl<O: Optimizer> ShardedOptimizer<O> {
    /// Perform one sharded optimizer step.
    ///
    /// 1. Workers of each sharding line agree on which parameters carry a gradient
    /// 2. Each worker runs the base update only on the parameters it owns
    /// 3. Owners broadcast updated replicated parameters along the sharding dimension
    /// 4. All workers agree on whether the step succeeded everywhere
    ///
    /// A parameter without a gradient on any worker of the line is skipped,
    /// as the base optimizer does. If only some workers hold it, the ones
    /// missing it fail with a state error (the owner's old value is still
    /// broadcast) and the step fails on every worker. Other parameters are
    /// still updated.
    pub fn step(&mut self, params: &mut [&mut Parameter]) -> Result<()> {
        self.timestep += 1;
        let step = self.timestep;

        let trainable: Vec<usize> = (0..params.len())
            .filter(|&i| params[i].is_trainable())
            .collect();
        let matches_table = trainable.len() == self.table.entries().len()
            && trainable
                .iter()
                .zip(self.table.entries())
                .all(|(&i, e)| params[i].name() == e.name);
        if !matches_table {
            let reason = format!(
                "step {step}: parameters don't match those the optimizer was sharded over"
            );
            self.comms.abort_all(&reason);
            return Err(Error::Configuration { reason });
        }

        let holders = self.count_grad_holders(params, &trainable)?;
        let line_size = self.table.dim_size();

        let mut local_error: Option<Error> = None;
        for ((&i, entry), holders) in trainable.iter().zip(self.table.entries()).zip(holders) {
            if holders == 0 {
                trace!(rank = self.comms.rank(), param = %entry.name, step, "no gradient on the line");
                continue;
            }
            let param = &mut *params[i];
            let owns = match entry.owner {
                StateOwner::Local => true,
                StateOwner::Coordinate(c) => c == self.coord,
            };

            let (name, value, grad) = param.parts_mut();
            let result = match grad {
                Some(grad) if owns => self.base.update_param(name, value, grad),
                Some(_) => Ok(()),
                None => Err(Error::State {
                    reason: format!(
                        "rank {}: gradient for '{name}' missing at step {step} ({holders}/{line_size} peers hold one)",
                        self.comms.rank()
                    ),
                }),
            };
            match result {
                Ok(()) if owns => trace!(rank = self.comms.rank(), param = name, step, "updated owned state"),
                Ok(()) => {}
                Err(e) => {
                    debug!(rank = self.comms.rank(), param = name, step, error = %e, "skipping update");
                    local_error.get_or_insert(e);
                }
            }

            if let StateOwner::Coordinate(owner) = entry.owner {
                let comm = self.comms.along(&self.sharding_dim)?;
                if let Err(e) = broadcast_tensor(comm, param.value_mut(), owner) {
                    self.comms.abort_all(&e.to_string());
                    return Err(e);
                }
            }
        }

        self.agree_on_status(step, local_error)
    }

    /// Number of workers along the sharding line holding a gradient for each
    /// trainable parameter. One all-reduce for the whole list.
    fn count_grad_holders(&self, params: &[&mut Parameter], trainable: &[usize]) -> Result<Vec<usize>> {
        let mut flags: Vec<f32> = trainable
            .iter()
            .map(|&i| if params[i].grad().is_some() { 1.0 } else { 0.0 })
            .collect();
        let result = self
            .comms
            .along(&self.sharding_dim)
            .and_then(|comm| comm.all_reduce(&mut flags, ReduceOp::Sum));
        if let Err(e) = result {
            self.comms.abort_all(&e.to_string());
            return Err(e);
        }
        Ok(flags.iter().map(|&f| f.round() as usize).collect())
    }

    /// Drop every gradient buffer. No communication.
    pub fn clear_grad(&self, params: &mut [&mut Parameter]) {
        for p in params.iter_mut() {
            p.clear_grad();
        }
    }

    /// World-wide all-reduce of a failure flag so every worker leaves the
    /// step with the same verdict.
    fn agree_on_status(&self, step: u64, local_error: Option<Error>) -> Result<()> {
        let rank = self.comms.rank();
        let mut flag = match local_error {
            Some(_) => [1.0f32, rank as f32],
            None => [0.0f32, -1.0],
        };
        if let Err(e) = self.comms.world().all_reduce(&mut flag, ReduceOp::Max) {
            self.comms.abort_all(&e.to_string());
            return Err(e);
        }

        match local_error {
            Some(e) => Err(e),
            None if flag[0] > 0.0 => Err(Error::State {
                reason: format!(
                    "rank {rank}: step {step} failed on peer rank {}",
                    flag[1] as usize
                ),
            }),
            None => {
                debug!(rank, step, "sharded step complete");
                Ok(())
            }
        }
    }

    /// Number of completed `step()` calls.
    pub fn timestep(&self) -> u64 {
        self.timestep
    }

    /// Mesh dimension optimizer state is partitioned over.
    pub fn sharding_dim(&self) -> &str {
        &self.sharding_dim
    }

    /// Owner of every trainable parameter, identical on all workers.
    pub fn ownership(&self) -> &OwnershipTable {
        &self.table
    }

    /// Owner of `name`, or `None` if it isn't a wrapped trainable parameter.
    pub fn owner_of(&self, name: &str) -> Option<StateOwner> {
        self.table.owner_of(name)
    }

    /// Parameters this worker stores optimizer state for.
    pub fn owned_params(&self) -> Vec<&str> {
        self.table.owned_by(self.coord)
    }

    /// True once state for `name` has been allocated on this worker.
    pub fn is_initialized(&self, name: &str) -> bool {
        self.base.state_keys().contains(&name)
    }

    /// The wrapped optimizer, holding state only for owned parameters.
    pub fn base(&self) -> &O {
        &self.base
    }

    /// Communicators the wrapper synchronizes over.
    pub fn comms(&self) -> &MeshComms {
        &self.comms
    }

    /// Learning rate of the base optimizer.
    pub fn lr(&self) -> f64 {
        self.base.lr()
    }

    /// Set the learning rate of the base optimizer.
    pub fn set_lr(&mut self, lr: f64) {
        self.base.set_lr(lr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::mesh::ProcessMesh;
    use crate::distributed::placement::{ShardPlan, ShardSpec, shard_layer};
    use crate::nn::{Linear, Module};
    use crate::optimizer::{AdamW, AdamWConfig};
    use crate::tensor::{Tensor, from_vec};
    use std::sync::Arc;

    fn single_rank_layer() -> (Linear, MeshComms) {
        let mesh = Arc::new(ProcessMesh::grid(&[1], &["x"]).unwrap());
        let comms = MeshComms::single(mesh.clone()).unwrap();
        let mut linear = Linear::from_tensors(
            from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap(),
            from_vec(vec![0.5, -0.5], &[2]).unwrap(),
        );
        let plan = ShardPlan::new().with("weight", ShardSpec::shard(1, "x"));
        shard_layer(&mut linear, &mesh, &plan, 0).unwrap();
        (linear, comms)
    }

    #[test]
    fn test_single_rank_matches_adamw() {
        let (mut sharded_layer, comms) = single_rank_layer();
        let mut plain_layer = Linear::from_tensors(
            sharded_layer.weight().value().clone(),
            sharded_layer.bias().value().clone(),
        );

        let config = AdamWConfig {
            lr: 0.1,
            ..Default::default()
        };
        let mut sharded = shard_optimizer(
            AdamW::new(config.clone()),
            ShardingStage1::new(),
            &sharded_layer.parameters(),
            comms,
        )
        .unwrap();
        let mut plain = AdamW::new(config);

        let x = from_vec(vec![0.1, 0.2, 0.3, 0.4], &[2, 2]).unwrap();
        for _ in 0..3 {
            let dy = Tensor::ones(vec![2, 2]);
            sharded_layer.backward(&x, &dy).unwrap();
            plain_layer.backward(&x, &dy).unwrap();

            sharded.step(&mut sharded_layer.parameters_mut()).unwrap();
            plain.step(&mut plain_layer.parameters_mut()).unwrap();

            sharded.clear_grad(&mut sharded_layer.parameters_mut());
            plain_layer.clear_grad();
        }

        assert_eq!(sharded_layer.weight().value(), plain_layer.weight().value());
        assert_eq!(sharded_layer.bias().value(), plain_layer.bias().value());
        assert_eq!(sharded.timestep(), 3);
        assert!(sharded.is_initialized("weight"));
    }

    #[test]
    fn test_unplaced_parameter_rejected() {
        let mesh = Arc::new(ProcessMesh::grid(&[1], &["x"]).unwrap());
        let comms = MeshComms::single(mesh).unwrap();
        let linear = Linear::from_tensors(Tensor::zeros(vec![2, 2]), Tensor::zeros(vec![2]));
        let err = shard_optimizer(
            AdamW::new(AdamWConfig::default()),
            ShardingStage1::new(),
            &linear.parameters(),
            comms,
        )
        .err()
        .unwrap();
        assert!(matches!(err, Error::Configuration { .. }));
        assert!(err.to_string().contains("no mesh placement"));
    }

    #[test]
    fn test_unsupported_stage_rejected() {
        let (linear, comms) = single_rank_layer();
        for strategy in [ShardingStrategy::Stage2, ShardingStrategy::Stage3] {
            let err = shard_optimizer(
                AdamW::new(AdamWConfig::default()),
                strategy,
                &linear.parameters(),
                comms.clone(),
            )
            .err()
            .unwrap();
            assert!(err.to_string().contains("unsupported sharding strategy"));
        }
    }

    #[test]
    fn test_unknown_sharding_dim_rejected() {
        let (linear, comms) = single_rank_layer();
        let result = shard_optimizer(
            AdamW::new(AdamWConfig::default()),
            ShardingStage1::new().on_dim("z"),
            &linear.parameters(),
            comms,
        );
        assert!(matches!(result, Err(Error::Configuration { .. })));
    }

    #[test]
    fn test_param_without_grad_is_skipped() {
        let (mut linear, comms) = single_rank_layer();
        let mut opt = shard_optimizer(
            AdamW::new(AdamWConfig::default()),
            ShardingStage1::new(),
            &linear.parameters(),
            comms,
        )
        .unwrap();

        let original_bias = linear.bias().value().clone();
        let original_weight = linear.weight().value().clone();
        // only the weight gets a gradient
        linear.parameters_mut()[0]
            .accumulate_grad(Tensor::ones(vec![2, 2]))
            .unwrap();

        opt.step(&mut linear.parameters_mut()).unwrap();
        assert_ne!(linear.weight().value(), &original_weight);
        assert_eq!(linear.bias().value(), &original_bias);
        assert!(opt.is_initialized("weight"));
        assert!(!opt.is_initialized("bias"));
    }

    #[test]
    fn test_step_without_any_grad_is_noop() {
        let (mut linear, comms) = single_rank_layer();
        let mut opt = shard_optimizer(
            AdamW::new(AdamWConfig::default()),
            ShardingStage1::new(),
            &linear.parameters(),
            comms,
        )
        .unwrap();
        let weight = linear.weight().value().clone();
        opt.step(&mut linear.parameters_mut()).unwrap();
        assert_eq!(linear.weight().value(), &weight);
        assert!(opt.base().state_keys().is_empty());
    }

    #[test]
    fn test_step_with_foreign_params_rejected() {
        let (linear, comms) = single_rank_layer();
        let mut opt = shard_optimizer(
            AdamW::new(AdamWConfig::default()),
            ShardingStage1::new(),
            &linear.parameters(),
            comms,
        )
        .unwrap();
        let mut other = Parameter::new("other", Tensor::zeros(vec![1]));
        let err = opt.step(&mut [&mut other]).unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }
}
