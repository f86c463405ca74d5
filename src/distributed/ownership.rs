//! Optimizer-state ownership for stage 1 sharding.
//!
//! Every trainable parameter gets exactly one owner per line of workers
//! along the sharding mesh dimension:
//!
//! - a parameter already split along the sharding dimension is partitioned
//!   by its own placement, so each worker owns the state of its local slice;
//! - a parameter replicated along the sharding dimension is owned by one
//!   coordinate, chosen by the [`OwnershipPolicy`].
//!
//! The table is a pure function of the parameter list (names, order, global
//! shapes, placements) and the mesh, so every worker computes the same one
//! without a coordination round.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::nn::Parameter;

/// How replicated parameters are spread over the sharding dimension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnershipPolicy {
    /// `i`-th replicated parameter (declaration order) → coordinate `i % size`.
    #[default]
    RoundRobin,
    /// Coordinate with the fewest owned elements so far; lowest coordinate
    /// on ties. Parameters are visited in declaration order.
    Greedy,
}

/// Who updates a parameter's optimizer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateOwner {
    /// Split along the sharding dimension: each worker owns its own slice.
    Local,
    /// Replicated along the sharding dimension: this coordinate owns it and
    /// broadcasts the updated value to the rest of its line.
    Coordinate(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipEntry {
    pub name: String,
    pub owner: StateOwner,
    /// Global element count, used by the greedy policy.
    pub numel: usize,
}

/// Deterministic parameter → state-owner mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipTable {
    sharding_dim: String,
    dim_size: usize,
    entries: Vec<OwnershipEntry>,
}

impl OwnershipTable {
    /// Assign owners for every trainable parameter of `params`.
    ///
    /// Every parameter must already carry a placement.
    pub fn build(
        params: &[&Parameter],
        sharding_dim: &str,
        dim_size: usize,
        policy: OwnershipPolicy,
    ) -> Result<Self> {
        if dim_size == 0 {
            return Err(Error::config("sharding dimension has size 0"));
        }

        let mut load = vec![0usize; dim_size];
        let mut next = 0usize;
        let mut entries = Vec::new();

        for param in params.iter().filter(|p| p.is_trainable()) {
            let placement = param.placement().ok_or_else(|| Error::Configuration {
                reason: format!("parameter '{}' has no mesh placement", param.name()),
            })?;
            let numel = placement.global_shape().iter().product::<usize>();

            let owner = if placement.is_sharded_along(sharding_dim) {
                StateOwner::Local
            } else {
                let coord = match policy {
                    OwnershipPolicy::RoundRobin => next % dim_size,
                    OwnershipPolicy::Greedy => load
                        .iter()
                        .enumerate()
                        .min_by_key(|&(c, &l)| (l, c))
                        .map(|(c, _)| c)
                        .unwrap_or(0),
                };
                next += 1;
                load[coord] += numel;
                StateOwner::Coordinate(coord)
            };

            entries.push(OwnershipEntry {
                name: param.name().to_string(),
                owner,
                numel,
            });
        }

        Ok(Self {
            sharding_dim: sharding_dim.to_string(),
            dim_size,
            entries,
        })
    }

    pub fn sharding_dim(&self) -> &str {
        &self.sharding_dim
    }

    pub fn dim_size(&self) -> usize {
        self.dim_size
    }

    pub fn entries(&self) -> &[OwnershipEntry] {
        &self.entries
    }

    pub fn owner_of(&self, name: &str) -> Option<StateOwner> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.owner)
    }

    /// Whether the worker at `coord` along the sharding dimension updates
    /// the state of `name`.
    pub fn is_owned_by(&self, name: &str, coord: usize) -> bool {
        match self.owner_of(name) {
            Some(StateOwner::Local) => true,
            Some(StateOwner::Coordinate(c)) => c == coord,
            None => false,
        }
    }

    /// Names of the parameters whose state the worker at `coord` owns.
    pub fn owned_by(&self, coord: usize) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| match e.owner {
                StateOwner::Local => true,
                StateOwner::Coordinate(c) => c == coord,
            })
            .map(|e| e.name.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::mesh::ProcessMesh;
    use crate::distributed::placement::{Placement, ShardSpec};
    use crate::tensor::Tensor;
    use std::sync::Arc;

    fn placed(name: &str, shape: &[usize], spec: ShardSpec, mesh: &Arc<ProcessMesh>) -> Parameter {
        let placement = Placement::new(mesh.clone(), spec, shape).unwrap();
        let mut p = Parameter::new(name, Tensor::zeros(shape.to_vec()));
        let local = placement.local_slice(&Tensor::zeros(shape.to_vec()), 0).unwrap();
        p.place(placement, local);
        p
    }

    fn mesh_1d(n: usize) -> Arc<ProcessMesh> {
        Arc::new(ProcessMesh::grid(&[n], &["dp"]).unwrap())
    }

    #[test]
    fn test_round_robin_by_declaration_order() {
        let mesh = mesh_1d(2);
        let params: Vec<Parameter> = ["a", "b", "c"]
            .iter()
            .map(|n| placed(n, &[4], ShardSpec::replicated(), &mesh))
            .collect();
        let refs: Vec<&Parameter> = params.iter().collect();
        let table = OwnershipTable::build(&refs, "dp", 2, OwnershipPolicy::RoundRobin).unwrap();

        assert_eq!(table.owner_of("a"), Some(StateOwner::Coordinate(0)));
        assert_eq!(table.owner_of("b"), Some(StateOwner::Coordinate(1)));
        // uneven count wraps around to coordinate 0
        assert_eq!(table.owner_of("c"), Some(StateOwner::Coordinate(0)));
        assert_eq!(table.owned_by(0), vec!["a", "c"]);
        assert_eq!(table.owned_by(1), vec!["b"]);
    }

    #[test]
    fn test_sharded_params_are_locally_owned() {
        let mesh = mesh_1d(2);
        let params = [
            placed("w", &[4, 4], ShardSpec::shard(1, "dp"), &mesh),
            placed("b", &[4], ShardSpec::replicated(), &mesh),
        ];
        let refs: Vec<&Parameter> = params.iter().collect();
        let table = OwnershipTable::build(&refs, "dp", 2, OwnershipPolicy::RoundRobin).unwrap();

        assert_eq!(table.owner_of("w"), Some(StateOwner::Local));
        // the counter only advances over replicated params
        assert_eq!(table.owner_of("b"), Some(StateOwner::Coordinate(0)));
        assert!(table.is_owned_by("w", 1));
        assert!(!table.is_owned_by("b", 1));
    }

    #[test]
    fn test_greedy_balances_elements() {
        let mesh = mesh_1d(2);
        let params = [
            placed("big", &[100], ShardSpec::replicated(), &mesh),
            placed("s1", &[10], ShardSpec::replicated(), &mesh),
            placed("s2", &[10], ShardSpec::replicated(), &mesh),
            placed("s3", &[10], ShardSpec::replicated(), &mesh),
        ];
        let refs: Vec<&Parameter> = params.iter().collect();
        let table = OwnershipTable::build(&refs, "dp", 2, OwnershipPolicy::Greedy).unwrap();
        assert_eq!(table.owned_by(0), vec!["big"]);
        assert_eq!(table.owned_by(1), vec!["s1", "s2", "s3"]);
    }

    #[test]
    fn test_frozen_params_have_no_owner() {
        let mesh = mesh_1d(2);
        let params = [placed("f", &[2], ShardSpec::replicated(), &mesh).with_trainable(false)];
        let refs: Vec<&Parameter> = params.iter().collect();
        let table = OwnershipTable::build(&refs, "dp", 2, OwnershipPolicy::RoundRobin).unwrap();
        assert!(table.entries().is_empty());
        assert_eq!(table.owner_of("f"), None);
    }

    #[test]
    fn test_missing_placement_rejected() {
        let p = Parameter::new("w", Tensor::zeros(vec![2]));
        let err = OwnershipTable::build(&[&p], "dp", 2, OwnershipPolicy::RoundRobin).unwrap_err();
        assert!(err.to_string().contains("has no mesh placement"));
    }

    #[test]
    fn test_table_is_deterministic() {
        let mesh = mesh_1d(3);
        let build = || {
            let params: Vec<Parameter> = (0..7)
                .map(|i| placed(&format!("p{i}"), &[i + 1], ShardSpec::replicated(), &mesh))
                .collect();
            let refs: Vec<&Parameter> = params.iter().collect();
            OwnershipTable::build(&refs, "dp", 3, OwnershipPolicy::Greedy).unwrap()
        };
        assert_eq!(build(), build());
    }
}
