//! Parameter placement: which tensor axis is split over which mesh dimension.
//!
//! A [`ShardSpec`] lists `(tensor_axis, mesh_dim)` splits; every mesh
//! dimension not named is replicated. A [`Placement`] binds a spec to a mesh
//! and a global shape, and answers "which slice does rank r hold".
//!
//! Splits use a balanced partition: for length `n` over `k` parts, the first
//! `n % k` parts get `n / k + 1` elements, the rest `n / k`. Slices are
//! disjoint and concatenating them in coordinate order gives back the full
//! axis.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::distributed::mesh::ProcessMesh;
use crate::error::{Error, Result};
use crate::nn::Module;
use crate::tensor::{Tensor, narrow};

/// One split: `tensor_axis` is partitioned across `mesh_dim`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisSplit {
    pub tensor_axis: usize,
    pub mesh_dim: String,
}

/// Per-parameter sharding declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardSpec {
    #[serde(default)]
    splits: Vec<AxisSplit>,
}

impl ShardSpec {
    /// Full copy on every worker.
    pub fn replicated() -> Self {
        Self::default()
    }

    /// Split `tensor_axis` across `mesh_dim`.
    pub fn shard(tensor_axis: usize, mesh_dim: impl Into<String>) -> Self {
        Self::replicated().and_shard(tensor_axis, mesh_dim)
    }

    /// Add another split (for tensors sharded over several mesh dimensions).
    pub fn and_shard(mut self, tensor_axis: usize, mesh_dim: impl Into<String>) -> Self {
        self.splits.push(AxisSplit {
            tensor_axis,
            mesh_dim: mesh_dim.into(),
        });
        self
    }

    pub fn splits(&self) -> &[AxisSplit] {
        &self.splits
    }

    pub fn is_replicated(&self) -> bool {
        self.splits.is_empty()
    }

    /// Tensor axis split over `mesh_dim`, if any.
    pub fn axis_for(&self, mesh_dim: &str) -> Option<usize> {
        self.splits
            .iter()
            .find(|s| s.mesh_dim == mesh_dim)
            .map(|s| s.tensor_axis)
    }
}

/// `(start, len)` of part `index` when `len` elements are split into `parts`.
pub fn shard_range(len: usize, parts: usize, index: usize) -> (usize, usize) {
    let base = len / parts;
    let extra = len % parts;
    let size = base + usize::from(index < extra);
    let start = index * base + index.min(extra);
    (start, size)
}

/// A [`ShardSpec`] validated against a mesh and a global tensor shape.
#[derive(Debug, Clone)]
pub struct Placement {
    mesh: Arc<ProcessMesh>,
    spec: ShardSpec,
    global_shape: Vec<usize>,
}

impl Placement {
    pub fn new(mesh: Arc<ProcessMesh>, spec: ShardSpec, global_shape: &[usize]) -> Result<Self> {
        let mut seen_axes = Vec::new();
        let mut seen_dims = Vec::new();
        for split in spec.splits() {
            if split.tensor_axis >= global_shape.len() {
                return Err(Error::config(format!(
                    "cannot shard axis {} of a {}D tensor",
                    split.tensor_axis,
                    global_shape.len()
                )));
            }
            let parts = mesh.dim_size(&split.mesh_dim)?;
            if global_shape[split.tensor_axis] < parts {
                return Err(Error::config(format!(
                    "axis {} of length {} cannot be split over '{}' of size {parts}",
                    split.tensor_axis, global_shape[split.tensor_axis], split.mesh_dim
                )));
            }
            if seen_axes.contains(&split.tensor_axis) {
                return Err(Error::config(format!(
                    "tensor axis {} is sharded twice",
                    split.tensor_axis
                )));
            }
            if seen_dims.contains(&split.mesh_dim) {
                return Err(Error::config(format!(
                    "mesh dimension '{}' shards two tensor axes",
                    split.mesh_dim
                )));
            }
            seen_axes.push(split.tensor_axis);
            seen_dims.push(split.mesh_dim.clone());
        }

        Ok(Self {
            mesh,
            spec,
            global_shape: global_shape.to_vec(),
        })
    }

    /// Fully replicated placement on `mesh`.
    pub fn replicated(mesh: Arc<ProcessMesh>, global_shape: &[usize]) -> Self {
        Self {
            mesh,
            spec: ShardSpec::replicated(),
            global_shape: global_shape.to_vec(),
        }
    }

    pub fn mesh(&self) -> &Arc<ProcessMesh> {
        &self.mesh
    }

    pub fn spec(&self) -> &ShardSpec {
        &self.spec
    }

    pub fn global_shape(&self) -> &[usize] {
        &self.global_shape
    }

    pub fn is_sharded_along(&self, mesh_dim: &str) -> bool {
        self.spec.axis_for(mesh_dim).is_some()
    }

    /// Per-axis `(start, len)` of the slice held by `rank`.
    pub fn local_ranges(&self, rank: usize) -> Result<Vec<(usize, usize)>> {
        let coords = self.mesh.coords_of(rank)?;
        let mut ranges: Vec<(usize, usize)> = self.global_shape.iter().map(|&n| (0, n)).collect();
        for split in self.spec.splits() {
            let d = self.mesh.dim_index(&split.mesh_dim)?;
            let len = self.global_shape[split.tensor_axis];
            ranges[split.tensor_axis] = shard_range(len, self.mesh.shape()[d], coords[d]);
        }
        Ok(ranges)
    }

    /// Shape of the slice held by `rank`.
    pub fn local_shape(&self, rank: usize) -> Result<Vec<usize>> {
        Ok(self.local_ranges(rank)?.into_iter().map(|(_, n)| n).collect())
    }

    /// Cut the slice held by `rank` out of the full tensor.
    pub fn local_slice(&self, full: &Tensor, rank: usize) -> Result<Tensor> {
        if full.shape() != self.global_shape.as_slice() {
            return Err(Error::shape(format!(
                "expected global shape {:?}, got {:?}",
                self.global_shape,
                full.shape()
            )));
        }
        let mut out = full.clone();
        for (axis, (start, len)) in self.local_ranges(rank)?.into_iter().enumerate() {
            if len != self.global_shape[axis] {
                out = narrow(&out, axis, start, len)?;
            }
        }
        Ok(out)
    }
}

/// Declarative mapping from parameter name to shard spec, evaluated once
/// when a layer is placed on a mesh. Unnamed parameters are replicated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShardPlan {
    #[serde(default)]
    entries: Vec<(String, ShardSpec)>,
}

impl ShardPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, param: impl Into<String>, spec: ShardSpec) -> Self {
        let param = param.into();
        self.entries.retain(|(name, _)| *name != param);
        self.entries.push((param, spec));
        self
    }

    pub fn spec_for(&self, param: &str) -> ShardSpec {
        self.entries
            .iter()
            .find(|(name, _)| name == param)
            .map(|(_, spec)| spec.clone())
            .unwrap_or_default()
    }

    pub fn entries(&self) -> &[(String, ShardSpec)] {
        &self.entries
    }
}

/// Place every parameter of `module` on `mesh` according to `plan`, keeping
/// only the slice that `rank` holds.
///
/// Plan entries naming a parameter the module doesn't have are rejected so
/// typos don't silently fall back to replication.
pub fn shard_layer<M: Module + ?Sized>(
    module: &mut M,
    mesh: &Arc<ProcessMesh>,
    plan: &ShardPlan,
    rank: usize,
) -> Result<()> {
    {
        let names: Vec<&str> = module.parameters().into_iter().map(|p| p.name()).collect();
        if let Some((unknown, _)) = plan
            .entries()
            .iter()
            .find(|(n, _)| !names.contains(&n.as_str()))
        {
            return Err(Error::config(format!(
                "shard plan names unknown parameter '{unknown}'"
            )));
        }
    }

    for param in module.parameters_mut() {
        if param.placement().is_some() {
            return Err(Error::config(format!(
                "parameter '{}' is already placed on a mesh",
                param.name()
            )));
        }
        let spec = plan.spec_for(param.name());
        let placement = Placement::new(mesh.clone(), spec, param.value().shape())?;
        let local = placement.local_slice(param.value(), rank)?;
        debug!(
            param = param.name(),
            rank,
            global = ?placement.global_shape(),
            local = ?local.shape(),
            "placed parameter"
        );
        param.place(placement, local);
    }
    Ok(())
}
