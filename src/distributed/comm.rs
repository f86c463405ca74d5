//! Collective communication seam.
//!
//! The optimizer and the sharded layer only talk to other workers through the
//! [`Communicator`] trait, so the in-process transport in
//! [`local_comm`](super::local_comm) can be swapped for a real one without
//! touching them. All operations are blocking collectives: every member of
//! the group must call the same operation, in the same order.

use std::sync::Arc;

use crate::distributed::mesh::ProcessMesh;
use crate::error::{Error, Result};

/// Element-wise reduction applied by [`Communicator::all_reduce`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Max,
    Min,
    Avg,
}

/// Blocking collectives over a fixed group of workers.
///
/// `rank()` is the caller's index *within this group*, not its global rank.
pub trait Communicator: Send + Sync {
    /// Index of the caller within the group.
    fn rank(&self) -> usize;

    /// Number of members in the group.
    fn world_size(&self) -> usize;

    /// Reduce `buf` element-wise across the group; every member receives the
    /// result. Reductions are applied in member order so all members get
    /// bit-identical output.
    fn all_reduce(&self, buf: &mut [f32], op: ReduceOp) -> Result<()>;

    /// Overwrite `buf` on every member with the contents of `root`'s buffer.
    fn broadcast(&self, buf: &mut [f32], root: usize) -> Result<()>;

    /// Collect every member's buffer, ordered by member index.
    fn all_gather(&self, local: &[f32]) -> Result<Vec<Vec<f32>>>;

    /// Wait until every member arrives.
    fn barrier(&self) -> Result<()>;

    /// Poison the group: pending and future collectives fail on every member.
    fn abort(&self, reason: &str);
}

/// Communicator for a group of one. Every collective is the identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpCommunicator;

impl Communicator for NoOpCommunicator {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce(&self, _buf: &mut [f32], _op: ReduceOp) -> Result<()> {
        Ok(())
    }

    fn broadcast(&self, _buf: &mut [f32], root: usize) -> Result<()> {
        if root != 0 {
            return Err(Error::comm(format!(
                "broadcast root {root} out of range for a group of 1"
            )));
        }
        Ok(())
    }

    fn all_gather(&self, local: &[f32]) -> Result<Vec<Vec<f32>>> {
        Ok(vec![local.to_vec()])
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }

    fn abort(&self, _reason: &str) {}
}

/// One worker's view of the mesh: its global rank and coordinates, a
/// communicator spanning the whole mesh, and one communicator per mesh
/// dimension covering the ranks that differ from it only along that
/// dimension (member index = coordinate along the dimension).
#[derive(Clone)]
pub struct MeshComms {
    rank: usize,
    coords: Vec<usize>,
    mesh: Arc<ProcessMesh>,
    world: Arc<dyn Communicator>,
    dims: Vec<Arc<dyn Communicator>>,
}

impl std::fmt::Debug for MeshComms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshComms")
            .field("rank", &self.rank)
            .field("coords", &self.coords)
            .field("mesh", &self.mesh)
            .finish_non_exhaustive()
    }
}

impl MeshComms {
    /// Bundle communicators for `rank`. `dims` is indexed by mesh dimension.
    pub fn new(
        mesh: Arc<ProcessMesh>,
        rank: usize,
        world: Arc<dyn Communicator>,
        dims: Vec<Arc<dyn Communicator>>,
    ) -> Result<Self> {
        let coords = mesh.coords_of(rank)?;
        if world.world_size() != mesh.world_size() {
            return Err(Error::config(format!(
                "world communicator has {} members, mesh has {} ranks",
                world.world_size(),
                mesh.world_size()
            )));
        }
        if dims.len() != mesh.ndim() {
            return Err(Error::config(format!(
                "got {} dimension communicators for a {}D mesh",
                dims.len(),
                mesh.ndim()
            )));
        }
        for (d, comm) in dims.iter().enumerate() {
            if comm.world_size() != mesh.shape()[d] || comm.rank() != coords[d] {
                return Err(Error::config(format!(
                    "communicator for mesh dimension '{}' doesn't match rank {rank}'s group",
                    mesh.dim_names()[d]
                )));
            }
        }
        Ok(Self {
            rank,
            coords,
            mesh,
            world,
            dims,
        })
    }

    /// Comms for a mesh holding a single rank; every collective is a no-op.
    pub fn single(mesh: Arc<ProcessMesh>) -> Result<Self> {
        if mesh.world_size() != 1 {
            return Err(Error::config(format!(
                "single-rank comms need a 1-rank mesh, got {} ranks",
                mesh.world_size()
            )));
        }
        let rank = mesh.process_ids()[0];
        let dims = (0..mesh.ndim())
            .map(|_| Arc::new(NoOpCommunicator) as Arc<dyn Communicator>)
            .collect();
        Self::new(mesh, rank, Arc::new(NoOpCommunicator), dims)
    }

    /// Global rank of this worker.
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn coords(&self) -> &[usize] {
        &self.coords
    }

    pub fn mesh(&self) -> &Arc<ProcessMesh> {
        &self.mesh
    }

    /// Communicator spanning every rank of the mesh.
    pub fn world(&self) -> &dyn Communicator {
        self.world.as_ref()
    }

    /// Communicator along a named mesh dimension.
    pub fn along(&self, dim: &str) -> Result<&dyn Communicator> {
        let d = self.mesh.dim_index(dim)?;
        Ok(self.dims[d].as_ref())
    }

    /// This worker's coordinate along a named mesh dimension.
    pub fn coord(&self, dim: &str) -> Result<usize> {
        Ok(self.coords[self.mesh.dim_index(dim)?])
    }

    /// Poison every group this worker belongs to.
    pub fn abort_all(&self, reason: &str) {
        self.world.abort(reason);
        for comm in &self.dims {
            comm.abort(reason);
        }
    }
}
