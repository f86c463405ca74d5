//! In-process collectives for ranks running as threads of one process.
//!
//! Every collective is a rendezvous: each member deposits its buffer, the last
//! one to arrive publishes the round, and everybody reads the same snapshot.
//! A member that waits longer than the group timeout poisons the group, so a
//! rank that dies or diverges makes its peers fail instead of hang.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{trace, warn};

use crate::distributed::comm::{Communicator, MeshComms, ReduceOp};
use crate::distributed::mesh::ProcessMesh;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Collective {
    AllReduce(ReduceOp),
    Broadcast { root: usize },
    AllGather,
    Barrier,
}

#[derive(Debug)]
struct Contribution {
    kind: Collective,
    data: Vec<f32>,
}

#[derive(Debug)]
struct Round {
    generation: u64,
    arrived: usize,
    slots: Vec<Option<Contribution>>,
    completed: Option<(u64, Arc<Vec<Contribution>>)>,
    aborted: Option<String>,
}

/// Rendezvous state shared by the members of one communication group.
#[derive(Debug)]
pub struct LocalCommGroup {
    label: String,
    size: usize,
    timeout: Duration,
    round: Mutex<Round>,
    cond: Condvar,
}

impl LocalCommGroup {
    pub fn new(label: impl Into<String>, size: usize, timeout: Duration) -> Result<Arc<Self>> {
        if size == 0 {
            return Err(Error::config("communication group must have at least one member"));
        }
        Ok(Arc::new(Self {
            label: label.into(),
            size,
            timeout,
            round: Mutex::new(Round {
                generation: 0,
                arrived: 0,
                slots: (0..size).map(|_| None).collect(),
                completed: None,
                aborted: None,
            }),
            cond: Condvar::new(),
        }))
    }

    /// One communicator handle per member, in member order.
    pub fn communicators(self: &Arc<Self>) -> Vec<LocalCommunicator> {
        (0..self.size)
            .map(|rank| LocalCommunicator {
                group: Arc::clone(self),
                rank,
            })
            .collect()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// True once a member aborted or timed out; every later collective fails.
    pub fn is_aborted(&self) -> bool {
        self.round.lock().aborted.is_some()
    }

    fn abort(&self, reason: &str) {
        let mut round = self.round.lock();
        if round.aborted.is_none() {
            warn!(group = %self.label, reason, "aborting communication group");
            round.aborted = Some(reason.to_string());
        }
        drop(round);
        self.cond.notify_all();
    }

    fn exchange(
        &self,
        rank: usize,
        kind: Collective,
        data: Vec<f32>,
    ) -> Result<Arc<Vec<Contribution>>> {
        let mut round = self.round.lock();
        if let Some(reason) = &round.aborted {
            return Err(Error::Communication {
                reason: format!("group '{}' aborted: {reason}", self.label),
            });
        }
        if round.slots[rank].is_some() {
            return Err(Error::Communication {
                reason: format!(
                    "member {rank} of group '{}' entered a collective twice",
                    self.label
                ),
            });
        }

        let generation = round.generation;
        round.slots[rank] = Some(Contribution { kind, data });
        round.arrived += 1;

        if round.arrived == self.size {
            let contributions: Vec<Contribution> =
                round.slots.iter_mut().filter_map(Option::take).collect();
            let result = Arc::new(contributions);
            round.arrived = 0;
            round.generation += 1;
            round.completed = Some((generation, Arc::clone(&result)));
            trace!(group = %self.label, generation, ?kind, "collective complete");
            self.cond.notify_all();
            return Ok(result);
        }

        self.cond.wait_while_for(
            &mut round,
            |r| r.generation == generation && r.aborted.is_none(),
            self.timeout,
        );

        if round.generation != generation {
            return match &round.completed {
                Some((g, result)) if *g == generation => Ok(Arc::clone(result)),
                _ => Err(Error::Communication {
                    reason: format!("group '{}' lost the result of round {generation}", self.label),
                }),
            };
        }

        if let Some(reason) = &round.aborted {
            return Err(Error::Communication {
                reason: format!("group '{}' aborted: {reason}", self.label),
            });
        }

        let reason = format!(
            "member {rank} timed out after {:?} waiting for {kind:?} ({}/{} arrived)",
            self.timeout, round.arrived, self.size
        );
        warn!(group = %self.label, %reason, "collective timeout");
        round.aborted = Some(reason.clone());
        drop(round);
        self.cond.notify_all();
        Err(Error::Communication {
            reason: format!("group '{}': {reason}", self.label),
        })
    }

    fn check_kinds(&self, contributions: &[Contribution], expected: Collective) -> Result<()> {
        if let Some((member, c)) = contributions
            .iter()
            .enumerate()
            .find(|(_, c)| c.kind != expected)
        {
            return Err(Error::Communication {
                reason: format!(
                    "collective mismatch in group '{}': expected {expected:?}, member {member} called {:?}",
                    self.label, c.kind
                ),
            });
        }
        Ok(())
    }
}

/// One member's handle on a [`LocalCommGroup`].
#[derive(Debug, Clone)]
pub struct LocalCommunicator {
    group: Arc<LocalCommGroup>,
    rank: usize,
}

impl Communicator for LocalCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.group.size
    }

    fn all_reduce(&self, buf: &mut [f32], op: ReduceOp) -> Result<()> {
        let kind = Collective::AllReduce(op);
        let contributions = self.group.exchange(self.rank, kind, buf.to_vec())?;
        self.group.check_kinds(&contributions, kind)?;
        if let Some((member, c)) = contributions
            .iter()
            .enumerate()
            .find(|(_, c)| c.data.len() != buf.len())
        {
            return Err(Error::Communication {
                reason: format!(
                    "all_reduce length mismatch in group '{}': {} vs {} from member {member}",
                    self.group.label,
                    buf.len(),
                    c.data.len()
                ),
            });
        }

        buf.copy_from_slice(&contributions[0].data);
        for c in &contributions[1..] {
            for (acc, &v) in buf.iter_mut().zip(&c.data) {
                *acc = match op {
                    ReduceOp::Sum | ReduceOp::Avg => *acc + v,
                    ReduceOp::Max => acc.max(v),
                    ReduceOp::Min => acc.min(v),
                };
            }
        }
        if op == ReduceOp::Avg {
            let n = self.group.size as f32;
            buf.iter_mut().for_each(|v| *v /= n);
        }
        Ok(())
    }

    fn broadcast(&self, buf: &mut [f32], root: usize) -> Result<()> {
        if root >= self.group.size {
            return Err(Error::Communication {
                reason: format!(
                    "broadcast root {root} out of range for group '{}' of {}",
                    self.group.label, self.group.size
                ),
            });
        }
        let kind = Collective::Broadcast { root };
        let payload = if self.rank == root {
            buf.to_vec()
        } else {
            Vec::new()
        };
        let contributions = self.group.exchange(self.rank, kind, payload)?;
        self.group.check_kinds(&contributions, kind)?;

        let src = &contributions[root].data;
        if src.len() != buf.len() {
            return Err(Error::Communication {
                reason: format!(
                    "broadcast length mismatch in group '{}': root sent {}, member {} expects {}",
                    self.group.label,
                    src.len(),
                    self.rank,
                    buf.len()
                ),
            });
        }
        buf.copy_from_slice(src);
        Ok(())
    }

    fn all_gather(&self, local: &[f32]) -> Result<Vec<Vec<f32>>> {
        let contributions = self
            .group
            .exchange(self.rank, Collective::AllGather, local.to_vec())?;
        self.group
            .check_kinds(&contributions, Collective::AllGather)?;
        Ok(contributions.iter().map(|c| c.data.clone()).collect())
    }

    fn barrier(&self) -> Result<()> {
        let contributions = self
            .group
            .exchange(self.rank, Collective::Barrier, Vec::new())?;
        self.group.check_kinds(&contributions, Collective::Barrier)
    }

    fn abort(&self, reason: &str) {
        self.group.abort(reason);
    }
}

/// Builds every communication group a mesh needs for in-process ranks.
pub struct LocalCluster;

impl LocalCluster {
    /// One [`MeshComms`] per rank, in the mesh's process-id order.
    ///
    /// Creates a world group plus, for every mesh dimension, one group per
    /// line of ranks along that dimension.
    pub fn build(mesh: Arc<ProcessMesh>, timeout: Duration) -> Result<Vec<MeshComms>> {
        let world_size = mesh.world_size();
        let mut world = LocalCommGroup::new("world", world_size, timeout)?
            .communicators()
            .into_iter();

        let mut lines: Vec<HashMap<Vec<usize>, Vec<LocalCommunicator>>> =
            vec![HashMap::new(); mesh.ndim()];
        for (d, dim_name) in mesh.dim_names().iter().enumerate() {
            for &rank in mesh.process_ids() {
                let members = mesh.group_along(rank, dim_name)?;
                if !lines[d].contains_key(&members) {
                    let label = format!("{dim_name}{members:?}");
                    let group = LocalCommGroup::new(label, members.len(), timeout)?;
                    lines[d].insert(members, group.communicators());
                }
            }
        }

        let mut out = Vec::with_capacity(world_size);
        for &rank in mesh.process_ids() {
            let world_comm = world.next().ok_or_else(|| Error::Communication {
                reason: "world group has fewer members than the mesh".to_string(),
            })?;
            let coords = mesh.coords_of(rank)?;
            let mut dims: Vec<Arc<dyn Communicator>> = Vec::with_capacity(mesh.ndim());
            for (d, dim_name) in mesh.dim_names().iter().enumerate() {
                let members = mesh.group_along(rank, dim_name)?;
                let comm = lines[d]
                    .get(&members)
                    .and_then(|comms| comms.get(coords[d]))
                    .cloned()
                    .ok_or_else(|| Error::Communication {
                        reason: format!("no '{dim_name}' group for rank {rank}"),
                    })?;
                dims.push(Arc::new(comm));
            }
            out.push(MeshComms::new(
                Arc::clone(&mesh),
                rank,
                Arc::new(world_comm),
                dims,
            )?);
        }
        Ok(out)
    }
}
