//! Distributed training over a process mesh
//!
//! - [`mesh`] / [`placement`]: the device grid and how tensors are split on it
//! - [`comm`] / [`local_comm`]: collective communication (trait + in-process transport)
//! - [`tensor_parallel`]: a linear layer whose parameters live on the mesh
//! - [`sharding_stage1`]: optimizer-state partitioning (stage 1)

pub mod comm;
pub mod comm_utils;
pub mod grad_sync;
pub mod local_comm;
pub mod mesh;
pub mod ownership;
pub mod placement;
pub mod sharding_stage1;
pub mod tensor_parallel;

pub use comm::{Communicator, MeshComms, NoOpCommunicator, ReduceOp};
pub use comm_utils::{all_gather_along, all_reduce_tensor, broadcast_tensor, gather_full};
pub use grad_sync::{broadcast_params, clip_grad_norm_sharded};
pub use local_comm::{LocalCluster, LocalCommGroup, LocalCommunicator};
pub use mesh::ProcessMesh;
pub use ownership::{OwnershipEntry, OwnershipPolicy, OwnershipTable, StateOwner};
pub use placement::{AxisSplit, Placement, ShardPlan, ShardSpec, shard_layer, shard_range};
pub use sharding_stage1::{ShardedOptimizer, ShardingStage1, ShardingStrategy, shard_optimizer};
pub use tensor_parallel::DistLinear;
