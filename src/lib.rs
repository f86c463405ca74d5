//! # shardopt
//!
//! **Stage 1 sharded optimizer: optimizer state partitioned across a device mesh.**
//!
//! A base optimizer (AdamW, SGD) is wrapped so that each worker only keeps
//! optimizer state for the parameters it owns along one mesh dimension. The
//! owner updates, then broadcasts the new value, so every worker ends each
//! step with the same parameters a single-device run would produce.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  trainer      train_single_device / train_sharded        │
//! ├──────────────────────────────────────────────────────────┤
//! │  distributed  ShardedOptimizer, DistLinear, placements   │
//! │               ProcessMesh, Communicator, LocalCluster    │
//! ├──────────────────────────────────────────────────────────┤
//! │  optimizer    Optimizer trait, AdamW, Sgd, clipping      │
//! │  nn           Parameter, Module, Linear, losses          │
//! ├──────────────────────────────────────────────────────────┤
//! │  tensor       ndarray-backed f32 tensors                 │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Ranks run as threads of one process and talk through in-process
//! collectives; the [`distributed::Communicator`] trait is the seam for a
//! real transport.

pub mod distributed;
pub mod error;
pub mod logging;
pub mod nn;
pub mod optimizer;
pub mod tensor;
pub mod trainer;

pub use distributed::{
    DistLinear, LocalCluster, MeshComms, ProcessMesh, ShardPlan, ShardSpec, ShardedOptimizer,
    ShardingStage1, ShardingStrategy, shard_layer, shard_optimizer,
};
pub use error::{Error, Result};
pub use optimizer::{AdamW, AdamWConfig, Optimizer, Sgd, SgdConfig};
pub use tensor::{Tensor, assert_allclose};
pub use trainer::{RunConfig, TrainLayout, TrainOutcome, train_sharded, train_single_device};
