//! Shared helpers for multi-rank integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use shardopt::distributed::{DistLinear, LocalCluster, MeshComms, ProcessMesh};
use shardopt::nn::Linear;
use shardopt::trainer::{RunConfig, RunContext, TrainLayout};
use shardopt::Tensor;

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Run `f` once per rank of a fresh in-process cluster; results in rank order.
pub fn run_on_mesh<T, F>(shape: &[usize], dims: &[&str], timeout: Duration, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(MeshComms) -> T + Sync,
{
    let mesh = Arc::new(ProcessMesh::grid(shape, dims).expect("valid mesh"));
    let cluster = LocalCluster::build(mesh, timeout).expect("cluster");
    thread::scope(|s| {
        let handles: Vec<_> = cluster
            .into_iter()
            .map(|comms| {
                let f = &f;
                s.spawn(move || f(comms))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("rank thread panicked"))
            .collect()
    })
}

/// Seeded full layer and batch, drawn the same way on every rank.
pub fn seeded_layer(seed: u64, layout: &TrainLayout) -> (Linear, Tensor) {
    let mut ctx = RunContext::new(RunConfig::default().with_seed(seed)).expect("context");
    let linear = Linear::new(layout.in_features, layout.out_features, ctx.rng());
    let batch = ctx.random_tensor(&[layout.batch_size, layout.in_features]);
    (linear, batch)
}

/// The 10x10 layer of [`TrainLayout::linear_2x2`] placed on `comms`' mesh.
pub fn placed_layer(seed: u64, comms: &MeshComms) -> (DistLinear, Tensor) {
    let layout = TrainLayout::linear_2x2();
    let (linear, batch) = seeded_layer(seed, &layout);
    let layer = DistLinear::new(linear, &layout.plan, comms.clone(), None).expect("placed layer");
    (layer, batch)
}
