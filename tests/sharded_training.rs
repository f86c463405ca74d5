mod common;

use rstest::rstest;
use shardopt::distributed::{OwnershipPolicy, ShardingStage1};
use shardopt::nn::LossKind;
use shardopt::trainer::{OptimizerKind, RunConfig, TrainLayout, train_sharded, train_single_device};
use shardopt::{assert_allclose, tensor::allclose};

#[test]
fn test_linear_2x2_matches_single_device() {
    shardopt::logging::init_logging("warn").expect("logging");

    let config = RunConfig::default().with_seed(2024).with_steps(5);
    let layout = TrainLayout::linear_2x2();

    let single = train_single_device(&config, &layout).expect("single-device run");
    let sharded = train_sharded(&config, &layout).expect("sharded run");

    assert_allclose(&sharded.weight, &single.weight, 1e-5, 0.0);
    assert_allclose(&sharded.bias, &single.bias, 1e-5, 0.0);
    assert_eq!(sharded.losses(), single.losses());
    assert_eq!(sharded.metrics.len(), 5);
}

#[test]
fn test_training_moves_parameters() {
    let config = RunConfig::default().with_lr(0.1);
    let layout = TrainLayout::linear_2x2();
    let sharded = train_sharded(&config, &layout).expect("sharded run");
    let untrained = train_single_device(&config.clone().with_lr(1e-12).with_weight_decay(0.0), &layout)
        .expect("near-zero lr run");
    assert!(allclose(&sharded.weight, &untrained.weight, 1e-3, 0.0).is_err());
}

#[rstest]
#[case::round_robin_on_x("x", OwnershipPolicy::RoundRobin, OptimizerKind::AdamW)]
#[case::round_robin_on_y("y", OwnershipPolicy::RoundRobin, OptimizerKind::AdamW)]
#[case::greedy_on_x("x", OwnershipPolicy::Greedy, OptimizerKind::AdamW)]
#[case::sgd_momentum_on_y("y", OwnershipPolicy::Greedy, OptimizerKind::Sgd)]
fn test_strategies_match_single_device(
    #[case] dim: &str,
    #[case] policy: OwnershipPolicy,
    #[case] optimizer: OptimizerKind,
) {
    let config = RunConfig::default()
        .with_seed(7)
        .with_steps(4)
        .with_optimizer(optimizer)
        .with_momentum(0.9)
        .with_lr(0.01);
    let layout = TrainLayout::linear_2x2()
        .with_strategy(ShardingStage1::new().on_dim(dim).with_policy(policy));

    let single = train_single_device(&config, &layout).expect("single-device run");
    let sharded = train_sharded(&config, &layout).expect("sharded run");

    assert_allclose(&sharded.weight, &single.weight, 1e-5, 0.0);
    assert_allclose(&sharded.bias, &single.bias, 1e-5, 0.0);
}

#[rstest]
#[case::one_dim(&[4], &["dp"])]
#[case::degenerate(&[1, 1], &["x", "y"])]
fn test_other_meshes_match_single_device(#[case] shape: &[usize], #[case] dims: &[&str]) {
    let config = RunConfig::default().with_steps(3);
    let layout = TrainLayout::linear_2x2()
        .with_mesh(shape, dims)
        .with_plan(shardopt::ShardPlan::new().with("weight", shardopt::ShardSpec::shard(0, dims[0])));

    let single = train_single_device(&config, &layout).expect("single-device run");
    let sharded = train_sharded(&config, &layout).expect("sharded run");

    assert_allclose(&sharded.weight, &single.weight, 1e-5, 0.0);
    assert_allclose(&sharded.bias, &single.bias, 1e-5, 0.0);
}

#[test]
fn test_batch_sharded_2x2_matches_single_device() {
    let config = RunConfig::default().with_seed(2024).with_steps(5);
    let layout = TrainLayout::linear_2x2_batch_sharded();
    assert_eq!(layout.batch_dim.as_deref(), Some("x"));

    let single = train_single_device(&config, &layout).expect("single-device run");
    let sharded = train_sharded(&config, &layout).expect("sharded run");

    assert_allclose(&sharded.weight, &single.weight, 1e-5, 0.0);
    assert_allclose(&sharded.bias, &single.bias, 1e-5, 0.0);
    for (a, b) in sharded.losses().iter().zip(single.losses()) {
        assert!((a - b).abs() <= 1e-5 * b.abs(), "loss {a} vs {b}");
    }
}

#[rstest]
#[case::sum_seed_0(0, LossKind::Sum)]
#[case::sum_seed_31337(31337, LossKind::Sum)]
#[case::mean_square_seed_2024(2024, LossKind::MeanSquare)]
#[case::mean_square_seed_7(7, LossKind::MeanSquare)]
fn test_batch_sharded_input_matches_single_device(#[case] seed: u64, #[case] loss: LossKind) {
    let config = RunConfig::default().with_seed(seed).with_steps(5).with_lr(0.01);
    let layout = TrainLayout::linear_2x2_batch_sharded().with_loss(loss);

    let single = train_single_device(&config, &layout).expect("single-device run");
    let sharded = train_sharded(&config, &layout).expect("sharded run");

    assert_allclose(&sharded.weight, &single.weight, 1e-5, 0.0);
    assert_allclose(&sharded.bias, &single.bias, 1e-5, 0.0);
}

#[test]
fn test_batch_sharded_3x2_mesh_matches_single_device() {
    let config = RunConfig::default().with_steps(3);
    let layout = TrainLayout::linear_2x2_batch_sharded().with_mesh(&[3, 2], &["x", "y"]);

    let single = train_single_device(&config, &layout).expect("single-device run");
    let sharded = train_sharded(&config, &layout).expect("sharded run");

    assert_allclose(&sharded.weight, &single.weight, 1e-5, 0.0);
    assert_allclose(&sharded.bias, &single.bias, 1e-5, 0.0);
}

#[test]
fn test_clipped_run_matches_within_tolerance() {
    let config = RunConfig::default().with_steps(3).with_max_grad_norm(Some(1.0));
    let layout = TrainLayout::linear_2x2();

    let single = train_single_device(&config, &layout).expect("single-device run");
    let sharded = train_sharded(&config, &layout).expect("sharded run");

    assert_allclose(&sharded.weight, &single.weight, 1e-4, 1e-6);
    assert_allclose(&sharded.bias, &single.bias, 1e-4, 1e-6);
    for (s, m) in sharded.metrics.iter().zip(&single.metrics) {
        let (a, b) = (s.grad_norm.expect("norm"), m.grad_norm.expect("norm"));
        assert!((a - b).abs() <= 1e-4 * b);
    }
}
