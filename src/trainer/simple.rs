//! Single-device training loop
//!
//! The reference run: one full [`Linear`] layer, the base optimizer used
//! directly, no communication.

use tracing::debug;

use crate::error::Result;
use crate::nn::{Linear, Module, loss_and_grad};
use crate::optimizer::clip_grad_norm;
use crate::trainer::config::{RunConfig, TrainLayout, TrainingMetrics};
use crate::trainer::context::RunContext;
use crate::trainer::TrainOutcome;

/// Train `layout`'s linear layer on one device for `config.steps` steps.
///
/// Per step: forward, loss, backward, optional clipping, optimizer step,
/// clear gradients.
pub fn train_single_device(config: &RunConfig, layout: &TrainLayout) -> Result<TrainOutcome> {
    let mut ctx = RunContext::new(config.clone())?;
    let (mut linear, batch) = init_run(&mut ctx, layout);
    let mut optimizer = config.build_optimizer()?;
    let global_count = layout.batch_size * layout.out_features;

    let mut metrics = Vec::with_capacity(config.steps);
    for step in 1..=config.steps as u64 {
        let output = linear.forward(&batch)?;
        let (loss, grad_output) = loss_and_grad(layout.loss, &output, global_count)?;
        linear.backward(&batch, &grad_output)?;

        let grad_norm = match config.max_grad_norm {
            Some(max_norm) => Some(clip_grad_norm(&mut linear.parameters_mut(), max_norm)?),
            None => None,
        };
        optimizer.step(&mut linear.parameters_mut())?;
        linear.clear_grad();

        debug!(step, loss, "single-device step");
        metrics.push(TrainingMetrics {
            step,
            loss,
            grad_norm,
            lr: optimizer.lr(),
        });
    }

    Ok(TrainOutcome {
        weight: linear.weight().value().clone(),
        bias: linear.bias().value().clone(),
        metrics,
    })
}

/// Initial layer and input batch, drawn from the run RNG in a fixed order
/// (weights first, then the batch) so every run with the same seed starts
/// from the same point.
pub(crate) fn init_run(ctx: &mut RunContext, layout: &TrainLayout) -> (Linear, crate::tensor::Tensor) {
    let linear = Linear::new(layout.in_features, layout.out_features, ctx.rng());
    let batch = ctx.random_tensor(&[layout.batch_size, layout.in_features]);
    (linear, batch)
}
