//! Study creation and the worker loop behind `hs-run`.

use std::fs;
use std::time::Duration;

use hs_data::{select_device, Device};
use hs_optimizer::{Budget, OptimizeSummary, Study};
use hs_types::HsResult;
use serde_json::Value;
use tracing::info;

use crate::config::{Configs, HyperConfig};
use crate::objective::{Objective, Trainer};
use crate::results::{aggregate_logs, AggregatedResults};

/// Command-line overrides for one worker.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunOptions {
    /// Reuse the study store even when the config says not to.
    pub reload: bool,
    pub n_trials: Option<usize>,
    pub timeout: Option<Duration>,
}

/// What one worker did.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub device: Device,
    pub summary: OptimizeSummary,
    pub results: AggregatedResults,
}

/// Create the configured study, or attach to it when `reload` is set.
pub fn open_study(hyper: &HyperConfig, reload: bool) -> HsResult<Study> {
    let optuna = &hyper.optuna;
    fs::create_dir_all(&optuna.save_path)?;
    let space = optuna.search_space()?;
    let sampler = optuna.sampler(&space)?;
    let pruner = optuna.pruner()?;
    info!(
        "Using sampler {} and pruner {}",
        sampler.name(),
        pruner.name()
    );
    Study::create(&optuna.study_config(reload)?, sampler, pruner)
}

/// Run one worker's share of the sweep, then aggregate every worker's log.
pub fn run_study<T: Trainer>(configs: Configs, trainer: T, options: RunOptions) -> HsResult<RunOutcome> {
    let Configs { hyper, model } = configs;
    run_with_model(&hyper, model, trainer, options)
}

fn run_with_model<T: Trainer>(
    hyper: &HyperConfig,
    model: Value,
    trainer: T,
    options: RunOptions,
) -> HsResult<RunOutcome> {
    let optuna = &hyper.optuna;
    let direction = optuna.direction()?;
    info!("Saving optimization details to {}", optuna.save_path.display());
    info!("Direction of optimization {}", direction);
    info!("Using metric {}", optuna.metric);

    let device = select_device(optuna.gpu)?;
    info!("Using device {}", device);

    let mut study = open_study(hyper, optuna.reload || options.reload)?;
    let mut objective = Objective::new(model, &optuna.metric, device, &optuna.save_path, trainer)?;

    let n_trials = options.n_trials.unwrap_or(optuna.n_trials);
    let timeout = options.timeout.or(optuna.timeout()?);
    info!("Running optimization for {} trials", n_trials);
    let budget = Budget::trials(n_trials).with_timeout(timeout);
    let summary = study.optimize(|trial| objective.evaluate(trial), budget)?;
    info!(
        "Worker finished: {} complete, {} pruned, {} failed",
        summary.completed, summary.pruned, summary.failed
    );

    let results = aggregate_logs(&optuna.save_path, &optuna.metric, study.direction())?;
    Ok(RunOutcome {
        device,
        summary,
        results,
    })
}
