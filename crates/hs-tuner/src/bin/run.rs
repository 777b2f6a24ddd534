use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use hs_tuner::{init_logging, load_configs, run_study, CommandTrainer, RunOptions};
use tracing::info;

/// Run one hyperparameter optimization worker against the shared study.
#[derive(Parser)]
#[command(name = "hs-run")]
#[command(about = "Run one hyperparameter optimization worker", long_about = None)]
struct Cli {
    /// Hyperparameter optimization config
    hyper: PathBuf,

    /// Model config
    model: PathBuf,

    /// Attach to an existing study store
    #[arg(long)]
    reload: bool,

    /// Trials to run in this worker (overrides optuna.n_trials)
    #[arg(long)]
    n_trials: Option<usize>,

    /// Wall-clock budget in seconds (overrides optuna.timeout)
    #[arg(long)]
    timeout: Option<f64>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let configs = load_configs(&cli.hyper, &cli.model).context("Failed to load configuration files")?;
    init_logging(
        configs.hyper.log_path(),
        configs.hyper.optuna.reload || cli.reload,
    )?;

    let timeout = cli
        .timeout
        .map(Duration::try_from_secs_f64)
        .transpose()
        .context("--timeout must be a non-negative number of seconds")?;
    let options = RunOptions {
        reload: cli.reload,
        n_trials: cli.n_trials,
        timeout,
    };

    let trainer = CommandTrainer::from_config(&configs.hyper.optuna)?;
    let outcome = run_study(configs, trainer, options).context("Hyperparameter optimization failed")?;

    info!(
        "Finished {} trials on {} ({} complete, {} pruned, {} failed)",
        outcome.summary.total(),
        outcome.device,
        outcome.summary.completed,
        outcome.summary.pruned,
        outcome.summary.failed
    );
    if outcome.summary.timed_out {
        info!("Stopped early: wall-clock budget exhausted");
    }
    Ok(())
}
