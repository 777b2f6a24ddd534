use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use hs_tuner::{init_logging, launch, load_configs, Sbatch};
use tracing::info;

#[derive(Parser)]
#[command(name = "hs-launch")]
#[command(about = "Create a study and submit SLURM workers for it", long_about = None)]
struct Cli {
    /// Hyperparameter optimization config
    hyper: PathBuf,

    /// Model config
    model: PathBuf,

    /// Submission command
    #[arg(long, default_value = "sbatch")]
    sbatch: String,
}

fn main() -> Result<()> {
    init_logging(None, false)?;
    let cli = Cli::parse();

    let configs = load_configs(&cli.hyper, &cli.model).context("Failed to load configuration files")?;
    let mut scheduler = Sbatch { program: cli.sbatch };
    let report = launch(&configs.hyper, &cli.hyper, &cli.model, &mut scheduler)
        .context("Failed to launch workers")?;

    info!(
        "Submitted {} workers with {}: {}",
        report.job_ids.len(),
        report.script.display(),
        report.job_ids.join(" ")
    );
    Ok(())
}
