use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use hs_tuner::{init_logging, report_study, HyperConfig};

#[derive(Parser)]
#[command(name = "hs-report")]
#[command(about = "Summarize a hyperparameter optimization study", long_about = None)]
struct Cli {
    /// Hyperparameter optimization config
    hyper: PathBuf,
}

fn main() -> Result<()> {
    init_logging(None, false)?;
    let cli = Cli::parse();

    let hyper = HyperConfig::from_file(&cli.hyper).context("Failed to load configuration file")?;
    report_study(&hyper).with_context(|| format!("Failed to report on study {}", hyper.optuna.name))?;
    Ok(())
}
