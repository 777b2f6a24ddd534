//! # hs-tuner
//!
//! Drives hyperparameter sweeps on top of `hs-optimizer`: loads the
//! hyperparameter and model configs, maps trial suggestions into the model
//! config, runs the training routine, keeps per-worker CSV logs, launches
//! SLURM workers and reports on shared studies.

pub mod command;
pub mod config;
pub mod driver;
pub mod logging;
pub mod mapper;
pub mod objective;
pub mod report;
pub mod results;
pub mod scheduler;

#[cfg(test)]
mod testing;

pub use command::CommandTrainer;
pub use config::{load_configs, Configs, HyperConfig, LogSection, OptunaSection, SlurmSection};
pub use driver::{open_study, run_study, RunOptions, RunOutcome};
pub use logging::init_logging;
pub use mapper::{set_path, suggest_named, trial_suggest, update_config};
pub use objective::{Metrics, Objective, PruningCallback, Trainer};
pub use report::{report_study, trials_table, StudyReport};
pub use results::{aggregate_logs, AggregatedResults, ResultLog, ResultTable};
pub use scheduler::{launch, parse_job_id, render_script, BatchScheduler, LaunchReport, Sbatch};
