//! SLURM launch scripts and job submission for distributed sweeps.
//!
//! Every submitted job runs one `hs-run ... --reload` worker against the
//! shared study store.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use hs_types::{ConfigError, HsError, HsResult, LaunchError};
use tracing::info;

use crate::config::{HyperConfig, SlurmSection};
use crate::driver::open_study;

const DEFAULT_WORKER_COMMAND: &str = "hs-run";

/// Something that accepts batch scripts and hands back job ids.
pub trait BatchScheduler {
    fn submit(&mut self, script: &Path) -> HsResult<String>;
}

/// Submits through the `sbatch` command line.
#[derive(Debug, Clone, PartialEq)]
pub struct Sbatch {
    pub program: String,
}

impl Default for Sbatch {
    fn default() -> Self {
        Self {
            program: "sbatch".to_string(),
        }
    }
}

impl BatchScheduler for Sbatch {
    fn submit(&mut self, script: &Path) -> HsResult<String> {
        let command = format!("{} {}", self.program, script.display());
        let output = Command::new(&self.program)
            .arg(script)
            .output()
            .map_err(|e| LaunchError::SubmissionFailed {
                command: command.clone(),
                message: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(LaunchError::SubmissionFailed {
                command,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into());
        }
        parse_job_id(&String::from_utf8_lossy(&output.stdout))
    }
}

/// `Submitted batch job 123456` -> `123456`.
pub fn parse_job_id(output: &str) -> HsResult<String> {
    output
        .split_whitespace()
        .last()
        .map(str::to_string)
        .ok_or_else(|| {
            HsError::from(LaunchError::MissingJobId {
                output: output.to_string(),
            })
        })
}

fn scalar(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Null => String::new(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
    }
}

/// Lines of the batch script for one worker.
pub fn render_script(slurm: &SlurmSection, hyper_path: &Path, model_path: &Path) -> Vec<String> {
    let mut lines = vec!["#!/bin/bash -l".to_string()];
    for (key, value) in &slurm.batch {
        let key = scalar(key);
        let value = scalar(value);
        if key.chars().count() == 1 {
            lines.push(format!("#SBATCH -{key} {value}"));
        } else {
            lines.push(format!("#SBATCH --{key}={value}"));
        }
    }
    lines.extend(slurm.environment.iter().cloned());
    lines.push(format!(
        "{} {} {} --reload",
        slurm.command.as_deref().unwrap_or(DEFAULT_WORKER_COMMAND),
        hyper_path.display(),
        model_path.display()
    ));
    lines
}

/// Directory holding `launch.sh` and `job_ids.txt`: next to the log file when
/// one is configured, else the study's save directory.
pub fn launch_dir(hyper: &HyperConfig) -> PathBuf {
    match hyper.log_path().and_then(Path::parent) {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        Some(_) => PathBuf::from("."),
        None => hyper.optuna.save_path.clone(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LaunchReport {
    pub script: PathBuf,
    pub job_ids: Vec<String>,
}

/// Create the study (unless reloading), write the launch script and submit
/// `slurm.jobs` workers.
pub fn launch<S: BatchScheduler>(
    hyper: &HyperConfig,
    hyper_path: &Path,
    model_path: &Path,
    scheduler: &mut S,
) -> HsResult<LaunchReport> {
    let slurm = hyper.slurm.as_ref().ok_or_else(|| ConfigError::MissingField {
        field: "slurm".to_string(),
    })?;

    if !hyper.optuna.reload {
        let study = open_study(hyper, false)?;
        info!(
            "Created study {} at {}",
            study.name(),
            study.storage_path().display()
        );
    }

    let dir = launch_dir(hyper);
    fs::create_dir_all(&dir)?;
    let script = dir.join("launch.sh");
    let mut body = render_script(slurm, hyper_path, model_path).join("\n");
    body.push('\n');
    fs::write(&script, body)?;
    info!("Wrote launch script to {}", script.display());

    let mut job_ids = Vec::with_capacity(slurm.jobs);
    for worker in 0..slurm.jobs {
        let job_id = scheduler.submit(&script)?;
        info!("Submitted worker {} as job {}", worker, job_id);
        job_ids.push(job_id);
    }

    let ids_path = dir.join("job_ids.txt");
    let mut ids = job_ids.join("\n");
    ids.push('\n');
    fs::write(&ids_path, ids)?;
    info!("Saved {} job ids to {}", job_ids.len(), ids_path.display());

    Ok(LaunchReport { script, job_ids })
}
