//! Training routine run as an external command, one process per trial.
//!
//! The command receives the path of the trial's YAML config as its last
//! argument. It talks back on stdout with one JSON object per line:
//!
//! ```text
//! {"step": 3, "value": 0.41}               intermediate report
//! {"metrics": {"val_loss": 0.38, ...}}     final metrics
//! ```
//!
//! Anything else on stdout is passed through to the debug log.

use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;

use hs_data::Device;
use hs_optimizer::Trial;
use hs_types::{ConfigError, HsError, HsResult, TrialError};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::OptunaSection;
use crate::objective::{Metrics, Trainer};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ChildMessage {
    Report { step: u64, value: f64 },
    Final { metrics: Metrics },
}

fn parse_message(line: &str) -> Option<ChildMessage> {
    let line = line.trim();
    if !line.starts_with('{') {
        return None;
    }
    serde_json::from_str(line).ok()
}

fn is_out_of_memory(stderr: &str) -> bool {
    stderr.to_lowercase().contains("out of memory")
}

fn stop(child: &mut Child) {
    if let Err(e) = child.kill() {
        debug!("Could not kill training process {}: {}", child.id(), e);
    }
    let _ = child.wait();
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandTrainer {
    program: String,
    args: Vec<String>,
    save_path: PathBuf,
    metric: String,
}

impl CommandTrainer {
    pub fn new(command: &str, save_path: impl Into<PathBuf>, metric: impl Into<String>) -> HsResult<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or_else(|| ConfigError::MissingField {
            field: "optuna.objective".to_string(),
        })?;
        Ok(Self {
            program,
            args: parts.collect(),
            save_path: save_path.into(),
            metric: metric.into(),
        })
    }

    pub fn from_config(optuna: &OptunaSection) -> HsResult<Self> {
        let command = optuna.objective.as_deref().unwrap_or_default();
        Self::new(command, &optuna.save_path, &optuna.metric)
    }

    fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Trainer for CommandTrainer {
    fn train(&mut self, trial: &mut Trial<'_>, config: &Value, device: Device) -> HsResult<Metrics> {
        fs::create_dir_all(&self.save_path)?;
        let config_path = self.save_path.join(format!("trial_{}.yml", trial.number()));
        let yaml = serde_yaml::to_string(config)
            .map_err(|e| hs_types::internal_error!("could not serialize trial config: {e}"))?;
        fs::write(&config_path, yaml)?;

        info!("Running `{} {}`", self.command_line(), config_path.display());
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(&config_path)
            .env("HS_TRIAL_NUMBER", trial.number().to_string())
            .env("HS_DEVICE", device.to_string())
            .env("HS_METRIC", &self.metric)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| TrialError::Failed {
                message: format!("could not start `{}`: {e}", self.command_line()),
            })?;

        // drain stderr so the child never blocks on a full pipe
        let stderr_reader = child.stderr.take().map(|mut stderr| {
            thread::spawn(move || {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf);
                buf
            })
        });
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| hs_types::internal_error!("training process stdout was not captured"))?;

        let mut metrics = None;
        for line in BufReader::new(stdout).lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    stop(&mut child);
                    return Err(e.into());
                }
            };
            match parse_message(&line) {
                Some(ChildMessage::Report { step, value }) => {
                    let pruned = trial
                        .report(value, step)
                        .and_then(|_| trial.should_prune());
                    match pruned {
                        Ok(false) => {}
                        Ok(true) => {
                            stop(&mut child);
                            info!("Trial {} was pruned at step {}", trial.number(), step);
                            return Err(TrialError::Pruned { step: Some(step) }.into());
                        }
                        Err(e) => {
                            stop(&mut child);
                            return Err(e);
                        }
                    }
                }
                Some(ChildMessage::Final { metrics: m }) => metrics = Some(m),
                None => debug!("[trial {}] {}", trial.number(), line),
            }
        }

        let status = child.wait()?;
        let stderr = stderr_reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        if !status.success() {
            let message = format!(
                "`{}` exited with {}: {}",
                self.command_line(),
                status,
                stderr.trim().lines().last().unwrap_or("")
            );
            if is_out_of_memory(&stderr) {
                return Err(TrialError::ResourceExhausted { message }.into());
            }
            return Err(TrialError::Failed { message }.into());
        }

        metrics.ok_or_else(|| {
            HsError::from(TrialError::Failed {
                message: format!("`{}` printed no metrics", self.command_line()),
            })
        })
    }
}
