//! The per-trial objective: map suggestions, train, log the row.

use std::collections::BTreeMap;
use std::path::Path;

use hs_data::Device;
use hs_optimizer::Trial;
use hs_types::{HsResult, TrialError};
use serde_json::Value;
use tracing::{info, warn};

use crate::mapper;
use crate::results::ResultLog;

/// Final (or per-epoch) metrics keyed by name.
pub type Metrics = BTreeMap<String, f64>;

/// A training routine. Implementations report intermediate values to the
/// trial, check [`Trial::should_prune`], and return their final metrics.
///
/// Return [`TrialError::ResourceExhausted`] for out-of-memory failures; the
/// objective turns it into a pruned trial.
pub trait Trainer {
    fn train(&mut self, trial: &mut Trial<'_>, config: &Value, device: Device) -> HsResult<Metrics>;
}

impl<F> Trainer for F
where
    F: FnMut(&mut Trial<'_>, &Value, Device) -> HsResult<Metrics>,
{
    fn train(&mut self, trial: &mut Trial<'_>, config: &Value, device: Device) -> HsResult<Metrics> {
        self(trial, config, device)
    }
}

pub struct Objective<T> {
    config: Value,
    metric: String,
    device: Device,
    log: ResultLog,
    trainer: T,
}

impl<T: Trainer> Objective<T> {
    pub fn new(
        config: Value,
        metric: impl Into<String>,
        device: Device,
        save_path: &Path,
        trainer: T,
    ) -> HsResult<Self> {
        let metric = metric.into();
        let log = ResultLog::create(save_path)?;
        info!("Initialized an objective to be optimized with metric {}", metric);
        info!("Using device {}", device);
        Ok(Self {
            config,
            metric,
            device,
            log,
            trainer,
        })
    }

    pub fn metric(&self) -> &str {
        &self.metric
    }

    pub fn log(&self) -> &ResultLog {
        &self.log
    }

    /// Run one trial and return the value the study optimizes.
    pub fn evaluate(&mut self, trial: &mut Trial<'_>) -> HsResult<f64> {
        let conf = mapper::update_config(trial, &self.config)?;

        info!("Beginning to train the model using the latest suggested parameters");
        let metrics = match self.trainer.train(trial, &conf, self.device) {
            Ok(metrics) => metrics,
            Err(e) if e.is_resource_exhausted() => {
                warn!("{}; proceeding to prune the trial", e);
                return Err(TrialError::Pruned {
                    step: trial.record().last_step(),
                }
                .into());
            }
            Err(e) => return Err(e),
        };
        self.save(trial, &metrics)
    }

    /// Append the trial row to the worker log and return the tracked metric.
    pub fn save(&mut self, trial: &Trial<'_>, metrics: &Metrics) -> HsResult<f64> {
        let value = *metrics
            .get(&self.metric)
            .ok_or_else(|| TrialError::MissingMetric {
                metric: self.metric.clone(),
            })?;
        let best = trial.best_value()?.unwrap_or(value);
        self.log
            .record(trial.number(), trial.params(), metrics, &self.metric, best)?;
        Ok(value)
    }
}

/// Reports a monitored metric at the end of each epoch and stops
/// unpromising trials.
#[derive(Debug, Clone, PartialEq)]
pub struct PruningCallback {
    pub monitor: String,
    pub interval: u64,
}

impl PruningCallback {
    pub fn new(monitor: impl Into<String>, interval: u64) -> Self {
        Self {
            monitor: monitor.into(),
            interval: interval.max(1),
        }
    }

    pub fn on_epoch_end(&self, trial: &mut Trial<'_>, epoch: u64, logs: &Metrics) -> HsResult<()> {
        if epoch % self.interval.max(1) != 0 {
            return Ok(());
        }
        let Some(&score) = logs.get(&self.monitor) else {
            return Ok(());
        };
        trial.report(score, epoch)?;
        if trial.should_prune()? {
            info!("Trial was pruned at epoch {}", epoch);
            return Err(TrialError::Pruned { step: Some(epoch) }.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::ResultTable;
    use hs_optimizer::{Budget, MedianPruner, NopPruner, Pruner, RandomSampler, Study, StudyConfig};
    use hs_types::{HsError, TrialState};
    use serde_json::json;
    use tempfile::TempDir;

    fn study(dir: &TempDir, pruner: Box<dyn Pruner>) -> Study {
        Study::create(
            &StudyConfig::new("objective", dir.path().join("objective.db")),
            Box::new(RandomSampler::new(Some(3))),
            pruner,
        )
        .unwrap()
    }

    fn trainer<F>(f: F) -> F
    where
        F: FnMut(&mut Trial<'_>, &Value, Device) -> HsResult<Metrics>,
    {
        f
    }

    fn model() -> Value {
        json!({
            "model": {"units": 1},
            "optuna": {"parameters": {
                "model:units": {"type": "int", "settings": {"name": "units", "low": 1, "high": 64}}
            }}
        })
    }

    #[test]
    fn evaluate_trains_on_updated_config_and_logs_rows() {
        let dir = TempDir::new().unwrap();
        let mut study = study(&dir, Box::new(NopPruner));
        let trainer = trainer(|trial, config, device| {
            assert_eq!(device, Device::Cpu);
            let units = config["model"]["units"].as_f64().unwrap();
            assert_eq!(trial.params()["units"].as_f64(), Some(units));
            Ok(Metrics::from([
                ("val_loss".to_string(), units),
                ("accuracy".to_string(), 0.5),
            ]))
        });
        let mut objective = Objective::new(model(), "val_loss", Device::Cpu, dir.path(), trainer).unwrap();

        let summary = study
            .optimize(|trial| objective.evaluate(trial), Budget::trials(4))
            .unwrap();
        assert_eq!(summary.completed, 4);

        let table = ResultTable::read_csv(objective.log().path()).unwrap();
        assert_eq!(table.len(), 4);
        assert_eq!(
            table.columns,
            vec!["trial", "units", "accuracy", "val_loss", "best_val_loss"]
        );
        // the first row has no completed trial to compare against
        assert_eq!(table.cell(0, "best_val_loss"), table.cell(0, "val_loss"));
        let best: f64 = table.cell(3, "best_val_loss").unwrap().parse().unwrap();
        let earlier = (0..3)
            .map(|i| table.cell(i, "val_loss").unwrap().parse::<f64>().unwrap())
            .fold(f64::INFINITY, f64::min);
        assert_eq!(best, earlier);
    }

    #[test]
    fn resource_exhaustion_prunes_and_the_loop_continues() {
        let dir = TempDir::new().unwrap();
        let mut study = study(&dir, Box::new(NopPruner));
        let trainer = trainer(|trial, _, _| {
            if trial.number() == 1 {
                trial.report(0.7, 2)?;
                return Err(TrialError::ResourceExhausted {
                    message: "CUDA out of memory".to_string(),
                }
                .into());
            }
            Ok(Metrics::from([("val_loss".to_string(), 1.0)]))
        });
        let mut objective = Objective::new(model(), "val_loss", Device::Cpu, dir.path(), trainer).unwrap();
        let summary = study
            .optimize(|trial| objective.evaluate(trial), Budget::trials(3))
            .unwrap();
        assert_eq!((summary.completed, summary.pruned), (2, 1));

        let pruned = study.trials_in_state(TrialState::Pruned).unwrap();
        assert_eq!(pruned[0].number, 1);
        assert_eq!(pruned[0].value, Some(0.7));
    }

    #[test]
    fn missing_metric_fails_the_trial() {
        let dir = TempDir::new().unwrap();
        let mut study = study(&dir, Box::new(NopPruner));
        let trainer = trainer(|_, _, _| Ok(Metrics::from([("loss".to_string(), 1.0)])));
        let mut objective = Objective::new(model(), "val_loss", Device::Cpu, dir.path(), trainer).unwrap();
        let err = study
            .optimize(|trial| objective.evaluate(trial), Budget::trials(3))
            .unwrap_err();
        assert!(matches!(err, HsError::Trial(TrialError::MissingMetric { .. })));
        assert_eq!(study.trials_in_state(TrialState::Fail).unwrap().len(), 1);
    }

    #[test]
    fn callback_reports_on_interval_and_prunes() {
        let dir = TempDir::new().unwrap();
        let pruner = MedianPruner {
            n_startup_trials: 1,
            n_warmup_steps: 0,
            interval_steps: 1,
        };
        let mut study = study(&dir, Box::new(pruner));
        let callback = PruningCallback::new("val_loss", 2);

        // one good completed trial
        study
            .optimize(
                |trial| {
                    for epoch in 0..4 {
                        let logs = Metrics::from([("val_loss".to_string(), 0.1)]);
                        callback.on_epoch_end(trial, epoch, &logs)?;
                    }
                    Ok(0.1)
                },
                Budget::trials(1),
            )
            .unwrap();
        let done = study.trials().unwrap();
        assert_eq!(done[0].intermediate_values.keys().copied().collect::<Vec<_>>(), vec![0, 2]);

        let mut trial = study.ask().unwrap();
        let quiet = Metrics::from([("accuracy".to_string(), 0.2)]);
        callback.on_epoch_end(&mut trial, 0, &quiet).unwrap();
        assert!(trial.record().intermediate_values.is_empty());

        let bad = Metrics::from([("val_loss".to_string(), 5.0)]);
        callback.on_epoch_end(&mut trial, 1, &bad).unwrap();
        let err = callback.on_epoch_end(&mut trial, 2, &bad).unwrap_err();
        assert!(err.is_pruned());
    }
}
