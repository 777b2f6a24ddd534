//! Study creation/reload and the optimize loop.

use chrono::{DateTime, Utc};
use hs_types::{Direction, HsResult, ParamValue, StudyError, TrialState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::ParamRegistry;
use crate::pruners::{MedianPruner, Pruner};
use crate::samplers::{Sampler, TpeSampler};
use crate::storage::{StudyId, StudyStorage, TrialId};
use crate::trial::{FrozenTrial, Trial};

/// Where a study lives and how it is opened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyConfig {
    pub name: String,
    /// Database file holding the study.
    pub storage_path: PathBuf,
    pub direction: Direction,
    /// Reuse an existing store instead of refusing to touch it.
    pub reload: bool,
}

impl StudyConfig {
    pub fn new(name: impl Into<String>, storage_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            storage_path: storage_path.into(),
            direction: Direction::Minimize,
            reload: false,
        }
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_reload(mut self, reload: bool) -> Self {
        self.reload = reload;
        self
    }
}

/// Stopping rule for [`Study::optimize`]; whichever bound is hit first wins.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Budget {
    pub n_trials: Option<usize>,
    pub timeout: Option<Duration>,
}

impl Budget {
    pub fn trials(n: usize) -> Self {
        Self {
            n_trials: Some(n),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// What one call to [`Study::optimize`] did in this process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizeSummary {
    pub completed: usize,
    pub pruned: usize,
    pub failed: usize,
    pub timed_out: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl OptimizeSummary {
    pub fn total(&self) -> usize {
        self.completed + self.pruned + self.failed
    }
}

/// A named, durable collection of trials with a fixed direction.
pub struct Study {
    name: String,
    study_id: StudyId,
    direction: Direction,
    worker_id: String,
    pub(crate) storage: StudyStorage,
    pub(crate) sampler: Box<dyn Sampler>,
    pub(crate) pruner: Box<dyn Pruner>,
    pub(crate) registry: ParamRegistry,
}

impl Study {
    /// Create the study, or attach to it when `config.reload` is set.
    ///
    /// Without reload an existing store file is an error and is left untouched.
    pub fn create(
        config: &StudyConfig,
        sampler: Box<dyn Sampler>,
        pruner: Box<dyn Pruner>,
    ) -> HsResult<Self> {
        let path = &config.storage_path;
        if !config.reload && path.exists() {
            return Err(StudyError::AlreadyExists {
                path: path.display().to_string(),
            }
            .into());
        }

        let storage = StudyStorage::open(path)?;
        let (study_id, direction) = match storage.find_study(&config.name)? {
            Some((id, stored)) => {
                if stored != config.direction {
                    warn!(
                        "Study {} was created to {}; ignoring configured direction {}",
                        config.name, stored, config.direction
                    );
                }
                info!("Loaded study {} located at {}", config.name, path.display());
                (id, stored)
            }
            None => {
                let id = match storage.create_study(&config.name, config.direction) {
                    Ok(id) => id,
                    // another worker won the race to create it
                    Err(e) if config.reload => match storage.find_study(&config.name)? {
                        Some((id, _)) => id,
                        None => return Err(e),
                    },
                    Err(e) => return Err(e),
                };
                info!("Created study {} located at {}", config.name, path.display());
                (id, config.direction)
            }
        };

        Ok(Self::from_parts(config.name.clone(), study_id, direction, storage, sampler, pruner))
    }

    /// Open an existing study for reading; never creates a store.
    pub fn load(
        path: impl AsRef<Path>,
        name: &str,
        sampler: Box<dyn Sampler>,
        pruner: Box<dyn Pruner>,
    ) -> HsResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(StudyError::NotFound {
                name: format!("{name} ({})", path.display()),
            }
            .into());
        }
        let storage = StudyStorage::open(path)?;
        let (study_id, direction) =
            storage
                .find_study(name)?
                .ok_or_else(|| StudyError::NotFound {
                    name: name.to_string(),
                })?;
        Ok(Self::from_parts(name.to_string(), study_id, direction, storage, sampler, pruner))
    }

    /// Open an existing study with the default sampler and pruner.
    pub fn load_default(path: impl AsRef<Path>, name: &str) -> HsResult<Self> {
        Self::load(
            path,
            name,
            Box::new(TpeSampler::default()),
            Box::new(MedianPruner::default()),
        )
    }

    fn from_parts(
        name: String,
        study_id: StudyId,
        direction: Direction,
        storage: StudyStorage,
        sampler: Box<dyn Sampler>,
        pruner: Box<dyn Pruner>,
    ) -> Self {
        Self {
            name,
            study_id,
            direction,
            worker_id: Uuid::new_v4().to_string(),
            storage,
            sampler,
            pruner,
            registry: ParamRegistry::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn storage_path(&self) -> &Path {
        self.storage.path()
    }

    pub fn trials(&self) -> HsResult<Vec<FrozenTrial>> {
        self.storage.trials(self.study_id)
    }

    pub fn trials_in_state(&self, state: TrialState) -> HsResult<Vec<FrozenTrial>> {
        Ok(self
            .trials()?
            .into_iter()
            .filter(|t| t.state == state)
            .collect())
    }

    /// Best completed trial according to the study direction.
    pub fn best_trial(&self) -> HsResult<Option<FrozenTrial>> {
        let mut best: Option<FrozenTrial> = None;
        for trial in self.trials_in_state(TrialState::Complete)? {
            let Some(value) = trial.value else { continue };
            let improves = match best.as_ref().and_then(|b| b.value) {
                None => true,
                Some(incumbent) => self.direction.is_better(value, incumbent),
            };
            if improves {
                best = Some(trial);
            }
        }
        Ok(best)
    }

    pub fn best_value(&self) -> HsResult<Option<f64>> {
        Ok(self.best_trial()?.and_then(|t| t.value))
    }

    pub fn best_params(&self) -> HsResult<Option<BTreeMap<String, ParamValue>>> {
        Ok(self.best_trial()?.map(|t| t.params))
    }

    /// Start a new trial.
    ///
    /// Every finished trial in the store, from any worker, is replayed into
    /// a fresh engine study before the new trial is drawn from it.
    pub fn ask(&mut self) -> HsResult<Trial<'_>> {
        let (trial_id, number) = self.storage.create_trial(self.study_id, &self.worker_id)?;
        let history: Vec<FrozenTrial> = self
            .trials()?
            .into_iter()
            .filter(|t| t.trial_id != trial_id)
            .collect();

        let mut engine = self.sampler.engine(self.direction, number)?;
        self.pruner.install(&mut engine, self.direction);
        let replayed = self.registry.replay(&engine, &history);
        tracing::debug!("Trial {} drawn after replaying {} trials", number, replayed);
        let fixed = self.sampler.fixed_params(&history)?;
        let engine_trial = engine.ask();

        let record = FrozenTrial {
            trial_id,
            number,
            state: TrialState::Running,
            value: None,
            params: BTreeMap::new(),
            distributions: BTreeMap::new(),
            intermediate_values: BTreeMap::new(),
            datetime_start: Utc::now(),
            datetime_complete: None,
            worker_id: Some(self.worker_id.clone()),
        };
        Ok(Trial::new(self, record, fixed, engine_trial))
    }

    /// Finish a trial started with [`Study::ask`].
    pub fn tell(&mut self, trial_id: TrialId, state: TrialState, value: Option<f64>) -> HsResult<()> {
        self.storage.finish_trial(trial_id, state, value)
    }

    /// Run `objective` until the budget is spent.
    ///
    /// A pruned error marks the trial pruned and the loop moves on; a NaN or
    /// infinite value marks it failed and the loop moves on; any other error
    /// marks it failed and is returned.
    pub fn optimize<F>(&mut self, mut objective: F, budget: Budget) -> HsResult<OptimizeSummary>
    where
        F: FnMut(&mut Trial<'_>) -> HsResult<f64>,
    {
        let started = Instant::now();
        let mut summary = OptimizeSummary {
            started_at: Some(Utc::now()),
            ..OptimizeSummary::default()
        };

        loop {
            if let Some(n) = budget.n_trials {
                if summary.total() >= n {
                    break;
                }
            }
            if let Some(timeout) = budget.timeout {
                if started.elapsed() >= timeout {
                    info!("Wall-clock budget of {:?} exhausted", timeout);
                    summary.timed_out = true;
                    break;
                }
            }

            let (trial_id, number, last_value, outcome) = {
                let mut trial = self.ask()?;
                let outcome = objective(&mut trial);
                (
                    trial.id(),
                    trial.number(),
                    trial.last_intermediate_value(),
                    outcome,
                )
            };

            match outcome {
                Ok(value) if !value.is_finite() => {
                    warn!("Trial {} returned {}; marking it failed", number, value);
                    self.tell(trial_id, TrialState::Fail, None)?;
                    summary.failed += 1;
                }
                Ok(value) => {
                    self.tell(trial_id, TrialState::Complete, Some(value))?;
                    summary.completed += 1;
                    info!("Trial {} finished with value {}", number, value);
                }
                Err(e) if e.is_pruned() => {
                    self.tell(trial_id, TrialState::Pruned, last_value)?;
                    summary.pruned += 1;
                    info!("Trial {} pruned", number);
                }
                Err(e) => {
                    self.tell(trial_id, TrialState::Fail, None)?;
                    summary.failed += 1;
                    summary.finished_at = Some(Utc::now());
                    tracing::error!("Trial {} failed: {}", number, e);
                    return Err(e);
                }
            }
        }

        summary.finished_at = Some(Utc::now());
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::Distribution;
    use crate::pruners::NopPruner;
    use crate::samplers::RandomSampler;
    use hs_types::{HsError, TrialError};
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> StudyConfig {
        StudyConfig::new("test_study", dir.path().join("test_study"))
            .with_direction(Direction::Minimize)
    }

    fn create(config: &StudyConfig) -> HsResult<Study> {
        Study::create(
            config,
            Box::new(RandomSampler::new(Some(42))),
            Box::new(NopPruner),
        )
    }

    #[test]
    fn study_creation_requires_reload_for_existing_store() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        {
            let mut study = create(&config).unwrap();
            study
                .optimize(|trial| trial.suggest_uniform("x", 0.0, 1.0), Budget::trials(2))
                .unwrap();
        }
        let before = std::fs::read(&config.storage_path).unwrap();

        let err = create(&config).err().unwrap();
        assert!(matches!(err, HsError::Study(StudyError::AlreadyExists { .. })));
        assert_eq!(std::fs::read(&config.storage_path).unwrap(), before);

        let reloaded = create(&config.clone().with_reload(true)).unwrap();
        assert_eq!(reloaded.trials().unwrap().len(), 2);
    }

    #[test]
    fn reload_creates_missing_store() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir).with_reload(true);
        let study = create(&config).unwrap();
        assert!(study.trials().unwrap().is_empty());
        assert!(config.storage_path.exists());
    }

    #[test]
    fn optimize_tracks_best_trial() {
        let dir = TempDir::new().unwrap();
        let mut study = create(&config(&dir)).unwrap();
        let summary = study
            .optimize(
                |trial| {
                    let x = trial.suggest_uniform("x", -2.0, 2.0)?;
                    Ok((x - 0.5).powi(2))
                },
                Budget::trials(20),
            )
            .unwrap();
        assert_eq!(summary.completed, 20);
        assert!(!summary.timed_out);

        let trials = study.trials().unwrap();
        assert_eq!(trials.len(), 20);
        let expected = trials
            .iter()
            .filter_map(|t| t.value)
            .fold(f64::INFINITY, f64::min);
        assert_eq!(study.best_value().unwrap(), Some(expected));
        assert!(study.best_params().unwrap().unwrap().contains_key("x"));
    }

    #[test]
    fn pruned_and_nan_trials_do_not_stop_the_loop() {
        let dir = TempDir::new().unwrap();
        let mut study = create(&config(&dir)).unwrap();
        let summary = study
            .optimize(
                |trial| match trial.number() % 3 {
                    0 => {
                        trial.report(0.9, 1)?;
                        Err(TrialError::Pruned { step: Some(1) }.into())
                    }
                    1 => Ok(f64::NAN),
                    _ => Ok(1.0),
                },
                Budget::trials(6),
            )
            .unwrap();
        assert_eq!((summary.pruned, summary.failed, summary.completed), (2, 2, 2));

        let pruned = study.trials_in_state(TrialState::Pruned).unwrap();
        assert_eq!(pruned.len(), 2);
        assert_eq!(pruned[0].value, Some(0.9));
    }

    #[test]
    fn infinite_values_fail_the_trial() {
        let dir = TempDir::new().unwrap();
        let mut study = create(&config(&dir)).unwrap();
        let summary = study
            .optimize(
                |trial| match trial.number() {
                    0 => Ok(f64::NEG_INFINITY),
                    1 => Ok(f64::INFINITY),
                    _ => Ok(2.0),
                },
                Budget::trials(3),
            )
            .unwrap();
        assert_eq!((summary.failed, summary.completed), (2, 1));
        assert_eq!(study.trials_in_state(TrialState::Fail).unwrap().len(), 2);
        assert_eq!(study.best_value().unwrap(), Some(2.0));
    }

    #[test]
    fn tpe_engine_learns_from_the_store() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let mut study = Study::create(
            &config,
            Box::new(TpeSampler {
                seed: Some(7),
                n_startup_trials: 5,
            }),
            Box::new(NopPruner),
        )
        .unwrap();
        let objective = |trial: &mut Trial<'_>| -> HsResult<f64> {
            let x = trial.suggest_uniform("x", -5.0, 5.0)?;
            let act = trial.suggest_categorical("act", vec!["relu".into(), "tanh".into()])?;
            let penalty = if act == "tanh" { 0.0 } else { 1.0 };
            Ok((x - 1.0).powi(2) + penalty)
        };
        study.optimize(objective, Budget::trials(15)).unwrap();

        // a second worker on the same file continues from all 15 trials
        let mut other = Study::create(
            &config.clone().with_reload(true),
            Box::new(TpeSampler::default()),
            Box::new(NopPruner),
        )
        .unwrap();
        other.optimize(objective, Budget::trials(15)).unwrap();
        let trials = other.trials().unwrap();
        assert_eq!(trials.len(), 30);
        assert!(trials.iter().all(|t| t.params["x"].as_f64().map_or(false, |x| (-5.0..=5.0).contains(&x))));
        assert!(other.best_value().unwrap().unwrap() < 4.0);
    }

    #[test]
    fn median_pruner_stops_worse_trials() {
        let dir = TempDir::new().unwrap();
        let mut study = Study::create(
            &config(&dir),
            Box::new(RandomSampler::new(Some(1))),
            Box::new(MedianPruner {
                n_startup_trials: 1,
                n_warmup_steps: 0,
                interval_steps: 1,
            }),
        )
        .unwrap();
        study
            .optimize(
                |trial| {
                    for step in 0..3 {
                        trial.report(0.1, step)?;
                    }
                    Ok(0.1)
                },
                Budget::trials(2),
            )
            .unwrap();

        {
            let mut good = study.ask().unwrap();
            good.report(0.05, 0).unwrap();
            assert!(!good.should_prune().unwrap());
        }
        let mut bad = study.ask().unwrap();
        bad.report(5.0, 1).unwrap();
        assert!(bad.should_prune().unwrap());
    }

    #[test]
    fn grid_points_are_shared_between_workers() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir).with_reload(true);
        let space = crate::SearchSpace::new().add_int("a", 0, 1).add_int("b", 0, 2);
        let grid = || crate::GridSampler::from_search_space(&space, 5, Some(0)).unwrap();
        let mut first = Study::create(&config, Box::new(grid()), Box::new(NopPruner)).unwrap();
        let mut second = Study::create(&config, Box::new(grid()), Box::new(NopPruner)).unwrap();

        let objective = |trial: &mut Trial<'_>| -> HsResult<f64> {
            let a = trial.suggest_int("a", 0, 1)?;
            let b = trial.suggest_int("b", 0, 2)?;
            let extra = trial.suggest_uniform("dropout", 0.0, 0.5)?;
            assert!((0.0..=0.5).contains(&extra));
            Ok((a * 3 + b) as f64)
        };
        for _ in 0..3 {
            first.optimize(objective, Budget::trials(1)).unwrap();
            second.optimize(objective, Budget::trials(1)).unwrap();
        }
        let mut seen: Vec<f64> = first
            .trials()
            .unwrap()
            .iter()
            .filter_map(|t| t.value)
            .collect();
        seen.sort_by(f64::total_cmp);
        assert_eq!(seen, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn other_errors_fail_the_trial_and_propagate() {
        let dir = TempDir::new().unwrap();
        let mut study = create(&config(&dir)).unwrap();
        let result = study.optimize(
            |_| {
                Err(TrialError::Failed {
                    message: "boom".into(),
                }
                .into())
            },
            Budget::trials(5),
        );
        assert!(result.is_err());
        let trials = study.trials().unwrap();
        assert_eq!(trials.len(), 1);
        assert_eq!(trials[0].state, TrialState::Fail);
    }

    #[test]
    fn timeout_stops_the_loop() {
        let dir = TempDir::new().unwrap();
        let mut study = create(&config(&dir)).unwrap();
        let summary = study
            .optimize(|_| Ok(1.0), Budget::default().with_timeout(Some(Duration::ZERO)))
            .unwrap();
        assert!(summary.timed_out);
        assert_eq!(summary.total(), 0);
    }

    #[test]
    fn repeated_suggestions_are_stable() {
        let dir = TempDir::new().unwrap();
        let mut study = create(&config(&dir)).unwrap();
        let mut trial = study.ask().unwrap();
        let a = trial.suggest_int("units", 1, 100).unwrap();
        let b = trial.suggest_int("units", 1, 100).unwrap();
        assert_eq!(a, b);
        assert!(matches!(
            trial.suggest("units", &Distribution::int(1, 5)),
            Err(HsError::Trial(TrialError::DistributionMismatch { .. }))
        ));
    }

    #[test]
    fn load_requires_existing_study() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        assert!(Study::load_default(&config.storage_path, &config.name).is_err());
        drop(create(&config).unwrap());
        let study = Study::load_default(&config.storage_path, &config.name).unwrap();
        assert_eq!(study.direction(), Direction::Minimize);
        assert!(Study::load_default(&config.storage_path, "other").is_err());
    }
}
