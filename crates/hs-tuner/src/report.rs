//! Summaries of a shared study store, behind `hs-report`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use hs_optimizer::{FrozenTrial, Study};
use hs_types::{HsResult, ParamValue, TrialState};
use tracing::{info, warn};

use crate::config::HyperConfig;
use crate::results::ResultTable;

#[derive(Debug, Clone, PartialEq)]
pub struct StudyReport {
    pub n_trials: usize,
    pub n_pruned: usize,
    pub n_complete: usize,
    pub best_value: Option<f64>,
    pub best_params: BTreeMap<String, ParamValue>,
    /// Share of the objective's variance explained by each parameter, largest first.
    pub importances: Vec<(String, f64)>,
    /// Fewer trials than requested, usually because workers hit their wall time.
    pub unfinished: bool,
    /// The trials table, written only when some trial completed.
    pub csv_path: Option<PathBuf>,
}

fn timestamp(t: chrono::DateTime<chrono::Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

fn format_duration(d: chrono::Duration) -> String {
    let micros = d.num_microseconds().unwrap_or(i64::MAX);
    format!("{}.{:06}", micros / 1_000_000, micros % 1_000_000)
}

/// One row per trial: `number, value, datetime_start, datetime_complete,
/// duration, params_<name>..., state`.
pub fn trials_table(trials: &[FrozenTrial]) -> ResultTable {
    let params: BTreeSet<&String> = trials.iter().flat_map(|t| t.params.keys()).collect();

    let mut table = ResultTable::new();
    table.columns = ["number", "value", "datetime_start", "datetime_complete", "duration"]
        .into_iter()
        .map(str::to_string)
        .chain(params.iter().map(|p| format!("params_{p}")))
        .chain(std::iter::once("state".to_string()))
        .collect();

    for trial in trials {
        let mut row = vec![
            ("number".to_string(), trial.number.to_string()),
            ("datetime_start".to_string(), timestamp(trial.datetime_start)),
            ("state".to_string(), trial.state.to_string()),
        ];
        if let Some(value) = trial.value {
            row.push(("value".to_string(), value.to_string()));
        }
        if let Some(end) = trial.datetime_complete {
            row.push(("datetime_complete".to_string(), timestamp(end)));
        }
        if let Some(duration) = trial.duration() {
            row.push(("duration".to_string(), format_duration(duration)));
        }
        row.extend(
            trial
                .params
                .iter()
                .map(|(name, value)| (format!("params_{name}"), value.to_string())),
        );
        table.push_row(row);
    }
    table
}

fn variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64
}

/// Fraction of `total` variance explained by the group means.
fn explained_variance(groups: &[Vec<f64>], total: f64) -> f64 {
    let all: Vec<f64> = groups.iter().flatten().copied().collect();
    if all.len() < 2 || total <= 0.0 {
        return 0.0;
    }
    let mean = all.iter().sum::<f64>() / all.len() as f64;
    let between = groups
        .iter()
        .filter(|g| !g.is_empty())
        .map(|g| {
            let group_mean = g.iter().sum::<f64>() / g.len() as f64;
            g.len() as f64 * (group_mean - mean).powi(2)
        })
        .sum::<f64>()
        / all.len() as f64;
    (between / total).clamp(0.0, 1.0)
}

/// Rough per-parameter importance over completed trials.
///
/// Numeric parameters are cut into equal-count bins by rank, choices group by
/// value, and each parameter scores the variance its groups explain. Scores
/// are normalized to sum to one when any is positive.
pub fn param_importances(trials: &[FrozenTrial]) -> Vec<(String, f64)> {
    let done: Vec<&FrozenTrial> = trials
        .iter()
        .filter(|t| t.state == TrialState::Complete && t.value.is_some_and(f64::is_finite))
        .collect();
    let names: BTreeSet<&String> = done.iter().flat_map(|t| t.params.keys()).collect();

    let mut scores: Vec<(String, f64)> = names
        .into_iter()
        .map(|name| {
            let mut points: Vec<(&ParamValue, f64)> = done
                .iter()
                .filter_map(|t| Some((t.params.get(name)?, t.value?)))
                .collect();
            let values: Vec<f64> = points.iter().map(|(_, v)| *v).collect();
            let total = variance(&values);

            let groups: Vec<Vec<f64>> = if points.iter().all(|(p, _)| p.as_f64().is_some()) {
                points.sort_by(|a, b| a.0.as_f64().partial_cmp(&b.0.as_f64()).unwrap_or(std::cmp::Ordering::Equal));
                let bins = (points.len() as f64).sqrt().ceil().max(1.0) as usize;
                let per_bin = points.len().div_ceil(bins).max(1);
                points
                    .chunks(per_bin)
                    .map(|chunk| chunk.iter().map(|(_, v)| *v).collect())
                    .collect()
            } else {
                let mut by_choice: BTreeMap<String, Vec<f64>> = BTreeMap::new();
                for (p, v) in &points {
                    by_choice.entry(p.to_string()).or_default().push(*v);
                }
                by_choice.into_values().collect()
            };
            (name.clone(), explained_variance(&groups, total))
        })
        .collect();

    let sum: f64 = scores.iter().map(|(_, s)| s).sum();
    if sum > 0.0 {
        for (_, score) in &mut scores {
            *score /= sum;
        }
    }
    scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.0.cmp(&b.0)));
    scores
}

/// Log the state of the configured study and save its trials table.
pub fn report_study(hyper: &HyperConfig) -> HsResult<StudyReport> {
    let optuna = &hyper.optuna;
    let study = Study::load_default(optuna.study_path(), &optuna.name)?;
    let trials = study.trials()?;
    let count = |state: TrialState| trials.iter().filter(|t| t.state == state).count();

    let mut report = StudyReport {
        n_trials: trials.len(),
        n_pruned: count(TrialState::Pruned),
        n_complete: count(TrialState::Complete),
        best_value: None,
        best_params: BTreeMap::new(),
        importances: Vec::new(),
        unfinished: trials.len() < optuna.n_trials,
        csv_path: None,
    };

    info!("Number of requested trials per worker: {}", optuna.n_trials);
    info!("Number of trials in the database: {}", report.n_trials);
    info!("Number of pruned trials: {}", report.n_pruned);
    info!("Number of completed trials: {}", report.n_complete);

    if report.n_complete == 0 {
        info!("There are no complete trials in this study.");
        info!("Wait until the workers finish a few trials and try again.");
        return Ok(report);
    }

    if let Some(best) = study.best_trial()? {
        info!("Best trial: {} with value {:?}", best.number, best.value);
        info!("Best parameters in the study:");
        for (name, value) in &best.params {
            info!("{}: {}", name, value);
        }
        report.best_value = best.value;
        report.best_params = best.params;
    }

    report.importances = param_importances(&trials);
    info!("Parameter importance:");
    for (name, score) in &report.importances {
        info!("{}: {:.4}", name, score);
    }

    if report.unfinished {
        warn!("Not all of the trials completed due to the wall-time.");
        warn!("Set reload = 1 in the hyperparameter config and resubmit some more workers to finish!");
    }

    let path = optuna.save_path.join(format!("{}.csv", optuna.name));
    info!("Saving the results of the study to file at {}", path.display());
    trials_table(&trials).write_csv(&path)?;
    report.csv_path = Some(path);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::open_study;
    use crate::testing::write_sweep;
    use hs_optimizer::Budget;
    use hs_types::TrialError;
    use tempfile::TempDir;

    #[test]
    fn empty_study_reports_without_writing() {
        let dir = TempDir::new().unwrap();
        let (hyper_path, _) = write_sweep(dir.path());
        let hyper = HyperConfig::from_file(&hyper_path).unwrap();
        drop(open_study(&hyper, false).unwrap());

        let report = report_study(&hyper).unwrap();
        assert_eq!((report.n_trials, report.n_complete), (0, 0));
        assert!(report.unfinished);
        assert_eq!(report.csv_path, None);
        assert!(!dir.path().join("mlp.db.csv").exists());
    }

    #[test]
    fn missing_study_is_an_error() {
        let dir = TempDir::new().unwrap();
        let (hyper_path, _) = write_sweep(dir.path());
        let hyper = HyperConfig::from_file(&hyper_path).unwrap();
        assert!(report_study(&hyper).is_err());
    }

    #[test]
    fn reports_best_trial_and_writes_table() {
        let dir = TempDir::new().unwrap();
        let (hyper_path, _) = write_sweep(dir.path());
        let hyper = HyperConfig::from_file(&hyper_path).unwrap();
        {
            let mut study = open_study(&hyper, false).unwrap();
            study
                .optimize(
                    |trial| {
                        let x = trial.suggest_uniform("dropout", 0.0, 0.5)?;
                        if trial.number() == 2 {
                            trial.report(1.0, 0)?;
                            return Err(TrialError::Pruned { step: Some(0) }.into());
                        }
                        Ok(x)
                    },
                    Budget::trials(4),
                )
                .unwrap();
        }

        let report = report_study(&hyper).unwrap();
        assert_eq!((report.n_trials, report.n_pruned, report.n_complete), (4, 1, 3));
        assert!(report.best_params.contains_key("dropout"));
        assert_eq!(report.best_params["dropout"].as_f64(), report.best_value);
        assert_eq!(report.importances.len(), 1);
        assert_eq!(report.importances[0].0, "dropout");

        let table = ResultTable::read_csv(report.csv_path.as_ref().unwrap()).unwrap();
        assert_eq!(
            table.columns,
            vec![
                "number",
                "value",
                "datetime_start",
                "datetime_complete",
                "duration",
                "params_dropout",
                "state"
            ]
        );
        assert_eq!(table.len(), 4);
        assert_eq!(table.cell(2, "state"), Some("PRUNED"));
        assert_eq!(table.cell(3, "state"), Some("COMPLETE"));
    }

    fn completed(number: usize, params: &[(&str, ParamValue)], value: f64) -> FrozenTrial {
        let now = chrono::Utc::now();
        FrozenTrial {
            trial_id: number as i64 + 1,
            number,
            state: TrialState::Complete,
            value: Some(value),
            params: params.iter().map(|(n, v)| (n.to_string(), v.clone())).collect(),
            distributions: BTreeMap::new(),
            intermediate_values: BTreeMap::new(),
            datetime_start: now,
            datetime_complete: Some(now),
            worker_id: None,
        }
    }

    #[test]
    fn importance_ranks_the_parameter_that_drives_the_value() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(5);
        let trials: Vec<FrozenTrial> = (0..60)
            .map(|i| {
                let lr: f64 = rng.gen_range(0.0..1.0);
                let noise: f64 = rng.gen_range(0.0..1.0);
                let act = if i % 2 == 0 { "relu" } else { "tanh" };
                completed(
                    i,
                    &[
                        ("lr", ParamValue::Float(lr)),
                        ("noise", ParamValue::Float(noise)),
                        ("act", ParamValue::Choice(serde_json::json!(act))),
                    ],
                    10.0 * lr + 0.01 * noise,
                )
            })
            .collect();

        let importances = param_importances(&trials);
        assert_eq!(importances.len(), 3);
        assert_eq!(importances[0].0, "lr");
        assert!(importances[0].1 > 0.5);
        let total: f64 = importances.iter().map(|(_, s)| s).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn constant_objective_has_no_importance() {
        let trials: Vec<FrozenTrial> = (0..4)
            .map(|i| completed(i, &[("units", ParamValue::Int(i as i64))], 1.0))
            .collect();
        assert_eq!(param_importances(&trials), vec![("units".to_string(), 0.0)]);
        assert!(param_importances(&[]).is_empty());
    }

    #[test]
    fn duration_formatting() {
        assert_eq!(format_duration(chrono::Duration::milliseconds(1500)), "1.500000");
    }
}
