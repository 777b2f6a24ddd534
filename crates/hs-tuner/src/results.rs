//! Per-worker CSV result logs and their post-hoc aggregation.
//!
//! Every worker process owns one `hyper_opt_<n>.csv` in the save directory
//! and rewrites it in full after each trial. Once the sweep finishes the logs
//! are concatenated into `hyper_opt.csv` (all rows) and `best.csv` (rows
//! holding the best metric value). Rewrites go through a temporary file in
//! the same directory, so readers never see a half-written log.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use hs_types::{Direction, HsError, HsResult, ParamValue};
use rand::Rng;
use rayon::prelude::*;
use tracing::{info, warn};

const LOG_PREFIX: &str = "hyper_opt_";
const MAX_LOG_INDEX: u32 = 100_000;

fn csv_error(e: csv::Error) -> HsError {
    HsError::Csv(e.to_string())
}

/// A small string table with an explicit column order. Missing cells are empty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultTable {
    pub columns: Vec<String>,
    pub rows: Vec<BTreeMap<String, String>>,
}

impl ResultTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a row; unseen columns are added in the order given.
    pub fn push_row(&mut self, row: Vec<(String, String)>) {
        for (column, _) in &row {
            if !self.columns.contains(column) {
                self.columns.push(column.clone());
            }
        }
        self.rows.push(row.into_iter().collect());
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn cell(&self, row: usize, column: &str) -> Option<&str> {
        self.rows.get(row)?.get(column).map(String::as_str)
    }

    pub fn read_csv(path: &Path) -> HsResult<Self> {
        let mut reader = csv::Reader::from_path(path).map_err(csv_error)?;
        let columns: Vec<String> = reader
            .headers()
            .map_err(csv_error)?
            .iter()
            .map(str::to_string)
            .collect();

        let mut table = Self::new();
        // dataframe exports often carry an unnamed index column
        table.columns = columns
            .iter()
            .filter(|c| !c.is_empty() && !c.starts_with("Unnamed"))
            .cloned()
            .collect();
        for record in reader.records() {
            let record = record.map_err(csv_error)?;
            let row = columns
                .iter()
                .zip(record.iter())
                .filter(|(c, v)| table.columns.contains(c) && !v.is_empty())
                .map(|(c, v)| (c.clone(), v.to_string()))
                .collect();
            table.rows.push(row);
        }
        Ok(table)
    }

    /// Write the table to `path`, replacing any previous file in one rename.
    pub fn write_csv(&self, path: &Path) -> HsResult<()> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let staged = tempfile::NamedTempFile::new_in(dir)?;
        let mut writer = csv::Writer::from_writer(staged);
        writer.write_record(&self.columns).map_err(csv_error)?;
        for row in &self.rows {
            writer
                .write_record(
                    self.columns
                        .iter()
                        .map(|c| row.get(c).map(String::as_str).unwrap_or("")),
                )
                .map_err(csv_error)?;
        }
        let staged = writer
            .into_inner()
            .map_err(|e| HsError::Csv(e.to_string()))?;
        staged.as_file().sync_all()?;
        staged.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

/// The CSV log one worker process appends trial rows to.
#[derive(Debug)]
pub struct ResultLog {
    path: PathBuf,
    table: ResultTable,
}

impl ResultLog {
    /// Claim an unused `hyper_opt_<n>.csv` name in `save_path`.
    pub fn create(save_path: &Path) -> HsResult<Self> {
        Self::create_with_rng(save_path, &mut rand::thread_rng())
    }

    /// The file is created on the spot, so two workers racing for the same
    /// name cannot both win it.
    pub fn create_with_rng<R: Rng>(save_path: &Path, rng: &mut R) -> HsResult<Self> {
        fs::create_dir_all(save_path)?;
        let path = loop {
            let candidate = save_path.join(format!(
                "{LOG_PREFIX}{}.csv",
                rng.gen_range(0..=MAX_LOG_INDEX)
            ));
            match OpenOptions::new().write(true).create_new(true).open(&candidate) {
                Ok(_) => break candidate,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        };
        info!("Saving study/trial results to local file {}", path.display());
        Ok(Self {
            path,
            table: ResultTable::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn table(&self) -> &ResultTable {
        &self.table
    }

    /// Add one trial row and rewrite the file.
    pub fn record(
        &mut self,
        trial: usize,
        params: &BTreeMap<String, ParamValue>,
        metrics: &BTreeMap<String, f64>,
        metric: &str,
        best: f64,
    ) -> HsResult<()> {
        let mut row = vec![("trial".to_string(), trial.to_string())];
        row.extend(params.iter().map(|(k, v)| (k.clone(), v.to_string())));
        row.extend(metrics.iter().map(|(k, v)| (k.clone(), v.to_string())));
        row.push((format!("best_{metric}"), best.to_string()));
        self.table.push_row(row);

        self.table.write_csv(&self.path)?;
        info!("Saving trial {} results to local file {}", trial, self.path.display());
        Ok(())
    }
}

/// Worker logs found in `save_path`.
pub fn worker_logs(save_path: &Path) -> HsResult<Vec<PathBuf>> {
    let mut logs = Vec::new();
    for entry in fs::read_dir(save_path)? {
        let path = entry?.path();
        let is_log = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(LOG_PREFIX) && n.ends_with(".csv"));
        if is_log {
            logs.push(path);
        }
    }
    logs.sort();
    Ok(logs)
}

/// All trial rows of a sweep and the subset holding the best metric value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregatedResults {
    pub all: ResultTable,
    pub best: ResultTable,
}

fn trial_number(row: &BTreeMap<String, String>) -> Option<i64> {
    row.get("trial")
        .and_then(|t| t.parse::<f64>().ok())
        .map(|t| t as i64)
}

/// Concatenate the worker logs of `save_path` into `hyper_opt.csv` and `best.csv`.
///
/// Columns are the union of every log's columns, sorted by name; rows are
/// sorted by trial number. A log that cannot be parsed is skipped with a
/// warning.
pub fn aggregate_logs(save_path: &Path, metric: &str, direction: Direction) -> HsResult<AggregatedResults> {
    let logs = worker_logs(save_path)?;
    if logs.is_empty() {
        warn!("No trial result logs found in {}", save_path.display());
        return Ok(AggregatedResults::default());
    }

    let tables: Vec<ResultTable> = logs
        .par_iter()
        .filter_map(|path| match ResultTable::read_csv(path) {
            Ok(table) => Some(table),
            Err(e) => {
                warn!("Skipping unreadable result log {}: {}", path.display(), e);
                None
            }
        })
        .collect();

    let columns: BTreeSet<String> = tables.iter().flat_map(|t| t.columns.iter().cloned()).collect();
    let mut rows: Vec<BTreeMap<String, String>> = tables.into_iter().flat_map(|t| t.rows).collect();
    rows.sort_by_key(|row| trial_number(row).unwrap_or(i64::MAX));

    let all = ResultTable {
        columns: columns.into_iter().collect(),
        rows,
    };

    let values: Vec<Option<f64>> = all
        .rows
        .iter()
        .map(|row| row.get(metric).and_then(|v| v.parse::<f64>().ok()))
        .collect();
    let best_value = direction.best_of(values.iter().flatten().copied());
    let best = ResultTable {
        columns: all.columns.clone(),
        rows: all
            .rows
            .iter()
            .zip(&values)
            .filter(|(_, v)| v.is_some() && *v == &best_value)
            .map(|(row, _)| row.clone())
            .collect(),
    };

    let all_path = save_path.join("hyper_opt.csv");
    let best_path = save_path.join("best.csv");
    all.write_csv(&all_path)?;
    best.write_csv(&best_path)?;
    info!("Saved trial results to {}", all_path.display());
    info!("Saved best results to {}", best_path.display());

    Ok(AggregatedResults { all, best })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use tempfile::TempDir;

    fn params(units: i64, activation: &str) -> BTreeMap<String, ParamValue> {
        BTreeMap::from([
            ("units".to_string(), ParamValue::Int(units)),
            (
                "activation".to_string(),
                ParamValue::Choice(serde_json::json!(activation)),
            ),
        ])
    }

    fn metrics(loss: f64) -> BTreeMap<String, f64> {
        BTreeMap::from([("val_loss".to_string(), loss)])
    }

    #[test]
    fn log_names_do_not_collide() {
        let dir = TempDir::new().unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let first = ResultLog::create_with_rng(dir.path(), &mut rng).unwrap();
        // the name is claimed before any trial is recorded
        assert!(first.path().exists());

        // same seed draws the same first name, which is now taken
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let second = ResultLog::create_with_rng(dir.path(), &mut rng).unwrap();
        assert_ne!(first.path(), second.path());
        let name = second.path().file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("hyper_opt_") && name.ends_with(".csv"));
    }

    #[test]
    fn log_is_rewritten_with_every_column() {
        let dir = TempDir::new().unwrap();
        let mut log = ResultLog::create(dir.path()).unwrap();
        log.record(0, &params(10, "relu"), &metrics(0.5), "val_loss", 0.5)
            .unwrap();
        let mut extra = metrics(0.25);
        extra.insert("accuracy".to_string(), 0.9);
        log.record(3, &params(20, "tanh"), &extra, "val_loss", 0.25)
            .unwrap();

        let table = ResultTable::read_csv(log.path()).unwrap();
        assert_eq!(
            table.columns,
            vec!["trial", "activation", "units", "val_loss", "best_val_loss", "accuracy"]
        );
        assert_eq!(table.len(), 2);
        assert_eq!(table.cell(0, "activation"), Some("relu"));
        assert_eq!(table.cell(0, "accuracy"), None);
        assert_eq!(table.cell(1, "accuracy"), Some("0.9"));
        assert_eq!(table.cell(1, "best_val_loss"), Some("0.25"));
    }

    #[test]
    fn aggregation_sorts_rows_and_unions_columns() {
        let dir = TempDir::new().unwrap();
        let mut a = ResultLog::create_with_rng(dir.path(), &mut ChaCha8Rng::seed_from_u64(1)).unwrap();
        let mut b = ResultLog::create_with_rng(dir.path(), &mut ChaCha8Rng::seed_from_u64(2)).unwrap();
        assert_ne!(a.path(), b.path());
        a.record(2, &params(10, "relu"), &metrics(0.4), "val_loss", 0.3)
            .unwrap();
        b.record(0, &params(30, "relu"), &metrics(0.3), "val_loss", 0.3)
            .unwrap();
        let mut extra = metrics(0.9);
        extra.insert("accuracy".to_string(), 0.5);
        b.record(1, &params(5, "tanh"), &extra, "val_loss", 0.3)
            .unwrap();

        let results = aggregate_logs(dir.path(), "val_loss", Direction::Minimize).unwrap();
        assert_eq!(
            results.all.columns,
            vec!["accuracy", "activation", "best_val_loss", "trial", "units", "val_loss"]
        );
        let trials: Vec<_> = (0..3).map(|i| results.all.cell(i, "trial").unwrap()).collect();
        assert_eq!(trials, vec!["0", "1", "2"]);
        assert_eq!(results.best.len(), 1);
        assert_eq!(results.best.cell(0, "units"), Some("30"));

        let maximized = aggregate_logs(dir.path(), "val_loss", Direction::Maximize).unwrap();
        assert_eq!(maximized.best.cell(0, "trial"), Some("1"));

        let written = ResultTable::read_csv(&dir.path().join("hyper_opt.csv")).unwrap();
        assert_eq!(written, maximized.all);
        assert!(dir.path().join("best.csv").exists());
        // aggregated files are not picked up as worker logs
        assert_eq!(worker_logs(dir.path()).unwrap().len(), 2);
    }

    #[test]
    fn rewrites_leave_no_staging_files() {
        let dir = TempDir::new().unwrap();
        let mut log = ResultLog::create(dir.path()).unwrap();
        for trial in 0..3 {
            log.record(trial, &params(10, "relu"), &metrics(0.5), "val_loss", 0.5)
                .unwrap();
        }
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(ResultTable::read_csv(log.path()).unwrap().len(), 3);
    }

    #[test]
    fn aggregation_skips_broken_logs() {
        let dir = TempDir::new().unwrap();
        let mut good = ResultLog::create_with_rng(dir.path(), &mut ChaCha8Rng::seed_from_u64(3)).unwrap();
        good.record(0, &params(10, "relu"), &metrics(0.4), "val_loss", 0.4)
            .unwrap();
        // a log cut off mid-row has fewer fields than its header
        fs::write(
            dir.path().join("hyper_opt_999999.csv"),
            "trial,units,val_loss\n1,20,0.1\n2,3",
        )
        .unwrap();

        let results = aggregate_logs(dir.path(), "val_loss", Direction::Minimize).unwrap();
        assert_eq!(results.all.len(), 1);
        assert_eq!(results.best.cell(0, "units"), Some("10"));
    }

    #[test]
    fn aggregation_without_logs_is_empty() {
        let dir = TempDir::new().unwrap();
        let results = aggregate_logs(dir.path(), "val_loss", Direction::Minimize).unwrap();
        assert!(results.all.is_empty());
        assert!(!dir.path().join("hyper_opt.csv").exists());
    }
}
