//! SQLite-backed study storage.
//!
//! One database file holds any number of studies. Worker processes share the
//! file; SQLite's WAL mode and busy timeout are the only coordination.

use chrono::{DateTime, Utc};
use hs_types::{Direction, HsError, HsResult, ParamValue, StudyError, TrialState};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::distributions::Distribution;
use crate::trial::FrozenTrial;

/// Database id of a study row.
pub type StudyId = i64;

/// Database id of a trial row.
pub type TrialId = i64;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS studies (
    study_id INTEGER PRIMARY KEY AUTOINCREMENT,
    study_name TEXT NOT NULL UNIQUE,
    direction TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS trials (
    trial_id INTEGER PRIMARY KEY AUTOINCREMENT,
    study_id INTEGER NOT NULL,
    number INTEGER NOT NULL,
    state TEXT NOT NULL,
    value REAL,
    worker_id TEXT,
    datetime_start TEXT NOT NULL,
    datetime_complete TEXT,
    UNIQUE (study_id, number),
    FOREIGN KEY (study_id) REFERENCES studies(study_id)
);
CREATE INDEX IF NOT EXISTS idx_trials_study ON trials(study_id);

CREATE TABLE IF NOT EXISTS trial_params (
    trial_id INTEGER NOT NULL,
    param_name TEXT NOT NULL,
    param_value TEXT NOT NULL,
    distribution TEXT NOT NULL,
    PRIMARY KEY (trial_id, param_name),
    FOREIGN KEY (trial_id) REFERENCES trials(trial_id)
);

CREATE TABLE IF NOT EXISTS trial_intermediate_values (
    trial_id INTEGER NOT NULL,
    step INTEGER NOT NULL,
    intermediate_value REAL,
    PRIMARY KEY (trial_id, step),
    FOREIGN KEY (trial_id) REFERENCES trials(trial_id)
);
";

fn storage_err(e: rusqlite::Error) -> HsError {
    StudyError::Storage {
        message: e.to_string(),
    }
    .into()
}

fn parse_time(raw: &str) -> HsResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            HsError::from(StudyError::Storage {
                message: format!("bad timestamp {raw}: {e}"),
            })
        })
}

/// Persistent trial store for one database file.
#[derive(Debug)]
pub struct StudyStorage {
    conn: Connection,
    path: PathBuf,
}

impl StudyStorage {
    /// Open (creating if needed) the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> HsResult<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path).map_err(storage_err)?;

        conn.busy_timeout(Duration::from_secs(60)).map_err(storage_err)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(storage_err)?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(storage_err)?;
        conn.execute_batch(SCHEMA_SQL).map_err(storage_err)?;

        tracing::debug!("Opened study storage at {}", path.display());
        Ok(Self { conn, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert a study row. Fails when the name is taken.
    pub fn create_study(&self, name: &str, direction: Direction) -> HsResult<StudyId> {
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO studies (study_name, direction, created_at) VALUES (?1, ?2, ?3)",
                params![name, direction.as_str(), Utc::now().to_rfc3339()],
            )
            .map_err(storage_err)?;
        if inserted == 0 {
            return Err(StudyError::DuplicatedStudy {
                name: name.to_string(),
            }
            .into());
        }
        Ok(self.conn.last_insert_rowid())
    }

    /// Look up a study by name.
    pub fn find_study(&self, name: &str) -> HsResult<Option<(StudyId, Direction)>> {
        let row: Option<(StudyId, String)> = self
            .conn
            .query_row(
                "SELECT study_id, direction FROM studies WHERE study_name = ?1",
                [name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(storage_err)?;

        match row {
            Some((id, direction)) => Ok(Some((id, direction.parse()?))),
            None => Ok(None),
        }
    }

    pub fn study_names(&self) -> HsResult<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT study_name FROM studies ORDER BY study_id")
            .map_err(storage_err)?;
        let names = stmt
            .query_map([], |row| row.get(0))
            .map_err(storage_err)?
            .collect::<Result<Vec<String>, _>>()
            .map_err(storage_err)?;
        Ok(names)
    }

    /// Allocate the next trial number for `study_id` and insert a running trial.
    pub fn create_trial(&mut self, study_id: StudyId, worker_id: &str) -> HsResult<(TrialId, usize)> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(storage_err)?;
        let number: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM trials WHERE study_id = ?1",
                [study_id],
                |row| row.get(0),
            )
            .map_err(storage_err)?;
        tx.execute(
            "INSERT INTO trials (study_id, number, state, worker_id, datetime_start)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                study_id,
                number,
                TrialState::Running.as_str(),
                worker_id,
                Utc::now().to_rfc3339()
            ],
        )
        .map_err(storage_err)?;
        let trial_id = tx.last_insert_rowid();
        tx.commit().map_err(storage_err)?;
        Ok((trial_id, number as usize))
    }

    pub fn set_param(
        &self,
        trial_id: TrialId,
        name: &str,
        value: &ParamValue,
        distribution: &Distribution,
    ) -> HsResult<()> {
        let value_json = serde_json::to_string(&value.to_json())?;
        let dist_json = serde_json::to_string(distribution)?;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO trial_params (trial_id, param_name, param_value, distribution)
                 VALUES (?1, ?2, ?3, ?4)",
                params![trial_id, name, value_json, dist_json],
            )
            .map_err(storage_err)?;
        Ok(())
    }

    pub fn set_intermediate_value(&self, trial_id: TrialId, step: u64, value: f64) -> HsResult<()> {
        let stored = if value.is_nan() { None } else { Some(value) };
        self.conn
            .execute(
                "INSERT OR REPLACE INTO trial_intermediate_values (trial_id, step, intermediate_value)
                 VALUES (?1, ?2, ?3)",
                params![trial_id, step as i64, stored],
            )
            .map_err(storage_err)?;
        Ok(())
    }

    /// Move a trial to a finished state.
    pub fn finish_trial(&self, trial_id: TrialId, state: TrialState, value: Option<f64>) -> HsResult<()> {
        let value = value.filter(|v| !v.is_nan());
        let updated = self
            .conn
            .execute(
                "UPDATE trials SET state = ?1, value = ?2, datetime_complete = ?3 WHERE trial_id = ?4",
                params![state.as_str(), value, Utc::now().to_rfc3339(), trial_id],
            )
            .map_err(storage_err)?;
        if updated == 0 {
            return Err(StudyError::TrialNotFound { trial_id }.into());
        }
        Ok(())
    }

    /// All trials of a study, ordered by number.
    pub fn trials(&self, study_id: StudyId) -> HsResult<Vec<FrozenTrial>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT trial_id, number, state, value, worker_id, datetime_start, datetime_complete
                 FROM trials WHERE study_id = ?1 ORDER BY number",
            )
            .map_err(storage_err)?;
        let rows = stmt
            .query_map([study_id], |row| {
                Ok((
                    row.get::<_, TrialId>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<f64>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                ))
            })
            .map_err(storage_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(storage_err)?;

        let mut trials = Vec::with_capacity(rows.len());
        let mut index: HashMap<TrialId, usize> = HashMap::with_capacity(rows.len());
        for (trial_id, number, state, value, worker_id, start, complete) in rows {
            let state: TrialState = state.parse().map_err(|message| StudyError::Storage { message })?;
            index.insert(trial_id, trials.len());
            trials.push(FrozenTrial {
                trial_id,
                number: number as usize,
                state,
                value,
                params: BTreeMap::new(),
                distributions: BTreeMap::new(),
                intermediate_values: BTreeMap::new(),
                datetime_start: parse_time(&start)?,
                datetime_complete: complete.as_deref().map(parse_time).transpose()?,
                worker_id,
            });
        }

        let mut stmt = self
            .conn
            .prepare(
                "SELECT p.trial_id, p.param_name, p.param_value, p.distribution
                 FROM trial_params p JOIN trials t ON p.trial_id = t.trial_id
                 WHERE t.study_id = ?1",
            )
            .map_err(storage_err)?;
        let params = stmt
            .query_map([study_id], |row| {
                Ok((
                    row.get::<_, TrialId>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(storage_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(storage_err)?;
        for (trial_id, name, value_json, dist_json) in params {
            let Some(&i) = index.get(&trial_id) else { continue };
            let distribution: Distribution = serde_json::from_str(&dist_json)?;
            let raw: serde_json::Value = serde_json::from_str(&value_json)?;
            trials[i]
                .params
                .insert(name.clone(), distribution.value_from_json(&raw));
            trials[i].distributions.insert(name, distribution);
        }

        let mut stmt = self
            .conn
            .prepare(
                "SELECT v.trial_id, v.step, v.intermediate_value
                 FROM trial_intermediate_values v JOIN trials t ON v.trial_id = t.trial_id
                 WHERE t.study_id = ?1",
            )
            .map_err(storage_err)?;
        let values = stmt
            .query_map([study_id], |row| {
                Ok((
                    row.get::<_, TrialId>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<f64>>(2)?,
                ))
            })
            .map_err(storage_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(storage_err)?;
        for (trial_id, step, value) in values {
            if let Some(&i) = index.get(&trial_id) {
                trials[i]
                    .intermediate_values
                    .insert(step as u64, value.unwrap_or(f64::NAN));
            }
        }

        Ok(trials)
    }
}
