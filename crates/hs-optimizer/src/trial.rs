//! Trial records and the live trial handle passed to objectives.

use chrono::{DateTime, Utc};
use hs_types::{Direction, HsResult, ParamValue, TrialError, TrialState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::distributions::{Distribution, SuggestSpec};
use crate::storage::TrialId;
use crate::study::Study;

/// Snapshot of one trial as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrozenTrial {
    pub trial_id: TrialId,
    pub number: usize,
    pub state: TrialState,
    pub value: Option<f64>,
    pub params: BTreeMap<String, ParamValue>,
    pub distributions: BTreeMap<String, Distribution>,
    pub intermediate_values: BTreeMap<u64, f64>,
    pub datetime_start: DateTime<Utc>,
    pub datetime_complete: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
}

impl FrozenTrial {
    pub fn last_step(&self) -> Option<u64> {
        self.intermediate_values.keys().next_back().copied()
    }

    pub fn last_intermediate_value(&self) -> Option<f64> {
        self.intermediate_values.values().next_back().copied()
    }

    /// Best intermediate value over all steps; `None` if any reported value is NaN.
    pub fn best_intermediate_value(&self, direction: Direction) -> Option<f64> {
        if self.intermediate_values.values().any(|v| v.is_nan()) {
            return None;
        }
        direction.best_of(self.intermediate_values.values().copied())
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.datetime_complete.map(|end| end - self.datetime_start)
    }
}

/// A running trial. Borrows its study for the duration of one objective call.
pub struct Trial<'a> {
    study: &'a mut Study,
    record: FrozenTrial,
    /// Values the sampler pinned before the objective started.
    fixed: BTreeMap<String, ParamValue>,
    engine: optimizer::Trial,
}

impl<'a> Trial<'a> {
    pub(crate) fn new(
        study: &'a mut Study,
        record: FrozenTrial,
        fixed: BTreeMap<String, ParamValue>,
        engine: optimizer::Trial,
    ) -> Self {
        Self {
            study,
            record,
            fixed,
            engine,
        }
    }

    pub fn number(&self) -> usize {
        self.record.number
    }

    pub fn id(&self) -> TrialId {
        self.record.trial_id
    }

    pub fn params(&self) -> &BTreeMap<String, ParamValue> {
        &self.record.params
    }

    pub fn record(&self) -> &FrozenTrial {
        &self.record
    }

    pub fn study_name(&self) -> &str {
        self.study.name()
    }

    pub fn direction(&self) -> Direction {
        self.study.direction()
    }

    /// Best value of the study so far (this trial excluded).
    pub fn best_value(&self) -> HsResult<Option<f64>> {
        self.study.best_value()
    }

    pub fn last_intermediate_value(&self) -> Option<f64> {
        self.record.last_intermediate_value()
    }

    /// Ask the sampler for a value of `name`. Repeated calls return the same value.
    pub fn suggest(&mut self, name: &str, distribution: &Distribution) -> HsResult<ParamValue> {
        if let Some(existing) = self.record.params.get(name) {
            if self.record.distributions.get(name) != Some(distribution) {
                return Err(TrialError::DistributionMismatch {
                    name: name.to_string(),
                }
                .into());
            }
            return Ok(existing.clone());
        }
        distribution.validate(name)?;

        let value = match self.fixed.get(name) {
            Some(ParamValue::Choice(raw)) => distribution.value_from_json(raw),
            Some(pinned) => pinned.clone(),
            None => self
                .study
                .registry
                .get_or_register(name, distribution)
                .suggest(&mut self.engine)?,
        };
        self.study
            .storage
            .set_param(self.record.trial_id, name, &value, distribution)?;

        tracing::debug!("Trial {} suggested {} = {}", self.record.number, name, value);
        self.record.params.insert(name.to_string(), value.clone());
        self.record
            .distributions
            .insert(name.to_string(), distribution.clone());
        Ok(value)
    }

    pub fn suggest_spec(&mut self, spec: &SuggestSpec) -> HsResult<ParamValue> {
        self.suggest(&spec.name, &spec.distribution)
    }

    pub fn suggest_int(&mut self, name: &str, low: i64, high: i64) -> HsResult<i64> {
        match self.suggest(name, &Distribution::int(low, high))? {
            ParamValue::Int(v) => Ok(v),
            other => Err(hs_types::internal_error!("int parameter {name} sampled {other}")),
        }
    }

    pub fn suggest_float(&mut self, name: &str, low: f64, high: f64, log: bool) -> HsResult<f64> {
        let distribution = Distribution::Float {
            low,
            high,
            step: None,
            log,
        };
        self.suggest(name, &distribution)?
            .as_f64()
            .ok_or_else(|| hs_types::internal_error!("float parameter {name} is not numeric"))
    }

    pub fn suggest_uniform(&mut self, name: &str, low: f64, high: f64) -> HsResult<f64> {
        self.suggest_float(name, low, high, false)
    }

    pub fn suggest_loguniform(&mut self, name: &str, low: f64, high: f64) -> HsResult<f64> {
        self.suggest_float(name, low, high, true)
    }

    pub fn suggest_discrete_uniform(&mut self, name: &str, low: f64, high: f64, q: f64) -> HsResult<f64> {
        self.suggest(name, &Distribution::discrete_uniform(low, high, q))?
            .as_f64()
            .ok_or_else(|| hs_types::internal_error!("discrete parameter {name} is not numeric"))
    }

    pub fn suggest_categorical(
        &mut self,
        name: &str,
        choices: Vec<serde_json::Value>,
    ) -> HsResult<serde_json::Value> {
        Ok(self
            .suggest(name, &Distribution::categorical(choices))?
            .to_json())
    }

    /// Record an intermediate objective value for pruning.
    pub fn report(&mut self, value: f64, step: u64) -> HsResult<()> {
        self.study
            .storage
            .set_intermediate_value(self.record.trial_id, step, value)?;
        self.record.intermediate_values.insert(step, value);
        self.engine.report(step, value);
        Ok(())
    }

    /// Ask the pruner whether this trial should stop, given the latest reports.
    pub fn should_prune(&self) -> HsResult<bool> {
        Ok(match self.study.pruner.precheck(&self.record) {
            Some(decided) => decided,
            None => self.engine.should_prune(),
        })
    }
}
