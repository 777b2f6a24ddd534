//! Bridge between stored trials and the in-process `optimizer` engine.
//!
//! The SQLite store is the shared record for every worker. Before each trial
//! the finished history is replayed into a fresh engine study, so TPE and the
//! median pruner see trials from all processes, not just this one.

use hs_types::{internal_error, Direction, HsError, HsResult, ParamValue, StudyError, TrialState};
use optimizer::parameter::{CategoricalParam, FloatParam, IntParam, Parameter};
use std::collections::HashMap;

use crate::distributions::Distribution;
use crate::trial::FrozenTrial;

pub(crate) fn engine_err(e: impl std::fmt::Display) -> HsError {
    StudyError::Engine {
        message: e.to_string(),
    }
    .into()
}

pub(crate) fn engine_direction(direction: Direction) -> optimizer::Direction {
    match direction {
        Direction::Minimize => optimizer::Direction::Minimize,
        Direction::Maximize => optimizer::Direction::Maximize,
    }
}

enum Handle {
    Float(FloatParam),
    Int(IntParam),
    /// Choices are drawn by index and mapped back to their JSON values.
    Choice(CategoricalParam<usize>),
}

/// One named parameter as the engine knows it.
pub(crate) struct EngineParam {
    distribution: Distribution,
    handle: Handle,
}

impl EngineParam {
    fn new(distribution: &Distribution) -> Self {
        let handle = match distribution {
            Distribution::Float {
                low,
                high,
                step,
                log,
            } => {
                let mut param = FloatParam::new(*low, *high);
                if *log {
                    param = param.log_scale();
                }
                if let Some(q) = step {
                    param = param.step(*q);
                }
                Handle::Float(param)
            }
            Distribution::Int {
                low,
                high,
                step,
                log,
            } => {
                let mut param = IntParam::new(*low, *high);
                if *log {
                    param = param.log_scale();
                }
                if *step != 1 {
                    param = param.step(*step);
                }
                Handle::Int(param)
            }
            Distribution::Categorical { choices } => {
                Handle::Choice(CategoricalParam::new((0..choices.len()).collect::<Vec<usize>>()))
            }
        };
        Self {
            distribution: distribution.clone(),
            handle,
        }
    }

    fn id(&self) -> optimizer::parameter::ParamId {
        match &self.handle {
            Handle::Float(p) => p.id(),
            Handle::Int(p) => p.id(),
            Handle::Choice(p) => p.id(),
        }
    }

    fn engine_value(&self, value: &ParamValue) -> Option<optimizer::param::ParamValue> {
        match (&self.handle, &self.distribution) {
            (Handle::Float(_), _) => value.as_f64().map(optimizer::param::ParamValue::Float),
            (Handle::Int(_), _) => match value {
                ParamValue::Int(v) => Some(optimizer::param::ParamValue::Int(*v)),
                _ => None,
            },
            (Handle::Choice(_), Distribution::Categorical { choices }) => {
                let raw = value.to_json();
                choices
                    .iter()
                    .position(|c| *c == raw)
                    .map(optimizer::param::ParamValue::Categorical)
            }
            (Handle::Choice(_), _) => None,
        }
    }

    /// Draw (or, when enqueued, replay) this parameter on `trial`.
    pub(crate) fn suggest(&self, trial: &mut optimizer::Trial) -> HsResult<ParamValue> {
        match &self.handle {
            Handle::Float(p) => p.suggest(trial).map(ParamValue::Float).map_err(engine_err),
            Handle::Int(p) => p.suggest(trial).map(ParamValue::Int).map_err(engine_err),
            Handle::Choice(p) => {
                let idx = p.suggest(trial).map_err(engine_err)?;
                match &self.distribution {
                    Distribution::Categorical { choices } => choices
                        .get(idx)
                        .cloned()
                        .map(ParamValue::Choice)
                        .ok_or_else(|| internal_error!("choice index {idx} out of range")),
                    other => Err(internal_error!("categorical handle over {other:?}")),
                }
            }
        }
    }
}

/// Engine parameters by name. Ids stay stable for the life of a study so
/// replayed history lines up with the live trial's suggestions.
#[derive(Default)]
pub(crate) struct ParamRegistry {
    params: HashMap<String, EngineParam>,
}

impl ParamRegistry {
    /// The parameter for `name`; a changed distribution replaces it.
    pub(crate) fn get_or_register(&mut self, name: &str, distribution: &Distribution) -> &EngineParam {
        let stale = self
            .params
            .get(name)
            .map_or(true, |p| p.distribution != *distribution);
        if stale {
            self.params
                .insert(name.to_string(), EngineParam::new(distribution));
        }
        &self.params[name]
    }

    /// Feed finished trials into `engine` in order. Returns how many were replayed.
    pub(crate) fn replay(&mut self, engine: &optimizer::Study<f64>, history: &[FrozenTrial]) -> usize {
        for past in history {
            for (name, distribution) in &past.distributions {
                self.get_or_register(name, distribution);
            }
        }

        let mut replayed = 0;
        for past in history
            .iter()
            .filter(|t| matches!(t.state, TrialState::Complete | TrialState::Pruned))
        {
            let mut fixed = HashMap::new();
            let mut params = Vec::new();
            for (name, value) in &past.params {
                let Some(param) = self.params.get(name) else {
                    continue;
                };
                if past.distributions.get(name) != Some(&param.distribution) {
                    continue;
                }
                if let Some(v) = param.engine_value(value) {
                    fixed.insert(param.id(), v);
                    params.push(param);
                }
            }

            engine.enqueue(fixed);
            let mut trial = engine.ask();
            if let Err(e) = params.iter().try_for_each(|p| p.suggest(&mut trial).map(|_| ())) {
                tracing::debug!("Trial {} left out of the sampler history: {}", past.number, e);
                engine.fail_trial(trial, e);
                continue;
            }
            for (step, value) in &past.intermediate_values {
                trial.report(*step, *value);
            }
            match (past.state, past.value) {
                (TrialState::Complete, Some(v)) if v.is_finite() => engine.complete_trial(trial, v),
                (TrialState::Pruned, _) => engine.prune_trial(trial),
                _ => {
                    engine.fail_trial(trial, "no finite value");
                    continue;
                }
            }
            replayed += 1;
        }
        replayed
    }
}
