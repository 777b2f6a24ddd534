//! Pruners decide whether a running trial should stop early.
//!
//! The median rule runs in the `optimizer` engine against the replayed
//! history; step gating and NaN reports are settled here first.

use hs_types::{ConfigError, Direction, HsResult};
use serde::{Deserialize, Serialize};

use crate::engine::engine_direction;
use crate::trial::FrozenTrial;

/// Pruner kinds accepted in the `pruner.type` config field.
pub const SUPPORTED_PRUNERS: &[&str] = &["MedianPruner", "NopPruner"];

pub trait Pruner: Send {
    /// Attach the engine pruner to a per-trial engine study.
    fn install(&self, engine: &mut optimizer::Study<f64>, direction: Direction);

    /// Decide without the engine when possible; `None` defers to it.
    /// `trial` carries the intermediate values reported so far.
    fn precheck(&self, trial: &FrozenTrial) -> Option<bool>;

    fn name(&self) -> &str;
}

/// Never prunes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NopPruner;

impl Pruner for NopPruner {
    fn install(&self, engine: &mut optimizer::Study<f64>, _direction: Direction) {
        engine.set_pruner(optimizer::pruner::NopPruner);
    }

    fn precheck(&self, _trial: &FrozenTrial) -> Option<bool> {
        Some(false)
    }

    fn name(&self) -> &str {
        "nop"
    }
}

/// Prune when the trial's intermediate value is worse than the median of
/// completed trials' values at the same step.
#[derive(Debug, Clone, PartialEq)]
pub struct MedianPruner {
    /// Completed trials needed before anything is pruned.
    pub n_startup_trials: usize,
    pub n_warmup_steps: u64,
    pub interval_steps: u64,
}

impl Default for MedianPruner {
    fn default() -> Self {
        Self {
            n_startup_trials: 5,
            n_warmup_steps: 0,
            interval_steps: 1,
        }
    }
}

impl Pruner for MedianPruner {
    fn install(&self, engine: &mut optimizer::Study<f64>, direction: Direction) {
        engine.set_pruner(
            optimizer::pruner::MedianPruner::new(engine_direction(direction))
                .n_warmup_steps(self.n_warmup_steps)
                .n_min_trials(self.n_startup_trials),
        );
    }

    fn precheck(&self, trial: &FrozenTrial) -> Option<bool> {
        let Some(step) = trial.last_step() else {
            return Some(false);
        };
        if step < self.n_warmup_steps {
            return Some(false);
        }
        if (step - self.n_warmup_steps) % self.interval_steps.max(1) != 0 {
            return Some(false);
        }
        if trial.intermediate_values.values().any(|v| v.is_nan()) {
            // a NaN report is never promising
            return Some(true);
        }
        None
    }

    fn name(&self) -> &str {
        "median"
    }
}

fn default_startup() -> usize {
    5
}

fn default_interval() -> u64 {
    1
}

/// The `pruner` block of a study config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrunerConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_startup")]
    pub n_startup_trials: usize,
    #[serde(default)]
    pub n_warmup_steps: u64,
    #[serde(default = "default_interval")]
    pub interval_steps: u64,
}

impl Default for PrunerConfig {
    fn default() -> Self {
        Self {
            kind: "MedianPruner".to_string(),
            n_startup_trials: default_startup(),
            n_warmup_steps: 0,
            interval_steps: default_interval(),
        }
    }
}

pub fn pruner_from_config(config: &PrunerConfig) -> HsResult<Box<dyn Pruner>> {
    match config.kind.as_str() {
        "MedianPruner" => Ok(Box::new(MedianPruner {
            n_startup_trials: config.n_startup_trials,
            n_warmup_steps: config.n_warmup_steps,
            interval_steps: config.interval_steps,
        })),
        "NopPruner" => Ok(Box::new(NopPruner)),
        other => Err(ConfigError::UnsupportedPruner {
            kind: other.to_string(),
            supported: SUPPORTED_PRUNERS,
        }
        .into()),
    }
}
