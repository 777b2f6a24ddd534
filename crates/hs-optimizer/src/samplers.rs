//! Samplers: how a trial's parameter values are chosen.
//!
//! TPE and random search run inside the `optimizer` engine. The grid walk is
//! kept here because it has to coordinate workers through the shared store.

use hs_types::{ConfigError, Direction, HsResult, ParamValue};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::distributions::{Distribution, SearchSpace};
use crate::engine::{engine_direction, engine_err};
use crate::trial::FrozenTrial;

/// Sampler kinds accepted in the `sampler.type` config field.
pub const SUPPORTED_SAMPLERS: &[&str] = &["TPESampler", "GridSampler", "RandomSampler"];

/// Common trait for all samplers.
pub trait Sampler: Send {
    /// Engine study that draws values for trial `trial_number`.
    fn engine(&self, direction: Direction, trial_number: usize) -> HsResult<optimizer::Study<f64>>;

    /// Values the next trial must take whatever the engine says, chosen from
    /// every trial in the store.
    fn fixed_params(&mut self, _history: &[FrozenTrial]) -> HsResult<BTreeMap<String, ParamValue>> {
        Ok(BTreeMap::new())
    }

    /// Human-readable sampler name.
    fn name(&self) -> &str;
}

// Each trial gets its own engine, so a fixed seed is offset by the trial number.
fn trial_seed(seed: Option<u64>, trial_number: usize) -> Option<u64> {
    seed.map(|s| s.wrapping_add(trial_number as u64))
}

fn random_engine(direction: Direction, seed: Option<u64>) -> optimizer::Study<f64> {
    let direction = engine_direction(direction);
    match seed {
        Some(seed) => optimizer::Study::with_sampler(direction, optimizer::sampler::RandomSampler::with_seed(seed)),
        None => optimizer::Study::with_sampler(direction, optimizer::sampler::RandomSampler::new()),
    }
}

// ---- TPE ----

/// Tree-structured Parzen Estimator from the `optimizer` engine.
#[derive(Debug, Clone, PartialEq)]
pub struct TpeSampler {
    pub seed: Option<u64>,
    /// Trials drawn at random before the estimator takes over.
    pub n_startup_trials: usize,
}

impl Default for TpeSampler {
    fn default() -> Self {
        Self {
            seed: None,
            n_startup_trials: default_startup_trials(),
        }
    }
}

impl Sampler for TpeSampler {
    fn engine(&self, direction: Direction, trial_number: usize) -> HsResult<optimizer::Study<f64>> {
        let mut builder = optimizer::sampler::TpeSampler::builder().n_startup_trials(self.n_startup_trials);
        if let Some(seed) = trial_seed(self.seed, trial_number) {
            builder = builder.seed(seed);
        }
        let sampler = builder.build().map_err(engine_err)?;
        Ok(optimizer::Study::with_sampler(engine_direction(direction), sampler))
    }

    fn name(&self) -> &str {
        "tpe"
    }
}

// ---- Random ----

/// Independent random sampling across the search space.
#[derive(Debug, Clone, PartialEq)]
pub struct RandomSampler {
    seed: Option<u64>,
}

impl RandomSampler {
    pub fn new(seed: Option<u64>) -> Self {
        Self { seed }
    }
}

impl Sampler for RandomSampler {
    fn engine(&self, direction: Direction, trial_number: usize) -> HsResult<optimizer::Study<f64>> {
        Ok(random_engine(direction, trial_seed(self.seed, trial_number)))
    }

    fn name(&self) -> &str {
        "random"
    }
}

// ---- Grid ----

#[derive(Debug, Clone)]
enum Axis {
    Explicit(Vec<ParamValue>),
    Range(Distribution),
}

impl Axis {
    fn len(&self, float_steps: usize) -> Option<usize> {
        match self {
            Axis::Explicit(values) => Some(values.len()),
            Axis::Range(dist) => dist.grid_len(float_steps),
        }
    }

    fn value(&self, k: usize, float_steps: usize) -> ParamValue {
        match self {
            Axis::Explicit(values) => values[k].clone(),
            Axis::Range(dist) => dist.grid_value(k, float_steps),
        }
    }

    fn index_of(&self, value: &ParamValue, float_steps: usize) -> Option<usize> {
        match self {
            Axis::Explicit(values) => {
                let raw = value.to_json();
                values.iter().position(|v| v.to_json() == raw)
            }
            Axis::Range(dist) => dist.grid_index(value, float_steps),
        }
    }
}

/// Exhaustive grid over discrete parameter combinations.
///
/// Points are numbered in mixed radix over the axes and decoded on demand,
/// so huge grids cost nothing up front. Each trial takes the lowest-numbered
/// point no trial in the store has used yet, so workers sharing a study walk
/// the grid together. Once every point is taken the sampler falls back to
/// random grid points. Parameters outside the grid go to the engine's random
/// sampler.
#[derive(Debug, Clone)]
pub struct GridSampler {
    axes: Vec<(String, Axis)>,
    lens: Vec<usize>,
    total: usize,
    float_steps: usize,
    seed: Option<u64>,
    rng: ChaCha8Rng,
}

impl GridSampler {
    fn build(axes: Vec<(String, Axis)>, float_steps: usize, seed: Option<u64>) -> HsResult<Self> {
        let too_large = |what: String| ConfigError::InvalidValue {
            field: "sampler.search_space".to_string(),
            message: what,
        };
        let mut lens = Vec::with_capacity(axes.len());
        let mut total: usize = 1;
        for (name, axis) in &axes {
            let len = axis
                .len(float_steps)
                .ok_or_else(|| too_large(format!("axis {name} has too many points")))?;
            if len == 0 {
                return Err(too_large(format!("axis {name} is empty")).into());
            }
            total = total
                .checked_mul(len)
                .ok_or_else(|| too_large("grid has too many points to index".to_string()))?;
            lens.push(len);
        }
        let rng = match seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        Ok(Self {
            axes,
            lens,
            total,
            float_steps,
            seed,
            rng,
        })
    }

    /// Grid over explicit candidate values per parameter.
    pub fn new(axes: BTreeMap<String, Vec<ParamValue>>, seed: Option<u64>) -> HsResult<Self> {
        let axes = axes
            .into_iter()
            .map(|(name, values)| (name, Axis::Explicit(values)))
            .collect();
        Self::build(axes, 2, seed)
    }

    /// Grid derived from distributions; continuous ranges get `float_steps` points.
    pub fn from_search_space(space: &SearchSpace, float_steps: usize, seed: Option<u64>) -> HsResult<Self> {
        let axes = space
            .parameters
            .iter()
            .map(|p| (p.name.clone(), Axis::Range(p.distribution.clone())))
            .collect();
        Self::build(axes, float_steps, seed)
    }

    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    fn decode(&self, mut point: usize) -> BTreeMap<String, ParamValue> {
        let mut combo = BTreeMap::new();
        for ((name, axis), len) in self.axes.iter().zip(&self.lens).rev() {
            combo.insert(name.clone(), axis.value(point % len, self.float_steps));
            point /= len;
        }
        combo
    }

    fn encode(&self, params: &BTreeMap<String, ParamValue>) -> Option<usize> {
        let mut point = 0usize;
        for ((name, axis), len) in self.axes.iter().zip(&self.lens) {
            let k = axis.index_of(params.get(name)?, self.float_steps)?;
            point = point * len + k;
        }
        Some(point)
    }
}

impl Sampler for GridSampler {
    fn engine(&self, direction: Direction, trial_number: usize) -> HsResult<optimizer::Study<f64>> {
        Ok(random_engine(direction, trial_seed(self.seed, trial_number)))
    }

    fn fixed_params(&mut self, history: &[FrozenTrial]) -> HsResult<BTreeMap<String, ParamValue>> {
        let used: HashSet<usize> = history
            .iter()
            .filter(|t| !t.params.is_empty())
            .filter_map(|t| self.encode(&t.params))
            .collect();
        // stops within used.len() + 1 candidates
        let point = (0..self.total).find(|p| !used.contains(p)).unwrap_or_else(|| {
            tracing::debug!("Grid exhausted; re-sampling a random grid point");
            self.rng.gen_range(0..self.total)
        });
        Ok(self.decode(point))
    }

    fn name(&self) -> &str {
        "grid"
    }
}

fn default_startup_trials() -> usize {
    10
}

fn default_grid_steps() -> usize {
    5
}

/// The `sampler` block of a study config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub seed: Option<u64>,
    /// Explicit grid for `GridSampler`: parameter name to candidate values.
    #[serde(default)]
    pub search_space: Option<BTreeMap<String, Vec<serde_json::Value>>>,
    /// Random trials before TPE starts modelling.
    #[serde(default = "default_startup_trials")]
    pub n_startup_trials: usize,
    #[serde(default = "default_grid_steps")]
    pub grid_steps: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            kind: "TPESampler".to_string(),
            seed: None,
            search_space: None,
            n_startup_trials: default_startup_trials(),
            grid_steps: default_grid_steps(),
        }
    }
}

/// Build the sampler named by `config`; `space` seeds a grid when none is given.
pub fn sampler_from_config(config: &SamplerConfig, space: &SearchSpace) -> HsResult<Box<dyn Sampler>> {
    match config.kind.as_str() {
        "TPESampler" => Ok(Box::new(TpeSampler {
            seed: config.seed,
            n_startup_trials: config.n_startup_trials,
        })),
        "RandomSampler" => Ok(Box::new(RandomSampler::new(config.seed))),
        "GridSampler" => {
            let sampler = match &config.search_space {
                Some(grid) => {
                    let axes = grid
                        .iter()
                        .map(|(name, values)| {
                            let values = values
                                .iter()
                                .map(|v| match space.get(name) {
                                    Some(dist) => dist.value_from_json(v),
                                    None => ParamValue::Choice(v.clone()),
                                })
                                .collect();
                            (name.clone(), values)
                        })
                        .collect();
                    GridSampler::new(axes, config.seed)?
                }
                None => GridSampler::from_search_space(space, config.grid_steps, config.seed)?,
            };
            tracing::info!("Grid sampler covers {} combinations", sampler.len());
            Ok(Box::new(sampler))
        }
        other => Err(ConfigError::UnsupportedSampler {
            kind: other.to_string(),
            supported: SUPPORTED_SAMPLERS,
        }
        .into()),
    }
}
