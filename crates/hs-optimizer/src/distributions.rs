//! Parameter distributions, suggestion specs and search spaces.

use hs_types::{ConfigError, HsResult, ParamValue};
use serde::{Deserialize, Serialize};

/// Distribution kinds accepted in a suggestion spec's `type` field.
pub const SUPPORTED_DISTRIBUTIONS: &[&str] = &[
    "categorical",
    "discrete_uniform",
    "float",
    "int",
    "loguniform",
    "uniform",
];

/// Describes how a parameter is sampled.
///
/// `uniform`, `loguniform` and `discrete_uniform` specs all normalize to
/// [`Distribution::Float`] with the matching `log`/`step` settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Distribution {
    /// Continuous range [low, high], optionally log-scaled or discretized by `step`.
    Float {
        low: f64,
        high: f64,
        step: Option<f64>,
        log: bool,
    },
    /// Integer range [low, high] inclusive.
    Int {
        low: i64,
        high: i64,
        step: i64,
        log: bool,
    },
    /// Categorical choices.
    Categorical { choices: Vec<serde_json::Value> },
}

impl Distribution {
    pub fn uniform(low: f64, high: f64) -> Self {
        Self::Float {
            low,
            high,
            step: None,
            log: false,
        }
    }

    pub fn log_uniform(low: f64, high: f64) -> Self {
        Self::Float {
            low,
            high,
            step: None,
            log: true,
        }
    }

    pub fn discrete_uniform(low: f64, high: f64, q: f64) -> Self {
        Self::Float {
            low,
            high,
            step: Some(q),
            log: false,
        }
    }

    pub fn int(low: i64, high: i64) -> Self {
        Self::Int {
            low,
            high,
            step: 1,
            log: false,
        }
    }

    pub fn categorical(choices: Vec<serde_json::Value>) -> Self {
        Self::Categorical { choices }
    }

    /// Reject ranges the samplers cannot draw from.
    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::InvalidValue {
            field: name.to_string(),
            message,
        };
        match self {
            Self::Float {
                low,
                high,
                step,
                log,
            } => {
                if !(low.is_finite() && high.is_finite()) || low > high {
                    return Err(invalid(format!("low {low} must not exceed high {high}")));
                }
                if *log && *low <= 0.0 {
                    return Err(invalid(format!("log scale needs low > 0, got {low}")));
                }
                match step {
                    Some(_) if *log => {
                        return Err(invalid("step cannot be combined with log".into()))
                    }
                    Some(q) if *q <= 0.0 => {
                        return Err(invalid(format!("step must be positive, got {q}")))
                    }
                    _ => {}
                }
            }
            Self::Int {
                low,
                high,
                step,
                log,
            } => {
                if low > high {
                    return Err(invalid(format!("low {low} must not exceed high {high}")));
                }
                if *step <= 0 {
                    return Err(invalid(format!("step must be positive, got {step}")));
                }
                if int_steps(*low, *high, *step).is_none() {
                    return Err(invalid(format!(
                        "range {low}..={high} is too wide for an integer parameter"
                    )));
                }
                if *log && (*low < 1 || *step != 1) {
                    return Err(invalid("log scale needs low >= 1 and step 1".into()));
                }
            }
            Self::Categorical { choices } => {
                if choices.is_empty() {
                    return Err(invalid("choices must not be empty".into()));
                }
            }
        }
        Ok(())
    }

    /// Whether `value` could have been drawn from this distribution.
    pub fn contains(&self, value: &ParamValue) -> bool {
        match (self, value) {
            (Self::Float { low, high, .. }, v) => v
                .as_f64()
                .map(|x| x >= *low && x <= *high)
                .unwrap_or(false),
            (Self::Int { low, high, .. }, ParamValue::Int(v)) => v >= low && v <= high,
            (Self::Categorical { choices }, v) => choices.contains(&v.to_json()),
            _ => false,
        }
    }

    /// Number of grid points along this axis; continuous ranges get `float_steps` points.
    ///
    /// `None` when the axis is too long to index.
    pub fn grid_len(&self, float_steps: usize) -> Option<usize> {
        match self {
            Self::Float {
                low,
                high,
                step: Some(q),
                ..
            } => {
                let n = ((high - low) / q).floor();
                if !n.is_finite() || n >= usize::MAX as f64 {
                    return None;
                }
                (n.max(0.0) as usize).checked_add(1)
            }
            Self::Float { .. } => Some(float_steps.max(2)),
            Self::Int { low, high, step, .. } => int_steps(*low, *high, *step)
                .and_then(|n| usize::try_from(n).ok())
                .and_then(|n| n.checked_add(1)),
            Self::Categorical { choices } => Some(choices.len()),
        }
    }

    /// The `k`-th grid point, counting from `low`.
    pub fn grid_value(&self, k: usize, float_steps: usize) -> ParamValue {
        match self {
            Self::Float {
                low,
                high,
                step: Some(q),
                ..
            } => ParamValue::Float((low + k as f64 * q).min(*high)),
            Self::Float { low, high, log, .. } => {
                let steps = float_steps.max(2);
                let (a, b) = if *log {
                    (low.ln(), high.ln())
                } else {
                    (*low, *high)
                };
                let t = k.min(steps - 1) as f64 / (steps - 1) as f64;
                let x = a + t * (b - a);
                // exp(ln(x)) can drift a few ulps outside the range
                ParamValue::Float(if *log { x.exp().clamp(*low, *high) } else { x })
            }
            Self::Int { low, high, step, .. } => {
                let offset = i64::try_from(k).ok().and_then(|k| k.checked_mul(*step));
                let v = offset.and_then(|o| low.checked_add(o)).unwrap_or(*high);
                ParamValue::Int(v.min(*high))
            }
            Self::Categorical { choices } => {
                ParamValue::Choice(choices[k.min(choices.len().saturating_sub(1))].clone())
            }
        }
    }

    /// Position of `value` on the grid, if it is a grid point.
    pub fn grid_index(&self, value: &ParamValue, float_steps: usize) -> Option<usize> {
        let len = self.grid_len(float_steps)?;
        let k = match (self, value) {
            (Self::Categorical { choices }, v) => return choices.iter().position(|c| *c == v.to_json()),
            (Self::Int { low, step, .. }, ParamValue::Int(v)) => {
                let offset = v.checked_sub(*low)?;
                if offset < 0 || offset % step != 0 {
                    return None;
                }
                let k = usize::try_from(offset / step).ok()?;
                return (k < len).then_some(k);
            }
            (Self::Int { .. }, _) => return None,
            (Self::Float { low, step: Some(q), .. }, v) => {
                let x = v.as_f64()?;
                ((x - low) / q).round().max(0.0) as usize
            }
            (Self::Float { low, high, log, .. }, v) => {
                let x = v.as_f64()?;
                let (a, b, x) = if *log {
                    (low.ln(), high.ln(), x.ln())
                } else {
                    (*low, *high, x)
                };
                if b == a {
                    0
                } else {
                    ((x - a) / (b - a) * (len - 1) as f64).round().max(0.0) as usize
                }
            }
        };
        if k >= len {
            return None;
        }
        let point = self.grid_value(k, float_steps).as_f64()?;
        let x = value.as_f64()?;
        ((point - x).abs() <= 1e-9 * point.abs().max(1.0)).then_some(k)
    }

    /// Convert a JSON value (e.g. from a grid config) into a value of this kind.
    pub fn value_from_json(&self, value: &serde_json::Value) -> ParamValue {
        match self {
            Self::Int { .. } => value
                .as_i64()
                .map(ParamValue::Int)
                .unwrap_or_else(|| ParamValue::Choice(value.clone())),
            Self::Float { .. } => value
                .as_f64()
                .map(ParamValue::Float)
                .unwrap_or_else(|| ParamValue::Choice(value.clone())),
            Self::Categorical { .. } => ParamValue::Choice(value.clone()),
        }
    }
}

/// Count of `step`s between `low` and `high`; `None` when the span overflows.
fn int_steps(low: i64, high: i64, step: i64) -> Option<i64> {
    high.checked_sub(low)?.checked_div(step)
}

/// A named distribution, parsed from a `{type, settings}` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestSpec {
    pub name: String,
    pub distribution: Distribution,
}

#[derive(Deserialize)]
struct RangeSettings {
    name: String,
    low: f64,
    high: f64,
}

#[derive(Deserialize)]
struct DiscreteSettings {
    name: String,
    low: f64,
    high: f64,
    q: f64,
}

#[derive(Deserialize)]
struct FloatSettings {
    name: String,
    low: f64,
    high: f64,
    #[serde(default)]
    step: Option<f64>,
    #[serde(default)]
    log: bool,
}

fn default_int_step() -> i64 {
    1
}

#[derive(Deserialize)]
struct IntSettings {
    name: String,
    low: i64,
    high: i64,
    #[serde(default = "default_int_step")]
    step: i64,
    #[serde(default)]
    log: bool,
}

#[derive(Deserialize)]
struct CategoricalSettings {
    name: String,
    choices: Vec<serde_json::Value>,
}

impl SuggestSpec {
    /// Parse a `{type, settings}` mapping.
    pub fn from_value(value: &serde_json::Value) -> HsResult<Self> {
        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| ConfigError::MissingField {
                field: "type".to_string(),
            })?;
        let settings = value
            .get("settings")
            .cloned()
            .ok_or_else(|| ConfigError::MissingField {
                field: format!("settings of {kind} parameter"),
            })?;

        let parse_err = |e: serde_json::Error| ConfigError::InvalidValue {
            field: format!("{kind} settings"),
            message: e.to_string(),
        };

        let spec = match kind {
            "categorical" => {
                let s: CategoricalSettings = serde_json::from_value(settings).map_err(parse_err)?;
                Self {
                    name: s.name,
                    distribution: Distribution::categorical(s.choices),
                }
            }
            "discrete_uniform" => {
                let s: DiscreteSettings = serde_json::from_value(settings).map_err(parse_err)?;
                Self {
                    name: s.name,
                    distribution: Distribution::discrete_uniform(s.low, s.high, s.q),
                }
            }
            "float" => {
                let s: FloatSettings = serde_json::from_value(settings).map_err(parse_err)?;
                Self {
                    name: s.name,
                    distribution: Distribution::Float {
                        low: s.low,
                        high: s.high,
                        step: s.step,
                        log: s.log,
                    },
                }
            }
            "int" => {
                let s: IntSettings = serde_json::from_value(settings).map_err(parse_err)?;
                Self {
                    name: s.name,
                    distribution: Distribution::Int {
                        low: s.low,
                        high: s.high,
                        step: s.step,
                        log: s.log,
                    },
                }
            }
            "loguniform" => {
                let s: RangeSettings = serde_json::from_value(settings).map_err(parse_err)?;
                Self {
                    name: s.name,
                    distribution: Distribution::log_uniform(s.low, s.high),
                }
            }
            "uniform" => {
                let s: RangeSettings = serde_json::from_value(settings).map_err(parse_err)?;
                Self {
                    name: s.name,
                    distribution: Distribution::uniform(s.low, s.high),
                }
            }
            other => {
                return Err(ConfigError::UnsupportedDistribution {
                    kind: other.to_string(),
                    supported: SUPPORTED_DISTRIBUTIONS,
                }
                .into())
            }
        };

        spec.distribution.validate(&spec.name)?;
        Ok(spec)
    }
}

/// A single parameter dimension in the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    pub name: String,
    pub distribution: Distribution,
}

/// The full search space: an ordered list of parameter definitions.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SearchSpace {
    pub parameters: Vec<ParameterDef>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect every spec of a `parameters` mapping, in document order.
    pub fn from_parameters(parameters: &serde_json::Value) -> HsResult<Self> {
        let mut space = Self::new();
        if let Some(map) = parameters.as_object() {
            for spec in map.values() {
                let spec = SuggestSpec::from_value(spec)?;
                space = space.add(spec.name, spec.distribution);
            }
        }
        Ok(space)
    }

    pub fn add(mut self, name: impl Into<String>, distribution: Distribution) -> Self {
        let name = name.into();
        if !self.parameters.iter().any(|p| p.name == name) {
            self.parameters.push(ParameterDef { name, distribution });
        }
        self
    }

    pub fn add_float(self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.add(name, Distribution::uniform(low, high))
    }

    pub fn add_int(self, name: impl Into<String>, low: i64, high: i64) -> Self {
        self.add(name, Distribution::int(low, high))
    }

    pub fn add_log_uniform(self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.add(name, Distribution::log_uniform(low, high))
    }

    pub fn add_choice(self, name: impl Into<String>, values: Vec<serde_json::Value>) -> Self {
        self.add(name, Distribution::categorical(values))
    }

    pub fn get(&self, name: &str) -> Option<&Distribution> {
        self.parameters
            .iter()
            .find(|p| p.name == name)
            .map(|p| &p.distribution)
    }
}
