use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::ConfigError;

/// A concrete parameter value realized for one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Choice(serde_json::Value),
}

impl ParamValue {
    /// Numeric view of the value; categorical numbers count, other choices do not.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Choice(v) => v.as_f64(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Int(v) => serde_json::Value::from(*v),
            Self::Float(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Self::Choice(v) => v.clone(),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Choice(serde_json::Value::String(s)) => write!(f, "{s}"),
            Self::Choice(v) => write!(f, "{v}"),
        }
    }
}

/// Whether the study maximizes or minimizes the objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Maximize,
    Minimize,
}

impl Default for Direction {
    fn default() -> Self {
        Self::Minimize
    }
}

impl Direction {
    /// True when `candidate` improves on `incumbent`.
    pub fn is_better(&self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Direction::Maximize => candidate > incumbent,
            Direction::Minimize => candidate < incumbent,
        }
    }

    /// Best of a set of values, ignoring NaN.
    pub fn best_of<I: IntoIterator<Item = f64>>(&self, values: I) -> Option<f64> {
        values
            .into_iter()
            .filter(|v| !v.is_nan())
            .fold(None, |best, v| match best {
                Some(b) if !self.is_better(v, b) => Some(b),
                _ => Some(v),
            })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Maximize => "maximize",
            Direction::Minimize => "minimize",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "maximize" => Ok(Direction::Maximize),
            "minimize" => Ok(Direction::Minimize),
            other => Err(ConfigError::InvalidDirection {
                value: other.to_string(),
            }),
        }
    }
}

/// Lifecycle state of a single trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrialState {
    Running,
    Complete,
    Pruned,
    Fail,
}

impl TrialState {
    pub fn is_finished(&self) -> bool {
        !matches!(self, TrialState::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TrialState::Running => "RUNNING",
            TrialState::Complete => "COMPLETE",
            TrialState::Pruned => "PRUNED",
            TrialState::Fail => "FAIL",
        }
    }
}

impl fmt::Display for TrialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrialState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(TrialState::Running),
            "COMPLETE" => Ok(TrialState::Complete),
            "PRUNED" => Ok(TrialState::Pruned),
            "FAIL" => Ok(TrialState::Fail),
            other => Err(format!("unknown trial state {other}")),
        }
    }
}
