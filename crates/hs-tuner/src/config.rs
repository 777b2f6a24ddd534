//! Hyperparameter and model configuration files.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hs_optimizer::{
    pruner_from_config, sampler_from_config, Pruner, PrunerConfig, Sampler, SamplerConfig,
    SearchSpace, StudyConfig,
};
use hs_types::{ConfigError, Direction, HsError, HsResult};
use serde::{Deserialize, Deserializer, Serialize};

#[derive(Deserialize)]
#[serde(untagged)]
enum Flag {
    Bool(bool),
    Int(i64),
}

/// Accept `true`/`false` as well as `1`/`0`.
fn bool_or_int<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => b,
        Flag::Int(i) => i != 0,
    })
}

/// The `optuna` block of the hyperparameter config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptunaSection {
    pub name: String,
    pub save_path: PathBuf,
    #[serde(default, deserialize_with = "bool_or_int")]
    pub reload: bool,
    /// Command that trains one trial; the trial config path is appended.
    #[serde(default)]
    pub objective: Option<String>,
    pub direction: String,
    pub metric: String,
    pub n_trials: usize,
    /// Wall-clock budget per worker, in seconds.
    #[serde(default)]
    pub timeout: Option<f64>,
    #[serde(default, deserialize_with = "bool_or_int")]
    pub gpu: bool,
    #[serde(default)]
    pub sampler: Option<SamplerConfig>,
    #[serde(default)]
    pub pruner: Option<PrunerConfig>,
    /// Dotted parameter path to `{type, settings}`.
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

fn default_log_path() -> PathBuf {
    PathBuf::from("log.txt")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSection {
    #[serde(default = "default_log_path")]
    pub save_path: PathBuf,
}

fn default_jobs() -> usize {
    1
}

/// The `slurm` block: what `hs-launch` submits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlurmSection {
    #[serde(default = "default_jobs")]
    pub jobs: usize,
    /// `#SBATCH` options, in file order.
    #[serde(default)]
    pub batch: serde_yaml::Mapping,
    /// Shell lines run before the worker starts (module loads, env activation).
    #[serde(default)]
    pub environment: Vec<String>,
    /// Worker command; defaults to `hs-run`.
    #[serde(default)]
    pub command: Option<String>,
}

/// Parsed hyperparameter config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HyperConfig {
    pub optuna: OptunaSection,
    #[serde(default)]
    pub log: Option<LogSection>,
    #[serde(default)]
    pub slurm: Option<SlurmSection>,
}

impl OptunaSection {
    pub fn direction(&self) -> HsResult<Direction> {
        Ok(self.direction.parse::<Direction>()?)
    }

    pub fn timeout(&self) -> HsResult<Option<Duration>> {
        match self.timeout {
            None => Ok(None),
            Some(secs) if secs.is_finite() && secs >= 0.0 => Ok(Some(Duration::from_secs_f64(secs))),
            Some(secs) => Err(ConfigError::InvalidValue {
                field: "optuna.timeout".to_string(),
                message: format!("{secs} is not a number of seconds"),
            }
            .into()),
        }
    }

    /// SQLite file holding the study.
    pub fn study_path(&self) -> PathBuf {
        self.save_path.join(&self.name)
    }

    pub fn study_config(&self, reload: bool) -> HsResult<StudyConfig> {
        Ok(StudyConfig::new(self.name.clone(), self.study_path())
            .with_direction(self.direction()?)
            .with_reload(reload))
    }

    pub fn search_space(&self) -> HsResult<SearchSpace> {
        SearchSpace::from_parameters(&serde_json::Value::Object(self.parameters.clone()))
    }

    pub fn sampler(&self, space: &SearchSpace) -> HsResult<Box<dyn Sampler>> {
        sampler_from_config(&self.sampler.clone().unwrap_or_default(), space)
    }

    pub fn pruner(&self) -> HsResult<Box<dyn Pruner>> {
        pruner_from_config(&self.pruner.clone().unwrap_or_default())
    }

    /// Check everything that can be checked before touching the study.
    pub fn validate(&self) -> HsResult<()> {
        self.direction()?;
        self.timeout()?;
        let space = self.search_space()?;
        self.sampler(&space)?;
        self.pruner()?;
        Ok(())
    }
}

impl HyperConfig {
    pub fn from_file(path: impl AsRef<Path>) -> HsResult<Self> {
        let path = path.as_ref();
        let raw = read_yaml(path, "Hyperparameter optimization config")?;
        Self::from_yaml(raw, path)
    }

    fn from_yaml(raw: serde_yaml::Value, path: &Path) -> HsResult<Self> {
        let config: Self = serde_yaml::from_value(raw).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        config.optuna.validate()?;
        Ok(config)
    }

    /// Debug log file, when a `log` section is present.
    pub fn log_path(&self) -> Option<&Path> {
        self.log.as_ref().map(|log| log.save_path.as_path())
    }
}

/// Both configs of a sweep. The model document carries a copy of the
/// hyper config's `optuna` block under the `optuna` key.
#[derive(Debug, Clone)]
pub struct Configs {
    pub hyper: HyperConfig,
    pub model: serde_json::Value,
}

fn read_yaml(path: &Path, kind: &str) -> HsResult<serde_yaml::Value> {
    if !path.is_file() {
        return Err(ConfigError::MissingFile {
            kind: kind.to_string(),
            path: path.display().to_string(),
        }
        .into());
    }
    let text = fs::read_to_string(path)?;
    serde_yaml::from_str(&text).map_err(|e| {
        HsError::from(ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    })
}

pub fn load_configs(hyper_path: impl AsRef<Path>, model_path: impl AsRef<Path>) -> HsResult<Configs> {
    let hyper_path = hyper_path.as_ref();
    let model_path = model_path.as_ref();

    let raw = read_yaml(hyper_path, "Hyperparameter optimization config")?;
    let optuna_block = serde_json::to_value(&raw["optuna"])?;
    let hyper = HyperConfig::from_yaml(raw, hyper_path)?;

    let model = serde_json::to_value(read_yaml(model_path, "Model config")?)?;
    let mut model = match model {
        serde_json::Value::Object(map) => map,
        serde_json::Value::Null => serde_json::Map::new(),
        _ => {
            return Err(ConfigError::Invalid(format!(
                "model config {} must be a mapping",
                model_path.display()
            ))
            .into())
        }
    };
    model.insert("optuna".to_string(), optuna_block);

    Ok(Configs {
        hyper,
        model: serde_json::Value::Object(model),
    })
}
