//! Maps trial suggestions onto the nested model config.
//!
//! Parameter keys are `:`-separated paths into the model document, e.g.
//! `model:dense_hidden_dim1`. Keys without a `:` are not applied
//! automatically; training code asks for them with [`suggest_named`].

use hs_optimizer::{SuggestSpec, Trial};
use hs_types::{ConfigError, HsResult, ParamValue};
use serde_json::{Map, Value};
use tracing::{debug, info};

/// Parameters block of a model document that carries its `optuna` section.
fn parameters(config: &Value) -> Map<String, Value> {
    config
        .pointer("/optuna/parameters")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

/// Ask `trial` for a value of one `{type, settings}` spec.
pub fn trial_suggest(trial: &mut Trial<'_>, spec: &Value) -> HsResult<ParamValue> {
    let spec = SuggestSpec::from_value(spec)?;
    trial.suggest_spec(&spec)
}

/// Write `value` at `path` inside `doc`, creating missing mappings on the way.
pub fn set_path(doc: &mut Value, path: &[&str], value: Value) -> HsResult<()> {
    let Some((last, parents)) = path.split_last() else {
        return Err(hs_types::config_error!("empty parameter path"));
    };

    let mut node = doc;
    for (depth, key) in parents.iter().enumerate() {
        node = match node.as_object_mut() {
            Some(map) => map
                .entry(key.to_string())
                .or_insert_with(|| Value::Object(Map::new())),
            None => return Err(not_a_mapping(&path[..depth])),
        };
    }
    match node.as_object_mut() {
        Some(map) => {
            map.insert(last.to_string(), value);
            Ok(())
        }
        None => Err(not_a_mapping(parents)),
    }
}

fn not_a_mapping(path: &[&str]) -> hs_types::HsError {
    ConfigError::InvalidValue {
        field: path.join(":"),
        message: "is not a mapping and cannot hold nested parameters".to_string(),
    }
    .into()
}

/// Copy of `config` with every `:` parameter replaced by the trial's suggestion.
pub fn update_config(trial: &mut Trial<'_>, config: &Value) -> HsResult<Value> {
    info!("Attempting to automatically update the model configuration using suggested parameters");

    let mut conf = config.clone();
    let mut updated = Vec::new();
    for (key, spec) in parameters(config) {
        if !key.contains(':') {
            continue;
        }
        let value = trial_suggest(trial, &spec)?.to_json();
        debug!("Setting {} = {}", key, value);
        let path: Vec<&str> = key.split(':').collect();
        set_path(&mut conf, &path, value)?;
        updated.push(key);
    }

    info!("Those that got updated automatically: {:?}", updated);
    Ok(conf)
}

/// Suggest the parameter whose key or settings name is `name`.
///
/// Returns `None` when no such parameter is configured.
pub fn suggest_named(trial: &mut Trial<'_>, config: &Value, name: &str) -> HsResult<Option<ParamValue>> {
    let parameters = parameters(config);
    let spec = parameters.get(name).or_else(|| {
        parameters
            .values()
            .find(|spec| spec.pointer("/settings/name").and_then(Value::as_str) == Some(name))
    });
    match spec {
        Some(spec) => trial_suggest(trial, spec).map(Some),
        None => Ok(None),
    }
}
