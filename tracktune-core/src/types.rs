//! Shared data types passed between the tuner, trials and tracking clients.

use serde_json::Value;
use std::collections::BTreeMap;

/// Hyperparameter name → sampled value for a single trial.
pub type TrialConfig = serde_json::Map<String, Value>;

/// Metric name → scalar, one record per reported training iteration.
pub type Metrics = BTreeMap<String, f64>;

/// Config keys reserved for tracker settings carried into trial execution.
pub const RESERVED_TRACKER_KEYS: [&str; 3] = ["wandb", "mlflow", "comet"];

/// Whether `key` names a reserved tracker sub-mapping.
pub fn is_reserved_key(key: &str) -> bool {
    RESERVED_TRACKER_KEYS.contains(&key)
}

/// Copy of `config` without the reserved tracker sub-mappings.
pub fn hyperparameters(config: &TrialConfig) -> TrialConfig {
    config
        .iter()
        .filter(|(k, _)| !is_reserved_key(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Flatten nested hyperparameters into dotted keys (`optimizer.lr`), which
/// is how the tracking services display them.
pub fn flatten_config(config: &TrialConfig) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    for (key, value) in config {
        flatten_into(&mut out, key, value);
    }
    out
}

fn flatten_into(out: &mut BTreeMap<String, Value>, prefix: &str, value: &Value) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (k, v) in map {
                flatten_into(out, &format!("{prefix}.{k}"), v);
            }
        }
        other => {
            out.insert(prefix.to_string(), other.clone());
        }
    }
}

/// Render a config value the way string-only parameter stores expect it.
pub fn param_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
