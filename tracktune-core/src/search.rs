//! Search spaces and trial config generation.
//!
//! Grid domains are expanded as a cartesian product, every other domain is
//! sampled. The whole grid is repeated `num_samples` times and each repeat
//! draws fresh values for the sampled domains.

use crate::error::TuneError;
use crate::types::TrialConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Domain of a single hyperparameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Domain {
    Constant { value: Value },
    Uniform { low: f64, high: f64 },
    LogUniform { low: f64, high: f64 },
    /// Integer in `[low, high)`.
    RandInt { low: i64, high: i64 },
    Choice { values: Vec<Value> },
    GridSearch { values: Vec<Value> },
}

impl Domain {
    pub fn constant(value: impl Into<Value>) -> Self {
        Self::Constant {
            value: value.into(),
        }
    }

    pub fn uniform(low: f64, high: f64) -> Self {
        Self::Uniform { low, high }
    }

    pub fn loguniform(low: f64, high: f64) -> Self {
        Self::LogUniform { low, high }
    }

    pub fn randint(low: i64, high: i64) -> Self {
        Self::RandInt { low, high }
    }

    pub fn choice<V: Into<Value>>(values: impl IntoIterator<Item = V>) -> Self {
        Self::Choice {
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn grid_search<V: Into<Value>>(values: impl IntoIterator<Item = V>) -> Self {
        Self::GridSearch {
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_grid(&self) -> bool {
        matches!(self, Self::GridSearch { .. })
    }

    fn validate(&self, name: &str) -> Result<(), TuneError> {
        let invalid = |message: String| Err(TuneError::InvalidSearchSpace { message });
        match self {
            Self::Constant { .. } => Ok(()),
            Self::Uniform { low, high } => {
                if !low.is_finite() || !high.is_finite() || low >= high {
                    return invalid(format!("'{name}': uniform requires finite low < high"));
                }
                if !(high - low).is_finite() {
                    return invalid(format!("'{name}': uniform range overflows"));
                }
                Ok(())
            }
            Self::LogUniform { low, high } => {
                if !low.is_finite() || !high.is_finite() || *low <= 0.0 || low >= high {
                    return invalid(format!("'{name}': loguniform requires 0 < low < high"));
                }
                if !(high.ln() - low.ln()).is_finite() {
                    return invalid(format!("'{name}': loguniform range overflows"));
                }
                Ok(())
            }
            Self::RandInt { low, high } => {
                if low >= high {
                    return invalid(format!("'{name}': randint requires low < high"));
                }
                Ok(())
            }
            Self::Choice { values } | Self::GridSearch { values } => {
                if values.is_empty() {
                    return invalid(format!("'{name}': no values to choose from"));
                }
                Ok(())
            }
        }
    }

    /// Draw a value. Grid domains are not sampled; they yield their first value.
    fn sample<R: Rng>(&self, rng: &mut R) -> Value {
        match self {
            Self::Constant { value } => value.clone(),
            Self::Uniform { low, high } => Value::from(rng.gen_range(*low..*high)),
            Self::LogUniform { low, high } => {
                let exponent = rng.gen_range(low.ln()..high.ln());
                Value::from(exponent.exp())
            }
            Self::RandInt { low, high } => Value::from(rng.gen_range(*low..*high)),
            Self::Choice { values } => values[rng.gen_range(0..values.len())].clone(),
            Self::GridSearch { values } => values.first().cloned().unwrap_or(Value::Null),
        }
    }
}

/// A named set of hyperparameter domains.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    #[serde(flatten)]
    params: BTreeMap<String, Domain>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, domain: Domain) -> Self {
        self.params.insert(name.into(), domain);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, domain: Domain) {
        self.params.insert(name.into(), domain);
    }

    /// Declared parameter names, in sorted order.
    pub fn keys(&self) -> Vec<String> {
        self.params.keys().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<&Domain> {
        self.params.get(name)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn validate(&self) -> Result<(), TuneError> {
        for (name, domain) in &self.params {
            domain.validate(name)?;
        }
        Ok(())
    }

    /// Number of points in the grid product (1 when there are no grid domains).
    pub fn grid_size(&self) -> usize {
        self.params
            .values()
            .map(|d| match d {
                Domain::GridSearch { values } => values.len(),
                _ => 1,
            })
            .product()
    }

    fn grid_points(&self) -> Vec<BTreeMap<String, Value>> {
        let mut points = vec![BTreeMap::new()];
        for (key, domain) in &self.params {
            let Domain::GridSearch { values } = domain else {
                continue;
            };
            let mut expanded = Vec::with_capacity(points.len() * values.len());
            for point in &points {
                for value in values {
                    let mut p = point.clone();
                    p.insert(key.clone(), value.clone());
                    expanded.push(p);
                }
            }
            points = expanded;
        }
        points
    }

    /// Generate trial configs. Deterministic for a fixed `seed`.
    pub fn generate(&self, num_samples: usize, seed: u64) -> Result<Vec<TrialConfig>, TuneError> {
        self.validate()?;
        if num_samples == 0 {
            return Err(TuneError::InvalidConfig {
                message: "num_samples must be at least 1".into(),
            });
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let grid = self.grid_points();
        let mut configs = Vec::with_capacity(grid.len() * num_samples);

        for _ in 0..num_samples {
            for point in &grid {
                let mut config = TrialConfig::new();
                for (name, domain) in &self.params {
                    let value = match point.get(name) {
                        Some(v) => v.clone(),
                        None => domain.sample(&mut rng),
                    };
                    config.insert(name.clone(), value);
                }
                configs.push(config);
            }
        }

        Ok(configs)
    }
}
