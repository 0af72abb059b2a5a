//! Experiment analysis: picking the best trial after a run.

use crate::tune::trial::{Trial, TrialStatus};
use crate::types::{Metrics, TrialConfig};
use serde::{Deserialize, Serialize};

/// Whether the target metric is minimized or maximized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Min,
    Max,
}

impl Mode {
    fn better(&self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Self::Min => candidate < incumbent,
            Self::Max => candidate > incumbent,
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Min => write!(f, "min"),
            Self::Max => write!(f, "max"),
        }
    }
}

/// One row of the results table: a trial and its last reported metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub trial_id: String,
    pub status: TrialStatus,
    pub iterations: u64,
    pub config: TrialConfig,
    pub metrics: Metrics,
}

/// Outcome of a finished experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentAnalysis {
    pub experiment_name: String,
    pub metric: String,
    pub mode: Mode,
    pub trials: Vec<Trial>,
}

impl ExperimentAnalysis {
    pub fn new(experiment_name: &str, metric: &str, mode: Mode, trials: Vec<Trial>) -> Self {
        Self {
            experiment_name: experiment_name.to_string(),
            metric: metric.to_string(),
            mode,
            trials,
        }
    }

    /// Trial with the best last-reported value of the target metric.
    ///
    /// Trials that never reported the metric, or reported NaN, are skipped.
    pub fn best_trial(&self) -> Option<&Trial> {
        let mut best: Option<(&Trial, f64)> = None;
        for trial in &self.trials {
            let Some(value) = trial.last_metric(&self.metric) else {
                continue;
            };
            if value.is_nan() {
                continue;
            }
            match best {
                Some((_, incumbent)) if !self.mode.better(value, incumbent) => {}
                _ => best = Some((trial, value)),
            }
        }
        best.map(|(trial, _)| trial)
    }

    /// Hyperparameters of the best trial, tracker settings stripped.
    pub fn best_config(&self) -> Option<TrialConfig> {
        self.best_trial().map(Trial::hyperparameters)
    }

    pub fn best_result(&self) -> Option<&Metrics> {
        self.best_trial()
            .and_then(Trial::last_result)
            .map(|r| &r.metrics)
    }

    pub fn errored_trials(&self) -> Vec<&Trial> {
        self.trials
            .iter()
            .filter(|t| t.status == TrialStatus::Errored)
            .collect()
    }

    pub fn rows(&self) -> Vec<ResultRow> {
        self.trials
            .iter()
            .map(|t| ResultRow {
                trial_id: t.id.clone(),
                status: t.status,
                iterations: t.iterations(),
                config: t.hyperparameters(),
                metrics: t.last_result().map(|r| r.metrics.clone()).unwrap_or_default(),
            })
            .collect()
    }
}
