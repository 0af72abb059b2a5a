//! Trials and the results they report.

use crate::types::{self, Metrics, TrialConfig};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle of a trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    Pending,
    Running,
    Terminated,
    Errored,
    Cancelled,
}

impl TrialStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Terminated | Self::Errored | Self::Cancelled)
    }
}

impl std::fmt::Display for TrialStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Terminated => "TERMINATED",
            Self::Errored => "ERROR",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// One metrics record reported by a trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    pub trial_id: String,
    /// 1-based step counter, incremented on every report.
    pub training_iteration: u64,
    pub metrics: Metrics,
    pub timestamp: DateTime<Utc>,
    pub done: bool,
}

/// A single execution of the trainable under one sampled config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trial {
    pub id: String,
    pub index: usize,
    pub experiment_name: String,
    pub config: TrialConfig,
    pub status: TrialStatus,
    pub results: Vec<TrialResult>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Trial {
    pub fn new(experiment_name: &str, tag: &str, index: usize, config: TrialConfig) -> Self {
        Self {
            id: format!("{experiment_name}_{tag}_{index:05}"),
            index,
            experiment_name: experiment_name.to_string(),
            config,
            status: TrialStatus::Pending,
            results: Vec::new(),
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn last_result(&self) -> Option<&TrialResult> {
        self.results.last()
    }

    /// Value of `metric` in the last result that reported it.
    pub fn last_metric(&self, metric: &str) -> Option<f64> {
        self.results
            .iter()
            .rev()
            .find_map(|r| r.metrics.get(metric).copied())
    }

    pub fn iterations(&self) -> u64 {
        self.results
            .last()
            .map(|r| r.training_iteration)
            .unwrap_or(0)
    }

    /// The trial config without the reserved tracker sub-mappings.
    pub fn hyperparameters(&self) -> TrialConfig {
        types::hyperparameters(&self.config)
    }

    /// Tracker settings carried in the config under `key` (`wandb`, `mlflow`, `comet`).
    pub fn tracker_config(&self, key: &str) -> Option<&Value> {
        self.config.get(key)
    }

    pub(crate) fn mark_running(&mut self) {
        self.status = TrialStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub(crate) fn record(&mut self, result: TrialResult) {
        self.results.push(result);
    }

    pub(crate) fn mark_finished(&mut self, status: TrialStatus, error: Option<String>) {
        self.status = status;
        self.error = error;
        self.finished_at = Some(Utc::now());
        if let Some(last) = self.results.last_mut() {
            last.done = status == TrialStatus::Terminated;
        }
    }
}
