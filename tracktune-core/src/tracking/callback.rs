//! Logger callbacks: forward every trial result to a tracking service.

use crate::error::TrackingError;
use crate::tracking::client::{RunHandle, RunOutcome, RunSpec, TrackingClient};
use crate::tune::trial::{Trial, TrialResult, TrialStatus};
use crate::types::Metrics;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Hooks the tuner calls while an experiment runs.
///
/// For every started trial: `on_trial_start` once, `on_trial_result` once per
/// report in report order, then exactly one of `on_trial_complete` or
/// `on_trial_error`.
#[async_trait]
pub trait LoggerCallback: Send + Sync {
    async fn on_trial_start(&self, _trial: &Trial) -> Result<(), TrackingError> {
        Ok(())
    }

    async fn on_trial_result(
        &self,
        _trial: &Trial,
        _result: &TrialResult,
    ) -> Result<(), TrackingError> {
        Ok(())
    }

    async fn on_trial_complete(&self, _trial: &Trial) -> Result<(), TrackingError> {
        Ok(())
    }

    async fn on_trial_error(&self, _trial: &Trial, _error: &str) -> Result<(), TrackingError> {
        Ok(())
    }

    async fn on_experiment_end(&self, _trials: &[Trial]) -> Result<(), TrackingError> {
        Ok(())
    }
}

/// Settings shared by all tracking logger callbacks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackerSettings {
    /// Project / experiment override; the client's own setting is used when unset.
    #[serde(default)]
    pub project: Option<String>,
    /// Run group; defaults to the experiment name.
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Metric names never forwarded.
    #[serde(default)]
    pub excluded_metrics: Vec<String>,
    /// Log hyperparameters when a run opens.
    #[serde(default = "default_true")]
    pub log_config: bool,
}

fn default_true() -> bool {
    true
}

impl TrackerSettings {
    pub fn new() -> Self {
        Self {
            log_config: true,
            ..Default::default()
        }
    }
}

/// Forwards trial results to a [`TrackingClient`], one tracking run per trial.
pub struct TrackingLoggerCallback {
    client: Arc<dyn TrackingClient>,
    settings: TrackerSettings,
    runs: Mutex<HashMap<String, RunHandle>>,
}

impl TrackingLoggerCallback {
    pub fn new(client: Arc<dyn TrackingClient>, settings: TrackerSettings) -> Self {
        Self {
            client,
            settings,
            runs: Mutex::new(HashMap::new()),
        }
    }

    pub fn client_name(&self) -> &str {
        self.client.name()
    }

    /// Number of runs currently open.
    pub async fn open_runs(&self) -> usize {
        self.runs.lock().await.len()
    }

    fn spec_for(&self, trial: &Trial) -> RunSpec {
        let group = self
            .settings
            .group
            .clone()
            .or_else(|| Some(trial.experiment_name.clone()));
        RunSpec::for_trial(&trial.id, trial.hyperparameters())
            .with_project(self.settings.project.clone())
            .with_group(group)
            .with_tags(self.settings.tags.clone())
    }

    async fn open_run(&self, trial: &Trial) -> Result<RunHandle, TrackingError> {
        let spec = self.spec_for(trial);
        let handle = self.client.start_run(&spec).await?;
        debug!(
            tracker = self.client.name(),
            trial_id = %trial.id,
            run_id = %handle.run_id,
            "Opened tracking run"
        );
        self.runs
            .lock()
            .await
            .insert(trial.id.clone(), handle.clone());
        if self.settings.log_config && !spec.config.is_empty() {
            self.client.log_params(&handle, &spec.config).await?;
        }
        Ok(handle)
    }

    async fn handle_for(&self, trial: &Trial) -> Result<RunHandle, TrackingError> {
        let existing = self.runs.lock().await.get(&trial.id).cloned();
        match existing {
            Some(handle) => Ok(handle),
            None => self.open_run(trial).await,
        }
    }

    fn forwarded_metrics(&self, metrics: &Metrics) -> Metrics {
        metrics
            .iter()
            .filter(|(k, _)| !self.settings.excluded_metrics.contains(k))
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    async fn close(&self, trial: &Trial, outcome: RunOutcome) -> Result<(), TrackingError> {
        let handle = self.runs.lock().await.remove(&trial.id);
        match handle {
            Some(handle) => self.client.finish_run(&handle, outcome).await,
            None => Err(TrackingError::RunNotFound {
                trial_id: trial.id.clone(),
            }),
        }
    }
}

#[async_trait]
impl LoggerCallback for TrackingLoggerCallback {
    async fn on_trial_start(&self, trial: &Trial) -> Result<(), TrackingError> {
        self.open_run(trial).await.map(|_| ())
    }

    async fn on_trial_result(
        &self,
        trial: &Trial,
        result: &TrialResult,
    ) -> Result<(), TrackingError> {
        let handle = self.handle_for(trial).await?;
        let metrics = self.forwarded_metrics(&result.metrics);
        if metrics.is_empty() {
            return Ok(());
        }
        self.client
            .log_metrics(&handle, &metrics, result.training_iteration)
            .await
    }

    async fn on_trial_complete(&self, trial: &Trial) -> Result<(), TrackingError> {
        self.close(trial, RunOutcome::Finished).await
    }

    async fn on_trial_error(&self, trial: &Trial, error: &str) -> Result<(), TrackingError> {
        let outcome = if trial.status == TrialStatus::Cancelled {
            RunOutcome::Killed
        } else {
            RunOutcome::Failed(error.to_string())
        };
        self.close(trial, outcome).await
    }

    async fn on_experiment_end(&self, _trials: &[Trial]) -> Result<(), TrackingError> {
        let leftover: Vec<(String, RunHandle)> = self.runs.lock().await.drain().collect();
        let mut first_error = None;
        for (trial_id, handle) in leftover {
            warn!(
                tracker = self.client.name(),
                trial_id = %trial_id,
                "Closing tracking run left open at experiment end"
            );
            if let Err(e) = self.client.finish_run(&handle, RunOutcome::Killed).await {
                warn!(
                    tracker = self.client.name(),
                    trial_id = %trial_id,
                    error = %e,
                    "Failed to close leftover tracking run"
                );
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
