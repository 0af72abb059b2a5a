//! The seam between tracktune and an experiment-tracking service.

use crate::error::TrackingError;
use crate::types::{Metrics, TrialConfig};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// What to open a tracking run for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSpec {
    pub trial_id: String,
    pub run_name: String,
    /// Overrides the client's configured project / experiment when set.
    pub project: Option<String>,
    pub group: Option<String>,
    pub tags: Vec<String>,
    /// Hyperparameters, reserved tracker keys already stripped.
    pub config: TrialConfig,
}

impl RunSpec {
    pub fn for_trial(trial_id: impl Into<String>, config: TrialConfig) -> Self {
        let trial_id = trial_id.into();
        Self {
            run_name: trial_id.clone(),
            trial_id,
            config,
            ..Default::default()
        }
    }

    pub fn with_group(mut self, group: Option<String>) -> Self {
        self.group = group;
        self
    }

    pub fn with_project(mut self, project: Option<String>) -> Self {
        self.project = project;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}

/// An open run on the tracking service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHandle {
    pub run_id: String,
    pub trial_id: String,
    pub url: Option<String>,
}

/// Terminal state a run is closed with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Finished,
    Failed(String),
    Killed,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Finished => 0,
            Self::Failed(_) => 1,
            Self::Killed => 255,
        }
    }
}

/// A client for one tracking service.
///
/// Implementations hold their own credentials and are injected into the
/// logger callback or the run scope; nothing here is global.
#[async_trait]
pub trait TrackingClient: Send + Sync {
    /// Service name, used in logs and errors.
    fn name(&self) -> &str;

    async fn start_run(&self, spec: &RunSpec) -> Result<RunHandle, TrackingError>;

    async fn log_params(&self, run: &RunHandle, params: &TrialConfig) -> Result<(), TrackingError>;

    async fn log_metrics(
        &self,
        run: &RunHandle,
        metrics: &Metrics,
        step: u64,
    ) -> Result<(), TrackingError>;

    async fn finish_run(&self, run: &RunHandle, outcome: RunOutcome) -> Result<(), TrackingError>;
}

/// Builds a client from the tracker sub-mapping carried in a trial config.
pub trait TrackingClientFactory: Send + Sync {
    fn build(&self, key: &str, settings: &Value) -> Result<Arc<dyn TrackingClient>, TrackingError>;
}

impl<F> TrackingClientFactory for F
where
    F: Fn(&str, &Value) -> Result<Arc<dyn TrackingClient>, TrackingError> + Send + Sync,
{
    fn build(&self, key: &str, settings: &Value) -> Result<Arc<dyn TrackingClient>, TrackingError> {
        self(key, settings)
    }
}
