//! Per-trial reporting channel handed to the trainable.

use crate::error::TrialError;
use crate::tune::trial::TrialResult;
use crate::types::{Metrics, TrialConfig};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Events a running trial sends back to the tuner.
#[derive(Debug)]
pub(crate) enum TrialEvent {
    Started { index: usize },
    Result { index: usize, result: TrialResult },
    Finished { index: usize, outcome: TrialOutcome },
}

/// How a trial's trainable exited.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TrialOutcome {
    Completed,
    Failed(String),
    Cancelled(String),
}

/// Reporting handle for one trial.
///
/// Every `report` is one training iteration; the step counter starts at 1.
pub struct TrialSession {
    index: usize,
    trial_id: String,
    config: Arc<TrialConfig>,
    iteration: u64,
    events: mpsc::Sender<TrialEvent>,
    cancel: CancellationToken,
}

impl TrialSession {
    pub(crate) fn new(
        index: usize,
        trial_id: String,
        config: Arc<TrialConfig>,
        events: mpsc::Sender<TrialEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            index,
            trial_id,
            config,
            iteration: 0,
            events,
            cancel,
        }
    }

    pub fn trial_id(&self) -> &str {
        &self.trial_id
    }

    pub fn config(&self) -> &TrialConfig {
        &self.config
    }

    /// Take `key` out of the config this session exposes. The tuner's own
    /// record of the trial config is left as is.
    pub(crate) fn take_config_key(&mut self, key: &str) -> Option<serde_json::Value> {
        if !self.config.contains_key(key) {
            return None;
        }
        Arc::make_mut(&mut self.config).remove(key)
    }

    /// Number of results reported so far.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// Report one metrics record to the tuner.
    pub async fn report(&mut self, metrics: Metrics) -> Result<(), TrialError> {
        if self.cancel.is_cancelled() {
            return Err(TrialError::Cancelled);
        }
        self.iteration += 1;
        let result = TrialResult {
            trial_id: self.trial_id.clone(),
            training_iteration: self.iteration,
            metrics,
            timestamp: Utc::now(),
            done: false,
        };
        self.events
            .send(TrialEvent::Result {
                index: self.index,
                result,
            })
            .await
            .map_err(|_| TrialError::Closed)
    }

    /// Whether the experiment has been aborted.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Completes when the experiment is aborted.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}
