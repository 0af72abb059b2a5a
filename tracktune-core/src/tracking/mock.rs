//! Recording tracking client for tests and dry runs.

use crate::error::TrackingError;
use crate::tracking::client::{RunHandle, RunOutcome, RunSpec, TrackingClient};
use crate::types::{Metrics, TrialConfig};
use async_trait::async_trait;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A call the recording client received.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackingEvent {
    Started { run_id: String, spec: RunSpec },
    Params { run_id: String, params: TrialConfig },
    Metrics { run_id: String, metrics: Metrics, step: u64 },
    Finished { run_id: String, outcome: RunOutcome },
}

impl TrackingEvent {
    fn run_id(&self) -> &str {
        match self {
            Self::Started { run_id, .. }
            | Self::Params { run_id, .. }
            | Self::Metrics { run_id, .. }
            | Self::Finished { run_id, .. } => run_id,
        }
    }
}

/// Tracking client that records every call in memory.
///
/// Run ids are `run-{n}-{trial_id}` so events can be attributed back to trials.
pub struct RecordingTrackingClient {
    name: String,
    events: Mutex<Vec<TrackingEvent>>,
    counter: AtomicUsize,
    fail_start: bool,
    fail_metrics: bool,
    fail_finish: bool,
}

impl RecordingTrackingClient {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            events: Mutex::new(Vec::new()),
            counter: AtomicUsize::new(0),
            fail_start: false,
            fail_metrics: false,
            fail_finish: false,
        }
    }

    /// Fail every `start_run` call.
    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    /// Record, then fail, every `log_metrics` call.
    pub fn failing_metrics(mut self) -> Self {
        self.fail_metrics = true;
        self
    }

    /// Record, then fail, every `finish_run` call.
    pub fn failing_finish(mut self) -> Self {
        self.fail_finish = true;
        self
    }

    fn push(&self, event: TrackingEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }

    fn injected(&self, op: &str) -> TrackingError {
        TrackingError::Api {
            service: self.name.clone(),
            status: 500,
            message: format!("injected {op} failure"),
        }
    }

    pub fn events(&self) -> Vec<TrackingEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    fn trial_run_ids(&self, trial_id: &str) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                TrackingEvent::Started { run_id, spec } if spec.trial_id == trial_id => {
                    Some(run_id)
                }
                _ => None,
            })
            .collect()
    }

    fn events_for(&self, trial_id: &str) -> Vec<TrackingEvent> {
        let ids = self.trial_run_ids(trial_id);
        self.events()
            .into_iter()
            .filter(|e| ids.iter().any(|id| id == e.run_id()))
            .collect()
    }

    pub fn started_specs(&self) -> Vec<RunSpec> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                TrackingEvent::Started { spec, .. } => Some(spec),
                _ => None,
            })
            .collect()
    }

    pub fn runs_started(&self) -> usize {
        self.started_specs().len()
    }

    pub fn runs_finished(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, TrackingEvent::Finished { .. }))
            .count()
    }

    pub fn runs_started_for(&self, trial_id: &str) -> usize {
        self.trial_run_ids(trial_id).len()
    }

    /// Metrics records and steps received for `trial_id`, in arrival order.
    pub fn metrics_for(&self, trial_id: &str) -> Vec<(Metrics, u64)> {
        self.events_for(trial_id)
            .into_iter()
            .filter_map(|e| match e {
                TrackingEvent::Metrics { metrics, step, .. } => Some((metrics, step)),
                _ => None,
            })
            .collect()
    }

    pub fn outcomes_for(&self, trial_id: &str) -> Vec<RunOutcome> {
        self.events_for(trial_id)
            .into_iter()
            .filter_map(|e| match e {
                TrackingEvent::Finished { outcome, .. } => Some(outcome),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl TrackingClient for RecordingTrackingClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start_run(&self, spec: &RunSpec) -> Result<RunHandle, TrackingError> {
        if self.fail_start {
            return Err(self.injected("start_run"));
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let run_id = format!("run-{n}-{}", spec.trial_id);
        self.push(TrackingEvent::Started {
            run_id: run_id.clone(),
            spec: spec.clone(),
        });
        Ok(RunHandle {
            run_id,
            trial_id: spec.trial_id.clone(),
            url: None,
        })
    }

    async fn log_params(&self, run: &RunHandle, params: &TrialConfig) -> Result<(), TrackingError> {
        self.push(TrackingEvent::Params {
            run_id: run.run_id.clone(),
            params: params.clone(),
        });
        Ok(())
    }

    async fn log_metrics(
        &self,
        run: &RunHandle,
        metrics: &Metrics,
        step: u64,
    ) -> Result<(), TrackingError> {
        self.push(TrackingEvent::Metrics {
            run_id: run.run_id.clone(),
            metrics: metrics.clone(),
            step,
        });
        if self.fail_metrics {
            return Err(self.injected("log_metrics"));
        }
        Ok(())
    }

    async fn finish_run(&self, run: &RunHandle, outcome: RunOutcome) -> Result<(), TrackingError> {
        self.push(TrackingEvent::Finished {
            run_id: run.run_id.clone(),
            outcome,
        });
        if self.fail_finish {
            return Err(self.injected("finish_run"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_attributes_events_to_trial() {
        let client = RecordingTrackingClient::new("mock");
        let a = client
            .start_run(&RunSpec::for_trial("a", TrialConfig::new()))
            .await
            .unwrap();
        let b = client
            .start_run(&RunSpec::for_trial("b", TrialConfig::new()))
            .await
            .unwrap();
        client
            .log_metrics(&a, &Metrics::from([("loss".into(), 1.0)]), 1)
            .await
            .unwrap();
        client
            .log_metrics(&b, &Metrics::from([("loss".into(), 2.0)]), 1)
            .await
            .unwrap();
        client.finish_run(&a, RunOutcome::Finished).await.unwrap();

        assert_eq!(client.metrics_for("a").len(), 1);
        assert_eq!(client.metrics_for("b")[0].0["loss"], 2.0);
        assert_eq!(client.outcomes_for("a"), vec![RunOutcome::Finished]);
        assert!(client.outcomes_for("b").is_empty());
    }

    #[tokio::test]
    async fn test_failing_metrics_still_records() {
        let client = RecordingTrackingClient::new("mock").failing_metrics();
        let run = client
            .start_run(&RunSpec::for_trial("a", TrialConfig::new()))
            .await
            .unwrap();
        assert!(client.log_metrics(&run, &Metrics::new(), 1).await.is_err());
        assert_eq!(client.metrics_for("a").len(), 1);
    }
}
