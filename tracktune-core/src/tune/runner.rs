//! Tuner: runs trials concurrently and relays their results to callbacks.

use crate::config::TuneConfig;
use crate::error::{TrialError, TuneError};
use crate::search::SearchSpace;
use crate::tracking::callback::LoggerCallback;
use crate::tune::analysis::ExperimentAnalysis;
use crate::tune::session::{TrialEvent, TrialOutcome, TrialSession};
use crate::tune::trial::{Trial, TrialStatus};
use crate::types::TrialConfig;
use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A training function run once per trial.
#[async_trait]
pub trait Trainable: Send + Sync + 'static {
    async fn run(&self, session: TrialSession) -> Result<(), TrialError>;
}

#[async_trait]
impl<F, Fut> Trainable for F
where
    F: Fn(TrialSession) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), TrialError>> + Send + 'static,
{
    async fn run(&self, session: TrialSession) -> Result<(), TrialError> {
        (self)(session).await
    }
}

const EVENT_BUFFER: usize = 256;

/// Drives one experiment: sampling, trial execution, callback fan-out.
pub struct Tuner {
    trainable: Arc<dyn Trainable>,
    space: SearchSpace,
    config: TuneConfig,
    constants: TrialConfig,
    callbacks: Vec<Arc<dyn LoggerCallback>>,
    cancel: CancellationToken,
}

impl Tuner {
    pub fn new(trainable: impl Trainable, space: SearchSpace, config: TuneConfig) -> Self {
        Self {
            trainable: Arc::new(trainable),
            space,
            config,
            constants: TrialConfig::new(),
            callbacks: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_callback(mut self, callback: Arc<dyn LoggerCallback>) -> Self {
        self.callbacks.push(callback);
        self
    }

    /// Add a fixed entry to every trial config, e.g. a `wandb` settings mapping.
    pub fn with_constant(mut self, key: impl Into<String>, value: Value) -> Self {
        self.constants.insert(key.into(), value);
        self
    }

    /// Token that aborts the experiment when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn validate(&self) -> Result<(), TuneError> {
        let invalid = |message: &str| {
            Err(TuneError::InvalidConfig {
                message: message.to_string(),
            })
        };
        if self.config.metric.is_empty() {
            return invalid("metric must not be empty");
        }
        if self.config.max_concurrent_trials == 0 {
            return invalid("max_concurrent_trials must be at least 1");
        }
        if let Some(key) = self.constants.keys().find(|k| self.space.get(k).is_some()) {
            return Err(TuneError::InvalidConfig {
                message: format!("constant '{key}' shadows a search space parameter"),
            });
        }
        self.space.validate()
    }

    fn build_trials(&self) -> Result<Vec<Trial>, TuneError> {
        let seed = self.config.seed.unwrap_or_else(rand::random);
        let configs = self.space.generate(self.config.num_samples, seed)?;
        let tag = uuid::Uuid::new_v4().simple().to_string();
        let tag = &tag[..5];
        Ok(configs
            .into_iter()
            .enumerate()
            .map(|(index, mut config)| {
                for (k, v) in &self.constants {
                    config.insert(k.clone(), v.clone());
                }
                Trial::new(&self.config.experiment_name, tag, index, config)
            })
            .collect())
    }

    /// Run every trial and return the analysis.
    ///
    /// With `fail_fast`, the first trial error aborts all other trials and
    /// is returned after callbacks have been notified.
    pub async fn run(self) -> Result<ExperimentAnalysis, TuneError> {
        self.validate()?;
        let mut trials = self.build_trials()?;
        info!(
            experiment = %self.config.experiment_name,
            trials = trials.len(),
            max_concurrent = self.config.max_concurrent_trials,
            "Starting experiment"
        );

        let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_trials));
        let timeout = self.config.trial_timeout_secs.map(Duration::from_secs);
        let mut handles = Vec::with_capacity(trials.len());

        for trial in &trials {
            let ctx = TrialTask {
                index: trial.index,
                trial_id: trial.id.clone(),
                config: Arc::new(trial.config.clone()),
                trainable: self.trainable.clone(),
                semaphore: semaphore.clone(),
                events: tx.clone(),
                cancel: self.cancel.child_token(),
                timeout,
            };
            handles.push(tokio::spawn(ctx.run()));
        }
        drop(tx);

        let mut fail_fast_error = None;
        while let Some(event) = rx.recv().await {
            match event {
                TrialEvent::Started { index } => {
                    let trial = &mut trials[index];
                    trial.mark_running();
                    debug!(trial_id = %trial.id, "Trial started");
                    for cb in &self.callbacks {
                        if let Err(e) = cb.on_trial_start(trial).await {
                            warn!(trial_id = %trial.id, error = %e, "on_trial_start callback failed");
                        }
                    }
                }
                TrialEvent::Result { index, result } => {
                    let trial = &mut trials[index];
                    trial.record(result.clone());
                    for cb in &self.callbacks {
                        if let Err(e) = cb.on_trial_result(trial, &result).await {
                            warn!(
                                trial_id = %trial.id,
                                step = result.training_iteration,
                                error = %e,
                                "on_trial_result callback failed"
                            );
                        }
                    }
                }
                TrialEvent::Finished { index, outcome } => {
                    let trial = &mut trials[index];
                    let started = trial.status == TrialStatus::Running;
                    let error = match outcome {
                        TrialOutcome::Completed => {
                            trial.mark_finished(TrialStatus::Terminated, None);
                            info!(trial_id = %trial.id, iterations = trial.iterations(), "Trial completed");
                            None
                        }
                        TrialOutcome::Failed(message) => {
                            warn!(trial_id = %trial.id, error = %message, "Trial errored");
                            trial.mark_finished(TrialStatus::Errored, Some(message.clone()));
                            if self.config.fail_fast && fail_fast_error.is_none() {
                                fail_fast_error = Some(TuneError::FailFast {
                                    trial_id: trial.id.clone(),
                                    message: message.clone(),
                                });
                                self.cancel.cancel();
                            }
                            Some(message)
                        }
                        TrialOutcome::Cancelled(message) => {
                            debug!(trial_id = %trial.id, "Trial cancelled");
                            trial.mark_finished(TrialStatus::Cancelled, Some(message.clone()));
                            Some(message)
                        }
                    };
                    if !started {
                        continue;
                    }
                    for cb in &self.callbacks {
                        let notified = match &error {
                            None => cb.on_trial_complete(trial).await,
                            Some(message) => cb.on_trial_error(trial, message).await,
                        };
                        if let Err(e) = notified {
                            warn!(trial_id = %trial.id, error = %e, "Trial end callback failed");
                        }
                    }
                }
            }
        }

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Trial task did not join cleanly");
            }
        }

        for cb in &self.callbacks {
            if let Err(e) = cb.on_experiment_end(&trials).await {
                warn!(error = %e, "on_experiment_end callback failed");
            }
        }

        if let Some(err) = fail_fast_error {
            return Err(err);
        }

        let analysis = ExperimentAnalysis::new(
            &self.config.experiment_name,
            &self.config.metric,
            self.config.mode,
            trials,
        );
        info!(
            experiment = %self.config.experiment_name,
            errored = analysis.errored_trials().len(),
            "Experiment finished"
        );
        Ok(analysis)
    }
}

const CANCELLED_MESSAGE: &str = "Trial was cancelled";

/// Everything a spawned trial task needs.
struct TrialTask {
    index: usize,
    trial_id: String,
    config: Arc<TrialConfig>,
    trainable: Arc<dyn Trainable>,
    semaphore: Arc<Semaphore>,
    events: mpsc::Sender<TrialEvent>,
    cancel: CancellationToken,
    timeout: Option<Duration>,
}

impl TrialTask {
    async fn run(self) {
        let outcome = self.execute().await;
        // The driver outlives every task; a send failure only happens if it was dropped.
        let _ = self
            .events
            .send(TrialEvent::Finished {
                index: self.index,
                outcome,
            })
            .await;
    }

    async fn execute(&self) -> TrialOutcome {
        let permit = tokio::select! {
            permit = self.semaphore.clone().acquire_owned() => permit,
            _ = self.cancel.cancelled() => {
                return TrialOutcome::Cancelled(CANCELLED_MESSAGE.to_string());
            }
        };
        let Ok(_permit) = permit else {
            return TrialOutcome::Cancelled(CANCELLED_MESSAGE.to_string());
        };
        if self.cancel.is_cancelled() {
            return TrialOutcome::Cancelled(CANCELLED_MESSAGE.to_string());
        }

        if self
            .events
            .send(TrialEvent::Started { index: self.index })
            .await
            .is_err()
        {
            return TrialOutcome::Cancelled(CANCELLED_MESSAGE.to_string());
        }

        let session = TrialSession::new(
            self.index,
            self.trial_id.clone(),
            self.config.clone(),
            self.events.clone(),
            self.cancel.clone(),
        );
        let work = AssertUnwindSafe(self.trainable.run(session)).catch_unwind();

        let result = tokio::select! {
            res = with_timeout(work, self.timeout) => res,
            _ = self.cancel.cancelled() => Err(TrialError::Cancelled),
        };

        match result {
            Ok(()) => TrialOutcome::Completed,
            Err(TrialError::Cancelled) => TrialOutcome::Cancelled(CANCELLED_MESSAGE.to_string()),
            Err(e) => TrialOutcome::Failed(e.to_string()),
        }
    }
}

async fn with_timeout<Fut>(work: Fut, timeout: Option<Duration>) -> Result<(), TrialError>
where
    Fut: Future<Output = std::thread::Result<Result<(), TrialError>>>,
{
    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, work).await {
            Ok(joined) => joined,
            Err(_) => {
                return Err(TrialError::Timeout {
                    timeout_secs: limit.as_secs(),
                });
            }
        },
        None => work.await,
    };
    match joined {
        Ok(result) => result,
        Err(panic) => Err(TrialError::Panicked {
            message: panic_message(panic.as_ref()),
        }),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
