//! Tracking runs scoped to a single trial.
//!
//! A [`TrackingRun`] is opened once at trial entry and released exactly once:
//! by [`TrackingRun::close`] on the normal paths, or by `Drop` when the trial
//! unwinds, bails out early, or its future is cancelled. User code logs
//! through a cloneable [`RunLogger`].

use crate::error::{TrackingError, TrialError};
use crate::tracking::client::{RunHandle, RunOutcome, RunSpec, TrackingClient, TrackingClientFactory};
use crate::tune::runner::Trainable;
use crate::tune::session::TrialSession;
use crate::types::{self, Metrics, TrialConfig};
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, warn};

struct RunState {
    client: Arc<dyn TrackingClient>,
    handle: RunHandle,
    step: AtomicU64,
    closed: AtomicBool,
}

/// Logging handle for an open run. Calls fail once the run is closed.
#[derive(Clone)]
pub struct RunLogger {
    state: Arc<RunState>,
}

impl RunLogger {
    pub fn handle(&self) -> &RunHandle {
        &self.state.handle
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), TrackingError> {
        if self.is_closed() {
            return Err(TrackingError::RunNotFound {
                trial_id: self.state.handle.trial_id.clone(),
            });
        }
        Ok(())
    }

    /// Log metrics at the next step (1, 2, ...).
    pub async fn log(&self, metrics: &Metrics) -> Result<(), TrackingError> {
        let step = self.state.step.fetch_add(1, Ordering::SeqCst) + 1;
        self.log_at(metrics, step).await
    }

    /// Log metrics at an explicit step.
    pub async fn log_at(&self, metrics: &Metrics, step: u64) -> Result<(), TrackingError> {
        self.ensure_open()?;
        self.state
            .client
            .log_metrics(&self.state.handle, metrics, step)
            .await
    }

    pub async fn log_params(&self, params: &TrialConfig) -> Result<(), TrackingError> {
        self.ensure_open()?;
        self.state.client.log_params(&self.state.handle, params).await
    }
}

/// Guard owning an open tracking run.
pub struct TrackingRun {
    logger: RunLogger,
}

impl TrackingRun {
    /// Open a run on `client`. The run is released when the guard is closed or dropped.
    pub async fn open(client: Arc<dyn TrackingClient>, spec: &RunSpec) -> Result<Self, TrackingError> {
        let handle = client.start_run(spec).await?;
        debug!(
            tracker = client.name(),
            trial_id = %spec.trial_id,
            run_id = %handle.run_id,
            "Opened scoped tracking run"
        );
        Ok(Self {
            logger: RunLogger {
                state: Arc::new(RunState {
                    client,
                    handle,
                    step: AtomicU64::new(0),
                    closed: AtomicBool::new(false),
                }),
            },
        })
    }

    pub fn logger(&self) -> RunLogger {
        self.logger.clone()
    }

    pub fn handle(&self) -> &RunHandle {
        self.logger.handle()
    }

    pub async fn log(&self, metrics: &Metrics) -> Result<(), TrackingError> {
        self.logger.log(metrics).await
    }

    /// Release the run with `outcome`.
    pub async fn close(self, outcome: RunOutcome) -> Result<(), TrackingError> {
        let state = self.logger.state.clone();
        if state.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        state.client.finish_run(&state.handle, outcome).await
    }
}

impl Drop for TrackingRun {
    fn drop(&mut self) {
        let state = self.logger.state.clone();
        if state.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    if let Err(e) = state.client.finish_run(&state.handle, RunOutcome::Killed).await {
                        warn!(
                            tracker = state.client.name(),
                            run_id = %state.handle.run_id,
                            error = %e,
                            "Failed to release dropped tracking run"
                        );
                    }
                });
            }
            Err(_) => warn!(
                run_id = %state.handle.run_id,
                "Tracking run dropped outside a tokio runtime; left open"
            ),
        }
    }
}

fn outcome_for<T>(result: &Result<T, TrialError>) -> RunOutcome {
    match result {
        Ok(_) => RunOutcome::Finished,
        Err(TrialError::Cancelled | TrialError::Timeout { .. }) => RunOutcome::Killed,
        Err(e) => RunOutcome::Failed(e.to_string()),
    }
}

/// Open a run, hand its logger to `f`, and release it on every exit path.
pub async fn with_tracking_run<T, F, Fut>(
    client: Arc<dyn TrackingClient>,
    spec: &RunSpec,
    f: F,
) -> Result<T, TrialError>
where
    F: FnOnce(RunLogger) -> Fut,
    Fut: Future<Output = Result<T, TrialError>>,
{
    let run = TrackingRun::open(client, spec).await?;
    let result = f(run.logger()).await;
    let closed = run.close(outcome_for(&result)).await;
    match (result, closed) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e.into()),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(close_err)) => {
            warn!(trial_id = %spec.trial_id, error = %close_err, "Failed to close tracking run");
            Err(e)
        }
    }
}

/// What a tracked trainable receives: the trial's session plus its open run.
pub struct TrackedSession {
    pub session: TrialSession,
    pub run: RunLogger,
}

/// Trainable adapter that scopes a tracking run to each trial.
///
/// Takes the tracker sub-mapping at `key` out of the trial config, builds a
/// client through the factory, opens a run named after the trial, and
/// releases it however the inner function exits.
pub struct Tracked<F> {
    factory: Arc<dyn TrackingClientFactory>,
    key: String,
    func: F,
}

/// Wrap `func` so each trial runs inside its own tracking run.
pub fn tracked<F, Fut>(factory: Arc<dyn TrackingClientFactory>, key: &str, func: F) -> Tracked<F>
where
    F: Fn(TrackedSession) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), TrialError>> + Send + 'static,
{
    Tracked {
        factory,
        key: key.to_string(),
        func,
    }
}

#[async_trait]
impl<F, Fut> Trainable for Tracked<F>
where
    F: Fn(TrackedSession) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), TrialError>> + Send + 'static,
{
    async fn run(&self, mut session: TrialSession) -> Result<(), TrialError> {
        // Tracker settings may carry credentials; user code never sees them.
        let settings = session.take_config_key(&self.key).unwrap_or(Value::Null);
        let client = self.factory.build(&self.key, &settings)?;
        let group = settings
            .get("group")
            .and_then(Value::as_str)
            .map(str::to_string);
        let spec = RunSpec::for_trial(session.trial_id(), types::hyperparameters(session.config()))
            .with_group(group);

        let params = spec.config.clone();
        with_tracking_run(client, &spec, |run| async move {
            run.log_params(&params).await?;
            (self.func)(TrackedSession { session, run }).await
        })
        .await
    }
}
