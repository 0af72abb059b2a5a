//! # Experiment tracking
//!
//! Two ways to attach a tracking service to a tuning run:
//!
//! - [`TrackingLoggerCallback`] registered on the [`Tuner`](crate::tune::Tuner),
//!   forwards every reported result, one tracking run per trial.
//! - [`tracked`] / [`with_tracking_run`] scopes a run to the trial's own
//!   execution and hands a [`RunLogger`] to user code.
//!
//! Both take a [`TrackingClient`] by injection.

pub mod callback;
pub mod client;
pub mod mock;
pub mod scope;

pub use callback::{LoggerCallback, TrackerSettings, TrackingLoggerCallback};
pub use client::{RunHandle, RunOutcome, RunSpec, TrackingClient, TrackingClientFactory};
pub use mock::{RecordingTrackingClient, TrackingEvent};
pub use scope::{RunLogger, Tracked, TrackedSession, TrackingRun, tracked, with_tracking_run};
