//! # Tracktune Core
//!
//! Core library for tracktune: a small concurrent hyperparameter tuner with
//! pluggable experiment-tracking integrations.
//! Provides the search space, trial driver, tracking client trait, logger
//! callback, scoped tracking runs, configuration, and credentials.

pub mod config;
pub mod credentials;
pub mod demo;
pub mod error;
pub mod search;
pub mod tracking;
pub mod tune;
pub mod types;

// Re-export commonly used types at the crate root.
pub use config::{
    CometConfig, MlflowConfig, TrackingSection, TracktuneConfig, TuneConfig, WandbConfig,
};
pub use credentials::{
    CredentialStore, InMemoryCredentialStore, KeyringCredentialStore, KeySources, find_api_key,
    resolve_api_key,
};
pub use error::{ConfigError, TrackingError, TrialError, TuneError};
pub use search::{Domain, SearchSpace};
pub use tracking::{
    LoggerCallback, RecordingTrackingClient, RunHandle, RunLogger, RunOutcome, RunSpec, Tracked,
    TrackedSession, TrackerSettings, TrackingClient, TrackingClientFactory, TrackingLoggerCallback,
    TrackingRun, tracked, with_tracking_run,
};
pub use tune::{
    ExperimentAnalysis, Mode, ResultRow, Trainable, Trial, TrialResult, TrialSession, TrialStatus,
    Tuner,
};
pub use types::{Metrics, TrialConfig};
