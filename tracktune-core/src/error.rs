//! Error types for tracktune.
//!
//! One `thiserror` enum per concern: tracking clients, trial execution, the
//! tuner, and configuration.

use std::path::PathBuf;

/// Errors raised while talking to an experiment-tracking service.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TrackingError {
    #[error("Missing credential for {service}: {what}")]
    MissingCredential { service: String, what: String },

    #[error("{service} API returned {status}: {message}")]
    Api {
        service: String,
        status: u16,
        message: String,
    },

    #[error("{service} request failed: {message}")]
    Transport { service: String, message: String },

    #[error("Unexpected {service} response: {message}")]
    ResponseParse { service: String, message: String },

    #[error("No open run for trial {trial_id}")]
    RunNotFound { trial_id: String },

    #[error("Invalid tracker settings: {message}")]
    InvalidSettings { message: String },
}

impl TrackingError {
    pub fn missing_credential(service: impl Into<String>, what: impl Into<String>) -> Self {
        Self::MissingCredential {
            service: service.into(),
            what: what.into(),
        }
    }

    pub fn transport(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            service: service.into(),
            message: message.into(),
        }
    }

    pub fn parse(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ResponseParse {
            service: service.into(),
            message: message.into(),
        }
    }
}

/// Errors raised from inside a single trial.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TrialError {
    #[error("Trial failed: {message}")]
    Failed { message: String },

    #[error("Trial timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Trial was cancelled")]
    Cancelled,

    #[error("Reporting channel closed")]
    Closed,

    #[error("Trial panicked: {message}")]
    Panicked { message: String },

    #[error("Tracking failed inside trial: {0}")]
    Tracking(#[from] TrackingError),
}

impl TrialError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

/// Errors from the tuner itself, before or around trial execution.
#[derive(Debug, thiserror::Error)]
pub enum TuneError {
    #[error("Invalid search space: {message}")]
    InvalidSearchSpace { message: String },

    #[error("Invalid tune configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Trial {trial_id} failed and fail_fast is set: {message}")]
    FailFast { trial_id: String, message: String },
}

/// Errors from loading or writing configuration files.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Parse { message: String },

    #[error("Cannot serialize configuration: {message}")]
    Serialize { message: String },

    #[error("Cannot write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Parse {
            message: err.to_string(),
        }
    }
}
