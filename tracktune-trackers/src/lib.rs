//! # Tracktune Trackers
//!
//! HTTP tracking clients for Weights & Biases, MLflow and Comet, and a factory
//! that builds them from the tracker settings carried in a trial config.

pub mod comet;
pub mod mlflow;
pub mod wandb;

mod http;

pub use comet::CometClient;
pub use mlflow::MlflowClient;
pub use wandb::WandbClient;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracktune_core::config::{CometConfig, MlflowConfig, TrackingSection, WandbConfig};
use tracktune_core::credentials::CredentialStore;
use tracktune_core::error::TrackingError;
use tracktune_core::tracking::{TrackingClient, TrackingClientFactory};

/// Supported tracking services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackerKind {
    Wandb,
    Mlflow,
    Comet,
}

impl TrackerKind {
    pub const ALL: [TrackerKind; 3] = [Self::Wandb, Self::Mlflow, Self::Comet];

    /// Reserved trial-config key carrying this tracker's settings.
    pub fn key(&self) -> &'static str {
        match self {
            Self::Wandb => wandb::SERVICE,
            Self::Mlflow => mlflow::SERVICE,
            Self::Comet => comet::SERVICE,
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.key() == key)
    }

    /// This tracker's section of the config file, as a settings mapping.
    pub fn settings_from(&self, section: &TrackingSection) -> Result<Value, TrackingError> {
        let value = match self {
            Self::Wandb => serde_json::to_value(section.wandb.clone().unwrap_or_default()),
            Self::Mlflow => serde_json::to_value(section.mlflow.clone().unwrap_or_default()),
            Self::Comet => serde_json::to_value(section.comet.clone().unwrap_or_default()),
        };
        value.map_err(|e| TrackingError::InvalidSettings {
            message: format!("{}: {e}", self.key()),
        })
    }
}

impl std::fmt::Display for TrackerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

impl std::str::FromStr for TrackerKind {
    type Err = TrackingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_key(&s.to_ascii_lowercase()).ok_or_else(|| TrackingError::InvalidSettings {
            message: format!("unknown tracker '{s}' (expected wandb, mlflow or comet)"),
        })
    }
}

/// Build a client for `kind` from its settings mapping.
///
/// Credentials are resolved here, so a missing key fails before any run starts.
pub fn build_client(
    kind: TrackerKind,
    settings: &Value,
    store: Option<&dyn CredentialStore>,
) -> Result<Arc<dyn TrackingClient>, TrackingError> {
    let client: Arc<dyn TrackingClient> = match kind {
        TrackerKind::Wandb => {
            let config: WandbConfig = http::parse_settings(kind.key(), settings)?;
            Arc::new(WandbClient::from_config(&config, store)?)
        }
        TrackerKind::Mlflow => {
            let config: MlflowConfig = http::parse_settings(kind.key(), settings)?;
            Arc::new(MlflowClient::from_config(&config, store)?)
        }
        TrackerKind::Comet => {
            let config: CometConfig = http::parse_settings(kind.key(), settings)?;
            Arc::new(CometClient::from_config(&config, store)?)
        }
    };
    tracing::debug!(tracker = %kind, "Built tracking client");
    Ok(client)
}

/// Factory used by scoped runs: builds the real client named by the config key.
#[derive(Default, Clone)]
pub struct DefaultClientFactory {
    store: Option<Arc<dyn CredentialStore>>,
}

impl DefaultClientFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fall back to `store` for API keys not found in settings or environment.
    pub fn with_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.store = Some(store);
        self
    }
}

impl TrackingClientFactory for DefaultClientFactory {
    fn build(&self, key: &str, settings: &Value) -> Result<Arc<dyn TrackingClient>, TrackingError> {
        let kind = key.parse::<TrackerKind>()?;
        build_client(kind, settings, self.store.as_deref())
    }
}
