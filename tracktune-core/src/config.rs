//! Configuration system for tracktune.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> overrides.
//! Configuration is loaded from `~/.config/tracktune/config.toml` and/or
//! `.tracktune/config.toml` in the workspace directory.

use crate::error::ConfigError;
use crate::tune::analysis::Mode;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TracktuneConfig {
    #[serde(default)]
    pub tune: TuneConfig,
    #[serde(default)]
    pub tracking: TrackingSection,
}

/// Settings for one tuning run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuneConfig {
    /// Name used for trial ids and as the default run group.
    #[serde(default = "default_experiment_name")]
    pub experiment_name: String,
    /// Metric the best trial is selected by.
    #[serde(default = "default_metric")]
    pub metric: String,
    #[serde(default)]
    pub mode: Mode,
    /// Repetitions of the search space (each grid point runs this many times).
    #[serde(default = "default_num_samples")]
    pub num_samples: usize,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_trials: usize,
    /// Sampling seed; random when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trial_timeout_secs: Option<u64>,
    /// Abort the whole experiment on the first trial error.
    #[serde(default)]
    pub fail_fast: bool,
}

impl Default for TuneConfig {
    fn default() -> Self {
        Self {
            experiment_name: default_experiment_name(),
            metric: default_metric(),
            mode: Mode::Min,
            num_samples: default_num_samples(),
            max_concurrent_trials: default_max_concurrent(),
            seed: None,
            trial_timeout_secs: None,
            fail_fast: false,
        }
    }
}

fn default_experiment_name() -> String {
    "tracktune".to_string()
}

fn default_metric() -> String {
    "loss".to_string()
}

fn default_num_samples() -> usize {
    1
}

fn default_max_concurrent() -> usize {
    4
}

/// Per-service tracker settings. A section that is absent is not configured.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackingSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wandb: Option<WandbConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mlflow: Option<MlflowConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comet: Option<CometConfig>,
}

/// Weights & Biases settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct WandbConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// File whose first line is the API key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_file: Option<PathBuf>,
    /// User or team; the key's default entity when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    #[serde(default = "default_project")]
    pub project: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_wandb_url")]
    pub base_url: String,
}

impl Default for WandbConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_key_file: None,
            entity: None,
            project: default_project(),
            group: None,
            tags: Vec::new(),
            base_url: default_wandb_url(),
        }
    }
}

fn default_project() -> String {
    "tracktune".to_string()
}

fn default_wandb_url() -> String {
    "https://api.wandb.ai".to_string()
}

/// MLflow settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct MlflowConfig {
    /// Tracking server, e.g. `http://localhost:5000`. Falls back to `MLFLOW_TRACKING_URI`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_uri: Option<String>,
    #[serde(default = "default_project")]
    pub experiment_name: String,
    /// Bearer token for authenticated servers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Default for MlflowConfig {
    fn default() -> Self {
        Self {
            tracking_uri: None,
            experiment_name: default_project(),
            token: None,
            tags: Vec::new(),
        }
    }
}

/// Comet settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct CometConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    #[serde(default = "default_project")]
    pub project_name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_comet_url")]
    pub base_url: String,
}

impl Default for CometConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_key_file: None,
            workspace: None,
            project_name: default_project(),
            tags: Vec::new(),
            base_url: default_comet_url(),
        }
    }
}

fn default_comet_url() -> String {
    "https://www.comet.com".to_string()
}

fn redacted(secret: &Option<String>) -> Option<&'static str> {
    secret.as_ref().map(|_| "***")
}

impl std::fmt::Debug for WandbConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WandbConfig")
            .field("api_key", &redacted(&self.api_key))
            .field("api_key_file", &self.api_key_file)
            .field("entity", &self.entity)
            .field("project", &self.project)
            .field("group", &self.group)
            .field("tags", &self.tags)
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl std::fmt::Debug for MlflowConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MlflowConfig")
            .field("tracking_uri", &self.tracking_uri)
            .field("experiment_name", &self.experiment_name)
            .field("token", &redacted(&self.token))
            .field("tags", &self.tags)
            .finish()
    }
}

impl std::fmt::Debug for CometConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CometConfig")
            .field("api_key", &redacted(&self.api_key))
            .field("api_key_file", &self.api_key_file)
            .field("workspace", &self.workspace)
            .field("project_name", &self.project_name)
            .field("tags", &self.tags)
            .field("base_url", &self.base_url)
            .finish()
    }
}

fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "tracktune", "tracktune")
        .map(|d| d.config_dir().join("config.toml"))
}

/// Path of the workspace-level config file.
pub fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(".tracktune").join("config.toml")
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `TRACKTUNE_`)
/// 3. Workspace-local config (`.tracktune/config.toml`)
/// 4. User config (`~/.config/tracktune/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&TracktuneConfig>,
) -> Result<TracktuneConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(TracktuneConfig::default()));

    if let Some(user_config) = user_config_path() {
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = workspace_config_path(ws);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // TRACKTUNE_TUNE__NUM_SAMPLES, TRACKTUNE_TRACKING__WANDB__PROJECT, ...
    figment = figment.merge(Env::prefixed("TRACKTUNE_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    Ok(figment.extract()?)
}

/// Write a default workspace config listing every tracker section.
///
/// Returns `None` when the file already exists; it is never overwritten.
pub fn init_workspace_config(workspace: &Path) -> Result<Option<PathBuf>, ConfigError> {
    let path = workspace_config_path(workspace);
    if path.exists() {
        return Ok(None);
    }
    let config = TracktuneConfig {
        tracking: TrackingSection {
            wandb: Some(WandbConfig::default()),
            mlflow: Some(MlflowConfig::default()),
            comet: Some(CometConfig::default()),
        },
        ..Default::default()
    };
    let contents = toml::to_string_pretty(&config).map_err(|e| ConfigError::Serialize {
        message: e.to_string(),
    })?;
    let write_err = |source| ConfigError::Write {
        path: path.clone(),
        source,
    };
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(write_err)?;
    }
    std::fs::write(&path, contents).map_err(write_err)?;
    Ok(Some(path))
}

/// Whether a user-level or workspace-level config file exists.
pub fn config_exists(workspace: Option<&Path>) -> bool {
    if user_config_path().is_some_and(|p| p.exists()) {
        return true;
    }
    workspace.is_some_and(|ws| workspace_config_path(ws).exists())
}
