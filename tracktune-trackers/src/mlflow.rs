//! MLflow tracking client over the REST 2.0 API.
//!
//! Experiments are resolved by name once per client (created when missing);
//! each trial becomes an MLflow run tagged with its trial id. Params and metrics
//! go through `runs/log-batch`.

use crate::http::{self, finite};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use tracktune_core::TrackingClient;
use tracktune_core::config::MlflowConfig;
use tracktune_core::credentials::{CredentialStore, KeySources, find_api_key};
use tracktune_core::error::TrackingError;
use tracktune_core::tracking::{RunHandle, RunOutcome, RunSpec};
use tracktune_core::types::{Metrics, TrialConfig, flatten_config, param_string};

pub const SERVICE: &str = "mlflow";
pub const TRACKING_URI_ENV: &str = "MLFLOW_TRACKING_URI";
pub const TOKEN_ENV: &str = "MLFLOW_TRACKING_TOKEN";

/// Server-side limit on params per `log-batch` call.
const MAX_PARAMS_PER_BATCH: usize = 100;
/// Server-side limit on metrics per `log-batch` call.
const MAX_METRICS_PER_BATCH: usize = 1000;
/// Longest param value MLflow accepts.
const MAX_PARAM_VALUE_LEN: usize = 6000;

/// Trait for MLflow REST interactions. Endpoints are relative to `/api/2.0/mlflow/`.
#[async_trait]
pub trait MlflowHttpClient: Send + Sync {
    async fn get(&self, endpoint: &str, query: &[(&str, &str)]) -> Result<Value, TrackingError>;

    async fn post(&self, endpoint: &str, body: Value) -> Result<Value, TrackingError>;
}

/// MLflow client.
pub struct MlflowClient {
    experiment_name: String,
    tags: Vec<String>,
    ui_url: String,
    http: Box<dyn MlflowHttpClient>,
    /// Experiment name -> id.
    experiment_ids: Mutex<HashMap<String, String>>,
}

impl MlflowClient {
    pub fn new(config: &MlflowConfig, ui_url: &str, http: Box<dyn MlflowHttpClient>) -> Self {
        Self {
            experiment_name: config.experiment_name.clone(),
            tags: config.tags.clone(),
            ui_url: ui_url.trim_end_matches('/').to_string(),
            http,
            experiment_ids: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve the tracking URI (and optional token) and build a client on
    /// the real HTTP transport.
    pub fn from_config(
        config: &MlflowConfig,
        store: Option<&dyn CredentialStore>,
    ) -> Result<Self, TrackingError> {
        let uri = config
            .tracking_uri
            .clone()
            .filter(|u| !u.trim().is_empty())
            .or_else(|| std::env::var(TRACKING_URI_ENV).ok())
            .ok_or_else(|| {
                TrackingError::missing_credential(
                    SERVICE,
                    format!("tracking URI (set {TRACKING_URI_ENV} or configure tracking_uri)"),
                )
            })?;
        if !(uri.starts_with("http://") || uri.starts_with("https://")) {
            return Err(TrackingError::InvalidSettings {
                message: format!("mlflow: tracking URI must be http(s), got '{uri}'"),
            });
        }
        let token = resolve_token(config, store)?;
        let http = RealMlflowHttp::new(&uri, token)?;
        Ok(Self::new(config, &uri, Box::new(http)))
    }

    /// Id of the experiment named `name`, resolved on first use.
    async fn experiment_id(&self, name: &str) -> Result<String, TrackingError> {
        let mut ids = self.experiment_ids.lock().await;
        if let Some(id) = ids.get(name) {
            return Ok(id.clone());
        }
        let id = self.resolve_experiment(name).await?;
        ids.insert(name.to_string(), id.clone());
        Ok(id)
    }

    async fn resolve_experiment(&self, name: &str) -> Result<String, TrackingError> {
        let found = self
            .http
            .get("experiments/get-by-name", &[("experiment_name", name)])
            .await;
        match found {
            Ok(body) => body
                .pointer("/experiment/experiment_id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| TrackingError::parse(SERVICE, "experiment has no id")),
            Err(TrackingError::Api { status: 404, .. }) => {
                info!(experiment = %name, "Creating MLflow experiment");
                let created = self
                    .http
                    .post("experiments/create", json!({ "name": name }))
                    .await?;
                created
                    .get("experiment_id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| TrackingError::parse(SERVICE, "create returned no experiment_id"))
            }
            Err(e) => Err(e),
        }
    }

    async fn log_batch(&self, run_id: &str, params: Vec<Value>, metrics: Vec<Value>) -> Result<(), TrackingError> {
        for chunk in params.chunks(MAX_PARAMS_PER_BATCH) {
            self.http
                .post(
                    "runs/log-batch",
                    json!({ "run_id": run_id, "params": chunk }),
                )
                .await?;
        }
        for chunk in metrics.chunks(MAX_METRICS_PER_BATCH) {
            self.http
                .post(
                    "runs/log-batch",
                    json!({ "run_id": run_id, "metrics": chunk }),
                )
                .await?;
        }
        Ok(())
    }
}

/// Bearer token from settings, `MLFLOW_TRACKING_TOKEN` or the credential
/// store. Servers without auth need none.
fn resolve_token(
    config: &MlflowConfig,
    store: Option<&dyn CredentialStore>,
) -> Result<Option<String>, TrackingError> {
    let sources = KeySources {
        explicit: config.token.as_deref(),
        key_file: None,
        env_var: Some(TOKEN_ENV),
    };
    find_api_key(SERVICE, &sources, store)
}

fn tag(key: &str, value: impl Into<String>) -> Value {
    json!({ "key": key, "value": value.into() })
}

fn run_status(outcome: &RunOutcome) -> &'static str {
    match outcome {
        RunOutcome::Finished => "FINISHED",
        RunOutcome::Failed(_) => "FAILED",
        RunOutcome::Killed => "KILLED",
    }
}

#[async_trait]
impl TrackingClient for MlflowClient {
    fn name(&self) -> &str {
        SERVICE
    }

    async fn start_run(&self, spec: &RunSpec) -> Result<RunHandle, TrackingError> {
        let experiment_name = spec.project.as_deref().unwrap_or(&self.experiment_name);
        let experiment_id = self.experiment_id(experiment_name).await?;
        let mut tags = vec![
            tag("trial_id", spec.trial_id.as_str()),
            tag("mlflow.runName", spec.run_name.as_str()),
        ];
        if let Some(group) = &spec.group {
            tags.push(tag("experiment_group", group.as_str()));
        }
        for t in http::merge_tags(&self.tags, &spec.tags) {
            tags.push(tag(&t, ""));
        }

        let body = self
            .http
            .post(
                "runs/create",
                json!({
                    "experiment_id": experiment_id,
                    "run_name": spec.run_name,
                    "start_time": http::now_millis(),
                    "tags": tags,
                }),
            )
            .await?;
        let run_id = body
            .pointer("/run/info/run_id")
            .and_then(Value::as_str)
            .ok_or_else(|| TrackingError::parse(SERVICE, "Missing 'run.info.run_id' in response"))?
            .to_string();

        debug!(trial_id = %spec.trial_id, run_id = %run_id, "Created MLflow run");
        Ok(RunHandle {
            url: Some(format!(
                "{}/#/experiments/{experiment_id}/runs/{run_id}",
                self.ui_url
            )),
            run_id,
            trial_id: spec.trial_id.clone(),
        })
    }

    async fn log_params(&self, run: &RunHandle, params: &TrialConfig) -> Result<(), TrackingError> {
        let params: Vec<Value> = flatten_config(params)
            .iter()
            .map(|(k, v)| {
                let value: String = param_string(v).chars().take(MAX_PARAM_VALUE_LEN).collect();
                tag(k, value)
            })
            .collect();
        self.log_batch(&run.run_id, params, Vec::new()).await
    }

    async fn log_metrics(
        &self,
        run: &RunHandle,
        metrics: &Metrics,
        step: u64,
    ) -> Result<(), TrackingError> {
        let timestamp = http::now_millis();
        let metrics: Vec<Value> = metrics
            .iter()
            .filter_map(|(key, value)| match finite(*value) {
                Some(number) => Some(json!({
                    "key": key,
                    "value": number,
                    "timestamp": timestamp,
                    "step": step,
                })),
                None => {
                    debug!(metric = %key, step, "Skipping non-finite metric");
                    None
                }
            })
            .collect();
        if metrics.is_empty() {
            return Ok(());
        }
        self.log_batch(&run.run_id, Vec::new(), metrics).await
    }

    async fn finish_run(&self, run: &RunHandle, outcome: RunOutcome) -> Result<(), TrackingError> {
        if let RunOutcome::Failed(reason) = &outcome {
            warn!(trial_id = %run.trial_id, run_id = %run.run_id, reason = %reason, "Marking MLflow run failed");
            // Best-effort; the status update below is what matters.
            if let Err(e) = self
                .http
                .post(
                    "runs/set-tag",
                    json!({ "run_id": run.run_id, "key": "error", "value": reason }),
                )
                .await
            {
                debug!(error = %e, "Failed to tag MLflow run with its error");
            }
        }
        self.http
            .post(
                "runs/update",
                json!({
                    "run_id": run.run_id,
                    "status": run_status(&outcome),
                    "end_time": http::now_millis(),
                }),
            )
            .await
            .map(|_| ())
    }
}

/// Real MLflow HTTP client using reqwest.
pub struct RealMlflowHttp {
    client: reqwest::Client,
    api_url: String,
    token: Option<String>,
}

impl RealMlflowHttp {
    pub fn new(tracking_uri: &str, token: Option<String>) -> Result<Self, TrackingError> {
        Ok(Self {
            client: http::build_client(SERVICE)?,
            api_url: format!("{}/api/2.0/mlflow", tracking_uri.trim_end_matches('/')),
            token,
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl MlflowHttpClient for RealMlflowHttp {
    async fn get(&self, endpoint: &str, query: &[(&str, &str)]) -> Result<Value, TrackingError> {
        let request = self
            .client
            .get(format!("{}/{endpoint}", self.api_url))
            .query(query);
        http::send_json(SERVICE, self.authorize(request)).await
    }

    async fn post(&self, endpoint: &str, body: Value) -> Result<Value, TrackingError> {
        let request = self
            .client
            .post(format!("{}/{endpoint}", self.api_url))
            .json(&body);
        http::send_json(SERVICE, self.authorize(request)).await
    }
}
