//! Comet tracking client over the REST v2 write API.
//!
//! Each trial becomes a Comet experiment inside the configured project.

use crate::http::{self, finite, merge_tags};
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, warn};
use tracktune_core::TrackingClient;
use tracktune_core::config::CometConfig;
use tracktune_core::credentials::{CredentialStore, KeySources, resolve_api_key};
use tracktune_core::error::TrackingError;
use tracktune_core::tracking::{RunHandle, RunOutcome, RunSpec};
use tracktune_core::types::{Metrics, TrialConfig, flatten_config, param_string};

pub const SERVICE: &str = "comet";
pub const API_KEY_ENV: &str = "COMET_API_KEY";

/// Trait for Comet write-API interactions. Endpoints are relative to
/// `/api/rest/v2/write/`.
#[async_trait]
pub trait CometHttpClient: Send + Sync {
    async fn write(&self, endpoint: &str, body: Value) -> Result<Value, TrackingError>;
}

/// Comet client.
pub struct CometClient {
    workspace: Option<String>,
    project_name: String,
    tags: Vec<String>,
    http: Box<dyn CometHttpClient>,
}

impl CometClient {
    pub fn new(config: &CometConfig, http: Box<dyn CometHttpClient>) -> Self {
        Self {
            workspace: config.workspace.clone(),
            project_name: config.project_name.clone(),
            tags: config.tags.clone(),
            http,
        }
    }

    /// Resolve the API key and build a client on the real HTTP transport.
    pub fn from_config(
        config: &CometConfig,
        store: Option<&dyn CredentialStore>,
    ) -> Result<Self, TrackingError> {
        let sources = KeySources {
            explicit: config.api_key.as_deref(),
            key_file: config.api_key_file.as_deref(),
            env_var: Some(API_KEY_ENV),
        };
        let api_key = resolve_api_key(SERVICE, &sources, store)?;
        let http = RealCometHttp::new(&config.base_url, api_key)?;
        Ok(Self::new(config, Box::new(http)))
    }

    async fn log_other(&self, key: &str, run: &str, value: &str) -> Result<(), TrackingError> {
        self.http
            .write(
                "experiment/log-other",
                json!({ "experimentKey": run, "key": key, "value": value }),
            )
            .await
            .map(|_| ())
    }

    /// Start time, trial metadata and tags for a freshly created experiment.
    async fn describe_experiment(&self, key: &str, spec: &RunSpec) -> Result<(), TrackingError> {
        self.http
            .write(
                "experiment/set-start-end-time",
                json!({ "experimentKey": key, "startTimeMillis": http::now_millis() }),
            )
            .await?;
        self.log_other("trial_id", key, &spec.trial_id).await?;
        if let Some(group) = &spec.group {
            self.log_other("group", key, group).await?;
        }
        let tags = merge_tags(&self.tags, &spec.tags);
        if !tags.is_empty() {
            self.http
                .write(
                    "experiment/tags",
                    json!({ "experimentKey": key, "addedTags": tags }),
                )
                .await?;
        }
        Ok(())
    }
}

fn outcome_label(outcome: &RunOutcome) -> String {
    match outcome {
        RunOutcome::Finished => "finished".to_string(),
        RunOutcome::Failed(reason) => format!("failed: {reason}"),
        RunOutcome::Killed => "killed".to_string(),
    }
}

#[async_trait]
impl TrackingClient for CometClient {
    fn name(&self) -> &str {
        SERVICE
    }

    async fn start_run(&self, spec: &RunSpec) -> Result<RunHandle, TrackingError> {
        let project = spec
            .project
            .clone()
            .unwrap_or_else(|| self.project_name.clone());
        let created = self
            .http
            .write(
                "experiment/create",
                json!({
                    "workspaceName": self.workspace,
                    "projectName": project,
                    "experimentName": spec.run_name,
                }),
            )
            .await?;
        let key = created
            .get("experimentKey")
            .and_then(Value::as_str)
            .ok_or_else(|| TrackingError::parse(SERVICE, "Missing 'experimentKey' in response"))?
            .to_string();
        let url = created
            .get("link")
            .and_then(Value::as_str)
            .map(str::to_string);

        if let Err(e) = self.describe_experiment(&key, spec).await {
            warn!(trial_id = %spec.trial_id, experiment_key = %key, error = %e, "Comet experiment setup failed, ending it");
            let handle = RunHandle {
                run_id: key,
                trial_id: spec.trial_id.clone(),
                url,
            };
            if let Err(end_err) = self.finish_run(&handle, RunOutcome::Killed).await {
                warn!(experiment_key = %handle.run_id, error = %end_err, "Failed to end Comet experiment");
            }
            return Err(e);
        }

        debug!(trial_id = %spec.trial_id, experiment_key = %key, "Created Comet experiment");
        Ok(RunHandle {
            run_id: key,
            trial_id: spec.trial_id.clone(),
            url,
        })
    }

    async fn log_params(&self, run: &RunHandle, params: &TrialConfig) -> Result<(), TrackingError> {
        for (name, value) in flatten_config(params) {
            self.http
                .write(
                    "experiment/parameter",
                    json!({
                        "experimentKey": run.run_id,
                        "parameterName": name,
                        "parameterValue": param_string(&value),
                    }),
                )
                .await?;
        }
        Ok(())
    }

    async fn log_metrics(
        &self,
        run: &RunHandle,
        metrics: &Metrics,
        step: u64,
    ) -> Result<(), TrackingError> {
        let timestamp = http::now_millis();
        for (name, value) in metrics {
            let Some(number) = finite(*value) else {
                debug!(metric = %name, step, "Skipping non-finite metric");
                continue;
            };
            self.http
                .write(
                    "experiment/metric",
                    json!({
                        "experimentKey": run.run_id,
                        "metricName": name,
                        "metricValue": number,
                        "step": step,
                        "timestamp": timestamp,
                    }),
                )
                .await?;
        }
        Ok(())
    }

    async fn finish_run(&self, run: &RunHandle, outcome: RunOutcome) -> Result<(), TrackingError> {
        if let RunOutcome::Failed(reason) = &outcome {
            warn!(trial_id = %run.trial_id, experiment_key = %run.run_id, reason = %reason, "Marking Comet experiment failed");
        }
        let logged = self
            .log_other("outcome", &run.run_id, &outcome_label(&outcome))
            .await;
        let ended = self
            .http
            .write(
                "experiment/set-start-end-time",
                json!({ "experimentKey": run.run_id, "endTimeMillis": http::now_millis() }),
            )
            .await
            .map(|_| ());
        logged.and(ended)
    }
}

/// Real Comet HTTP client using reqwest.
pub struct RealCometHttp {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
}

impl RealCometHttp {
    pub fn new(base_url: &str, api_key: String) -> Result<Self, TrackingError> {
        Ok(Self {
            client: http::build_client(SERVICE)?,
            api_url: format!("{}/api/rest/v2/write", base_url.trim_end_matches('/')),
            api_key,
        })
    }
}

#[async_trait]
impl CometHttpClient for RealCometHttp {
    async fn write(&self, endpoint: &str, body: Value) -> Result<Value, TrackingError> {
        let request = self
            .client
            .post(format!("{}/{endpoint}", self.api_url))
            .header("Authorization", &self.api_key)
            .json(&body);
        http::send_json(SERVICE, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tracktune_core::credentials::InMemoryCredentialStore;

    type Calls = Arc<Mutex<Vec<(String, Value)>>>;

    struct MockCometHttp {
        calls: Calls,
        fail_on: Option<&'static str>,
    }

    #[async_trait]
    impl CometHttpClient for MockCometHttp {
        async fn write(&self, endpoint: &str, body: Value) -> Result<Value, TrackingError> {
            self.calls
                .lock()
                .unwrap()
                .push((endpoint.to_string(), body));
            if self.fail_on == Some(endpoint) {
                return Err(TrackingError::Api {
                    service: SERVICE.into(),
                    status: 500,
                    message: "boom".into(),
                });
            }
            Ok(match endpoint {
                "experiment/create" => json!({
                    "experimentKey": "ek-1",
                    "link": "https://www.comet.com/team/tune-demo/ek-1"
                }),
                _ => json!({}),
            })
        }
    }

    fn client(fail_on: Option<&'static str>) -> (CometClient, Calls) {
        let calls: Calls = Arc::default();
        let config = CometConfig {
            workspace: Some("team".into()),
            project_name: "tune-demo".into(),
            tags: vec!["sweep".into()],
            ..Default::default()
        };
        let http = MockCometHttp {
            calls: calls.clone(),
            fail_on,
        };
        (CometClient::new(&config, Box::new(http)), calls)
    }

    fn spec() -> RunSpec {
        RunSpec::for_trial("exp_ab12c_00003", TrialConfig::new()).with_group(Some("exp".into()))
    }

    fn bodies(calls: &Calls, endpoint: &str) -> Vec<Value> {
        calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(e, _)| e == endpoint)
            .map(|(_, b)| b.clone())
            .collect()
    }

    #[tokio::test]
    async fn test_start_creates_and_tags_experiment() {
        let (client, calls) = client(None);
        let run = client.start_run(&spec()).await.unwrap();
        assert_eq!(run.run_id, "ek-1");
        assert_eq!(
            run.url.as_deref(),
            Some("https://www.comet.com/team/tune-demo/ek-1")
        );

        let create = &bodies(&calls, "experiment/create")[0];
        assert_eq!(create["workspaceName"], "team");
        assert_eq!(create["projectName"], "tune-demo");
        let others = bodies(&calls, "experiment/log-other");
        assert!(others.contains(&json!({"experimentKey": "ek-1", "key": "trial_id", "value": "exp_ab12c_00003"})));
        assert_eq!(bodies(&calls, "experiment/tags")[0]["addedTags"], json!(["sweep"]));
    }

    #[tokio::test]
    async fn test_metric_per_key_with_step() {
        let (client, calls) = client(None);
        let run = client.start_run(&spec()).await.unwrap();
        let metrics = Metrics::from([
            ("acc".into(), 0.9),
            ("loss".into(), 0.1),
            ("nan".into(), f64::NAN),
        ]);
        client.log_metrics(&run, &metrics, 2).await.unwrap();
        let logged = bodies(&calls, "experiment/metric");
        assert_eq!(logged.len(), 2);
        assert!(logged.iter().all(|b| b["step"] == 2));
        assert_eq!(logged[1]["metricName"], "loss");
    }

    #[tokio::test]
    async fn test_params_stringified() {
        let (client, calls) = client(None);
        let run = client.start_run(&spec()).await.unwrap();
        let params = json!({"mean": 3, "opt": {"name": "adam"}})
            .as_object()
            .cloned()
            .unwrap();
        client.log_params(&run, &params).await.unwrap();
        let logged = bodies(&calls, "experiment/parameter");
        assert_eq!(logged[0]["parameterName"], "mean");
        assert_eq!(logged[0]["parameterValue"], "3");
        assert_eq!(logged[1]["parameterName"], "opt.name");
        assert_eq!(logged[1]["parameterValue"], "adam");
    }

    #[tokio::test]
    async fn test_finish_sets_end_time_even_if_outcome_log_fails() {
        let (client, calls) = client(Some("experiment/log-other"));
        let run = RunHandle {
            run_id: "ek-9".into(),
            trial_id: "t".into(),
            url: None,
        };
        let result = client.finish_run(&run, RunOutcome::Killed).await;
        assert!(result.is_err());
        let ends = bodies(&calls, "experiment/set-start-end-time");
        assert_eq!(ends.len(), 1);
        assert!(ends[0].get("endTimeMillis").is_some());
    }

    #[tokio::test]
    async fn test_start_ends_experiment_when_setup_fails() {
        let (client, calls) = client(Some("experiment/tags"));
        assert!(client.start_run(&spec()).await.is_err());
        assert_eq!(bodies(&calls, "experiment/create").len(), 1);
        let times = bodies(&calls, "experiment/set-start-end-time");
        assert!(times.iter().any(|b| b.get("endTimeMillis").is_some()));
        let others = bodies(&calls, "experiment/log-other");
        assert!(others.iter().any(|b| b["key"] == "outcome" && b["value"] == "killed"));
    }

    #[test]
    fn test_from_config_with_stored_key() {
        let store = InMemoryCredentialStore::new();
        store.store_key(SERVICE, "ck-123").unwrap();
        assert!(CometClient::from_config(&CometConfig::default(), Some(&store)).is_ok());
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(outcome_label(&RunOutcome::Finished), "finished");
        assert_eq!(outcome_label(&RunOutcome::Failed("x".into())), "failed: x");
    }
}
