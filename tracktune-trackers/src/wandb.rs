//! Weights & Biases tracking client.
//!
//! Runs are created and configured through the GraphQL `upsertBucket`
//! mutation. History rows and the final exit code go through the run's
//! `file_stream` endpoint. In tests, uses a mock HTTP client.

use crate::http::{self, finite, merge_tags};
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use tracktune_core::TrackingClient;
use tracktune_core::config::WandbConfig;
use tracktune_core::credentials::{CredentialStore, KeySources, resolve_api_key};
use tracktune_core::error::TrackingError;
use tracktune_core::tracking::{RunHandle, RunOutcome, RunSpec};
use tracktune_core::types::{Metrics, TrialConfig, flatten_config};

pub const SERVICE: &str = "wandb";
pub const API_KEY_ENV: &str = "WANDB_API_KEY";

const HISTORY_FILE: &str = "wandb-history.jsonl";

const UPSERT_BUCKET: &str = r#"
mutation UpsertBucket(
    $name: String, $project: String, $entity: String, $groupName: String,
    $displayName: String, $config: JSONString, $tags: [String!]
) {
    upsertBucket(input: {
        name: $name, modelName: $project, entityName: $entity, groupName: $groupName,
        displayName: $displayName, config: $config, tags: $tags
    }) {
        bucket { id name displayName project { name entity { name } } }
        inserted
    }
}
"#;

/// Trait for W&B API interactions.
#[async_trait]
pub trait WandbHttpClient: Send + Sync {
    /// Run a GraphQL request and return its `data` object.
    async fn graphql(&self, query: &str, variables: Value) -> Result<Value, TrackingError>;

    async fn file_stream(
        &self,
        entity: &str,
        project: &str,
        run: &str,
        body: Value,
    ) -> Result<(), TrackingError>;
}

/// Per-run stream position. Held locked while a history line is in flight
/// so offsets stay contiguous.
#[derive(Debug)]
struct RunStream {
    entity: String,
    project: String,
    history_offset: usize,
}

/// W&B client.
pub struct WandbClient {
    entity: Option<String>,
    project: String,
    group: Option<String>,
    tags: Vec<String>,
    app_url: String,
    http: Box<dyn WandbHttpClient>,
    streams: Mutex<HashMap<String, Arc<Mutex<RunStream>>>>,
}

impl WandbClient {
    pub fn new(config: &WandbConfig, http: Box<dyn WandbHttpClient>) -> Self {
        Self {
            entity: config.entity.clone(),
            project: config.project.clone(),
            group: config.group.clone(),
            tags: config.tags.clone(),
            app_url: app_url(&config.base_url),
            http,
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve the API key and build a client on the real HTTP transport.
    pub fn from_config(
        config: &WandbConfig,
        store: Option<&dyn CredentialStore>,
    ) -> Result<Self, TrackingError> {
        let sources = KeySources {
            explicit: config.api_key.as_deref(),
            key_file: config.api_key_file.as_deref(),
            env_var: Some(API_KEY_ENV),
        };
        let api_key = resolve_api_key(SERVICE, &sources, store)?;
        let http = RealWandbHttp::new(&config.base_url, api_key)?;
        Ok(Self::new(config, Box::new(http)))
    }

    async fn upsert(&self, variables: Value) -> Result<Value, TrackingError> {
        let data = self.http.graphql(UPSERT_BUCKET, variables).await?;
        data.pointer("/upsertBucket/bucket")
            .cloned()
            .ok_or_else(|| TrackingError::parse(SERVICE, "upsertBucket returned no bucket"))
    }

    async fn stream(&self, run: &RunHandle) -> Result<Arc<Mutex<RunStream>>, TrackingError> {
        self.streams
            .lock()
            .await
            .get(&run.run_id)
            .cloned()
            .ok_or_else(|| TrackingError::RunNotFound {
                trial_id: run.trial_id.clone(),
            })
    }
}

/// Web UI root for an API base URL (`https://api.wandb.ai` -> `https://wandb.ai`).
fn app_url(base_url: &str) -> String {
    base_url.trim_end_matches('/').replacen("://api.", "://", 1)
}

/// W&B run ids allow letters, digits, `-` and `_`.
fn run_id_for(trial_id: &str) -> String {
    trial_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Config in the `{"key": {"value": ...}}` shape W&B stores.
fn config_json(params: &TrialConfig) -> Result<String, TrackingError> {
    let wrapped: Map<String, Value> = flatten_config(params)
        .into_iter()
        .map(|(k, v)| (k, json!({ "value": v })))
        .collect();
    serde_json::to_string(&wrapped)
        .map_err(|e| TrackingError::parse(SERVICE, format!("config encode failed: {e}")))
}

fn history_line(metrics: &Metrics, step: u64) -> Result<String, TrackingError> {
    let mut row = Map::new();
    for (key, value) in metrics {
        match finite(*value) {
            Some(number) => {
                row.insert(key.clone(), number);
            }
            None => debug!(metric = %key, step, "Skipping non-finite metric"),
        }
    }
    row.insert("_step".into(), json!(step));
    row.insert(
        "_timestamp".into(),
        json!(http::now_millis() as f64 / 1000.0),
    );
    serde_json::to_string(&row)
        .map_err(|e| TrackingError::parse(SERVICE, format!("history encode failed: {e}")))
}

#[async_trait]
impl TrackingClient for WandbClient {
    fn name(&self) -> &str {
        SERVICE
    }

    async fn start_run(&self, spec: &RunSpec) -> Result<RunHandle, TrackingError> {
        let run_id = run_id_for(&spec.trial_id);
        let project = spec.project.clone().unwrap_or_else(|| self.project.clone());
        let variables = json!({
            "name": run_id,
            "project": project,
            "entity": self.entity,
            "groupName": spec.group.clone().or_else(|| self.group.clone()),
            "displayName": spec.run_name,
            "config": config_json(&spec.config)?,
            "tags": merge_tags(&self.tags, &spec.tags),
        });
        let bucket = self.upsert(variables).await?;

        let name = bucket
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(&run_id)
            .to_string();
        let entity = bucket
            .pointer("/project/entity/name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| self.entity.clone())
            .ok_or_else(|| TrackingError::parse(SERVICE, "bucket has no entity"))?;
        let project = bucket
            .pointer("/project/name")
            .and_then(Value::as_str)
            .unwrap_or(&project)
            .to_string();

        let url = format!("{}/{entity}/{project}/runs/{name}", self.app_url);
        debug!(trial_id = %spec.trial_id, run = %name, url = %url, "Created W&B run");
        self.streams.lock().await.insert(
            name.clone(),
            Arc::new(Mutex::new(RunStream {
                entity,
                project,
                history_offset: 0,
            })),
        );
        Ok(RunHandle {
            run_id: name,
            trial_id: spec.trial_id.clone(),
            url: Some(url),
        })
    }

    async fn log_params(&self, run: &RunHandle, params: &TrialConfig) -> Result<(), TrackingError> {
        let (entity, project) = {
            let stream = self.stream(run).await?;
            let stream = stream.lock().await;
            (stream.entity.clone(), stream.project.clone())
        };
        self.upsert(json!({
            "name": run.run_id,
            "project": project,
            "entity": entity,
            "config": config_json(params)?,
        }))
        .await
        .map(|_| ())
    }

    async fn log_metrics(
        &self,
        run: &RunHandle,
        metrics: &Metrics,
        step: u64,
    ) -> Result<(), TrackingError> {
        let stream = self.stream(run).await?;
        let mut stream = stream.lock().await;
        let mut files = Map::new();
        files.insert(
            HISTORY_FILE.to_string(),
            json!({
                "offset": stream.history_offset,
                "content": [history_line(metrics, step)?],
            }),
        );
        let body = json!({ "files": files });
        self.http
            .file_stream(&stream.entity, &stream.project, &run.run_id, body)
            .await?;
        stream.history_offset += 1;
        Ok(())
    }

    async fn finish_run(&self, run: &RunHandle, outcome: RunOutcome) -> Result<(), TrackingError> {
        let stream = self.streams.lock().await.remove(&run.run_id).ok_or_else(|| {
            TrackingError::RunNotFound {
                trial_id: run.trial_id.clone(),
            }
        })?;
        // Waits for any history line still in flight.
        let stream = stream.lock().await;
        if let RunOutcome::Failed(reason) = &outcome {
            warn!(trial_id = %run.trial_id, run = %run.run_id, reason = %reason, "Marking W&B run failed");
        }
        let body = json!({ "complete": true, "exitcode": outcome.exit_code() });
        self.http
            .file_stream(&stream.entity, &stream.project, &run.run_id, body)
            .await
    }
}

/// Real W&B HTTP client using reqwest.
pub struct RealWandbHttp {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl RealWandbHttp {
    pub fn new(base_url: &str, api_key: String) -> Result<Self, TrackingError> {
        Ok(Self {
            client: http::build_client(SERVICE)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl WandbHttpClient for RealWandbHttp {
    async fn graphql(&self, query: &str, variables: Value) -> Result<Value, TrackingError> {
        let request = self
            .client
            .post(format!("{}/graphql", self.base_url))
            .basic_auth("api", Some(&self.api_key))
            .json(&json!({ "query": query, "variables": variables }));
        let json = http::send_json(SERVICE, request).await?;

        if let Some(errors) = json.get("errors").and_then(Value::as_array) {
            if let Some(first) = errors.first() {
                let message = first
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown GraphQL error");
                warn!(error = %message, "W&B GraphQL error");
                return Err(TrackingError::Api {
                    service: SERVICE.to_string(),
                    status: 200,
                    message: message.to_string(),
                });
            }
        }
        json.get("data")
            .cloned()
            .ok_or_else(|| TrackingError::parse(SERVICE, "Missing 'data' in GraphQL response"))
    }

    async fn file_stream(
        &self,
        entity: &str,
        project: &str,
        run: &str,
        body: Value,
    ) -> Result<(), TrackingError> {
        let request = self
            .client
            .post(format!(
                "{}/files/{entity}/{project}/{run}/file_stream",
                self.base_url
            ))
            .basic_auth("api", Some(&self.api_key))
            .json(&body);
        http::send_json(SERVICE, request).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};
    use tracktune_core::credentials::InMemoryCredentialStore;

    #[derive(Default)]
    struct Calls {
        graphql: Vec<Value>,
        streams: Vec<(String, Value)>,
    }

    struct MockWandbHttp {
        calls: Arc<StdMutex<Calls>>,
        fail_stream: bool,
    }

    impl MockWandbHttp {
        fn new() -> (Self, Arc<StdMutex<Calls>>) {
            let calls = Arc::new(StdMutex::new(Calls::default()));
            (
                Self {
                    calls: calls.clone(),
                    fail_stream: false,
                },
                calls,
            )
        }
    }

    #[async_trait]
    impl WandbHttpClient for MockWandbHttp {
        async fn graphql(&self, _query: &str, variables: Value) -> Result<Value, TrackingError> {
            let name = variables["name"].as_str().unwrap_or("run").to_string();
            let project = variables["project"].as_str().unwrap_or("p").to_string();
            self.calls.lock().unwrap().graphql.push(variables);
            Ok(json!({
                "upsertBucket": {
                    "bucket": {
                        "id": "UnVuOjE=",
                        "name": name,
                        "project": { "name": project, "entity": { "name": "team" } }
                    },
                    "inserted": true
                }
            }))
        }

        async fn file_stream(
            &self,
            entity: &str,
            project: &str,
            run: &str,
            body: Value,
        ) -> Result<(), TrackingError> {
            tokio::task::yield_now().await;
            self.calls
                .lock()
                .unwrap()
                .streams
                .push((format!("{entity}/{project}/{run}"), body));
            if self.fail_stream {
                return Err(TrackingError::Api {
                    service: SERVICE.into(),
                    status: 503,
                    message: "unavailable".into(),
                });
            }
            Ok(())
        }
    }

    fn spec() -> RunSpec {
        let config = json!({"mean": 2, "optimizer": {"lr": 0.1}})
            .as_object()
            .cloned()
            .unwrap();
        RunSpec::for_trial("mean sd_ab12c_00002", config)
            .with_group(Some("mean sd".into()))
            .with_tags(vec!["sweep".into()])
    }

    fn client() -> (WandbClient, Arc<StdMutex<Calls>>) {
        let (http, calls) = MockWandbHttp::new();
        let config = WandbConfig {
            project: "tune-demo".into(),
            tags: vec!["ray".into()],
            ..Default::default()
        };
        (WandbClient::new(&config, Box::new(http)), calls)
    }

    #[tokio::test]
    async fn test_start_run_upserts_bucket() {
        let (client, calls) = client();
        let run = client.start_run(&spec()).await.unwrap();
        assert_eq!(run.run_id, "mean-sd_ab12c_00002");
        assert_eq!(
            run.url.as_deref(),
            Some("https://wandb.ai/team/tune-demo/runs/mean-sd_ab12c_00002")
        );

        let calls = calls.lock().unwrap();
        let vars = &calls.graphql[0];
        assert_eq!(vars["project"], "tune-demo");
        assert_eq!(vars["groupName"], "mean sd");
        assert_eq!(vars["displayName"], "mean sd_ab12c_00002");
        assert_eq!(vars["tags"], json!(["ray", "sweep"]));
        let config: Value = serde_json::from_str(vars["config"].as_str().unwrap()).unwrap();
        assert_eq!(config["optimizer.lr"]["value"], 0.1);
    }

    #[tokio::test]
    async fn test_history_offsets_and_step() {
        let (client, calls) = client();
        let run = client.start_run(&spec()).await.unwrap();
        for step in 1..=3 {
            client
                .log_metrics(&run, &Metrics::from([("loss".into(), 1.0 / step as f64)]), step)
                .await
                .unwrap();
        }
        let calls = calls.lock().unwrap();
        assert_eq!(calls.streams.len(), 3);
        let (path, body) = &calls.streams[2];
        assert_eq!(path, "team/tune-demo/mean-sd_ab12c_00002");
        let file = &body["files"][HISTORY_FILE];
        assert_eq!(file["offset"], 2);
        let row: Value = serde_json::from_str(file["content"][0].as_str().unwrap()).unwrap();
        assert_eq!(row["_step"], 3);
        assert!(row.get("loss").is_some());
    }

    #[tokio::test]
    async fn test_concurrent_logs_get_distinct_offsets() {
        let (client, calls) = client();
        let run = client.start_run(&spec()).await.unwrap();
        let a = Metrics::from([("loss".into(), 0.5)]);
        let b = Metrics::from([("loss".into(), 0.4)]);
        let (ra, rb) = tokio::join!(
            client.log_metrics(&run, &a, 1),
            client.log_metrics(&run, &b, 2)
        );
        ra.unwrap();
        rb.unwrap();
        let calls = calls.lock().unwrap();
        let mut offsets: Vec<u64> = calls
            .streams
            .iter()
            .filter_map(|(_, body)| body["files"][HISTORY_FILE]["offset"].as_u64())
            .collect();
        offsets.sort();
        assert_eq!(offsets, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_non_finite_metric_dropped() {
        let (client, calls) = client();
        let run = client.start_run(&spec()).await.unwrap();
        let metrics = Metrics::from([("loss".into(), f64::NAN), ("acc".into(), 0.5)]);
        client.log_metrics(&run, &metrics, 1).await.unwrap();
        let calls = calls.lock().unwrap();
        let content = calls.streams[0].1["files"][HISTORY_FILE]["content"][0]
            .as_str()
            .unwrap()
            .to_string();
        let row: Value = serde_json::from_str(&content).unwrap();
        assert!(row.get("loss").is_none());
        assert_eq!(row["acc"], 0.5);
    }

    #[tokio::test]
    async fn test_finish_sends_exit_code_once() {
        let (client, calls) = client();
        let run = client.start_run(&spec()).await.unwrap();
        client
            .finish_run(&run, RunOutcome::Failed("diverged".into()))
            .await
            .unwrap();
        {
            let calls = calls.lock().unwrap();
            let body = &calls.streams.last().unwrap().1;
            assert_eq!(body["complete"], true);
            assert_eq!(body["exitcode"], 1);
        }
        assert!(matches!(
            client.finish_run(&run, RunOutcome::Finished).await,
            Err(TrackingError::RunNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_stream_keeps_offset() {
        let (mut http, calls) = MockWandbHttp::new();
        http.fail_stream = true;
        let client = WandbClient::new(&WandbConfig::default(), Box::new(http));
        let run = client.start_run(&spec()).await.unwrap();
        assert!(client.log_metrics(&run, &Metrics::new(), 1).await.is_err());
        assert!(client.log_metrics(&run, &Metrics::new(), 2).await.is_err());
        let calls = calls.lock().unwrap();
        assert_eq!(calls.streams[1].1["files"][HISTORY_FILE]["offset"], 0);
    }

    #[test]
    fn test_from_config_requires_key() {
        let config = WandbConfig::default();
        let store = InMemoryCredentialStore::new();
        if std::env::var(API_KEY_ENV).is_err() {
            let err = WandbClient::from_config(&config, Some(&store)).err().unwrap();
            assert!(matches!(err, TrackingError::MissingCredential { .. }));
        }
        store.store_key(SERVICE, "wb-key").unwrap();
        assert!(WandbClient::from_config(&config, Some(&store)).is_ok());
    }

    #[test]
    fn test_app_url() {
        assert_eq!(app_url("https://api.wandb.ai/"), "https://wandb.ai");
        assert_eq!(app_url("http://localhost:8080"), "http://localhost:8080");
    }
}
