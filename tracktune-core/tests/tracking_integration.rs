//! Integration tests for the tracking integrations.
//!
//! These run the demo sweep and hand-written trainables end-to-end through the
//! tuner with a `RecordingTrackingClient`, checking run lifecycles and metric
//! forwarding for both the logger-callback and the scoped-run shapes.

use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracktune_core::config::TuneConfig;
use tracktune_core::demo::{DemoOptions, DemoTracking, run_demo};
use tracktune_core::error::{TrackingError, TrialError, TuneError};
use tracktune_core::search::{Domain, SearchSpace};
use tracktune_core::tracking::{
    RecordingTrackingClient, RunOutcome, TrackedSession, TrackerSettings, TrackingClient,
    TrackingClientFactory, TrackingLoggerCallback, tracked,
};
use tracktune_core::tune::{TrialSession, TrialStatus, Tuner};
use tracktune_core::types::{Metrics, RESERVED_TRACKER_KEYS};

const TRACKERS: [&str; 3] = RESERVED_TRACKER_KEYS;

fn tune_config() -> TuneConfig {
    TuneConfig {
        experiment_name: "integration".into(),
        seed: Some(11),
        max_concurrent_trials: 3,
        ..Default::default()
    }
}

fn factory_for(client: Arc<RecordingTrackingClient>) -> Arc<dyn TrackingClientFactory> {
    Arc::new(
        move |_key: &str,
              _settings: &serde_json::Value|
              -> Result<Arc<dyn TrackingClient>, TrackingError> { Ok(client.clone()) },
    )
}

/// Let runs released from `Drop` finish on the runtime.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

fn sorted_keys(map: &serde_json::Map<String, serde_json::Value>) -> Vec<String> {
    let mut keys: Vec<String> = map.keys().cloned().collect();
    keys.sort();
    keys
}

// --- Demo entry point, all three integrations ---

#[tokio::test]
async fn test_demo_callback_best_config_matches_space() {
    for tracker in TRACKERS {
        let client = Arc::new(RecordingTrackingClient::new(tracker));
        let tracking = DemoTracking::Callback {
            client: client.clone(),
            settings: TrackerSettings::new(),
        };
        let analysis = run_demo(DemoOptions::default(), tracking, tune_config())
            .await
            .unwrap();

        let best = analysis.best_config().unwrap();
        assert_eq!(sorted_keys(&best), vec!["mean".to_string(), "sd".to_string()]);
        assert_eq!(client.runs_started(), 5, "{tracker}");
        assert_eq!(client.runs_finished(), 5, "{tracker}");
    }
}

#[tokio::test]
async fn test_demo_scoped_best_config_matches_space() {
    for tracker in TRACKERS {
        let client = Arc::new(RecordingTrackingClient::new(tracker));
        let tracking = DemoTracking::Scoped {
            factory: factory_for(client.clone()),
            key: tracker.to_string(),
            settings: json!({"project": "demo", "group": "scoped"}),
        };
        let analysis = run_demo(DemoOptions::default(), tracking, tune_config())
            .await
            .unwrap();

        let best = analysis.best_config().unwrap();
        assert_eq!(sorted_keys(&best), vec!["mean".to_string(), "sd".to_string()]);
        assert!(!best.contains_key(tracker));
        for spec in client.started_specs() {
            assert_eq!(spec.group.as_deref(), Some("scoped"));
            assert!(!spec.config.contains_key(tracker));
        }
    }
}

#[tokio::test]
async fn test_demo_scoped_width_height_objective() {
    let client = Arc::new(RecordingTrackingClient::new("mlflow"));
    let options = DemoOptions {
        objective: tracktune_core::demo::Objective::WidthHeight,
        iterations: 5,
    };
    let tune = TuneConfig {
        num_samples: 4,
        ..tune_config()
    };
    let tracking = DemoTracking::Scoped {
        factory: factory_for(client.clone()),
        key: "mlflow".into(),
        settings: json!({}),
    };
    let analysis = run_demo(options, tracking, tune).await.unwrap();
    assert_eq!(analysis.trials.len(), 4);
    let best = analysis.best_config().unwrap();
    assert_eq!(
        sorted_keys(&best),
        vec!["height".to_string(), "width".to_string()]
    );
}

// --- Scoped runs open and close exactly once ---

#[tokio::test]
async fn test_scoped_run_opened_and_closed_once_per_trial() {
    let client = Arc::new(RecordingTrackingClient::new("wandb"));
    let tracking = DemoTracking::Scoped {
        factory: factory_for(client.clone()),
        key: "wandb".into(),
        settings: json!({}),
    };
    let analysis = run_demo(DemoOptions::default(), tracking, tune_config())
        .await
        .unwrap();
    settle().await;

    for trial in &analysis.trials {
        assert_eq!(trial.status, TrialStatus::Terminated);
        assert_eq!(client.runs_started_for(&trial.id), 1);
        assert_eq!(client.outcomes_for(&trial.id), vec![RunOutcome::Finished]);
    }
}

#[tokio::test]
async fn test_scoped_run_closed_once_when_logging_fails() {
    let client = Arc::new(RecordingTrackingClient::new("comet").failing_metrics());
    let tracking = DemoTracking::Scoped {
        factory: factory_for(client.clone()),
        key: "comet".into(),
        settings: json!({}),
    };
    let analysis = run_demo(DemoOptions::default(), tracking, tune_config())
        .await
        .unwrap();
    settle().await;

    assert_eq!(analysis.trials.len(), 5);
    for trial in &analysis.trials {
        assert_eq!(trial.status, TrialStatus::Errored);
        assert_eq!(client.runs_started_for(&trial.id), 1);
        let outcomes = client.outcomes_for(&trial.id);
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0], RunOutcome::Failed(_)));
    }
}

#[tokio::test]
async fn test_scoped_run_released_on_panic() {
    let client = Arc::new(RecordingTrackingClient::new("wandb"));
    let trainable = tracked(factory_for(client.clone()), "wandb", |ts: TrackedSession| async move {
        ts.run.log(&Metrics::from([("loss".into(), 1.0)])).await?;
        if ts.session.config().get("x") == Some(&json!(2)) {
            panic!("exploded");
        }
        Ok::<(), TrialError>(())
    });
    let space = SearchSpace::new().with("x", Domain::grid_search([1, 2, 3]));
    let analysis = Tuner::new(trainable, space, tune_config())
        .with_constant("wandb", json!({}))
        .run()
        .await
        .unwrap();
    settle().await;

    let statuses: Vec<TrialStatus> = analysis.trials.iter().map(|t| t.status).collect();
    assert_eq!(
        statuses,
        vec![
            TrialStatus::Terminated,
            TrialStatus::Errored,
            TrialStatus::Terminated
        ]
    );
    let panicked = &analysis.trials[1];
    assert!(panicked.error.as_deref().unwrap().contains("exploded"));
    assert_eq!(client.outcomes_for(&panicked.id), vec![RunOutcome::Killed]);
    assert_eq!(client.runs_started(), 3);
    assert_eq!(client.runs_finished(), 3);
}

#[tokio::test]
async fn test_scoped_run_killed_on_timeout() {
    let client = Arc::new(RecordingTrackingClient::new("mlflow"));
    let trainable = tracked(factory_for(client.clone()), "mlflow", |_ts: TrackedSession| async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok::<(), TrialError>(())
    });
    let tune = TuneConfig {
        trial_timeout_secs: Some(1),
        ..tune_config()
    };
    let space = SearchSpace::new().with("x", Domain::constant(1));
    let analysis = Tuner::new(trainable, space, tune).run().await.unwrap();
    settle().await;

    let trial = &analysis.trials[0];
    assert_eq!(trial.status, TrialStatus::Errored);
    assert!(trial.error.as_deref().unwrap().contains("timed out"));
    assert_eq!(client.outcomes_for(&trial.id), vec![RunOutcome::Killed]);
}

// --- Forwarded metrics equal reported metrics ---

type Reported = Arc<Mutex<HashMap<String, Vec<Metrics>>>>;

async fn reporting_trainable(reported: Reported, mut session: TrialSession) -> Result<(), TrialError> {
    let x = session
        .config()
        .get("x")
        .and_then(serde_json::Value::as_f64)
        .unwrap_or(0.0);
    for i in 0..(x as usize + 2) {
        let metrics = Metrics::from([
            ("loss".to_string(), x / (i as f64 + 1.0)),
            ("accuracy".to_string(), 1.0 - 1.0 / (i as f64 + 2.0)),
        ]);
        reported
            .lock()
            .unwrap()
            .entry(session.trial_id().to_string())
            .or_default()
            .push(metrics.clone());
        session.report(metrics).await?;
    }
    Ok(())
}

#[tokio::test]
async fn test_callback_forwards_exactly_reported_metrics() {
    let client = Arc::new(RecordingTrackingClient::new("mlflow"));
    let reported: Reported = Arc::default();
    let sink = reported.clone();
    let trainable = move |session: TrialSession| reporting_trainable(sink.clone(), session);
    let space = SearchSpace::new().with("x", Domain::grid_search([1, 2, 3, 4]));

    let analysis = Tuner::new(trainable, space, tune_config())
        .with_callback(Arc::new(TrackingLoggerCallback::new(
            client.clone(),
            TrackerSettings::new(),
        )))
        .run()
        .await
        .unwrap();

    let reported = reported.lock().unwrap().clone();
    assert_eq!(reported.len(), 4);
    for trial in &analysis.trials {
        let forwarded = client.metrics_for(&trial.id);
        let expected = &reported[&trial.id];
        assert_eq!(forwarded.len(), expected.len());
        let (metrics, steps): (Vec<Metrics>, Vec<u64>) = forwarded.into_iter().unzip();
        assert_eq!(&metrics, expected);
        assert_eq!(steps, (1..=expected.len() as u64).collect::<Vec<_>>());
        assert_eq!(trial.iterations(), expected.len() as u64);
    }
}

#[tokio::test]
async fn test_scoped_forwards_exactly_reported_metrics() {
    let client = Arc::new(RecordingTrackingClient::new("comet"));
    let tracking = DemoTracking::Scoped {
        factory: factory_for(client.clone()),
        key: "comet".into(),
        settings: json!({}),
    };
    let options = DemoOptions {
        iterations: 7,
        ..Default::default()
    };
    let analysis = run_demo(options, tracking, tune_config()).await.unwrap();

    for trial in &analysis.trials {
        let forwarded: Vec<Metrics> = client
            .metrics_for(&trial.id)
            .into_iter()
            .map(|(m, _)| m)
            .collect();
        let reported: Vec<Metrics> = trial.results.iter().map(|r| r.metrics.clone()).collect();
        assert_eq!(forwarded, reported);
    }
}

#[tokio::test]
async fn test_callback_logging_failure_does_not_fail_trials() {
    let client = Arc::new(RecordingTrackingClient::new("wandb").failing_metrics());
    let tracking = DemoTracking::Callback {
        client: client.clone(),
        settings: TrackerSettings::new(),
    };
    let options = DemoOptions {
        iterations: 3,
        ..Default::default()
    };
    let analysis = run_demo(options, tracking, tune_config()).await.unwrap();

    for trial in &analysis.trials {
        assert_eq!(trial.status, TrialStatus::Terminated);
        assert_eq!(client.runs_started_for(&trial.id), 1);
        assert_eq!(client.outcomes_for(&trial.id), vec![RunOutcome::Finished]);
        assert_eq!(client.metrics_for(&trial.id).len(), 3);
    }
}

// --- Failure handling ---

#[tokio::test]
async fn test_fail_fast_aborts_and_releases_runs() {
    let client = Arc::new(RecordingTrackingClient::new("wandb"));
    let trainable = |mut session: TrialSession| async move {
        let x = session.config().get("x").and_then(serde_json::Value::as_i64);
        if x == Some(1) {
            return Err(TrialError::failed("diverged"));
        }
        for _ in 0..200 {
            session.report(Metrics::from([("loss".into(), 0.5)])).await?;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok::<(), TrialError>(())
    };
    let tune = TuneConfig {
        fail_fast: true,
        max_concurrent_trials: 2,
        ..tune_config()
    };
    let space = SearchSpace::new().with("x", Domain::grid_search([0, 1, 2, 3]));

    let result = Tuner::new(trainable, space, tune)
        .with_callback(Arc::new(TrackingLoggerCallback::new(
            client.clone(),
            TrackerSettings::new(),
        )))
        .run()
        .await;

    match result {
        Err(TuneError::FailFast { message, .. }) => assert!(message.contains("diverged")),
        other => panic!("expected fail-fast error, got {other:?}"),
    }
    assert_eq!(client.runs_started(), client.runs_finished());
    let failed = client
        .events()
        .into_iter()
        .filter(|e| {
            matches!(
                e,
                tracktune_core::tracking::TrackingEvent::Finished {
                    outcome: RunOutcome::Failed(_),
                    ..
                }
            )
        })
        .count();
    assert_eq!(failed, 1);
}

#[tokio::test]
async fn test_cancellation_kills_running_trials() {
    let client = Arc::new(RecordingTrackingClient::new("comet"));
    let trainable = |mut session: TrialSession| async move {
        for _ in 0..500 {
            session.report(Metrics::from([("loss".into(), 1.0)])).await?;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok::<(), TrialError>(())
    };
    let tune = TuneConfig {
        max_concurrent_trials: 2,
        ..tune_config()
    };
    let space = SearchSpace::new().with("x", Domain::grid_search([0, 1, 2, 3]));
    let tuner = Tuner::new(trainable, space, tune).with_callback(Arc::new(
        TrackingLoggerCallback::new(client.clone(), TrackerSettings::new()),
    ));
    let cancel = tuner.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });

    let analysis = tuner.run().await.unwrap();
    assert!(analysis.trials.iter().all(|t| t.status == TrialStatus::Cancelled));
    assert_eq!(client.runs_started(), 2);
    assert_eq!(client.runs_finished(), 2);
    for spec in client.started_specs() {
        assert_eq!(client.outcomes_for(&spec.trial_id), vec![RunOutcome::Killed]);
    }
}

#[tokio::test]
async fn test_invalid_config_rejected_before_any_run() {
    let client = Arc::new(RecordingTrackingClient::new("wandb"));
    let tune = TuneConfig {
        max_concurrent_trials: 0,
        ..tune_config()
    };
    let tracking = DemoTracking::Callback {
        client: client.clone(),
        settings: TrackerSettings::new(),
    };
    let err = run_demo(DemoOptions::default(), tracking, tune)
        .await
        .unwrap_err();
    assert!(matches!(err, TuneError::InvalidConfig { .. }));
    assert_eq!(client.runs_started(), 0);
}
