//! Demonstration sweeps wired to a tracking service.
//!
//! Two toy objectives whose loss is computed from the sampled config, run
//! either with a [`TrackingLoggerCallback`] or inside a scoped tracking run.

use crate::config::TuneConfig;
use crate::error::{TrialError, TuneError};
use crate::search::{Domain, SearchSpace};
use crate::tracking::callback::{TrackerSettings, TrackingLoggerCallback};
use crate::tracking::client::{TrackingClient, TrackingClientFactory};
use crate::tracking::scope::{TrackedSession, tracked};
use crate::tune::analysis::ExperimentAnalysis;
use crate::tune::runner::Tuner;
use crate::tune::session::TrialSession;
use crate::types::{Metrics, TrialConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

pub const DEFAULT_ITERATIONS: u64 = 20;

/// Toy objective minimized by the demo sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Objective {
    /// `loss = mean + sd * noise`; `mean` on a grid, `sd` uniform.
    #[default]
    MeanSd,
    /// `loss = 1 / (0.1 + width * step / 100) + height / 10`.
    WidthHeight,
}

impl Objective {
    pub fn search_space(&self) -> SearchSpace {
        match self {
            Self::MeanSd => SearchSpace::new()
                .with("mean", Domain::grid_search([1, 2, 3, 4, 5]))
                .with("sd", Domain::uniform(0.2, 0.8)),
            Self::WidthHeight => SearchSpace::new()
                .with("width", Domain::randint(10, 100))
                .with("height", Domain::randint(0, 100)),
        }
    }

    fn loss(&self, config: &TrialConfig, step: u64, rng: &mut StdRng) -> Result<f64, TrialError> {
        match self {
            Self::MeanSd => {
                let mean = number(config, "mean")?;
                let sd = number(config, "sd")?;
                Ok(mean + sd * standard_normal(rng))
            }
            Self::WidthHeight => {
                let width = number(config, "width")?;
                let height = number(config, "height")?;
                Ok((0.1 + width * step as f64 / 100.0).recip() + height * 0.1)
            }
        }
    }
}

fn number(config: &TrialConfig, key: &str) -> Result<f64, TrialError> {
    config
        .get(key)
        .and_then(Value::as_f64)
        .ok_or_else(|| TrialError::failed(format!("config has no numeric '{key}'")))
}

// Box-Muller
fn standard_normal(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.r#gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

fn trial_rng(trial_id: &str) -> StdRng {
    let seed = trial_id
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325_u64, |h, b| (h ^ b as u64).wrapping_mul(0x100_0000_01b3));
    StdRng::seed_from_u64(seed)
}

/// How the demo attaches to a tracking service.
pub enum DemoTracking {
    None,
    /// Forward results through a logger callback.
    Callback {
        client: Arc<dyn TrackingClient>,
        settings: TrackerSettings,
    },
    /// Scope a run to each trial; `settings` is injected into every trial
    /// config under `key` and handed to `factory`.
    Scoped {
        factory: Arc<dyn TrackingClientFactory>,
        key: String,
        settings: Value,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct DemoOptions {
    pub objective: Objective,
    pub iterations: u64,
}

impl Default for DemoOptions {
    fn default() -> Self {
        Self {
            objective: Objective::default(),
            iterations: DEFAULT_ITERATIONS,
        }
    }
}

async fn train(options: DemoOptions, mut session: TrialSession) -> Result<(), TrialError> {
    let mut rng = trial_rng(session.trial_id());
    for step in 1..=options.iterations {
        let loss = options.objective.loss(session.config(), step, &mut rng)?;
        session.report(Metrics::from([("loss".to_string(), loss)])).await?;
    }
    Ok(())
}

async fn train_scoped(options: DemoOptions, tracked: TrackedSession) -> Result<(), TrialError> {
    let TrackedSession { mut session, run } = tracked;
    let mut rng = trial_rng(session.trial_id());
    for step in 1..=options.iterations {
        let loss = options.objective.loss(session.config(), step, &mut rng)?;
        let metrics = Metrics::from([("loss".to_string(), loss)]);
        session.report(metrics.clone()).await?;
        run.log(&metrics).await?;
    }
    Ok(())
}

/// Build the tuner for the demo sweep.
pub fn demo_tuner(options: DemoOptions, tracking: DemoTracking, config: TuneConfig) -> Tuner {
    let space = options.objective.search_space();
    match tracking {
        DemoTracking::None => Tuner::new(
            move |session: TrialSession| train(options, session),
            space,
            config,
        ),
        DemoTracking::Callback { client, settings } => Tuner::new(
            move |session: TrialSession| train(options, session),
            space,
            config,
        )
        .with_callback(Arc::new(TrackingLoggerCallback::new(client, settings))),
        DemoTracking::Scoped {
            factory,
            key,
            settings,
        } => {
            let trainable = tracked(factory, &key, move |session: TrackedSession| {
                train_scoped(options, session)
            });
            Tuner::new(trainable, space, config).with_constant(key, settings)
        }
    }
}

/// Run the demo sweep and return its analysis.
pub async fn run_demo(
    options: DemoOptions,
    tracking: DemoTracking,
    config: TuneConfig,
) -> Result<ExperimentAnalysis, TuneError> {
    info!(objective = ?options.objective, iterations = options.iterations, "Running demo sweep");
    demo_tuner(options, tracking, config).run().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(objective: Objective) -> TrialConfig {
        let value = match objective {
            Objective::MeanSd => serde_json::json!({"mean": 3, "sd": 0.5}),
            Objective::WidthHeight => serde_json::json!({"width": 50, "height": 20}),
        };
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_width_height_loss() {
        let mut rng = trial_rng("t");
        let loss = Objective::WidthHeight
            .loss(&config(Objective::WidthHeight), 2, &mut rng)
            .unwrap();
        assert!((loss - (1.0 / 1.1 + 2.0)).abs() < 1e-9);
    }

    #[test]
    fn test_mean_sd_loss_deterministic_per_trial() {
        let cfg = config(Objective::MeanSd);
        let a = Objective::MeanSd.loss(&cfg, 1, &mut trial_rng("exp_00001")).unwrap();
        let b = Objective::MeanSd.loss(&cfg, 1, &mut trial_rng("exp_00001")).unwrap();
        assert_eq!(a, b);
        assert!(a.is_finite());
    }

    #[test]
    fn test_missing_key_fails_trial() {
        let err = Objective::MeanSd
            .loss(&TrialConfig::new(), 1, &mut trial_rng("t"))
            .unwrap_err();
        assert!(err.to_string().contains("mean"));
    }

    #[tokio::test]
    async fn test_untracked_demo_returns_declared_keys() {
        let tune = TuneConfig {
            seed: Some(7),
            ..Default::default()
        };
        let analysis = run_demo(DemoOptions::default(), DemoTracking::None, tune)
            .await
            .unwrap();
        assert_eq!(analysis.trials.len(), 5);
        let best = analysis.best_config().unwrap();
        assert_eq!(best.keys().collect::<Vec<_>>(), vec!["mean", "sd"]);
    }
}
