//! Subcommand handlers.

use crate::{Commands, ConfigAction, ModeArg, ObjectiveArg, RunArgs, TrackerArg};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use tracktune_core::config::{
    TrackingSection, TracktuneConfig, init_workspace_config, load_config, workspace_config_path,
};
use tracktune_core::credentials::{CredentialStore, KeyringCredentialStore};
use tracktune_core::demo::{DemoOptions, DemoTracking, Objective, demo_tuner};
use tracktune_core::tracking::TrackerSettings;
use tracktune_core::tune::ExperimentAnalysis;
use tracktune_trackers::{DefaultClientFactory, TrackerKind, build_client};

pub async fn handle_command(command: Commands, workspace: &Path) -> anyhow::Result<()> {
    match command {
        Commands::Run(args) => handle_run(args, workspace).await,
        Commands::Config { action } => handle_config(action, workspace).await,
    }
}

async fn handle_config(action: ConfigAction, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            match init_workspace_config(workspace)? {
                Some(path) => println!("Created default configuration at: {}", path.display()),
                None => println!(
                    "Configuration file already exists at: {}",
                    workspace_config_path(workspace).display()
                ),
            }
            Ok(())
        }
        ConfigAction::Show => {
            let mut config = load_config(Some(workspace), None)?;
            redact_secrets(&mut config.tracking);
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}

fn redact_secrets(section: &mut TrackingSection) {
    let mask = |secret: &mut Option<String>| {
        if secret.is_some() {
            *secret = Some("***".to_string());
        }
    };
    if let Some(wandb) = section.wandb.as_mut() {
        mask(&mut wandb.api_key);
    }
    if let Some(mlflow) = section.mlflow.as_mut() {
        mask(&mut mlflow.token);
    }
    if let Some(comet) = section.comet.as_mut() {
        mask(&mut comet.api_key);
    }
}

fn tracker_kind(arg: TrackerArg) -> Option<TrackerKind> {
    match arg {
        TrackerArg::Wandb => Some(TrackerKind::Wandb),
        TrackerArg::Mlflow => Some(TrackerKind::Mlflow),
        TrackerArg::Comet => Some(TrackerKind::Comet),
        TrackerArg::None => None,
    }
}

fn apply_overrides(config: &mut TracktuneConfig, args: &RunArgs) {
    if let Some(n) = args.num_samples {
        config.tune.num_samples = n;
    }
    if let Some(n) = args.max_concurrent {
        config.tune.max_concurrent_trials = n;
    }
    if let Some(seed) = args.seed {
        config.tune.seed = Some(seed);
    }
    if let Some(name) = &args.experiment {
        config.tune.experiment_name = name.clone();
    }
}

/// Resolve how the sweep attaches to the chosen tracker.
///
/// Credentials are checked here, before any trial starts.
fn demo_tracking(
    args: &RunArgs,
    config: &TracktuneConfig,
    store: Arc<dyn CredentialStore>,
) -> anyhow::Result<DemoTracking> {
    let Some(kind) = tracker_kind(args.tracker) else {
        return Ok(DemoTracking::None);
    };
    let settings = kind.settings_from(&config.tracking)?;
    let client = build_client(kind, &settings, Some(store.as_ref()))?;

    Ok(match args.mode {
        ModeArg::Callback => DemoTracking::Callback {
            client,
            settings: TrackerSettings::new(),
        },
        ModeArg::Scoped => DemoTracking::Scoped {
            factory: Arc::new(DefaultClientFactory::new().with_store(store)),
            key: kind.key().to_string(),
            settings,
        },
    })
}

async fn handle_run(args: RunArgs, workspace: &Path) -> anyhow::Result<()> {
    let mut config = load_config(Some(workspace), None)?;
    apply_overrides(&mut config, &args);

    let tracking = demo_tracking(&args, &config, Arc::new(KeyringCredentialStore::new()))?;
    let options = DemoOptions {
        objective: match args.objective {
            ObjectiveArg::MeanSd => Objective::MeanSd,
            ObjectiveArg::WidthHeight => Objective::WidthHeight,
        },
        iterations: args.iterations,
    };
    info!(
        tracker = ?args.tracker,
        mode = ?args.mode,
        experiment = %config.tune.experiment_name,
        "Starting sweep"
    );

    let tuner = demo_tuner(options, tracking, config.tune.clone());
    let cancel = tuner.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling running trials");
            cancel.cancel();
        }
    });

    let analysis = tuner.run().await?;
    print_summary(&analysis)
}

fn print_summary(analysis: &ExperimentAnalysis) -> anyhow::Result<()> {
    println!(
        "{:<28} {:<11} {:>6} {:>12}",
        "trial", "status", "iters", analysis.metric
    );
    for row in analysis.rows() {
        let value = row
            .metrics
            .get(&analysis.metric)
            .map(|v| format!("{v:.4}"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<28} {:<11} {:>6} {:>12}",
            row.trial_id,
            row.status.to_string(),
            row.iterations,
            value
        );
    }

    match analysis.best_config() {
        Some(best) => {
            println!(
                "\nBest config ({} {}):",
                analysis.mode, analysis.metric
            );
            println!("{}", serde_json::to_string_pretty(&best)?);
        }
        None => println!("\nNo trial reported '{}'.", analysis.metric),
    }
    Ok(())
}
