//! Bid Optimizer: analyzes exported target snapshots and performance history,
//! prints ranked bid suggestions and optionally dry-runs them through the
//! execution controller.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bidopt_automation::{ExecutionController, ExecutionDecision};
use bidopt_core::config::{AppConfig, AutomationMode};
use bidopt_core::notify::log_notifier;
use bidopt_core::ports::{InMemorySampleStore, RecordingAdPlatform, TargetKey};
use bidopt_core::types::{PerformanceSample, TargetSnapshot, TargetType};
use bidopt_engine::OptimizationEngine;
use clap::Parser;
use serde::Deserialize;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "bid-optimizer")]
#[command(about = "Profit-driven bid suggestions for search-ad accounts")]
#[command(version)]
struct Cli {
    /// JSON file with `targets` and optional `history`
    #[arg(long, short)]
    input: PathBuf,

    /// Node identifier (overrides config)
    #[arg(long, env = "BID_OPTIMIZER__NODE_ID")]
    node_id: Option<String>,

    /// Minimum market-curve confidence before its optimum is trusted
    #[arg(long, env = "BID_OPTIMIZER__ALGORITHMS__CURVE__MIN_MODEL_CONFIDENCE")]
    min_model_confidence: Option<f64>,

    /// Train conversion trees per account before analysis
    #[arg(long, default_value_t = false)]
    train: bool,

    /// Run actionable suggestions through the execution controller against a
    /// recording platform
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Treat every suggestion as operator-approved during the dry run
    #[arg(long, default_value_t = false)]
    approval_mode: bool,
}

#[derive(Debug, Deserialize)]
struct TargetHistory {
    account_id: String,
    target_type: TargetType,
    target_id: String,
    samples: Vec<PerformanceSample>,
}

#[derive(Debug, Deserialize)]
struct InputFile {
    targets: Vec<TargetSnapshot>,
    #[serde(default)]
    history: Vec<TargetHistory>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bid_optimizer=info,bidopt_engine=info,bidopt_automation=info".into()),
        )
        .json()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(min) = cli.min_model_confidence {
        config.algorithms.curve.min_model_confidence = min;
    }
    if cli.approval_mode {
        config.automation.config.mode = AutomationMode::Approval;
    }

    info!(
        node_id = %config.node_id,
        input = %cli.input.display(),
        "Bid optimizer starting"
    );

    let raw = tokio::fs::read_to_string(&cli.input)
        .await
        .with_context(|| format!("reading {}", cli.input.display()))?;
    let input: InputFile = serde_json::from_str(&raw).context("parsing input file")?;

    let store = Arc::new(InMemorySampleStore::new());
    for h in input.history {
        store.insert(TargetKey::new(h.account_id, h.target_type, h.target_id), h.samples);
    }

    let engine = OptimizationEngine::new(config.algorithms.clone(), store);

    if cli.train {
        let accounts: BTreeSet<&str> = input.targets.iter().map(|t| t.account_id.as_str()).collect();
        for account in accounts {
            match engine.train_account_models(account, &input.targets) {
                Ok(report) => info!(
                    account_id = account,
                    cr_version = report.cr_version,
                    cv_version = report.cv_version,
                    samples = report.training_samples,
                    "Models trained"
                ),
                Err(e) => warn!(account_id = account, error = %e, "Model training skipped"),
            }
        }
    }

    let suggestions = engine.analyze_targets(&input.targets);
    println!("{}", serde_json::to_string_pretty(&suggestions)?);

    if cli.dry_run {
        let platform = Arc::new(RecordingAdPlatform::new());
        let controller = ExecutionController::new(
            config.automation.clone(),
            platform.clone(),
            log_notifier(),
        );

        let accounts: BTreeSet<&str> = suggestions.iter().map(|s| s.account_id.as_str()).collect();
        for account in accounts {
            let decisions: Vec<ExecutionDecision> = suggestions
                .iter()
                .filter(|s| s.account_id == account)
                .filter_map(ExecutionDecision::from_suggestion)
                .collect();
            let batch = controller.execute_batch(account, &decisions);
            let summary = controller.daily_summary(account, chrono::Utc::now().date_naive());
            println!("{}", serde_json::to_string_pretty(&summary)?);
            info!(
                account_id = account,
                batch_id = %batch.id,
                applied = platform.applied().len(),
                "Dry run complete"
            );
        }
    }

    Ok(())
}
