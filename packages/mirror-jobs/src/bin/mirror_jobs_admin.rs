//! Operator CLI for the mirror job tables.
//!
//! Inspects stale batches, releases them for recovery and runs the retention
//! sweep by hand. Every command prints one JSON object on stdout.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use mirror_jobs::config::{days, CleanupConfig};
use mirror_jobs::{
    BatchStatus, CheckpointStore, CleanupService, ItemState, MirrorJobsConfig,
    PostgresCheckpointStore,
};

#[derive(Parser)]
#[command(name = "mirror-jobs-admin")]
#[command(about = "Inspect and maintain mirror job batches")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Report whether any batch needs recovery and list the candidates
    Status,

    /// Show one batch and its item outcomes
    Batch { batch_id: Uuid },

    /// Release batches so the next service start resumes them
    Interrupt {
        /// Release this batch even if it checkpointed recently (its process must be gone)
        batch_id: Option<Uuid>,
    },

    /// Remove finished batches past the retention window
    Cleanup {
        /// Override CLEANUP_RETENTION_DAYS
        #[arg(long)]
        retention_days: Option<u64>,
    },
}

// ============================================================================
// JSON Response Types
// ============================================================================

#[derive(Serialize)]
struct Response {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    recovery_needed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    candidates: Option<Vec<CandidateInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    batch: Option<BatchDetail>,
    #[serde(skip_serializing_if = "Option::is_none")]
    interrupted: Option<Vec<Uuid>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    purged: Option<PurgeInfo>,
}

impl Response {
    fn ok() -> Self {
        Self {
            success: true,
            message: None,
            recovery_needed: None,
            candidates: None,
            batch: None,
            interrupted: None,
            purged: None,
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            ..Self::ok()
        }
    }
}

#[derive(Serialize)]
struct CandidateInfo {
    batch_id: Uuid,
    job_type: String,
    owner_id: String,
    status: String,
    last_checkpoint_at: DateTime<Utc>,
    total_items: usize,
    remaining_items: usize,
}

#[derive(Serialize)]
struct BatchDetail {
    batch_id: Uuid,
    job_type: String,
    owner_id: String,
    status: String,
    created_at: DateTime<Utc>,
    last_checkpoint_at: DateTime<Utc>,
    items: Vec<ItemInfo>,
}

#[derive(Serialize)]
struct ItemInfo {
    item_id: String,
    item_name: String,
    state: ItemState,
    attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
}

#[derive(Serialize)]
struct PurgeInfo {
    batches_removed: u64,
    outcomes_removed: u64,
}

fn output(resp: Response) -> Result<()> {
    println!("{}", serde_json::to_string(&resp)?);
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout stays machine-readable
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,mirror_jobs=debug,sqlx=warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = MirrorJobsConfig::from_env()?;
    let store = connect(&config).await?;

    let result = match cli.command {
        Commands::Status => cmd_status(store.clone(), &config).await,
        Commands::Batch { batch_id } => cmd_batch(store.clone(), batch_id).await,
        Commands::Interrupt { batch_id } => cmd_interrupt(store.clone(), &config, batch_id).await,
        Commands::Cleanup { retention_days } => {
            cmd_cleanup(store.clone(), &config, retention_days).await
        }
    };

    store.close().await;
    result
}

async fn connect(config: &MirrorJobsConfig) -> Result<Arc<dyn CheckpointStore>> {
    let database_url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set")?;
    let store = PostgresCheckpointStore::connect(database_url)
        .await
        .context("Failed to connect to database")?;
    Ok(Arc::new(store))
}

fn stale_before(stale_after: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(stale_after)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

// ============================================================================
// Commands
// ============================================================================

async fn cmd_status(store: Arc<dyn CheckpointStore>, config: &MirrorJobsConfig) -> Result<()> {
    let batches = store
        .find_recovery_candidates(stale_before(config.recovery.stale_after))
        .await?;

    let mut candidates = Vec::with_capacity(batches.len());
    for batch in batches {
        let outcomes = store.load_outcomes(batch.batch_id).await?;
        candidates.push(CandidateInfo {
            batch_id: batch.batch_id,
            job_type: batch.job_type,
            owner_id: batch.owner_id,
            status: batch.status.to_string(),
            last_checkpoint_at: batch.last_checkpoint_at,
            total_items: outcomes.len(),
            remaining_items: outcomes.iter().filter(|o| o.state.needs_work()).count(),
        });
    }

    output(Response {
        recovery_needed: Some(!candidates.is_empty()),
        candidates: Some(candidates),
        ..Response::ok()
    })
}

async fn cmd_batch(store: Arc<dyn CheckpointStore>, batch_id: Uuid) -> Result<()> {
    let Some(batch) = store.load_batch(batch_id).await? else {
        return output(Response::failed(format!("Batch '{}' not found", batch_id)));
    };
    let outcomes = store.load_outcomes(batch_id).await?;

    output(Response {
        batch: Some(BatchDetail {
            batch_id: batch.batch_id,
            job_type: batch.job_type,
            owner_id: batch.owner_id,
            status: batch.status.to_string(),
            created_at: batch.created_at,
            last_checkpoint_at: batch.last_checkpoint_at,
            items: outcomes
                .into_iter()
                .map(|o| ItemInfo {
                    item_id: o.item_id,
                    item_name: o.item_name,
                    state: o.state,
                    attempt: o.attempt,
                    last_error: o.last_error,
                })
                .collect(),
        }),
        ..Response::ok()
    })
}

/// Without an id every stale running batch is released. Batches already
/// interrupted are left as they are.
async fn cmd_interrupt(
    store: Arc<dyn CheckpointStore>,
    config: &MirrorJobsConfig,
    batch_id: Option<Uuid>,
) -> Result<()> {
    let targets = match batch_id {
        Some(batch_id) => {
            let Some(batch) = store.load_batch(batch_id).await? else {
                return output(Response::failed(format!("Batch '{}' not found", batch_id)));
            };
            if batch.status.is_terminal() {
                return output(Response::failed(format!(
                    "Batch '{}' already finished ({})",
                    batch_id, batch.status
                )));
            }
            vec![batch_id]
        }
        None => store
            .find_recovery_candidates(stale_before(config.recovery.stale_after))
            .await?
            .into_iter()
            .filter(|batch| batch.status == BatchStatus::Running)
            .map(|batch| batch.batch_id)
            .collect(),
    };

    let mut interrupted = Vec::with_capacity(targets.len());
    for batch_id in targets {
        match store.mark_interrupted(batch_id).await {
            Ok(()) => interrupted.push(batch_id),
            // Finished since it was listed.
            Err(e) if e.is_conflict() => {}
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to interrupt batch {}", batch_id))
            }
        }
    }

    let recovery_needed = store
        .has_recovery_candidates(stale_before(config.recovery.stale_after))
        .await?;

    output(Response {
        recovery_needed: Some(recovery_needed),
        message: interrupted
            .is_empty()
            .then(|| "No batches released".to_string()),
        interrupted: Some(interrupted),
        ..Response::ok()
    })
}

async fn cmd_cleanup(
    store: Arc<dyn CheckpointStore>,
    config: &MirrorJobsConfig,
    retention_days: Option<u64>,
) -> Result<()> {
    let retention = match retention_days {
        Some(n) => days(n).context("--retention-days is too large")?,
        None => config.cleanup.retention,
    };
    let cleanup = CleanupService::new(
        store,
        CleanupConfig {
            retention,
            ..config.cleanup.clone()
        },
    );

    let report = cleanup.sweep_once().await?;
    output(Response {
        purged: Some(PurgeInfo {
            batches_removed: report.batches_removed,
            outcomes_removed: report.outcomes_removed,
        }),
        ..Response::ok()
    })
}
