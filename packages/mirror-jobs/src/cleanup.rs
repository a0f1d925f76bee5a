//! Recurring sweep of finished batches past the retention window.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{CheckpointStore, PurgeReport};
use crate::config::CleanupConfig;
use crate::error::StoreError;

struct RunningSweeper {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct CleanupService {
    store: Arc<dyn CheckpointStore>,
    config: CleanupConfig,
    sweeper: Mutex<Option<RunningSweeper>>,
}

impl CleanupService {
    pub fn new(store: Arc<dyn CheckpointStore>, config: CleanupConfig) -> Self {
        Self {
            store,
            config,
            sweeper: Mutex::new(None),
        }
    }

    /// Start the periodic sweep. Returns `false` if it is already running or
    /// the interval is zero.
    ///
    /// The first sweep runs immediately.
    pub fn start(&self) -> bool {
        if self.config.interval.is_zero() {
            error!("cleanup interval must be non-zero, sweeps disabled");
            return false;
        }

        let mut sweeper = self.lock();
        if sweeper.is_some() {
            debug!("cleanup service already running");
            return false;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(sweep_loop(
            self.store.clone(),
            self.config.clone(),
            cancel.clone(),
        ));
        *sweeper = Some(RunningSweeper { cancel, handle });

        info!(
            interval_secs = self.config.interval.as_secs(),
            retention_secs = self.config.retention.as_secs(),
            "cleanup service started"
        );
        true
    }

    /// Cancel the timer and wait for an in-flight sweep to finish.
    pub async fn stop(&self) {
        let running = self.lock().take();
        let Some(RunningSweeper { cancel, handle }) = running else {
            return;
        };

        cancel.cancel();
        if let Err(e) = handle.await {
            warn!(error = %e, "cleanup task ended abnormally");
        }
        info!("cleanup service stopped");
    }

    pub fn is_running(&self) -> bool {
        self.lock().is_some()
    }

    /// Run a single sweep now.
    pub async fn sweep_once(&self) -> Result<PurgeReport, StoreError> {
        sweep(self.store.as_ref(), self.config.retention).await
    }

    fn lock(&self) -> MutexGuard<'_, Option<RunningSweeper>> {
        match self.sweeper.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn retention_cutoff(retention: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(retention)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

async fn sweep(store: &dyn CheckpointStore, retention: Duration) -> Result<PurgeReport, StoreError> {
    let report = store.purge_terminal_before(retention_cutoff(retention)).await?;
    if report.batches_removed > 0 {
        info!(
            batches = report.batches_removed,
            outcomes = report.outcomes_removed,
            "removed expired batches"
        );
    } else {
        debug!("cleanup sweep found nothing to remove");
    }
    Ok(report)
}

async fn sweep_loop(store: Arc<dyn CheckpointStore>, config: CleanupConfig, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        // A sweep is never interrupted; stop() waits for it.
        if let Err(e) = sweep(store.as_ref(), config.retention).await {
            error!(error = %e, "cleanup sweep failed, retrying next interval");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::model::{Batch, BatchStatus, ItemRef};

    async fn finished_batch(store: &InMemoryCheckpointStore, finished_days_ago: i64) -> Batch {
        let batch = Batch::new("sync", "user-1", vec![ItemRef::new("1", "repo-1")]);
        store
            .create_batch(&batch, &batch.initial_outcomes())
            .await
            .unwrap();
        store
            .set_status(batch.batch_id, BatchStatus::Completed)
            .await
            .unwrap();
        store
            .set_last_checkpoint(
                batch.batch_id,
                Utc::now() - chrono::Duration::days(finished_days_ago),
            )
            .unwrap();
        batch
    }

    fn config(interval: Duration) -> CleanupConfig {
        CleanupConfig {
            interval,
            retention: Duration::from_secs(7 * 24 * 3600),
        }
    }

    #[tokio::test]
    async fn test_sweep_respects_retention() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let old = finished_batch(&store, 10).await;
        let young = finished_batch(&store, 1).await;

        let service = CleanupService::new(store.clone(), config(Duration::from_secs(3600)));
        let report = service.sweep_once().await.unwrap();

        assert_eq!(report.batches_removed, 1);
        assert!(store.load_batch(old.batch_id).await.unwrap().is_none());
        assert!(store.load_batch(young.batch_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_waits() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let service = CleanupService::new(store, config(Duration::from_secs(3600)));

        assert!(service.start());
        assert!(!service.start());
        assert!(service.is_running());

        service.stop().await;
        assert!(!service.is_running());

        // Stopping twice is harmless.
        service.stop().await;
    }

    #[tokio::test]
    async fn test_zero_interval_is_not_started() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let service = CleanupService::new(store, config(Duration::ZERO));

        assert!(!service.start());
        assert!(!service.is_running());
    }

    #[tokio::test]
    async fn test_failed_sweep_does_not_stop_schedule() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let old = finished_batch(&store, 10).await;
        store.set_unavailable(true);

        let service = CleanupService::new(store.clone(), config(Duration::from_millis(20)));
        service.start();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.load_batch(old.batch_id).await.unwrap().is_some());

        store.set_unavailable(false);
        tokio::time::sleep(Duration::from_millis(100)).await;
        service.stop().await;

        assert!(store.load_batch(old.batch_id).await.unwrap().is_none());
    }
}
