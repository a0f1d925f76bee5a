//! Recovery of batches left behind by an unclean exit.
//!
//! A batch is a recovery candidate when it is `running` or `interrupted` and
//! nothing has checkpointed it for `stale_after`. Recovery reloads the
//! payloads of items that still need work and hands them back to the
//! executor; succeeded items are never run again.
//!
//! # Single flight
//!
//! ```text
//! caller A ──► initialize_recovery ──► spawn task ──► Shared<result>
//! caller B ──► initialize_recovery ──────────────────► same Shared
//! caller C (after, within window) ──► previous result, no work
//! ```
//!
//! The work runs in its own task. A caller that stops waiting (see
//! [`RecoveryManager::initialize_with_timeout`]) does not cancel it; the
//! status snapshot is updated when it finishes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::config::RecoveryConfig;
use crate::error::{JobError, RecoveryError, StoreError};
use crate::executor::{Backoff, BatchExecutor, BatchHooks, BatchOptions, BatchReport, ItemOperation};
use crate::model::{Batch, BatchStatus, RecoveryCandidate};

// ============================================================================
// Options & Status
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryOptions {
    /// Report the previous result instead of running again inside the
    /// recent-attempt window.
    pub skip_if_recent_attempt: bool,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self::from(&RecoveryConfig::default())
    }
}

impl From<&RecoveryConfig> for RecoveryOptions {
    fn from(config: &RecoveryConfig) -> Self {
        Self {
            skip_if_recent_attempt: true,
            max_retries: config.max_retries,
            retry_delay: config.retry_delay,
        }
    }
}

/// Read-only diagnostics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryStatus {
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_result: Option<bool>,
    pub candidates_found: usize,
    pub in_progress: bool,
    pub last_error: Option<String>,
}

// ============================================================================
// Resumers
// ============================================================================

/// Resumes one stale batch of a given job type.
#[async_trait]
pub trait BatchResumer: Send + Sync {
    async fn resume(
        &self,
        candidate: RecoveryCandidate,
        options: &RecoveryOptions,
    ) -> Result<BatchReport, JobError>;
}

/// Reloads item payloads by id. Ids that no longer resolve are simply
/// omitted from the result.
#[async_trait]
pub trait ItemSource<T>: Send + Sync {
    async fn load_items(&self, batch: &Batch, item_ids: &[String]) -> anyhow::Result<Vec<T>>;
}

/// Resumer that reloads payloads from an [`ItemSource`] and continues the
/// batch on a [`BatchExecutor`].
pub struct ExecutorResumer<T, R> {
    executor: BatchExecutor,
    source: Arc<dyn ItemSource<T>>,
    operation: Arc<dyn ItemOperation<T, R>>,
    hooks: BatchHooks<T, R>,
    options: BatchOptions,
}

impl<T, R> ExecutorResumer<T, R> {
    pub fn new(
        executor: BatchExecutor,
        source: Arc<dyn ItemSource<T>>,
        operation: Arc<dyn ItemOperation<T, R>>,
        hooks: BatchHooks<T, R>,
        options: BatchOptions,
    ) -> Self {
        Self {
            executor,
            source,
            operation,
            hooks,
            options,
        }
    }
}

#[async_trait]
impl<T, R> BatchResumer for ExecutorResumer<T, R>
where
    T: Send + Sync + 'static,
    R: Send + 'static,
{
    async fn resume(
        &self,
        candidate: RecoveryCandidate,
        options: &RecoveryOptions,
    ) -> Result<BatchReport, JobError> {
        let batch_id = candidate.batch.batch_id;
        let remaining = candidate.remaining_item_ids();

        let items = if remaining.is_empty() {
            Vec::new()
        } else {
            self.source
                .load_items(&candidate.batch, &remaining)
                .await
                .map_err(|source| JobError::Reload { batch_id, source })?
        };

        let batch_options = BatchOptions {
            max_retries: options.max_retries,
            backoff: Backoff::Fixed(options.retry_delay),
            ..self.options.clone()
        };

        self.executor
            .resume(
                candidate.batch,
                candidate.outcomes,
                items,
                self.operation.clone(),
                batch_options,
                self.hooks.clone(),
            )
            .await
    }
}

// ============================================================================
// Manager
// ============================================================================

type SharedRun = Shared<BoxFuture<'static, bool>>;

#[derive(Default)]
struct RecoveryState {
    status: RecoveryStatus,
    running: Option<SharedRun>,
}

pub struct RecoveryManager {
    store: Arc<dyn CheckpointStore>,
    resumers: RwLock<HashMap<String, Arc<dyn BatchResumer>>>,
    stale_after: Duration,
    recent_attempt_window: Duration,
    state: Arc<Mutex<RecoveryState>>,
}

impl RecoveryManager {
    pub fn new(store: Arc<dyn CheckpointStore>, config: &RecoveryConfig) -> Self {
        Self {
            store,
            resumers: RwLock::new(HashMap::new()),
            stale_after: config.stale_after,
            recent_attempt_window: config.recent_attempt_window,
            state: Arc::new(Mutex::new(RecoveryState::default())),
        }
    }

    /// Register the resumer for batches of `job_type`, replacing any earlier one.
    pub fn register_resumer(&self, job_type: impl Into<String>, resumer: Arc<dyn BatchResumer>) {
        let mut resumers = match self.resumers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        resumers.insert(job_type.into(), resumer);
    }

    fn stale_before(&self) -> DateTime<Utc> {
        let now = Utc::now();
        chrono::Duration::from_std(self.stale_after)
            .ok()
            .and_then(|d| now.checked_sub_signed(d))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Cheap existence check for stale batches.
    pub async fn has_jobs_needing_recovery(&self) -> Result<bool, StoreError> {
        self.store.has_recovery_candidates(self.stale_before()).await
    }

    pub fn get_recovery_status(&self) -> RecoveryStatus {
        lock(&self.state).status.clone()
    }

    /// Resume every stale batch.
    ///
    /// Returns `true` when every recovered batch ended fully succeeded (or
    /// there was nothing to recover). Concurrent callers share one run.
    pub async fn initialize_recovery(&self, options: RecoveryOptions) -> bool {
        let run = {
            let mut state = lock(&self.state);

            if let Some(running) = &state.running {
                info!("recovery already in progress, joining");
                running.clone()
            } else if let Some(previous) = self.recent_result(&state.status, &options) {
                info!(result = previous, "recovery attempted recently, reporting previous result");
                return previous;
            } else {
                state.status.last_attempt_at = Some(Utc::now());
                state.status.in_progress = true;
                state.status.last_error = None;

                let task = tokio::spawn(run_recovery(
                    self.store.clone(),
                    self.resumer_snapshot(),
                    self.stale_before(),
                    options,
                    self.state.clone(),
                ));
                let shared_state = self.state.clone();
                let run = async move {
                    match task.await {
                        Ok(result) => result,
                        Err(e) => {
                            error!(error = %e, "recovery task ended abnormally");
                            let mut state = lock(&shared_state);
                            state.status.last_result = Some(false);
                            state.status.in_progress = false;
                            state.status.last_error = Some(e.to_string());
                            state.running = None;
                            false
                        }
                    }
                }
                .boxed()
                .shared();

                state.running = Some(run.clone());
                run
            }
        };

        run.await
    }

    /// Like [`initialize_recovery`](Self::initialize_recovery) but stop
    /// waiting after `timeout`. The recovery itself keeps running.
    pub async fn initialize_with_timeout(
        &self,
        options: RecoveryOptions,
        timeout: Duration,
    ) -> Result<bool, RecoveryError> {
        tokio::time::timeout(timeout, self.initialize_recovery(options))
            .await
            .map_err(|_| {
                warn!(timeout_ms = timeout.as_millis() as u64, "recovery still running, continuing without it");
                RecoveryError::Timeout(timeout)
            })
    }

    fn recent_result(&self, status: &RecoveryStatus, options: &RecoveryOptions) -> Option<bool> {
        if !options.skip_if_recent_attempt {
            return None;
        }
        let last_attempt = status.last_attempt_at?;
        let window = chrono::Duration::from_std(self.recent_attempt_window).ok()?;
        if Utc::now() - last_attempt < window {
            status.last_result
        } else {
            None
        }
    }

    fn resumer_snapshot(&self) -> HashMap<String, Arc<dyn BatchResumer>> {
        match self.resumers.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

fn lock(state: &Mutex<RecoveryState>) -> MutexGuard<'_, RecoveryState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("recovery state mutex was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

async fn run_recovery(
    store: Arc<dyn CheckpointStore>,
    resumers: HashMap<String, Arc<dyn BatchResumer>>,
    stale_before: DateTime<Utc>,
    options: RecoveryOptions,
    state: Arc<Mutex<RecoveryState>>,
) -> bool {
    let (result, candidates_found, last_error) =
        match recover_all(store.as_ref(), &resumers, stale_before, &options).await {
            Ok((all_succeeded, found, last_error)) => (all_succeeded, found, last_error),
            Err(e) => {
                error!(error = %e, "recovery scan failed");
                (false, 0, Some(e.to_string()))
            }
        };

    let mut state = lock(&state);
    state.status.last_result = Some(result);
    state.status.candidates_found = candidates_found;
    state.status.in_progress = false;
    state.status.last_error = last_error;
    state.running = None;
    result
}

async fn recover_all(
    store: &dyn CheckpointStore,
    resumers: &HashMap<String, Arc<dyn BatchResumer>>,
    stale_before: DateTime<Utc>,
    options: &RecoveryOptions,
) -> Result<(bool, usize, Option<String>), StoreError> {
    let candidates = store.find_recovery_candidates(stale_before).await?;
    let found = candidates.len();
    if found == 0 {
        info!("no batches need recovery");
        return Ok((true, 0, None));
    }

    info!(candidates = found, "recovering stale batches");

    let mut all_succeeded = true;
    let mut last_error = None;

    for batch in candidates {
        let batch_id = batch.batch_id;
        let outcomes = store.load_outcomes(batch_id).await?;
        let candidate = RecoveryCandidate { batch, outcomes };

        let Some(resumer) = resumers.get(&candidate.batch.job_type) else {
            let err = JobError::NoResumer {
                job_type: candidate.batch.job_type.clone(),
            };
            warn!(batch_id = %batch_id, error = %err, "cannot resume batch, marking interrupted");
            if candidate.batch.status != BatchStatus::Interrupted {
                store.set_status(batch_id, BatchStatus::Interrupted).await?;
            }
            all_succeeded = false;
            last_error = Some(err.to_string());
            continue;
        };

        info!(
            batch_id = %batch_id,
            job_type = %candidate.batch.job_type,
            remaining = candidate.remaining_item_ids().len(),
            succeeded = candidate.succeeded_count(),
            "resuming batch"
        );

        match resumer.resume(candidate, options).await {
            Ok(report) => {
                if !report.is_fully_succeeded() {
                    all_succeeded = false;
                }
            }
            Err(e) => {
                error!(batch_id = %batch_id, error = %e, "batch recovery failed");
                all_succeeded = false;
                last_error = Some(e.to_string());
            }
        }
    }

    Ok((all_succeeded, found, last_error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::model::ItemRef;

    /// Marks every batch it sees completed.
    struct CompletingResumer {
        store: Arc<InMemoryCheckpointStore>,
        calls: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl BatchResumer for CompletingResumer {
        async fn resume(
            &self,
            candidate: RecoveryCandidate,
            _options: &RecoveryOptions,
        ) -> Result<BatchReport, JobError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            let batch_id = candidate.batch.batch_id;
            self.store
                .set_status(batch_id, BatchStatus::Completed)
                .await
                .map_err(|e| JobError::Checkpoint { batch_id, source: e })?;
            Ok(BatchReport {
                batch_id,
                status: BatchStatus::Completed,
                total: candidate.outcomes.len(),
                succeeded: candidate.outcomes.len(),
                failed: 0,
                processed: 0,
                attempts: 0,
            })
        }
    }

    async fn stale_batch(store: &InMemoryCheckpointStore, job_type: &str) -> Batch {
        let batch = Batch::new(job_type, "user-1", vec![ItemRef::new("1", "repo-1")]);
        store
            .create_batch(&batch, &batch.initial_outcomes())
            .await
            .unwrap();
        store
            .set_last_checkpoint(batch.batch_id, Utc::now() - chrono::Duration::hours(1))
            .unwrap();
        batch
    }

    fn manager(store: Arc<InMemoryCheckpointStore>) -> RecoveryManager {
        RecoveryManager::new(store, &RecoveryConfig::default())
    }

    #[tokio::test]
    async fn test_nothing_to_recover_is_success() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let recovery = manager(store);

        assert!(!recovery.has_jobs_needing_recovery().await.unwrap());
        assert!(recovery.initialize_recovery(RecoveryOptions::default()).await);

        let status = recovery.get_recovery_status();
        assert_eq!(status.last_result, Some(true));
        assert_eq!(status.candidates_found, 0);
        assert!(!status.in_progress);
        assert!(status.last_attempt_at.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_run() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        stale_batch(&store, "sync").await;

        let resumer = Arc::new(CompletingResumer {
            store: store.clone(),
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(50),
        });
        let recovery = manager(store.clone());
        recovery.register_resumer("sync", resumer.clone());

        let (first, second) = tokio::join!(
            recovery.initialize_recovery(RecoveryOptions::default()),
            recovery.initialize_recovery(RecoveryOptions::default()),
        );

        assert!(first);
        assert_eq!(first, second);
        assert_eq!(resumer.calls.load(Ordering::SeqCst), 1);
        assert!(!recovery.has_jobs_needing_recovery().await.unwrap());
    }

    #[tokio::test]
    async fn test_recent_attempt_reports_previous_result() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        stale_batch(&store, "sync").await;
        let resumer = Arc::new(CompletingResumer {
            store: store.clone(),
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        });
        let recovery = manager(store.clone());
        recovery.register_resumer("sync", resumer.clone());

        assert!(recovery.initialize_recovery(RecoveryOptions::default()).await);

        // A new stale batch appears, but the window suppresses a second run.
        stale_batch(&store, "sync").await;
        assert!(recovery.initialize_recovery(RecoveryOptions::default()).await);
        assert_eq!(resumer.calls.load(Ordering::SeqCst), 1);

        let forced = RecoveryOptions {
            skip_if_recent_attempt: false,
            ..RecoveryOptions::default()
        };
        assert!(recovery.initialize_recovery(forced).await);
        assert_eq!(resumer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_job_type_is_marked_interrupted() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let batch = stale_batch(&store, "import").await;
        let recovery = manager(store.clone());

        assert!(!recovery.initialize_recovery(RecoveryOptions::default()).await);

        let stored = store.load_batch(batch.batch_id).await.unwrap().unwrap();
        assert_eq!(stored.status, BatchStatus::Interrupted);
        let status = recovery.get_recovery_status();
        assert_eq!(status.last_result, Some(false));
        assert!(status.last_error.unwrap().contains("import"));
    }

    #[tokio::test]
    async fn test_outer_timeout_does_not_cancel_recovery() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        stale_batch(&store, "sync").await;
        let resumer = Arc::new(CompletingResumer {
            store: store.clone(),
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(200),
        });
        let recovery = manager(store.clone());
        recovery.register_resumer("sync", resumer);

        let result = recovery
            .initialize_with_timeout(RecoveryOptions::default(), Duration::from_millis(10))
            .await;
        assert!(matches!(result, Err(RecoveryError::Timeout(_))));
        assert!(recovery.get_recovery_status().in_progress);

        // Joining the still-running attempt yields its result.
        assert!(recovery.initialize_recovery(RecoveryOptions::default()).await);
        assert_eq!(recovery.get_recovery_status().last_result, Some(true));
        assert!(!recovery.has_jobs_needing_recovery().await.unwrap());
    }
}
