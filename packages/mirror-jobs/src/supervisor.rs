//! Process-wide owner of detached batch tasks.
//!
//! Request handlers never spawn batches directly. They hand them to the
//! supervisor, which is what shutdown waits on:
//!
//! ```text
//! start_sync ──► spawn_batch ──► TaskTracker ──► BatchExecutor::run
//!                     │
//!                     └─► live set (batch_id, job_type, abort handle)
//!
//! shutdown ──► drain(deadline)
//!                 ├─► close tracker (no new batches)
//!                 ├─► wait for live batches up to the deadline
//!                 └─► abandon the rest: abort + mark interrupted (stale at once)
//! ```

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::error::JobError;
use crate::executor::{panic_message, BatchReport};
use crate::model::BatchId;

struct LiveBatch {
    job_type: String,
    abort: Option<AbortHandle>,
}

/// Result of draining the supervisor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Every batch finished before the deadline.
    pub completed: bool,
    /// Batches still running at the deadline, now marked interrupted.
    pub abandoned: Vec<BatchId>,
}

#[derive(Clone)]
pub struct JobSupervisor {
    store: Arc<dyn CheckpointStore>,
    tracker: TaskTracker,
    live: Arc<DashMap<BatchId, LiveBatch>>,
}

impl JobSupervisor {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            store,
            tracker: TaskTracker::new(),
            live: Arc::new(DashMap::new()),
        }
    }

    /// Run a batch future in the background.
    ///
    /// Errors from the batch are logged here; callers observe the batch only
    /// through its stored status.
    pub fn spawn_batch<F>(
        &self,
        batch_id: BatchId,
        job_type: &str,
        batch: F,
    ) -> Result<JoinHandle<Result<BatchReport, JobError>>, JobError>
    where
        F: Future<Output = Result<BatchReport, JobError>> + Send + 'static,
    {
        if self.tracker.is_closed() {
            return Err(JobError::ShuttingDown);
        }

        self.live.insert(
            batch_id,
            LiveBatch {
                job_type: job_type.to_string(),
                abort: None,
            },
        );

        let live = self.live.clone();
        let handle = self.tracker.spawn(async move {
            let result = match AssertUnwindSafe(batch).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(JobError::TaskFailed {
                    batch_id,
                    reason: panic_message(panic.as_ref()),
                }),
            };
            live.remove(&batch_id);

            match &result {
                Ok(report) => info!(
                    batch_id = %batch_id,
                    status = %report.status,
                    "supervised batch finished"
                ),
                Err(e) => error!(batch_id = %batch_id, error = %e, "supervised batch failed"),
            }
            result
        });

        // The task may already have finished and removed itself.
        if let Some(mut entry) = self.live.get_mut(&batch_id) {
            entry.abort = Some(handle.abort_handle());
        }

        Ok(handle)
    }

    pub fn active_batches(&self) -> Vec<BatchId> {
        self.live.iter().map(|entry| *entry.key()).collect()
    }

    pub fn active_count(&self) -> usize {
        self.live.len()
    }

    pub fn is_draining(&self) -> bool {
        self.tracker.is_closed()
    }

    /// Stop accepting batches and wait for live ones up to `deadline`.
    pub async fn drain(&self, deadline: Duration) -> DrainReport {
        self.tracker.close();

        let active = self.active_count();
        if active > 0 {
            info!(active, deadline_ms = deadline.as_millis() as u64, "waiting for batches to finish");
        }

        if tokio::time::timeout(deadline, self.tracker.wait()).await.is_ok() {
            return DrainReport {
                completed: true,
                abandoned: Vec::new(),
            };
        }

        let abandoned: Vec<(BatchId, String)> = self
            .live
            .iter()
            .map(|entry| {
                if let Some(abort) = &entry.abort {
                    abort.abort();
                }
                (*entry.key(), entry.job_type.clone())
            })
            .collect();

        for (batch_id, job_type) in &abandoned {
            self.live.remove(batch_id);
            warn!(
                batch_id = %batch_id,
                job_type = %job_type,
                "abandoning batch at shutdown, left for recovery"
            );
            match self.store.mark_interrupted(*batch_id).await {
                Ok(()) => {}
                // Finished between the deadline and the abort.
                Err(e) if e.is_conflict() => {}
                Err(e) => {
                    error!(batch_id = %batch_id, error = %e, "failed to mark batch interrupted")
                }
            }
        }

        DrainReport {
            completed: false,
            abandoned: abandoned.into_iter().map(|(id, _)| id).collect(),
        }
    }
}
