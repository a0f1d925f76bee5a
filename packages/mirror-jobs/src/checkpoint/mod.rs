//! Durable record of batches and per-item outcomes.
//!
//! The store is the only mutable state shared between the lanes of a batch,
//! between concurrent batches, and between this process and the next one.
//!
//! # Implementer Notes
//!
//! - `record_outcomes` must reject any write that is not a legal successor of
//!   the stored record (see [`ItemOutcome::follows`]). This is what keeps two
//!   attempts of one item from both believing they are current.
//! - `set_status` must refuse to move a terminal batch anywhere else.
//! - Every accepted outcome write and every heartbeat of a running batch
//!   advances `last_checkpoint_at`; recovery uses it to tell live batches
//!   from abandoned ones.
//! - `mark_interrupted` moves the stamp to [`ABANDONED_AT`] so the next
//!   recovery scan picks the batch up without waiting out the stale window.
//! - `create_batch` must refuse two outcomes with the same item id.

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::model::{Batch, BatchId, BatchStatus, ItemOutcome};

/// Checkpoint stamp given to batches abandoned at shutdown.
pub const ABANDONED_AT: DateTime<Utc> = DateTime::<Utc>::UNIX_EPOCH;

/// Item ids within one batch are its outcome keys and must be unique.
pub(crate) fn ensure_unique_items(
    batch_id: BatchId,
    outcomes: &[ItemOutcome],
) -> Result<(), StoreError> {
    let mut seen = HashSet::with_capacity(outcomes.len());
    for outcome in outcomes {
        if !seen.insert(outcome.item_id.as_str()) {
            return Err(StoreError::DuplicateItem {
                batch_id,
                item_id: outcome.item_id.clone(),
            });
        }
    }
    Ok(())
}

pub use memory::InMemoryCheckpointStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresCheckpointStore;

/// What a cleanup sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub batches_removed: u64,
    pub outcomes_removed: u64,
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a new batch together with its initial (pending) outcomes.
    async fn create_batch(&self, batch: &Batch, outcomes: &[ItemOutcome]) -> Result<(), StoreError>;

    async fn load_batch(&self, batch_id: BatchId) -> Result<Option<Batch>, StoreError>;

    /// Outcomes of a batch in submission order.
    async fn load_outcomes(&self, batch_id: BatchId) -> Result<Vec<ItemOutcome>, StoreError>;

    /// Write outcome updates and advance the batch checkpoint.
    ///
    /// All updates are validated before any is applied.
    async fn record_outcomes(
        &self,
        batch_id: BatchId,
        outcomes: &[ItemOutcome],
    ) -> Result<(), StoreError>;

    /// Advance `last_checkpoint_at` of a running batch without changing any
    /// outcome. Other statuses are left alone.
    async fn heartbeat(&self, batch_id: BatchId) -> Result<(), StoreError>;

    /// Move a batch to a new status. Terminal statuses also stamp
    /// `last_checkpoint_at`, which the retention window is measured from.
    async fn set_status(&self, batch_id: BatchId, status: BatchStatus) -> Result<(), StoreError>;

    /// Move a batch nobody is working on any more to interrupted and stamp it
    /// [`ABANDONED_AT`], making it a recovery candidate immediately.
    async fn mark_interrupted(&self, batch_id: BatchId) -> Result<(), StoreError>;

    /// Cheap existence check for recovery candidates.
    async fn has_recovery_candidates(&self, stale_before: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Every running or interrupted batch not checkpointed since `stale_before`.
    async fn find_recovery_candidates(
        &self,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<Batch>, StoreError>;

    /// Remove terminal batches (and their outcomes) finished before `cutoff`.
    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<PurgeReport, StoreError>;

    /// Release backend resources. Called last during shutdown.
    async fn close(&self) {}
}
