//! In-process checkpoint store.
//!
//! Not durable across restarts. Used by tests and by single-process
//! deployments that run without a database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{ensure_unique_items, CheckpointStore, PurgeReport, ABANDONED_AT};
use crate::error::StoreError;
use crate::model::{Batch, BatchId, BatchStatus, ItemOutcome};

struct StoredBatch {
    batch: Batch,
    outcomes: Vec<ItemOutcome>,
    positions: HashMap<String, usize>,
}

/// In-memory store backed by a HashMap.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    batches: Mutex<HashMap<BatchId, StoredBatch>>,
    fail_writes: AtomicBool,
    outcome_writes: AtomicUsize,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<BatchId, StoredBatch>>, StoreError> {
        self.batches
            .lock()
            .map_err(|e| StoreError::Backend(anyhow::anyhow!("mutex poisoned: {}", e)))
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend(anyhow::anyhow!(
                "checkpoint store unavailable"
            )));
        }
        Ok(())
    }

    /// Make every subsequent write fail with a backend error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.fail_writes.store(unavailable, Ordering::SeqCst);
    }

    /// Number of outcome records written since creation.
    pub fn outcome_writes(&self) -> usize {
        self.outcome_writes.load(Ordering::SeqCst)
    }

    /// Overwrite a batch's checkpoint time (simulates a batch gone quiet).
    pub fn set_last_checkpoint(
        &self,
        batch_id: BatchId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut batches = self.lock()?;
        let stored = batches
            .get_mut(&batch_id)
            .ok_or(StoreError::BatchNotFound(batch_id))?;
        stored.batch.last_checkpoint_at = at;
        Ok(())
    }

    pub fn batch_count(&self) -> usize {
        self.lock().map(|b| b.len()).unwrap_or(0)
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn create_batch(&self, batch: &Batch, outcomes: &[ItemOutcome]) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut batches = self.lock()?;
        if batches.contains_key(&batch.batch_id) {
            return Err(StoreError::BatchExists {
                batch_id: batch.batch_id,
            });
        }
        ensure_unique_items(batch.batch_id, outcomes)?;

        let positions = outcomes
            .iter()
            .enumerate()
            .map(|(i, o)| (o.item_id.clone(), i))
            .collect();

        batches.insert(
            batch.batch_id,
            StoredBatch {
                batch: batch.clone(),
                outcomes: outcomes.to_vec(),
                positions,
            },
        );
        Ok(())
    }

    async fn load_batch(&self, batch_id: BatchId) -> Result<Option<Batch>, StoreError> {
        let batches = self.lock()?;
        Ok(batches.get(&batch_id).map(|s| s.batch.clone()))
    }

    async fn load_outcomes(&self, batch_id: BatchId) -> Result<Vec<ItemOutcome>, StoreError> {
        let batches = self.lock()?;
        batches
            .get(&batch_id)
            .map(|s| s.outcomes.clone())
            .ok_or(StoreError::BatchNotFound(batch_id))
    }

    async fn record_outcomes(
        &self,
        batch_id: BatchId,
        outcomes: &[ItemOutcome],
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut batches = self.lock()?;
        let stored = batches
            .get_mut(&batch_id)
            .ok_or(StoreError::BatchNotFound(batch_id))?;

        // Validate everything first so a rejected write leaves no partial state.
        let mut slots = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            let position = *stored.positions.get(&outcome.item_id).ok_or_else(|| {
                StoreError::ItemNotFound {
                    batch_id,
                    item_id: outcome.item_id.clone(),
                }
            })?;
            let previous = &stored.outcomes[position];
            if !outcome.follows(previous) {
                return Err(StoreError::ItemConflict {
                    item_id: outcome.item_id.clone(),
                    stored: previous.state,
                    stored_attempt: previous.attempt,
                    attempted: outcome.state,
                    attempted_attempt: outcome.attempt,
                });
            }
            slots.push(position);
        }

        for (position, outcome) in slots.into_iter().zip(outcomes) {
            stored.outcomes[position] = outcome.clone();
        }
        stored.batch.last_checkpoint_at = Utc::now();
        self.outcome_writes
            .fetch_add(outcomes.len(), Ordering::SeqCst);
        Ok(())
    }

    async fn heartbeat(&self, batch_id: BatchId) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut batches = self.lock()?;
        let stored = batches
            .get_mut(&batch_id)
            .ok_or(StoreError::BatchNotFound(batch_id))?;
        if stored.batch.status == BatchStatus::Running {
            stored.batch.last_checkpoint_at = Utc::now();
        }
        Ok(())
    }

    async fn set_status(&self, batch_id: BatchId, status: BatchStatus) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut batches = self.lock()?;
        let stored = batches
            .get_mut(&batch_id)
            .ok_or(StoreError::BatchNotFound(batch_id))?;

        let current = stored.batch.status;
        if !current.can_transition_to(status) {
            return Err(StoreError::StatusConflict {
                batch_id,
                from: current,
                to: status,
            });
        }
        stored.batch.status = status;
        if status.is_terminal() && current != status {
            stored.batch.last_checkpoint_at = Utc::now();
        }
        Ok(())
    }

    async fn mark_interrupted(&self, batch_id: BatchId) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut batches = self.lock()?;
        let stored = batches
            .get_mut(&batch_id)
            .ok_or(StoreError::BatchNotFound(batch_id))?;

        let current = stored.batch.status;
        if !current.can_transition_to(BatchStatus::Interrupted) {
            return Err(StoreError::StatusConflict {
                batch_id,
                from: current,
                to: BatchStatus::Interrupted,
            });
        }
        stored.batch.status = BatchStatus::Interrupted;
        stored.batch.last_checkpoint_at = ABANDONED_AT;
        Ok(())
    }

    async fn has_recovery_candidates(&self, stale_before: DateTime<Utc>) -> Result<bool, StoreError> {
        let batches = self.lock()?;
        Ok(batches
            .values()
            .any(|s| s.batch.is_recovery_candidate(stale_before)))
    }

    async fn find_recovery_candidates(
        &self,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<Batch>, StoreError> {
        let batches = self.lock()?;
        let mut candidates: Vec<Batch> = batches
            .values()
            .filter(|s| s.batch.is_recovery_candidate(stale_before))
            .map(|s| s.batch.clone())
            .collect();
        candidates.sort_by_key(|b| b.created_at);
        Ok(candidates)
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<PurgeReport, StoreError> {
        self.check_writable()?;
        let mut batches = self.lock()?;
        let mut report = PurgeReport::default();
        batches.retain(|_, stored| {
            let expired =
                stored.batch.status.is_terminal() && stored.batch.last_checkpoint_at < cutoff;
            if expired {
                report.batches_removed += 1;
                report.outcomes_removed += stored.outcomes.len() as u64;
            }
            !expired
        });
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ItemRef, ItemState};

    fn batch_of(n: usize) -> Batch {
        let items = (1..=n)
            .map(|i| ItemRef::new(i.to_string(), format!("repo-{}", i)))
            .collect();
        Batch::new("sync", "user-1", items)
    }

    async fn stored_batch(store: &InMemoryCheckpointStore, n: usize) -> Batch {
        let batch = batch_of(n);
        store
            .create_batch(&batch, &batch.initial_outcomes())
            .await
            .unwrap();
        batch
    }

    #[tokio::test]
    async fn test_create_and_load() {
        let store = InMemoryCheckpointStore::new();
        let batch = stored_batch(&store, 3).await;

        let loaded = store.load_batch(batch.batch_id).await.unwrap().unwrap();
        assert_eq!(loaded.items.len(), 3);
        assert_eq!(loaded.status, BatchStatus::Running);

        let outcomes = store.load_outcomes(batch.batch_id).await.unwrap();
        let ids: Vec<_> = outcomes.iter().map(|o| o.item_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_duplicate_batch_rejected() {
        let store = InMemoryCheckpointStore::new();
        let batch = stored_batch(&store, 1).await;
        let result = store.create_batch(&batch, &batch.initial_outcomes()).await;
        assert!(matches!(result, Err(StoreError::BatchExists { .. })));
    }

    #[tokio::test]
    async fn test_duplicate_item_ids_rejected() {
        let store = InMemoryCheckpointStore::new();
        let batch = Batch::new(
            "sync",
            "user-1",
            vec![
                ItemRef::new("1", "repo-1"),
                ItemRef::new("2", "repo-2"),
                ItemRef::new("1", "repo-1"),
            ],
        );

        let result = store.create_batch(&batch, &batch.initial_outcomes()).await;
        assert!(matches!(
            result,
            Err(StoreError::DuplicateItem { ref item_id, .. }) if item_id == "1"
        ));
        assert!(store.load_batch(batch.batch_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_marked_interrupted_is_candidate_at_once() {
        let store = InMemoryCheckpointStore::new();
        let batch = stored_batch(&store, 1).await;
        let cutoff = Utc::now() - chrono::Duration::minutes(10);
        store.heartbeat(batch.batch_id).await.unwrap();

        store.mark_interrupted(batch.batch_id).await.unwrap();

        let stored = store.load_batch(batch.batch_id).await.unwrap().unwrap();
        assert_eq!(stored.status, BatchStatus::Interrupted);
        assert!(store.has_recovery_candidates(cutoff).await.unwrap());

        // A late heartbeat from the aborted run must not make it look live again.
        store.heartbeat(batch.batch_id).await.unwrap();
        assert!(store.has_recovery_candidates(cutoff).await.unwrap());
    }

    #[tokio::test]
    async fn test_finished_batch_cannot_be_marked_interrupted() {
        let store = InMemoryCheckpointStore::new();
        let batch = stored_batch(&store, 1).await;
        store
            .set_status(batch.batch_id, BatchStatus::Completed)
            .await
            .unwrap();

        let err = store.mark_interrupted(batch.batch_id).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_stale_outcome_write_is_rejected() {
        let store = InMemoryCheckpointStore::new();
        let batch = stored_batch(&store, 1).await;
        let mut outcome = batch.initial_outcomes().remove(0);

        outcome.begin_attempt();
        store
            .record_outcomes(batch.batch_id, &[outcome.clone()])
            .await
            .unwrap();

        // Same attempt claimed twice.
        let result = store.record_outcomes(batch.batch_id, &[outcome.clone()]).await;
        assert!(matches!(result, Err(StoreError::ItemConflict { .. })));

        outcome.succeed();
        store
            .record_outcomes(batch.batch_id, &[outcome])
            .await
            .unwrap();

        let stored = store.load_outcomes(batch.batch_id).await.unwrap();
        assert_eq!(stored[0].state, ItemState::Succeeded);
        assert_eq!(stored[0].attempt, 1);
    }

    #[tokio::test]
    async fn test_rejected_write_leaves_no_partial_state() {
        let store = InMemoryCheckpointStore::new();
        let batch = stored_batch(&store, 2).await;
        let mut outcomes = batch.initial_outcomes();
        outcomes[0].begin_attempt();
        // Pending -> Succeeded skips a state.
        outcomes[1].state = ItemState::Succeeded;

        let result = store.record_outcomes(batch.batch_id, &outcomes).await;
        assert!(result.is_err());

        let stored = store.load_outcomes(batch.batch_id).await.unwrap();
        assert!(stored.iter().all(|o| o.state == ItemState::Pending));
    }

    #[tokio::test]
    async fn test_terminal_status_is_final() {
        let store = InMemoryCheckpointStore::new();
        let batch = stored_batch(&store, 1).await;

        store
            .set_status(batch.batch_id, BatchStatus::Completed)
            .await
            .unwrap();
        let result = store.set_status(batch.batch_id, BatchStatus::Running).await;
        assert!(matches!(result, Err(StoreError::StatusConflict { .. })));
    }

    #[tokio::test]
    async fn test_recovery_candidates_need_staleness() {
        let store = InMemoryCheckpointStore::new();
        let batch = stored_batch(&store, 1).await;
        let cutoff = Utc::now() - chrono::Duration::minutes(10);

        assert!(!store.has_recovery_candidates(cutoff).await.unwrap());

        store
            .set_last_checkpoint(batch.batch_id, Utc::now() - chrono::Duration::minutes(30))
            .unwrap();
        assert!(store.has_recovery_candidates(cutoff).await.unwrap());
        assert_eq!(store.find_recovery_candidates(cutoff).await.unwrap().len(), 1);

        store.heartbeat(batch.batch_id).await.unwrap();
        assert!(!store.has_recovery_candidates(cutoff).await.unwrap());
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_writes() {
        let store = InMemoryCheckpointStore::new();
        let batch = stored_batch(&store, 1).await;
        store.set_unavailable(true);

        let result = store.heartbeat(batch.batch_id).await;
        assert!(matches!(result, Err(StoreError::Backend(_))));
        // Reads still work.
        assert!(store.load_batch(batch.batch_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_purge_only_removes_old_terminal_batches() {
        let store = InMemoryCheckpointStore::new();
        let old_done = stored_batch(&store, 2).await;
        let fresh_done = stored_batch(&store, 1).await;
        let old_running = stored_batch(&store, 1).await;

        store
            .set_status(old_done.batch_id, BatchStatus::Completed)
            .await
            .unwrap();
        store
            .set_status(fresh_done.batch_id, BatchStatus::CompletedWithErrors)
            .await
            .unwrap();

        let long_ago = Utc::now() - chrono::Duration::days(30);
        store.set_last_checkpoint(old_done.batch_id, long_ago).unwrap();
        store.set_last_checkpoint(old_running.batch_id, long_ago).unwrap();

        let report = store
            .purge_terminal_before(Utc::now() - chrono::Duration::days(7))
            .await
            .unwrap();

        assert_eq!(
            report,
            PurgeReport {
                batches_removed: 1,
                outcomes_removed: 2
            }
        );
        assert!(store.load_batch(old_done.batch_id).await.unwrap().is_none());
        assert!(store.load_batch(fresh_done.batch_id).await.unwrap().is_some());
        assert!(store.load_batch(old_running.batch_id).await.unwrap().is_some());
    }
}
