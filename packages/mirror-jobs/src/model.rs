//! Batch and item outcome records.
//!
//! These are the only shapes the job subsystem persists. A [`Batch`] carries
//! item references (never payloads); each item has exactly one
//! [`ItemOutcome`] per batch that only ever moves forward.
//!
//! # Item state machine
//!
//! ```text
//! pending ─► in_progress ─┬─► succeeded
//!                ▲        ├─► failed_terminal
//!                │        └─► failed_retryable ─┐
//!                └──────────────────────────────┘   (up to max_retries)
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque batch identifier.
pub type BatchId = Uuid;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    #[default]
    Running,
    Completed,
    CompletedWithErrors,
    /// No process is advancing the batch (abandoned at shutdown or unresumable).
    Interrupted,
}

impl BatchStatus {
    /// Terminal statuses never revert to `Running`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::CompletedWithErrors)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Running => "running",
            BatchStatus::Completed => "completed",
            BatchStatus::CompletedWithErrors => "completed_with_errors",
            BatchStatus::Interrupted => "interrupted",
        }
    }

    /// Whether a stored batch may move from `self` to `next`.
    pub fn can_transition_to(&self, next: BatchStatus) -> bool {
        if self.is_terminal() {
            return *self == next;
        }
        true
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(BatchStatus::Running),
            "completed" => Ok(BatchStatus::Completed),
            "completed_with_errors" => Ok(BatchStatus::CompletedWithErrors),
            "interrupted" => Ok(BatchStatus::Interrupted),
            other => Err(anyhow::anyhow!("unknown batch status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    #[default]
    Pending,
    InProgress,
    Succeeded,
    FailedRetryable,
    FailedTerminal,
}

impl ItemState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemState::Succeeded | ItemState::FailedTerminal)
    }

    /// Whether a resumed run still has work to do for this item.
    pub fn needs_work(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemState::Pending => "pending",
            ItemState::InProgress => "in_progress",
            ItemState::Succeeded => "succeeded",
            ItemState::FailedRetryable => "failed_retryable",
            ItemState::FailedTerminal => "failed_terminal",
        }
    }

    /// Legal edges of the item state machine.
    ///
    /// `InProgress -> InProgress` is the restart of an attempt that a crashed
    /// process left behind; the attempt counter must grow for it to be accepted.
    pub fn can_advance_to(&self, next: ItemState) -> bool {
        use ItemState::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (InProgress, InProgress)
                | (InProgress, Succeeded)
                | (InProgress, FailedRetryable)
                | (InProgress, FailedTerminal)
                | (FailedRetryable, InProgress)
                | (FailedRetryable, FailedTerminal)
        )
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ItemState::Pending),
            "in_progress" => Ok(ItemState::InProgress),
            "succeeded" => Ok(ItemState::Succeeded),
            "failed_retryable" => Ok(ItemState::FailedRetryable),
            "failed_terminal" => Ok(ItemState::FailedTerminal),
            other => Err(anyhow::anyhow!("unknown item state: {}", other)),
        }
    }
}

// ============================================================================
// Batch
// ============================================================================

/// Reference to one submitted item. Payloads are reloaded by id on resume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRef {
    pub item_id: String,
    pub item_name: String,
}

impl ItemRef {
    pub fn new(item_id: impl Into<String>, item_name: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            item_name: item_name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: BatchId,
    pub job_type: String,
    pub owner_id: String,
    pub items: Vec<ItemRef>,
    pub created_at: DateTime<Utc>,
    pub last_checkpoint_at: DateTime<Utc>,
    pub status: BatchStatus,
}

impl Batch {
    /// Create a new running batch with a fresh id.
    pub fn new(job_type: impl Into<String>, owner_id: impl Into<String>, items: Vec<ItemRef>) -> Self {
        Self::with_id(Uuid::new_v4(), job_type, owner_id, items)
    }

    /// Create a running batch with a caller-chosen id.
    pub fn with_id(
        batch_id: BatchId,
        job_type: impl Into<String>,
        owner_id: impl Into<String>,
        items: Vec<ItemRef>,
    ) -> Self {
        let now = Utc::now();
        Self {
            batch_id,
            job_type: job_type.into(),
            owner_id: owner_id.into(),
            items,
            created_at: now,
            last_checkpoint_at: now,
            status: BatchStatus::Running,
        }
    }

    /// Running or interrupted, and nobody has checkpointed since `stale_before`.
    pub fn is_recovery_candidate(&self, stale_before: DateTime<Utc>) -> bool {
        matches!(self.status, BatchStatus::Running | BatchStatus::Interrupted)
            && self.last_checkpoint_at <= stale_before
    }

    /// Pending outcomes for every item, in submission order.
    pub fn initial_outcomes(&self) -> Vec<ItemOutcome> {
        self.items.iter().map(ItemOutcome::pending).collect()
    }
}

// ============================================================================
// Item Outcome
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub item_id: String,
    pub item_name: String,
    /// Attempts made so far.
    pub attempt: u32,
    pub state: ItemState,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ItemOutcome {
    pub fn pending(item: &ItemRef) -> Self {
        Self {
            item_id: item.item_id.clone(),
            item_name: item.item_name.clone(),
            attempt: 0,
            state: ItemState::Pending,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn begin_attempt(&mut self) {
        self.attempt += 1;
        self.state = ItemState::InProgress;
        self.updated_at = Utc::now();
    }

    pub fn succeed(&mut self) {
        self.state = ItemState::Succeeded;
        self.updated_at = Utc::now();
    }

    pub fn fail(&mut self, error: impl Into<String>, terminal: bool) {
        self.state = if terminal {
            ItemState::FailedTerminal
        } else {
            ItemState::FailedRetryable
        };
        self.last_error = Some(error.into());
        self.updated_at = Utc::now();
    }

    /// Whether `self` is a legal successor of the stored `previous` record.
    ///
    /// Re-writing an identical terminal record is accepted so that a flush can
    /// be repeated safely; re-entering `in_progress` requires a new attempt.
    pub fn follows(&self, previous: &ItemOutcome) -> bool {
        if self.attempt < previous.attempt {
            return false;
        }
        if self.state == previous.state && self.attempt == previous.attempt {
            return self.state.is_terminal();
        }
        if self.state == ItemState::InProgress && self.attempt == previous.attempt {
            return false;
        }
        previous.state.can_advance_to(self.state)
    }
}

// ============================================================================
// Recovery Candidate
// ============================================================================

/// A stale batch plus the outcomes it was left with.
#[derive(Debug, Clone)]
pub struct RecoveryCandidate {
    pub batch: Batch,
    pub outcomes: Vec<ItemOutcome>,
}

impl RecoveryCandidate {
    /// Ids of items that still need work, in submission order.
    pub fn remaining_item_ids(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|o| o.state.needs_work())
            .map(|o| o.item_id.clone())
            .collect()
    }

    pub fn succeeded_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.state == ItemState::Succeeded)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str) -> ItemRef {
        ItemRef::new(id, format!("repo-{}", id))
    }

    #[test]
    fn test_batch_starts_running() {
        let batch = Batch::new("sync", "user-1", vec![item("1"), item("2")]);
        assert_eq!(batch.status, BatchStatus::Running);
        assert_eq!(batch.initial_outcomes().len(), 2);
        assert!(batch
            .initial_outcomes()
            .iter()
            .all(|o| o.state == ItemState::Pending && o.attempt == 0));
    }

    #[test]
    fn test_terminal_batch_never_reverts() {
        assert!(!BatchStatus::Completed.can_transition_to(BatchStatus::Running));
        assert!(!BatchStatus::CompletedWithErrors.can_transition_to(BatchStatus::Interrupted));
        assert!(BatchStatus::Running.can_transition_to(BatchStatus::Interrupted));
        assert!(BatchStatus::Interrupted.can_transition_to(BatchStatus::Running));
    }

    #[test]
    fn test_recovery_candidate_requires_staleness() {
        let mut batch = Batch::new("sync", "user-1", vec![item("1")]);
        let now = Utc::now();
        batch.last_checkpoint_at = now - chrono::Duration::minutes(20);
        assert!(batch.is_recovery_candidate(now - chrono::Duration::minutes(10)));

        batch.last_checkpoint_at = now;
        assert!(!batch.is_recovery_candidate(now - chrono::Duration::minutes(10)));

        batch.last_checkpoint_at = now - chrono::Duration::minutes(20);
        batch.status = BatchStatus::Completed;
        assert!(!batch.is_recovery_candidate(now));
    }

    #[test]
    fn test_outcome_walks_forward() {
        let pending = ItemOutcome::pending(&item("1"));

        let mut first = pending.clone();
        first.begin_attempt();
        assert!(first.follows(&pending));
        assert_eq!(first.attempt, 1);

        let mut failed = first.clone();
        failed.fail("timeout", false);
        assert!(failed.follows(&first));
        assert_eq!(failed.last_error.as_deref(), Some("timeout"));

        let mut second = failed.clone();
        second.begin_attempt();
        assert!(second.follows(&failed));
        assert_eq!(second.attempt, 2);

        let mut done = second.clone();
        done.succeed();
        assert!(done.follows(&second));
    }

    #[test]
    fn test_outcome_rejects_regressions() {
        let pending = ItemOutcome::pending(&item("1"));
        let mut running = pending.clone();
        running.begin_attempt();

        // Back to pending.
        assert!(!pending.follows(&running));

        // A second lane claiming the same attempt.
        assert!(!running.follows(&running));

        let mut done = running.clone();
        done.succeed();
        let mut again = done.clone();
        again.state = ItemState::InProgress;
        again.attempt += 1;
        assert!(!again.follows(&done));

        // Identical terminal rewrite is accepted.
        assert!(done.follows(&done));
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            BatchStatus::Running,
            BatchStatus::Completed,
            BatchStatus::CompletedWithErrors,
            BatchStatus::Interrupted,
        ] {
            assert_eq!(status.as_str().parse::<BatchStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<ItemState>().is_err());
    }

    #[test]
    fn test_candidate_remaining_items() {
        let batch = Batch::new("sync", "user-1", vec![item("1"), item("2"), item("3")]);
        let mut outcomes = batch.initial_outcomes();
        outcomes[0].begin_attempt();
        outcomes[0].succeed();
        outcomes[2].begin_attempt();

        let candidate = RecoveryCandidate { batch, outcomes };
        assert_eq!(candidate.remaining_item_ids(), vec!["2".to_string(), "3".to_string()]);
        assert_eq!(candidate.succeeded_count(), 1);
    }
}
