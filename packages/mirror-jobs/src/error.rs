//! Structured error types for the job subsystem.
//!
//! # The Error Boundary Rule
//!
//! > **No per-item error ever escapes a batch run.**
//!
//! - `anyhow` is the transport for per-item operations (ergonomic for callers)
//! - [`FailureKind`] is how the executor decides what to do with an item error
//! - [`JobError`] is reserved for infrastructure failures that abort a run
//!
//! # Permanent Failures
//!
//! ```ignore
//! use mirror_jobs::PermanentFailure;
//!
//! async fn sync(repo: Repository) -> anyhow::Result<Repository> {
//!     if repo.clone_url.is_empty() {
//!         // No retry budget is spent on this item.
//!         return Err(PermanentFailure::new("repository has no clone url").into());
//!     }
//!     // ...
//! }
//! ```

use std::fmt;

use thiserror::Error;

use crate::model::{BatchId, BatchStatus, ItemState};

// =============================================================================
// Failure Classification
// =============================================================================

/// Classification of item failures for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Failure may be transient; the item should be retried.
    ///
    /// Examples: network timeout, rate limiting, temporary unavailability
    Retryable,

    /// Failure is permanent; the item becomes failed-terminal immediately.
    ///
    /// Examples: malformed item, repository not found, validation failure
    Permanent,
}

/// Marker error for item failures that retrying cannot fix.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct PermanentFailure {
    message: String,
}

impl PermanentFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Default classifier: anything carrying a [`PermanentFailure`] in its chain
/// is permanent, everything else is worth another attempt.
pub fn classify_failure(error: &anyhow::Error) -> FailureKind {
    if error
        .chain()
        .any(|cause| cause.downcast_ref::<PermanentFailure>().is_some())
    {
        return FailureKind::Permanent;
    }
    FailureKind::Retryable
}

// =============================================================================
// Store Error
// =============================================================================

/// Errors from checkpoint storage.
///
/// - [`StoreError::ItemConflict`] and [`StoreError::StatusConflict`] mean a
///   write would have moved a record backwards. The writer lost a race or is
///   replaying stale state.
/// - [`StoreError::Backend`] means storage itself failed (connection,
///   timeout, serialization). This is a batch-level infrastructure failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("batch {0} not found")]
    BatchNotFound(BatchId),

    #[error("item {item_id} not found in batch {batch_id}")]
    ItemNotFound { batch_id: BatchId, item_id: String },

    #[error("batch {batch_id} already exists")]
    BatchExists { batch_id: BatchId },

    #[error("item {item_id} appears more than once in batch {batch_id}")]
    DuplicateItem { batch_id: BatchId, item_id: String },

    #[error("stale write for item {item_id}: {stored} (attempt {stored_attempt}) -> {attempted} (attempt {attempted_attempt})")]
    ItemConflict {
        item_id: String,
        stored: ItemState,
        stored_attempt: u32,
        attempted: ItemState,
        attempted_attempt: u32,
    },

    #[error("batch {batch_id} cannot move from {from} to {to}")]
    StatusConflict {
        batch_id: BatchId,
        from: BatchStatus,
        to: BatchStatus,
    },

    #[error("storage backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    /// Conflicts are expected under races; backend errors are not.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StoreError::ItemConflict { .. } | StoreError::StatusConflict { .. }
        )
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Backend(err.into())
    }
}

// =============================================================================
// Job Error
// =============================================================================

/// Infrastructure-level failures of a batch run or a resume.
///
/// Item-level failures never appear here; they are recorded as outcomes.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("checkpoint store failed for batch {batch_id}: {source}")]
    Checkpoint {
        batch_id: BatchId,
        #[source]
        source: StoreError,
    },

    #[error("invalid batch configuration: {0}")]
    InvalidConfig(String),

    #[error("no resumer registered for job type {job_type}")]
    NoResumer { job_type: String },

    #[error("failed to reload items for batch {batch_id}: {source}")]
    Reload {
        batch_id: BatchId,
        #[source]
        source: anyhow::Error,
    },

    #[error("batch task for {batch_id} ended abnormally: {reason}")]
    TaskFailed { batch_id: BatchId, reason: String },

    /// The supervisor is draining and accepts no new batches.
    #[error("job supervisor is shutting down")]
    ShuttingDown,
}

impl JobError {
    pub(crate) fn checkpoint(batch_id: BatchId, source: StoreError) -> Self {
        JobError::Checkpoint { batch_id, source }
    }
}

// =============================================================================
// Recovery Error
// =============================================================================

#[derive(Debug, Error)]
pub enum RecoveryError {
    /// The caller stopped waiting; recovery keeps running in the background.
    #[error("recovery did not finish within {0:?}")]
    Timeout(std::time::Duration),
}

// =============================================================================
// Shutdown Error
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShutdownError {
    /// Callbacks can only be registered while the manager is active.
    #[error("shutdown manager is {state}, callbacks can only be registered while active")]
    NotActive { state: ShutdownPhase },
}

/// Phase names used in shutdown errors and status snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Uninitialized,
    Active,
    ShuttingDown,
    Terminated,
}

impl fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownPhase::Uninitialized => write!(f, "uninitialized"),
            ShutdownPhase::Active => write!(f, "active"),
            ShutdownPhase::ShuttingDown => write!(f, "shutting-down"),
            ShutdownPhase::Terminated => write!(f, "terminated"),
        }
    }
}
