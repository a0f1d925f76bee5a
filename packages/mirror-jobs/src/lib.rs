//! # Mirror Jobs
//!
//! Resilient background execution for repository mirroring: bounded-concurrency
//! batches with retry and checkpointing, recovery after an unclean exit, a
//! retention sweep, and ordered graceful shutdown.
//!
//! ## Architecture
//!
//! ```text
//! start_sync (request)
//!     │
//!     ▼ spawn_batch()
//! JobSupervisor ──► BatchExecutor ──► lanes (≤ concurrency_limit)
//!                        │                 │
//!                        │                 └─► ItemOperation::perform
//!                        ▼
//!                  CheckpointStore ◄──────── RecoveryManager (on start)
//!                        ▲
//!                        └────────────────── CleanupService (every interval)
//!
//! SIGINT/SIGTERM ──► ShutdownManager::trigger
//!                        ├─► stop cleanup
//!                        ├─► drain supervisor (deadline, then mark interrupted)
//!                        └─► close store
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Item errors stay inside the batch** - they become outcomes, never panics or `Err`
//! 2. **Outcomes only move forward** - the store rejects stale writes
//! 3. **Succeeded items never run again** - recovery resumes only unfinished items
//! 4. **Startup and shutdown happen once** - later callers observe the first result
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use mirror_jobs::{InMemoryCheckpointStore, JobRuntime, MirrorJobsConfig, SyncRequest};
//!
//! let config = MirrorJobsConfig::from_env()?;
//! let runtime = JobRuntime::new(Arc::new(InMemoryCheckpointStore::new()), config);
//! let sync = runtime.sync_service(configs, repositories, syncer);
//!
//! runtime.start().await;
//!
//! let started = sync
//!     .start_sync(SyncRequest {
//!         user_id: "user-1".into(),
//!         repository_ids: Some(vec!["42".into()]),
//!     })
//!     .await?;
//! println!("batch {} started", started.batch_id);
//!
//! runtime.run_until_shutdown().await;
//! ```

pub mod checkpoint;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod executor;
pub mod lifecycle;
pub mod model;
pub mod recovery;
pub mod shutdown;
pub mod signals;
pub mod supervisor;
pub mod sync;

// Test doubles (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Store
#[cfg(feature = "postgres")]
pub use checkpoint::PostgresCheckpointStore;
pub use checkpoint::{CheckpointStore, InMemoryCheckpointStore, PurgeReport};

// Model
pub use model::{Batch, BatchId, BatchStatus, ItemOutcome, ItemRef, ItemState, RecoveryCandidate};

// Errors
pub use error::{
    classify_failure, FailureKind, JobError, PermanentFailure, RecoveryError, ShutdownError,
    ShutdownPhase, StoreError,
};

// Execution
pub use executor::{
    operation_fn, Backoff, BatchExecutor, BatchHooks, BatchOptions, BatchReport, BatchSpec,
    ItemOperation,
};
pub use supervisor::{DrainReport, JobSupervisor};

// Recovery, cleanup, shutdown
pub use cleanup::CleanupService;
pub use recovery::{
    BatchResumer, ExecutorResumer, ItemSource, RecoveryManager, RecoveryOptions, RecoveryStatus,
};
pub use shutdown::{ShutdownManager, ShutdownReport};
pub use signals::{forward_signal, setup_signal_handlers};

// Wiring
pub use config::MirrorJobsConfig;
pub use lifecycle::{JobRuntime, StartupReport};
pub use sync::{
    ConfigSource, MirrorConfig, Repository, RepositorySource, RepositorySyncer, SyncRequest,
    SyncRequestError, SyncService, SyncStarted, SYNC_JOB_TYPE,
};

// Re-export async_trait for implementors
pub use async_trait::async_trait;
