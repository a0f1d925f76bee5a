//! Resilient batch executor.
//!
//! Runs every item of a batch through a caller-supplied async operation under
//! a hard concurrency cap, retrying transient failures with backoff and
//! checkpointing outcomes as it goes.
//!
//! # Architecture
//!
//! ```text
//! BatchExecutor::run / resume
//!     │
//!     ├─► create (or reopen) the batch in the CheckpointStore
//!     ├─► heartbeat ──► store.heartbeat(batch_id) every heartbeat_interval
//!     └─► lanes (≤ concurrency_limit), each:
//!             ├─► pull next ready item from the shared FIFO queue
//!             ├─► record in_progress (attempt + 1)
//!             ├─► operation.perform(item)        (errors and panics caught)
//!             └─► succeeded ─► buffered, flushed every checkpoint_interval
//!                 failed    ─► retryable: on_retry, requeue after backoff
//!                              terminal:  recorded, batch continues
//! ```
//!
//! Item failures never escape a run. Only checkpoint store failures abort
//! it, leaving the batch `running` so recovery can pick it up later.
//!
//! # Example
//!
//! ```ignore
//! let executor = BatchExecutor::new(store.clone());
//! let hooks = BatchHooks::new(|r: &Repository| r.id.clone(), |r: &Repository| r.name.clone())
//!     .on_progress(|done, total, _| info!(done, total, "sync progress"));
//!
//! let report = executor
//!     .run(
//!         BatchSpec::new("sync", user_id),
//!         repositories,
//!         operation_fn(move |repo: Repository| {
//!             let syncer = syncer.clone();
//!             async move { syncer.sync(&repo).await.map(|_| repo) }
//!         }),
//!         BatchOptions::builder().concurrency_limit(5).build(),
//!         hooks,
//!     )
//!     .await?;
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use typed_builder::TypedBuilder;

use crate::checkpoint::CheckpointStore;
use crate::error::{classify_failure, FailureKind, JobError};
use crate::model::{Batch, BatchId, BatchStatus, ItemOutcome, ItemRef, ItemState};

// ============================================================================
// Operation
// ============================================================================

/// The per-item unit of work. Treated as a black box that may fail.
#[async_trait]
pub trait ItemOperation<T, R>: Send + Sync {
    async fn perform(&self, item: &T) -> anyhow::Result<R>;
}

#[async_trait]
impl<T, R, F, Fut> ItemOperation<T, R> for F
where
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<R>> + Send,
    T: Clone + Send + Sync + 'static,
    R: Send + 'static,
{
    async fn perform(&self, item: &T) -> anyhow::Result<R> {
        (self)(item.clone()).await
    }
}

/// Wrap an async closure as a shareable operation.
pub fn operation_fn<T, R, F, Fut>(f: F) -> Arc<dyn ItemOperation<T, R>>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    T: Clone + Send + Sync + 'static,
    R: Send + 'static,
{
    Arc::new(f)
}

// ============================================================================
// Options
// ============================================================================

/// Wait policy between attempts of one item.
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed(Duration),
    /// `delay * failed_attempt`.
    Linear(Duration),
    /// `base * 2^(failed_attempt - 1)`, capped at `max`. With `jitter` the
    /// wait is drawn from the upper half of that value.
    Exponential {
        base: Duration,
        max: Duration,
        jitter: bool,
    },
}

impl Backoff {
    /// Delay before the attempt that follows `failed_attempt` (1-based).
    pub fn delay_for(&self, failed_attempt: u32) -> Duration {
        let n = failed_attempt.max(1);
        match self {
            Backoff::Fixed(delay) => *delay,
            Backoff::Linear(delay) => delay.saturating_mul(n),
            Backoff::Exponential { base, max, jitter } => {
                let factor = 2u32.saturating_pow(n - 1);
                let delay = base.saturating_mul(factor).min(*max);
                if *jitter {
                    let half = delay / 2;
                    let spread = half.as_millis() as u64;
                    half + Duration::from_millis(fastrand::u64(0..=spread))
                } else {
                    delay
                }
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Fixed(Duration::from_secs(2))
    }
}

/// How often a running batch refreshes its checkpoint stamp.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, TypedBuilder)]
pub struct BatchOptions {
    /// Hard upper bound on simultaneously running operations.
    #[builder(default = 5)]
    pub concurrency_limit: usize,
    /// Retries after the first attempt; an item runs at most `max_retries + 1` times.
    #[builder(default = 2)]
    pub max_retries: u32,
    #[builder(default)]
    pub backoff: Backoff,
    /// Successes accumulated between durable flushes (1 = every item).
    #[builder(default = 1)]
    pub checkpoint_interval: usize,
    #[builder(default = HEARTBEAT_INTERVAL)]
    pub heartbeat_interval: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl BatchOptions {
    pub fn validate(&self) -> Result<(), JobError> {
        if self.concurrency_limit == 0 {
            return Err(JobError::InvalidConfig(
                "concurrency_limit must be at least 1".into(),
            ));
        }
        if self.checkpoint_interval == 0 {
            return Err(JobError::InvalidConfig(
                "checkpoint_interval must be at least 1".into(),
            ));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(JobError::InvalidConfig(
                "heartbeat_interval must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Hooks
// ============================================================================

pub type ItemKeyFn<T> = Arc<dyn Fn(&T) -> String + Send + Sync>;
pub type ProgressFn<R> = Arc<dyn Fn(usize, usize, Option<&R>) + Send + Sync>;
pub type RetryFn<T> = Arc<dyn Fn(&T, &anyhow::Error, u32) + Send + Sync>;
pub type ClassifyFn = Arc<dyn Fn(&anyhow::Error) -> FailureKind + Send + Sync>;

/// Item identity and observation callbacks for one batch.
pub struct BatchHooks<T, R> {
    item_id: ItemKeyFn<T>,
    item_name: ItemKeyFn<T>,
    on_progress: Option<ProgressFn<R>>,
    on_retry: Option<RetryFn<T>>,
    classify: ClassifyFn,
}

impl<T, R> Clone for BatchHooks<T, R> {
    fn clone(&self) -> Self {
        Self {
            item_id: self.item_id.clone(),
            item_name: self.item_name.clone(),
            on_progress: self.on_progress.clone(),
            on_retry: self.on_retry.clone(),
            classify: self.classify.clone(),
        }
    }
}

impl<T, R> BatchHooks<T, R> {
    pub fn new(
        item_id: impl Fn(&T) -> String + Send + Sync + 'static,
        item_name: impl Fn(&T) -> String + Send + Sync + 'static,
    ) -> Self {
        Self {
            item_id: Arc::new(item_id),
            item_name: Arc::new(item_name),
            on_progress: None,
            on_retry: None,
            classify: Arc::new(classify_failure),
        }
    }

    /// Called with `(completed, total, last_result)` after each item reaches
    /// a terminal state. `last_result` is `None` for failed items.
    pub fn on_progress(mut self, f: impl Fn(usize, usize, Option<&R>) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(f));
        self
    }

    /// Called with `(item, error, failed_attempt)` before an item is requeued.
    pub fn on_retry(mut self, f: impl Fn(&T, &anyhow::Error, u32) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Arc::new(f));
        self
    }

    pub fn classify_with(
        mut self,
        f: impl Fn(&anyhow::Error) -> FailureKind + Send + Sync + 'static,
    ) -> Self {
        self.classify = Arc::new(f);
        self
    }

    pub fn item_id(&self, item: &T) -> String {
        (self.item_id)(item)
    }

    pub fn item_ref(&self, item: &T) -> ItemRef {
        ItemRef::new((self.item_id)(item), (self.item_name)(item))
    }
}

// ============================================================================
// Batch Spec & Report
// ============================================================================

/// Identity of a batch about to be created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSpec {
    pub batch_id: BatchId,
    pub job_type: String,
    pub owner_id: String,
}

impl BatchSpec {
    pub fn new(job_type: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            batch_id: uuid::Uuid::new_v4(),
            job_type: job_type.into(),
            owner_id: owner_id.into(),
        }
    }
}

/// What a finished run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub batch_id: BatchId,
    pub status: BatchStatus,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Items this run worked on (excludes items already terminal on resume).
    pub processed: usize,
    /// Operation invocations made by this run.
    pub attempts: usize,
}

impl BatchReport {
    pub fn is_fully_succeeded(&self) -> bool {
        self.status == BatchStatus::Completed
    }
}

// ============================================================================
// Executor
// ============================================================================

#[derive(Clone)]
pub struct BatchExecutor {
    store: Arc<dyn CheckpointStore>,
}

impl BatchExecutor {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Create a batch for `items` and process every item to a terminal outcome.
    pub async fn run<T, R>(
        &self,
        spec: BatchSpec,
        items: Vec<T>,
        operation: Arc<dyn ItemOperation<T, R>>,
        options: BatchOptions,
        hooks: BatchHooks<T, R>,
    ) -> Result<BatchReport, JobError>
    where
        T: Send + Sync + 'static,
        R: Send + 'static,
    {
        options.validate()?;

        let refs: Vec<ItemRef> = items.iter().map(|item| hooks.item_ref(item)).collect();
        let mut seen = HashSet::with_capacity(refs.len());
        for item in &refs {
            if !seen.insert(item.item_id.as_str()) {
                return Err(JobError::InvalidConfig(format!(
                    "item {} appears more than once in the batch",
                    item.item_id
                )));
            }
        }

        let batch = Batch::with_id(spec.batch_id, spec.job_type, spec.owner_id, refs);
        let outcomes = batch.initial_outcomes();

        self.store
            .create_batch(&batch, &outcomes)
            .await
            .map_err(|e| JobError::checkpoint(batch.batch_id, e))?;

        info!(
            batch_id = %batch.batch_id,
            job_type = %batch.job_type,
            owner_id = %batch.owner_id,
            items = batch.items.len(),
            concurrency = options.concurrency_limit,
            "batch started"
        );

        let slots = items
            .into_iter()
            .zip(outcomes)
            .map(|(item, outcome)| Slot::ready(item, outcome))
            .collect();

        self.drive(batch, slots, 0, 0, operation, options, hooks).await
    }

    /// Continue a batch from its stored outcomes.
    ///
    /// `items` holds the reloaded payloads of items that still need work;
    /// succeeded and failed-terminal items are never run again. Items that
    /// could not be reloaded are finalized as failed-terminal.
    pub async fn resume<T, R>(
        &self,
        batch: Batch,
        outcomes: Vec<ItemOutcome>,
        items: Vec<T>,
        operation: Arc<dyn ItemOperation<T, R>>,
        options: BatchOptions,
        hooks: BatchHooks<T, R>,
    ) -> Result<BatchReport, JobError>
    where
        T: Send + Sync + 'static,
        R: Send + 'static,
    {
        options.validate()?;
        let batch_id = batch.batch_id;

        if batch.status == BatchStatus::Interrupted {
            self.store
                .set_status(batch_id, BatchStatus::Running)
                .await
                .map_err(|e| JobError::checkpoint(batch_id, e))?;
        }

        let mut payloads: Vec<Option<T>> = Vec::new();
        let mut by_id = HashMap::new();
        for item in items {
            by_id.insert(hooks.item_id(&item), payloads.len());
            payloads.push(Some(item));
        }

        let mut slots = Vec::new();
        let mut already_done = 0;
        let mut already_failed = 0;
        let mut finalize = Vec::new();

        for mut outcome in outcomes {
            match outcome.state {
                ItemState::Succeeded => already_done += 1,
                ItemState::FailedTerminal => {
                    already_done += 1;
                    already_failed += 1;
                }
                _ => {
                    let payload = by_id
                        .get(&outcome.item_id)
                        .and_then(|&i| payloads[i].take());

                    match payload {
                        None => {
                            // Pending items pass through in_progress so the
                            // state machine is never skipped.
                            if outcome.state == ItemState::Pending {
                                outcome.begin_attempt();
                                finalize.push(outcome.clone());
                            }
                            outcome.fail("item is no longer available for processing", true);
                            finalize.push(outcome);
                            already_done += 1;
                            already_failed += 1;
                        }
                        Some(_) if outcome.attempt > options.max_retries => {
                            let reason = outcome
                                .last_error
                                .clone()
                                .unwrap_or_else(|| "interrupted during final attempt".into());
                            outcome.fail(reason, true);
                            finalize.push(outcome);
                            already_done += 1;
                            already_failed += 1;
                        }
                        Some(item) => slots.push(Slot::ready(item, outcome)),
                    }
                }
            }
        }

        // One write per record: a pending item is finalized in two steps.
        for outcome in &finalize {
            self.store
                .record_outcomes(batch_id, std::slice::from_ref(outcome))
                .await
                .map_err(|e| JobError::checkpoint(batch_id, e))?;
        }

        info!(
            batch_id = %batch_id,
            job_type = %batch.job_type,
            remaining = slots.len(),
            already_done,
            "batch resumed"
        );

        self.drive(
            batch,
            slots,
            already_done,
            already_failed,
            operation,
            options,
            hooks,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive<T, R>(
        &self,
        batch: Batch,
        slots: Vec<Slot<T>>,
        already_done: usize,
        already_failed: usize,
        operation: Arc<dyn ItemOperation<T, R>>,
        options: BatchOptions,
        hooks: BatchHooks<T, R>,
    ) -> Result<BatchReport, JobError>
    where
        T: Send + Sync + 'static,
        R: Send + 'static,
    {
        let batch_id = batch.batch_id;
        let total = batch.items.len();
        let processed = slots.len();
        let lanes = options.concurrency_limit.min(slots.len());

        let state = RunState::new(batch_id, total, slots, already_done, already_failed);
        let run = Run {
            store: self.store.as_ref(),
            operation: operation.as_ref(),
            options: &options,
            hooks: &hooks,
            state: &state,
        };

        let cancel = CancellationToken::new();
        let work = async {
            futures::future::join_all((0..lanes).map(|lane| run.lane(lane))).await;
            cancel.cancel();
        };
        tokio::join!(work, heartbeat(self.store.as_ref(), batch_id, options.heartbeat_interval, &cancel));

        if let Some(err) = state.take_error() {
            error!(batch_id = %batch_id, error = %err, "batch aborted, left for recovery");
            return Err(err);
        }

        run.flush().await?;

        let failed = state.failed.load(Ordering::SeqCst);
        let status = if failed > 0 {
            BatchStatus::CompletedWithErrors
        } else {
            BatchStatus::Completed
        };
        self.store
            .set_status(batch_id, status)
            .await
            .map_err(|e| JobError::checkpoint(batch_id, e))?;

        let report = BatchReport {
            batch_id,
            status,
            total,
            succeeded: state.succeeded.load(Ordering::SeqCst),
            failed,
            processed,
            attempts: state.attempts.load(Ordering::SeqCst),
        };

        info!(
            batch_id = %batch_id,
            status = %status,
            succeeded = report.succeeded,
            failed = report.failed,
            attempts = report.attempts,
            "batch finished"
        );
        Ok(report)
    }
}

/// Keep `last_checkpoint_at` fresh while a batch is live.
async fn heartbeat(
    store: &dyn CheckpointStore,
    batch_id: BatchId,
    interval: Duration,
    cancel: &CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // Skip first immediate tick

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = store.heartbeat(batch_id).await {
                    warn!(batch_id = %batch_id, error = %e, "heartbeat failed");
                }
            }
        }
    }
}

// ============================================================================
// Run State
// ============================================================================

struct Slot<T> {
    item: T,
    outcome: ItemOutcome,
    ready_at: Instant,
}

impl<T> Slot<T> {
    fn ready(item: T, outcome: ItemOutcome) -> Self {
        Self {
            item,
            outcome,
            ready_at: Instant::now(),
        }
    }
}

struct RunState<T> {
    batch_id: BatchId,
    total: usize,
    queue: Mutex<VecDeque<Slot<T>>>,
    /// Items not yet terminal in this run.
    outstanding: AtomicUsize,
    completed: AtomicUsize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    attempts: AtomicUsize,
    aborted: AtomicBool,
    first_error: Mutex<Option<JobError>>,
    unflushed: tokio::sync::Mutex<Vec<ItemOutcome>>,
    notify: Notify,
}

impl<T> RunState<T> {
    fn new(
        batch_id: BatchId,
        total: usize,
        slots: Vec<Slot<T>>,
        already_done: usize,
        already_failed: usize,
    ) -> Self {
        let outstanding = slots.len();
        Self {
            batch_id,
            total,
            queue: Mutex::new(slots.into()),
            outstanding: AtomicUsize::new(outstanding),
            completed: AtomicUsize::new(already_done),
            succeeded: AtomicUsize::new(already_done - already_failed),
            failed: AtomicUsize::new(already_failed),
            attempts: AtomicUsize::new(0),
            aborted: AtomicBool::new(false),
            first_error: Mutex::new(None),
            unflushed: tokio::sync::Mutex::new(Vec::new()),
            notify: Notify::new(),
        }
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<Slot<T>>> {
        match self.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Next item whose backoff has elapsed, in submission order.
    ///
    /// Returns `None` once every item is terminal or the run was aborted.
    async fn next_ready(&self) -> Option<Slot<T>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent requeue is not missed.
            notified.as_mut().enable();

            let wake_at = {
                if self.aborted.load(Ordering::SeqCst)
                    || self.outstanding.load(Ordering::SeqCst) == 0
                {
                    return None;
                }
                let mut queue = self.queue();
                let now = Instant::now();
                if let Some(pos) = queue.iter().position(|s| s.ready_at <= now) {
                    return queue.remove(pos);
                }
                queue.iter().map(|s| s.ready_at).min()
            };

            match wake_at {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    fn requeue(&self, slot: Slot<T>) {
        self.queue().push_back(slot);
        self.notify.notify_waiters();
    }

    /// Returns the new completed count.
    fn finish_item(&self, succeeded: bool) -> usize {
        if succeeded {
            self.succeeded.fetch_add(1, Ordering::SeqCst);
        } else {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
        let completed = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.notify.notify_waiters();
        }
        completed
    }

    fn abort(&self, err: JobError) {
        let mut guard = match self.first_error.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                warn!(batch_id = %self.batch_id, "mutex was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        if guard.is_none() {
            *guard = Some(err);
        }
        drop(guard);
        self.aborted.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn take_error(&self) -> Option<JobError> {
        match self.first_error.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

struct Run<'a, T, R> {
    store: &'a dyn CheckpointStore,
    operation: &'a dyn ItemOperation<T, R>,
    options: &'a BatchOptions,
    hooks: &'a BatchHooks<T, R>,
    state: &'a RunState<T>,
}

impl<'a, T, R> Run<'a, T, R>
where
    T: Send + Sync + 'static,
    R: Send + 'static,
{
    async fn lane(&self, lane: usize) {
        let batch_id = self.state.batch_id;

        while let Some(mut slot) = self.state.next_ready().await {
            slot.outcome.begin_attempt();
            if let Err(e) = self.write(&slot.outcome).await {
                self.state.abort(e);
                break;
            }
            self.state.attempts.fetch_add(1, Ordering::SeqCst);

            debug!(
                batch_id = %batch_id,
                lane,
                item_id = %slot.outcome.item_id,
                attempt = slot.outcome.attempt,
                "item started"
            );

            let result = match AssertUnwindSafe(self.operation.perform(&slot.item))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(panic) => Err(anyhow::anyhow!(
                    "operation panicked: {}",
                    panic_message(panic.as_ref())
                )),
            };

            match result {
                Ok(value) => {
                    slot.outcome.succeed();
                    if let Err(e) = self.buffer_success(slot.outcome.clone()).await {
                        self.state.abort(e);
                        break;
                    }
                    debug!(batch_id = %batch_id, item_id = %slot.outcome.item_id, "item succeeded");
                    let completed = self.state.finish_item(true);
                    if let Some(on_progress) = &self.hooks.on_progress {
                        on_progress(completed, self.state.total, Some(&value));
                    }
                }
                Err(err) => {
                    let kind = (self.hooks.classify)(&err);
                    let exhausted = slot.outcome.attempt > self.options.max_retries;
                    let terminal = kind == FailureKind::Permanent || exhausted;
                    slot.outcome.fail(format!("{:#}", err), terminal);

                    if let Err(e) = self.write(&slot.outcome).await {
                        self.state.abort(e);
                        break;
                    }

                    if terminal {
                        warn!(
                            batch_id = %batch_id,
                            item_id = %slot.outcome.item_id,
                            item_name = %slot.outcome.item_name,
                            attempt = slot.outcome.attempt,
                            permanent = kind == FailureKind::Permanent,
                            error = %err,
                            "item failed"
                        );
                        let completed = self.state.finish_item(false);
                        if let Some(on_progress) = &self.hooks.on_progress {
                            on_progress(completed, self.state.total, None);
                        }
                    } else {
                        let attempt = slot.outcome.attempt;
                        let delay = self.options.backoff.delay_for(attempt);
                        warn!(
                            batch_id = %batch_id,
                            item_id = %slot.outcome.item_id,
                            item_name = %slot.outcome.item_name,
                            attempt,
                            retry_in_ms = delay.as_millis() as u64,
                            error = %err,
                            "item failed, will retry"
                        );
                        if let Some(on_retry) = &self.hooks.on_retry {
                            on_retry(&slot.item, &err, attempt);
                        }
                        slot.ready_at = Instant::now() + delay;
                        self.state.requeue(slot);
                    }
                }
            }
        }
    }

    async fn write(&self, outcome: &ItemOutcome) -> Result<(), JobError> {
        self.store
            .record_outcomes(self.state.batch_id, std::slice::from_ref(outcome))
            .await
            .map_err(|e| JobError::checkpoint(self.state.batch_id, e))
    }

    async fn buffer_success(&self, outcome: ItemOutcome) -> Result<(), JobError> {
        let mut unflushed = self.state.unflushed.lock().await;
        unflushed.push(outcome);
        if unflushed.len() >= self.options.checkpoint_interval {
            let pending = std::mem::take(&mut *unflushed);
            self.store
                .record_outcomes(self.state.batch_id, &pending)
                .await
                .map_err(|e| JobError::checkpoint(self.state.batch_id, e))?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), JobError> {
        let pending = std::mem::take(&mut *self.state.unflushed.lock().await);
        if pending.is_empty() {
            return Ok(());
        }
        self.store
            .record_outcomes(self.state.batch_id, &pending)
            .await
            .map_err(|e| JobError::checkpoint(self.state.batch_id, e))
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = panic.downcast_ref::<String>() {
        return s.clone();
    }
    "unknown panic".to_string()
}
