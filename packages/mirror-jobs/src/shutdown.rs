//! Ordered, bounded-time teardown.
//!
//! ```text
//! uninitialized ──initialize()──► active ──trigger()──► shutting-down ──► terminated
//!                                   │
//!                                   └─ register(name, callback) appends in order
//! ```
//!
//! Callbacks run one at a time in registration order, so a subsystem that
//! registers after its dependencies is torn down before them. A callback that
//! fails or panics is recorded and the next one still runs. The whole sequence
//! shares one deadline; callbacks not started by then are skipped.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{watch, OnceCell};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::error::{ShutdownError, ShutdownPhase};

type Callback = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct Registered {
    name: String,
    callback: Callback,
}

/// Outcome of the (single) shutdown sequence.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ShutdownReport {
    pub reason: String,
    /// Callbacks that returned `Ok`, in invocation order.
    pub completed: Vec<String>,
    /// `(name, error)` for callbacks that failed, panicked or ran past the deadline.
    pub failed: Vec<(String, String)>,
    /// Callbacks never started because the deadline had passed.
    pub skipped: Vec<String>,
    pub elapsed_ms: u64,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }
}

pub struct ShutdownManager {
    phase: watch::Sender<ShutdownPhase>,
    callbacks: Mutex<Vec<Registered>>,
    report: OnceCell<ShutdownReport>,
    timeout: Duration,
}

impl ShutdownManager {
    pub fn new(timeout: Duration) -> Self {
        let (phase, _) = watch::channel(ShutdownPhase::Uninitialized);
        Self {
            phase,
            callbacks: Mutex::new(Vec::new()),
            report: OnceCell::new(),
            timeout,
        }
    }

    /// Move `uninitialized -> active`. Returns `true` only for the call that
    /// performed the transition.
    pub fn initialize(&self) -> bool {
        let initialized = self.phase.send_if_modified(|phase| {
            if *phase == ShutdownPhase::Uninitialized {
                *phase = ShutdownPhase::Active;
                true
            } else {
                false
            }
        });
        if initialized {
            info!(timeout_ms = self.timeout.as_millis() as u64, "shutdown manager active");
        }
        initialized
    }

    pub fn state(&self) -> ShutdownPhase {
        *self.phase.borrow()
    }

    pub fn is_shutting_down(&self) -> bool {
        matches!(
            self.state(),
            ShutdownPhase::ShuttingDown | ShutdownPhase::Terminated
        )
    }

    pub fn callback_count(&self) -> usize {
        self.lock_callbacks().len()
    }

    /// Append a teardown callback. Only valid while `active`.
    pub fn register<F, Fut>(&self, name: impl Into<String>, callback: F) -> Result<(), ShutdownError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        let mut callbacks = self.lock_callbacks();

        let state = self.state();
        if state != ShutdownPhase::Active {
            warn!(callback = %name, state = %state, "rejected shutdown callback registration");
            return Err(ShutdownError::NotActive { state });
        }

        callbacks.push(Registered {
            name,
            callback: Arc::new(move || callback().boxed()),
        });
        Ok(())
    }

    /// Run every registered callback once.
    ///
    /// Only the first call does any work; every call returns that run's report.
    pub async fn trigger(&self, reason: &str) -> ShutdownReport {
        self.report
            .get_or_init(|| self.run_callbacks(reason.to_string()))
            .await
            .clone()
    }

    /// Resolve once the shutdown sequence has finished.
    pub async fn wait_terminated(&self) {
        let mut rx = self.phase.subscribe();
        let _ = rx.wait_for(|phase| *phase == ShutdownPhase::Terminated).await;
    }

    async fn run_callbacks(&self, reason: String) -> ShutdownReport {
        self.phase.send_replace(ShutdownPhase::ShuttingDown);
        let callbacks = std::mem::take(&mut *self.lock_callbacks());

        info!(reason = %reason, callbacks = callbacks.len(), "shutdown started");

        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut report = ShutdownReport {
            reason,
            ..Default::default()
        };

        for Registered { name, callback } in callbacks {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(callback = %name, "shutdown deadline passed, skipping callback");
                report.skipped.push(name);
                continue;
            }

            let run = AssertUnwindSafe(callback()).catch_unwind();
            match tokio::time::timeout(remaining, run).await {
                Ok(Ok(Ok(()))) => {
                    info!(callback = %name, "shutdown callback completed");
                    report.completed.push(name);
                }
                Ok(Ok(Err(e))) => {
                    error!(callback = %name, error = %e, "shutdown callback failed");
                    report.failed.push((name, format!("{:#}", e)));
                }
                Ok(Err(_)) => {
                    error!(callback = %name, "shutdown callback panicked");
                    report.failed.push((name, "callback panicked".to_string()));
                }
                Err(_) => {
                    error!(callback = %name, "shutdown callback exceeded the deadline");
                    report.failed.push((name, "deadline exceeded".to_string()));
                }
            }
        }

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        self.phase.send_replace(ShutdownPhase::Terminated);

        info!(
            completed = report.completed.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            elapsed_ms = report.elapsed_ms,
            "shutdown finished"
        );
        report
    }

    fn lock_callbacks(&self) -> MutexGuard<'_, Vec<Registered>> {
        match self.callbacks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn push(log: &Arc<Mutex<Vec<String>>>, entry: &str) {
        log.lock().unwrap().push(entry.to_string());
    }

    #[tokio::test]
    async fn test_initialize_is_one_shot() {
        let manager = ShutdownManager::new(Duration::from_secs(1));
        assert_eq!(manager.state(), ShutdownPhase::Uninitialized);
        assert!(manager.initialize());
        assert!(!manager.initialize());
        assert_eq!(manager.state(), ShutdownPhase::Active);
    }

    #[tokio::test]
    async fn test_register_requires_active() {
        let manager = ShutdownManager::new(Duration::from_secs(1));
        let result = manager.register("early", || async { Ok(()) });
        assert_eq!(
            result,
            Err(ShutdownError::NotActive {
                state: ShutdownPhase::Uninitialized
            })
        );

        manager.initialize();
        manager.register("ok", || async { Ok(()) }).unwrap();
        manager.trigger("test").await;

        let late = manager.register("late", || async { Ok(()) });
        assert!(matches!(late, Err(ShutdownError::NotActive { .. })));
    }

    #[tokio::test]
    async fn test_callbacks_run_in_order_despite_slow_and_failing() {
        let manager = ShutdownManager::new(Duration::from_secs(5));
        manager.initialize();
        let log = recorder();

        let a = log.clone();
        manager
            .register("a", move || {
                let a = a.clone();
                async move {
                    push(&a, "a");
                    Ok(())
                }
            })
            .unwrap();
        let b = log.clone();
        manager
            .register("b", move || {
                let b = b.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    push(&b, "b");
                    anyhow::bail!("b could not close")
                }
            })
            .unwrap();
        let c = log.clone();
        manager
            .register("c", move || {
                let c = c.clone();
                async move {
                    push(&c, "c");
                    Ok(())
                }
            })
            .unwrap();

        let report = manager.trigger("SIGTERM").await;

        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(report.completed, vec!["a", "c"]);
        assert_eq!(
            report.failed,
            vec![("b".to_string(), "b could not close".to_string())]
        );
        assert_eq!(manager.state(), ShutdownPhase::Terminated);
    }

    #[tokio::test]
    async fn test_trigger_is_idempotent() {
        let manager = ShutdownManager::new(Duration::from_secs(1));
        manager.initialize();
        let log = recorder();
        let entry = log.clone();
        manager
            .register("once", move || {
                let entry = entry.clone();
                async move {
                    push(&entry, "ran");
                    Ok(())
                }
            })
            .unwrap();

        let (first, second) = tokio::join!(manager.trigger("SIGINT"), manager.trigger("SIGTERM"));
        let third = manager.trigger("explicit").await;

        assert_eq!(log.lock().unwrap().len(), 1);
        assert_eq!(first, second);
        assert_eq!(first, third);
        assert_eq!(third.reason, "SIGINT");
    }

    #[tokio::test]
    async fn test_panicking_callback_is_isolated() {
        let manager = ShutdownManager::new(Duration::from_secs(1));
        manager.initialize();
        manager
            .register("boom", || async {
                let explode = true;
                if explode {
                    panic!("teardown exploded");
                }
                Ok(())
            })
            .unwrap();
        manager.register("after", || async { Ok(()) }).unwrap();

        let report = manager.trigger("test").await;
        assert_eq!(report.completed, vec!["after"]);
        assert_eq!(report.failed[0].0, "boom");
    }

    #[tokio::test]
    async fn test_deadline_skips_remaining_callbacks() {
        let manager = ShutdownManager::new(Duration::from_millis(50));
        manager.initialize();
        manager
            .register("stuck", || async {
                std::future::pending::<()>().await;
                Ok(())
            })
            .unwrap();
        manager.register("never", || async { Ok(()) }).unwrap();

        let report = manager.trigger("test").await;
        assert_eq!(report.failed[0].0, "stuck");
        assert_eq!(report.skipped, vec!["never"]);
        assert!(!report.is_clean());
    }

    #[tokio::test]
    async fn test_wait_terminated_resolves_after_trigger() {
        let manager = Arc::new(ShutdownManager::new(Duration::from_secs(1)));
        manager.initialize();

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.wait_terminated().await })
        };
        manager.trigger("test").await;
        waiter.await.unwrap();
        assert!(manager.is_shutting_down());
    }
}
