//! Process-wide wiring of the job subsystem.
//!
//! [`JobRuntime`] owns one of each service and performs startup exactly once,
//! whether it is triggered by the process entrypoint or, as a fallback, by
//! the first request that needs it.
//!
//! ```text
//! start() / ensure_started()          (one shot)
//!     ├─► shutdown.initialize()
//!     ├─► install signal handlers       (optional)
//!     ├─► register teardown: [stop cleanup, drain supervisor, close store]
//!     ├─► recovery, if stale batches exist   (caller waits ≤ recovery.timeout)
//!     └─► cleanup.start()
//! ```
//!
//! Resumers must be registered (see [`JobRuntime::sync_service`]) before
//! startup so recovery can find them.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::cleanup::CleanupService;
use crate::config::MirrorJobsConfig;
use crate::error::RecoveryError;
use crate::executor::BatchExecutor;
use crate::recovery::{RecoveryManager, RecoveryOptions};
use crate::shutdown::{ShutdownManager, ShutdownReport};
use crate::signals::setup_signal_handlers;
use crate::supervisor::JobSupervisor;
use crate::sync::{ConfigSource, RepositorySource, RepositorySyncer, SyncService};

/// What the one-shot startup did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StartupReport {
    pub signal_handlers_installed: bool,
    pub recovery_needed: bool,
    /// `None` when recovery was not needed or is still running.
    pub recovery_result: Option<bool>,
    pub recovery_timed_out: bool,
    pub cleanup_started: bool,
}

impl StartupReport {
    /// Startup finished but recovery did not fully succeed in time.
    pub fn is_degraded(&self) -> bool {
        self.recovery_needed && self.recovery_result != Some(true)
    }
}

pub struct JobRuntime {
    config: MirrorJobsConfig,
    store: Arc<dyn CheckpointStore>,
    executor: BatchExecutor,
    supervisor: JobSupervisor,
    recovery: Arc<RecoveryManager>,
    cleanup: Arc<CleanupService>,
    shutdown: Arc<ShutdownManager>,
    started: OnceCell<StartupReport>,
}

impl JobRuntime {
    pub fn new(store: Arc<dyn CheckpointStore>, config: MirrorJobsConfig) -> Self {
        Self {
            executor: BatchExecutor::new(store.clone()),
            supervisor: JobSupervisor::new(store.clone()),
            recovery: Arc::new(RecoveryManager::new(store.clone(), &config.recovery)),
            cleanup: Arc::new(CleanupService::new(store.clone(), config.cleanup.clone())),
            shutdown: Arc::new(ShutdownManager::new(config.shutdown.timeout)),
            started: OnceCell::new(),
            store,
            config,
        }
    }

    pub fn config(&self) -> &MirrorJobsConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    pub fn executor(&self) -> &BatchExecutor {
        &self.executor
    }

    pub fn supervisor(&self) -> &JobSupervisor {
        &self.supervisor
    }

    pub fn recovery(&self) -> &RecoveryManager {
        &self.recovery
    }

    pub fn cleanup(&self) -> &CleanupService {
        &self.cleanup
    }

    pub fn shutdown_manager(&self) -> &Arc<ShutdownManager> {
        &self.shutdown
    }

    /// Build the sync request service and register it as the `"sync"` resumer.
    pub fn sync_service(
        &self,
        configs: Arc<dyn ConfigSource>,
        repositories: Arc<dyn RepositorySource>,
        syncer: Arc<dyn RepositorySyncer>,
    ) -> SyncService {
        let service = SyncService::new(
            configs,
            repositories,
            syncer,
            self.executor.clone(),
            self.supervisor.clone(),
            self.config.sync.clone(),
        );
        service.register_resumer(&self.recovery);
        service
    }

    pub fn is_started(&self) -> bool {
        self.started.initialized()
    }

    /// Run startup once. Later and concurrent calls return the first report.
    pub async fn start(&self) -> StartupReport {
        self.started.get_or_init(|| self.startup()).await.clone()
    }

    /// Request-path fallback for when the entrypoint did not call [`start`](Self::start).
    pub async fn ensure_started(&self) -> StartupReport {
        if !self.is_started() {
            debug!("job runtime not started yet, starting from request path");
        }
        self.start().await
    }

    /// Trigger shutdown explicitly.
    pub async fn shutdown(&self, reason: &str) -> ShutdownReport {
        self.shutdown.trigger(reason).await
    }

    /// Start, then wait until a signal (or an explicit call) finishes shutdown.
    pub async fn run_until_shutdown(&self) -> ShutdownReport {
        self.start().await;
        self.shutdown.wait_terminated().await;
        self.shutdown.trigger("terminated").await
    }

    async fn startup(&self) -> StartupReport {
        let mut report = StartupReport::default();

        self.shutdown.initialize();
        if self.config.shutdown.install_signal_handlers {
            report.signal_handlers_installed = setup_signal_handlers(self.shutdown.clone());
        }
        self.register_teardown();

        report.recovery_needed = match self.recovery.has_jobs_needing_recovery().await {
            Ok(needed) => needed,
            Err(e) => {
                warn!(error = %e, "could not check for interrupted batches, attempting recovery");
                true
            }
        };

        if report.recovery_needed {
            let options = RecoveryOptions::from(&self.config.recovery);
            match self
                .recovery
                .initialize_with_timeout(options, self.config.recovery.timeout)
                .await
            {
                Ok(result) => {
                    if !result {
                        warn!("recovery finished degraded");
                    }
                    report.recovery_result = Some(result);
                }
                Err(RecoveryError::Timeout(_)) => report.recovery_timed_out = true,
            }
        }

        report.cleanup_started = self.cleanup.start();

        info!(
            recovery_needed = report.recovery_needed,
            recovery_result = ?report.recovery_result,
            recovery_timed_out = report.recovery_timed_out,
            "job runtime started"
        );
        report
    }

    /// Registration order is teardown order: dependents before what they use.
    fn register_teardown(&self) {
        let cleanup = self.cleanup.clone();
        let stop_cleanup = self.shutdown.register("cleanup-service", move || {
            let cleanup = cleanup.clone();
            async move {
                cleanup.stop().await;
                Ok(())
            }
        });

        let supervisor = self.supervisor.clone();
        let drain_timeout = self.config.shutdown.drain_timeout;
        let drain = self.shutdown.register("job-supervisor", move || {
            let supervisor = supervisor.clone();
            async move {
                supervisor.drain(drain_timeout).await;
                Ok(())
            }
        });

        let store = self.store.clone();
        let close_store = self.shutdown.register("checkpoint-store", move || {
            let store = store.clone();
            async move {
                store.close().await;
                Ok(())
            }
        });

        for result in [stop_cleanup, drain, close_store] {
            if let Err(e) = result {
                warn!(error = %e, "failed to register teardown callback");
            }
        }
    }
}
