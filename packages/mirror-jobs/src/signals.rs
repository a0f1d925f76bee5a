//! OS termination signals to a single shutdown trigger.
//!
//! This module performs no teardown itself. All ordering and failure
//! handling lives in [`ShutdownManager`].

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::shutdown::{ShutdownManager, ShutdownReport};

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Install SIGINT/SIGTERM handling once per process.
///
/// Returns `false` if handlers were already installed. Must be called from
/// within a tokio runtime.
pub fn setup_signal_handlers(manager: Arc<ShutdownManager>) -> bool {
    if INSTALLED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        debug!("signal handlers already installed");
        return false;
    }

    tokio::spawn(forward_signal(shutdown_signal(), manager));

    info!("signal handlers installed");
    true
}

/// Wait for `signal` and run shutdown with the signal name as the reason.
pub async fn forward_signal<S>(signal: S, manager: Arc<ShutdownManager>) -> ShutdownReport
where
    S: Future<Output = &'static str>,
{
    let signal = signal.await;
    info!(signal, "termination signal received");
    manager.trigger(signal).await
}

/// Resolve with the name of the first termination signal received.
pub async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => "SIGINT",
            Err(e) => {
                error!(error = %e, "failed to listen for ctrl-c");
                std::future::pending().await
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                "SIGTERM"
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<&'static str>();

    tokio::select! {
        signal = ctrl_c => signal,
        signal = terminate => signal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use crate::error::ShutdownPhase;

    #[tokio::test]
    async fn test_handlers_install_once() {
        let manager = Arc::new(ShutdownManager::new(Duration::from_secs(1)));
        manager.initialize();

        assert!(setup_signal_handlers(manager.clone()));
        assert!(!setup_signal_handlers(manager.clone()));

        // Installing does not trigger anything.
        assert_eq!(manager.state(), ShutdownPhase::Active);
    }

    #[tokio::test]
    async fn test_signal_triggers_shutdown_once() {
        let manager = Arc::new(ShutdownManager::new(Duration::from_secs(1)));
        manager.initialize();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        manager
            .register("store", move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel::<&'static str>();
        let forwarding = tokio::spawn(forward_signal(
            async move { rx.await.unwrap_or("closed") },
            manager.clone(),
        ));

        tokio::task::yield_now().await;
        assert_eq!(manager.state(), ShutdownPhase::Active);

        tx.send("SIGTERM").unwrap();
        let report = forwarding.await.unwrap();
        assert_eq!(report.reason, "SIGTERM");
        assert_eq!(report.completed, vec!["store".to_string()]);
        assert_eq!(manager.state(), ShutdownPhase::Terminated);

        // A second signal observes the first run.
        let again = forward_signal(async { "SIGINT" }, manager.clone()).await;
        assert_eq!(again.reason, "SIGTERM");
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
