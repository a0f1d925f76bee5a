use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use dotenvy::dotenv;

use crate::executor::{Backoff, HEARTBEAT_INTERVAL};

const SECS_PER_DAY: u64 = 24 * 3600;

/// `days` as a duration, or `None` if it does not fit.
pub fn days(days: u64) -> Option<Duration> {
    days.checked_mul(SECS_PER_DAY).map(Duration::from_secs)
}

/// Job subsystem configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct MirrorJobsConfig {
    pub database_url: Option<String>,
    pub sync: SyncDefaults,
    pub recovery: RecoveryConfig,
    pub cleanup: CleanupConfig,
    pub shutdown: ShutdownConfig,
}

/// Defaults applied to batches started by the sync request path.
#[derive(Debug, Clone)]
pub struct SyncDefaults {
    pub concurrency_limit: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub checkpoint_interval: usize,
}

impl Default for SyncDefaults {
    fn default() -> Self {
        Self {
            concurrency_limit: 5,
            max_retries: 2,
            retry_delay: Duration::from_millis(2000),
            checkpoint_interval: 1,
        }
    }
}

impl SyncDefaults {
    pub fn backoff(&self) -> Backoff {
        Backoff::Fixed(self.retry_delay)
    }
}

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// A running batch without a checkpoint for this long is considered abandoned.
    pub stale_after: Duration,
    /// How long a caller blocks on recovery before continuing degraded.
    pub timeout: Duration,
    /// Window in which a repeated attempt reports the previous result instead.
    pub recent_attempt_window: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(600),
            timeout: Duration::from_secs(15),
            recent_attempt_window: Duration::from_secs(30),
            max_retries: 2,
            retry_delay: Duration::from_millis(3000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CleanupConfig {
    pub interval: Duration,
    /// Terminal batches older than this are removed.
    pub retention: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            retention: Duration::from_secs(7 * SECS_PER_DAY),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Deadline for the whole teardown sequence.
    pub timeout: Duration,
    /// How long teardown waits for running batches before abandoning them.
    pub drain_timeout: Duration,
    /// Install SIGINT/SIGTERM handlers at startup.
    pub install_signal_handlers: bool,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(20),
            install_signal_handlers: true,
        }
    }
}

impl Default for MirrorJobsConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            sync: SyncDefaults::default(),
            recovery: RecoveryConfig::default(),
            cleanup: CleanupConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

impl MirrorJobsConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let sync_defaults = SyncDefaults::default();
        let recovery_defaults = RecoveryConfig::default();
        let cleanup_defaults = CleanupConfig::default();
        let shutdown_defaults = ShutdownConfig::default();

        let retention_days = parse_var::<u64>("CLEANUP_RETENTION_DAYS", 7)?;

        let config = Self {
            database_url: env::var("DATABASE_URL").ok(),
            sync: SyncDefaults {
                concurrency_limit: parse_var(
                    "SYNC_CONCURRENCY_LIMIT",
                    sync_defaults.concurrency_limit,
                )?,
                max_retries: parse_var("SYNC_MAX_RETRIES", sync_defaults.max_retries)?,
                retry_delay: Duration::from_millis(parse_var(
                    "SYNC_RETRY_DELAY_MS",
                    sync_defaults.retry_delay.as_millis() as u64,
                )?),
                checkpoint_interval: parse_var(
                    "SYNC_CHECKPOINT_INTERVAL",
                    sync_defaults.checkpoint_interval,
                )?,
            },
            recovery: RecoveryConfig {
                stale_after: Duration::from_secs(parse_var(
                    "RECOVERY_STALE_AFTER_SECS",
                    recovery_defaults.stale_after.as_secs(),
                )?),
                timeout: Duration::from_secs(parse_var(
                    "RECOVERY_TIMEOUT_SECS",
                    recovery_defaults.timeout.as_secs(),
                )?),
                recent_attempt_window: Duration::from_secs(parse_var(
                    "RECOVERY_RECENT_ATTEMPT_WINDOW_SECS",
                    recovery_defaults.recent_attempt_window.as_secs(),
                )?),
                ..recovery_defaults
            },
            cleanup: CleanupConfig {
                interval: Duration::from_secs(parse_var(
                    "CLEANUP_INTERVAL_SECS",
                    cleanup_defaults.interval.as_secs(),
                )?),
                retention: days(retention_days)
                    .context("CLEANUP_RETENTION_DAYS is too large")?,
            },
            shutdown: ShutdownConfig {
                timeout: Duration::from_secs(parse_var(
                    "SHUTDOWN_TIMEOUT_SECS",
                    shutdown_defaults.timeout.as_secs(),
                )?),
                drain_timeout: Duration::from_secs(parse_var(
                    "SHUTDOWN_DRAIN_TIMEOUT_SECS",
                    shutdown_defaults.drain_timeout.as_secs(),
                )?),
                ..shutdown_defaults
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values the job subsystem cannot run with.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.sync.concurrency_limit >= 1,
            "SYNC_CONCURRENCY_LIMIT must be at least 1"
        );
        ensure!(
            self.sync.checkpoint_interval >= 1,
            "SYNC_CHECKPOINT_INTERVAL must be at least 1"
        );
        ensure!(
            !self.cleanup.interval.is_zero(),
            "CLEANUP_INTERVAL_SECS must be at least 1"
        );
        ensure!(
            self.shutdown.drain_timeout < self.shutdown.timeout,
            "SHUTDOWN_DRAIN_TIMEOUT_SECS ({}s) must be below SHUTDOWN_TIMEOUT_SECS ({}s)",
            self.shutdown.drain_timeout.as_secs(),
            self.shutdown.timeout.as_secs()
        );
        // A live batch may go one heartbeat without a checkpoint.
        ensure!(
            self.recovery.stale_after >= HEARTBEAT_INTERVAL * 2,
            "RECOVERY_STALE_AFTER_SECS must be at least {}s",
            (HEARTBEAT_INTERVAL * 2).as_secs()
        );
        Ok(())
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a valid number", name)),
        Err(_) => Ok(default),
    }
}
