//! Test doubles for the job subsystem.
//!
//! In-process fakes for the sync collaborators plus a probe that records how
//! many operations were in flight at once. Nothing here needs a database.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::PermanentFailure;
use crate::sync::{ConfigSource, MirrorConfig, Repository, RepositorySource, RepositorySyncer};

/// Install a test-friendly tracing subscriber honoring `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ============================================================================
// Concurrency Probe
// ============================================================================

/// Counts in-flight operations and remembers the peak.
#[derive(Debug, Default)]
pub struct ConcurrencyProbe {
    current: AtomicUsize,
    peak: AtomicUsize,
}

/// Decrements the probe when dropped.
pub struct ProbeGuard<'a>(&'a ConcurrencyProbe);

impl ConcurrencyProbe {
    pub fn enter(&self) -> ProbeGuard<'_> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        ProbeGuard(self)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Collaborator Fakes
// ============================================================================

pub fn repository(id: usize) -> Repository {
    Repository {
        id: id.to_string(),
        name: format!("repo-{}", id),
        full_name: format!("octo/repo-{}", id),
        clone_url: format!("https://github.com/octo/repo-{}.git", id),
        is_private: false,
    }
}

#[derive(Default)]
pub struct FakeConfigs {
    configs: Mutex<HashMap<String, MirrorConfig>>,
}

impl FakeConfigs {
    pub fn with_token(user_id: &str) -> Self {
        let fake = Self::default();
        fake.insert(MirrorConfig {
            user_id: user_id.to_string(),
            source_token: Some("ghp_test".to_string()),
            destination_url: Some("https://gitea.local".to_string()),
            destination_token: Some("gitea_test".to_string()),
        });
        fake
    }

    pub fn with_blank_token(user_id: &str) -> Self {
        let fake = Self::default();
        fake.insert(MirrorConfig {
            user_id: user_id.to_string(),
            source_token: Some("  ".to_string()),
            destination_url: None,
            destination_token: None,
        });
        fake
    }

    pub fn insert(&self, config: MirrorConfig) {
        lock(&self.configs).insert(config.user_id.clone(), config);
    }
}

#[async_trait]
impl ConfigSource for FakeConfigs {
    async fn load_config(&self, user_id: &str) -> anyhow::Result<Option<MirrorConfig>> {
        Ok(lock(&self.configs).get(user_id).cloned())
    }
}

/// Repository lookup backed by a list; removed repositories stop resolving.
#[derive(Default)]
pub struct FakeRepositories {
    repositories: Mutex<Vec<Repository>>,
}

impl FakeRepositories {
    /// Repositories with ids `"1"..="count"`.
    pub fn with_count(count: usize) -> Self {
        Self {
            repositories: Mutex::new((1..=count).map(repository).collect()),
        }
    }

    pub fn all(&self) -> Vec<Repository> {
        lock(&self.repositories).clone()
    }

    pub fn remove(&self, id: &str) {
        lock(&self.repositories).retain(|r| r.id != id);
    }
}

#[async_trait]
impl RepositorySource for FakeRepositories {
    async fn find_repositories(&self, ids: &[String]) -> anyhow::Result<Vec<Repository>> {
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        Ok(lock(&self.repositories)
            .iter()
            .filter(|r| wanted.contains(r.id.as_str()))
            .cloned()
            .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Script {
    /// Fail this many times, then succeed.
    FailTimes(usize),
    FailAlways,
    FailPermanently,
    /// Never complete.
    Hang,
}

/// Syncer whose behavior is scripted per repository id.
#[derive(Default)]
pub struct ScriptedSyncer {
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<Vec<String>>,
    delay: Mutex<Duration>,
    probe: ConcurrencyProbe,
}

impl ScriptedSyncer {
    pub fn with_delay(delay: Duration) -> Self {
        let syncer = Self::default();
        *lock(&syncer.delay) = delay;
        syncer
    }

    pub fn fail_times(&self, id: &str, times: usize) -> &Self {
        lock(&self.scripts).insert(id.to_string(), Script::FailTimes(times));
        self
    }

    pub fn fail_always(&self, id: &str) -> &Self {
        lock(&self.scripts).insert(id.to_string(), Script::FailAlways);
        self
    }

    pub fn fail_permanently(&self, id: &str) -> &Self {
        lock(&self.scripts).insert(id.to_string(), Script::FailPermanently);
        self
    }

    pub fn hang(&self, id: &str) -> &Self {
        lock(&self.scripts).insert(id.to_string(), Script::Hang);
        self
    }

    /// Drop any script for `id`; it succeeds from now on.
    pub fn heal(&self, id: &str) -> &Self {
        lock(&self.scripts).remove(id);
        self
    }

    /// Repository ids in call order, one entry per attempt.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn calls_for(&self, id: &str) -> usize {
        lock(&self.calls).iter().filter(|c| *c == id).count()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.probe.peak()
    }
}

#[async_trait]
impl RepositorySyncer for ScriptedSyncer {
    async fn sync_repository(
        &self,
        _config: &MirrorConfig,
        repository: &Repository,
    ) -> anyhow::Result<()> {
        let _in_flight = self.probe.enter();
        let attempt = {
            let mut calls = lock(&self.calls);
            calls.push(repository.id.clone());
            calls.iter().filter(|c| **c == repository.id).count()
        };

        let delay = *lock(&self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let script = lock(&self.scripts).get(&repository.id).copied();
        match script {
            None => Ok(()),
            Some(Script::FailTimes(times)) if attempt > times => Ok(()),
            Some(Script::FailTimes(_)) | Some(Script::FailAlways) => {
                anyhow::bail!("remote returned 502 for {}", repository.full_name)
            }
            Some(Script::FailPermanently) => Err(PermanentFailure::new(format!(
                "{} no longer exists upstream",
                repository.full_name
            ))
            .into()),
            Some(Script::Hang) => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }
}
