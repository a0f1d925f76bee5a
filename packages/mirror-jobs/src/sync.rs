//! Repository sync requests.
//!
//! Validates a request, looks up the user's mirror configuration and the
//! requested repositories, then hands a `"sync"` batch to the supervisor and
//! returns immediately. Progress is observable only through logs and the
//! checkpoint store.
//!
//! The same service knows how to resume `"sync"` batches after a restart, see
//! [`SyncService::register_resumer`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::SyncDefaults;
use crate::error::JobError;
use crate::executor::{BatchExecutor, BatchHooks, BatchOptions, BatchReport, BatchSpec, ItemOperation};
use crate::model::{Batch, BatchId, RecoveryCandidate};
use crate::recovery::{BatchResumer, ExecutorResumer, ItemSource, RecoveryManager, RecoveryOptions};
use crate::supervisor::JobSupervisor;

pub const SYNC_JOB_TYPE: &str = "sync";

// ============================================================================
// Collaborator Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    pub id: String,
    pub name: String,
    pub full_name: String,
    pub clone_url: String,
    #[serde(default)]
    pub is_private: bool,
}

/// Per-user mirror settings. Only the existence of a source token is checked here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorConfig {
    pub user_id: String,
    pub source_token: Option<String>,
    pub destination_url: Option<String>,
    pub destination_token: Option<String>,
}

impl MirrorConfig {
    pub fn has_source_token(&self) -> bool {
        self.source_token
            .as_deref()
            .is_some_and(|token| !token.trim().is_empty())
    }
}

#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn load_config(&self, user_id: &str) -> anyhow::Result<Option<MirrorConfig>>;
}

#[async_trait]
pub trait RepositorySource: Send + Sync {
    /// Repositories for the ids that still exist; unknown ids are skipped.
    async fn find_repositories(&self, ids: &[String]) -> anyhow::Result<Vec<Repository>>;
}

/// Performs the actual mirror update for one repository.
#[async_trait]
pub trait RepositorySyncer: Send + Sync {
    async fn sync_repository(
        &self,
        config: &MirrorConfig,
        repository: &Repository,
    ) -> anyhow::Result<()>;
}

// ============================================================================
// Request & Response
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    #[serde(default)]
    pub user_id: String,
    pub repository_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStarted {
    pub batch_id: BatchId,
    pub repositories: Vec<Repository>,
}

#[derive(Debug, Error)]
pub enum SyncRequestError {
    #[error("userId and repositoryIds are required")]
    MissingFields,

    #[error("no repository ids provided")]
    NoRepositoryIds,

    #[error("config missing for the user or token")]
    MissingConfig,

    #[error("no repositories found for the given ids")]
    RepositoriesNotFound,

    #[error("lookup failed: {0}")]
    Lookup(#[from] anyhow::Error),

    #[error("sync defaults are unusable: {0}")]
    InvalidDefaults(#[source] JobError),

    #[error(transparent)]
    Unavailable(#[from] JobError),
}

impl SyncRequestError {
    /// HTTP status an API layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            SyncRequestError::MissingFields
            | SyncRequestError::NoRepositoryIds
            | SyncRequestError::MissingConfig => 400,
            SyncRequestError::RepositoriesNotFound => 404,
            SyncRequestError::Lookup(_) | SyncRequestError::InvalidDefaults(_) => 500,
            SyncRequestError::Unavailable(_) => 503,
        }
    }
}

// ============================================================================
// Operation
// ============================================================================

struct SyncOperation {
    syncer: Arc<dyn RepositorySyncer>,
    config: MirrorConfig,
}

#[async_trait]
impl ItemOperation<Repository, Repository> for SyncOperation {
    async fn perform(&self, repository: &Repository) -> anyhow::Result<Repository> {
        info!(repository = %repository.full_name, "starting repository sync");
        self.syncer
            .sync_repository(&self.config, repository)
            .await?;
        Ok(repository.clone())
    }
}

struct RepositoryItems(Arc<dyn RepositorySource>);

#[async_trait]
impl ItemSource<Repository> for RepositoryItems {
    async fn load_items(&self, _batch: &Batch, item_ids: &[String]) -> anyhow::Result<Vec<Repository>> {
        self.0.find_repositories(item_ids).await
    }
}

fn sync_hooks() -> BatchHooks<Repository, Repository> {
    BatchHooks::new(|r: &Repository| r.id.clone(), |r: &Repository| r.name.clone())
        .on_progress(|completed, total, result: Option<&Repository>| {
            let percent = if total == 0 { 100 } else { completed * 100 / total };
            info!(completed, total, percent, "sync progress");
            if let Some(repository) = result {
                info!(repository = %repository.name, "repository synced");
            }
        })
        .on_retry(|repository: &Repository, error, attempt| {
            warn!(
                repository = %repository.name,
                attempt,
                error = %error,
                "retrying repository sync"
            );
        })
}

// ============================================================================
// Service
// ============================================================================

#[derive(Clone)]
pub struct SyncService {
    configs: Arc<dyn ConfigSource>,
    repositories: Arc<dyn RepositorySource>,
    syncer: Arc<dyn RepositorySyncer>,
    executor: BatchExecutor,
    supervisor: JobSupervisor,
    defaults: SyncDefaults,
}

impl SyncService {
    pub fn new(
        configs: Arc<dyn ConfigSource>,
        repositories: Arc<dyn RepositorySource>,
        syncer: Arc<dyn RepositorySyncer>,
        executor: BatchExecutor,
        supervisor: JobSupervisor,
        defaults: SyncDefaults,
    ) -> Self {
        Self {
            configs,
            repositories,
            syncer,
            executor,
            supervisor,
            defaults,
        }
    }

    fn batch_options(&self) -> BatchOptions {
        BatchOptions::builder()
            .concurrency_limit(self.defaults.concurrency_limit)
            .max_retries(self.defaults.max_retries)
            .backoff(self.defaults.backoff())
            .checkpoint_interval(self.defaults.checkpoint_interval)
            .build()
    }

    async fn load_config(&self, user_id: &str) -> Result<MirrorConfig, SyncRequestError> {
        match self.configs.load_config(user_id).await? {
            Some(config) if config.has_source_token() => Ok(config),
            _ => Err(SyncRequestError::MissingConfig),
        }
    }

    /// Validate the request and start a background sync batch.
    pub async fn start_sync(&self, request: SyncRequest) -> Result<SyncStarted, SyncRequestError> {
        let user_id = request.user_id.trim().to_string();
        let ids = match request.repository_ids {
            Some(ids) if !user_id.is_empty() => ids,
            _ => return Err(SyncRequestError::MissingFields),
        };
        if ids.is_empty() {
            return Err(SyncRequestError::NoRepositoryIds);
        }

        // Checked here so a bad setting fails the request instead of the batch.
        let options = self.batch_options();
        options
            .validate()
            .map_err(SyncRequestError::InvalidDefaults)?;

        let config = self.load_config(&user_id).await?;

        let repositories = self.repositories.find_repositories(&ids).await?;
        if repositories.is_empty() {
            return Err(SyncRequestError::RepositoriesNotFound);
        }

        let spec = BatchSpec::new(SYNC_JOB_TYPE, user_id.clone());
        let batch_id = spec.batch_id;
        let operation: Arc<dyn ItemOperation<Repository, Repository>> = Arc::new(SyncOperation {
            syncer: self.syncer.clone(),
            config,
        });

        let executor = self.executor.clone();
        let items = repositories.clone();
        self.supervisor.spawn_batch(batch_id, SYNC_JOB_TYPE, async move {
            executor
                .run(spec, items, operation, options, sync_hooks())
                .await
        })?;

        info!(
            batch_id = %batch_id,
            user_id = %user_id,
            repositories = repositories.len(),
            "sync job started"
        );

        Ok(SyncStarted {
            batch_id,
            repositories,
        })
    }

    /// Let `recovery` resume interrupted `"sync"` batches through this service.
    pub fn register_resumer(&self, recovery: &RecoveryManager) {
        recovery.register_resumer(SYNC_JOB_TYPE, Arc::new(self.clone()));
    }
}

#[async_trait]
impl BatchResumer for SyncService {
    async fn resume(
        &self,
        candidate: RecoveryCandidate,
        options: &RecoveryOptions,
    ) -> Result<BatchReport, JobError> {
        let batch_id = candidate.batch.batch_id;
        let config = self
            .load_config(&candidate.batch.owner_id)
            .await
            .map_err(|e| JobError::Reload {
                batch_id,
                source: anyhow::Error::new(e),
            })?;

        let resumer = ExecutorResumer::new(
            self.executor.clone(),
            Arc::new(RepositoryItems(self.repositories.clone())),
            Arc::new(SyncOperation {
                syncer: self.syncer.clone(),
                config,
            }),
            sync_hooks(),
            self.batch_options(),
        );
        resumer.resume(candidate, options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointStore, InMemoryCheckpointStore};
    use crate::testing::{FakeConfigs, FakeRepositories, ScriptedSyncer};

    fn service(store: Arc<InMemoryCheckpointStore>, configs: FakeConfigs) -> (SyncService, JobSupervisor) {
        let supervisor = JobSupervisor::new(store.clone());
        let service = SyncService::new(
            Arc::new(configs),
            Arc::new(FakeRepositories::with_count(3)),
            Arc::new(ScriptedSyncer::default()),
            BatchExecutor::new(store),
            supervisor.clone(),
            SyncDefaults::default(),
        );
        (service, supervisor)
    }

    fn request(user_id: &str, ids: Option<Vec<&str>>) -> SyncRequest {
        SyncRequest {
            user_id: user_id.to_string(),
            repository_ids: ids.map(|ids| ids.into_iter().map(String::from).collect()),
        }
    }

    #[tokio::test]
    async fn test_request_validation() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let (service, _) = service(store, FakeConfigs::with_token("user-1"));

        let err = service.start_sync(request("", Some(vec!["1"]))).await.unwrap_err();
        assert!(matches!(err, SyncRequestError::MissingFields));
        assert_eq!(err.status_code(), 400);

        let err = service.start_sync(request("user-1", None)).await.unwrap_err();
        assert!(matches!(err, SyncRequestError::MissingFields));

        let err = service.start_sync(request("user-1", Some(vec![]))).await.unwrap_err();
        assert!(matches!(err, SyncRequestError::NoRepositoryIds));

        let err = service
            .start_sync(request("user-2", Some(vec!["1"])))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncRequestError::MissingConfig));

        let err = service
            .start_sync(request("user-1", Some(vec!["404"])))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncRequestError::RepositoriesNotFound));
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn test_blank_token_counts_as_missing_config() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let (service, _) = service(store, FakeConfigs::with_blank_token("user-1"));

        let err = service
            .start_sync(request("user-1", Some(vec!["1"])))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncRequestError::MissingConfig));
    }

    #[tokio::test]
    async fn test_start_sync_returns_before_batch_finishes() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let (service, supervisor) = service(store.clone(), FakeConfigs::with_token("user-1"));

        let started = service
            .start_sync(request("user-1", Some(vec!["1", "2", "404"])))
            .await
            .unwrap();
        assert_eq!(started.repositories.len(), 2);

        let drained = supervisor.drain(std::time::Duration::from_secs(5)).await;
        assert!(drained.completed);

        let batch = store.load_batch(started.batch_id).await.unwrap().unwrap();
        assert_eq!(batch.status, crate::model::BatchStatus::Completed);
        assert_eq!(batch.owner_id, "user-1");
        assert_eq!(batch.job_type, SYNC_JOB_TYPE);
    }

    #[tokio::test]
    async fn test_unusable_defaults_fail_the_request() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let supervisor = JobSupervisor::new(store.clone());
        let service = SyncService::new(
            Arc::new(FakeConfigs::with_token("user-1")),
            Arc::new(FakeRepositories::with_count(3)),
            Arc::new(ScriptedSyncer::default()),
            BatchExecutor::new(store.clone()),
            supervisor.clone(),
            SyncDefaults {
                concurrency_limit: 0,
                ..SyncDefaults::default()
            },
        );

        let err = service
            .start_sync(request("user-1", Some(vec!["1"])))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncRequestError::InvalidDefaults(_)));
        assert_eq!(err.status_code(), 500);
        assert_eq!(supervisor.active_count(), 0);
        assert_eq!(store.batch_count(), 0);
    }

    #[tokio::test]
    async fn test_start_sync_refused_while_draining() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let (service, supervisor) = service(store, FakeConfigs::with_token("user-1"));
        supervisor.drain(std::time::Duration::from_millis(10)).await;

        let err = service
            .start_sync(request("user-1", Some(vec!["1"])))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 503);
    }
}
