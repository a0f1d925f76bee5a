//! Shared helpers for the integration tests.
//!
//! Everything runs against the in-memory checkpoint store and the scripted
//! fakes from `mirror_jobs::testing`.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use mirror_jobs::testing::{init_test_tracing, repository, FakeRepositories, ScriptedSyncer};
use mirror_jobs::{
    async_trait, operation_fn, Backoff, Batch, BatchHooks, BatchId, BatchOptions,
    CheckpointStore, InMemoryCheckpointStore, ItemOperation, ItemSource, ItemState, MirrorConfig,
    Repository, RepositorySource, RepositorySyncer,
};

pub fn setup() -> Arc<InMemoryCheckpointStore> {
    init_test_tracing();
    Arc::new(InMemoryCheckpointStore::new())
}

pub fn repositories(count: usize) -> Vec<Repository> {
    (1..=count).map(repository).collect()
}

pub fn mirror_config() -> MirrorConfig {
    MirrorConfig {
        user_id: "user-1".to_string(),
        source_token: Some("ghp_test".to_string()),
        destination_url: Some("https://gitea.local".to_string()),
        destination_token: None,
    }
}

/// Operation that runs `syncer` for each repository.
pub fn sync_operation(syncer: Arc<ScriptedSyncer>) -> Arc<dyn ItemOperation<Repository, Repository>> {
    let config = mirror_config();
    operation_fn(move |repo: Repository| {
        let syncer = syncer.clone();
        let config = config.clone();
        async move {
            syncer.sync_repository(&config, &repo).await?;
            Ok(repo)
        }
    })
}

pub fn hooks() -> BatchHooks<Repository, Repository> {
    BatchHooks::new(|r: &Repository| r.id.clone(), |r: &Repository| r.name.clone())
}

pub fn options(concurrency_limit: usize, max_retries: u32) -> BatchOptions {
    BatchOptions::builder()
        .concurrency_limit(concurrency_limit)
        .max_retries(max_retries)
        .backoff(Backoff::Fixed(Duration::from_millis(5)))
        .checkpoint_interval(1)
        .build()
}

/// Item source backed by the fake repository list.
pub struct FakeItems(pub Arc<FakeRepositories>);

#[async_trait]
impl ItemSource<Repository> for FakeItems {
    async fn load_items(&self, _batch: &Batch, item_ids: &[String]) -> anyhow::Result<Vec<Repository>> {
        self.0.find_repositories(item_ids).await
    }
}

pub async fn count_in_state(store: &InMemoryCheckpointStore, batch_id: BatchId, state: ItemState) -> usize {
    store
        .load_outcomes(batch_id)
        .await
        .map(|outcomes| outcomes.iter().filter(|o| o.state == state).count())
        .unwrap_or(0)
}

/// Poll `check` every few milliseconds until it holds or five seconds pass.
pub async fn wait_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

/// Make a batch look abandoned by a crashed process.
pub fn backdate(store: &InMemoryCheckpointStore, batch_id: BatchId) {
    store
        .set_last_checkpoint(batch_id, Utc::now() - chrono::Duration::hours(1))
        .unwrap();
}
