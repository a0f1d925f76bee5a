//! PostgreSQL checkpoint store.
//!
//! Outcome writes lock the affected item rows (`FOR UPDATE`) and validate the
//! transition in Rust before updating, so concurrent writers for one item are
//! serialized by the database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::debug;

use super::{ensure_unique_items, CheckpointStore, PurgeReport, ABANDONED_AT};
use crate::error::StoreError;
use crate::model::{Batch, BatchId, BatchStatus, ItemOutcome, ItemRef, ItemState};

pub struct PostgresCheckpointStore {
    pool: PgPool,
}

impl PostgresCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and run the bundled migrations.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn load_items(&self, batch_id: BatchId) -> Result<Vec<ItemOutcome>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT item_id, item_name, attempt, state, last_error, updated_at
            FROM mirror_batch_items
            WHERE batch_id = $1
            ORDER BY position
            "#,
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(outcome_from_row).collect()
    }

    async fn batch_from_row(&self, row: &PgRow) -> Result<Batch, StoreError> {
        let batch_id: BatchId = row.try_get("batch_id")?;
        let status: String = row.try_get("status")?;
        let items = self
            .load_items(batch_id)
            .await?
            .into_iter()
            .map(|o| ItemRef::new(o.item_id, o.item_name))
            .collect();

        Ok(Batch {
            batch_id,
            job_type: row.try_get("job_type")?,
            owner_id: row.try_get("owner_id")?,
            items,
            created_at: row.try_get("created_at")?,
            last_checkpoint_at: row.try_get("last_checkpoint_at")?,
            status: status.parse::<BatchStatus>()?,
        })
    }
}

fn outcome_from_row(row: &PgRow) -> Result<ItemOutcome, StoreError> {
    let attempt: i32 = row.try_get("attempt")?;
    let state: String = row.try_get("state")?;
    Ok(ItemOutcome {
        item_id: row.try_get("item_id")?,
        item_name: row.try_get("item_name")?,
        attempt: attempt.max(0) as u32,
        state: state.parse::<ItemState>()?,
        last_error: row.try_get("last_error")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    async fn create_batch(&self, batch: &Batch, outcomes: &[ItemOutcome]) -> Result<(), StoreError> {
        ensure_unique_items(batch.batch_id, outcomes)?;
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO mirror_batches (batch_id, job_type, owner_id, status, created_at, last_checkpoint_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (batch_id) DO NOTHING
            "#,
        )
        .bind(batch.batch_id)
        .bind(&batch.job_type)
        .bind(&batch.owner_id)
        .bind(batch.status.as_str())
        .bind(batch.created_at)
        .bind(batch.last_checkpoint_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            return Err(StoreError::BatchExists {
                batch_id: batch.batch_id,
            });
        }

        for (position, outcome) in outcomes.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO mirror_batch_items
                    (batch_id, position, item_id, item_name, attempt, state, last_error, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(batch.batch_id)
            .bind(position as i32)
            .bind(&outcome.item_id)
            .bind(&outcome.item_name)
            .bind(outcome.attempt as i32)
            .bind(outcome.state.as_str())
            .bind(&outcome.last_error)
            .bind(outcome.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn load_batch(&self, batch_id: BatchId) -> Result<Option<Batch>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT batch_id, job_type, owner_id, status, created_at, last_checkpoint_at
            FROM mirror_batches
            WHERE batch_id = $1
            "#,
        )
        .bind(batch_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.batch_from_row(&row).await?)),
            None => Ok(None),
        }
    }

    async fn load_outcomes(&self, batch_id: BatchId) -> Result<Vec<ItemOutcome>, StoreError> {
        if self.load_batch(batch_id).await?.is_none() {
            return Err(StoreError::BatchNotFound(batch_id));
        }
        self.load_items(batch_id).await
    }

    async fn record_outcomes(
        &self,
        batch_id: BatchId,
        outcomes: &[ItemOutcome],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        for outcome in outcomes {
            let row = sqlx::query(
                r#"
                SELECT item_id, item_name, attempt, state, last_error, updated_at
                FROM mirror_batch_items
                WHERE batch_id = $1 AND item_id = $2
                FOR UPDATE
                "#,
            )
            .bind(batch_id)
            .bind(&outcome.item_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::ItemNotFound {
                batch_id,
                item_id: outcome.item_id.clone(),
            })?;

            let previous = outcome_from_row(&row)?;
            if !outcome.follows(&previous) {
                return Err(StoreError::ItemConflict {
                    item_id: outcome.item_id.clone(),
                    stored: previous.state,
                    stored_attempt: previous.attempt,
                    attempted: outcome.state,
                    attempted_attempt: outcome.attempt,
                });
            }

            sqlx::query(
                r#"
                UPDATE mirror_batch_items
                SET attempt = $1,
                    state = $2,
                    last_error = $3,
                    updated_at = $4
                WHERE batch_id = $5 AND item_id = $6
                "#,
            )
            .bind(outcome.attempt as i32)
            .bind(outcome.state.as_str())
            .bind(&outcome.last_error)
            .bind(outcome.updated_at)
            .bind(batch_id)
            .bind(&outcome.item_id)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("UPDATE mirror_batches SET last_checkpoint_at = NOW() WHERE batch_id = $1")
            .bind(batch_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn heartbeat(&self, batch_id: BatchId) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE mirror_batches
            SET last_checkpoint_at = NOW()
            WHERE batch_id = $1 AND status = 'running'
            "#,
        )
        .bind(batch_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 && self.load_batch(batch_id).await?.is_none() {
            return Err(StoreError::BatchNotFound(batch_id));
        }
        Ok(())
    }

    async fn set_status(&self, batch_id: BatchId, status: BatchStatus) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let current: String = sqlx::query_scalar(
            "SELECT status FROM mirror_batches WHERE batch_id = $1 FOR UPDATE",
        )
        .bind(batch_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::BatchNotFound(batch_id))?;
        let current = current.parse::<BatchStatus>()?;

        if !current.can_transition_to(status) {
            return Err(StoreError::StatusConflict {
                batch_id,
                from: current,
                to: status,
            });
        }

        let stamp_finish = status.is_terminal() && current != status;
        sqlx::query(
            r#"
            UPDATE mirror_batches
            SET status = $1,
                last_checkpoint_at = CASE WHEN $2 THEN NOW() ELSE last_checkpoint_at END
            WHERE batch_id = $3
            "#,
        )
        .bind(status.as_str())
        .bind(stamp_finish)
        .bind(batch_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn mark_interrupted(&self, batch_id: BatchId) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE mirror_batches
            SET status = 'interrupted',
                last_checkpoint_at = $1
            WHERE batch_id = $2 AND status IN ('running', 'interrupted')
            "#,
        )
        .bind(ABANDONED_AT)
        .bind(batch_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return match self.load_batch(batch_id).await? {
                Some(batch) => Err(StoreError::StatusConflict {
                    batch_id,
                    from: batch.status,
                    to: BatchStatus::Interrupted,
                }),
                None => Err(StoreError::BatchNotFound(batch_id)),
            };
        }
        debug!(batch_id = %batch_id, "batch released for recovery");
        Ok(())
    }

    async fn has_recovery_candidates(&self, stale_before: DateTime<Utc>) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM mirror_batches
                WHERE status IN ('running', 'interrupted')
                  AND last_checkpoint_at <= $1
            )
            "#,
        )
        .bind(stale_before)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn find_recovery_candidates(
        &self,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<Batch>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT batch_id, job_type, owner_id, status, created_at, last_checkpoint_at
            FROM mirror_batches
            WHERE status IN ('running', 'interrupted')
              AND last_checkpoint_at <= $1
            ORDER BY created_at
            "#,
        )
        .bind(stale_before)
        .fetch_all(&self.pool)
        .await?;

        let mut batches = Vec::with_capacity(rows.len());
        for row in &rows {
            batches.push(self.batch_from_row(row).await?);
        }
        Ok(batches)
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<PurgeReport, StoreError> {
        let mut tx = self.pool.begin().await?;

        let outcomes_removed = sqlx::query(
            r#"
            DELETE FROM mirror_batch_items
            WHERE batch_id IN (
                SELECT batch_id FROM mirror_batches
                WHERE status IN ('completed', 'completed_with_errors')
                  AND last_checkpoint_at < $1
            )
            "#,
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let batches_removed = sqlx::query(
            r#"
            DELETE FROM mirror_batches
            WHERE status IN ('completed', 'completed_with_errors')
              AND last_checkpoint_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        debug!(batches_removed, outcomes_removed, "purged terminal batches");
        Ok(PurgeReport {
            batches_removed,
            outcomes_removed,
        })
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
