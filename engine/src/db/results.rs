/// Status record persistence
///
/// Upserts run read-merge-write inside one transaction, serialized per store
/// so concurrent writers for the same session never interleave a merge.
/// All queries use bound parameters.
use crate::status::{now_millis, Phase, StatusRecord, StatusStore, StatusUpdate};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sdk::errors::PipelineError;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;
use tracing::debug;

const SELECT_COLUMNS: &str = "session_id, prompt, plan, step_outputs, final_result, status, \
                              error_detail, created_at, updated_at";

/// sqlite-backed [`StatusStore`]
pub struct SqliteStatusStore {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

impl SqliteStatusStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Mutex::new(()),
        }
    }

    async fn upsert_inner(&self, session_id: &str, update: &StatusUpdate) -> Result<StatusRecord> {
        let _serialized = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let query = format!("SELECT {SELECT_COLUMNS} FROM results WHERE session_id = ?");
        let existing = sqlx::query(&query)
            .bind(session_id)
            .fetch_optional(&mut *tx)
            .await
            .context("Failed to load status record")?
            .map(|row| record_from_row(&row))
            .transpose()?;

        let now = now_millis();
        let record = match existing {
            None => {
                let mut record = StatusRecord::new(session_id, now);
                record.merge(update, now);
                sqlx::query(
                    "INSERT INTO results (session_id, prompt, plan, step_outputs, final_result, \
                     status, error_detail, created_at, updated_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&record.session_id)
                .bind(&record.prompt)
                .bind(&record.plan)
                .bind(&record.step_outputs)
                .bind(&record.final_result)
                .bind(record.status.to_string())
                .bind(&record.error_detail)
                .bind(record.created_at)
                .bind(record.updated_at)
                .execute(&mut *tx)
                .await
                .context("Failed to insert status record")?;
                debug!(session_id = %session_id, status = %record.status, "status record created");
                record
            }
            Some(mut record) => {
                if record.merge(update, now) {
                    sqlx::query(
                        "UPDATE results SET prompt = ?, plan = ?, step_outputs = ?, \
                         final_result = ?, status = ?, error_detail = ?, updated_at = ? \
                         WHERE session_id = ?",
                    )
                    .bind(&record.prompt)
                    .bind(&record.plan)
                    .bind(&record.step_outputs)
                    .bind(&record.final_result)
                    .bind(record.status.to_string())
                    .bind(&record.error_detail)
                    .bind(record.updated_at)
                    .bind(&record.session_id)
                    .execute(&mut *tx)
                    .await
                    .context("Failed to update status record")?;
                    debug!(session_id = %session_id, status = %record.status, "status record updated");
                }
                record
            }
        };

        tx.commit().await.context("Failed to commit status record")?;
        Ok(record)
    }

    async fn get_inner(&self, session_id: &str) -> Result<Option<StatusRecord>> {
        let query = format!("SELECT {SELECT_COLUMNS} FROM results WHERE session_id = ?");
        sqlx::query(&query)
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load status record")?
            .map(|row| record_from_row(&row))
            .transpose()
    }

    async fn recent_inner(&self, limit: usize) -> Result<Vec<StatusRecord>> {
        let query = format!(
            "SELECT {SELECT_COLUMNS} FROM results ORDER BY updated_at DESC, created_at DESC LIMIT ?"
        );
        let rows = sqlx::query(&query)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .context("Failed to list status records")?;

        rows.iter().map(record_from_row).collect()
    }
}

fn record_from_row(row: &SqliteRow) -> Result<StatusRecord> {
    let status: String = row.try_get("status")?;
    let status: Phase = status
        .parse()
        .map_err(|e| anyhow!("corrupt status column: {}", e))?;

    Ok(StatusRecord {
        session_id: row.try_get("session_id")?,
        prompt: row.try_get("prompt")?,
        plan: row.try_get("plan")?,
        step_outputs: row.try_get("step_outputs")?,
        final_result: row.try_get("final_result")?,
        status,
        error_detail: row.try_get("error_detail")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn persistence(err: anyhow::Error) -> PipelineError {
    PipelineError::Persistence(format!("{:#}", err))
}

#[async_trait]
impl StatusStore for SqliteStatusStore {
    async fn upsert(
        &self,
        session_id: &str,
        update: StatusUpdate,
    ) -> Result<StatusRecord, PipelineError> {
        self.upsert_inner(session_id, &update)
            .await
            .map_err(persistence)
    }

    async fn get(&self, session_id: &str) -> Result<Option<StatusRecord>, PipelineError> {
        self.get_inner(session_id).await.map_err(persistence)
    }

    async fn recent(&self, limit: usize) -> Result<Vec<StatusRecord>, PipelineError> {
        self.recent_inner(limit).await.map_err(persistence)
    }
}
