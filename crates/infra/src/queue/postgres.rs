//! Postgres-backed store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | QueueStoreError |
//! |------------|----------------------|-----------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (check constraint violation) | `23514` | `Storage` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / Io / Tls / PoolTimedOut | N/A | `Unavailable` |
//! | Other | N/A | `Storage` |
//!
//! `claim_batch` additionally treats `42883` (undefined function) as
//! [`ClaimOutcome::Unsupported`], so a database without the claim function
//! still works through the compare-and-swap fallback.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use enrichq_core::{
    ErrorEntry, ItemStatus, JobRun, JobRunId, JobRunStatus, OperationState, OperationStatus,
    ProgressDelta, QueueItem, QueueItemId, TargetId,
};
use enrichq_pipeline::{PipelineError, TargetLookup, TargetRecord};

use super::store::{JobRunStore, OperationStore, QueueStore};
use super::types::{ClaimOutcome, ClaimRequest, QueueStats, QueueStoreError, StaleRecovery};

const SCHEMA: &str = include_str!("../../migrations/0001_enrichment_queue.sql");

const ITEM_COLUMNS: &str =
    "id, target_id, status, attempts, queued_at, started_at, completed_at, last_error, force";

const OPERATION_COLUMNS: &str = "kind, status, paused, completed_count, failed_count, remaining, \
     recent_errors, message, started_at, finished_at, updated_at";

const RUN_COLUMNS: &str = "id, kind, status, continuation_count, total_items, succeeded, failed, \
     last_item_id, error, updated_fields, started_at, finished_at";

/// Postgres store for the queue, operation state, job runs and target lookups.
///
/// Every status write is a single conditional `UPDATE`, so correctness under
/// overlapping invocations comes from row-level atomicity alone.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Arc<PgPool>,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Apply the schema. Safe to run repeatedly.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), QueueStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    async fn ensure_operation(&self, kind: &str) -> Result<(), QueueStoreError> {
        sqlx::query("INSERT INTO operation_state (kind) VALUES ($1) ON CONFLICT (kind) DO NOTHING")
            .bind(kind)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_operation", e))?;
        Ok(())
    }

    async fn fetch_operation(
        &self,
        operation: &str,
        sql: &str,
        kind: &str,
    ) -> Result<OperationState, QueueStoreError> {
        let row = sqlx::query(sql)
            .bind(kind)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        to_operation(&row)
    }

    async fn conditional_update(
        &self,
        operation: &str,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<bool, QueueStoreError> {
        let result = query
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait::async_trait]
impl QueueStore for PostgresStore {
    #[instrument(skip(self), err)]
    async fn enqueue(&self, target_id: TargetId, force: bool) -> Result<QueueItem, QueueStoreError> {
        let item = QueueItem::new(target_id, force, Utc::now());
        sqlx::query(
            r#"
            INSERT INTO enrichment_queue (id, target_id, status, attempts, queued_at, force)
            VALUES ($1, $2, 'pending', 0, $3, $4)
            "#,
        )
        .bind(item.id.as_uuid())
        .bind(item.target_id.as_uuid())
        .bind(item.queued_at)
        .bind(item.force)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;
        Ok(item)
    }

    async fn get(&self, id: QueueItemId) -> Result<Option<QueueItem>, QueueStoreError> {
        let row = sqlx::query(&format!("SELECT {ITEM_COLUMNS} FROM enrichment_queue WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.as_ref().map(to_item).transpose()
    }

    #[instrument(skip(self), fields(batch_size = request.batch_size), err)]
    async fn claim_batch(&self, request: ClaimRequest) -> Result<ClaimOutcome, QueueStoreError> {
        let rows = match sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM claim_enrichment_batch($1, $2)"
        ))
        .bind(request.batch_size as i32)
        .bind(request.max_attempts as i32)
        .fetch_all(&*self.pool)
        .await
        {
            Ok(rows) => rows,
            Err(e) if is_undefined_function(&e) => return Ok(ClaimOutcome::Unsupported),
            Err(e) => return Err(map_sqlx_error("claim_batch", e)),
        };

        // RETURNING does not preserve the subquery order.
        let mut items = decode_items(&rows)?;
        items.sort_by_key(|i| (i.queued_at, i.id));
        Ok(ClaimOutcome::Claimed(items))
    }

    async fn list_pending(
        &self,
        limit: u32,
        max_attempts: u32,
    ) -> Result<Vec<QueueItem>, QueueStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ITEM_COLUMNS}
            FROM enrichment_queue
            WHERE status = 'pending' AND attempts < $2
            ORDER BY queued_at ASC
            LIMIT $1
            "#
        ))
        .bind(limit as i64)
        .bind(max_attempts as i32)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_pending", e))?;
        decode_items(&rows)
    }

    async fn try_claim(
        &self,
        id: QueueItemId,
        expected_attempts: u32,
    ) -> Result<Option<QueueItem>, QueueStoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE enrichment_queue
            SET status = 'processing', attempts = attempts + 1, started_at = now()
            WHERE id = $1 AND status = 'pending' AND attempts = $2
            RETURNING {ITEM_COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(expected_attempts as i32)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("try_claim", e))?;
        row.as_ref().map(to_item).transpose()
    }

    #[instrument(skip(self), err)]
    async fn recover_stale(
        &self,
        started_before: DateTime<Utc>,
        max_attempts: u32,
        marker: &str,
    ) -> Result<StaleRecovery, QueueStoreError> {
        let statuses: Vec<String> = sqlx::query_scalar(
            r#"
            UPDATE enrichment_queue
            SET status = CASE WHEN attempts >= $3 THEN 'failed' ELSE 'pending' END,
                started_at = CASE WHEN attempts >= $3 THEN started_at ELSE NULL END,
                completed_at = CASE WHEN attempts >= $3 THEN now() ELSE completed_at END,
                last_error = $2
            WHERE status = 'processing' AND started_at < $1
            RETURNING status
            "#,
        )
        .bind(started_before)
        .bind(marker)
        .bind(max_attempts as i32)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("recover_stale", e))?;

        let failed = statuses.iter().filter(|s| s.as_str() == "failed").count() as u64;
        Ok(StaleRecovery {
            requeued: statuses.len() as u64 - failed,
            failed,
        })
    }

    async fn complete(&self, id: QueueItemId, attempts: u32) -> Result<bool, QueueStoreError> {
        self.conditional_update(
            "complete",
            sqlx::query(
                r#"
                UPDATE enrichment_queue
                SET status = 'completed', completed_at = now(), last_error = NULL
                WHERE id = $1 AND status = 'processing' AND attempts = $2
                "#,
            )
            .bind(id.as_uuid())
            .bind(attempts as i32),
        )
        .await
    }

    async fn release_for_retry(
        &self,
        id: QueueItemId,
        attempts: u32,
        error: &str,
        clear_started: bool,
    ) -> Result<bool, QueueStoreError> {
        self.conditional_update(
            "release_for_retry",
            sqlx::query(
                r#"
                UPDATE enrichment_queue
                SET status = 'pending',
                    last_error = $3,
                    started_at = CASE WHEN $4 THEN NULL ELSE started_at END
                WHERE id = $1 AND status = 'processing' AND attempts = $2
                "#,
            )
            .bind(id.as_uuid())
            .bind(attempts as i32)
            .bind(error)
            .bind(clear_started),
        )
        .await
    }

    async fn fail(&self, id: QueueItemId, attempts: u32, error: &str) -> Result<bool, QueueStoreError> {
        self.conditional_update(
            "fail",
            sqlx::query(
                r#"
                UPDATE enrichment_queue
                SET status = 'failed', last_error = $3, completed_at = now()
                WHERE id = $1 AND status = 'processing' AND attempts = $2
                "#,
            )
            .bind(id.as_uuid())
            .bind(attempts as i32)
            .bind(error),
        )
        .await
    }

    #[instrument(skip(self), err)]
    async fn cancel_pending(
        &self,
        before: DateTime<Utc>,
        marker: &str,
    ) -> Result<u64, QueueStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE enrichment_queue
            SET status = 'failed', last_error = $2, completed_at = now()
            WHERE status = 'pending' AND queued_at < $1
            "#,
        )
        .bind(before)
        .bind(marker)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("cancel_pending", e))?;
        Ok(result.rows_affected())
    }

    async fn count_pending(&self, max_attempts: u32) -> Result<u64, QueueStoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM enrichment_queue WHERE status = 'pending' AND attempts < $1",
        )
        .bind(max_attempts as i32)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_pending", e))?;
        Ok(count.max(0) as u64)
    }

    async fn stats(&self) -> Result<QueueStats, QueueStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM enrichment_queue GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = QueueStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("stats", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("stats", e))?;
            let n = n.max(0) as u64;
            match status.parse::<ItemStatus>()? {
                ItemStatus::Pending => stats.pending = n,
                ItemStatus::Processing => stats.processing = n,
                ItemStatus::Completed => stats.completed = n,
                ItemStatus::Failed => stats.failed = n,
            }
        }
        Ok(stats)
    }
}

#[async_trait::async_trait]
impl OperationStore for PostgresStore {
    async fn load_operation(&self, kind: &str) -> Result<Option<OperationState>, QueueStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {OPERATION_COLUMNS} FROM operation_state WHERE kind = $1"
        ))
        .bind(kind)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_operation", e))?;
        row.as_ref().map(to_operation).transpose()
    }

    #[instrument(skip(self), err)]
    async fn begin_operation(&self, kind: &str) -> Result<OperationState, QueueStoreError> {
        // A continuation of a running drain keeps its counters; anything else starts fresh.
        let sql = format!(
            r#"
            INSERT INTO operation_state (kind, status, started_at, updated_at)
            VALUES ($1, 'running', now(), now())
            ON CONFLICT (kind) DO UPDATE SET
                completed_count = CASE WHEN operation_state.status = 'running'
                    THEN operation_state.completed_count ELSE 0 END,
                failed_count = CASE WHEN operation_state.status = 'running'
                    THEN operation_state.failed_count ELSE 0 END,
                recent_errors = CASE WHEN operation_state.status = 'running'
                    THEN operation_state.recent_errors ELSE '[]'::jsonb END,
                message = CASE WHEN operation_state.status = 'running'
                    THEN operation_state.message ELSE NULL END,
                started_at = CASE WHEN operation_state.status = 'running'
                    THEN operation_state.started_at ELSE now() END,
                finished_at = CASE WHEN operation_state.status = 'running'
                    THEN operation_state.finished_at ELSE NULL END,
                status = 'running',
                updated_at = now()
            RETURNING {OPERATION_COLUMNS}
            "#
        );
        self.fetch_operation("begin_operation", &sql, kind).await
    }

    async fn record_progress(
        &self,
        kind: &str,
        delta: &ProgressDelta,
        error_cap: usize,
    ) -> Result<(), QueueStoreError> {
        if delta.is_empty() {
            return Ok(());
        }
        self.ensure_operation(kind).await?;

        let errors = serde_json::to_value(&delta.errors)
            .map_err(|e| QueueStoreError::Storage(format!("failed to encode errors: {e}")))?;

        // Increments only, so overlapping invocations never overwrite each other.
        sqlx::query(
            r#"
            UPDATE operation_state
            SET completed_count = completed_count + $2,
                failed_count = failed_count + $3,
                recent_errors = (
                    SELECT COALESCE(jsonb_agg(e ORDER BY ord), '[]'::jsonb)
                    FROM (
                        SELECT e, ord
                        FROM jsonb_array_elements(operation_state.recent_errors || $4::jsonb)
                            WITH ORDINALITY AS t(e, ord)
                        ORDER BY ord DESC
                        LIMIT $5
                    ) newest
                ),
                updated_at = now()
            WHERE kind = $1
            "#,
        )
        .bind(kind)
        .bind(delta.completed as i64)
        .bind(delta.failed as i64)
        .bind(errors)
        .bind(error_cap as i64)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_progress", e))?;
        Ok(())
    }

    async fn set_remaining(&self, kind: &str, remaining: u64) -> Result<(), QueueStoreError> {
        self.ensure_operation(kind).await?;
        sqlx::query("UPDATE operation_state SET remaining = $2, updated_at = now() WHERE kind = $1")
            .bind(kind)
            .bind(remaining as i64)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("set_remaining", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn set_paused(&self, kind: &str, paused: bool) -> Result<OperationState, QueueStoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO operation_state (kind, paused, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (kind) DO UPDATE SET paused = $2, updated_at = now()
            RETURNING {OPERATION_COLUMNS}
            "#
        ))
        .bind(kind)
        .bind(paused)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_paused", e))?;
        to_operation(&row)
    }

    async fn mark_operation_completed(&self, kind: &str) -> Result<(), QueueStoreError> {
        self.ensure_operation(kind).await?;
        sqlx::query(
            r#"
            UPDATE operation_state
            SET status = 'completed', remaining = 0, finished_at = now(), updated_at = now()
            WHERE kind = $1
            "#,
        )
        .bind(kind)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_operation_completed", e))?;
        Ok(())
    }

    async fn mark_operation_failed(&self, kind: &str, reason: &str) -> Result<(), QueueStoreError> {
        self.ensure_operation(kind).await?;
        sqlx::query(
            r#"
            UPDATE operation_state
            SET status = 'failed', message = $2, finished_at = now(), updated_at = now()
            WHERE kind = $1
            "#,
        )
        .bind(kind)
        .bind(reason)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_operation_failed", e))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl JobRunStore for PostgresStore {
    async fn insert_run(&self, run: &JobRun) -> Result<(), QueueStoreError> {
        let updated_fields = encode_updated_fields(run)?;
        sqlx::query(&format!(
            r#"
            INSERT INTO job_runs ({RUN_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#
        ))
        .bind(run.id.as_uuid())
        .bind(&run.kind)
        .bind(run.status.as_str())
        .bind(run.continuation_count as i32)
        .bind(run.total_items as i64)
        .bind(run.succeeded as i64)
        .bind(run.failed as i64)
        .bind(run.last_item_id.map(|id| *id.as_uuid()))
        .bind(&run.error)
        .bind(updated_fields)
        .bind(run.started_at)
        .bind(run.finished_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_run", e))?;
        Ok(())
    }

    async fn update_run(&self, run: &JobRun) -> Result<(), QueueStoreError> {
        let updated_fields = encode_updated_fields(run)?;
        let result = sqlx::query(
            r#"
            UPDATE job_runs
            SET status = $2, total_items = $3, succeeded = $4, failed = $5,
                last_item_id = $6, error = $7, finished_at = $8, updated_fields = $9
            WHERE id = $1
            "#,
        )
        .bind(run.id.as_uuid())
        .bind(run.status.as_str())
        .bind(run.total_items as i64)
        .bind(run.succeeded as i64)
        .bind(run.failed as i64)
        .bind(run.last_item_id.map(|id| *id.as_uuid()))
        .bind(&run.error)
        .bind(run.finished_at)
        .bind(updated_fields)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_run", e))?;

        if result.rows_affected() == 0 {
            return Err(QueueStoreError::Storage(format!("job run {} not found", run.id)));
        }
        Ok(())
    }

    async fn recent_runs(&self, kind: &str, limit: u32) -> Result<Vec<JobRun>, QueueStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM job_runs WHERE kind = $1 ORDER BY started_at DESC LIMIT $2"
        ))
        .bind(kind)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("recent_runs", e))?;

        rows.iter().map(to_run).collect()
    }
}

#[async_trait::async_trait]
impl TargetLookup for PostgresStore {
    async fn load_targets(&self, ids: &[TargetId]) -> Result<Vec<TargetRecord>, PipelineError> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let uuids: Vec<Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();
        let rows = sqlx::query(
            "SELECT id, enriched_at, fields FROM enrichment_targets WHERE id = ANY($1)",
        )
        .bind(&uuids)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| PipelineError::Transport(format!("target lookup failed: {e}")))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let target = decode::<TargetRow>(&row)
                .map_err(|e| PipelineError::Provider(e.to_string()))?;
            records.push(target.into());
        }
        Ok(records)
    }
}

fn decode<T>(row: &sqlx::postgres::PgRow) -> Result<T, QueueStoreError>
where
    T: for<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow>,
{
    T::from_row(row).map_err(|e| QueueStoreError::Storage(format!("failed to decode row: {e}")))
}

fn decode_items(rows: &[sqlx::postgres::PgRow]) -> Result<Vec<QueueItem>, QueueStoreError> {
    rows.iter().map(to_item).collect()
}

fn to_item(row: &sqlx::postgres::PgRow) -> Result<QueueItem, QueueStoreError> {
    QueueItem::try_from(decode::<ItemRow>(row)?)
}

fn to_operation(row: &sqlx::postgres::PgRow) -> Result<OperationState, QueueStoreError> {
    OperationState::try_from(decode::<OperationRow>(row)?)
}

fn to_run(row: &sqlx::postgres::PgRow) -> Result<JobRun, QueueStoreError> {
    JobRun::try_from(decode::<RunRow>(row)?)
}

fn is_undefined_function(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "42883";
        }
    }
    false
}

/// Map SQLx errors to QueueStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> QueueStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => QueueStoreError::Conflict(msg),
                _ => QueueStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => {
            QueueStoreError::Unavailable(format!("connection pool unavailable in {}", operation))
        }
        sqlx::Error::Io(e) => {
            QueueStoreError::Unavailable(format!("io error in {}: {}", operation, e))
        }
        sqlx::Error::Tls(e) => {
            QueueStoreError::Unavailable(format!("tls error in {}: {}", operation, e))
        }
        _ => QueueStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

#[derive(Debug)]
struct ItemRow {
    id: Uuid,
    target_id: Uuid,
    status: String,
    attempts: i32,
    queued_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    force: bool,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for ItemRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(ItemRow {
            id: row.try_get("id")?,
            target_id: row.try_get("target_id")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            queued_at: row.try_get("queued_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            last_error: row.try_get("last_error")?,
            force: row.try_get("force")?,
        })
    }
}

impl TryFrom<ItemRow> for QueueItem {
    type Error = QueueStoreError;

    fn try_from(row: ItemRow) -> Result<Self, Self::Error> {
        Ok(QueueItem {
            id: QueueItemId::from_uuid(row.id),
            target_id: TargetId::from_uuid(row.target_id),
            status: row.status.parse()?,
            attempts: row.attempts.max(0) as u32,
            queued_at: row.queued_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            last_error: row.last_error,
            force: row.force,
        })
    }
}

#[derive(Debug)]
struct OperationRow {
    kind: String,
    status: String,
    paused: bool,
    completed_count: i64,
    failed_count: i64,
    remaining: i64,
    recent_errors: JsonValue,
    message: Option<String>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for OperationRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(OperationRow {
            kind: row.try_get("kind")?,
            status: row.try_get("status")?,
            paused: row.try_get("paused")?,
            completed_count: row.try_get("completed_count")?,
            failed_count: row.try_get("failed_count")?,
            remaining: row.try_get("remaining")?,
            recent_errors: row.try_get("recent_errors")?,
            message: row.try_get("message")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<OperationRow> for OperationState {
    type Error = QueueStoreError;

    fn try_from(row: OperationRow) -> Result<Self, Self::Error> {
        let status = OperationStatus::parse(&row.status).ok_or_else(|| {
            QueueStoreError::Storage(format!("unknown operation status: {}", row.status))
        })?;
        let recent_errors: Vec<ErrorEntry> = serde_json::from_value(row.recent_errors)
            .map_err(|e| QueueStoreError::Storage(format!("failed to decode recent_errors: {e}")))?;
        Ok(OperationState {
            kind: row.kind,
            status,
            paused: row.paused,
            completed_count: row.completed_count.max(0) as u64,
            failed_count: row.failed_count.max(0) as u64,
            remaining: row.remaining.max(0) as u64,
            recent_errors,
            message: row.message,
            started_at: row.started_at,
            finished_at: row.finished_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug)]
struct RunRow {
    id: Uuid,
    kind: String,
    status: String,
    continuation_count: i32,
    total_items: i64,
    succeeded: i64,
    failed: i64,
    last_item_id: Option<Uuid>,
    error: Option<String>,
    updated_fields: JsonValue,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for RunRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(RunRow {
            id: row.try_get("id")?,
            kind: row.try_get("kind")?,
            status: row.try_get("status")?,
            continuation_count: row.try_get("continuation_count")?,
            total_items: row.try_get("total_items")?,
            succeeded: row.try_get("succeeded")?,
            failed: row.try_get("failed")?,
            last_item_id: row.try_get("last_item_id")?,
            error: row.try_get("error")?,
            updated_fields: row.try_get("updated_fields")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
        })
    }
}

impl TryFrom<RunRow> for JobRun {
    type Error = QueueStoreError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        let status = JobRunStatus::parse(&row.status).ok_or_else(|| {
            QueueStoreError::Storage(format!("unknown job run status: {}", row.status))
        })?;
        let updated_fields = serde_json::from_value(row.updated_fields)
            .map_err(|e| QueueStoreError::Storage(format!("failed to decode updated_fields: {e}")))?;
        Ok(JobRun {
            id: JobRunId::from_uuid(row.id),
            kind: row.kind,
            status,
            continuation_count: row.continuation_count.max(0) as u32,
            total_items: row.total_items.max(0) as u64,
            succeeded: row.succeeded.max(0) as u64,
            failed: row.failed.max(0) as u64,
            last_item_id: row.last_item_id.map(QueueItemId::from_uuid),
            error: row.error,
            updated_fields,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }
}

fn encode_updated_fields(run: &JobRun) -> Result<JsonValue, QueueStoreError> {
    serde_json::to_value(&run.updated_fields)
        .map_err(|e| QueueStoreError::Storage(format!("failed to encode updated_fields: {e}")))
}

#[derive(Debug)]
struct TargetRow {
    id: Uuid,
    enriched_at: Option<DateTime<Utc>>,
    fields: JsonValue,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for TargetRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(TargetRow {
            id: row.try_get("id")?,
            enriched_at: row.try_get("enriched_at")?,
            fields: row.try_get("fields")?,
        })
    }
}

impl From<TargetRow> for TargetRecord {
    fn from(row: TargetRow) -> Self {
        let fields: BTreeMap<String, JsonValue> = match row.fields {
            JsonValue::Object(map) => map.into_iter().collect(),
            _ => BTreeMap::new(),
        };
        TargetRecord {
            id: TargetId::from_uuid(row.id),
            enriched_at: row.enriched_at,
            fields,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn item_row_with_unknown_status_is_rejected() {
        let row = ItemRow {
            id: Uuid::now_v7(),
            target_id: Uuid::now_v7(),
            status: "archived".to_string(),
            attempts: 1,
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            last_error: None,
            force: false,
        };
        assert!(matches!(QueueItem::try_from(row), Err(QueueStoreError::Domain(_))));
    }

    #[test]
    fn operation_row_decodes_error_ring() {
        let item_id = QueueItemId::new();
        let target_id = TargetId::new();
        let row = OperationRow {
            kind: "enrichment".to_string(),
            status: "running".to_string(),
            paused: false,
            completed_count: 7,
            failed_count: 2,
            remaining: 3,
            recent_errors: json!([{
                "itemId": item_id,
                "targetId": target_id,
                "error": "provider failure: 502",
                "at": "2026-01-01T00:00:00Z"
            }]),
            message: None,
            started_at: None,
            finished_at: None,
            updated_at: Utc::now(),
        };

        let state = OperationState::try_from(row).unwrap();
        assert_eq!(state.status, OperationStatus::Running);
        assert_eq!(state.recent_errors.len(), 1);
        assert_eq!(state.recent_errors[0].item_id, item_id);
    }

    #[test]
    fn run_row_decodes_field_tally() {
        let row = RunRow {
            id: Uuid::now_v7(),
            kind: "enrichment".to_string(),
            status: "completed".to_string(),
            continuation_count: 1,
            total_items: 2,
            succeeded: 2,
            failed: 0,
            last_item_id: None,
            error: None,
            updated_fields: json!({ "summary": 2, "contacts": 1 }),
            started_at: Utc::now(),
            finished_at: Some(Utc::now()),
        };

        let run = JobRun::try_from(row).unwrap();
        assert_eq!(run.status, JobRunStatus::Completed);
        assert_eq!(run.updated_fields.get("summary"), Some(&2));
        assert_eq!(run.updated_fields.get("contacts"), Some(&1));
    }

    #[test]
    fn non_object_fields_become_empty() {
        let record: TargetRecord = TargetRow {
            id: Uuid::now_v7(),
            enriched_at: Some(Utc::now()),
            fields: json!(["not", "an", "object"]),
        }
        .into();
        assert!(record.fields.is_empty());
        assert!(!record.has_enrichment_evidence());
    }
}
