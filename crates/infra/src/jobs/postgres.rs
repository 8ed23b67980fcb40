//! Postgres-backed job store.
//!
//! The relation name is configurable ([`JobsTable`]) and is spliced into the
//! SQL text; every value is bound. Each lease operation is one conditional
//! `UPDATE`, so the database serializes competing workers on the row.
//!
//! ## Error Mapping
//!
//! | SQLx Error | JobStoreError |
//! |------------|---------------|
//! | Database (any code) | `Storage` with the operation and message |
//! | PoolClosed / PoolTimedOut / Io | `Storage` |
//! | Row decode failures | `Storage` |
//!
//! A missing tokio runtime is reported as `Runtime`.
//!
//! ## Thread Safety
//!
//! `PostgresJobStore` is `Send + Sync` and cheap to clone. The synchronous
//! [`JobStore`] methods drive the async queries on the runtime captured at
//! construction, so they must be called from a thread that is not itself a
//! runtime worker (a plain thread or `spawn_blocking`).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use tokio::runtime::Handle;
use tracing::{Span, instrument};

use tablejob_core::{Job, JobId, JobsTable, NewJob, QueueStatus, WorkerId};

use super::store::{ClaimQuery, FailureRecord, JobStore, JobStoreError};

/// Rows per `INSERT` in [`PostgresJobStore::insert_many`]; keeps the bind
/// count under the protocol limit of 65535.
const INSERT_CHUNK: usize = 10_000;

const COLUMNS: &str =
    "id, handler, queue, attempts, run_at, locked_at, locked_by, failed_at, error, created_at";

#[derive(Debug, FromRow)]
struct JobRow {
    id: i64,
    handler: String,
    queue: String,
    attempts: i32,
    run_at: Option<DateTime<Utc>>,
    locked_at: Option<DateTime<Utc>>,
    locked_by: Option<String>,
    failed_at: Option<DateTime<Utc>>,
    error: Option<String>,
    created_at: DateTime<Utc>,
}

impl JobRow {
    fn into_job(self) -> Result<Job, JobStoreError> {
        let locked_by = self
            .locked_by
            .map(|w| w.parse::<WorkerId>())
            .transpose()
            .map_err(|e| JobStoreError::Storage(format!("job {}: {e}", self.id)))?;

        Ok(Job {
            id: JobId::new(self.id),
            handler: self.handler,
            queue: self.queue,
            attempts: attempts_from_db(self.attempts),
            run_at: self.run_at,
            locked_at: self.locked_at,
            locked_by,
            failed_at: self.failed_at,
            error: self.error,
            created_at: self.created_at,
        })
    }
}

fn attempts_from_db(raw: i32) -> u32 {
    u32::try_from(raw).unwrap_or(0)
}

fn attempts_to_db(raw: u32) -> i32 {
    i32::try_from(raw).unwrap_or(i32::MAX)
}

fn count_from_db(raw: i64) -> u64 {
    u64::try_from(raw).unwrap_or(0)
}

/// Postgres-backed job store.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
    table: JobsTable,
    runtime: Handle,
}

impl PostgresJobStore {
    /// Create a store on the current tokio runtime.
    pub fn new(pool: PgPool, table: JobsTable) -> Result<Self, JobStoreError> {
        let runtime = Handle::try_current().map_err(|_| {
            JobStoreError::Runtime(
                "PostgresJobStore requires a tokio runtime; construct it from within one"
                    .to_string(),
            )
        })?;
        Ok(Self::with_runtime(pool, table, runtime))
    }

    pub fn with_runtime(pool: PgPool, table: JobsTable, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            table,
            runtime,
        }
    }

    pub fn table(&self) -> &JobsTable {
        &self.table
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.runtime.block_on(fut)
    }

    /// Create the jobs relation and its polling index if they do not exist.
    #[instrument(skip(self), fields(table = %self.table), err)]
    pub async fn create_table(&self) -> Result<(), JobStoreError> {
        let table = &self.table;
        let index = table.as_str().replace('.', "_");

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id BIGSERIAL PRIMARY KEY,
                handler TEXT NOT NULL,
                queue VARCHAR(255) NOT NULL DEFAULT 'default',
                attempts INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
                run_at TIMESTAMPTZ NULL,
                locked_at TIMESTAMPTZ NULL,
                locked_by VARCHAR(255) NULL,
                failed_at TIMESTAMPTZ NULL,
                error TEXT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                CHECK ((locked_at IS NULL) = (locked_by IS NULL))
            )
            "#
        ))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_table", e))?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {index}_queue_created_idx ON {table} (queue, created_at)"
        ))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_table", e))?;

        Ok(())
    }

    #[instrument(skip(self, job), fields(table = %self.table, queue = %job.queue), err)]
    pub async fn insert(&self, job: NewJob) -> Result<JobId, JobStoreError> {
        let id: i64 = sqlx::query_scalar(&format!(
            "INSERT INTO {} (handler, queue, run_at) VALUES ($1, $2, $3) RETURNING id",
            self.table
        ))
        .bind(&job.handler)
        .bind(&job.queue)
        .bind(job.run_at)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert", e))?;

        Ok(JobId::new(id))
    }

    /// Multi-row `INSERT`, chunked and committed in one transaction.
    #[instrument(skip(self, jobs), fields(table = %self.table, job_count = jobs.len()), err)]
    pub async fn insert_many(&self, jobs: Vec<NewJob>) -> Result<u64, JobStoreError> {
        if jobs.is_empty() {
            return Ok(0);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("insert_many", e))?;

        let mut inserted = 0;
        for chunk in jobs.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO {} (handler, queue, run_at) ", self.table));
            builder.push_values(chunk, |mut row, job| {
                row.push_bind(&job.handler)
                    .push_bind(&job.queue)
                    .push_bind(job.run_at);
            });
            inserted += builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("insert_many", e))?
                .rows_affected();
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("insert_many", e))?;

        Ok(inserted)
    }

    #[instrument(skip(self), fields(table = %self.table), err)]
    pub async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM {} WHERE id = $1",
            self.table
        ))
        .bind(id.get())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.map(JobRow::into_job).transpose()
    }

    #[instrument(skip(self), fields(table = %self.table), err)]
    pub async fn handler_of(&self, id: JobId) -> Result<Option<String>, JobStoreError> {
        sqlx::query_scalar(&format!("SELECT handler FROM {} WHERE id = $1", self.table))
            .bind(id.get())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("handler_of", e))
    }

    #[instrument(skip(self), fields(table = %self.table), err)]
    pub async fn attempts_of(&self, id: JobId) -> Result<Option<u32>, JobStoreError> {
        let attempts: Option<i32> =
            sqlx::query_scalar(&format!("SELECT attempts FROM {} WHERE id = $1", self.table))
                .bind(id.get())
                .fetch_optional(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("attempts_of", e))?;

        Ok(attempts.map(attempts_from_db))
    }

    #[instrument(
        skip(self, query),
        fields(table = %self.table, queue = %query.queue, worker = %query.worker, candidate_count = tracing::field::Empty),
        err
    )]
    pub async fn find_claimable(&self, query: &ClaimQuery<'_>) -> Result<Vec<JobId>, JobStoreError> {
        let ids: Vec<i64> = sqlx::query_scalar(&format!(
            r#"
            SELECT id FROM {table}
            WHERE queue = $1
              AND (run_at IS NULL OR NOW() >= run_at)
              AND (locked_at IS NULL OR locked_by = $2)
              AND failed_at IS NULL
              AND attempts < $3
            ORDER BY created_at {order}, id {order}
            LIMIT $4
            "#,
            table = self.table,
            order = query.order.as_sql(),
        ))
        .bind(query.queue)
        .bind(query.worker.as_str())
        .bind(attempts_to_db(query.max_attempts))
        .bind(i64::try_from(query.limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_claimable", e))?;

        Span::current().record("candidate_count", ids.len());
        Ok(ids.into_iter().map(JobId::new).collect())
    }

    #[instrument(skip(self), fields(table = %self.table, worker = %worker), err)]
    pub async fn try_lock(&self, id: JobId, worker: &WorkerId) -> Result<bool, JobStoreError> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE {} SET locked_at = NOW(), locked_by = $2
            WHERE id = $1
              AND (locked_at IS NULL OR locked_by = $2)
              AND failed_at IS NULL
            "#,
            self.table
        ))
        .bind(id.get())
        .bind(worker.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("try_lock", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(table = %self.table, worker = %worker), err)]
    pub async fn unlock(&self, id: JobId, worker: &WorkerId) -> Result<bool, JobStoreError> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET locked_at = NULL, locked_by = NULL WHERE id = $1 AND locked_by = $2",
            self.table
        ))
        .bind(id.get())
        .bind(worker.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("unlock", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(table = %self.table, worker = %worker), err)]
    pub async fn unlock_all(&self, worker: &WorkerId) -> Result<u64, JobStoreError> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET locked_at = NULL, locked_by = NULL WHERE locked_by = $1",
            self.table
        ))
        .bind(worker.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("unlock_all", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(table = %self.table), err)]
    pub async fn delete(&self, id: JobId) -> Result<bool, JobStoreError> {
        let result = sqlx::query(&format!("DELETE FROM {} WHERE id = $1", self.table))
            .bind(id.get())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete", e))?;

        Ok(result.rows_affected() == 1)
    }

    /// `SET` expressions see the pre-update row, hence `attempts + 1`
    /// throughout.
    #[instrument(skip(self, error), fields(table = %self.table, worker = %worker), err)]
    pub async fn record_failure(
        &self,
        id: JobId,
        worker: &WorkerId,
        max_attempts: u32,
        error: &str,
    ) -> Result<Option<FailureRecord>, JobStoreError> {
        let row: Option<(i32, bool)> = sqlx::query_as(&format!(
            r#"
            UPDATE {} SET
                attempts = attempts + 1,
                failed_at = CASE WHEN attempts + 1 >= $3 THEN NOW() END,
                error = CASE WHEN attempts + 1 >= $3 THEN $4 END,
                locked_at = NULL,
                locked_by = NULL
            WHERE id = $1 AND failed_at IS NULL AND (locked_by IS NULL OR locked_by = $2)
            RETURNING attempts, failed_at IS NOT NULL
            "#,
            self.table
        ))
        .bind(id.get())
        .bind(worker.as_str())
        .bind(attempts_to_db(max_attempts))
        .bind(error)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_failure", e))?;

        Ok(row.map(|(attempts, failed)| FailureRecord {
            attempts: attempts_from_db(attempts),
            failed,
        }))
    }

    #[instrument(skip(self), fields(table = %self.table, worker = %worker), err)]
    pub async fn reschedule(
        &self,
        id: JobId,
        worker: &WorkerId,
        delay: Duration,
    ) -> Result<Option<u32>, JobStoreError> {
        let attempts: Option<i32> = sqlx::query_scalar(&format!(
            r#"
            UPDATE {} SET
                run_at = NOW() + make_interval(secs => $3),
                attempts = attempts + 1,
                locked_at = NULL,
                locked_by = NULL
            WHERE id = $1 AND failed_at IS NULL AND (locked_by IS NULL OR locked_by = $2)
            RETURNING attempts
            "#,
            self.table
        ))
        .bind(id.get())
        .bind(worker.as_str())
        .bind(delay.as_secs_f64())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reschedule", e))?;

        Ok(attempts.map(attempts_from_db))
    }

    #[instrument(skip(self), fields(table = %self.table), err)]
    pub async fn status(&self, queue: &str) -> Result<QueueStatus, JobStoreError> {
        let (total, failed, locked): (i64, i64, i64) = sqlx::query_as(&format!(
            "SELECT COUNT(*), COUNT(failed_at), COUNT(locked_at) FROM {} WHERE queue = $1",
            self.table
        ))
        .bind(queue)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("status", e))?;

        Ok(QueueStatus::from_counts(
            count_from_db(total),
            count_from_db(failed),
            count_from_db(locked),
        ))
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => JobStoreError::Storage(format!(
            "database error in {}: {}{}",
            operation,
            db_err.message(),
            db_err
                .code()
                .map(|c| format!(" (code {c})"))
                .unwrap_or_default()
        )),
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed during {operation}"))
        }
        sqlx::Error::PoolTimedOut => {
            JobStoreError::Storage(format!("connection pool timed out during {operation}"))
        }
        other => JobStoreError::Storage(format!("{operation} failed: {other}")),
    }
}

// Inherent async methods shadow the trait methods of the same name, so each
// call below runs the query rather than recursing.
impl JobStore for PostgresJobStore {
    fn insert(&self, job: NewJob) -> Result<JobId, JobStoreError> {
        self.block_on(self.insert(job))
    }

    fn insert_many(&self, jobs: Vec<NewJob>) -> Result<u64, JobStoreError> {
        self.block_on(self.insert_many(jobs))
    }

    fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.block_on(self.get(id))
    }

    fn handler_of(&self, id: JobId) -> Result<Option<String>, JobStoreError> {
        self.block_on(self.handler_of(id))
    }

    fn attempts_of(&self, id: JobId) -> Result<Option<u32>, JobStoreError> {
        self.block_on(self.attempts_of(id))
    }

    fn find_claimable(&self, query: &ClaimQuery<'_>) -> Result<Vec<JobId>, JobStoreError> {
        self.block_on(self.find_claimable(query))
    }

    fn try_lock(&self, id: JobId, worker: &WorkerId) -> Result<bool, JobStoreError> {
        self.block_on(self.try_lock(id, worker))
    }

    fn unlock(&self, id: JobId, worker: &WorkerId) -> Result<bool, JobStoreError> {
        self.block_on(self.unlock(id, worker))
    }

    fn unlock_all(&self, worker: &WorkerId) -> Result<u64, JobStoreError> {
        self.block_on(self.unlock_all(worker))
    }

    fn delete(&self, id: JobId) -> Result<bool, JobStoreError> {
        self.block_on(self.delete(id))
    }

    fn record_failure(
        &self,
        id: JobId,
        worker: &WorkerId,
        max_attempts: u32,
        error: &str,
    ) -> Result<Option<FailureRecord>, JobStoreError> {
        self.block_on(self.record_failure(id, worker, max_attempts, error))
    }

    fn reschedule(
        &self,
        id: JobId,
        worker: &WorkerId,
        delay: Duration,
    ) -> Result<Option<u32>, JobStoreError> {
        self.block_on(self.reschedule(id, worker, delay))
    }

    fn status(&self, queue: &str) -> Result<QueueStatus, JobStoreError> {
        self.block_on(self.status(queue))
    }
}
