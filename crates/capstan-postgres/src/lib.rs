//! PostgreSQL implementation of the capstan job store.
//!
//! Leased rows are pinned with per-id advisory locks
//! (`pg_try_advisory_lock` / `pg_advisory_unlock`): the claim statement only
//! returns a row if its lock is granted, so any number of dispatchers, in
//! one process or many, can lease from the same table without double
//! execution, and a crashed process's locks evaporate with its sessions.
//! Every settle statement releases the lock in the same round trip as the
//! status write.
//!
//! # Database schema
//!
//! ```sql
//! CREATE TABLE job (
//!     id          BIGSERIAL PRIMARY KEY,
//!     name        TEXT NOT NULL,
//!     payload     JSONB,
//!     status      SMALLINT NOT NULL DEFAULT 0,      -- 0 pending, 1 completed, 2 failed
//!     priority    INTEGER NOT NULL DEFAULT 0,       -- higher runs first
//!     run_after   TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     timeout     INTEGER NOT NULL,                 -- per-execution deadline, seconds
//!     run_count   INTEGER NOT NULL DEFAULT 0,
//!     retry_delay BIGINT NOT NULL DEFAULT 5,        -- backoff baseline, seconds
//!     elapsed     DOUBLE PRECISION NOT NULL DEFAULT 0,
//!     last_error  TEXT NOT NULL DEFAULT '',
//!     grabbed     TIMESTAMPTZ                       -- non-null while leased
//! );
//!
//! CREATE INDEX job_ready_idx ON job (status, grabbed, run_after, priority DESC);
//! ```
//!
//! [`init_schema`] creates the above idempotently.
//!
//! # Usage
//!
//! ```rust,ignore
//! use capstan_postgres::{init_schema, PgJobStore};
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/mydb").await?;
//! init_schema(&pool).await?;
//!
//! let store = Arc::new(PgJobStore::new(pool));
//! store.release_leased().await?; // reclaim leases from a previous hard exit
//! let dispatcher = Dispatcher::new(store, 4, worker);
//! ```

use anyhow::Result;
use capstan_core::{FailureOutcome, Job, JobConfig, JobStatus, JobStore, PageCursor, PAGE_SIZE};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

/// Column list shared by every statement that reads whole job rows.
const JOB_COLUMNS: &str = "id, name, COALESCE(payload::text, '') AS payload, status, priority, \
     run_after, timeout, run_count, retry_delay, elapsed, last_error, grabbed";

/// Create the `job` table and its lease-scan index if they do not exist.
pub async fn init_schema(pool: &PgPool) -> Result<()> {
    sqlx::raw_sql(
        r#"
        CREATE TABLE IF NOT EXISTS job (
            id          BIGSERIAL PRIMARY KEY,
            name        TEXT NOT NULL,
            payload     JSONB,
            status      SMALLINT NOT NULL DEFAULT 0,
            priority    INTEGER NOT NULL DEFAULT 0,
            run_after   TIMESTAMPTZ NOT NULL DEFAULT now(),
            timeout     INTEGER NOT NULL,
            run_count   INTEGER NOT NULL DEFAULT 0,
            retry_delay BIGINT NOT NULL DEFAULT 5,
            elapsed     DOUBLE PRECISION NOT NULL DEFAULT 0,
            last_error  TEXT NOT NULL DEFAULT '',
            grabbed     TIMESTAMPTZ
        );
        CREATE INDEX IF NOT EXISTS job_ready_idx
            ON job (status, grabbed, run_after, priority DESC);
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// PostgreSQL job store.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
    config: JobConfig,
}

impl PgJobStore {
    /// Create a store with default job settings (3 runs, 5 s backoff
    /// baseline).
    pub fn new(pool: PgPool) -> Self {
        Self::with_job_config(pool, JobConfig::default())
    }

    /// Create a store with explicit retry settings.
    pub fn with_job_config(pool: PgPool, config: JobConfig) -> Self {
        Self { pool, config }
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Snapshot of per-state row counts.
    pub async fn stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 0 AND grabbed IS NULL) AS pending,
                COUNT(*) FILTER (WHERE status = 0 AND grabbed IS NOT NULL) AS processing,
                COUNT(*) FILTER (WHERE status = 1) AS completed,
                COUNT(*) FILTER (WHERE status = 2) AS failed
            FROM job
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueStats {
            pending: row.get("pending"),
            processing: row.get("processing"),
            completed: row.get("completed"),
            failed: row.get("failed"),
        })
    }

    async fn list_settled(&self, status: JobStatus, cursor: PageCursor) -> Result<Vec<Job>> {
        let rows = match cursor.position() {
            None => {
                sqlx::query(&format!(
                    "SELECT {JOB_COLUMNS} FROM job WHERE status = $1 \
                     ORDER BY run_after DESC, id DESC LIMIT $2"
                ))
                .bind(i16::from(status))
                .bind(PAGE_SIZE)
                .fetch_all(&self.pool)
                .await?
            }
            Some((run_after, id)) => {
                sqlx::query(&format!(
                    "SELECT {JOB_COLUMNS} FROM job \
                     WHERE status = $1 AND (run_after, id) < ($2, $3) \
                     ORDER BY run_after DESC, id DESC LIMIT $4"
                ))
                .bind(i16::from(status))
                .bind(run_after)
                .bind(id)
                .bind(PAGE_SIZE)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(job_from_row).collect()
    }
}

#[async_trait::async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, job: &mut Job) -> Result<i64> {
        job.validate()?;

        let row = sqlx::query(
            r#"
            INSERT INTO job (name, payload, status, priority, run_after, timeout, run_count, retry_delay)
            VALUES ($1, NULLIF($2, '')::jsonb, $3, $4, $5, $6, $7, $8)
            RETURNING id
            "#,
        )
        .bind(&job.name)
        .bind(&job.payload)
        .bind(i16::from(job.status))
        .bind(job.priority)
        .bind(job.run_after)
        .bind(job.timeout)
        .bind(job.run_count)
        .bind(job.retry_delay)
        .fetch_one(&self.pool)
        .await?;

        job.id = row.get("id");
        Ok(job.id)
    }

    /// Claim up to `limit` ready rows, best priority first.
    ///
    /// The advisory lock in the claim's inner `WHERE` is what makes
    /// concurrent leases safe: a row whose lock another session already holds
    /// is silently skipped, never double-returned.
    async fn lease(&self, limit: i64) -> Result<Vec<Job>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(&format!(
            r#"
            WITH ready AS (
                SELECT id
                FROM job
                WHERE status = 0
                  AND grabbed IS NULL
                  AND run_after <= now()
                ORDER BY priority DESC, id ASC
                LIMIT $1
            ),
            claimed AS (
                UPDATE job
                SET grabbed = now()
                WHERE id IN (SELECT id FROM ready WHERE pg_try_advisory_lock(id))
                  AND grabbed IS NULL
                RETURNING {JOB_COLUMNS}
            )
            SELECT * FROM claimed ORDER BY priority DESC, id ASC
            "#
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    /// Reclaim ready rows whose lock holder is gone. The try-lock filters out
    /// rows still pinned by live sessions; the immediate unlock leaves the
    /// reclaimed row leasable from any connection.
    async fn release_leased(&self) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE job
            SET grabbed = NULL
            WHERE id IN (
                SELECT id FROM (
                    SELECT id FROM job
                    WHERE grabbed IS NOT NULL AND status = 0 AND run_after <= now()
                ) stale
                WHERE pg_try_advisory_lock(id) AND pg_advisory_unlock(id)
            )
              AND grabbed IS NOT NULL
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Surrender every ready leased row regardless of who pinned it: the
    /// unlock is attempted per row and the lease mark cleared either way.
    async fn release_all(&self) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE job
            SET grabbed = NULL
            WHERE id IN (
                SELECT id FROM job
                WHERE grabbed IS NOT NULL AND status = 0 AND run_after <= now()
            )
              AND grabbed IS NOT NULL
            RETURNING pg_advisory_unlock(id)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete(&self, job: &mut Job) -> Result<()> {
        let mut updated = job.clone();
        updated.record_completion();

        // The unlock may return false if the lock is already gone; the
        // status write still applies.
        sqlx::query(
            r#"
            UPDATE job
            SET status = 1, run_count = $2, elapsed = $3
            WHERE id = $1
            RETURNING pg_advisory_unlock(id)
            "#,
        )
        .bind(job.id)
        .bind(updated.run_count)
        .bind(updated.elapsed)
        .fetch_all(&self.pool)
        .await?;

        *job = updated;
        Ok(())
    }

    async fn fail(&self, job: &mut Job, error: &str) -> Result<()> {
        let mut updated = job.clone();
        match updated.record_failure(error, &self.config) {
            FailureOutcome::Exhausted => {
                sqlx::query(
                    r#"
                    UPDATE job
                    SET status = 2, run_count = $2, elapsed = $3, last_error = $4
                    WHERE id = $1
                    RETURNING pg_advisory_unlock(id)
                    "#,
                )
                .bind(job.id)
                .bind(updated.run_count)
                .bind(updated.elapsed)
                .bind(&updated.last_error)
                .fetch_all(&self.pool)
                .await?;
            }
            FailureOutcome::Retry { .. } => {
                sqlx::query(
                    r#"
                    UPDATE job
                    SET run_count = $2, retry_delay = $3, run_after = $4,
                        elapsed = $5, last_error = $6, grabbed = NULL
                    WHERE id = $1
                    RETURNING pg_advisory_unlock(id)
                    "#,
                )
                .bind(job.id)
                .bind(updated.run_count)
                .bind(updated.retry_delay)
                .bind(updated.run_after)
                .bind(updated.elapsed)
                .bind(&updated.last_error)
                .fetch_all(&self.pool)
                .await?;
            }
        }

        *job = updated;
        Ok(())
    }

    async fn delete(&self, job: &Job) -> Result<()> {
        sqlx::query("DELETE FROM job WHERE id = $1 AND status = 0 AND grabbed IS NULL")
            .bind(job.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn enqueued_by_name(&self, name: &str) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM job \
             WHERE status = 0 AND grabbed IS NULL AND name = $1 \
             ORDER BY run_after ASC, id ASC"
        ))
        .bind(name)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn processing(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM job \
             WHERE status = 0 AND grabbed IS NOT NULL \
             ORDER BY id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn processed(&self, cursor: PageCursor) -> Result<Vec<Job>> {
        self.list_settled(JobStatus::Completed, cursor).await
    }

    async fn failed(&self, cursor: PageCursor) -> Result<Vec<Job>> {
        self.list_settled(JobStatus::Failed, cursor).await
    }
}

/// Per-state row counts, as reported by [`PgJobStore::stats`].
#[derive(Debug, Clone, Copy)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

fn job_from_row(row: &PgRow) -> Result<Job> {
    let status = JobStatus::try_from(row.get::<i16, _>("status"))?;
    Ok(Job {
        id: row.get("id"),
        name: row.get("name"),
        payload: row.get("payload"),
        status,
        priority: row.get("priority"),
        run_after: row.get("run_after"),
        timeout: row.get("timeout"),
        run_count: row.get("run_count"),
        retry_delay: row.get("retry_delay"),
        elapsed: row.get("elapsed"),
        last_error: row.get("last_error"),
        grabbed: row.get("grabbed"),
    })
}
