//! The store contract: persistence, atomic leasing, and settle operations.
//!
//! The store is the sole authority over job rows. It decides what "ready"
//! means (pending, unleased, `run_after` elapsed) and guarantees that a row
//! is leased by at most one dispatcher worldwide: the reference
//! implementation pins each leased row with a per-id advisory lock so
//! concurrent dispatchers (or several pumps in one process) race safely and
//! losers are silently skipped.
//!
//! # Implementer notes
//!
//! - `lease` must select, mark, and pin rows in one atomic statement.
//! - Settle writes (`complete`, `fail`) release the row pin. If a settle
//!   write fails the row stays leased; callers log and move on, and the next
//!   process start reclaims it through `release_leased`. Re-running a job is
//!   preferred over silently losing its status transition.
//! - Backends without advisory locks should substitute a lease token with
//!   expiry and sweep expired leases periodically.

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::job::Job;

/// Rows per listing page.
pub const PAGE_SIZE: i64 = 25;

/// Keyset cursor over `(run_after, id)` for the paginated listings.
///
/// The default cursor denotes the first page; [`PageCursor::after`] continues
/// past the last row of the previous page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageCursor {
    after: Option<(DateTime<Utc>, i64)>,
}

impl PageCursor {
    /// The first page.
    pub fn first() -> Self {
        Self::default()
    }

    /// The page following `job`, which should be the last row of the page
    /// in hand.
    pub fn after(job: &Job) -> Self {
        Self {
            after: Some((job.run_after, job.id)),
        }
    }

    /// Resume position from raw keyset parts, as received over the wire.
    pub fn resume(run_after: DateTime<Utc>, id: i64) -> Self {
        Self {
            after: Some((run_after, id)),
        }
    }

    /// The `(run_after, id)` position, or `None` for the first page.
    pub fn position(&self) -> Option<(DateTime<Utc>, i64)> {
        self.after
    }
}

/// Persistence contract for the queue.
///
/// All methods return `anyhow::Result`; `insert` fails with a
/// [`crate::ValidationError`] (downcastable) on bad input and with the
/// backend's error otherwise.
#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    /// Validate and persist a new job, assigning its id (also written back
    /// into `job`).
    async fn insert(&self, job: &mut Job) -> Result<i64>;

    /// Atomically claim up to `limit` ready jobs, best priority first,
    /// marking each as leased and pinning it. Rows whose pin cannot be
    /// acquired are skipped, not waited on. `limit <= 0` yields no jobs.
    async fn lease(&self, limit: i64) -> Result<Vec<Job>>;

    /// Reclaim rows left leased by a previous hard exit: clear the lease
    /// mark and drop the pin on every ready row not pinned by a live
    /// session. Called at process start.
    async fn release_leased(&self) -> Result<()>;

    /// Unconditionally surrender every ready leased row, pins included.
    /// Called when a graceful stop runs out of time while workers are still
    /// executing.
    async fn release_all(&self) -> Result<()>;

    /// Settle `job` as successfully completed, recording its elapsed time
    /// and releasing the pin. `job` is updated to its post-settle state.
    async fn complete(&self, job: &mut Job) -> Result<()>;

    /// Settle `job` as failed with `error`. Reschedules with backoff while
    /// retry budget remains, otherwise marks the job terminally failed.
    /// `job` is updated to its post-settle state.
    async fn fail(&self, job: &mut Job, error: &str) -> Result<()>;

    /// Remove a job that has not started: pending and unleased. Leased or
    /// settled rows are left untouched.
    async fn delete(&self, job: &Job) -> Result<()>;

    /// Pending, unleased jobs routed to `name`, regardless of eligibility
    /// time. Soonest first.
    async fn enqueued_by_name(&self, name: &str) -> Result<Vec<Job>>;

    /// Jobs currently under execution (pending and leased). Unpaginated;
    /// bounded in practice by the dispatchers' concurrency.
    async fn processing(&self) -> Result<Vec<Job>>;

    /// One page of completed jobs, most recently scheduled first.
    async fn processed(&self, cursor: PageCursor) -> Result<Vec<Job>>;

    /// One page of terminally failed jobs, most recently scheduled first.
    async fn failed(&self, cursor: PageCursor) -> Result<Vec<Job>>;
}
