//! Testing utilities for the capstan job queue.
//!
//! [`MemoryJobStore`] implements the full store contract in memory, including
//! a simulated per-row pin set, so dispatcher behavior can be exercised
//! without a database. The canned workers cover the usual execution shapes:
//! sleeping, cooperative, stubborn, failing, panicking, recording.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use capstan_core::{
    CancellationToken, FailureOutcome, Job, JobConfig, JobStatus, JobStore, PageCursor, Worker,
    PAGE_SIZE,
};
use chrono::Utc;

/// In-memory [`JobStore`] with the same observable semantics as the
/// PostgreSQL implementation.
///
/// The pin set stands in for per-row advisory locks: `lease` acquires,
/// settles and releases drop, [`MemoryJobStore::drop_session_locks`]
/// simulates the sessions of a crashed process going away.
pub struct MemoryJobStore {
    config: JobConfig,
    lease_errors: AtomicUsize,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    next_id: i64,
    jobs: Vec<Job>,
    locks: HashSet<i64>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::with_config(JobConfig::default())
    }

    pub fn with_config(config: JobConfig) -> Self {
        Self {
            config,
            lease_errors: AtomicUsize::new(0),
            state: Mutex::new(State::default()),
        }
    }

    /// Make the next `count` lease calls fail, for exercising pump
    /// resilience.
    pub fn inject_lease_errors(&self, count: usize) {
        self.lease_errors.store(count, Ordering::SeqCst);
    }

    /// Forget every held pin without touching the rows, as if the sessions
    /// holding them died. Leased rows become reclaimable by
    /// `release_leased`.
    pub fn drop_session_locks(&self) {
        self.state().locks.clear();
    }

    /// Snapshot of a stored job by id.
    pub fn get(&self, id: i64) -> Option<Job> {
        self.state().jobs.iter().find(|j| j.id == id).cloned()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("job store state poisoned")
    }

    fn page(&self, status: JobStatus, cursor: PageCursor) -> Vec<Job> {
        let state = self.state();
        let mut rows: Vec<Job> = state
            .jobs
            .iter()
            .filter(|j| j.status == status)
            .filter(|j| match cursor.position() {
                None => true,
                Some((run_after, id)) => {
                    j.run_after < run_after || (j.run_after == run_after && j.id < id)
                }
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.run_after.cmp(&a.run_after).then(b.id.cmp(&a.id)));
        rows.truncate(PAGE_SIZE as usize);
        rows
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &mut Job) -> Result<i64> {
        job.validate()?;
        let mut state = self.state();
        state.next_id += 1;
        job.id = state.next_id;
        state.jobs.push(job.clone());
        Ok(job.id)
    }

    async fn lease(&self, limit: i64) -> Result<Vec<Job>> {
        if self
            .lease_errors
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            bail!("injected lease failure");
        }
        if limit <= 0 {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let mut guard = self.state();
        let state = &mut *guard;

        let mut candidates: Vec<(i32, i64)> = state
            .jobs
            .iter()
            .filter(|j| {
                j.status == JobStatus::Pending
                    && j.grabbed.is_none()
                    && j.run_after <= now
                    && !state.locks.contains(&j.id)
            })
            .map(|j| (j.priority, j.id))
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        candidates.truncate(limit as usize);

        let mut leased = Vec::with_capacity(candidates.len());
        for (_, id) in candidates {
            state.locks.insert(id);
            if let Some(job) = state.jobs.iter_mut().find(|j| j.id == id) {
                job.grabbed = Some(now);
                leased.push(job.clone());
            }
        }
        Ok(leased)
    }

    async fn release_leased(&self) -> Result<()> {
        let now = Utc::now();
        let mut guard = self.state();
        let state = &mut *guard;
        for job in state.jobs.iter_mut() {
            if job.status == JobStatus::Pending
                && job.grabbed.is_some()
                && job.run_after <= now
                && !state.locks.contains(&job.id)
            {
                job.grabbed = None;
            }
        }
        Ok(())
    }

    async fn release_all(&self) -> Result<()> {
        let now = Utc::now();
        let mut guard = self.state();
        let state = &mut *guard;
        for job in state.jobs.iter_mut() {
            if job.status == JobStatus::Pending && job.grabbed.is_some() && job.run_after <= now {
                job.grabbed = None;
                state.locks.remove(&job.id);
            }
        }
        Ok(())
    }

    async fn complete(&self, job: &mut Job) -> Result<()> {
        let mut updated = job.clone();
        updated.record_completion();

        let mut state = self.state();
        if let Some(stored) = state.jobs.iter_mut().find(|j| j.id == job.id) {
            stored.status = updated.status;
            stored.run_count = updated.run_count;
            stored.elapsed = updated.elapsed;
        }
        state.locks.remove(&job.id);
        *job = updated;
        Ok(())
    }

    async fn fail(&self, job: &mut Job, error: &str) -> Result<()> {
        let mut updated = job.clone();
        let outcome = updated.record_failure(error, &self.config);

        let mut state = self.state();
        if let Some(stored) = state.jobs.iter_mut().find(|j| j.id == job.id) {
            stored.run_count = updated.run_count;
            stored.elapsed = updated.elapsed;
            stored.last_error = updated.last_error.clone();
            match outcome {
                FailureOutcome::Exhausted => stored.status = JobStatus::Failed,
                FailureOutcome::Retry { .. } => {
                    stored.retry_delay = updated.retry_delay;
                    stored.run_after = updated.run_after;
                    stored.grabbed = None;
                }
            }
        }
        state.locks.remove(&job.id);
        *job = updated;
        Ok(())
    }

    async fn delete(&self, job: &Job) -> Result<()> {
        let mut state = self.state();
        state
            .jobs
            .retain(|j| !(j.id == job.id && j.status == JobStatus::Pending && j.grabbed.is_none()));
        Ok(())
    }

    async fn enqueued_by_name(&self, name: &str) -> Result<Vec<Job>> {
        let state = self.state();
        let mut rows: Vec<Job> = state
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Pending && j.grabbed.is_none() && j.name == name)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.run_after.cmp(&b.run_after).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn processing(&self) -> Result<Vec<Job>> {
        let state = self.state();
        let mut rows: Vec<Job> = state
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Pending && j.grabbed.is_some())
            .cloned()
            .collect();
        rows.sort_by_key(|j| j.id);
        Ok(rows)
    }

    async fn processed(&self, cursor: PageCursor) -> Result<Vec<Job>> {
        Ok(self.page(JobStatus::Completed, cursor))
    }

    async fn failed(&self, cursor: PageCursor) -> Result<Vec<Job>> {
        Ok(self.page(JobStatus::Failed, cursor))
    }
}

/// Succeeds after sleeping a fixed time. Does not watch its token.
pub struct SleepingWorker {
    duration: Duration,
}

impl SleepingWorker {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

#[async_trait::async_trait]
impl Worker for SleepingWorker {
    async fn run(&self, _cancel: CancellationToken, _job: &Job) -> Result<()> {
        tokio::time::sleep(self.duration).await;
        Ok(())
    }
}

/// Works for a fixed time but honors cancellation, erroring out as soon as
/// the token fires.
pub struct CooperativeWorker {
    busy: Duration,
}

impl CooperativeWorker {
    pub fn new(busy: Duration) -> Self {
        Self { busy }
    }
}

#[async_trait::async_trait]
impl Worker for CooperativeWorker {
    async fn run(&self, cancel: CancellationToken, _job: &Job) -> Result<()> {
        tokio::select! {
            _ = tokio::time::sleep(self.busy) => Ok(()),
            _ = cancel.cancelled() => Err(anyhow!("cancelled while working")),
        }
    }
}

/// Deliberately ignores its token and keeps going for the full duration,
/// for exercising stop deadlines against runaway work.
pub struct StubbornWorker {
    busy: Duration,
}

impl StubbornWorker {
    pub fn new(busy: Duration) -> Self {
        Self { busy }
    }
}

#[async_trait::async_trait]
impl Worker for StubbornWorker {
    async fn run(&self, _cancel: CancellationToken, _job: &Job) -> Result<()> {
        tokio::time::sleep(self.busy).await;
        Ok(())
    }
}

/// Always fails with a fixed message.
pub struct FailingWorker {
    message: String,
}

impl FailingWorker {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait::async_trait]
impl Worker for FailingWorker {
    async fn run(&self, _cancel: CancellationToken, _job: &Job) -> Result<()> {
        Err(anyhow!("{}", self.message))
    }
}

/// Always panics, for exercising panic isolation.
pub struct PanickingWorker {
    message: &'static str,
}

impl PanickingWorker {
    pub fn new(message: &'static str) -> Self {
        Self { message }
    }
}

#[async_trait::async_trait]
impl Worker for PanickingWorker {
    async fn run(&self, _cancel: CancellationToken, _job: &Job) -> Result<()> {
        panic!("{}", self.message);
    }
}

/// Records the names of the jobs it runs, in order.
#[derive(Default)]
pub struct RecordingWorker {
    names: Mutex<Vec<String>>,
}

impl RecordingWorker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn names(&self) -> Vec<String> {
        self.names.lock().expect("recording log poisoned").clone()
    }
}

#[async_trait::async_trait]
impl Worker for RecordingWorker {
    async fn run(&self, _cancel: CancellationToken, job: &Job) -> Result<()> {
        self.names
            .lock()
            .expect("recording log poisoned")
            .push(job.name.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    async fn seed(store: &MemoryJobStore, name: &str, priority: i32, timeout: i32) -> Job {
        let mut job = Job::new(name, "", timeout);
        job.priority = priority;
        store.insert(&mut job).await.unwrap();
        job
    }

    #[tokio::test]
    async fn insert_assigns_increasing_ids() {
        let store = MemoryJobStore::new();
        let first = seed(&store, "a", 0, 5).await;
        let second = seed(&store, "b", 0, 5).await;
        assert!(second.id > first.id);
    }

    #[tokio::test]
    async fn insert_surfaces_validation_errors() {
        let store = MemoryJobStore::new();
        let mut bad = Job::new("", "not json", 0);
        let err = store.insert(&mut bad).await.unwrap_err();
        let validation = err
            .downcast_ref::<capstan_core::ValidationError>()
            .expect("should be a validation error");
        assert!(validation.violates("name"));
        assert!(validation.violates("timeout"));
        assert!(validation.violates("payload"));
    }

    #[tokio::test]
    async fn lease_respects_priority_order() {
        let store = MemoryJobStore::new();
        for priority in 0..5 {
            seed(&store, "prio", priority, 5).await;
        }

        let first = store.lease(2).await.unwrap();
        assert_eq!(
            first.iter().map(|j| j.priority).collect::<Vec<_>>(),
            vec![4, 3]
        );

        let rest = store.lease(5).await.unwrap();
        assert_eq!(
            rest.iter().map(|j| j.priority).collect::<Vec<_>>(),
            vec![2, 1, 0]
        );
    }

    #[tokio::test]
    async fn lease_marks_rows_and_skips_them_afterwards() {
        let store = MemoryJobStore::new();
        let job = seed(&store, "once", 0, 5).await;

        let leased = store.lease(1).await.unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].id, job.id);
        assert!(leased[0].grabbed.is_some());

        assert!(store.lease(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lease_ignores_future_and_settled_jobs() {
        let store = MemoryJobStore::new();
        let mut future = Job::new("future", "", 5);
        future.run_after = Utc::now() + ChronoDuration::hours(4);
        store.insert(&mut future).await.unwrap();

        let mut done = seed(&store, "done", 0, 5).await;
        store.complete(&mut done).await.unwrap();

        assert!(store.lease(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lease_with_zero_limit_returns_nothing() {
        let store = MemoryJobStore::new();
        seed(&store, "a", 0, 5).await;
        assert!(store.lease(0).await.unwrap().is_empty());
        assert!(store.lease(-3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lease_returns_only_what_is_available() {
        let store = MemoryJobStore::new();
        seed(&store, "a", 0, 5).await;
        seed(&store, "b", 0, 5).await;
        assert_eq!(store.lease(10).await.unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_leases_never_share_a_job() {
        let store = std::sync::Arc::new(MemoryJobStore::new());
        for i in 0..4 {
            seed(&store, &format!("job{i}"), 0, 5).await;
        }

        let a = {
            let store = store.clone();
            tokio::spawn(async move { store.lease(3).await.unwrap() })
        };
        let b = {
            let store = store.clone();
            tokio::spawn(async move { store.lease(3).await.unwrap() })
        };
        let (a, b) = (a.await.unwrap(), b.await.unwrap());

        let mut ids: Vec<i64> = a.iter().chain(b.iter()).map(|j| j.id).collect();
        let total = ids.len();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), total);
        assert_eq!(total, 4);
    }

    #[tokio::test]
    async fn fail_applies_the_backoff_schedule() {
        let store = MemoryJobStore::new();
        let mut job = seed(&store, "retry", 0, 5).await;
        let scheduled_at = job.run_after;

        store.fail(&mut job, "first").await.unwrap();
        assert_eq!(job.run_count, 1);
        assert_eq!(job.retry_delay, 26);
        assert_eq!(job.run_after, scheduled_at + ChronoDuration::seconds(26));
        assert_eq!(job.status, JobStatus::Pending);

        store.fail(&mut job, "second").await.unwrap();
        assert_eq!(job.run_count, 2);
        assert_eq!(job.retry_delay, 62);
        assert_eq!(
            job.run_after,
            scheduled_at + ChronoDuration::seconds(26 + 62)
        );

        store.fail(&mut job, "third").await.unwrap();
        assert_eq!(job.run_count, 3);
        assert_eq!(job.status, JobStatus::Failed);

        let failed = store.failed(PageCursor::first()).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, job.id);
        assert_eq!(failed[0].last_error, "third");
    }

    #[tokio::test]
    async fn failed_jobs_are_not_leasable_again() {
        let store = MemoryJobStore::with_config(JobConfig {
            max_retry_count: 1,
            retry_delay: 5,
        });
        let mut job = Job::new("doomed", "", 5);
        store.insert(&mut job).await.unwrap();
        store.fail(&mut job, "boom").await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(store.lease(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn completed_jobs_observe_identically_on_every_read() {
        let store = MemoryJobStore::new();
        let mut job = seed(&store, "done", 0, 7).await;
        job.elapsed = 0.25;
        store.complete(&mut job).await.unwrap();

        let first = store.processed(PageCursor::first()).await.unwrap();
        let second = store.processed(PageCursor::first()).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, second[0].id);
        assert_eq!(first[0].run_count, second[0].run_count);
        assert_eq!(first[0].elapsed, second[0].elapsed);
        assert_eq!(first[0].run_count, 1);
        assert_eq!(first[0].elapsed, 0.25);
    }

    #[tokio::test]
    async fn round_trip_preserves_submitted_fields() {
        let store = MemoryJobStore::new();
        let mut job = Job::new("echo", r#"{"n":1}"#, 9);
        job.priority = 3;
        store.insert(&mut job).await.unwrap();

        let leased = store.lease(1).await.unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].name, "echo");
        assert_eq!(leased[0].timeout, 9);
        assert_eq!(leased[0].priority, 3);
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&leased[0].payload).unwrap(),
            serde_json::json!({"n": 1})
        );
    }

    #[tokio::test]
    async fn pagination_walks_pages_of_twenty_five() {
        let store = MemoryJobStore::new();
        for timeout in 1..=51 {
            let mut job = Job::new("page", "", timeout);
            store.insert(&mut job).await.unwrap();
            store.complete(&mut job).await.unwrap();
        }

        let page1 = store.processed(PageCursor::first()).await.unwrap();
        assert_eq!(page1.len(), 25);
        assert_eq!(page1[0].timeout, 51);

        let page2 = store.processed(PageCursor::after(&page1[24])).await.unwrap();
        assert_eq!(page2.len(), 25);
        assert_eq!(page2[0].timeout, 26);

        let page3 = store.processed(PageCursor::after(&page2[24])).await.unwrap();
        assert_eq!(page3.len(), 1);
        assert_eq!(page3[0].timeout, 1);
    }

    #[tokio::test]
    async fn release_leased_reclaims_rows_from_dead_sessions() {
        let store = MemoryJobStore::new();
        seed(&store, "orphan", 0, 5).await;
        assert_eq!(store.lease(1).await.unwrap().len(), 1);

        // While the pin is held the row stays put.
        store.release_leased().await.unwrap();
        assert_eq!(store.processing().await.unwrap().len(), 1);

        // After the holding session dies the sweep reclaims it.
        store.drop_session_locks();
        store.release_leased().await.unwrap();
        assert!(store.processing().await.unwrap().is_empty());
        assert_eq!(store.lease(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn release_all_surrenders_held_leases() {
        let store = MemoryJobStore::new();
        let job = seed(&store, "held", 0, 5).await;
        assert_eq!(store.lease(1).await.unwrap().len(), 1);

        store.release_all().await.unwrap();
        assert!(store.processing().await.unwrap().is_empty());
        let snapshot = store.get(job.id).unwrap();
        assert_eq!(snapshot.status, JobStatus::Pending);
        assert!(snapshot.grabbed.is_none());
        assert_eq!(snapshot.run_count, 0);
    }

    #[tokio::test]
    async fn delete_removes_only_unstarted_jobs() {
        let store = MemoryJobStore::new();
        let mut scheduled = Job::new("later", "", 5);
        scheduled.run_after = Utc::now() + ChronoDuration::hours(4);
        store.insert(&mut scheduled).await.unwrap();

        assert_eq!(store.enqueued_by_name("later").await.unwrap().len(), 1);
        store.delete(&scheduled).await.unwrap();
        assert!(store.enqueued_by_name("later").await.unwrap().is_empty());

        let running = seed(&store, "running", 0, 5).await;
        store.lease(1).await.unwrap();
        store.delete(&running).await.unwrap();
        assert_eq!(store.processing().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn injected_lease_errors_fail_then_clear() {
        let store = MemoryJobStore::new();
        seed(&store, "a", 0, 5).await;
        store.inject_lease_errors(1);
        assert!(store.lease(1).await.is_err());
        assert_eq!(store.lease(1).await.unwrap().len(), 1);
    }
}
