//! The persistent job model: fields, validation, and settle transitions.
//!
//! A [`Job`] is the sole durable entity in the queue. The store owns every
//! field except `run_count`, `elapsed`, and `last_error` during the window
//! between lease and settle; in that window the in-memory copy held by the
//! executing task is the mutator and the settle write is the commit.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{InvalidStatus, ValidationError};

/// Execution state of a job row.
///
/// Stored as a small integer; values outside `0..=2` are rejected at the
/// conversion boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i16", try_from = "i16")]
pub enum JobStatus {
    /// Waiting to run, or scheduled for a retry.
    Pending,
    /// Finished successfully.
    Completed,
    /// Exhausted its retry budget.
    Failed,
}

impl From<JobStatus> for i16 {
    fn from(status: JobStatus) -> i16 {
        match status {
            JobStatus::Pending => 0,
            JobStatus::Completed => 1,
            JobStatus::Failed => 2,
        }
    }
}

impl TryFrom<i16> for JobStatus {
    type Error = InvalidStatus;

    fn try_from(value: i16) -> Result<Self, InvalidStatus> {
        match value {
            0 => Ok(JobStatus::Pending),
            1 => Ok(JobStatus::Completed),
            2 => Ok(JobStatus::Failed),
            other => Err(InvalidStatus(other)),
        }
    }
}

/// Process-wide job defaults, threaded into store construction.
///
/// `retry_delay` seeds the backoff baseline of newly created jobs;
/// `max_retry_count` bounds how many runs a job gets before it is marked
/// terminally failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobConfig {
    /// Runs (first attempt included) before a failing job goes terminal.
    pub max_retry_count: i32,
    /// Initial backoff baseline in seconds.
    pub retry_delay: i64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            max_retry_count: 3,
            retry_delay: 5,
        }
    }
}

/// Result of applying a failure to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// The job was rescheduled `delay` seconds after its previous `run_after`.
    Retry {
        /// Backoff applied, in seconds.
        delay: i64,
    },
    /// The retry budget is spent; the job is terminally failed.
    Exhausted,
}

/// A unit of deferred work with identity, payload, scheduling metadata, and
/// retry state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Assigned by the store on insert.
    pub id: i64,
    /// Worker routing name. Required.
    pub name: String,
    /// Raw JSON document, or empty for payload-less jobs.
    pub payload: String,
    pub status: JobStatus,
    /// Higher runs first.
    pub priority: i32,
    /// The job is not eligible to run before this instant.
    pub run_after: DateTime<Utc>,
    /// Per-execution deadline in seconds. Must be positive.
    pub timeout: i32,
    /// Settled executions so far.
    pub run_count: i32,
    /// Current backoff baseline in seconds.
    pub retry_delay: i64,
    /// Duration of the last execution, in seconds.
    pub elapsed: f64,
    /// Message from the last failed execution.
    pub last_error: String,
    /// Non-null while leased by a dispatcher.
    pub grabbed: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a pending job eligible to run immediately, with defaults from
    /// [`JobConfig::default`].
    ///
    /// `timeout` must be greater than zero; this is enforced when the job is
    /// saved, not here.
    pub fn new(name: impl Into<String>, payload: impl Into<String>, timeout: i32) -> Self {
        Self::with_config(name, payload, timeout, &JobConfig::default())
    }

    /// Like [`Job::new`] but seeding the backoff baseline from an explicit
    /// config.
    pub fn with_config(
        name: impl Into<String>,
        payload: impl Into<String>,
        timeout: i32,
        config: &JobConfig,
    ) -> Self {
        Self {
            id: 0,
            name: name.into(),
            payload: payload.into(),
            status: JobStatus::Pending,
            priority: 0,
            run_after: Utc::now(),
            timeout,
            run_count: 0,
            retry_delay: config.retry_delay,
            elapsed: 0.0,
            last_error: String::new(),
            grabbed: None,
        }
    }

    /// Check the insert-time rules: name required, timeout positive, payload
    /// empty or well-formed JSON.
    ///
    /// Returns every violation at once rather than stopping at the first.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut violations = ValidationError::new();
        if self.name.is_empty() {
            violations.push("name", "is required");
        }
        if self.timeout <= 0 {
            violations.push("timeout", "must be greater than zero");
        }
        if !self.payload.is_empty() {
            if let Err(err) = serde_json::from_str::<serde_json::Value>(&self.payload) {
                violations.push("payload", format!("must be valid JSON: {err}"));
            }
        }
        violations.into_result()
    }

    /// The backoff that the next failure would apply, in seconds:
    /// `k⁴ + timeout + retry_delay + 15` where `k` counts the failing run.
    pub fn next_retry_delay(&self) -> i64 {
        let k = i64::from(self.run_count) + 1;
        k.pow(4) + i64::from(self.timeout) + self.retry_delay + 15
    }

    /// Apply a successful settle: one more run, terminal completed state.
    pub fn record_completion(&mut self) {
        self.run_count += 1;
        self.status = JobStatus::Completed;
    }

    /// Apply a failed settle.
    ///
    /// While runs remain the job stays pending: the backoff is added to the
    /// previous `run_after` (not to now, so rapid failures do not compound
    /// wall-clock drift), the baseline is raised to the applied delay, and
    /// the lease is dropped. Once `max_retry_count` runs are spent the job
    /// goes terminally failed and keeps its lease timestamp as a record.
    pub fn record_failure(&mut self, error: &str, config: &JobConfig) -> FailureOutcome {
        let attempts = self.run_count + 1;
        if attempts >= config.max_retry_count {
            self.run_count = attempts;
            self.status = JobStatus::Failed;
            self.last_error = error.to_owned();
            FailureOutcome::Exhausted
        } else {
            let delay = self.next_retry_delay();
            self.run_count = attempts;
            self.retry_delay = delay;
            self.run_after += Duration::seconds(delay);
            self.last_error = error.to_owned();
            self.grabbed = None;
            FailureOutcome::Retry { delay }
        }
    }
}
