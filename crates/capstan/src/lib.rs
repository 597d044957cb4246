//! # Capstan
//!
//! A durable, prioritized, retrying job queue built atop a relational
//! database. Producers insert jobs; one or more dispatchers lease ready jobs,
//! execute them through a user-supplied [`Worker`], and record the outcome.
//! Durability, ordering, and single-leaseholder execution are enforced by the
//! store; concurrency, pacing, timeouts, and lifecycle are enforced by the
//! dispatcher.
//!
//! ## Architecture
//!
//! ```text
//! Producer
//!     │
//!     ▼ insert()                       status = pending
//! JobStore ◄───────────────────────────────────────────┐
//!     │                                                │
//!     ▼ lease(max − in-flight)   every tick            │
//! Dispatcher pump                                      │
//!     │                                                │
//!     ▼ bounded buffer (capacity = max concurrency)    │
//! Executor ──► execution task ──► Worker::run(token)   │
//!                   │                                  │
//!                   └─► complete() / fail() ───────────┘
//! ```
//!
//! ## Key invariants
//!
//! 1. **Settled rows stay settled** - a job that is not pending is never
//!    leased again.
//! 2. **One leaseholder worldwide** - a pending row marked as leased is under
//!    execution by exactly one dispatcher; the store's per-row pin makes
//!    concurrent leases race-safe, losers skip.
//! 3. **Run counts only grow** - every settle increments `run_count` by one.
//! 4. **Failures back off additively** - the k-th failure pushes `run_after`
//!    by `k⁴ + timeout + retry_delay + 15` seconds past its previous value
//!    until the retry budget is spent, then the job goes terminally failed.
//! 5. **At-least-once** - a crash between execution and settle re-runs the
//!    job after the next process start reclaims its lease.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use capstan_core::{CancellationToken, Dispatcher, Job, JobStore, Worker};
//!
//! struct Greeter;
//!
//! #[async_trait::async_trait]
//! impl Worker for Greeter {
//!     async fn run(&self, _cancel: CancellationToken, job: &Job) -> anyhow::Result<()> {
//!         println!("hello from job {}", job.id);
//!         Ok(())
//!     }
//! }
//!
//! # async fn example(store: Arc<dyn JobStore>) -> anyhow::Result<()> {
//! store.release_leased().await?; // reclaim leases from a previous hard exit
//!
//! let mut job = Job::new("greet", "", 30);
//! store.insert(&mut job).await?;
//!
//! let mut dispatcher = Dispatcher::new(store, 4, Arc::new(Greeter));
//! dispatcher.start(Duration::from_millis(200));
//! // ...
//! dispatcher.stop(Duration::from_secs(5)).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## What this is not
//!
//! Capstan does not offer exactly-once execution across a crash, cross-queue
//! ordering, strict FIFO (ordering is by priority with id tie-break per
//! lease call), or push delivery - dispatchers pull on a fixed cadence.

mod dispatcher;
mod error;
mod job;
mod store;
mod worker;

// Re-export the job model
pub use crate::job::{FailureOutcome, Job, JobConfig, JobStatus};

// Re-export error types
pub use crate::error::{FieldError, InvalidStatus, StopError, ValidationError};

// Re-export the store contract
pub use crate::store::{JobStore, PageCursor, PAGE_SIZE};

// Re-export the dispatcher and worker contract
pub use crate::dispatcher::Dispatcher;
pub use crate::worker::Worker;

// Re-export commonly used external types
pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;
