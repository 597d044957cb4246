//! The dispatcher: a periodic lease pump feeding a bounded parallel executor.
//!
//! One number bounds everything: the job buffer capacity, the semaphore, and
//! therefore the in-flight execution count. The pump tops the in-flight set
//! up on a fixed tick; once downstream is saturated the bounded buffer makes
//! the pump block instead of over-leasing. The executor feeds jobs to
//! independent tasks in the order they were leased (best priority first);
//! completion order across parallel executions is unspecified.
//!
//! Shutdown is coordinated by single-shot signals: `stop` tells the pump to
//! quit ticking, the pump closes the job buffer, the executor drains it and
//! waits for every running execution, then reports back. A process may run
//! several dispatchers with different concurrency and cadence against the
//! same store (a fast-poll small-concurrency lane next to a slow-poll batch
//! lane) because leasing is race-safe.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::StopError;
use crate::job::Job;
use crate::store::JobStore;
use crate::worker::Worker;

/// A pump/executor pair owning a concurrency bound and a poll cadence.
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    worker: Arc<dyn Worker>,
    max_concurrency: usize,
    running: Arc<Semaphore>,
    stop_tick: Option<oneshot::Sender<()>>,
    stopped: Option<oneshot::Receiver<()>>,
}

impl Dispatcher {
    /// Create a dispatcher executing through `worker` with at most
    /// `max_concurrency` jobs in flight.
    ///
    /// # Panics
    ///
    /// Panics if `max_concurrency` is zero.
    pub fn new(store: Arc<dyn JobStore>, max_concurrency: usize, worker: Arc<dyn Worker>) -> Self {
        assert!(max_concurrency > 0, "max_concurrency must be at least one");
        Self {
            store,
            worker,
            max_concurrency,
            running: Arc::new(Semaphore::new(max_concurrency)),
            stop_tick: None,
            stopped: None,
        }
    }

    /// Executions currently in flight.
    pub fn in_flight(&self) -> usize {
        self.max_concurrency - self.running.available_permits()
    }

    /// Start the pump and executor. The first lease attempt happens one
    /// `interval` after the call; jobs becoming eligible between ticks wait
    /// for the next one.
    ///
    /// Calling `start` on an already started dispatcher does nothing.
    pub fn start(&mut self, interval: Duration) {
        if self.stop_tick.is_some() {
            return;
        }

        let (job_tx, mut job_rx) = mpsc::channel::<Job>(self.max_concurrency);
        let (stop_tick_tx, mut stop_tick_rx) = oneshot::channel::<()>();
        let (stopped_tx, stopped_rx) = oneshot::channel::<()>();
        self.stop_tick = Some(stop_tick_tx);
        self.stopped = Some(stopped_rx);

        let store = Arc::clone(&self.store);
        let running = Arc::clone(&self.running);
        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let idle = running.available_permits();
                        if idle == 0 {
                            continue;
                        }
                        let jobs = match store.lease(idle as i64).await {
                            Ok(jobs) => jobs,
                            Err(error) => {
                                error!(error = %error, "lease failed, skipping tick");
                                continue;
                            }
                        };
                        for job in jobs {
                            if job_tx.send(job).await.is_err() {
                                return;
                            }
                        }
                    }
                    _ = &mut stop_tick_rx => break,
                }
            }
            // Dropping job_tx closes the buffer, which stops the executor
            // once it has drained what was already leased.
        });

        let store = Arc::clone(&self.store);
        let worker = Arc::clone(&self.worker);
        let running = Arc::clone(&self.running);
        tokio::spawn(async move {
            let mut executions = JoinSet::new();
            loop {
                tokio::select! {
                    next = job_rx.recv() => {
                        let Some(job) = next else { break };
                        let Ok(permit) = Arc::clone(&running).acquire_owned().await else {
                            break;
                        };
                        executions.spawn(execute(
                            Arc::clone(&store),
                            Arc::clone(&worker),
                            job,
                            permit,
                        ));
                    }
                    Some(_) = executions.join_next(), if !executions.is_empty() => {}
                }
            }
            while executions.join_next().await.is_some() {}
            let _ = stopped_tx.send(());
        });
    }

    /// Graceful stop: quit leasing, drain the buffer, wait for in-flight
    /// executions.
    ///
    /// Returns `Ok(())` when everything settled before `deadline`. On expiry
    /// the leases of still-running executions are surrendered through
    /// [`JobStore::release_all`], and `StopError::DeadlineExceeded` is
    /// returned. Another process may re-lease those jobs while the stragglers
    /// keep running; that is the documented at-least-once trade.
    pub async fn stop(&mut self, deadline: Duration) -> Result<(), StopError> {
        let Some(stop_tick) = self.stop_tick.take() else {
            return Ok(());
        };
        let _ = stop_tick.send(());
        let Some(stopped) = self.stopped.take() else {
            return Ok(());
        };

        match time::timeout(deadline, stopped).await {
            Ok(_) => Ok(()),
            Err(_) => {
                self.store.release_all().await?;
                Err(StopError::DeadlineExceeded)
            }
        }
    }
}

/// Run one leased job to its settle.
///
/// The permit is held for the whole execution; dropping it frees an
/// in-flight slot for the pump's next top-up.
async fn execute(
    store: Arc<dyn JobStore>,
    worker: Arc<dyn Worker>,
    mut job: Job,
    _permit: OwnedSemaphorePermit,
) {
    let started = Instant::now();
    let cancel = CancellationToken::new();
    let deadline = Duration::from_secs(job.timeout.max(0) as u64);
    let deadline_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            time::sleep(deadline).await;
            cancel.cancel();
        })
    };

    let outcome = AssertUnwindSafe(worker.run(cancel.clone(), &job))
        .catch_unwind()
        .await;
    deadline_task.abort();
    job.elapsed = started.elapsed().as_secs_f64();

    let failure = match outcome {
        Err(panic) => Some(panic_message(panic.as_ref())),
        Ok(_) if cancel.is_cancelled() => Some(format!("timed out after {}s", job.timeout)),
        Ok(Err(error)) => Some(format!("{error:#}")),
        Ok(Ok(())) => None,
    };

    match failure {
        None => {
            if let Err(error) = store.complete(&mut job).await {
                error!(
                    job_id = job.id,
                    error = %error,
                    "recording completion failed, job stays leased until reclaimed"
                );
            } else {
                debug!(
                    job_id = job.id,
                    name = %job.name,
                    elapsed = job.elapsed,
                    "job completed"
                );
            }
        }
        Some(reason) => {
            warn!(job_id = job.id, name = %job.name, error = %reason, "job failed");
            if let Err(error) = store.fail(&mut job, &reason).await {
                error!(
                    job_id = job.id,
                    error = %error,
                    "recording failure failed, job stays leased until reclaimed"
                );
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("worker panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("worker panicked: {message}")
    } else {
        "worker panicked".to_owned()
    }
}
