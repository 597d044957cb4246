//! The contract executed for each leased job.

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::job::Job;

/// User-supplied job execution.
///
/// `cancel` fires when the job's timeout elapses after entry into `run`.
/// Cancellation is advisory: the dispatcher never force-drops a running
/// worker, it waits for the future to return (up to the stop deadline during
/// shutdown) and settles the run as timed out if the token fired first.
///
/// Returning `Err` settles the run as failed with the error's message
/// recorded on the job row.
#[async_trait::async_trait]
pub trait Worker: Send + Sync {
    async fn run(&self, cancel: CancellationToken, job: &Job) -> Result<()>;
}
