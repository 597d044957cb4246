//! # Queue server demo
//!
//! Wires the queue end to end: an HTTP ingress that turns submissions into
//! inserts, two dispatcher lanes with different concurrency and cadence
//! against one store, admin listings, and a signal-driven shutdown that gives
//! every component a five second deadline.
//!
//! Try it:
//!
//! ```text
//! curl -X POST localhost:8080/job \
//!     -d '{"name":"sleep","payload":{"millis":1500},"timeout":20}'
//! curl -X POST localhost:8080/seed
//! curl localhost:8080/jobs/processing
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use capstan_core::{CancellationToken, Dispatcher, Job, JobStore, PageCursor, Worker};
use capstan_postgres::{init_schema, PgJobStore};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::postgres::PgPoolOptions;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_DSN: &str = "host=localhost user=postgres dbname=postgres sslmode=disable";

struct Config {
    dsn: String,
    bind: String,
}

impl Config {
    fn from_env() -> Self {
        Self {
            dsn: std::env::var("PSQL_DSN").unwrap_or_else(|_| DEFAULT_DSN.to_owned()),
            bind: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_owned()),
        }
    }
}

// ============================================================================
// Worker
// ============================================================================

#[derive(Debug, Deserialize)]
struct SleepPayload {
    #[serde(default)]
    millis: u64,
}

/// Sleeps for the duration named by the payload, giving up as soon as the
/// deadline token fires.
struct SleepWorker;

#[async_trait::async_trait]
impl Worker for SleepWorker {
    async fn run(&self, cancel: CancellationToken, job: &Job) -> Result<()> {
        let millis = if job.payload.is_empty() {
            0
        } else {
            serde_json::from_str::<SleepPayload>(&job.payload)
                .context("undecodable sleep payload")?
                .millis
        };

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(millis)) => Ok(()),
            _ = cancel.cancelled() => Err(anyhow!("gave up after the {}s deadline", job.timeout)),
        }
    }
}

// ============================================================================
// HTTP handlers
// ============================================================================

#[derive(Clone)]
struct AppState {
    store: Arc<PgJobStore>,
}

#[derive(Debug, Deserialize)]
struct SubmitJob {
    name: String,
    #[serde(default)]
    payload: Option<serde_json::Value>,
    timeout: i32,
}

async fn submit_job(State(state): State<AppState>, body: Bytes) -> Response {
    let submission: SubmitJob = match serde_json::from_slice(&body) {
        Ok(submission) => submission,
        Err(err) => return (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    };

    let payload = submission
        .payload
        .map(|v| v.to_string())
        .unwrap_or_default();
    let mut job = Job::new(submission.name, payload, submission.timeout);
    match state.store.insert(&mut job).await {
        Ok(id) => Json(serde_json::json!({ "id": id })).into_response(),
        Err(err) => (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    }
}

async fn reject_method() -> StatusCode {
    StatusCode::BAD_REQUEST
}

/// Insert a batch of randomized sleep jobs, for watching the lanes drain.
async fn seed_jobs(State(state): State<AppState>) -> Response {
    for _ in 0..50 {
        let millis = fastrand::u64(100..=5_000);
        let mut job = Job::new("sleep", format!(r#"{{"millis":{millis}}}"#), 20);
        if let Err(err) = state.store.insert(&mut job).await {
            return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
        }
    }
    StatusCode::OK.into_response()
}

#[derive(Debug, Deserialize)]
struct CursorParams {
    run_after: Option<DateTime<Utc>>,
    id: Option<i64>,
}

impl CursorParams {
    fn cursor(&self) -> PageCursor {
        match (self.run_after, self.id) {
            (Some(run_after), Some(id)) => PageCursor::resume(run_after, id),
            _ => PageCursor::first(),
        }
    }
}

async fn processing_jobs(State(state): State<AppState>) -> Response {
    match state.store.processing().await {
        Ok(jobs) => Json(jobs).into_response(),
        Err(err) => admin_error(err),
    }
}

async fn processed_jobs(
    State(state): State<AppState>,
    Query(params): Query<CursorParams>,
) -> Response {
    match state.store.processed(params.cursor()).await {
        Ok(jobs) => Json(jobs).into_response(),
        Err(err) => admin_error(err),
    }
}

async fn failed_jobs(
    State(state): State<AppState>,
    Query(params): Query<CursorParams>,
) -> Response {
    match state.store.failed(params.cursor()).await {
        Ok(jobs) => Json(jobs).into_response(),
        Err(err) => admin_error(err),
    }
}

fn admin_error(err: anyhow::Error) -> Response {
    warn!(error = %err, "admin listing failed");
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,queue_server=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.dsn)
        .await
        .context("failed to connect to database")?;
    init_schema(&pool).await.context("failed to prepare schema")?;

    let store = Arc::new(PgJobStore::new(pool));
    store
        .release_leased()
        .await
        .context("failed to reclaim abandoned leases")?;

    // A quick-poll lane for short jobs next to a slower, wider batch lane.
    let worker = Arc::new(SleepWorker);
    let mut fast_lane = Dispatcher::new(store.clone(), 6, worker.clone());
    fast_lane.start(Duration::from_millis(200));
    let mut batch_lane = Dispatcher::new(store.clone(), 4, worker);
    batch_lane.start(Duration::from_millis(500));

    let app = Router::new()
        .route("/job", post(submit_job).fallback(reject_method))
        .route("/seed", post(seed_jobs))
        .route("/jobs/processing", get(processing_jobs))
        .route("/jobs/processed", get(processed_jobs))
        .route("/jobs/failed", get(failed_jobs))
        .with_state(AppState { store });

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    info!(addr = %config.bind, "queue server listening");

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;
    let mut quit = signal(SignalKind::quit())?;
    let shutdown = async move {
        tokio::select! {
            _ = interrupt.recv() => {},
            _ = terminate.recv() => {},
            _ = hangup.recv() => {},
            _ = quit.recv() => {},
        }
        info!("shutdown signal received");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("server error")?;

    info!("stopping dispatchers");
    let (fast, batch) = tokio::join!(
        fast_lane.stop(Duration::from_secs(5)),
        batch_lane.stop(Duration::from_secs(5)),
    );
    for (lane, result) in [("fast", fast), ("batch", batch)] {
        if let Err(error) = result {
            warn!(lane, error = %error, "dispatcher did not stop cleanly");
        }
    }

    info!("shutdown complete");
    Ok(())
}
