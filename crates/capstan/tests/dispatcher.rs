use std::sync::Arc;
use std::time::Duration;

use capstan_core::{Dispatcher, Job, JobStore, StopError};
use tokio::time;

use capstan_core::JobStatus;
use capstan_core::PageCursor;
use capstan_testing::{
    CooperativeWorker, FailingWorker, MemoryJobStore, PanickingWorker, RecordingWorker,
    SleepingWorker, StubbornWorker,
};

async fn seed(store: &MemoryJobStore, name: &str, priority: i32, timeout: i32) -> Job {
    let mut job = Job::new(name, "", timeout);
    job.priority = priority;
    store.insert(&mut job).await.unwrap();
    job
}

#[tokio::test(flavor = "multi_thread")]
async fn runs_a_job_to_completion() {
    let store = Arc::new(MemoryJobStore::new());
    seed(&store, "quick", 0, 5).await;

    let mut dispatcher = Dispatcher::new(
        store.clone(),
        2,
        Arc::new(CooperativeWorker::new(Duration::from_millis(10))),
    );
    dispatcher.start(Duration::from_millis(25));
    time::sleep(Duration::from_millis(150)).await;

    let done = store.processed(PageCursor::first()).await.unwrap();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].status, JobStatus::Completed);
    assert_eq!(done[0].run_count, 1);
    assert!(done[0].elapsed >= 0.0);

    dispatcher.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn feeds_jobs_in_lease_order() {
    let store = Arc::new(MemoryJobStore::new());
    for priority in 0..5 {
        seed(&store, &format!("p{priority}"), priority, 5).await;
    }

    let worker = Arc::new(RecordingWorker::new());
    let mut dispatcher = Dispatcher::new(store.clone(), 1, worker.clone());
    dispatcher.start(Duration::from_millis(25));
    time::sleep(Duration::from_millis(300)).await;
    dispatcher.stop(Duration::from_secs(1)).await.unwrap();

    assert_eq!(worker.names(), vec!["p4", "p3", "p2", "p1", "p0"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn bounds_in_flight_executions() {
    let store = Arc::new(MemoryJobStore::new());
    for i in 0..4 {
        seed(&store, &format!("job{i}"), 0, 5).await;
    }

    let mut dispatcher = Dispatcher::new(
        store.clone(),
        2,
        Arc::new(SleepingWorker::new(Duration::from_millis(50))),
    );
    dispatcher.start(Duration::from_millis(100));

    // First tick at 100 ms leases exactly two jobs.
    time::sleep(Duration::from_millis(130)).await;
    assert_eq!(store.processing().await.unwrap().len(), 2);
    assert_eq!(dispatcher.in_flight(), 2);
    assert_eq!(store.processed(PageCursor::first()).await.unwrap().len(), 0);

    // Those finish, the next tick tops back up to two.
    time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.processing().await.unwrap().len(), 2);
    assert_eq!(store.processed(PageCursor::first()).await.unwrap().len(), 2);

    time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.processed(PageCursor::first()).await.unwrap().len(), 4);

    dispatcher.stop(Duration::from_secs(1)).await.unwrap();
    assert_eq!(dispatcher.in_flight(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn graceful_stop_completes_in_flight_work() {
    let store = Arc::new(MemoryJobStore::new());
    for i in 0..8 {
        seed(&store, &format!("job{i}"), 0, 5).await;
    }

    let mut dispatcher = Dispatcher::new(
        store.clone(),
        4,
        Arc::new(SleepingWorker::new(Duration::from_millis(100))),
    );
    dispatcher.start(Duration::from_millis(40));

    // Let the second batch get leased, then stop mid-execution.
    time::sleep(Duration::from_millis(200)).await;
    dispatcher.stop(Duration::from_secs(1)).await.unwrap();

    assert_eq!(store.processed(PageCursor::first()).await.unwrap().len(), 8);
    assert!(store.processing().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_past_deadline_surrenders_leases() {
    let store = Arc::new(MemoryJobStore::new());
    let job = seed(&store, "stubborn", 0, 30).await;

    let mut dispatcher = Dispatcher::new(
        store.clone(),
        1,
        Arc::new(StubbornWorker::new(Duration::from_secs(2))),
    );
    dispatcher.start(Duration::from_millis(30));
    time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.processing().await.unwrap().len(), 1);

    let result = dispatcher.stop(Duration::from_millis(200)).await;
    assert!(matches!(result, Err(StopError::DeadlineExceeded)));

    // The lease is surrendered immediately: pending again, not grabbed,
    // run count untouched.
    assert!(store.processing().await.unwrap().is_empty());
    let requeued = store.enqueued_by_name("stubborn").await.unwrap();
    assert_eq!(requeued.len(), 1);
    assert_eq!(requeued[0].id, job.id);
    assert_eq!(requeued[0].status, JobStatus::Pending);
    assert!(requeued[0].grabbed.is_none());
    assert_eq!(requeued[0].run_count, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_before_start_is_a_no_op() {
    let store = Arc::new(MemoryJobStore::new());
    let mut dispatcher = Dispatcher::new(
        store,
        1,
        Arc::new(CooperativeWorker::new(Duration::from_millis(1))),
    );
    assert!(dispatcher.stop(Duration::from_millis(10)).await.is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn worker_panic_settles_as_failure() {
    let store = Arc::new(MemoryJobStore::new());
    let before = seed(&store, "explosive", 0, 5).await;

    let mut dispatcher =
        Dispatcher::new(store.clone(), 1, Arc::new(PanickingWorker::new("kaboom")));
    dispatcher.start(Duration::from_millis(25));
    time::sleep(Duration::from_millis(150)).await;
    dispatcher.stop(Duration::from_secs(1)).await.unwrap();

    let requeued = store.enqueued_by_name("explosive").await.unwrap();
    assert_eq!(requeued.len(), 1);
    assert_eq!(requeued[0].run_count, 1);
    assert!(requeued[0].last_error.contains("panicked"));
    assert!(requeued[0].last_error.contains("kaboom"));
    assert!(requeued[0].run_after > before.run_after);
}

#[tokio::test(flavor = "multi_thread")]
async fn worker_error_settles_as_failure() {
    let store = Arc::new(MemoryJobStore::new());
    seed(&store, "broken", 0, 5).await;

    let mut dispatcher = Dispatcher::new(
        store.clone(),
        1,
        Arc::new(FailingWorker::new("downstream unavailable")),
    );
    dispatcher.start(Duration::from_millis(25));
    time::sleep(Duration::from_millis(150)).await;
    dispatcher.stop(Duration::from_secs(1)).await.unwrap();

    let requeued = store.enqueued_by_name("broken").await.unwrap();
    assert_eq!(requeued.len(), 1);
    assert!(requeued[0].last_error.contains("downstream unavailable"));
}

#[tokio::test(flavor = "multi_thread")]
async fn overrunning_the_deadline_settles_as_timeout() {
    let store = Arc::new(MemoryJobStore::new());
    // One-second deadline against a worker that needs five.
    seed(&store, "slow", 0, 1).await;

    let mut dispatcher = Dispatcher::new(
        store.clone(),
        1,
        Arc::new(CooperativeWorker::new(Duration::from_secs(5))),
    );
    dispatcher.start(Duration::from_millis(25));
    time::sleep(Duration::from_millis(1400)).await;
    dispatcher.stop(Duration::from_secs(1)).await.unwrap();

    let requeued = store.enqueued_by_name("slow").await.unwrap();
    assert_eq!(requeued.len(), 1);
    assert_eq!(requeued[0].run_count, 1);
    assert!(requeued[0].last_error.contains("timed out after 1s"));
}

#[tokio::test(flavor = "multi_thread")]
async fn lease_errors_skip_the_tick_and_recover() {
    let store = Arc::new(MemoryJobStore::new());
    seed(&store, "survivor", 0, 5).await;
    store.inject_lease_errors(2);

    let mut dispatcher = Dispatcher::new(
        store.clone(),
        1,
        Arc::new(CooperativeWorker::new(Duration::from_millis(1))),
    );
    dispatcher.start(Duration::from_millis(25));
    time::sleep(Duration::from_millis(250)).await;
    dispatcher.stop(Duration::from_secs(1)).await.unwrap();

    assert_eq!(store.processed(PageCursor::first()).await.unwrap().len(), 1);
}
