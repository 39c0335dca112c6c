//! Jobs run only once their time has come, and at most once per claim

use crate::helpers::*;
use campaign_pipeline::persistence::{InMemoryJobStore, JobStatus, JobStore};
use campaign_pipeline::scheduling::{HandlerRegistry, RuntimeConfig, SchedulerRuntime};
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_only_due_jobs_run() {
    let store = Arc::new(InMemoryJobStore::new());
    let recorder = Arc::new(RecordingHandler::default());
    let now = Utc::now();

    let first = store.enqueue(job_at("record", now)).await.unwrap();
    let second = store
        .enqueue(job_at("record", now + ChronoDuration::seconds(1)))
        .await
        .unwrap();
    let later = store
        .enqueue(job_at("record", now + ChronoDuration::seconds(100)))
        .await
        .unwrap();

    let runtime = SchedulerRuntime::new(
        store.clone(),
        HandlerRegistry::new().with("record", recorder.clone()),
        RuntimeConfig::default(),
    );

    let reports = runtime
        .run_due(now + ChronoDuration::milliseconds(1500))
        .await
        .unwrap();
    assert_eq!(reports.len(), 2);

    let mut ran = recorder.job_ids();
    ran.sort();
    let mut expected = vec![first.clone(), second.clone()];
    expected.sort();
    assert_eq!(ran, expected);

    assert_eq!(status_of(store.as_ref(), &first).await, JobStatus::Completed);
    assert_eq!(status_of(store.as_ref(), &second).await, JobStatus::Completed);
    assert_eq!(status_of(store.as_ref(), &later).await, JobStatus::Pending);

    // A second scan at the same instant finds nothing new
    assert!(runtime
        .run_due(now + ChronoDuration::milliseconds(1500))
        .await
        .unwrap()
        .is_empty());
    assert_eq!(recorder.attempts_of(&first), vec![1]);
}

#[tokio::test]
async fn test_unknown_handler_fails_job() {
    let store = Arc::new(InMemoryJobStore::new());
    let id = store.enqueue(job_at("tiktok", Utc::now())).await.unwrap();

    let runtime = SchedulerRuntime::new(store.clone(), HandlerRegistry::new(), RuntimeConfig::default());
    let reports = runtime.run_due(Utc::now()).await.unwrap();

    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].status, JobStatus::Failed);
    let job = store.get(&id).await.unwrap().unwrap();
    assert!(job.detail.unwrap().contains("tiktok"));
}

#[tokio::test]
async fn test_runtime_survives_failed_scans() {
    let store = Arc::new(FlakyStore::new(InMemoryJobStore::new()));
    store.down.store(true, Ordering::SeqCst);
    let id = store.enqueue(job_at("record", Utc::now())).await.unwrap();

    let recorder = Arc::new(RecordingHandler::default());
    let config = RuntimeConfig {
        tick_interval: Duration::from_millis(10),
        ..RuntimeConfig::default()
    };
    let runtime = Arc::new(SchedulerRuntime::new(
        store.clone(),
        HandlerRegistry::new().with("record", recorder.clone()),
        config,
    ));

    let shutdown = CancellationToken::new();
    let handle = runtime.start(shutdown.clone());

    while store.failed_scans.load(Ordering::SeqCst) < 2 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(recorder.job_ids().is_empty());

    store.down.store(false, Ordering::SeqCst);
    assert!(wait_for_status(store.as_ref(), &id, JobStatus::Completed).await);

    shutdown.cancel();
    handle.await.unwrap();
    assert_eq!(recorder.job_ids(), vec![id]);
}
