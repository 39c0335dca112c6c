//! Jobs outlive the process that scheduled them
#![cfg(feature = "sqlite")]

use crate::helpers::*;
use campaign_pipeline::persistence::{JobStatus, JobStore, SqliteJobStore};
use campaign_pipeline::scheduling::{HandlerRegistry, RuntimeConfig, SchedulerRuntime};
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_pending_jobs_survive_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("jobs.db");
    let run_at = Utc::now() + ChronoDuration::seconds(30);

    let id = {
        let store = SqliteJobStore::open(&path).await.unwrap();
        let id = store
            .enqueue(job_at("record", run_at).with_misfire_grace(600))
            .await
            .unwrap();
        store.close().await;
        id
    };

    let store = Arc::new(SqliteJobStore::open(&path).await.unwrap());
    let job = store.get(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.misfire_grace_secs, Some(600));
    assert_eq!(job.run_at.timestamp_micros(), run_at.timestamp_micros());

    let recorder = Arc::new(RecordingHandler::default());
    let runtime = SchedulerRuntime::new(
        store.clone(),
        HandlerRegistry::new().with("record", recorder.clone()),
        RuntimeConfig::default(),
    );

    assert!(runtime.run_due(Utc::now()).await.unwrap().is_empty());
    let reports = runtime
        .run_due(run_at + ChronoDuration::seconds(1))
        .await
        .unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(recorder.job_ids(), vec![id.clone()]);
    assert_eq!(status_of(store.as_ref(), &id).await, JobStatus::Completed);
}

#[tokio::test]
async fn test_interrupted_job_is_redelivered_after_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("jobs.db");

    // The first process claims the job and dies before recording an outcome
    let id = {
        let store = SqliteJobStore::open(&path).await.unwrap();
        let id = store.enqueue(job_at("record", Utc::now())).await.unwrap();
        assert!(store.mark_executing(&id).await.unwrap());
        store.close().await;
        id
    };

    let store = Arc::new(SqliteJobStore::open(&path).await.unwrap());
    assert_eq!(status_of(store.as_ref(), &id).await, JobStatus::Executing);

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
    assert!(wait_for_status(store.as_ref(), &id, JobStatus::Completed).await);
    shutdown.cancel();
    handle.await.unwrap();

    assert_eq!(recorder.attempts_of(&id), vec![2]);
    let job = store.get(&id).await.unwrap().unwrap();
    assert_eq!(job.attempts, 2);
}

#[tokio::test]
async fn test_terminal_jobs_stay_terminal_after_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("jobs.db");

    let (done, cancelled) = {
        let store = SqliteJobStore::open(&path).await.unwrap();
        let done = store.enqueue(job_at("record", Utc::now())).await.unwrap();
        let cancelled = store
            .enqueue(job_at("record", Utc::now() + ChronoDuration::hours(1)))
            .await
            .unwrap();
        assert!(store.mark_executing(&done).await.unwrap());
        store
            .mark_terminal(&done, JobStatus::Completed, Some("posted".to_string()))
            .await
            .unwrap();
        assert!(store.cancel(&cancelled).await.unwrap());
        store.close().await;
        (done, cancelled)
    };

    let store = SqliteJobStore::open(&path).await.unwrap();
    assert_eq!(store.recover_interrupted().await.unwrap(), 0);
    let job = store.get(&done).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.detail.as_deref(), Some("posted"));
    assert_eq!(status_of(&store, &cancelled).await, JobStatus::Cancelled);
    assert!(store
        .list_due(Utc::now() + ChronoDuration::hours(2))
        .await
        .unwrap()
        .is_empty());
}
