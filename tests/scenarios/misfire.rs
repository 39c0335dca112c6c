//! Late jobs: run inside the grace window, expire outside it

use crate::helpers::*;
use campaign_pipeline::persistence::{InMemoryJobStore, JobStatus, JobStore};
use campaign_pipeline::scheduling::{HandlerRegistry, RuntimeConfig, SchedulerRuntime};
use chrono::{Duration, Utc};
use std::sync::Arc;

fn runtime(store: Arc<InMemoryJobStore>, recorder: Arc<RecordingHandler>) -> SchedulerRuntime {
    SchedulerRuntime::new(
        store,
        HandlerRegistry::new().with("record", recorder),
        RuntimeConfig::default(),
    )
}

#[tokio::test]
async fn test_job_inside_grace_runs_late() {
    let store = Arc::new(InMemoryJobStore::new());
    let recorder = Arc::new(RecordingHandler::default());
    let run_at = Utc::now();
    let id = store
        .enqueue(job_at("record", run_at).with_misfire_grace(3600))
        .await
        .unwrap();

    let reports = runtime(store.clone(), recorder.clone())
        .run_due(run_at + Duration::minutes(10))
        .await
        .unwrap();

    assert_eq!(reports.len(), 1);
    assert!(reports[0].late);
    assert_eq!(reports[0].status, JobStatus::Completed);
    assert_eq!(recorder.job_ids(), vec![id.clone()]);
    assert_eq!(status_of(store.as_ref(), &id).await, JobStatus::Completed);
}

#[tokio::test]
async fn test_job_past_grace_fails_without_running() {
    let store = Arc::new(InMemoryJobStore::new());
    let recorder = Arc::new(RecordingHandler::default());
    let run_at = Utc::now();
    let id = store
        .enqueue(job_at("record", run_at).with_misfire_grace(60))
        .await
        .unwrap();

    let reports = runtime(store.clone(), recorder.clone())
        .run_due(run_at + Duration::minutes(5))
        .await
        .unwrap();

    assert!(reports.is_empty());
    assert!(recorder.job_ids().is_empty());

    let job = store.get(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 0);
    assert!(job.detail.unwrap().contains("missed run time"));
}

#[tokio::test]
async fn test_unbounded_grace_runs_however_late() {
    let store = Arc::new(InMemoryJobStore::new());
    let recorder = Arc::new(RecordingHandler::default());
    let run_at = Utc::now() - Duration::days(3);
    let id = store.enqueue(job_at("record", run_at)).await.unwrap();

    let reports = runtime(store.clone(), recorder.clone())
        .run_due(Utc::now())
        .await
        .unwrap();

    assert_eq!(reports.len(), 1);
    assert!(reports[0].late);
    assert_eq!(status_of(store.as_ref(), &id).await, JobStatus::Completed);
}

#[tokio::test]
async fn test_slightly_late_job_is_not_flagged() {
    let store = Arc::new(InMemoryJobStore::new());
    let recorder = Arc::new(RecordingHandler::default());
    let run_at = Utc::now();
    store.enqueue(job_at("record", run_at)).await.unwrap();

    let reports = runtime(store, recorder)
        .run_due(run_at + Duration::seconds(5))
        .await
        .unwrap();

    assert_eq!(reports.len(), 1);
    assert!(!reports[0].late);
}
