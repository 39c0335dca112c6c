//! Cancelling pipelines in flight and scheduled jobs before they run

use crate::helpers::*;
use campaign_pipeline::core::{FailureKind, Pipeline, Step};
use campaign_pipeline::execution::{OrchestrationRequest, Orchestrator, ThrottlePool};
use campaign_pipeline::persistence::{InMemoryJobStore, JobStatus, JobStore};
use campaign_pipeline::scheduling::{HandlerRegistry, RuntimeConfig, SchedulerRuntime};
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_cancel_stops_pipelines_between_steps() {
    let gauge = Arc::new(ConcurrencyGauge::default());
    let pipeline = Pipeline::new("VIDEO")
        .with_step(Step::new(
            "script",
            Arc::new(SlowGenerator {
                delay: Duration::from_millis(100),
                gauge: gauge.clone(),
            }),
        ))
        .with_step(Step::new("render", Arc::new(FlakyGenerator::new(0, json!("mp4")))));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let result = Orchestrator::new(Arc::new(ThrottlePool::default()))
        .submit_with_cancel(OrchestrationRequest::new(vec![pipeline]), cancel)
        .await;

    assert_eq!(result.outcomes.len(), 1);
    let video = outcome(&result, "VIDEO");
    assert!(!video.is_success());
    assert_eq!(video.error.as_ref().unwrap().kind, FailureKind::Cancelled);
    assert!(!video.outputs.contains_key("render"));
}

#[tokio::test]
async fn test_cancelled_pending_job_never_runs() {
    let store = Arc::new(InMemoryJobStore::new());
    let now = Utc::now();
    let id = store.enqueue(job_at("record", now + ChronoDuration::seconds(10))).await.unwrap();

    assert!(store.cancel(&id).await.unwrap());
    assert!(!store.cancel(&id).await.unwrap());

    let recorder = Arc::new(RecordingHandler::default());
    let runtime = SchedulerRuntime::new(
        store.clone(),
        HandlerRegistry::new().with("record", recorder.clone()),
        RuntimeConfig::default(),
    );

    let reports = runtime.run_due(now + ChronoDuration::seconds(60)).await.unwrap();
    assert!(reports.is_empty());
    assert!(recorder.job_ids().is_empty());
    assert_eq!(status_of(store.as_ref(), &id).await, JobStatus::Cancelled);
}

#[tokio::test]
async fn test_executing_job_cannot_be_cancelled() {
    let store = Arc::new(InMemoryJobStore::new());
    let id = store.enqueue(job_at("gated", Utc::now())).await.unwrap();

    let gated = Arc::new(GatedHandler::default());
    let runtime = Arc::new(SchedulerRuntime::new(
        store.clone(),
        HandlerRegistry::new().with("gated", gated.clone()),
        RuntimeConfig::default(),
    ));

    let running = {
        let runtime = runtime.clone();
        tokio::spawn(async move { runtime.run_due(Utc::now()).await })
    };

    gated.started.notified().await;
    assert_eq!(status_of(store.as_ref(), &id).await, JobStatus::Executing);
    assert!(!store.cancel(&id).await.unwrap());

    gated.release.notify_one();
    let reports = running.await.unwrap().unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(status_of(store.as_ref(), &id).await, JobStatus::Completed);
}

#[tokio::test]
async fn test_cancelling_unknown_job_returns_false() {
    let store = InMemoryJobStore::new();
    assert!(!store.cancel("no-such-job").await.unwrap());
}
