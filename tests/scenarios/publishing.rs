//! Deferred publishing through the registered `publish` handler

use crate::helpers::*;
use async_trait::async_trait;
use campaign_pipeline::execution::{ThrottleKey, ThrottlePool};
use campaign_pipeline::persistence::{InMemoryJobStore, JobStatus, JobStore};
use campaign_pipeline::publish::{
    Platform, PublishError, PublishHandler, PublishReceipt, PublishRequest, Publisher,
};
use campaign_pipeline::scheduling::{HandlerRegistry, RuntimeConfig, SchedulerRuntime};
use chrono::Utc;
use serde_json::json;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct FakePlatform {
    keys: Mutex<Vec<String>>,
}

#[async_trait]
impl Publisher for FakePlatform {
    async fn publish(
        &self,
        request: &PublishRequest,
        idempotency_key: &str,
    ) -> Result<PublishReceipt, PublishError> {
        self.keys.lock().unwrap().push(idempotency_key.to_string());
        Ok(PublishReceipt {
            url: Some(format!("https://example.com/{}/{}", request.platform, idempotency_key)),
            remote_id: None,
        })
    }
}

fn runtime(store: Arc<InMemoryJobStore>, platform: Arc<FakePlatform>) -> SchedulerRuntime {
    let throttles = Arc::new(ThrottlePool::new([("x-api", 1)]));
    let mut registry = HandlerRegistry::new();
    PublishHandler::new(throttles)
        .with_publisher(Platform::X, platform, Some(ThrottleKey::from("x-api")))
        .register(&mut registry);
    SchedulerRuntime::new(store, registry, RuntimeConfig::default())
}

#[tokio::test]
async fn test_scheduled_post_is_published_with_job_id_as_key() {
    let store = Arc::new(InMemoryJobStore::new());
    let platform = Arc::new(FakePlatform::default());
    let request = PublishRequest {
        platform: Platform::X,
        asset: json!({"text": "Heat pumps, explained"}),
        media: None,
    };
    let id = store
        .enqueue(PublishHandler::new_job(&request, Utc::now()).unwrap())
        .await
        .unwrap();

    let reports = runtime(store.clone(), platform.clone())
        .run_due(Utc::now())
        .await
        .unwrap();

    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].status, JobStatus::Completed);
    assert_eq!(*platform.keys.lock().unwrap(), vec![id.clone()]);
    let job = store.get(&id).await.unwrap().unwrap();
    assert!(job.detail.unwrap().contains(&id));
}

#[tokio::test]
async fn test_unconfigured_platform_and_missing_media_fail() {
    let store = Arc::new(InMemoryJobStore::new());
    let platform = Arc::new(FakePlatform::default());

    let youtube = PublishRequest {
        platform: Platform::YouTube,
        asset: json!({"title": "Launch"}),
        media: None,
    };
    let missing_media = PublishRequest {
        platform: Platform::X,
        asset: json!({"text": "with video"}),
        media: Some(PathBuf::from("/nonexistent/campaign/short.mp4")),
    };
    let youtube_id = store
        .enqueue(PublishHandler::new_job(&youtube, Utc::now()).unwrap())
        .await
        .unwrap();
    let media_id = store
        .enqueue(PublishHandler::new_job(&missing_media, Utc::now()).unwrap())
        .await
        .unwrap();

    runtime(store.clone(), platform.clone())
        .run_due(Utc::now())
        .await
        .unwrap();

    assert!(platform.keys.lock().unwrap().is_empty());
    assert_eq!(status_of(store.as_ref(), &youtube_id).await, JobStatus::Failed);
    let job = store.get(&media_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.detail.unwrap().contains("media file missing"));
}

#[tokio::test]
async fn test_malformed_payload_fails_job() {
    let store = Arc::new(InMemoryJobStore::new());
    let id = store
        .enqueue(job_at("publish", Utc::now()).with_misfire_grace(60))
        .await
        .unwrap();
    // Unknown platform
    let bad = store
        .enqueue(campaign_pipeline::persistence::NewJob::new(
            "publish",
            json!({"platform": "myspace"}),
            Utc::now(),
        ))
        .await
        .unwrap();

    runtime(store.clone(), Arc::new(FakePlatform::default()))
        .run_due(Utc::now())
        .await
        .unwrap();

    assert_eq!(status_of(store.as_ref(), &id).await, JobStatus::Completed);
    assert_eq!(status_of(store.as_ref(), &bad).await, JobStatus::Failed);
}

#[cfg(unix)]
#[tokio::test]
async fn test_hung_publisher_fails_job_within_timeout() {
    use campaign_pipeline::publish::CommandPublisher;
    use std::time::Duration;

    let store = Arc::new(InMemoryJobStore::new());
    let id = store.enqueue(job_at("publish", Utc::now())).await.unwrap();

    let hung = CommandPublisher::new("sh", vec!["-c".to_string(), "sleep 30".to_string()]);
    let mut registry = HandlerRegistry::new();
    PublishHandler::new(Arc::new(ThrottlePool::default()))
        .with_publisher(Platform::X, Arc::new(hung), None)
        .with_publish_timeout(Platform::X, Duration::from_millis(200))
        .register(&mut registry);
    let runtime = SchedulerRuntime::new(store.clone(), registry, RuntimeConfig::default());

    let reports = tokio::time::timeout(Duration::from_secs(10), runtime.run_due(Utc::now()))
        .await
        .expect("publish job was never bounded")
        .unwrap();

    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].status, JobStatus::Failed);
    let job = store.get(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.detail.unwrap().contains("timed out"));
}
