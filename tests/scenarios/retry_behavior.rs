//! Transient failures are retried up to the step's attempt limit

use crate::helpers::*;
use campaign_pipeline::core::{FailureKind, Pipeline, RetryPolicy, Step};
use campaign_pipeline::execution::{ExecutionEvent, OrchestrationRequest, Orchestrator, ThrottlePool};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn orchestrator() -> Orchestrator {
    Orchestrator::new(Arc::new(ThrottlePool::new([("image", 2)])))
}

#[tokio::test]
async fn test_transient_failures_below_limit_succeed() {
    let generator = Arc::new(FlakyGenerator::new(2, json!("cover.png")));
    let pipeline = Pipeline::new("COVER").with_step(
        Step::new("image", generator.clone())
            .with_throttle("image")
            .with_retry(RetryPolicy::new(3)),
    );

    let retries = Arc::new(Mutex::new(Vec::new()));
    let seen = retries.clone();
    let orchestrator = orchestrator().with_event_handler(move |event| {
        if let ExecutionEvent::StepRetrying { attempt, .. } = event {
            seen.lock().unwrap().push(attempt);
        }
    });

    let result = orchestrator
        .submit(OrchestrationRequest::new(vec![pipeline]))
        .await;

    assert_succeeded(&result, "COVER");
    assert_eq!(generator.calls(), 3);
    assert_eq!(outcome(&result, "COVER").steps[0].attempts, 3);
    assert_eq!(*retries.lock().unwrap(), vec![1, 2]);
}

#[tokio::test]
async fn test_transient_failures_at_limit_exhaust_retries() {
    let generator = Arc::new(FlakyGenerator::new(3, json!("cover.png")));
    let pipeline = Pipeline::new("COVER")
        .with_step(Step::new("image", generator.clone()).with_retry(RetryPolicy::new(3)));

    let result = orchestrator()
        .submit(OrchestrationRequest::new(vec![pipeline]))
        .await;

    assert_failed_at(&result, "COVER", "image", FailureKind::RetriesExhausted);
    assert_eq!(generator.calls(), 3);
    let error = outcome(&result, "COVER").error.clone().unwrap();
    assert_eq!(error.attempts, 3);
    assert!(error.message.contains("503"));
}

#[tokio::test]
async fn test_terminal_failure_is_not_retried() {
    let pipeline = Pipeline::new("AUDIO").with_step(
        Step::new("voice", Arc::new(RejectingGenerator("voice not allowed")))
            .with_retry(RetryPolicy::new(5)),
    );

    let result = orchestrator()
        .submit(OrchestrationRequest::new(vec![pipeline]))
        .await;

    assert_failed_at(&result, "AUDIO", "voice", FailureKind::Terminal);
    assert_eq!(outcome(&result, "AUDIO").error.as_ref().unwrap().attempts, 1);
}

#[tokio::test]
async fn test_timeout_counts_as_transient() {
    let gauge = Arc::new(ConcurrencyGauge::default());
    let slow = SlowGenerator {
        delay: Duration::from_secs(5),
        gauge,
    };
    let pipeline = Pipeline::new("VIDEO").with_step(
        Step::new("render", Arc::new(slow))
            .with_retry(RetryPolicy::new(2))
            .with_timeout(Duration::from_millis(20)),
    );

    let result = orchestrator()
        .submit(OrchestrationRequest::new(vec![pipeline]))
        .await;

    assert_failed_at(&result, "VIDEO", "render", FailureKind::RetriesExhausted);
    assert_eq!(outcome(&result, "VIDEO").error.as_ref().unwrap().attempts, 2);
}
