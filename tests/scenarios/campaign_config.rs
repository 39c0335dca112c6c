//! Campaigns declared in YAML and run through shell generators
#![cfg(unix)]

use crate::helpers::*;
use campaign_pipeline::core::config::CampaignConfig;
use campaign_pipeline::core::{FailureKind, StepDefaults};
use campaign_pipeline::execution::{OrchestrationRequest, Orchestrator, ThrottlePool};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

fn pool() -> Arc<ThrottlePool> {
    Arc::new(ThrottlePool::new([("llm", 2), ("tts", 1)]))
}

async fn run(yaml: &str) -> campaign_pipeline::core::CombinedResult {
    let config = CampaignConfig::from_yaml(yaml).unwrap();
    let pool = pool();
    config.validate_throttles(&pool).unwrap();
    Orchestrator::new(pool)
        .submit(config.to_request(&StepDefaults::default()))
        .await
}

#[tokio::test]
async fn test_campaign_runs_each_pipeline() {
    let yaml = r#"
name: "spring launch"
variables:
  topic: "heat pumps"
pipelines:
  - id: ARTICLE_1
    steps:
      - name: draft
        command: ["sh", "-c", "echo '{\"value\": \"draft text\"}'"]
        throttle: [llm]
      - name: context
        command: ["cat"]
  - id: SHORT_1
    variables:
      duration: "30"
    steps:
      - name: narration
        command: ["sh", "-c", "echo narrated"]
        throttle: [llm, tts]
"#;

    let result = run(yaml).await;

    assert_eq!(result.outcomes.len(), 2);
    assert!(result.all_succeeded());

    // The second step sees the first step's output and the request variables
    let article = outcome(&result, "ARTICLE_1");
    assert_eq!(article.outputs["draft"].value, json!("draft text"));
    let seen = &article.outputs["context"].value;
    assert_eq!(seen["pipeline_id"], json!("ARTICLE_1"));
    assert_eq!(seen["variables"]["topic"], json!("heat pumps"));
    assert_eq!(seen["variables"]["campaign"], json!("spring launch"));
    assert_eq!(seen["step_outputs"]["draft"]["value"], json!("draft text"));

    let short = outcome(&result, "SHORT_1");
    assert_eq!(short.final_value(), Some(&json!("narrated")));
}

#[tokio::test]
async fn test_tempfail_exit_is_retried() {
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("attempted");
    let yaml = format!(
        r#"
name: "retry"
pipelines:
  - id: IMAGE_1
    steps:
      - name: render
        command: ["sh", "-c", "if [ -f \"$MARKER\" ]; then echo done; else touch \"$MARKER\"; exit 75; fi"]
        env:
          MARKER: "{}"
        max_attempts: 2
        backoff_ms: 0
"#,
        marker.display()
    );

    let result = run(&yaml).await;

    assert_succeeded(&result, "IMAGE_1");
    let image = outcome(&result, "IMAGE_1");
    assert_eq!(image.steps[0].attempts, 2);
    assert_eq!(image.final_value(), Some(&json!("done")));
}

#[tokio::test]
async fn test_transient_stderr_pattern_and_optional_step() {
    let yaml = r#"
name: "patterns"
pipelines:
  - id: VIDEO_1
    steps:
      - name: music
        command: ["sh", "-c", "echo 'rate limit exceeded' >&2; exit 1"]
        transient_patterns: ["rate limit"]
        max_attempts: 2
        backoff_ms: 0
        optional: true
        placeholder: {"track": "none"}
      - name: render
        command: ["sh", "-c", "echo 'codec missing' >&2; exit 1"]
        max_attempts: 3
        backoff_ms: 0
"#;

    let result = run(yaml).await;

    assert_failed_at(&result, "VIDEO_1", "render", FailureKind::Terminal);
    let video = outcome(&result, "VIDEO_1");
    assert_eq!(video.outputs["music"].value, json!({"track": "none"}));
    assert_eq!(video.steps[0].attempts, 2);
    assert!(video.error.as_ref().unwrap().message.contains("codec missing"));
}

#[test]
fn test_unknown_throttle_key_rejected() {
    let yaml = r#"
name: "typo"
pipelines:
  - id: ARTICLE_1
    steps:
      - name: draft
        command: ["true"]
        throttle: [gpt]
"#;
    let config = CampaignConfig::from_yaml(yaml).unwrap();
    let err = config.validate_throttles(&pool()).unwrap_err();
    assert!(err.to_string().contains("gpt"));
}

#[test]
fn test_structural_errors_rejected() {
    let duplicate = r#"
name: "dup"
pipelines:
  - id: A
    steps:
      - name: s
        command: ["true"]
  - id: A
    steps:
      - name: s
        command: ["true"]
"#;
    assert!(CampaignConfig::from_yaml(duplicate).is_err());

    let empty = r#"
name: "empty"
pipelines:
  - id: A
    steps: []
"#;
    assert!(CampaignConfig::from_yaml(empty).is_err());
}

#[tokio::test]
async fn test_request_variables_override_campaign() {
    let yaml = r#"
name: "vars"
variables:
  topic: "solar"
pipelines:
  - id: A
    steps:
      - name: echo
        command: ["cat"]
"#;
    let config = CampaignConfig::from_yaml(yaml).unwrap();
    let request: OrchestrationRequest = config
        .to_request(&StepDefaults::default())
        .with_variable("topic", "wind");

    let result = Orchestrator::new(pool()).submit(request).await;
    let seen = &outcome(&result, "A").outputs["echo"].value;
    assert_eq!(seen["variables"]["topic"], json!("wind"));
}
