//! Publishing finished assets as a scheduled job

use crate::{
    execution::{ThrottleKey, ThrottlePool},
    generator::command::run_with_stdin,
    persistence::NewJob,
    scheduling::{HandlerError, HandlerRegistry, JobHandler, JobInvocation},
    settings::Settings,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Platforms an asset can be published to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    #[serde(alias = "twitter")]
    X,
    YouTube,
    WordPress,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::X => "x",
            Platform::YouTube => "youtube",
            Platform::WordPress => "wordpress",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "x" | "twitter" => Ok(Platform::X),
            "youtube" => Ok(Platform::YouTube),
            "wordpress" => Ok(Platform::WordPress),
            other => Err(format!("unknown platform '{}'", other)),
        }
    }
}

/// Payload of a `publish` job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishRequest {
    pub platform: Platform,

    /// Platform-specific content (text, title, tags, ...)
    pub asset: Value,

    /// Media file uploaded with the post; must still exist at run time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<PathBuf>,
}

/// Where a published asset ended up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub url: Option<String>,
    #[serde(default)]
    pub remote_id: Option<String>,
}

/// Error types for publishers
#[derive(Debug, Error)]
pub enum PublishError {
    /// Network failure, rate limit; may succeed if rescheduled
    #[error("transient publish failure: {0}")]
    Transient(String),

    /// Rejected by the platform
    #[error("publish rejected: {0}")]
    Rejected(String),
}

/// Client for one publishing platform
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish an asset
    ///
    /// `idempotency_key` is stable across redeliveries of the same job, so a
    /// publisher that can dedupe should use it.
    async fn publish(
        &self,
        request: &PublishRequest,
        idempotency_key: &str,
    ) -> Result<PublishReceipt, PublishError>;
}

/// Upper bound on one publish call unless a publisher sets its own
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(30);

struct Route {
    publisher: Arc<dyn Publisher>,
    throttle: Option<ThrottleKey>,
    timeout: Duration,
}

/// The `publish` job handler
pub struct PublishHandler {
    routes: BTreeMap<Platform, Route>,
    throttles: Arc<ThrottlePool>,
}

impl PublishHandler {
    /// Name the handler is registered under
    pub const NAME: &'static str = "publish";

    pub fn new(throttles: Arc<ThrottlePool>) -> Self {
        Self {
            routes: BTreeMap::new(),
            throttles,
        }
    }

    /// Create a handler with a command publisher per configured platform
    pub fn from_settings(settings: &Settings, throttles: Arc<ThrottlePool>) -> anyhow::Result<Self> {
        let mut handler = Self::new(throttles);
        for (name, publisher) in &settings.publishers {
            let platform = Platform::from_str(name).map_err(anyhow::Error::msg)?;
            let (program, args) = publisher
                .command
                .split_first()
                .ok_or_else(|| anyhow::anyhow!("Publisher '{}' has an empty command", name))?;
            handler = handler
                .with_publisher(
                    platform,
                    Arc::new(CommandPublisher::new(program.clone(), args.to_vec())),
                    publisher.throttle.as_ref().map(ThrottleKey::from),
                )
                .with_publish_timeout(platform, Duration::from_secs(publisher.timeout_secs));
        }
        Ok(handler)
    }

    pub fn with_publisher(
        mut self,
        platform: Platform,
        publisher: Arc<dyn Publisher>,
        throttle: Option<ThrottleKey>,
    ) -> Self {
        self.routes.insert(
            platform,
            Route {
                publisher,
                throttle,
                timeout: DEFAULT_PUBLISH_TIMEOUT,
            },
        );
        self
    }

    /// Bound how long one publish call to `platform` may take
    pub fn with_publish_timeout(mut self, platform: Platform, timeout: Duration) -> Self {
        if let Some(route) = self.routes.get_mut(&platform) {
            route.timeout = timeout;
        }
        self
    }

    pub fn platforms(&self) -> Vec<Platform> {
        self.routes.keys().copied().collect()
    }

    /// Register this handler under [`PublishHandler::NAME`]
    pub fn register(self, registry: &mut HandlerRegistry) {
        registry.register(Self::NAME, Arc::new(self));
    }

    /// Build the job that publishes `request` at `run_at`
    pub fn new_job(request: &PublishRequest, run_at: DateTime<Utc>) -> Result<NewJob, serde_json::Error> {
        Ok(NewJob::new(Self::NAME, serde_json::to_value(request)?, run_at))
    }
}

#[async_trait]
impl JobHandler for PublishHandler {
    async fn handle(&self, invocation: &JobInvocation) -> Result<Option<String>, HandlerError> {
        let request: PublishRequest = invocation.payload_as()?;
        let job_id = invocation.job.id.as_str();

        if invocation.is_redelivery() {
            warn!(
                job_id,
                platform = %request.platform,
                attempt = invocation.attempt,
                "Publishing again after an interrupted run"
            );
        }

        if let Some(media) = &request.media {
            if !media.exists() {
                return Err(HandlerError::Failed(format!(
                    "media file missing at {}",
                    media.display()
                )));
            }
        }

        let route = self.routes.get(&request.platform).ok_or_else(|| {
            HandlerError::Failed(format!("no publisher configured for {}", request.platform))
        })?;

        let _permit = match &route.throttle {
            Some(key) => Some(
                self.throttles
                    .acquire(key)
                    .await
                    .map_err(|e| HandlerError::Failed(e.to_string()))?,
            ),
            None => None,
        };

        let published = tokio::time::timeout(route.timeout, route.publisher.publish(&request, job_id))
            .await
            .unwrap_or_else(|_| {
                Err(PublishError::Transient(format!(
                    "publish to {} timed out after {:?}",
                    request.platform, route.timeout
                )))
            });

        let receipt = published.map_err(|e| match e {
                PublishError::Transient(msg) => HandlerError::Retryable(msg),
                PublishError::Rejected(msg) => HandlerError::Failed(msg),
            })?;

        info!(job_id, platform = %request.platform, url = ?receipt.url, "Asset published");
        Ok(Some(match receipt.url {
            Some(url) => format!("published to {}: {}", request.platform, url),
            None => format!("published to {}", request.platform),
        }))
    }
}

/// Publisher that runs an external program
///
/// The request is written to stdin as JSON and the program gets the
/// idempotency key in `PUBLISH_IDEMPOTENCY_KEY`. Stdout may be a
/// [`PublishReceipt`] or a bare URL. Exit code 75 is transient.
#[derive(Debug, Clone)]
pub struct CommandPublisher {
    program: String,
    args: Vec<String>,
}

impl CommandPublisher {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl Publisher for CommandPublisher {
    async fn publish(
        &self,
        request: &PublishRequest,
        idempotency_key: &str,
    ) -> Result<PublishReceipt, PublishError> {
        let input = serde_json::to_vec(request)
            .map_err(|e| PublishError::Rejected(format!("Failed to encode request: {}", e)))?;

        let mut env = HashMap::new();
        env.insert("PUBLISH_IDEMPOTENCY_KEY".to_string(), idempotency_key.to_string());
        env.insert("PUBLISH_PLATFORM".to_string(), request.platform.to_string());

        let output = run_with_stdin(&self.program, &self.args, &env, &input)
            .await
            .map_err(|e| PublishError::Rejected(format!("Failed to execute {}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(match output.status.code() {
                Some(crate::generator::command::EXIT_TEMPFAIL) | None => PublishError::Transient(stderr),
                Some(_) => PublishError::Rejected(stderr),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(serde_json::from_str(&stdout).unwrap_or_else(|_| PublishReceipt {
            url: (!stdout.is_empty()).then_some(stdout),
            remote_id: None,
        }))
    }
}
