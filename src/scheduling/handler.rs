//! Job handlers and the registry the runtime dispatches through

use crate::persistence::ScheduledJob;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Error types for job handlers
///
/// Every variant ends the job as `Failed`; the variant is kept in the
/// recorded detail so operators can tell what is worth rescheduling.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Likely to succeed if scheduled again (network, rate limit)
    #[error("retryable: {0}")]
    Retryable(String),

    #[error("failed: {0}")]
    Failed(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
}

/// One delivery of a job to its handler
#[derive(Debug, Clone)]
pub struct JobInvocation {
    pub job: ScheduledJob,

    /// Claim count including this one; above 1 means a previous run was
    /// interrupted and the action may already have happened
    pub attempt: u32,

    /// How far past `run_at` this run started
    pub lateness: chrono::Duration,

    /// Lateness exceeded the runtime's late threshold
    pub late: bool,
}

impl JobInvocation {
    pub fn is_redelivery(&self) -> bool {
        self.attempt > 1
    }

    /// Decode the payload into a typed request
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        Ok(serde_json::from_value(self.job.payload.clone())?)
    }
}

/// Executes one kind of deferred action
///
/// Delivery is at-least-once: a job interrupted by a crash runs again after
/// restart, so handlers should be idempotent on the job id.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run the action; the returned text is recorded as the job's detail
    async fn handle(&self, invocation: &JobInvocation) -> Result<Option<String>, HandlerError>;
}

/// Handlers by name
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one with the same name
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn with(mut self, name: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        self.register(name, handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}
