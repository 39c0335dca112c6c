//! Orchestrator - fans out independent pipelines and fans their outcomes back in

use crate::{
    core::{CombinedResult, FailureDetail, Pipeline, PipelineOutcome},
    execution::{EventBus, EventHandler, ExecutionEngine, ExecutionEvent, PipelineError, ThrottlePool},
};
use chrono::Utc;
use futures::FutureExt;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

/// A batch of pipelines produced from one content request
#[derive(Debug, Clone)]
pub struct OrchestrationRequest {
    /// Identifies this request in logs and in the combined result
    pub correlation_id: String,

    /// Pipelines to run, in submission order
    pub pipelines: Vec<Pipeline>,

    /// Variables every pipeline sees (topic, tone, ...)
    pub variables: HashMap<String, String>,
}

impl OrchestrationRequest {
    pub fn new(pipelines: Vec<Pipeline>) -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            pipelines,
            variables: HashMap::new(),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    pub fn with_variables(mut self, variables: HashMap<String, String>) -> Self {
        self.variables.extend(variables);
        self
    }
}

/// Runs every pipeline of a request concurrently and collects one outcome each
pub struct Orchestrator {
    throttles: Arc<ThrottlePool>,
    event_handlers: Vec<EventHandler>,
}

impl Orchestrator {
    pub fn new(throttles: Arc<ThrottlePool>) -> Self {
        Self {
            throttles,
            event_handlers: Vec::new(),
        }
    }

    /// Add an event handler
    pub fn with_event_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(ExecutionEvent) + Send + Sync + 'static,
    {
        self.event_handlers.push(Arc::new(handler));
        self
    }

    pub fn throttles(&self) -> &Arc<ThrottlePool> {
        &self.throttles
    }

    /// Run all pipelines and wait for every one of them to finish
    pub async fn submit(&self, request: OrchestrationRequest) -> CombinedResult {
        self.submit_with_cancel(request, CancellationToken::new()).await
    }

    /// Run all pipelines, stopping them between steps once `cancel` fires
    ///
    /// Returns exactly one outcome per submitted pipeline, in submission
    /// order. A failing or panicking pipeline never affects the others.
    pub async fn submit_with_cancel(
        &self,
        request: OrchestrationRequest,
        cancel: CancellationToken,
    ) -> CombinedResult {
        let started_at = Utc::now();
        let OrchestrationRequest {
            correlation_id,
            pipelines,
            variables,
        } = request;

        info!(
            correlation_id = %correlation_id,
            pipelines = pipelines.len(),
            "Submitting orchestration request"
        );

        let events = EventBus::new(self.event_handlers.clone());
        let engine = Arc::new(ExecutionEngine::new(self.throttles.clone(), events));
        let ids: Vec<String> = pipelines.iter().map(|p| p.id.clone()).collect();

        let mut tasks = JoinSet::new();
        for (index, pipeline) in pipelines.into_iter().enumerate() {
            let engine = engine.clone();
            let context = pipeline.initial_context(&correlation_id, &variables);
            let cancel = cancel.child_token();

            tasks.spawn(async move {
                let run = AssertUnwindSafe(engine.execute(&pipeline, context, &cancel)).catch_unwind();
                let outcome = match run.await {
                    Ok(outcome) => outcome,
                    Err(panic) => {
                        let message = panic_message(panic.as_ref());
                        error!(pipeline = %pipeline.id, "Pipeline panicked: {}", message);
                        failed_outcome(&pipeline.id, &PipelineError::Panicked(message), started_at)
                    }
                };
                (index, outcome)
            });
        }

        let mut slots: Vec<Option<PipelineOutcome>> = vec![None; ids.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => slots[index] = Some(outcome),
                // Panics are caught inside the task; only runtime shutdown lands here
                Err(e) => error!(correlation_id = %correlation_id, "Pipeline task aborted: {}", e),
            }
        }

        let outcomes = slots
            .into_iter()
            .zip(&ids)
            .map(|(slot, id)| {
                slot.unwrap_or_else(|| {
                    failed_outcome(
                        id,
                        &PipelineError::Panicked("pipeline task aborted".to_string()),
                        started_at,
                    )
                })
            })
            .collect::<Vec<_>>();

        let result = CombinedResult {
            correlation_id,
            outcomes,
            started_at,
            finished_at: Utc::now(),
        };

        info!(
            correlation_id = %result.correlation_id,
            succeeded = result.succeeded().count(),
            failed = result.failed().count(),
            "Orchestration finished"
        );
        result
    }
}

fn failed_outcome(
    pipeline_id: &str,
    error: &PipelineError,
    started_at: chrono::DateTime<Utc>,
) -> PipelineOutcome {
    PipelineOutcome::failed(
        pipeline_id,
        FailureDetail::from(error),
        BTreeMap::new(),
        Vec::new(),
        started_at,
    )
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
