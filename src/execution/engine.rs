//! Pipeline execution engine - runs one pipeline's steps in order

use crate::{
    core::{FailureDetail, Pipeline, PipelineContext, PipelineOutcome, PipelineStatus, StepRecord},
    execution::{PipelineError, StepExecutor, ThrottlePool},
};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Events that can occur during pipeline execution
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    PipelineStarted {
        pipeline_id: String,
        correlation_id: String,
    },
    StepStarted {
        pipeline_id: String,
        step: String,
        attempt: u32,
    },
    StepRetrying {
        pipeline_id: String,
        step: String,
        attempt: u32,
        max_attempts: u32,
        error: String,
    },
    StepCompleted {
        pipeline_id: String,
        step: String,
        attempts: u32,
        degraded: bool,
    },
    StepFailed {
        pipeline_id: String,
        step: String,
        error: String,
    },
    PipelineFinished {
        pipeline_id: String,
        status: PipelineStatus,
    },
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(ExecutionEvent) + Send + Sync>;

/// Fixed set of event handlers shared by every task of an orchestration
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<Vec<EventHandler>>,
}

impl EventBus {
    pub fn new(handlers: Vec<EventHandler>) -> Self {
        Self {
            handlers: Arc::new(handlers),
        }
    }

    /// Emit an event to all handlers
    pub fn emit(&self, event: ExecutionEvent) {
        for handler in self.handlers.iter() {
            handler(event.clone());
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// Runs a single pipeline to a terminal outcome
pub struct ExecutionEngine {
    executor: StepExecutor,
    events: EventBus,
}

impl ExecutionEngine {
    pub fn new(throttles: Arc<ThrottlePool>, events: EventBus) -> Self {
        Self {
            executor: StepExecutor::new(throttles, events.clone()),
            events,
        }
    }

    /// Execute the entire pipeline
    ///
    /// Steps run strictly in declared order. The first step error ends the
    /// pipeline; no later step runs. Never returns an error: failures are
    /// recorded in the outcome.
    pub async fn execute(
        &self,
        pipeline: &Pipeline,
        mut context: PipelineContext,
        cancel: &CancellationToken,
    ) -> PipelineOutcome {
        let started_at = Utc::now();
        let correlation_id = context
            .metadata
            .get("correlation_id")
            .cloned()
            .unwrap_or_default();

        info!(pipeline = %pipeline.id, correlation_id = %correlation_id, "Starting pipeline");
        self.events.emit(ExecutionEvent::PipelineStarted {
            pipeline_id: pipeline.id.clone(),
            correlation_id,
        });

        let mut records = Vec::with_capacity(pipeline.steps.len());
        let mut failure: Option<PipelineError> = None;

        for step in &pipeline.steps {
            if cancel.is_cancelled() {
                failure = Some(PipelineError::Cancelled {
                    step: step.name.clone(),
                });
                break;
            }

            context.current_step = Some(step.name.clone());
            let step_started = Utc::now();

            match self.executor.execute(step, &context, cancel).await {
                Ok(success) => {
                    let degraded = success.output.degraded.clone();
                    self.events.emit(ExecutionEvent::StepCompleted {
                        pipeline_id: pipeline.id.clone(),
                        step: step.name.clone(),
                        attempts: success.attempts,
                        degraded: degraded.is_some(),
                    });
                    records.push(StepRecord {
                        name: step.name.clone(),
                        attempts: success.attempts,
                        started_at: step_started,
                        finished_at: Utc::now(),
                        degraded,
                        error: None,
                    });
                    context.set_step_output(&step.name, success.output);
                }
                Err(e) => {
                    error!(pipeline = %pipeline.id, step = %step.name, "Step failed: {}", e);
                    self.events.emit(ExecutionEvent::StepFailed {
                        pipeline_id: pipeline.id.clone(),
                        step: step.name.clone(),
                        error: e.to_string(),
                    });
                    let attempts = match &e {
                        PipelineError::StepFailed { attempts, .. } => *attempts,
                        _ => 0,
                    };
                    records.push(StepRecord {
                        name: step.name.clone(),
                        attempts,
                        started_at: step_started,
                        finished_at: Utc::now(),
                        degraded: None,
                        error: Some(e.to_string()),
                    });
                    failure = Some(e);
                    break;
                }
            }
        }
        context.current_step = None;

        let outputs: BTreeMap<_, _> = context.step_outputs;
        let outcome = match failure {
            None => PipelineOutcome::succeeded(pipeline.id.clone(), outputs, records, started_at),
            Some(e) => PipelineOutcome::failed(
                pipeline.id.clone(),
                FailureDetail::from(&e),
                outputs,
                records,
                started_at,
            ),
        };

        info!(
            pipeline = %pipeline.id,
            status = ?outcome.status,
            steps = outcome.steps.len(),
            "Pipeline finished"
        );
        self.events.emit(ExecutionEvent::PipelineFinished {
            pipeline_id: pipeline.id.clone(),
            status: outcome.status,
        });

        outcome
    }
}
