//! Step executor - runs one step with throttling, timeout and retries

use crate::{
    core::{FailureDetail, FailureKind, FailureMode, PipelineContext, Step},
    execution::{EventBus, ExecutionEvent, ThrottleError, ThrottlePool},
    generator::{GenerateError, StepOutput},
};
use std::sync::Arc;
use thiserror::Error;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Why a pipeline stopped before its last step
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("Step '{step}' failed after {attempts} attempt(s): {source}")]
    StepFailed {
        step: String,
        attempts: u32,
        source: GenerateError,
    },

    #[error("Cancelled before step '{step}' completed")]
    Cancelled { step: String },

    #[error("Step '{step}' could not acquire throttle: {source}")]
    Throttle { step: String, source: ThrottleError },

    #[error("Pipeline panicked: {0}")]
    Panicked(String),
}

impl PipelineError {
    pub fn step(&self) -> Option<&str> {
        match self {
            PipelineError::StepFailed { step, .. }
            | PipelineError::Cancelled { step }
            | PipelineError::Throttle { step, .. } => Some(step),
            PipelineError::Panicked(_) => None,
        }
    }
}

impl From<&PipelineError> for FailureDetail {
    fn from(error: &PipelineError) -> Self {
        let (kind, attempts) = match error {
            PipelineError::StepFailed { attempts, source, .. } => {
                let kind = if source.is_transient() {
                    FailureKind::RetriesExhausted
                } else {
                    FailureKind::Terminal
                };
                (kind, *attempts)
            }
            PipelineError::Cancelled { .. } => (FailureKind::Cancelled, 0),
            PipelineError::Throttle { .. } => (FailureKind::Throttle, 0),
            PipelineError::Panicked(_) => (FailureKind::Panicked, 0),
        };

        FailureDetail {
            kind,
            step: error.step().map(str::to_string),
            attempts,
            message: error.to_string(),
        }
    }
}

/// A step that produced an output
#[derive(Debug, Clone)]
pub struct StepSuccess {
    pub output: StepOutput,
    pub attempts: u32,
}

/// Executes a single step
pub struct StepExecutor {
    throttles: Arc<ThrottlePool>,
    events: EventBus,
}

impl StepExecutor {
    pub fn new(throttles: Arc<ThrottlePool>, events: EventBus) -> Self {
        Self { throttles, events }
    }

    /// Execute a step until it succeeds, fails terminally or runs out of attempts
    ///
    /// Permits are held only for the generator call itself, never across a
    /// backoff sleep. Cancellation is observed while waiting for permits and
    /// between attempts; a generator call in flight is never interrupted.
    pub async fn execute(
        &self,
        step: &Step,
        context: &PipelineContext,
        cancel: &CancellationToken,
    ) -> Result<StepSuccess, PipelineError> {
        let pipeline_id = context.pipeline_id.as_str();
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled {
                    step: step.name.clone(),
                });
            }

            let permits = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(PipelineError::Cancelled { step: step.name.clone() });
                }
                permits = self.throttles.acquire_all(&step.throttle_keys) => {
                    permits.map_err(|source| PipelineError::Throttle {
                        step: step.name.clone(),
                        source,
                    })?
                }
            };

            self.events.emit(ExecutionEvent::StepStarted {
                pipeline_id: pipeline_id.to_string(),
                step: step.name.clone(),
                attempt,
            });
            debug!(pipeline = pipeline_id, step = %step.name, attempt, "Calling generator");

            let result = match timeout(step.timeout, step.generator.generate(context)).await {
                Ok(result) => result,
                Err(_) => Err(GenerateError::Timeout(step.timeout)),
            };
            drop(permits);

            let error = match result {
                Ok(output) => {
                    info!(
                        pipeline = pipeline_id,
                        step = %step.name,
                        attempt,
                        degraded = output.is_degraded(),
                        "Step completed"
                    );
                    return Ok(StepSuccess {
                        output,
                        attempts: attempt,
                    });
                }
                Err(error) => error,
            };

            if step.retry.should_retry(&error, attempt) {
                let delay = step.retry.delay_after(attempt);
                warn!(
                    pipeline = pipeline_id,
                    step = %step.name,
                    attempt,
                    max_attempts = step.retry.max_attempts,
                    "Transient failure, retrying in {:?}: {}",
                    delay,
                    error
                );
                self.events.emit(ExecutionEvent::StepRetrying {
                    pipeline_id: pipeline_id.to_string(),
                    step: step.name.clone(),
                    attempt,
                    max_attempts: step.retry.max_attempts,
                    error: error.to_string(),
                });

                if !delay.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(PipelineError::Cancelled { step: step.name.clone() });
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                continue;
            }

            if let FailureMode::Degrade { placeholder } = &step.failure_mode {
                warn!(
                    pipeline = pipeline_id,
                    step = %step.name,
                    "Optional step failed, continuing with placeholder: {}",
                    error
                );
                return Ok(StepSuccess {
                    output: StepOutput::degraded(placeholder.clone(), error.to_string()),
                    attempts: attempt,
                });
            }

            return Err(PipelineError::StepFailed {
                step: step.name.clone(),
                attempts: attempt,
                source: error,
            });
        }
    }
}
