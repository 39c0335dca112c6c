//! campaign-pipeline - content campaign orchestration with rate-limited
//! generators and a durable publish scheduler

pub mod cli;
pub mod core;
pub mod execution;
pub mod generator;
pub mod persistence;
pub mod publish;
pub mod scheduling;
pub mod settings;

// Re-export commonly used types
pub use crate::core::{
    CombinedResult, FailureMode, Pipeline, PipelineContext, PipelineOutcome, PipelineStatus,
    RetryPolicy, Step,
};
pub use crate::execution::{
    ExecutionEvent, OrchestrationRequest, Orchestrator, PipelineError, ThrottleKey, ThrottlePool,
};
pub use crate::generator::{FnGenerator, GenerateError, Generator, StepOutput};
pub use crate::persistence::{InMemoryJobStore, JobStatus, JobStore, NewJob, ScheduledJob, StoreError};
pub use crate::scheduling::{HandlerRegistry, JobHandler, JobInvocation, SchedulerRuntime};
