//! Pipeline execution: throttling, step retries, pipelines and fan-out

pub mod engine;
pub mod executor;
pub mod orchestrator;
pub mod throttle;

pub use engine::{EventBus, EventHandler, ExecutionEngine, ExecutionEvent};
pub use executor::{PipelineError, StepExecutor, StepSuccess};
pub use orchestrator::{OrchestrationRequest, Orchestrator};
pub use throttle::{PermitSet, ThrottleError, ThrottleKey, ThrottlePermit, ThrottlePool};
