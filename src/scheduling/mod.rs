//! Deferred actions: handlers and the runtime that fires them

pub mod handler;
pub mod runtime;

pub use handler::{HandlerError, HandlerRegistry, JobHandler, JobInvocation};
pub use runtime::{JobReport, RuntimeConfig, SchedulerRuntime};
