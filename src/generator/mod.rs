//! Generator contract for the external services a step calls

pub mod command;
pub mod response;

use crate::core::PipelineContext;
use async_trait::async_trait;
use std::future::Future;

pub use command::{CommandGenerator, ErrorPattern};
pub use response::{GenerateError, StepOutput};

/// Trait for generator execution - allows for different implementations
///
/// A generator is one opaque, possibly slow call to an external service
/// (text, image, audio or video synthesis). It sees the outputs of every
/// earlier step in its pipeline through the context.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Produce this step's output
    async fn generate(&self, context: &PipelineContext) -> Result<StepOutput, GenerateError>;
}

/// Generator backed by an async closure
pub struct FnGenerator<F> {
    f: F,
}

impl<F, Fut> FnGenerator<F>
where
    F: Fn(PipelineContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StepOutput, GenerateError>> + Send,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Generator for FnGenerator<F>
where
    F: Fn(PipelineContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StepOutput, GenerateError>> + Send,
{
    async fn generate(&self, context: &PipelineContext) -> Result<StepOutput, GenerateError> {
        (self.f)(context.clone()).await
    }
}
