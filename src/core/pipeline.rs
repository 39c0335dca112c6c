//! Pipeline domain model

use crate::core::{
    config::PipelineDefinition,
    context::PipelineContext,
    step::{Step, StepDefaults},
};
use std::collections::HashMap;

/// An ordered sequence of steps producing one deliverable
///
/// Steps run strictly in declared order; there is no parallelism inside a
/// pipeline.
#[derive(Debug, Clone)]
pub struct Pipeline {
    /// Pipeline identifier, unique within one orchestration request
    pub id: String,

    /// Variables available to every step of this pipeline
    pub variables: HashMap<String, String>,

    /// Steps in execution order
    pub steps: Vec<Step>,
}

impl Pipeline {
    /// Create an empty pipeline
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            variables: HashMap::new(),
            steps: Vec::new(),
        }
    }

    /// Create a pipeline from its campaign definition
    pub fn from_config(definition: &PipelineDefinition, defaults: &StepDefaults) -> Self {
        Pipeline {
            id: definition.id.clone(),
            variables: definition.variables.clone(),
            steps: definition
                .steps
                .iter()
                .map(|step| Step::from_config(step, defaults))
                .collect(),
        }
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    /// Get a step by name
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Step names in execution order
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }

    /// Create the context the first step sees
    ///
    /// Request-level variables are overridden by the pipeline's own.
    pub fn initial_context(
        &self,
        correlation_id: &str,
        request_variables: &HashMap<String, String>,
    ) -> PipelineContext {
        let mut context = PipelineContext::new(self.id.clone());
        context.variables.extend(request_variables.clone());
        context.variables.extend(self.variables.clone());
        context
            .metadata
            .insert("correlation_id".to_string(), correlation_id.to_string());
        context
    }
}
