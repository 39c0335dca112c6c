//! Pipeline context - shared state and variables

use crate::generator::StepOutput;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Execution context for a pipeline run
///
/// Contains the request variables and the outputs of every step that has
/// completed so far. It is what a generator receives as input.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineContext {
    /// Pipeline this context belongs to
    pub pipeline_id: String,

    /// Request-level and pipeline-level variables (topic, duration, ...)
    pub variables: HashMap<String, String>,

    /// Outputs from completed steps (step name -> output)
    pub step_outputs: BTreeMap<String, StepOutput>,

    /// The current step being executed (if any)
    pub current_step: Option<String>,

    /// Metadata about the execution
    pub metadata: HashMap<String, String>,
}

impl PipelineContext {
    /// Create a new empty context
    pub fn new(pipeline_id: impl Into<String>) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            ..Self::default()
        }
    }

    /// Set a variable
    pub fn set_variable(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.variables.insert(key.into(), value.into());
    }

    /// Get a variable
    pub fn get_variable(&self, key: &str) -> Option<&String> {
        self.variables.get(key)
    }

    /// Set the output of a step
    pub fn set_step_output(&mut self, step: &str, output: StepOutput) {
        self.step_outputs.insert(step.to_string(), output);
    }

    /// Get the output of a step
    pub fn get_step_output(&self, step: &str) -> Option<&StepOutput> {
        self.step_outputs.get(step)
    }

    /// Get the value produced by a step
    pub fn output_value(&self, step: &str) -> Option<&Value> {
        self.step_outputs.get(step).map(|o| &o.value)
    }

    /// Names of steps whose output is degraded
    pub fn degraded_steps(&self) -> Vec<&str> {
        self.step_outputs
            .iter()
            .filter(|(_, output)| output.is_degraded())
            .map(|(name, _)| name.as_str())
            .collect()
    }
}
