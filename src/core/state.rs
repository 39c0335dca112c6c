//! Execution state models

use crate::generator::StepOutput;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Terminal status of a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineStatus {
    Succeeded,
    Failed,
}

/// Why a pipeline failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A step failed with a non-retryable error
    Terminal,
    /// A step kept failing transiently until its attempts ran out
    RetriesExhausted,
    /// The pipeline was cancelled between steps
    Cancelled,
    /// A step asked for a throttle that cannot be acquired
    Throttle,
    /// A generator panicked
    Panicked,
}

/// Diagnosable description of a pipeline failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub kind: FailureKind,

    /// Step that failed, if the failure is attributable to one
    pub step: Option<String>,

    /// Attempts made by the failing step
    pub attempts: u32,

    /// Last error message
    pub message: String,
}

/// Record of one step's execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,

    /// Reason the output is degraded, if it is
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded: Option<String>,

    /// Error that ended the step, if it failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Final result of one pipeline
///
/// Immutable once produced by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineOutcome {
    pub pipeline_id: String,
    pub status: PipelineStatus,

    /// Outputs of the steps that completed (all of them on success)
    pub outputs: BTreeMap<String, StepOutput>,

    /// Steps that ran, in order
    pub steps: Vec<StepRecord>,

    /// Set when the pipeline failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureDetail>,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl PipelineOutcome {
    /// Create a successful outcome
    pub fn succeeded(
        pipeline_id: impl Into<String>,
        outputs: BTreeMap<String, StepOutput>,
        steps: Vec<StepRecord>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            status: PipelineStatus::Succeeded,
            outputs,
            steps,
            error: None,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Create a failed outcome
    pub fn failed(
        pipeline_id: impl Into<String>,
        error: FailureDetail,
        outputs: BTreeMap<String, StepOutput>,
        steps: Vec<StepRecord>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            status: PipelineStatus::Failed,
            outputs,
            steps,
            error: Some(error),
            started_at,
            finished_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == PipelineStatus::Succeeded
    }

    /// Value produced by the last step that ran successfully
    pub fn final_value(&self) -> Option<&Value> {
        self.steps
            .iter()
            .rev()
            .find(|s| s.error.is_none())
            .and_then(|s| self.outputs.get(&s.name))
            .map(|o| &o.value)
    }

    /// Steps whose output is degraded
    pub fn degraded_steps(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| s.degraded.is_some())
            .map(|s| s.name.as_str())
            .collect()
    }
}

/// Fan-in of every pipeline submitted in one orchestration request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombinedResult {
    pub correlation_id: String,

    /// One outcome per submitted pipeline, in submission order
    pub outcomes: Vec<PipelineOutcome>,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl CombinedResult {
    /// Get the outcome of a pipeline
    pub fn outcome(&self, pipeline_id: &str) -> Option<&PipelineOutcome> {
        self.outcomes.iter().find(|o| o.pipeline_id == pipeline_id)
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &PipelineOutcome> {
        self.outcomes.iter().filter(|o| o.is_success())
    }

    pub fn failed(&self) -> impl Iterator<Item = &PipelineOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }

    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(PipelineOutcome::is_success)
    }
}
