//! Generator output and error types

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Error types for generator calls
#[derive(Debug, Clone, Error)]
pub enum GenerateError {
    /// Network, rate-limit or similar failure; the same input may succeed later
    #[error("transient failure: {0}")]
    Transient(String),

    /// Invalid input, exhausted quota, rejected output; retrying cannot help
    #[error("terminal failure: {0}")]
    Terminal(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl GenerateError {
    /// Whether a retry with the same input is worthwhile
    pub fn is_transient(&self) -> bool {
        matches!(self, GenerateError::Transient(_) | GenerateError::Timeout(_))
    }
}

/// Output of one step
///
/// A degraded output is still a success: the step produced something usable
/// (e.g. a placeholder instead of a missing hero image) and the pipeline
/// carries on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    /// The produced value
    pub value: Value,

    /// Why the output is degraded, if it is
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded: Option<String>,
}

impl StepOutput {
    /// Create a regular output
    pub fn new(value: Value) -> Self {
        Self {
            value,
            degraded: None,
        }
    }

    /// Create a degraded output
    pub fn degraded(value: Value, reason: impl Into<String>) -> Self {
        Self {
            value,
            degraded: Some(reason.into()),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }
}
