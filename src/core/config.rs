//! Campaign configuration from YAML

use crate::core::{Pipeline, StepDefaults};
use crate::execution::{OrchestrationRequest, ThrottleKey, ThrottlePool};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Top-level campaign configuration loaded from YAML
///
/// A campaign is one orchestration request: every pipeline in it runs
/// concurrently against the same topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignConfig {
    /// Campaign name
    pub name: String,

    /// Variables available to every pipeline
    #[serde(default)]
    pub variables: HashMap<String, String>,

    /// Maximum attempts per step (overrides the settings default)
    #[serde(default)]
    pub max_attempts: Option<u32>,

    /// Default timeout for steps (in seconds)
    #[serde(default)]
    pub default_timeout_secs: Option<u64>,

    /// Pipelines to run, one per deliverable
    pub pipelines: Vec<PipelineDefinition>,
}

/// One pipeline as declared in a campaign file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Pipeline identifier, unique within the campaign
    pub id: String,

    /// Variables only this pipeline sees
    #[serde(default)]
    pub variables: HashMap<String, String>,

    /// Steps in execution order
    pub steps: Vec<StepConfig>,
}

/// Step configuration as defined in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    /// Step name, unique within its pipeline
    pub name: String,

    /// Generator program and its arguments
    pub command: Vec<String>,

    /// Extra environment for the generator program
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Throttle keys held while the generator runs
    #[serde(default)]
    pub throttle: Vec<String>,

    /// Maximum attempts for this step (overrides campaign default)
    #[serde(default)]
    pub max_attempts: Option<u32>,

    /// Initial retry backoff in milliseconds
    #[serde(default)]
    pub backoff_ms: Option<u64>,

    /// Timeout for this step (overrides campaign default)
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Stderr patterns that mark a failure as transient
    #[serde(default)]
    pub transient_patterns: Vec<String>,

    /// Whether to use regex pattern matching
    #[serde(default)]
    pub use_regex: bool,

    /// Continue the pipeline with a degraded output if this step fails
    #[serde(default)]
    pub optional: bool,

    /// Value recorded for an optional step that failed
    #[serde(default)]
    pub placeholder: Option<serde_json::Value>,
}

impl CampaignConfig {
    /// Load campaign configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read campaign file {}", path.display()))?;
        Self::from_yaml(&content)
    }

    /// Parse campaign configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: CampaignConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the campaign structure
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == Some(0) {
            anyhow::bail!("Campaign max_attempts must be at least 1");
        }

        let mut seen_pipelines = HashSet::new();
        for pipeline in &self.pipelines {
            if !seen_pipelines.insert(&pipeline.id) {
                anyhow::bail!("Duplicate pipeline ID: {}", pipeline.id);
            }
            if pipeline.steps.is_empty() {
                anyhow::bail!("Pipeline '{}' has no steps", pipeline.id);
            }

            let mut seen_steps = HashSet::new();
            for step in &pipeline.steps {
                if !seen_steps.insert(&step.name) {
                    anyhow::bail!(
                        "Duplicate step name '{}' in pipeline '{}'",
                        step.name,
                        pipeline.id
                    );
                }
                if step.command.is_empty() {
                    anyhow::bail!(
                        "Step '{}' in pipeline '{}' has an empty command",
                        step.name,
                        pipeline.id
                    );
                }
                if step.max_attempts == Some(0) {
                    anyhow::bail!(
                        "Step '{}' in pipeline '{}' must allow at least 1 attempt",
                        step.name,
                        pipeline.id
                    );
                }
            }
        }

        Ok(())
    }

    /// Check that every throttle key a step names is configured
    pub fn validate_throttles(&self, pool: &ThrottlePool) -> Result<()> {
        for pipeline in &self.pipelines {
            for step in &pipeline.steps {
                for key in &step.throttle {
                    if !pool.contains(&ThrottleKey::from(key)) {
                        anyhow::bail!(
                            "Step '{}' in pipeline '{}' uses unknown throttle key '{}'",
                            step.name,
                            pipeline.id,
                            key
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Step defaults with this campaign's overrides applied
    pub fn step_defaults(&self, base: &StepDefaults) -> StepDefaults {
        StepDefaults {
            max_attempts: self.max_attempts.unwrap_or(base.max_attempts),
            timeout_secs: self.default_timeout_secs.unwrap_or(base.timeout_secs),
            ..base.clone()
        }
    }

    /// Convert config to pipeline domain models
    pub fn to_pipelines(&self, base: &StepDefaults) -> Vec<Pipeline> {
        let defaults = self.step_defaults(base);
        self.pipelines
            .iter()
            .map(|definition| Pipeline::from_config(definition, &defaults))
            .collect()
    }

    /// Build the orchestration request for this campaign
    pub fn to_request(&self, base: &StepDefaults) -> OrchestrationRequest {
        OrchestrationRequest::new(self.to_pipelines(base))
            .with_variables(self.variables.clone())
            .with_variable("campaign", self.name.clone())
    }
}
