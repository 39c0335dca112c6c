//! Step domain model

use crate::core::config::StepConfig;
use crate::execution::ThrottleKey;
use crate::generator::{CommandGenerator, ErrorPattern, GenerateError, Generator};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A single step in a pipeline
#[derive(Clone)]
pub struct Step {
    /// Step name, unique within its pipeline; its output is stored under it
    pub name: String,

    /// The external call this step makes
    pub generator: Arc<dyn Generator>,

    /// Throttle permits held for the duration of each generator call
    pub throttle_keys: Vec<ThrottleKey>,

    /// Retry policy for transient failures
    pub retry: RetryPolicy,

    /// Upper bound on a single generator call
    pub timeout: Duration,

    /// What a terminal failure means for the pipeline
    pub failure_mode: FailureMode,
}

/// How a step's terminal failure affects its pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum FailureMode {
    /// Fail the pipeline
    Abort,
    /// Record a degraded output carrying the placeholder and continue
    Degrade { placeholder: Value },
}

/// Retry policy for a step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,

    /// Whether transient failures are retried at all
    pub retry_transient: bool,

    /// Delay before the first retry; doubles per retry
    pub backoff: Duration,

    /// Cap on the retry delay
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Retry transient failures up to `max_attempts` total, without delay
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            retry_transient: true,
            backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Single attempt, never retried
    pub fn no_retry() -> Self {
        Self {
            retry_transient: false,
            ..Self::new(1)
        }
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    /// Whether a failure on attempt `attempt` (1-based) should be retried
    pub fn should_retry(&self, error: &GenerateError, attempt: u32) -> bool {
        self.retry_transient && error.is_transient() && attempt < self.max_attempts
    }

    /// Delay before the attempt following `attempt`
    pub fn delay_after(&self, attempt: u32) -> Duration {
        if self.backoff.is_zero() {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        StepDefaults::default().retry_policy()
    }
}

/// Defaults applied to steps that don't override them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepDefaults {
    pub max_attempts: u32,
    pub timeout_secs: u64,
    pub backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for StepDefaults {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout_secs: 300, // 5 minutes
            backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

impl StepDefaults {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts).with_backoff(
            Duration::from_millis(self.backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Step {
    /// Create a step with default retry policy and timeout
    pub fn new(name: impl Into<String>, generator: Arc<dyn Generator>) -> Self {
        let defaults = StepDefaults::default();
        Self {
            name: name.into(),
            generator,
            throttle_keys: Vec::new(),
            retry: defaults.retry_policy(),
            timeout: defaults.timeout(),
            failure_mode: FailureMode::Abort,
        }
    }

    /// Create a step from a step config
    pub fn from_config(config: &StepConfig, defaults: &StepDefaults) -> Self {
        let (program, args) = match config.command.split_first() {
            Some((program, args)) => (program.clone(), args.to_vec()),
            None => (String::new(), Vec::new()),
        };

        let mut generator = CommandGenerator::new(program).with_args(args);
        for (key, value) in &config.env {
            generator = generator.with_env(key, value);
        }
        for pattern in &config.transient_patterns {
            generator = generator.with_transient_pattern(ErrorPattern::new(pattern, config.use_regex));
        }

        let max_attempts = config.max_attempts.unwrap_or(defaults.max_attempts);
        let backoff_ms = config.backoff_ms.unwrap_or(defaults.backoff_ms);
        let retry = RetryPolicy::new(max_attempts).with_backoff(
            Duration::from_millis(backoff_ms),
            Duration::from_millis(defaults.max_backoff_ms),
        );

        let failure_mode = if config.optional {
            FailureMode::Degrade {
                placeholder: config.placeholder.clone().unwrap_or(Value::Null),
            }
        } else {
            FailureMode::Abort
        };

        Step {
            name: config.name.clone(),
            generator: Arc::new(generator),
            throttle_keys: config.throttle.iter().map(ThrottleKey::from).collect(),
            retry,
            timeout: Duration::from_secs(config.timeout_secs.unwrap_or(defaults.timeout_secs)),
            failure_mode,
        }
    }

    pub fn with_throttle(mut self, key: impl Into<ThrottleKey>) -> Self {
        self.throttle_keys.push(key.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Continue the pipeline with `placeholder` if this step fails terminally
    pub fn optional(mut self, placeholder: Value) -> Self {
        self.failure_mode = FailureMode::Degrade { placeholder };
        self
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("throttle_keys", &self.throttle_keys)
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .field("failure_mode", &self.failure_mode)
            .finish_non_exhaustive()
    }
}
