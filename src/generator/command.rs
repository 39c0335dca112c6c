//! Subprocess generator - runs an external program per step

use crate::core::PipelineContext;
use crate::generator::{GenerateError, Generator, StepOutput};
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::process::{Output, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Exit code a generator uses to report a retryable failure (`EX_TEMPFAIL`)
pub const EXIT_TEMPFAIL: i32 = 75;

/// Pattern matched against a failed generator's stderr
#[derive(Debug, Clone)]
pub enum ErrorPattern {
    /// Simple string contains match
    Simple(String),
    /// Regular expression match
    Regex(Regex),
}

impl ErrorPattern {
    /// Build a pattern, falling back to a plain substring if the regex does not compile
    pub fn new(pattern: &str, use_regex: bool) -> Self {
        if use_regex {
            match Regex::new(pattern) {
                Ok(regex) => ErrorPattern::Regex(regex),
                Err(e) => {
                    warn!("Invalid regex '{}' ({}), matching as plain text", pattern, e);
                    ErrorPattern::Simple(pattern.to_string())
                }
            }
        } else {
            ErrorPattern::Simple(pattern.to_string())
        }
    }

    /// Check if the pattern matches the given text
    pub fn matches(&self, text: &str) -> bool {
        match self {
            ErrorPattern::Simple(pattern) => text.contains(pattern.as_str()),
            ErrorPattern::Regex(regex) => regex.is_match(text),
        }
    }
}

/// Generator that calls an external program
///
/// The pipeline context is written to the program's stdin as JSON. Stdout is
/// the step output: a JSON document, or plain text if it does not parse. An
/// object of the form `{"value": ..., "degraded": "reason"}` is read as a
/// [`StepOutput`] directly.
///
/// A non-zero exit is terminal unless the exit code is [`EXIT_TEMPFAIL`] or
/// stderr matches one of the transient patterns.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    program: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    transient_patterns: Vec<ErrorPattern>,
}

impl CommandGenerator {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            transient_patterns: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_transient_pattern(mut self, pattern: ErrorPattern) -> Self {
        self.transient_patterns.push(pattern);
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn classify_failure(&self, output: &Output) -> GenerateError {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        let message = match output.status.code() {
            Some(code) => format!("{} exited with code {}: {}", self.program, code, stderr),
            None => format!("{} terminated by signal: {}", self.program, stderr),
        };

        let transient = match output.status.code() {
            Some(EXIT_TEMPFAIL) | None => true,
            Some(_) => self.transient_patterns.iter().any(|p| p.matches(stderr)),
        };

        if transient {
            GenerateError::Transient(message)
        } else {
            GenerateError::Terminal(message)
        }
    }
}

/// Spawn a program, feed it `input` on stdin and collect its output
pub(crate) async fn run_with_stdin(
    program: &str,
    args: &[String],
    env: &HashMap<String, String>,
    input: &[u8],
) -> std::io::Result<Output> {
    let mut child = Command::new(program)
        .args(args)
        .envs(env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    // Feed stdin while stdout and stderr are drained, or a program whose
    // output grows with its input blocks on a full pipe
    let stdin = child.stdin.take();
    let feed = async move {
        if let Some(mut stdin) = stdin {
            // A program that ignores its input may close stdin early
            if let Err(e) = stdin.write_all(input).await {
                debug!("{} did not read its input: {}", program, e);
            }
        }
    };

    let ((), output) = tokio::join!(feed, child.wait_with_output());
    output
}

/// Parse a generator's stdout into a step output
pub(crate) fn parse_output(stdout: &[u8]) -> StepOutput {
    let text = String::from_utf8_lossy(stdout);
    let text = text.trim();
    if text.is_empty() {
        return StepOutput::new(Value::Null);
    }

    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) if map.contains_key("value") => {
            serde_json::from_value(Value::Object(map.clone()))
                .unwrap_or_else(|_| StepOutput::new(Value::Object(map)))
        }
        Ok(value) => StepOutput::new(value),
        Err(_) => StepOutput::new(Value::String(text.to_string())),
    }
}

#[async_trait]
impl Generator for CommandGenerator {
    async fn generate(&self, context: &PipelineContext) -> Result<StepOutput, GenerateError> {
        let input = serde_json::to_vec(context)
            .map_err(|e| GenerateError::Terminal(format!("Failed to encode context: {}", e)))?;

        debug!(
            "Spawning {} for step {:?} ({} bytes of context)",
            self.program,
            context.current_step,
            input.len()
        );

        let output = run_with_stdin(&self.program, &self.args, &self.env, &input)
            .await
            .map_err(|e| {
                GenerateError::Terminal(format!("Failed to execute {}: {}", self.program, e))
            })?;

        if !output.status.success() {
            let error = self.classify_failure(&output);
            warn!("{}", error);
            return Err(error);
        }

        Ok(parse_output(&output.stdout))
    }
}
