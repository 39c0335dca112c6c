//! CLI command definitions

use crate::persistence::JobStatus;
use chrono::{DateTime, Utc};
use clap::Args;

/// Run every pipeline of a campaign
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Path to campaign YAML file
    #[arg(short, long)]
    pub file: String,

    /// Variable overrides (key=value)
    #[arg(long, value_parser = parse_key_value)]
    pub variable: Vec<(String, String)>,

    /// Print the combined result as JSON
    #[arg(long)]
    pub json: bool,
}

/// Validate a campaign configuration
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to campaign YAML file
    #[arg(short, long)]
    pub file: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Schedule a deferred action
#[derive(Debug, Args, Clone)]
pub struct ScheduleCommand {
    /// Handler that runs the job
    #[arg(long, default_value = "publish")]
    pub handler: String,

    /// JSON payload handed to the handler
    #[arg(long)]
    pub payload: String,

    /// When to run, RFC 3339 (e.g. 2026-11-01T09:00:00Z)
    #[arg(long, value_parser = parse_run_at)]
    pub at: DateTime<Utc>,

    /// How late the job may still run, in seconds
    #[arg(long)]
    pub grace_secs: Option<u64>,
}

/// Cancel a pending job
#[derive(Debug, Args, Clone)]
pub struct CancelCommand {
    /// Job ID
    pub job_id: String,
}

/// Show one job
#[derive(Debug, Args, Clone)]
pub struct StatusCommand {
    /// Job ID
    pub job_id: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// List scheduled jobs
#[derive(Debug, Args, Clone)]
pub struct JobsCommand {
    /// Only jobs in this status
    #[arg(short, long, value_parser = parse_job_status)]
    pub status: Option<JobStatus>,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Run the scheduler until interrupted
#[derive(Debug, Args, Clone)]
pub struct ServeCommand {
    /// Override the tick interval (milliseconds)
    #[arg(long)]
    pub tick_ms: Option<u64>,
}

/// Parse key=value pairs
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("Invalid key=value pair: {}", s)),
    }
}

/// Parse an RFC 3339 timestamp with offset into UTC
pub fn parse_run_at(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("Invalid timestamp '{}': {}", s, e))
}

pub fn parse_job_status(s: &str) -> Result<JobStatus, String> {
    s.parse()
}
