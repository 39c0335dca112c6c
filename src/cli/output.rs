//! CLI output formatting

use crate::{
    core::{FailureDetail, PipelineOutcome, PipelineStatus},
    execution::ExecutionEvent,
    persistence::{JobStatus, ScheduledJob},
};
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "!");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");
pub static CLOCK: Emoji<'_, '_> = Emoji("⏰ ", "@ ");

/// Create a progress bar counting finished pipelines
pub fn create_progress_bar(total: usize) -> ProgressBar {
    let progress = ProgressBar::new(total as u64);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    progress.set_style(style);
    progress.enable_steady_tick(Duration::from_millis(100));
    progress
}

/// Format a pipeline status for display
pub fn format_pipeline_status(status: PipelineStatus) -> String {
    match status {
        PipelineStatus::Succeeded => style("SUCCEEDED").green().to_string(),
        PipelineStatus::Failed => style("FAILED").red().to_string(),
    }
}

/// Format a job status for display
pub fn format_job_status(status: JobStatus) -> String {
    let label = status.as_str().to_uppercase();
    match status {
        JobStatus::Pending => style(label).dim().to_string(),
        JobStatus::Executing => style(label).yellow().to_string(),
        JobStatus::Completed => style(label).green().to_string(),
        JobStatus::Failed => style(label).red().to_string(),
        JobStatus::Cancelled => style(label).yellow().to_string(),
    }
}

fn format_failure(failure: &FailureDetail) -> String {
    match &failure.step {
        Some(step) => format!("{} ({} attempt(s)): {}", step, failure.attempts, failure.message),
        None => failure.message.clone(),
    }
}

/// Format one pipeline outcome for display
pub fn format_outcome(outcome: &PipelineOutcome) -> String {
    let elapsed = (outcome.finished_at - outcome.started_at)
        .to_std()
        .unwrap_or_default();
    let icon = if outcome.is_success() { CHECK } else { CROSS };

    let mut line = format!(
        "{} {} - {} - {} step(s) in {}",
        icon,
        style(&outcome.pipeline_id).bold(),
        format_pipeline_status(outcome.status),
        outcome.steps.len(),
        format_duration(elapsed)
    );

    let degraded = outcome.degraded_steps();
    if !degraded.is_empty() {
        line.push_str(&format!(
            "\n   {} degraded: {}",
            WARN,
            style(degraded.join(", ")).yellow()
        ));
    }
    if let Some(failure) = &outcome.error {
        line.push_str(&format!("\n   {}", style(format_failure(failure)).dim()));
    }
    line
}

/// Format a scheduled job for display
pub fn format_job(job: &ScheduledJob) -> String {
    let short_id = job.id.get(..8).unwrap_or(&job.id);
    let mut line = format!(
        "{} {} - {} - {} - {}",
        CLOCK,
        style(short_id).dim(),
        style(&job.handler).bold(),
        format_job_status(job.status),
        style(job.run_at.to_rfc3339()).cyan()
    );
    if job.attempts > 1 {
        line.push_str(&format!(" (attempt {})", job.attempts));
    }
    line
}

/// Format a scheduled job with all its fields
pub fn format_job_details(job: &ScheduledJob) -> String {
    let mut out = format!(
        "{} {}\n  Handler:  {}\n  Status:   {}\n  Run at:   {}\n  Attempts: {}\n",
        CLOCK,
        style(&job.id).bold(),
        job.handler,
        format_job_status(job.status),
        job.run_at.to_rfc3339(),
        job.attempts
    );
    match job.misfire_grace_secs {
        Some(grace) => out.push_str(&format!("  Grace:    {}s\n", grace)),
        None => out.push_str("  Grace:    unbounded\n"),
    }
    if let Some(detail) = &job.detail {
        out.push_str(&format!("  Detail:   {}\n", detail));
    }
    out.push_str(&format!("  Payload:  {}", job.payload));
    out
}

/// Format an execution event for display
pub fn format_execution_event(event: &ExecutionEvent) -> String {
    match event {
        ExecutionEvent::PipelineStarted { pipeline_id, .. } => {
            format!("{} Starting pipeline {}", ROCKET, style(pipeline_id).bold())
        }
        ExecutionEvent::StepStarted {
            pipeline_id,
            step,
            attempt,
        } => {
            if *attempt > 1 {
                format!(
                    "{} {}/{} (attempt {})",
                    SPINNER,
                    style(pipeline_id).dim(),
                    style(step).cyan(),
                    attempt
                )
            } else {
                format!("{} {}/{}", SPINNER, style(pipeline_id).dim(), style(step).cyan())
            }
        }
        ExecutionEvent::StepRetrying {
            pipeline_id,
            step,
            attempt,
            max_attempts,
            error,
        } => format!(
            "{} {}/{} failed (attempt {}/{}): {}",
            WARN,
            style(pipeline_id).dim(),
            style(step).yellow(),
            attempt,
            max_attempts,
            style(error).dim()
        ),
        ExecutionEvent::StepCompleted {
            pipeline_id,
            step,
            degraded,
            ..
        } => {
            if *degraded {
                format!(
                    "{} {}/{} (degraded)",
                    WARN,
                    style(pipeline_id).dim(),
                    style(step).yellow()
                )
            } else {
                format!("{} {}/{}", CHECK, style(pipeline_id).dim(), style(step).green())
            }
        }
        ExecutionEvent::StepFailed {
            pipeline_id,
            step,
            error,
        } => format!(
            "{} {}/{}: {}",
            CROSS,
            style(pipeline_id).dim(),
            style(step).red(),
            style(error).dim()
        ),
        ExecutionEvent::PipelineFinished {
            pipeline_id,
            status,
        } => format!(
            "{} {} {}",
            INFO,
            style(pipeline_id).bold(),
            format_pipeline_status(*status)
        ),
    }
}

/// Format a duration as a short human-readable string
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 3600 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{:.1}s", duration.as_secs_f64())
    }
}
