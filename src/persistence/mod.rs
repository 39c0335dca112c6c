//! Persistence layer for scheduled jobs
//!
//! The store owns every job record. The scheduler runtime keeps nothing of
//! its own between ticks and rebuilds its view from the store on restart.

#[cfg(feature = "sqlite")]
pub mod store;

#[cfg(feature = "sqlite")]
pub use store::SqliteJobStore;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Lifecycle of a scheduled job
///
/// `Pending -> Executing -> {Completed | Failed}` or `Pending -> Cancelled`.
/// A pending job whose misfire grace has run out also ends as `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Executing => "executing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "executing" => Ok(JobStatus::Executing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// A deferred action and its current state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    /// Unique for the lifetime of the store
    pub id: String,

    /// Name of the handler that executes this job
    pub handler: String,

    /// Opaque payload handed to the handler
    pub payload: Value,

    /// When the job should run; never changes after creation
    pub run_at: DateTime<Utc>,

    pub status: JobStatus,

    /// How late the job may still run; `None` means always
    pub misfire_grace_secs: Option<u64>,

    /// Times the job was claimed for execution
    pub attempts: u32,

    /// Outcome text recorded with the terminal status
    pub detail: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledJob {
    /// How far past its run time the job is at `now` (negative if early)
    pub fn lateness(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.run_at
    }

    /// Whether a run at `now` is still inside the misfire grace window
    pub fn within_grace(&self, now: DateTime<Utc>) -> bool {
        match self.misfire_grace_secs {
            None => true,
            Some(grace) => {
                let grace = chrono::Duration::seconds(i64::try_from(grace).unwrap_or(i64::MAX));
                self.lateness(now) <= grace
            }
        }
    }

    /// Pending, at or past its run time and inside its grace window
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.run_at <= now && self.within_grace(now)
    }

    /// Pending and too late to run at all
    pub fn is_misfired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.run_at <= now && !self.within_grace(now)
    }

    fn misfire_detail(&self, now: DateTime<Utc>) -> String {
        format!(
            "missed run time by {}s (grace {}s)",
            self.lateness(now).num_seconds(),
            self.misfire_grace_secs.unwrap_or_default()
        )
    }
}

/// A job to enqueue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub handler: String,
    pub payload: Value,
    pub run_at: DateTime<Utc>,
    #[serde(default)]
    pub misfire_grace_secs: Option<u64>,
}

impl NewJob {
    pub fn new(handler: impl Into<String>, payload: Value, run_at: DateTime<Utc>) -> Self {
        Self {
            handler: handler.into(),
            payload,
            run_at,
            misfire_grace_secs: None,
        }
    }

    pub fn with_misfire_grace(mut self, secs: u64) -> Self {
        self.misfire_grace_secs = Some(secs);
        self
    }

    fn into_job(self, now: DateTime<Utc>) -> ScheduledJob {
        ScheduledJob {
            id: Uuid::new_v4().to_string(),
            handler: self.handler,
            payload: self.payload,
            run_at: self.run_at,
            status: JobStatus::Pending,
            misfire_grace_secs: self.misfire_grace_secs,
            attempts: 0,
            detail: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Error types for job stores
#[derive(Debug, Error)]
pub enum StoreError {
    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt job record {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Format a timestamp the way stores persist it
///
/// Fixed-width UTC text, so lexical order equals chronological order.
pub fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Durable record of deferred actions
///
/// Every status change is a single conditional transition: a job is moved
/// only if it is still in the expected state.
#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new pending job and return its id
    async fn enqueue(&self, job: NewJob) -> Result<String, StoreError>;

    /// Load a job by ID
    async fn get(&self, id: &str) -> Result<Option<ScheduledJob>, StoreError>;

    /// Cancel a pending job; `false` if it is unknown or no longer pending
    async fn cancel(&self, id: &str) -> Result<bool, StoreError>;

    /// Pending jobs due at `now` and inside their grace window,
    /// ordered by run time then id
    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>, StoreError>;

    /// Claim a pending job for execution, counting the attempt
    async fn mark_executing(&self, id: &str) -> Result<bool, StoreError>;

    /// Record the outcome of an executing job (`Completed` or `Failed`)
    async fn mark_terminal(
        &self,
        id: &str,
        status: JobStatus,
        detail: Option<String>,
    ) -> Result<(), StoreError>;

    /// Fail pending jobs whose bounded grace window has passed
    async fn expire_misfired(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>, StoreError>;

    /// Return jobs left executing by a previous process to pending
    async fn recover_interrupted(&self) -> Result<u64, StoreError>;

    /// List jobs, optionally filtered by status, ordered by run time then id
    async fn list(&self, status: Option<JobStatus>) -> Result<Vec<ScheduledJob>, StoreError>;
}

fn check_terminal_target(id: &str, status: JobStatus) -> Result<(), StoreError> {
    match status {
        JobStatus::Completed | JobStatus::Failed => Ok(()),
        other => Err(StoreError::InvalidTransition {
            id: id.to_string(),
            from: JobStatus::Executing,
            to: other,
        }),
    }
}

/// In-memory job store (for testing or ephemeral use)
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<BTreeMap<String, ScheduledJob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted(mut jobs: Vec<ScheduledJob>) -> Vec<ScheduledJob> {
    jobs.sort_by(|a, b| a.run_at.cmp(&b.run_at).then_with(|| a.id.cmp(&b.id)));
    jobs
}

#[async_trait::async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: NewJob) -> Result<String, StoreError> {
        let job = job.into_job(Utc::now());
        let id = job.id.clone();
        self.jobs.write().await.insert(id.clone(), job);
        Ok(id)
    }

    async fn get(&self, id: &str) -> Result<Option<ScheduledJob>, StoreError> {
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn cancel(&self, id: &str) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(id) {
            Some(job) if job.status == JobStatus::Pending => {
                job.status = JobStatus::Cancelled;
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>, StoreError> {
        let jobs = self.jobs.read().await;
        Ok(sorted(jobs.values().filter(|j| j.is_due(now)).cloned().collect()))
    }

    async fn mark_executing(&self, id: &str) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(id) {
            Some(job) if job.status == JobStatus::Pending => {
                job.status = JobStatus::Executing;
                job.attempts += 1;
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_terminal(
        &self,
        id: &str,
        status: JobStatus,
        detail: Option<String>,
    ) -> Result<(), StoreError> {
        check_terminal_target(id, status)?;

        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if job.status != JobStatus::Executing {
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from: job.status,
                to: status,
            });
        }

        job.status = status;
        job.detail = detail;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn expire_misfired(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>, StoreError> {
        let mut jobs = self.jobs.write().await;
        let mut expired = Vec::new();
        for job in jobs.values_mut().filter(|j| j.is_misfired(now)) {
            job.detail = Some(job.misfire_detail(now));
            job.status = JobStatus::Failed;
            job.updated_at = Utc::now();
            expired.push(job.clone());
        }
        Ok(sorted(expired))
    }

    async fn recover_interrupted(&self) -> Result<u64, StoreError> {
        let mut jobs = self.jobs.write().await;
        let mut recovered = 0;
        for job in jobs.values_mut().filter(|j| j.status == JobStatus::Executing) {
            job.status = JobStatus::Pending;
            job.updated_at = Utc::now();
            recovered += 1;
        }
        Ok(recovered)
    }

    async fn list(&self, status: Option<JobStatus>) -> Result<Vec<ScheduledJob>, StoreError> {
        let jobs = self.jobs.read().await;
        Ok(sorted(
            jobs.values()
                .filter(|j| status.map_or(true, |s| j.status == s))
                .cloned()
                .collect(),
        ))
    }
}
