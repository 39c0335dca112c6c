//! Scheduler runtime - wakes due jobs and runs them through their handlers

use crate::{
    execution::orchestrator::panic_message,
    persistence::{JobStatus, JobStore, ScheduledJob, StoreError},
    scheduling::{HandlerRegistry, JobInvocation},
    settings::SchedulerSettings,
};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const RECORD_ATTEMPTS: u32 = 3;

/// Runtime tuning
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// How often the store is scanned for due jobs
    pub tick_interval: Duration,

    /// Runs later than this are flagged as late
    pub late_threshold: chrono::Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            late_threshold: chrono::Duration::seconds(60),
        }
    }
}

impl RuntimeConfig {
    pub fn from_settings(settings: &SchedulerSettings) -> Self {
        Self {
            tick_interval: Duration::from_millis(settings.tick_interval_ms.max(1)),
            late_threshold: chrono::Duration::seconds(
                i64::try_from(settings.late_threshold_secs).unwrap_or(i64::MAX),
            ),
        }
    }
}

/// What happened to one dispatched job
#[derive(Debug, Clone, PartialEq)]
pub struct JobReport {
    pub job_id: String,
    pub handler: String,
    pub attempt: u32,
    pub status: JobStatus,
    pub detail: Option<String>,
    pub late: bool,
}

/// In-process clock over a job store
///
/// Holds no job state of its own: everything it needs is read from the
/// store on each tick, so a new runtime over the same store picks up where
/// a crashed one stopped.
pub struct SchedulerRuntime {
    store: Arc<dyn JobStore>,
    handlers: Arc<HandlerRegistry>,
    config: RuntimeConfig,
}

impl SchedulerRuntime {
    pub fn new(store: Arc<dyn JobStore>, handlers: HandlerRegistry, config: RuntimeConfig) -> Self {
        Self {
            store,
            handlers: Arc::new(handlers),
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Run every job due at `now` and wait for all of them
    ///
    /// This is one tick of the runtime loop without the loop.
    pub async fn run_due(&self, now: DateTime<Utc>) -> Result<Vec<JobReport>, StoreError> {
        let mut tasks = JoinSet::new();
        self.dispatch_due(now, &mut tasks).await?;

        let mut reports = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => error!("Job task aborted: {}", e),
            }
        }
        Ok(reports)
    }

    /// Start the tick loop
    ///
    /// The loop first returns interrupted jobs to pending, then ticks
    /// immediately and every `tick_interval` after that. Once `shutdown`
    /// fires it stops claiming jobs and waits for the ones in flight.
    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    async fn run(&self, shutdown: CancellationToken) {
        if !self.recover(&shutdown).await {
            return;
        }

        let mut ticker = interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tasks: JoinSet<JobReport> = JoinSet::new();

        info!(
            handlers = ?self.handlers.names(),
            tick = ?self.config.tick_interval,
            "Scheduler runtime started"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    log_report(joined);
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.dispatch_due(Utc::now(), &mut tasks).await {
                        error!("Scan for due jobs failed, retrying next tick: {}", e);
                    }
                }
            }
        }

        if !tasks.is_empty() {
            info!("Waiting for {} running job(s)", tasks.len());
        }
        while let Some(joined) = tasks.join_next().await {
            log_report(joined);
        }
        info!("Scheduler runtime stopped");
    }

    /// Put interrupted jobs back to pending, retrying until the store answers
    async fn recover(&self, shutdown: &CancellationToken) -> bool {
        loop {
            match self.store.recover_interrupted().await {
                Ok(0) => return true,
                Ok(n) => {
                    warn!("Recovered {} job(s) interrupted by a previous run", n);
                    return true;
                }
                Err(e) => {
                    error!("Failed to recover interrupted jobs: {}", e);
                    tokio::select! {
                        _ = shutdown.cancelled() => return false,
                        _ = tokio::time::sleep(self.config.tick_interval) => {}
                    }
                }
            }
        }
    }

    /// Expire misfired jobs, then claim and spawn every due job
    async fn dispatch_due(
        &self,
        now: DateTime<Utc>,
        tasks: &mut JoinSet<JobReport>,
    ) -> Result<usize, StoreError> {
        for job in self.store.expire_misfired(now).await? {
            warn!(
                job_id = %job.id,
                handler = %job.handler,
                run_at = %job.run_at,
                "Job missed its run time: {}",
                job.detail.as_deref().unwrap_or_default()
            );
        }

        let due = self.store.list_due(now).await?;
        let mut dispatched = 0;

        for mut job in due {
            if !self.store.mark_executing(&job.id).await? {
                debug!(job_id = %job.id, "Job no longer pending, skipping");
                continue;
            }
            job.status = JobStatus::Executing;
            job.attempts += 1;

            let invocation = self.invocation(job, now);
            tasks.spawn(execute_job(
                self.store.clone(),
                self.handlers.clone(),
                invocation,
            ));
            dispatched += 1;
        }

        if dispatched > 0 {
            debug!("Dispatched {} job(s)", dispatched);
        }
        Ok(dispatched)
    }

    fn invocation(&self, job: ScheduledJob, now: DateTime<Utc>) -> JobInvocation {
        let lateness = job.lateness(now);
        JobInvocation {
            attempt: job.attempts,
            late: lateness > self.config.late_threshold,
            lateness,
            job,
        }
    }
}

async fn execute_job(
    store: Arc<dyn JobStore>,
    handlers: Arc<HandlerRegistry>,
    invocation: JobInvocation,
) -> JobReport {
    let job = &invocation.job;
    if invocation.late {
        warn!(
            job_id = %job.id,
            lateness_secs = invocation.lateness.num_seconds(),
            "Running job late"
        );
    }
    info!(job_id = %job.id, handler = %job.handler, attempt = invocation.attempt, "Executing job");

    let (status, detail) = match handlers.get(&job.handler) {
        None => (
            JobStatus::Failed,
            Some(format!("no handler registered for '{}'", job.handler)),
        ),
        Some(handler) => match AssertUnwindSafe(handler.handle(&invocation)).catch_unwind().await {
            Ok(Ok(detail)) => (JobStatus::Completed, detail),
            Ok(Err(e)) => (JobStatus::Failed, Some(e.to_string())),
            Err(panic) => (
                JobStatus::Failed,
                Some(format!("handler panicked: {}", panic_message(panic.as_ref()))),
            ),
        },
    };

    record_outcome(store.as_ref(), &job.id, status, detail.clone()).await;

    JobReport {
        job_id: job.id.clone(),
        handler: job.handler.clone(),
        attempt: invocation.attempt,
        status,
        detail,
        late: invocation.late,
    }
}

/// Persist a terminal status, retrying briefly on store errors
///
/// If every attempt fails the job stays executing and is picked up again by
/// the next restart's recovery.
async fn record_outcome(
    store: &dyn JobStore,
    job_id: &str,
    status: JobStatus,
    detail: Option<String>,
) {
    for attempt in 1..=RECORD_ATTEMPTS {
        match store.mark_terminal(job_id, status, detail.clone()).await {
            Ok(()) => return,
            Err(e @ (StoreError::InvalidTransition { .. } | StoreError::NotFound(_))) => {
                warn!(job_id, "Not recording job outcome: {}", e);
                return;
            }
            Err(e) if attempt < RECORD_ATTEMPTS => {
                warn!(job_id, attempt, "Failed to record job outcome, retrying: {}", e);
                tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
            }
            Err(e) => {
                error!(job_id, "Giving up recording job outcome {}: {}", status, e);
            }
        }
    }
}

fn log_report(joined: Result<JobReport, JoinError>) {
    match joined {
        Ok(report) if report.status == JobStatus::Completed => {
            info!(job_id = %report.job_id, handler = %report.handler, "Job completed");
        }
        Ok(report) => {
            warn!(
                job_id = %report.job_id,
                handler = %report.handler,
                "Job failed: {}",
                report.detail.as_deref().unwrap_or_default()
            );
        }
        Err(e) => error!("Job task aborted: {}", e),
    }
}
