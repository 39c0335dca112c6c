//! SQLite-based job store

use crate::persistence::{
    check_terminal_target, format_timestamp, JobStatus, JobStore, NewJob, ScheduledJob, StoreError,
};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

const SELECT_COLUMNS: &str = "SELECT id, handler, payload, run_at, status, misfire_grace_secs, \
     attempts, detail, created_at, updated_at FROM scheduled_jobs";

/// SQLite job store
///
/// Once `enqueue` returns the row is committed, so the job survives a crash
/// of the process.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Open (or create) a store at `path`
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        info!("Opened job store at {}", path.display());
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// Create a store that lives only as long as this value
    pub async fn in_memory() -> Result<Self, StoreError> {
        // A single connection that is never recycled: every new in-memory
        // connection is a new, empty database
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// Create store with default path
    pub async fn with_default_path() -> Result<Self, StoreError> {
        Self::open(default_path()).await
    }

    /// Close the connection pool, flushing the WAL
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Initialize database schema
    async fn init(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scheduled_jobs (
                id TEXT PRIMARY KEY,
                handler TEXT NOT NULL,
                payload TEXT NOT NULL,
                run_at TEXT NOT NULL,
                status TEXT NOT NULL,
                misfire_grace_secs INTEGER,
                attempts INTEGER NOT NULL DEFAULT 0,
                detail TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_scheduled_jobs_status_run_at ON scheduled_jobs(status, run_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fetch_where(
        &self,
        clause: &str,
        binds: &[&str],
    ) -> Result<Vec<ScheduledJob>, StoreError> {
        let sql = format!("{} {} ORDER BY run_at ASC, id ASC", SELECT_COLUMNS, clause);
        let mut query = sqlx::query(&sql);
        for value in binds {
            query = query.bind(*value);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_job).collect()
    }
}

/// Default database location under the user's data directory
pub fn default_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("campaign-pipeline")
        .join("jobs.db")
}

fn parse_time(id: &str, column: &str, text: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            id: id.to_string(),
            reason: format!("bad {} '{}': {}", column, text, e),
        })
}

fn parse_count<T: TryFrom<i64>>(id: &str, column: &str, value: i64) -> Result<T, StoreError> {
    T::try_from(value).map_err(|_| StoreError::Corrupt {
        id: id.to_string(),
        reason: format!("bad {} {}", column, value),
    })
}

fn row_to_job(row: &SqliteRow) -> Result<ScheduledJob, StoreError> {
    let id: String = row.try_get("id")?;

    let status_text: String = row.try_get("status")?;
    let status = JobStatus::from_str(&status_text).map_err(|reason| StoreError::Corrupt {
        id: id.clone(),
        reason,
    })?;

    let payload_text: String = row.try_get("payload")?;
    let payload = serde_json::from_str(&payload_text).map_err(|e| StoreError::Corrupt {
        id: id.clone(),
        reason: format!("bad payload: {}", e),
    })?;

    let grace: Option<i64> = row.try_get("misfire_grace_secs")?;
    let attempts: i64 = row.try_get("attempts")?;

    Ok(ScheduledJob {
        handler: row.try_get("handler")?,
        payload,
        run_at: parse_time(&id, "run_at", &row.try_get::<String, _>("run_at")?)?,
        status,
        misfire_grace_secs: grace
            .map(|g| parse_count(&id, "misfire_grace_secs", g))
            .transpose()?,
        attempts: parse_count(&id, "attempts", attempts)?,
        detail: row.try_get("detail")?,
        created_at: parse_time(&id, "created_at", &row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_time(&id, "updated_at", &row.try_get::<String, _>("updated_at")?)?,
        id,
    })
}

#[async_trait::async_trait]
impl JobStore for SqliteJobStore {
    async fn enqueue(&self, job: NewJob) -> Result<String, StoreError> {
        let job = job.into_job(Utc::now());
        let payload = serde_json::to_string(&job.payload)?;

        sqlx::query(
            r#"
            INSERT INTO scheduled_jobs
            (id, handler, payload, run_at, status, misfire_grace_secs, attempts, detail, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, NULL, ?7, ?8)
            "#,
        )
        .bind(&job.id)
        .bind(&job.handler)
        .bind(payload)
        .bind(format_timestamp(job.run_at))
        .bind(job.status.as_str())
        .bind(job.misfire_grace_secs.map(|g| i64::try_from(g).unwrap_or(i64::MAX)))
        .bind(format_timestamp(job.created_at))
        .bind(format_timestamp(job.updated_at))
        .execute(&self.pool)
        .await?;

        debug!(job_id = %job.id, handler = %job.handler, run_at = %job.run_at, "Job enqueued");
        Ok(job.id)
    }

    async fn get(&self, id: &str) -> Result<Option<ScheduledJob>, StoreError> {
        let sql = format!("{} WHERE id = ?1", SELECT_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn cancel(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE scheduled_jobs SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
        )
        .bind(JobStatus::Cancelled.as_str())
        .bind(format_timestamp(Utc::now()))
        .bind(id)
        .bind(JobStatus::Pending.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>, StoreError> {
        let now_text = format_timestamp(now);
        let candidates = self
            .fetch_where(
                "WHERE status = ?1 AND run_at <= ?2",
                &[JobStatus::Pending.as_str(), &now_text],
            )
            .await?;
        Ok(candidates.into_iter().filter(|j| j.within_grace(now)).collect())
    }

    async fn mark_executing(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET status = ?1, attempts = attempts + 1, updated_at = ?2
            WHERE id = ?3 AND status = ?4
            "#,
        )
        .bind(JobStatus::Executing.as_str())
        .bind(format_timestamp(Utc::now()))
        .bind(id)
        .bind(JobStatus::Pending.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_terminal(
        &self,
        id: &str,
        status: JobStatus,
        detail: Option<String>,
    ) -> Result<(), StoreError> {
        check_terminal_target(id, status)?;

        let result = sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET status = ?1, detail = ?2, updated_at = ?3
            WHERE id = ?4 AND status = ?5
            "#,
        )
        .bind(status.as_str())
        .bind(detail)
        .bind(format_timestamp(Utc::now()))
        .bind(id)
        .bind(JobStatus::Executing.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        match self.get(id).await? {
            None => Err(StoreError::NotFound(id.to_string())),
            Some(job) => Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from: job.status,
                to: status,
            }),
        }
    }

    async fn expire_misfired(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>, StoreError> {
        let now_text = format_timestamp(now);
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "{} WHERE status = ?1 AND run_at <= ?2 AND misfire_grace_secs IS NOT NULL \
             ORDER BY run_at ASC, id ASC",
            SELECT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(JobStatus::Pending.as_str())
            .bind(&now_text)
            .fetch_all(&mut *tx)
            .await?;

        let mut expired = Vec::new();
        for row in &rows {
            let mut job = row_to_job(row)?;
            if !job.is_misfired(now) {
                continue;
            }

            let detail = job.misfire_detail(now);
            let result = sqlx::query(
                r#"
                UPDATE scheduled_jobs
                SET status = ?1, detail = ?2, updated_at = ?3
                WHERE id = ?4 AND status = ?5
                "#,
            )
            .bind(JobStatus::Failed.as_str())
            .bind(&detail)
            .bind(&now_text)
            .bind(&job.id)
            .bind(JobStatus::Pending.as_str())
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 1 {
                job.status = JobStatus::Failed;
                job.detail = Some(detail);
                job.updated_at = now;
                expired.push(job);
            }
        }

        tx.commit().await?;
        Ok(expired)
    }

    async fn recover_interrupted(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE scheduled_jobs SET status = ?1, updated_at = ?2 WHERE status = ?3",
        )
        .bind(JobStatus::Pending.as_str())
        .bind(format_timestamp(Utc::now()))
        .bind(JobStatus::Executing.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn list(&self, status: Option<JobStatus>) -> Result<Vec<ScheduledJob>, StoreError> {
        match status {
            Some(status) => self.fetch_where("WHERE status = ?1", &[status.as_str()]).await,
            None => self.fetch_where("", &[]).await,
        }
    }
}
