//! SQLite job ledger
//!
//! Every status change is written through a background writer task so the
//! callers that publish transitions never wait on the database. Jobs are
//! read back once, when the service opens.

use crate::error::FetchError;
use chrono::{DateTime, Utc};
use fetchq_types::{DownloadJob, JobId};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqliteRow};
use sqlx::Row;
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Persistent record of every job the service knows about
#[derive(Clone, Debug)]
pub struct JobLedger {
    pool: SqlitePool,
}

impl JobLedger {
    /// Open (or create) the ledger at `db_path`
    pub async fn open<P: AsRef<Path>>(db_path: P) -> Result<Self, FetchError> {
        let path = db_path.as_ref();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY,
                source_uri TEXT NOT NULL,
                destination TEXT NOT NULL,
                visible_in_ui INTEGER NOT NULL DEFAULT 1,
                notification_policy TEXT NOT NULL,
                status TEXT NOT NULL,
                bytes_downloaded INTEGER NOT NULL DEFAULT 0,
                total_bytes INTEGER,
                failure_reason TEXT,
                pause_reason TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                last_modified TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            "#,
        )
        .execute(&pool)
        .await?;

        debug!("Opened job ledger at {}", path.display());
        Ok(Self { pool })
    }

    /// Save or replace a job record
    pub async fn upsert(&self, job: &DownloadJob) -> Result<(), FetchError> {
        let failure_reason = job
            .failure_reason
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let pause_reason = job.pause_reason.map(|r| serde_json::to_string(&r)).transpose()?;

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, source_uri, destination, visible_in_ui, notification_policy,
                status, bytes_downloaded, total_bytes, failure_reason, pause_reason,
                retry_count, created_at, last_modified
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                bytes_downloaded = excluded.bytes_downloaded,
                total_bytes = excluded.total_bytes,
                failure_reason = excluded.failure_reason,
                pause_reason = excluded.pause_reason,
                retry_count = excluded.retry_count,
                last_modified = excluded.last_modified
            "#,
        )
        .bind(job.id.0 as i64)
        .bind(&job.source_uri)
        .bind(job.destination_path.to_string_lossy().to_string())
        .bind(if job.visible_in_ui { 1i64 } else { 0i64 })
        .bind(serde_json::to_string(&job.notification_policy)?)
        .bind(job.status.as_str())
        .bind(job.bytes_downloaded as i64)
        .bind(job.total_bytes.map(|t| t as i64))
        .bind(failure_reason)
        .bind(pause_reason)
        .bind(job.retry_count as i64)
        .bind(job.created_at.to_rfc3339())
        .bind(job.last_modified.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn delete(&self, id: JobId) -> Result<(), FetchError> {
        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id.0 as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Every stored job, oldest id first
    pub async fn load_all(&self) -> Result<Vec<DownloadJob>, FetchError> {
        let rows = sqlx::query("SELECT * FROM jobs ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(row_to_job).collect()
    }

    /// Start the writer task. Records are written in the order they were sent.
    pub(crate) fn spawn_writer(self) -> (LedgerHandle, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<LedgerOp>();

        let task = tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                match op {
                    LedgerOp::Upsert(job) => {
                        if let Err(e) = self.upsert(&job).await {
                            warn!("Failed to persist job {}: {}", job.id, e);
                        }
                    }
                    LedgerOp::Delete(id) => {
                        if let Err(e) = self.delete(id).await {
                            warn!("Failed to delete job {} from ledger: {}", id, e);
                        }
                    }
                    LedgerOp::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("Ledger writer stopped");
        });

        (LedgerHandle { tx }, task)
    }
}

enum LedgerOp {
    Upsert(Box<DownloadJob>),
    Delete(JobId),
    Flush(oneshot::Sender<()>),
}

/// Non-blocking sender side of the ledger writer
#[derive(Clone)]
pub(crate) struct LedgerHandle {
    tx: mpsc::UnboundedSender<LedgerOp>,
}

impl LedgerHandle {
    pub(crate) fn upsert(&self, job: &DownloadJob) {
        if self.tx.send(LedgerOp::Upsert(Box::new(job.clone()))).is_err() {
            warn!("Ledger writer is gone; job {} not persisted", job.id);
        }
    }

    pub(crate) fn delete(&self, id: JobId) {
        if self.tx.send(LedgerOp::Delete(id)).is_err() {
            warn!("Ledger writer is gone; job {} not removed", id);
        }
    }

    /// Wait until everything sent so far has been written
    pub(crate) async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(LedgerOp::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }
}

fn row_to_job(row: SqliteRow) -> Result<DownloadJob, FetchError> {
    let status: String = row.get("status");
    let policy: String = row.get("notification_policy");
    let failure_reason: Option<String> = row.get("failure_reason");
    let pause_reason: Option<String> = row.get("pause_reason");
    let created_at: String = row.get("created_at");
    let last_modified: String = row.get("last_modified");

    Ok(DownloadJob {
        id: JobId(row.get::<i64, _>("id") as u64),
        source_uri: row.get("source_uri"),
        destination_path: PathBuf::from(row.get::<String, _>("destination")),
        visible_in_ui: row.get::<i64, _>("visible_in_ui") != 0,
        notification_policy: serde_json::from_str(&policy)?,
        status: status.parse().map_err(FetchError::Serialization)?,
        bytes_downloaded: row.get::<i64, _>("bytes_downloaded") as u64,
        total_bytes: row.get::<Option<i64>, _>("total_bytes").map(|t| t as u64),
        created_at: parse_time(&created_at)?,
        last_modified: parse_time(&last_modified)?,
        failure_reason: failure_reason.as_deref().map(serde_json::from_str).transpose()?,
        pause_reason: pause_reason.as_deref().map(serde_json::from_str).transpose()?,
        retry_count: row.get::<i64, _>("retry_count") as u32,
    })
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, FetchError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| FetchError::Serialization(format!("bad timestamp {}: {}", value, e)))
}
