//! Shared types for fetchq
//!
//! This crate contains the data structures shared by the core engine
//! and the CLI: job snapshots, status codes, events and settings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================================
// Job Types
// ============================================================================

/// Identifier of a download job, unique for the lifetime of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().trim_start_matches('#').parse().map(JobId)
    }
}

/// A snapshot of a single download job
///
/// Snapshots are plain copies; mutating one has no effect on the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadJob {
    pub id: JobId,
    pub source_uri: String,
    pub destination_path: PathBuf,
    pub visible_in_ui: bool,
    pub notification_policy: NotificationPolicy,
    pub status: JobStatus,
    pub bytes_downloaded: u64,
    pub total_bytes: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub failure_reason: Option<FailureReason>,
    pub pause_reason: Option<PauseReason>,
    /// Number of transient failures seen by the current transfer
    #[serde(default)]
    pub retry_count: u32,
}

impl DownloadJob {
    pub fn new(id: JobId, source_uri: String, destination_path: PathBuf, options: JobOptions) -> Self {
        let now = Utc::now();
        Self {
            id,
            source_uri,
            destination_path,
            visible_in_ui: options.visible_in_ui,
            notification_policy: options.notification_policy,
            status: JobStatus::Pending,
            bytes_downloaded: 0,
            total_bytes: None,
            created_at: now,
            last_modified: now,
            failure_reason: None,
            pause_reason: None,
            retry_count: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Where the finished file lives
    pub fn local_path(&self) -> &Path {
        &self.destination_path
    }

    /// Display name derived from the destination
    pub fn file_name(&self) -> String {
        self.destination_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.source_uri.clone())
    }

    pub fn progress(&self) -> f64 {
        match self.total_bytes {
            Some(total) if total > 0 => (self.bytes_downloaded as f64 / total as f64) * 100.0,
            _ => 0.0,
        }
    }

    pub fn was_cancelled(&self) -> bool {
        matches!(self.failure_reason, Some(FailureReason::Cancelled))
    }
}

/// Status of a download job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Successful,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Paused,
        JobStatus::Successful,
        JobStatus::Failed,
    ];

    /// Successful and Failed are final
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Successful | JobStatus::Failed)
    }

    /// Whether a job in `self` may move to `next`.
    ///
    /// `Running -> Running` is a progress update. `Pending -> Failed` and
    /// `Paused -> Failed` exist only for cancellation.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Running)
                | (Running, Successful)
                | (Running, Failed)
                | (Running, Paused)
                | (Paused, Running)
                | (Pending, Failed)
                | (Paused, Failed)
        )
    }

    /// Edges that are only legal when the job is being cancelled
    pub fn is_cancel_edge(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Failed) | (JobStatus::Paused, JobStatus::Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Successful => "successful",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" | "downloading" => Ok(JobStatus::Running),
            "paused" => Ok(JobStatus::Paused),
            "successful" | "completed" | "done" => Ok(JobStatus::Successful),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("Invalid status: {}", other)),
        }
    }
}

/// Why a job ended in `Failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    Cancelled,
    RetriesExhausted { attempts: u32, last_error: String },
    HttpStatus(u16),
    TooManyRedirects,
    SizeMismatch { expected: u64, actual: u64 },
    UnsupportedSource(String),
    FileError(String),
    Unknown(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Cancelled => f.write_str("cancelled"),
            FailureReason::RetriesExhausted { attempts, last_error } => {
                write!(f, "gave up after {} attempts: {}", attempts, last_error)
            }
            FailureReason::HttpStatus(code) => write!(f, "unhandled HTTP status {}", code),
            FailureReason::TooManyRedirects => f.write_str("too many redirects"),
            FailureReason::SizeMismatch { expected, actual } => {
                write!(f, "size mismatch: expected {} bytes, got {}", expected, actual)
            }
            FailureReason::UnsupportedSource(uri) => write!(f, "unsupported source: {}", uri),
            FailureReason::FileError(msg) => write!(f, "file error: {}", msg),
            FailureReason::Unknown(msg) => write!(f, "{}", msg),
        }
    }
}

/// Why a job sits in `Paused`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    /// Backing off after a transient failure
    WaitingToRetry,
    PausedByUser,
    /// The service stopped while the job was in flight
    Interrupted,
}

impl fmt::Display for PauseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PauseReason::WaitingToRetry => f.write_str("waiting to retry"),
            PauseReason::PausedByUser => f.write_str("paused by user"),
            PauseReason::Interrupted => f.write_str("interrupted"),
        }
    }
}

/// Whether a notification is shown while and after downloading.
///
/// Stored and reported back only; the core never shows anything itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPolicy {
    #[default]
    Visible,
    VisibleNotifyCompleted,
    VisibleNotifyOnlyCompletion,
    Hidden,
}

impl std::str::FromStr for NotificationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "visible" => Ok(NotificationPolicy::Visible),
            "visible_notify_completed" => Ok(NotificationPolicy::VisibleNotifyCompleted),
            "visible_notify_only_completion" | "completion" => {
                Ok(NotificationPolicy::VisibleNotifyOnlyCompletion)
            }
            "hidden" => Ok(NotificationPolicy::Hidden),
            other => Err(format!("Invalid notification policy: {}", other)),
        }
    }
}

/// Options attached to a submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOptions {
    pub visible_in_ui: bool,
    pub notification_policy: NotificationPolicy,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            visible_in_ui: true,
            notification_policy: NotificationPolicy::Visible,
        }
    }
}

/// Selects jobs for listing; an empty filter matches everything
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFilter {
    pub ids: Option<Vec<JobId>>,
    pub statuses: Option<Vec<JobStatus>>,
}

impl JobFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_id(id: JobId) -> Self {
        Self {
            ids: Some(vec![id]),
            statuses: None,
        }
    }

    pub fn by_status(status: JobStatus) -> Self {
        Self {
            ids: None,
            statuses: Some(vec![status]),
        }
    }

    pub fn matches(&self, job: &DownloadJob) -> bool {
        if let Some(ref ids) = self.ids {
            if !ids.contains(&job.id) {
                return false;
            }
        }
        if let Some(ref statuses) = self.statuses {
            if !statuses.contains(&job.status) {
                return false;
            }
        }
        true
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Events emitted by the core to UIs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    JobAdded {
        job: DownloadJob,
    },
    JobProgress {
        id: JobId,
        bytes_downloaded: u64,
        total_bytes: Option<u64>,
    },
    JobStatusChanged {
        id: JobId,
        status: JobStatus,
        failure_reason: Option<FailureReason>,
        pause_reason: Option<PauseReason>,
    },
    JobRemoved {
        id: JobId,
    },
}

// ============================================================================
// Settings Types
// ============================================================================

/// Service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Number of worker tasks, and so the number of parallel transfers
    pub max_concurrent: u32,
    /// A job fails on this many transient failures
    pub retry_limit: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Largest piece written between cancellation checks
    pub chunk_size: usize,
    /// Observers taking longer than this are reported
    pub observer_budget_ms: u64,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub user_agent: String,
    /// Enables the job ledger when set
    pub data_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            retry_limit: 3,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 30_000,
            chunk_size: 64 * 1024,
            observer_budget_ms: 100,
            connect_timeout_secs: 30,
            read_timeout_secs: 120,
            user_agent: format!("fetchq/{}", env!("CARGO_PKG_VERSION")),
            data_dir: None,
        }
    }
}

impl Settings {
    /// Platform data directory used when none is configured
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|d| d.join("fetchq"))
            .unwrap_or_else(|| PathBuf::from(".fetchq"))
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    pub fn observer_budget(&self) -> Duration {
        Duration::from_millis(self.observer_budget_ms)
    }
}
