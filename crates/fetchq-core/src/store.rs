//! Job store - owns every job record
//!
//! Each record sits behind its own lock. The id map is only locked to look
//! up or insert a record handle, so two jobs never contend with each other.

use crate::engine::PendingQueue;
use crate::error::FetchError;
use crate::tracker::StatusTracker;
use fetchq_types::{DownloadJob, FailureReason, JobFilter, JobId, JobOptions, JobStatus, PauseReason};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Mutable state of one job, guarded by the job's own lock
pub(crate) struct JobEntry {
    pub(crate) job: DownloadJob,
    /// A worker currently holds a lease on this job
    pub(crate) held: bool,
    /// Pause asked for while a worker holds the job
    pub(crate) pause_requested: Option<PauseReason>,
    /// Resume asked for while a worker still held the paused job
    pub(crate) requeue_on_release: bool,
    /// The next queue entry for this job may be claimed. Cleared by a claim
    /// or a pause, so stale entries left in the queue are skipped.
    pub(crate) queued: bool,
    pub(crate) cancel: CancellationToken,
}

impl JobEntry {
    fn new(job: DownloadJob, queued: bool) -> Self {
        Self {
            job,
            held: false,
            pause_requested: None,
            requeue_on_release: false,
            queued,
            cancel: CancellationToken::new(),
        }
    }
}

pub(crate) type JobSlot = Arc<Mutex<JobEntry>>;

/// Id allocation and the id -> record map
pub(crate) struct JobTable {
    next_id: AtomicU64,
    jobs: RwLock<BTreeMap<JobId, JobSlot>>,
}

impl JobTable {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            jobs: RwLock::new(BTreeMap::new()),
        }
    }

    pub(crate) fn allocate_id(&self) -> JobId {
        JobId(self.next_id.fetch_add(1, Ordering::AcqRel))
    }

    pub(crate) fn insert(&self, job: DownloadJob, queued: bool) {
        let id = job.id;
        self.jobs.write().insert(id, Arc::new(Mutex::new(JobEntry::new(job, queued))));
    }

    pub(crate) fn slot(&self, id: JobId) -> Result<JobSlot, FetchError> {
        self.jobs.read().get(&id).cloned().ok_or(FetchError::NotFound(id))
    }

    pub(crate) fn snapshot(&self, id: JobId) -> Result<DownloadJob, FetchError> {
        let slot = self.slot(id)?;
        let job = slot.lock().job.clone();
        Ok(job)
    }

    /// Copies of all matching jobs, ordered by id
    pub(crate) fn snapshots(&self, filter: &JobFilter) -> Vec<DownloadJob> {
        let slots: Vec<JobSlot> = {
            let jobs = self.jobs.read();
            match filter.ids {
                Some(ref ids) => ids.iter().filter_map(|id| jobs.get(id).cloned()).collect(),
                None => jobs.values().cloned().collect(),
            }
        };

        let mut out: Vec<DownloadJob> = slots
            .iter()
            .map(|slot| slot.lock().job.clone())
            .filter(|job| filter.matches(job))
            .collect();
        out.sort_by_key(|job| job.id);
        out
    }

    fn remove(&self, id: JobId) -> Option<JobSlot> {
        self.jobs.write().remove(&id)
    }

    /// Load jobs from the ledger. Jobs that were in flight come back paused.
    pub(crate) fn restore(&self, jobs: Vec<DownloadJob>) -> usize {
        let mut restored = 0;
        for mut job in jobs {
            match job.status {
                JobStatus::Pending | JobStatus::Running => {
                    job.status = JobStatus::Paused;
                    job.pause_reason = Some(PauseReason::Interrupted);
                }
                JobStatus::Paused if job.pause_reason == Some(PauseReason::WaitingToRetry) => {
                    job.pause_reason = Some(PauseReason::Interrupted);
                }
                _ => {}
            }
            self.next_id.fetch_max(job.id.0 + 1, Ordering::AcqRel);
            self.insert(job, false);
            restored += 1;
        }
        restored
    }
}

/// Public contract of the job store: submit, inspect and control jobs
pub struct JobStore {
    table: Arc<JobTable>,
    tracker: Arc<StatusTracker>,
    queue: Arc<PendingQueue>,
}

impl JobStore {
    pub(crate) fn new(table: Arc<JobTable>, tracker: Arc<StatusTracker>, queue: Arc<PendingQueue>) -> Self {
        Self { table, tracker, queue }
    }

    /// Validate a request, assign it an id and queue it
    pub fn submit(
        &self,
        source_uri: &str,
        destination_path: impl Into<PathBuf>,
        options: JobOptions,
    ) -> Result<JobId, FetchError> {
        let destination_path = destination_path.into();
        let source_uri = source_uri.trim();

        if source_uri.is_empty() {
            return Err(FetchError::InvalidRequest("source URI is empty".to_string()));
        }
        url::Url::parse(source_uri)
            .map_err(|e| FetchError::InvalidRequest(format!("invalid source URI {}: {}", source_uri, e)))?;
        if destination_path.as_os_str().is_empty() {
            return Err(FetchError::InvalidRequest("destination path is empty".to_string()));
        }

        let id = self.table.allocate_id();
        let job = DownloadJob::new(id, source_uri.to_string(), destination_path, options);
        self.table.insert(job.clone(), true);
        self.tracker.announce(&job);
        self.queue.push(id);

        info!("Submitted job {}: {} -> {}", id, job.source_uri, job.destination_path.display());
        Ok(id)
    }

    pub fn get(&self, id: JobId) -> Result<DownloadJob, FetchError> {
        self.table.snapshot(id)
    }

    pub fn list(&self, filter: &JobFilter) -> Vec<DownloadJob> {
        self.table.snapshots(filter)
    }

    /// Cancel a job. Finished jobs are left alone.
    ///
    /// A job no worker holds fails right away; a held job is signalled and
    /// its worker records the cancellation before it writes again.
    pub fn cancel(&self, id: JobId) -> Result<(), FetchError> {
        let slot = self.table.slot(id)?;
        let mut entry = slot.lock();

        if entry.job.is_terminal() {
            debug!("Cancel of job {} ignored, already {}", id, entry.job.status);
            return Ok(());
        }

        entry.cancel.cancel();
        if entry.held {
            info!("Signalled cancellation for job {}", id);
            return Ok(());
        }

        let bytes = entry.job.bytes_downloaded;
        self.tracker.apply(
            &mut entry,
            JobStatus::Failed,
            bytes,
            Some(FailureReason::Cancelled),
            None,
        )?;
        info!("Cancelled job {}", id);
        Ok(())
    }

    /// Ask for a job to be paused at the next chunk boundary
    pub fn pause(&self, id: JobId) -> Result<(), FetchError> {
        let slot = self.table.slot(id)?;
        let mut entry = slot.lock();

        if entry.job.is_terminal() {
            return Err(FetchError::InvalidOperation(format!(
                "job {} is already {}",
                id, entry.job.status
            )));
        }
        if entry.job.status == JobStatus::Paused && !entry.held {
            if std::mem::take(&mut entry.queued) {
                info!("Withdrew job {} from the queue", id);
            }
            return Ok(());
        }

        entry.pause_requested = Some(PauseReason::PausedByUser);
        entry.requeue_on_release = false;
        info!("Signalled pause for job {}", id);
        Ok(())
    }

    /// Put a paused job back in the queue
    pub fn resume(&self, id: JobId) -> Result<(), FetchError> {
        let slot = self.table.slot(id)?;
        let mut entry = slot.lock();

        if entry.job.is_terminal() {
            return Err(FetchError::InvalidOperation(format!(
                "job {} is already {}",
                id, entry.job.status
            )));
        }

        entry.pause_requested = None;
        if entry.held {
            entry.requeue_on_release = true;
        } else if entry.job.status == JobStatus::Paused {
            if entry.queued {
                debug!("Job {} is already queued", id);
            } else {
                entry.queued = true;
                self.queue.push(id);
                info!("Requeued job {}", id);
            }
        }
        Ok(())
    }

    /// Remove a job for good. Jobs a worker holds must be cancelled first.
    pub fn purge(&self, id: JobId) -> Result<DownloadJob, FetchError> {
        let slot = self.table.slot(id)?;
        let entry = slot.lock();

        if entry.held {
            return Err(FetchError::InvalidOperation(format!(
                "job {} is being transferred, cancel it first",
                id
            )));
        }

        entry.cancel.cancel();
        let job = entry.job.clone();
        self.table.remove(id);
        self.tracker.removed(id);

        info!("Purged job {}", id);
        Ok(job)
    }
}
