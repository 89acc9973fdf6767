//! Status tracker - the only place job state changes
//!
//! Every mutation goes through the transition graph in
//! [`JobStatus::can_transition_to`]. Rejected transitions are logged and
//! leave the record untouched.

use crate::engine::{LedgerHandle, PendingQueue};
use crate::error::FetchError;
use crate::notify::NotificationDispatcher;
use crate::store::{JobEntry, JobSlot, JobTable};
use chrono::Utc;
use fetchq_types::{CoreEvent, DownloadJob, FailureReason, JobId, JobStatus, PauseReason};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Applies status and progress changes and fans them out
pub(crate) struct StatusTracker {
    table: Arc<JobTable>,
    queue: Arc<PendingQueue>,
    events: broadcast::Sender<CoreEvent>,
    dispatcher: NotificationDispatcher,
    ledger: Option<LedgerHandle>,
}

impl StatusTracker {
    pub(crate) fn new(
        table: Arc<JobTable>,
        queue: Arc<PendingQueue>,
        events: broadcast::Sender<CoreEvent>,
        dispatcher: NotificationDispatcher,
        ledger: Option<LedgerHandle>,
    ) -> Self {
        Self {
            table,
            queue,
            events,
            dispatcher,
            ledger,
        }
    }

    /// Move a job to `status` with `bytes` downloaded.
    ///
    /// Only a job held by a worker can be updated. `reason` is recorded when
    /// the new status is `Failed`. Paused jobs set through here are recorded
    /// as paused by the user.
    pub(crate) fn update(
        &self,
        id: JobId,
        bytes: u64,
        status: JobStatus,
        reason: Option<FailureReason>,
    ) -> Result<DownloadJob, FetchError> {
        let slot = self.table.slot(id)?;
        let mut entry = slot.lock();
        if !entry.held {
            warn!("Rejected update for job {}: no worker holds it", id);
            return Err(FetchError::InvalidOperation(format!(
                "job {} is not held by a worker",
                id
            )));
        }
        let pause = (status == JobStatus::Paused).then_some(PauseReason::PausedByUser);
        self.apply(&mut entry, status, bytes, reason, pause)
    }

    /// Validate and apply a transition on a locked record, then publish it
    pub(crate) fn apply(
        &self,
        entry: &mut JobEntry,
        status: JobStatus,
        bytes: u64,
        failure: Option<FailureReason>,
        pause: Option<PauseReason>,
    ) -> Result<DownloadJob, FetchError> {
        let id = entry.job.id;
        let from = entry.job.status;

        let legal = from.can_transition_to(status)
            && (!from.is_cancel_edge(status) || failure == Some(FailureReason::Cancelled));
        if !legal {
            warn!("Rejected transition for job {}: {} -> {}", id, from, status);
            return Err(FetchError::IllegalTransition { id, from, to: status });
        }
        if let Some(total) = entry.job.total_bytes {
            if bytes > total {
                warn!("Rejected progress for job {}: {} of {} bytes", id, bytes, total);
                return Err(FetchError::SizeMismatch {
                    expected: total,
                    actual: bytes,
                });
            }
        }

        let job = &mut entry.job;
        job.status = status;
        job.bytes_downloaded = bytes;
        job.failure_reason = match status {
            JobStatus::Failed => Some(failure.unwrap_or_else(|| FailureReason::Unknown("unspecified".into()))),
            _ => None,
        };
        job.pause_reason = match status {
            JobStatus::Paused => Some(pause.unwrap_or(PauseReason::PausedByUser)),
            _ => None,
        };
        job.last_modified = Utc::now();

        let snapshot = job.clone();
        if from != status {
            self.publish_status(&snapshot);
        }
        Ok(snapshot)
    }

    fn publish_status(&self, job: &DownloadJob) {
        match job.status {
            JobStatus::Failed => info!(
                "Job {} failed: {}",
                job.id,
                job.failure_reason.as_ref().map(|r| r.to_string()).unwrap_or_default()
            ),
            JobStatus::Paused => info!(
                "Job {} paused ({})",
                job.id,
                job.pause_reason.map(|r| r.to_string()).unwrap_or_default()
            ),
            status => info!("Job {} is now {}", job.id, status),
        }

        let _ = self.events.send(CoreEvent::JobStatusChanged {
            id: job.id,
            status: job.status,
            failure_reason: job.failure_reason.clone(),
            pause_reason: job.pause_reason,
        });
        if let Some(ref ledger) = self.ledger {
            ledger.upsert(job);
        }
        if job.is_terminal() {
            self.dispatcher.publish(job);
        }
    }

    /// Record the byte count of a running job, and its total once known
    pub(crate) fn progress(
        &self,
        lease: &JobLease,
        bytes: u64,
        total: Option<u64>,
    ) -> Result<DownloadJob, FetchError> {
        let mut entry = lease.slot.lock();
        let job = &mut entry.job;

        if job.status != JobStatus::Running {
            warn!("Rejected progress for job {} in state {}", job.id, job.status);
            return Err(FetchError::IllegalTransition {
                id: job.id,
                from: job.status,
                to: JobStatus::Running,
            });
        }
        let total = total.or(job.total_bytes);
        if let Some(total) = total {
            if bytes > total {
                return Err(FetchError::SizeMismatch {
                    expected: total,
                    actual: bytes,
                });
            }
        }

        job.total_bytes = total;
        job.bytes_downloaded = bytes;
        job.last_modified = Utc::now();
        Ok(job.clone())
    }

    pub(crate) fn record_retry(&self, lease: &JobLease, attempts: u32) {
        let mut entry = lease.slot.lock();
        entry.job.retry_count = attempts;
    }

    /// Transition the leased job
    pub(crate) fn transition(
        &self,
        lease: &JobLease,
        status: JobStatus,
        failure: Option<FailureReason>,
        pause: Option<PauseReason>,
    ) -> Result<DownloadJob, FetchError> {
        let mut entry = lease.slot.lock();
        let bytes = entry.job.bytes_downloaded;
        self.apply(&mut entry, status, bytes, failure, pause)
    }

    /// Record why a leased job is paused without leaving the state
    pub(crate) fn set_pause_reason(
        &self,
        lease: &JobLease,
        reason: PauseReason,
    ) -> Result<DownloadJob, FetchError> {
        let mut entry = lease.slot.lock();
        let job = &mut entry.job;
        if job.status != JobStatus::Paused {
            return Err(FetchError::IllegalTransition {
                id: job.id,
                from: job.status,
                to: JobStatus::Paused,
            });
        }
        if job.pause_reason == Some(reason) {
            return Ok(job.clone());
        }

        job.pause_reason = Some(reason);
        job.last_modified = Utc::now();
        let snapshot = job.clone();
        self.publish_status(&snapshot);
        Ok(snapshot)
    }

    pub(crate) fn emit_progress(&self, job: &DownloadJob) {
        let _ = self.events.send(CoreEvent::JobProgress {
            id: job.id,
            bytes_downloaded: job.bytes_downloaded,
            total_bytes: job.total_bytes,
        });
    }

    pub(crate) fn announce(&self, job: &DownloadJob) {
        let _ = self.events.send(CoreEvent::JobAdded { job: job.clone() });
        if let Some(ref ledger) = self.ledger {
            ledger.upsert(job);
        }
    }

    pub(crate) fn removed(&self, id: JobId) {
        let _ = self.events.send(CoreEvent::JobRemoved { id });
        if let Some(ref ledger) = self.ledger {
            ledger.delete(id);
        }
    }

    /// Take exclusive hold of a queued job and mark it running.
    ///
    /// Returns `None` when the job is finished, cancelled, already held, or
    /// was paused again after it was queued.
    pub(crate) fn claim(&self, id: JobId) -> Result<Option<JobLease>, FetchError> {
        let slot = self.table.slot(id)?;
        let mut entry = slot.lock();

        if !std::mem::take(&mut entry.queued) {
            return Ok(None);
        }
        if entry.held || entry.job.is_terminal() || entry.cancel.is_cancelled() {
            return Ok(None);
        }
        if !matches!(entry.job.status, JobStatus::Pending | JobStatus::Paused) {
            return Ok(None);
        }

        let bytes = entry.job.bytes_downloaded;
        self.apply(&mut entry, JobStatus::Running, bytes, None, None)?;
        entry.held = true;
        entry.requeue_on_release = false;
        let cancel = entry.cancel.clone();
        drop(entry);

        Ok(Some(JobLease {
            id,
            slot,
            cancel,
            queue: self.queue.clone(),
        }))
    }
}

/// A worker's exclusive hold on a job, released when dropped
pub(crate) struct JobLease {
    id: JobId,
    slot: JobSlot,
    cancel: CancellationToken,
    queue: Arc<PendingQueue>,
}

impl JobLease {
    pub(crate) fn id(&self) -> JobId {
        self.id
    }

    pub(crate) fn snapshot(&self) -> DownloadJob {
        self.slot.lock().job.clone()
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn take_pause_request(&self) -> Option<PauseReason> {
        self.slot.lock().pause_requested.take()
    }
}

impl Drop for JobLease {
    fn drop(&mut self) {
        let mut entry = self.slot.lock();
        entry.held = false;
        let requeue = std::mem::take(&mut entry.requeue_on_release);
        if requeue && entry.job.status == JobStatus::Paused && !entry.queued {
            entry.queued = true;
            self.queue.push(self.id);
        }
    }
}
