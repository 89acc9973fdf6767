//! Read-only views over the job store

use crate::error::FetchError;
use crate::store::JobTable;
use fetchq_types::{DownloadJob, JobFilter, JobId, JobStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Number of jobs in each status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub running: usize,
    pub paused: usize,
    pub successful: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending + self.running + self.paused + self.successful + self.failed
    }

    pub fn get(&self, status: JobStatus) -> usize {
        match status {
            JobStatus::Pending => self.pending,
            JobStatus::Running => self.running,
            JobStatus::Paused => self.paused,
            JobStatus::Successful => self.successful,
            JobStatus::Failed => self.failed,
        }
    }

    fn add(&mut self, status: JobStatus) {
        let slot = match status {
            JobStatus::Pending => &mut self.pending,
            JobStatus::Running => &mut self.running,
            JobStatus::Paused => &mut self.paused,
            JobStatus::Successful => &mut self.successful,
            JobStatus::Failed => &mut self.failed,
        };
        *slot += 1;
    }
}

/// Query handle; cheap to clone and never mutates anything
#[derive(Clone)]
pub struct JobQuery {
    table: Arc<JobTable>,
}

impl JobQuery {
    pub(crate) fn new(table: Arc<JobTable>) -> Self {
        Self { table }
    }

    pub fn get_status(&self, id: JobId) -> Result<DownloadJob, FetchError> {
        self.table.snapshot(id)
    }

    pub fn list_jobs(&self, filter: &JobFilter) -> Vec<DownloadJob> {
        self.table.snapshots(filter)
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for job in self.table.snapshots(&JobFilter::all()) {
            counts.add(job.status);
        }
        counts
    }

    /// Jobs that are not finished yet
    pub fn active(&self) -> Vec<DownloadJob> {
        self.table.snapshots(&JobFilter {
            ids: None,
            statuses: Some(vec![JobStatus::Pending, JobStatus::Running, JobStatus::Paused]),
        })
    }
}
