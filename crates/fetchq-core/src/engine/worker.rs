//! Transfer worker - runs one job's transfer loop
//!
//! Bytes go to `<destination>.part` and the file is renamed into place
//! once the transfer is complete and its size checks out. Cancellation and
//! pause requests are checked before every chunk is written.

use crate::engine::{Backoff, Transport};
use crate::error::FetchError;
use crate::tracker::{JobLease, StatusTracker};
use fetchq_types::{FailureReason, JobStatus, PauseReason, Settings};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Minimum spacing between progress events
const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// Where a job's bytes live until the transfer completes
pub(crate) fn part_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// How a single attempt ended when it did not fail
enum Outcome {
    Completed { bytes: u64 },
    Cancelled,
    Paused(PauseReason),
}

pub(crate) struct TransferWorker {
    tracker: Arc<StatusTracker>,
    transport: Arc<dyn Transport>,
    backoff: Backoff,
    retry_limit: u32,
    chunk_size: usize,
    read_timeout: Duration,
    shutdown: CancellationToken,
}

impl TransferWorker {
    pub(crate) fn new(
        tracker: Arc<StatusTracker>,
        transport: Arc<dyn Transport>,
        settings: &Settings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            tracker,
            transport,
            backoff: Backoff::from_settings(settings),
            retry_limit: settings.retry_limit.max(1),
            chunk_size: settings.chunk_size.max(1),
            read_timeout: Duration::from_secs(settings.read_timeout_secs.max(1)),
            shutdown,
        }
    }

    /// Drive a leased job until it finishes, pauses or is cancelled.
    /// The lease is released when this returns.
    pub(crate) async fn run(&self, lease: JobLease) {
        let id = lease.id();
        if let Err(e) = self.drive(&lease).await {
            warn!("Job {} stopped without a final status: {}", id, e);
        }
    }

    async fn drive(&self, lease: &JobLease) -> Result<(), FetchError> {
        let mut failures = 0u32;

        loop {
            match self.attempt(lease).await {
                Ok(Outcome::Completed { bytes }) => {
                    self.tracker
                        .update(lease.id(), bytes, JobStatus::Successful, None)?;
                    info!("Job {} completed ({} bytes)", lease.id(), bytes);
                    return Ok(());
                }
                Ok(Outcome::Cancelled) => return self.finish_cancelled(lease),
                Ok(Outcome::Paused(reason)) => {
                    self.tracker
                        .transition(lease, JobStatus::Paused, None, Some(reason))?;
                    return Ok(());
                }
                Err(e) if e.is_retryable() => {
                    failures += 1;
                    self.tracker.record_retry(lease, failures);

                    if failures >= self.retry_limit {
                        warn!("Job {} failed {} times, giving up: {}", lease.id(), failures, e);
                        self.tracker.update(
                            lease.id(),
                            lease.snapshot().bytes_downloaded,
                            JobStatus::Failed,
                            Some(FailureReason::RetriesExhausted {
                                attempts: failures,
                                last_error: e.to_string(),
                            }),
                        )?;
                        return Ok(());
                    }

                    let delay = self.backoff.delay(failures);
                    warn!(
                        "Job {} attempt {}/{} failed: {}. Retrying in {:?}",
                        lease.id(),
                        failures,
                        self.retry_limit,
                        e,
                        delay
                    );
                    self.tracker.transition(
                        lease,
                        JobStatus::Paused,
                        None,
                        Some(PauseReason::WaitingToRetry),
                    )?;

                    tokio::select! {
                        biased;
                        _ = lease.cancel_token().cancelled() => return self.finish_cancelled(lease),
                        _ = self.shutdown.cancelled() => {
                            self.tracker.set_pause_reason(lease, PauseReason::Interrupted)?;
                            debug!("Job {} interrupted while waiting to retry", lease.id());
                            return Ok(());
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }

                    if let Some(reason) = lease.take_pause_request() {
                        self.tracker.set_pause_reason(lease, reason)?;
                        return Ok(());
                    }
                    self.tracker.transition(lease, JobStatus::Running, None, None)?;
                }
                Err(e) => {
                    warn!("Job {} failed: {}", lease.id(), e);
                    self.tracker.update(
                        lease.id(),
                        lease.snapshot().bytes_downloaded,
                        JobStatus::Failed,
                        Some(e.failure_reason()),
                    )?;
                    return Ok(());
                }
            }
        }
    }

    fn finish_cancelled(&self, lease: &JobLease) -> Result<(), FetchError> {
        self.tracker
            .transition(lease, JobStatus::Failed, Some(FailureReason::Cancelled), None)?;
        info!("Job {} cancelled", lease.id());
        Ok(())
    }

    /// Stop reasons observed between chunks, most urgent first
    fn interruption(&self, lease: &JobLease) -> Option<Outcome> {
        if lease.is_cancelled() {
            return Some(Outcome::Cancelled);
        }
        if self.shutdown.is_cancelled() {
            return Some(Outcome::Paused(PauseReason::Interrupted));
        }
        lease.take_pause_request().map(Outcome::Paused)
    }

    /// One pass over the source, resuming from the recorded offset
    async fn attempt(&self, lease: &JobLease) -> Result<Outcome, FetchError> {
        if let Some(outcome) = self.interruption(lease) {
            return Ok(outcome);
        }

        let job = lease.snapshot();
        let part = part_path(&job.destination_path);
        if let Some(parent) = part.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&part)
            .await?;
        let on_disk = file.metadata().await?.len();
        let requested = on_disk.min(job.bytes_downloaded);

        let stream = tokio::select! {
            biased;
            _ = lease.cancel_token().cancelled() => return Ok(Outcome::Cancelled),
            _ = self.shutdown.cancelled() => return Ok(Outcome::Paused(PauseReason::Interrupted)),
            opened = self.transport.open(&job.source_uri, requested) => opened?,
        };

        let mut written = stream.offset;
        if written != requested {
            debug!("Job {} restarting at byte {} instead of {}", job.id, written, requested);
        }
        file.set_len(written).await?;
        file.seek(std::io::SeekFrom::Start(written)).await?;

        let total = stream.total_bytes;
        let snapshot = self.tracker.progress(lease, written, total)?;
        self.tracker.emit_progress(&snapshot);

        let mut chunks = stream.chunks;
        let mut last_emit = Instant::now();

        loop {
            let next = tokio::select! {
                biased;
                _ = lease.cancel_token().cancelled() => {
                    file.flush().await?;
                    return Ok(Outcome::Cancelled);
                }
                _ = self.shutdown.cancelled() => {
                    file.flush().await?;
                    return Ok(Outcome::Paused(PauseReason::Interrupted));
                }
                next = tokio::time::timeout(self.read_timeout, chunks.next()) => next,
            };
            let buffer = match next {
                Ok(Some(Ok(buffer))) => buffer,
                Ok(Some(Err(e))) => {
                    file.flush().await?;
                    return Err(e);
                }
                Ok(None) => break,
                Err(_) => {
                    file.flush().await?;
                    return Err(FetchError::TransientIo(format!(
                        "no data for {:?}",
                        self.read_timeout
                    )));
                }
            };

            for piece in buffer.chunks(self.chunk_size) {
                if let Some(outcome) = self.interruption(lease) {
                    file.flush().await?;
                    return Ok(outcome);
                }

                let after = written + piece.len() as u64;
                if let Some(total) = total {
                    if after > total {
                        return Err(FetchError::SizeMismatch {
                            expected: total,
                            actual: after,
                        });
                    }
                }

                file.write_all(piece)
                    .await
                    .map_err(|e| FetchError::TransientIo(format!("write to {} failed: {}", part.display(), e)))?;
                written = after;

                let snapshot = self.tracker.progress(lease, written, None)?;
                if last_emit.elapsed() >= PROGRESS_INTERVAL {
                    self.tracker.emit_progress(&snapshot);
                    last_emit = Instant::now();
                }
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if let Some(total) = total {
            if written < total {
                return Err(FetchError::TransientIo(format!(
                    "stream ended at {} of {} bytes",
                    written, total
                )));
            }
        }

        if lease.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }

        fs::rename(&part, &job.destination_path).await?;
        self.tracker.emit_progress(&lease.snapshot());
        Ok(Outcome::Completed { bytes: written })
    }
}
