//! Worker pool - a fixed set of worker tasks pulling from a FIFO queue
//!
//! Each worker takes the oldest queued job, claims it, and runs its transfer
//! to completion before asking for the next one.

use crate::engine::TransferWorker;
use crate::error::FetchError;
use crate::tracker::StatusTracker;
use fetchq_types::JobId;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Ids waiting for a worker, oldest first
pub(crate) struct PendingQueue {
    ids: Mutex<VecDeque<JobId>>,
    notify: Notify,
}

impl PendingQueue {
    pub(crate) fn new() -> Self {
        Self {
            ids: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    pub(crate) fn push(&self, id: JobId) {
        self.ids.lock().push_back(id);
        self.notify.notify_one();
    }

    pub(crate) fn try_pop(&self) -> Option<JobId> {
        self.ids.lock().pop_front()
    }

    /// Wait for the next id
    pub(crate) async fn pop(&self) -> JobId {
        loop {
            if let Some(id) = self.try_pop() {
                return id;
            }
            self.notify.notified().await;
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.ids.lock().len()
    }
}

/// Handle to the running worker tasks
pub(crate) struct WorkerPool {
    handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
    size: usize,
}

impl WorkerPool {
    /// Spawn `size` workers (at least one)
    pub(crate) fn start(
        size: usize,
        queue: Arc<PendingQueue>,
        worker: Arc<TransferWorker>,
        tracker: Arc<StatusTracker>,
        shutdown: CancellationToken,
    ) -> Self {
        let size = size.max(1);
        info!("Starting worker pool with {} workers", size);

        let handles = (0..size)
            .map(|index| {
                tokio::spawn(worker_loop(
                    index,
                    queue.clone(),
                    worker.clone(),
                    tracker.clone(),
                    shutdown.clone(),
                ))
            })
            .collect();

        Self {
            handles: Mutex::new(handles),
            shutdown,
            size,
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    /// Stop all workers. In-flight transfers pause at their next chunk.
    pub(crate) async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Worker task ended abnormally: {}", e);
            }
        }
        info!("Worker pool stopped");
    }
}

async fn worker_loop(
    index: usize,
    queue: Arc<PendingQueue>,
    worker: Arc<TransferWorker>,
    tracker: Arc<StatusTracker>,
    shutdown: CancellationToken,
) {
    loop {
        let id = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            id = queue.pop() => id,
        };

        let lease = match tracker.claim(id) {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                debug!("Worker {} skipped job {}", index, id);
                continue;
            }
            Err(FetchError::NotFound(_)) => {
                debug!("Worker {} skipped purged job {}", index, id);
                continue;
            }
            Err(e) => {
                warn!("Worker {} could not claim job {}: {}", index, id, e);
                continue;
            }
        };

        info!("Worker {} picked up job {} ({} still queued)", index, id, queue.len());
        worker.run(lease).await;
    }
    debug!("Worker {} stopped", index);
}
