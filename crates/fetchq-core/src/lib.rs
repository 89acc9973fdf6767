//! fetchq core - download engine
//!
//! Accepts transfer requests, runs them on a bounded worker pool with
//! retry and backoff, tracks every job through a strict state machine and
//! tells subscribers when jobs finish.
//!
//! [`DownloadService`] wires the pieces together:
//!
//! - [`JobStore`]: submit, cancel, pause, resume and purge jobs
//! - the status tracker: the only writer of job state
//! - [`NotificationDispatcher`]: completion subscribers
//! - [`JobQuery`]: read-only views
//! - the worker pool, fed from a FIFO queue

mod engine;
mod error;
mod notify;
mod query;
mod storage;
mod store;
mod tracker;

pub use engine::{Backoff, ChunkStream, HttpTransport, JobLedger, TransferStream, Transport};
pub use error::FetchError;
pub use notify::{CompletionHandler, NotificationDispatcher, SubscriptionId, TerminalFilter};
pub use query::{JobQuery, StatusCounts};
pub use storage::Storage;
pub use store::JobStore;

pub use fetchq_types::{
    CoreEvent, DownloadJob, FailureReason, JobFilter, JobId, JobOptions, JobStatus,
    NotificationPolicy, PauseReason, Settings,
};

use engine::{part_path, LedgerHandle, PendingQueue, TransferWorker, WorkerPool};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use store::JobTable;
use tracker::StatusTracker;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const EVENT_CAPACITY: usize = 1000;

/// The download service
///
/// Must be created inside a tokio runtime. Call [`DownloadService::shutdown`]
/// before dropping it to let in-flight jobs pause cleanly and to flush the
/// ledger.
pub struct DownloadService {
    settings: Settings,
    store: JobStore,
    dispatcher: NotificationDispatcher,
    query: JobQuery,
    events: broadcast::Sender<CoreEvent>,
    pool: WorkerPool,
    shutdown: CancellationToken,
    ledger: Option<LedgerHandle>,
    ledger_task: Mutex<Option<JoinHandle<()>>>,
}

impl DownloadService {
    /// Start a service that downloads over HTTP(S)
    pub async fn new(settings: Settings) -> Result<Self, FetchError> {
        let transport = Arc::new(HttpTransport::new(&settings)?);
        Self::with_transport(settings, transport).await
    }

    /// Start a service using the settings stored in `data_dir`, with the
    /// job ledger enabled
    pub async fn open(data_dir: PathBuf) -> Result<Self, FetchError> {
        let storage = Storage::new(data_dir).await?;
        let settings = storage.load_settings().await?;
        Self::new(settings).await
    }

    /// Start a service on a custom transport
    pub async fn with_transport(
        settings: Settings,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, FetchError> {
        let table = Arc::new(JobTable::new());
        let queue = Arc::new(PendingQueue::new());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let dispatcher = NotificationDispatcher::new(settings.observer_budget())?;

        let (ledger, ledger_task) = match settings.data_dir {
            Some(ref dir) => {
                let storage = Storage::new(dir.clone()).await?;
                let ledger = JobLedger::open(storage.ledger_path()).await?;
                let restored = table.restore(ledger.load_all().await?);
                if restored > 0 {
                    info!("Restored {} jobs from {}", restored, storage.ledger_path().display());
                }
                let (handle, task) = ledger.spawn_writer();
                (Some(handle), Some(task))
            }
            None => (None, None),
        };

        let tracker = Arc::new(StatusTracker::new(
            table.clone(),
            queue.clone(),
            events.clone(),
            dispatcher.clone(),
            ledger.clone(),
        ));
        let store = JobStore::new(table.clone(), tracker.clone(), queue.clone());
        let query = JobQuery::new(table);

        let shutdown = CancellationToken::new();
        let worker = Arc::new(TransferWorker::new(
            tracker.clone(),
            transport,
            &settings,
            shutdown.clone(),
        ));
        let pool = WorkerPool::start(
            settings.max_concurrent as usize,
            queue,
            worker,
            tracker,
            shutdown.clone(),
        );

        Ok(Self {
            settings,
            store,
            dispatcher,
            query,
            events,
            pool,
            shutdown,
            ledger,
            ledger_task: Mutex::new(ledger_task),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn query(&self) -> &JobQuery {
        &self.query
    }

    pub fn worker_count(&self) -> usize {
        self.pool.size()
    }

    /// Receive progress and status events
    pub fn events(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    // ========================================================================
    // Job control
    // ========================================================================

    pub fn submit(
        &self,
        source_uri: &str,
        destination_path: impl Into<PathBuf>,
        options: JobOptions,
    ) -> Result<JobId, FetchError> {
        self.store.submit(source_uri, destination_path, options)
    }

    pub fn cancel(&self, id: JobId) -> Result<(), FetchError> {
        self.store.cancel(id)
    }

    pub fn pause(&self, id: JobId) -> Result<(), FetchError> {
        self.store.pause(id)
    }

    pub fn resume(&self, id: JobId) -> Result<(), FetchError> {
        self.store.resume(id)
    }

    /// Requeue jobs that were in flight when the service last stopped
    pub fn resume_interrupted(&self) -> Vec<JobId> {
        let interrupted: Vec<JobId> = self
            .query
            .list_jobs(&JobFilter::by_status(JobStatus::Paused))
            .into_iter()
            .filter(|job| job.pause_reason == Some(PauseReason::Interrupted))
            .map(|job| job.id)
            .collect();

        for id in &interrupted {
            if let Err(e) = self.store.resume(*id) {
                debug!("Could not resume job {}: {}", id, e);
            }
        }
        if !interrupted.is_empty() {
            info!("Resumed {} interrupted jobs", interrupted.len());
        }
        interrupted
    }

    /// Remove a job record, and optionally its file and partial data
    pub async fn purge(&self, id: JobId, delete_file: bool) -> Result<DownloadJob, FetchError> {
        let job = self.store.purge(id)?;
        if delete_file {
            remove_if_exists(&job.destination_path).await?;
            remove_if_exists(&part_path(&job.destination_path)).await?;
        }
        Ok(job)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn get_status(&self, id: JobId) -> Result<DownloadJob, FetchError> {
        self.query.get_status(id)
    }

    pub fn list_jobs(&self, filter: &JobFilter) -> Vec<DownloadJob> {
        self.query.list_jobs(filter)
    }

    // ========================================================================
    // Subscribers
    // ========================================================================

    pub fn subscribe<F>(&self, filter: TerminalFilter, handler: F) -> SubscriptionId
    where
        F: Fn(&DownloadJob) + Send + Sync + 'static,
    {
        self.dispatcher.subscribe(filter, Arc::new(handler))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.dispatcher.unsubscribe(id)
    }

    /// Run `handler` for every job that completes successfully
    pub fn on_success<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&DownloadJob) + Send + Sync + 'static,
    {
        self.subscribe(TerminalFilter::Status(JobStatus::Successful), handler)
    }

    /// Wait until a job reaches a terminal state.
    ///
    /// Paused jobs are waited on until they are resumed and finish.
    pub async fn wait(&self, id: JobId) -> Result<DownloadJob, FetchError> {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let subscription = self.subscribe(TerminalFilter::Job(id), move |job: &DownloadJob| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(job.clone());
            }
        });

        let result = match self.query.get_status(id) {
            Ok(job) if job.is_terminal() => Ok(job),
            Ok(_) => rx.await.map_err(|_| FetchError::ServiceStopped),
            Err(e) => Err(e),
        };
        self.dispatcher.unsubscribe(subscription);
        result
    }

    /// Like [`DownloadService::wait`], giving up after `limit`.
    ///
    /// Returns `Ok(None)` when the job is still unfinished, for example
    /// because it was paused and nobody resumed it.
    pub async fn wait_timeout(
        &self,
        id: JobId,
        limit: Duration,
    ) -> Result<Option<DownloadJob>, FetchError> {
        match tokio::time::timeout(limit, self.wait(id)).await {
            Ok(result) => result.map(Some),
            Err(_) => {
                debug!("Job {} unfinished after {:?}", id, limit);
                Ok(None)
            }
        }
    }

    /// Stop the workers and flush the ledger. Jobs in flight are left
    /// paused as interrupted.
    pub async fn shutdown(&self) {
        info!("Shutting down download service");
        self.pool.shutdown().await;
        if let Some(ref ledger) = self.ledger {
            ledger.flush().await;
        }
        if let Some(task) = self.ledger_task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for DownloadService {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn remove_if_exists(path: &Path) -> Result<(), FetchError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!("Removed {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
