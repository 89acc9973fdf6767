//! Completion observers
//!
//! Subscribers register a filter and a handler. When a job reaches a
//! terminal state the matching handlers are resolved right away and handed
//! to a dedicated delivery thread, so a slow or panicking handler never
//! stalls a transfer.

use crate::error::FetchError;
use fetchq_types::{DownloadJob, JobId, JobStatus};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Handle returned by [`NotificationDispatcher::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

pub type CompletionHandler = Arc<dyn Fn(&DownloadJob) + Send + Sync>;

/// Which terminal jobs a subscriber wants to hear about
#[derive(Clone)]
pub enum TerminalFilter {
    Job(JobId),
    Status(JobStatus),
    AnyTerminal,
    Custom(Arc<dyn Fn(&DownloadJob) -> bool + Send + Sync>),
}

impl TerminalFilter {
    pub fn matches(&self, job: &DownloadJob) -> bool {
        match self {
            TerminalFilter::Job(id) => job.id == *id,
            TerminalFilter::Status(status) => job.status == *status,
            TerminalFilter::AnyTerminal => true,
            TerminalFilter::Custom(predicate) => predicate(job),
        }
    }
}

impl fmt::Debug for TerminalFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminalFilter::Job(id) => f.debug_tuple("Job").field(id).finish(),
            TerminalFilter::Status(status) => f.debug_tuple("Status").field(status).finish(),
            TerminalFilter::AnyTerminal => f.write_str("AnyTerminal"),
            TerminalFilter::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

struct Subscriber {
    filter: TerminalFilter,
    handler: CompletionHandler,
}

struct Delivery {
    job: DownloadJob,
    handlers: Vec<(SubscriptionId, CompletionHandler)>,
}

struct Inner {
    next_id: AtomicU64,
    subscribers: RwLock<HashMap<SubscriptionId, Subscriber>>,
    tx: mpsc::UnboundedSender<Delivery>,
}

/// Fans terminal jobs out to subscribers
#[derive(Clone)]
pub struct NotificationDispatcher {
    inner: Arc<Inner>,
}

impl NotificationDispatcher {
    /// Start the delivery thread. Handlers running longer than `budget`
    /// are reported.
    pub fn new(budget: Duration) -> Result<Self, FetchError> {
        let (tx, rx) = mpsc::unbounded_channel();

        std::thread::Builder::new()
            .name("fetchq-notify".to_string())
            .spawn(move || deliver_loop(rx, budget))?;

        Ok(Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(1),
                subscribers: RwLock::new(HashMap::new()),
                tx,
            }),
        })
    }

    pub fn subscribe(&self, filter: TerminalFilter, handler: CompletionHandler) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        debug!("Registered subscriber {} for {:?}", id, filter);
        self.inner
            .subscribers
            .write()
            .insert(id, Subscriber { filter, handler });
        id
    }

    /// Returns false if `id` was not subscribed
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.inner.subscribers.write().remove(&id).is_some();
        if removed {
            debug!("Removed subscriber {}", id);
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    /// Queue `job` for every subscriber whose filter matches it now.
    /// Returns how many handlers were queued.
    pub(crate) fn publish(&self, job: &DownloadJob) -> usize {
        let handlers: Vec<(SubscriptionId, CompletionHandler)> = self
            .inner
            .subscribers
            .read()
            .iter()
            .filter(|(_, sub)| sub.filter.matches(job))
            .map(|(id, sub)| (*id, sub.handler.clone()))
            .collect();

        let count = handlers.len();
        if count == 0 {
            return 0;
        }

        let delivery = Delivery {
            job: job.clone(),
            handlers,
        };
        if self.inner.tx.send(delivery).is_err() {
            error!("Notification thread is gone; job {} not delivered", job.id);
            return 0;
        }
        count
    }
}

fn deliver_loop(mut rx: mpsc::UnboundedReceiver<Delivery>, budget: Duration) {
    while let Some(delivery) = rx.blocking_recv() {
        for (id, handler) in delivery.handlers {
            let started = Instant::now();
            let job = &delivery.job;

            if catch_unwind(AssertUnwindSafe(|| handler(job))).is_err() {
                error!("Subscriber {} panicked while handling job {}", id, job.id);
                continue;
            }

            let elapsed = started.elapsed();
            if elapsed > budget {
                warn!(
                    "Subscriber {} took {:?} for job {} (budget {:?})",
                    id, elapsed, job.id, budget
                );
            }
        }
    }
    debug!("Notification thread stopped");
}
