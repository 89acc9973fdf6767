//! Transfer engine
//!
//! This module owns the transfer lifecycle:
//! - Fixed pool of worker tasks fed by a FIFO queue
//! - Chunked transfers with cooperative cancel/pause
//! - Exponential backoff for transient failures
//! - Optional SQLite job ledger

mod backoff;
mod persistence;
mod scheduler;
mod transport;
mod worker;

pub use backoff::Backoff;
pub use persistence::JobLedger;
pub(crate) use persistence::LedgerHandle;
pub(crate) use scheduler::{PendingQueue, WorkerPool};
pub use transport::{ChunkStream, HttpTransport, TransferStream, Transport};
pub(crate) use worker::{part_path, TransferWorker};
