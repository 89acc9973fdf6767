//! Shared helpers for the service integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use fetchq_core::{
    DownloadJob, DownloadService, FetchError, JobId, Settings, TransferStream, Transport,
};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One scripted source
#[derive(Clone, Default)]
pub struct Source {
    pub body: Vec<u8>,
    /// Size of each buffer the stream yields
    pub chunk: usize,
    /// Pause before each buffer
    pub delay: Duration,
    /// Opens that fail with HTTP 503 before the source starts working
    pub failures: u32,
    /// Opens that deliver only half the remaining body and then end
    pub short_reads: u32,
    /// Opens that deliver half the remaining body and then fail mid-stream
    pub broken_streams: u32,
}

impl Source {
    pub fn new(body: Vec<u8>, chunk: usize) -> Self {
        Self {
            body,
            chunk,
            ..Self::default()
        }
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self, failures: u32) -> Self {
        self.failures = failures;
        self
    }

    pub fn short_reads(mut self, count: u32) -> Self {
        self.short_reads = count;
        self
    }

    pub fn broken_streams(mut self, count: u32) -> Self {
        self.broken_streams = count;
        self
    }
}

/// In-memory transport serving scripted sources by URI
#[derive(Default)]
pub struct ScriptedTransport {
    sources: Mutex<HashMap<String, Source>>,
    opens: Mutex<Vec<(String, u64)>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve(&self, uri: &str, source: Source) {
        self.sources.lock().insert(uri.to_string(), source);
    }

    /// Offsets `uri` was opened at, in order
    pub fn opens_of(&self, uri: &str) -> Vec<u64> {
        self.opens
            .lock()
            .iter()
            .filter(|(u, _)| u == uri)
            .map(|(_, offset)| *offset)
            .collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&self, uri: &str, offset: u64) -> Result<TransferStream, FetchError> {
        self.opens.lock().push((uri.to_string(), offset));

        let mut sources = self.sources.lock();
        let source = sources
            .get_mut(uri)
            .ok_or_else(|| FetchError::UnsupportedSource(uri.to_string()))?;

        if source.failures > 0 {
            source.failures -= 1;
            return Err(FetchError::HttpStatus { status: 503 });
        }

        let total = source.body.len() as u64;
        let offset = offset.min(total);
        let mut remaining = &source.body[offset as usize..];
        let mut broken = false;
        if source.short_reads > 0 {
            source.short_reads -= 1;
            remaining = &remaining[..remaining.len() / 2];
        } else if source.broken_streams > 0 {
            source.broken_streams -= 1;
            remaining = &remaining[..remaining.len() / 2];
            broken = true;
        }

        let mut pieces: Vec<Result<Bytes, FetchError>> = remaining
            .chunks(source.chunk.max(1))
            .map(|piece| Ok(Bytes::copy_from_slice(piece)))
            .collect();
        if broken {
            pieces.push(Err(FetchError::TransientIo("connection reset".to_string())));
        }
        let delay = source.delay;
        let chunks = futures::stream::iter(pieces)
            .then(move |piece| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                piece
            })
            .boxed();

        Ok(TransferStream {
            offset,
            total_bytes: Some(total),
            chunks,
        })
    }
}

/// Settings tuned for fast tests
pub fn test_settings(max_concurrent: u32) -> Settings {
    Settings {
        max_concurrent,
        retry_limit: 3,
        retry_base_delay_ms: 5,
        retry_max_delay_ms: 20,
        chunk_size: 512,
        ..Settings::default()
    }
}

pub async fn service(settings: Settings, transport: Arc<ScriptedTransport>) -> DownloadService {
    DownloadService::with_transport(settings, transport)
        .await
        .unwrap()
}

/// Deterministic body of `len` bytes
pub fn body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Wait for a terminal state, failing the test after five seconds
pub async fn finish(service: &DownloadService, id: JobId) -> DownloadJob {
    tokio::time::timeout(Duration::from_secs(5), service.wait(id))
        .await
        .expect("job did not finish in time")
        .unwrap()
}

/// Poll until `check` holds for the job, failing the test after five seconds
pub async fn wait_until<F>(service: &DownloadService, id: JobId, check: F) -> DownloadJob
where
    F: Fn(&DownloadJob) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let job = service.get_status(id).unwrap();
        if check(&job) {
            return job;
        }
        assert!(Instant::now() < deadline, "job {} never reached the expected state", id);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn file_len(path: &Path) -> Option<u64> {
    std::fs::metadata(path).ok().map(|m| m.len())
}
