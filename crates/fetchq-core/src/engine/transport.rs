//! Transport - where the bytes come from
//!
//! Workers only see a [`Transport`]: open a source at a byte offset and
//! stream its chunks. [`HttpTransport`] is the production implementation.

use crate::error::FetchError;
use async_trait::async_trait;
use bytes::Bytes;
use fetchq_types::Settings;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, info};

pub type ChunkStream = BoxStream<'static, Result<Bytes, FetchError>>;

/// An opened source
pub struct TransferStream {
    /// Byte offset of the first chunk. Zero when the source could not resume.
    pub offset: u64,
    /// Full size of the resource, if the source reported it
    pub total_bytes: Option<u64>,
    pub chunks: ChunkStream,
}

impl TransferStream {
    /// A stream with nothing left to read
    pub fn finished(offset: u64) -> Self {
        Self {
            offset,
            total_bytes: Some(offset),
            chunks: futures::stream::empty().boxed(),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open `uri`, resuming at `offset` if the source allows it
    async fn open(&self, uri: &str, offset: u64) -> Result<TransferStream, FetchError>;
}

/// HTTP(S) transport backed by reqwest
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(settings: &Settings) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(settings.user_agent.clone())
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .build()?;

        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self, uri: &str, offset: u64) -> Result<TransferStream, FetchError> {
        let url = url::Url::parse(uri)
            .map_err(|e| FetchError::InvalidRequest(format!("invalid source URI {}: {}", uri, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(FetchError::UnsupportedSource(uri.to_string()));
        }

        let mut request = self.client.get(url);
        if offset > 0 {
            debug!("Requesting {} from byte {}", uri, offset);
            request = request.header(reqwest::header::RANGE, format!("bytes={}-", offset));
        }

        let response = request.send().await?;
        let status = response.status();
        let content_range = response
            .headers()
            .get(reqwest::header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        // Asking past the end means the previous attempt already got everything
        if status == StatusCode::RANGE_NOT_SATISFIABLE
            && offset > 0
            && content_range.as_deref().and_then(parse_content_range_total) == Some(offset)
        {
            return Ok(TransferStream::finished(offset));
        }

        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
            });
        }

        let resumed = status == StatusCode::PARTIAL_CONTENT;
        let start = if resumed { offset } else { 0 };
        if offset > 0 && !resumed {
            info!("Server ignored range request for {}, restarting from zero", uri);
        }

        let total_bytes = content_range
            .as_deref()
            .and_then(parse_content_range_total)
            .or_else(|| response.content_length().map(|len| start + len));

        let chunks = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(FetchError::from))
            .boxed();

        Ok(TransferStream {
            offset: start,
            total_bytes,
            chunks,
        })
    }
}

/// Total length from a `Content-Range` value such as `bytes 0-99/1234`
pub(crate) fn parse_content_range_total(value: &str) -> Option<u64> {
    let total = value.rsplit('/').next()?.trim();
    if total == "*" {
        return None;
    }
    total.parse().ok()
}
