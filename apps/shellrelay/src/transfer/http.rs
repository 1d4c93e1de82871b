use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE;
use bytes::Bytes;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_RANGE, CONTENT_TYPE};
use std::collections::BTreeSet;
use std::time::Duration;
use thiserror::Error;
use tracing::trace;

use super::chunk::ChunkRange;
use super::{PayloadEncoding, TransferError, UploadTarget};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChunkTransportError {
    /// The server wants the same chunk again.
    #[error("server asked to retry (status {status})")]
    Retryable { status: u16 },
    #[error("upload rejected: {message}")]
    Fatal {
        status: Option<u16>,
        message: String,
    },
}

impl ChunkTransportError {
    fn network(err: reqwest::Error) -> Self {
        ChunkTransportError::Fatal {
            status: err.status().map(|status| status.as_u16()),
            message: err.to_string(),
        }
    }
}

/// Sorts a response status into accepted, retry, or fatal.
pub fn classify(status: StatusCode, retryable: &BTreeSet<u16>) -> Result<(), ChunkTransportError> {
    if retryable.contains(&status.as_u16()) {
        return Err(ChunkTransportError::Retryable {
            status: status.as_u16(),
        });
    }
    if status.is_success() {
        return Ok(());
    }
    Err(status_error(status))
}

fn status_error(status: StatusCode) -> ChunkTransportError {
    ChunkTransportError::Fatal {
        status: Some(status.as_u16()),
        message: format!(
            "{}: {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or("Unknown Status")
        ),
    }
}

#[async_trait]
pub trait UploadBackend: Send + Sync {
    async fn send_chunk(
        &self,
        target: &UploadTarget,
        range: ChunkRange,
        total: u64,
        body: Bytes,
    ) -> Result<(), ChunkTransportError>;

    /// Tells the server the file is complete.
    async fn finalize(&self, target: &UploadTarget) -> Result<(), ChunkTransportError>;
}

pub struct ReqwestUploadBackend {
    client: reqwest::Client,
    payload: PayloadEncoding,
    retryable: BTreeSet<u16>,
}

impl ReqwestUploadBackend {
    pub fn new(
        payload: PayloadEncoding,
        retryable: BTreeSet<u16>,
    ) -> Result<Self, TransferError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .no_proxy()
            .build()?;
        Ok(Self {
            client,
            payload,
            retryable,
        })
    }
}

pub fn encode_body(payload: PayloadEncoding, body: Bytes) -> (Bytes, &'static str) {
    match payload {
        PayloadEncoding::Base64 => (Bytes::from(URL_SAFE.encode(&body)), "text/plain"),
        PayloadEncoding::Raw => (body, "application/octet-stream"),
    }
}

#[async_trait]
impl UploadBackend for ReqwestUploadBackend {
    async fn send_chunk(
        &self,
        target: &UploadTarget,
        range: ChunkRange,
        total: u64,
        body: Bytes,
    ) -> Result<(), ChunkTransportError> {
        let (body, content_type) = encode_body(self.payload, body);
        trace!(
            target: "shellrelay::upload",
            start = range.start,
            end = range.end,
            wire_bytes = body.len(),
            "posting chunk"
        );
        let response = self
            .client
            .post(target.url().clone())
            .header(CONTENT_RANGE, range.content_range(total))
            .header(CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await
            .map_err(ChunkTransportError::network)?;
        classify(response.status(), &self.retryable)
    }

    async fn finalize(&self, target: &UploadTarget) -> Result<(), ChunkTransportError> {
        let response = self
            .client
            .delete(target.url().clone())
            .send()
            .await
            .map_err(ChunkTransportError::network)?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(status_error(status))
        }
    }
}
