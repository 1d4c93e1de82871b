//! Chunked file upload to the relay host, plus the download URL.
//!
//! Uploads are strictly sequential: the controller awaits each chunk's
//! outcome before planning the next, retries retryable statuses on the same
//! byte range, and finishes with a single `DELETE` to the upload URL.

pub mod chunk;
pub mod controller;
pub mod download;
pub mod http;
pub mod progress;

use clap::ValueEnum;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use url::Url;

use crate::session::SessionDescriptor;

pub use chunk::{ChunkPlanner, ChunkRange};
pub use controller::{TransferConfig, TransferController, TransferReport, TransferStatus};
pub use http::{ChunkTransportError, ReqwestUploadBackend, UploadBackend};
pub use progress::{NoOpCallback, ProgressCallback, ProgressEvent, callback};

/// How chunk bytes are put on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    /// URL-safe base64 text, which is what the relay server decodes.
    #[default]
    Base64,
    Raw,
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Chunk(#[from] ChunkTransportError),
    #[error("gave up on bytes {start}..{end} after {attempts} attempts (last status {status})")]
    RetriesExhausted {
        start: u64,
        end: u64,
        attempts: u32,
        status: u16,
    },
    #[error("another upload is already in progress")]
    Busy,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("chunk size must be positive")]
    InvalidChunkSize,
    #[error("invalid transfer url: {0}")]
    InvalidUrl(String),
    #[error("remote file not found: {0}")]
    NotFound(String),
    #[error("download rejected with status {status}")]
    DownloadRejected { status: u16 },
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// The upload endpoint for one file on one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    url: Url,
    file_name: String,
}

impl UploadTarget {
    pub fn new(
        base: &Url,
        descriptor: &SessionDescriptor,
        file_name: &str,
    ) -> Result<Self, TransferError> {
        let file_name = file_name.trim();
        if file_name.is_empty() || file_name.contains('/') {
            return Err(TransferError::InvalidUrl(format!(
                "'{file_name}' is not a plain file name"
            )));
        }
        let mut url = base
            .join("upload")
            .map_err(|err| TransferError::InvalidUrl(err.to_string()))?;
        url.set_query(None);
        url.query_pairs_mut()
            .append_pair("minion", descriptor.id())
            .append_pair("file", file_name);
        Ok(Self {
            url,
            file_name: file_name.to_string(),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }
}

/// Admits one upload at a time. Cloned handles share the same slot.
#[derive(Debug, Clone)]
pub struct UploadGate {
    slot: Arc<Semaphore>,
}

impl Default for UploadGate {
    fn default() -> Self {
        Self {
            slot: Arc::new(Semaphore::new(1)),
        }
    }
}

impl UploadGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the slot without waiting; the returned permit frees it on drop.
    pub fn try_enter(&self) -> Result<OwnedSemaphorePermit, TransferError> {
        self.slot
            .clone()
            .try_acquire_owned()
            .map_err(|_| TransferError::Busy)
    }

    pub fn is_busy(&self) -> bool {
        self.slot.available_permits() == 0
    }
}
