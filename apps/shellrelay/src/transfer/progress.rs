//! Progress events for uploads.

use std::sync::Arc;
use std::time::Duration;

use super::chunk::ChunkRange;

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Started {
        file_name: String,
        total_bytes: u64,
        chunks: u64,
    },
    /// A chunk was accepted by the server.
    Chunk {
        range: ChunkRange,
        total_bytes: u64,
        percent: u8,
    },
    /// The server asked for the same chunk again.
    Retrying {
        range: ChunkRange,
        attempt: u32,
        status: u16,
    },
    Completed {
        bytes: u64,
        elapsed: Duration,
    },
    Failed {
        error: String,
    },
}

/// Receives progress events. Invoked synchronously from the upload loop.
pub trait ProgressCallback: Send + Sync {
    fn on_progress(&self, event: ProgressEvent);
}

pub struct NoOpCallback;

impl ProgressCallback for NoOpCallback {
    fn on_progress(&self, _event: ProgressEvent) {}
}

pub struct FnCallback<F>
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    f: F,
}

impl<F> FnCallback<F>
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> ProgressCallback for FnCallback<F>
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn on_progress(&self, event: ProgressEvent) {
        (self.f)(event)
    }
}

pub fn callback<F>(f: F) -> Arc<dyn ProgressCallback>
where
    F: Fn(ProgressEvent) + Send + Sync + 'static,
{
    Arc::new(FnCallback::new(f))
}
