use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeSet;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

use super::chunk::{ChunkPlanner, ChunkRange};
use super::http::{ChunkTransportError, UploadBackend};
use super::progress::{NoOpCallback, ProgressCallback, ProgressEvent};
use super::{PayloadEncoding, TransferError, UploadGate, UploadTarget};
use crate::config::{DEFAULT_CHUNK_SIZE, DEFAULT_RETRY_DELAY_MS, DEFAULT_RETRYABLE_STATUS};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferConfig {
    pub chunk_size: u64,
    pub retryable_statuses: BTreeSet<u16>,
    pub retry_delay: Duration,
    /// Attempts per chunk before giving up; `None` retries forever.
    pub max_attempts: Option<u32>,
    pub payload: PayloadEncoding,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            retryable_statuses: BTreeSet::from([DEFAULT_RETRYABLE_STATUS]),
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            max_attempts: None,
            payload: PayloadEncoding::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Idle,
    InFlight,
    Retrying,
    Complete,
    Failed,
}

/// Random-access byte source for an upload.
#[async_trait]
pub trait ChunkSource: Send {
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn read_range(&mut self, range: ChunkRange) -> std::io::Result<Bytes>;
}

pub struct FileSource {
    file: File,
    len: u64,
}

impl FileSource {
    pub async fn open(path: &Path) -> std::io::Result<Self> {
        let file = File::open(path).await?;
        let len = file.metadata().await?.len();
        Ok(Self { file, len })
    }
}

#[async_trait]
impl ChunkSource for FileSource {
    fn len(&self) -> u64 {
        self.len
    }

    async fn read_range(&mut self, range: ChunkRange) -> std::io::Result<Bytes> {
        let len = usize::try_from(range.len()).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "chunk too large")
        })?;
        let mut buf = vec![0u8; len];
        self.file.seek(SeekFrom::Start(range.start)).await?;
        self.file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

#[derive(Debug, Clone)]
pub struct MemorySource(pub Bytes);

#[async_trait]
impl ChunkSource for MemorySource {
    fn len(&self) -> u64 {
        self.0.len() as u64
    }

    async fn read_range(&mut self, range: ChunkRange) -> std::io::Result<Bytes> {
        let start = range.start as usize;
        let end = range.end as usize;
        if end > self.0.len() || start > end {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("range {range} outside {} bytes", self.0.len()),
            ));
        }
        Ok(self.0.slice(start..end))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub file_name: String,
    pub bytes: u64,
    pub chunks: u64,
    pub retries: u64,
    /// Whether the server acknowledged the closing `DELETE`. All chunks were
    /// accepted either way.
    pub finalized: bool,
    pub elapsed: Duration,
}

/// Runs one upload at a time: each chunk is sent and resolved before the
/// next is planned, retryable statuses resend the same range, and the last
/// chunk is followed by exactly one finalize.
pub struct TransferController {
    backend: Arc<dyn UploadBackend>,
    config: TransferConfig,
    progress: Arc<dyn ProgressCallback>,
    gate: UploadGate,
    status: TransferStatus,
    offset: u64,
}

impl TransferController {
    pub fn new(backend: Arc<dyn UploadBackend>, config: TransferConfig) -> Self {
        Self {
            backend,
            config,
            progress: Arc::new(NoOpCallback),
            gate: UploadGate::new(),
            status: TransferStatus::Idle,
            offset: 0,
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    /// Shares the one-upload slot with other controllers.
    pub fn with_gate(mut self, gate: UploadGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn status(&self) -> TransferStatus {
        self.status
    }

    /// Bytes acknowledged by the server so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub async fn upload(
        &mut self,
        target: &UploadTarget,
        source: &mut dyn ChunkSource,
    ) -> Result<TransferReport, TransferError> {
        let _permit = self.gate.try_enter()?;
        let planner = ChunkPlanner::new(source.len(), self.config.chunk_size)?;
        let total = planner.total();
        let started = Instant::now();

        self.status = TransferStatus::InFlight;
        self.offset = 0;
        info!(
            target: "shellrelay::upload",
            file = %target.file_name(),
            total,
            chunk_size = planner.chunk_size(),
            "starting upload"
        );
        self.progress.on_progress(ProgressEvent::Started {
            file_name: target.file_name().to_string(),
            total_bytes: total,
            chunks: planner.chunk_count(),
        });

        let mut chunks = 0;
        let mut retries = 0;
        let mut range = planner.first();
        loop {
            let body = match source.read_range(range).await {
                Ok(body) => body,
                Err(err) => return Err(self.fail(err.into())),
            };
            retries += self.send_until_accepted(target, range, total, body).await?;

            chunks += 1;
            self.offset = range.end;
            let percent = planner.percent_after(range);
            debug!(
                target: "shellrelay::upload",
                start = range.start,
                end = range.end,
                percent,
                "chunk accepted"
            );
            self.progress.on_progress(ProgressEvent::Chunk {
                range,
                total_bytes: total,
                percent,
            });

            match planner.after(range) {
                Some(next) => range = next,
                None => break,
            }
        }

        self.status = TransferStatus::Complete;
        let finalized = match self.backend.finalize(target).await {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    target: "shellrelay::upload",
                    file = %target.file_name(),
                    error = %err,
                    "finalize not acknowledged"
                );
                false
            }
        };
        let elapsed = started.elapsed();
        info!(
            target: "shellrelay::upload",
            file = %target.file_name(),
            bytes = total,
            chunks,
            retries,
            finalized,
            elapsed_ms = elapsed.as_millis() as u64,
            "upload complete"
        );
        self.progress.on_progress(ProgressEvent::Completed {
            bytes: total,
            elapsed,
        });
        Ok(TransferReport {
            file_name: target.file_name().to_string(),
            bytes: total,
            chunks,
            retries,
            finalized,
            elapsed,
        })
    }

    /// Sends one range until the server accepts it. Returns how many retries
    /// it took.
    async fn send_until_accepted(
        &mut self,
        target: &UploadTarget,
        range: ChunkRange,
        total: u64,
        body: Bytes,
    ) -> Result<u64, TransferError> {
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            match self
                .backend
                .send_chunk(target, range, total, body.clone())
                .await
            {
                Ok(()) => {
                    self.status = TransferStatus::InFlight;
                    return Ok(u64::from(attempt - 1));
                }
                Err(ChunkTransportError::Retryable { status }) => {
                    if self.config.max_attempts.is_some_and(|max| attempt >= max) {
                        return Err(self.fail(TransferError::RetriesExhausted {
                            start: range.start,
                            end: range.end,
                            attempts: attempt,
                            status,
                        }));
                    }
                    self.status = TransferStatus::Retrying;
                    warn!(
                        target: "shellrelay::upload",
                        start = range.start,
                        end = range.end,
                        status,
                        attempt,
                        "server asked for chunk again"
                    );
                    self.progress.on_progress(ProgressEvent::Retrying {
                        range,
                        attempt,
                        status,
                    });
                    tokio::time::sleep(self.config.retry_delay).await;
                    self.status = TransferStatus::InFlight;
                }
                Err(err) => return Err(self.fail(err.into())),
            }
        }
    }

    fn fail(&mut self, err: TransferError) -> TransferError {
        self.status = TransferStatus::Failed;
        warn!(
            target: "shellrelay::upload",
            offset = self.offset,
            error = %err,
            "upload failed"
        );
        self.progress.on_progress(ProgressEvent::Failed {
            error: err.to_string(),
        });
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionDescriptor;
    use crate::transfer::progress::callback;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use url::Url;

    #[derive(Default)]
    struct ScriptedBackend {
        replies: Mutex<VecDeque<Result<(), ChunkTransportError>>>,
        calls: Mutex<Vec<(ChunkRange, Bytes)>>,
        finalize_reply: Mutex<Option<ChunkTransportError>>,
        finalizes: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        latency: Duration,
    }

    impl ScriptedBackend {
        fn scripted(replies: Vec<Result<(), ChunkTransportError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                ..Self::default()
            }
        }

        fn ranges(&self) -> Vec<ChunkRange> {
            self.calls.lock().unwrap().iter().map(|(r, _)| *r).collect()
        }
    }

    #[async_trait]
    impl UploadBackend for ScriptedBackend {
        async fn send_chunk(
            &self,
            _target: &UploadTarget,
            range: ChunkRange,
            _total: u64,
            body: Bytes,
        ) -> Result<(), ChunkTransportError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.calls.lock().unwrap().push((range, body));
            if !self.latency.is_zero() {
                let jitter = Duration::from_millis(range.start % 3);
                tokio::time::sleep(self.latency + jitter).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.replies.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }

        async fn finalize(&self, _target: &UploadTarget) -> Result<(), ChunkTransportError> {
            self.finalizes.fetch_add(1, Ordering::SeqCst);
            match self.finalize_reply.lock().unwrap().take() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }

    fn target() -> UploadTarget {
        let base = Url::parse("http://127.0.0.1:8888/").unwrap();
        UploadTarget::new(&base, &SessionDescriptor::new("7", None), "data.bin").unwrap()
    }

    fn config(chunk_size: u64) -> TransferConfig {
        TransferConfig {
            chunk_size,
            retry_delay: Duration::from_millis(1),
            ..TransferConfig::default()
        }
    }

    fn recorder() -> (Arc<dyn ProgressCallback>, Arc<Mutex<Vec<ProgressEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        (callback(move |event| sink.lock().unwrap().push(event)), events)
    }

    fn percents(events: &[ProgressEvent]) -> Vec<u8> {
        events
            .iter()
            .filter_map(|event| match event {
                ProgressEvent::Chunk { percent, .. } => Some(*percent),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn uploads_in_order_and_finalizes_once() {
        let backend = Arc::new(ScriptedBackend::default());
        let (progress, events) = recorder();
        let mut controller = TransferController::new(backend.clone(), config(2_097_152))
            .with_progress(progress);
        let data = Bytes::from(vec![7u8; 5_000_000]);

        let report = controller
            .upload(&target(), &mut MemorySource(data))
            .await
            .unwrap();

        assert_eq!(
            backend.ranges(),
            vec![
                ChunkRange { start: 0, end: 2_097_152 },
                ChunkRange { start: 2_097_152, end: 4_194_304 },
                ChunkRange { start: 4_194_304, end: 5_000_000 },
            ]
        );
        assert_eq!(backend.calls.lock().unwrap()[2].1.len(), 805_696);
        assert_eq!(backend.finalizes.load(Ordering::SeqCst), 1);
        assert!(report.finalized);
        assert_eq!(percents(&events.lock().unwrap()), vec![41, 83, 100]);
        assert!(matches!(
            events.lock().unwrap().last(),
            Some(ProgressEvent::Completed { bytes: 5_000_000, .. })
        ));
        assert_eq!(report.chunks, 3);
        assert_eq!(report.retries, 0);
        assert_eq!(controller.status(), TransferStatus::Complete);
        assert_eq!(controller.offset(), 5_000_000);
    }

    #[tokio::test]
    async fn retryable_status_resends_identical_range() {
        let backend = Arc::new(ScriptedBackend::scripted(vec![
            Ok(()),
            Err(ChunkTransportError::Retryable { status: 555 }),
            Err(ChunkTransportError::Retryable { status: 555 }),
            Err(ChunkTransportError::Retryable { status: 555 }),
            Ok(()),
        ]));
        let (progress, events) = recorder();
        let mut controller =
            TransferController::new(backend.clone(), config(4)).with_progress(progress);

        let report = controller
            .upload(&target(), &mut MemorySource(Bytes::from_static(b"abcdefghij")))
            .await
            .unwrap();

        let calls = backend.calls.lock().unwrap().clone();
        let ranges: Vec<_> = calls.iter().map(|(r, _)| (r.start, r.end)).collect();
        assert_eq!(ranges, vec![(0, 4), (4, 8), (4, 8), (4, 8), (4, 8), (8, 10)]);
        assert!(calls[1..5].iter().all(|(_, body)| &body[..] == b"efgh"));
        assert_eq!(report.retries, 3);
        assert_eq!(backend.finalizes.load(Ordering::SeqCst), 1);

        let retry_attempts: Vec<u32> = events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                ProgressEvent::Retrying { attempt, .. } => Some(*attempt),
                _ => None,
            })
            .collect();
        assert_eq!(retry_attempts, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn fatal_status_stops_without_finalizing() {
        let backend = Arc::new(ScriptedBackend::scripted(vec![
            Ok(()),
            Err(ChunkTransportError::Fatal {
                status: Some(500),
                message: "500: Internal Server Error".into(),
            }),
        ]));
        let (progress, events) = recorder();
        let mut controller =
            TransferController::new(backend.clone(), config(4)).with_progress(progress);

        let err = controller
            .upload(&target(), &mut MemorySource(Bytes::from_static(b"abcdefghij")))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            TransferError::Chunk(ChunkTransportError::Fatal { status: Some(500), .. })
        ));
        assert_eq!(backend.ranges().len(), 2);
        assert_eq!(backend.finalizes.load(Ordering::SeqCst), 0);
        assert_eq!(controller.status(), TransferStatus::Failed);
        assert_eq!(controller.offset(), 4);
        assert!(matches!(
            events.lock().unwrap().last(),
            Some(ProgressEvent::Failed { .. })
        ));
    }

    #[tokio::test]
    async fn max_attempts_turns_retries_into_failure() {
        let backend = Arc::new(ScriptedBackend::scripted(vec![
            Err(ChunkTransportError::Retryable { status: 555 }),
            Err(ChunkTransportError::Retryable { status: 555 }),
            Err(ChunkTransportError::Retryable { status: 555 }),
        ]));
        let mut controller = TransferController::new(
            backend.clone(),
            TransferConfig {
                max_attempts: Some(3),
                ..config(4)
            },
        );

        let err = controller
            .upload(&target(), &mut MemorySource(Bytes::from_static(b"abcdefghij")))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            TransferError::RetriesExhausted { start: 0, end: 4, attempts: 3, status: 555 }
        ));
        assert_eq!(backend.ranges().len(), 3);
        assert_eq!(backend.finalizes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn chunks_never_overlap_under_latency() {
        let backend = Arc::new(ScriptedBackend {
            latency: Duration::from_millis(2),
            ..ScriptedBackend::scripted(vec![
                Ok(()),
                Err(ChunkTransportError::Retryable { status: 555 }),
                Ok(()),
            ])
        });
        let mut controller = TransferController::new(backend.clone(), config(3));

        controller
            .upload(&target(), &mut MemorySource(Bytes::from(vec![1u8; 20])))
            .await
            .unwrap();

        assert_eq!(backend.max_in_flight.load(Ordering::SeqCst), 1);
        let ranges = backend.ranges();
        for pair in ranges.windows(2) {
            assert!(pair[1].start == pair[0].end || pair[1] == pair[0]);
        }
        assert_eq!(ranges.last().map(|r| r.end), Some(20));
    }

    #[tokio::test]
    async fn unacknowledged_finalize_still_completes() {
        let backend = Arc::new(ScriptedBackend::default());
        *backend.finalize_reply.lock().unwrap() = Some(ChunkTransportError::Fatal {
            status: Some(405),
            message: "405: Method Not Allowed".into(),
        });
        let (progress, events) = recorder();
        let mut controller =
            TransferController::new(backend.clone(), config(4)).with_progress(progress);

        let report = controller
            .upload(&target(), &mut MemorySource(Bytes::from_static(b"abcdef")))
            .await
            .unwrap();

        assert!(!report.finalized);
        assert_eq!(report.bytes, 6);
        assert_eq!(controller.status(), TransferStatus::Complete);
        assert_eq!(backend.finalizes.load(Ordering::SeqCst), 1);
        assert!(matches!(
            events.lock().unwrap().last(),
            Some(ProgressEvent::Completed { bytes: 6, .. })
        ));
    }

    #[tokio::test]
    async fn empty_file_sends_one_empty_chunk() {
        let backend = Arc::new(ScriptedBackend::default());
        let (progress, events) = recorder();
        let mut controller =
            TransferController::new(backend.clone(), config(1024)).with_progress(progress);

        controller
            .upload(&target(), &mut MemorySource(Bytes::new()))
            .await
            .unwrap();

        assert_eq!(backend.ranges(), vec![ChunkRange { start: 0, end: 0 }]);
        assert_eq!(percents(&events.lock().unwrap()), vec![100]);
        assert_eq!(backend.finalizes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn overlapping_upload_is_rejected() {
        let backend = Arc::new(ScriptedBackend {
            latency: Duration::from_millis(20),
            ..ScriptedBackend::default()
        });
        let gate = UploadGate::new();
        let mut first =
            TransferController::new(backend.clone(), config(4)).with_gate(gate.clone());
        let mut second = TransferController::new(backend.clone(), config(4)).with_gate(gate);

        let first_target = target();
        let second_target = target();
        let mut first_source = MemorySource(Bytes::from_static(b"abcdefgh"));
        let mut second_source = MemorySource(Bytes::from_static(b"xyz"));

        let (first_result, second_result) = tokio::join!(
            first.upload(&first_target, &mut first_source),
            async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                second.upload(&second_target, &mut second_source).await
            }
        );

        assert!(first_result.is_ok());
        assert!(matches!(second_result, Err(TransferError::Busy)));
        assert_eq!(second.status(), TransferStatus::Idle);
        assert_eq!(backend.finalizes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn file_source_reads_requested_ranges() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"0123456789").unwrap();
        let mut source = FileSource::open(file.path()).await.unwrap();

        assert_eq!(source.len(), 10);
        let chunk = source
            .read_range(ChunkRange { start: 4, end: 7 })
            .await
            .unwrap();
        assert_eq!(&chunk[..], b"456");
        assert!(source
            .read_range(ChunkRange { start: 8, end: 12 })
            .await
            .is_err());
    }
}
