use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::debug;

use crate::{UploadError, UploadEvent, UploadId};

const EVENT_CAPACITY: usize = 1024;

/// Event broadcaster plus counters shared by every upload of one uploader
#[derive(Clone)]
pub struct ObservabilityLayer {
    event_broadcaster: broadcast::Sender<UploadEvent>,
    stats: Arc<UploadStats>,
}

impl ObservabilityLayer {
    pub fn new() -> Self {
        let (event_broadcaster, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            event_broadcaster,
            stats: Arc::new(UploadStats::new()),
        }
    }

    pub fn record_started(&self, upload_id: &UploadId, size: Option<u64>, resumed_chunks: u32) {
        self.stats.uploads_started.fetch_add(1, Ordering::Relaxed);
        self.stats
            .chunks_resumed
            .fetch_add(resumed_chunks as u64, Ordering::Relaxed);
        self.emit(UploadEvent::Started {
            upload_id: upload_id.clone(),
            size,
            resumed_chunks,
            at: Utc::now(),
        });
    }

    pub fn record_chunk_completed(&self, upload_id: &UploadId, chunk_id: u32, offset: u64, size: u64, attempt: u32) {
        self.stats.chunks_completed.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_acknowledged.fetch_add(size, Ordering::Relaxed);
        self.emit(UploadEvent::ChunkCompleted {
            upload_id: upload_id.clone(),
            chunk_id,
            offset,
            size,
            attempt,
            at: Utc::now(),
        });
    }

    pub fn record_chunk_failed(&self, upload_id: &UploadId, chunk_id: u32, attempt: u32, error: &str) {
        self.stats.chunks_failed.fetch_add(1, Ordering::Relaxed);
        self.emit(UploadEvent::ChunkFailed {
            upload_id: upload_id.clone(),
            chunk_id,
            attempt,
            error: error.to_string(),
            at: Utc::now(),
        });
    }

    pub fn record_retrying(&self, upload_id: &UploadId, wave: u32, chunk_ids: Vec<u32>) {
        self.stats.retries.fetch_add(chunk_ids.len() as u64, Ordering::Relaxed);
        self.emit(UploadEvent::Retrying {
            upload_id: upload_id.clone(),
            wave,
            chunk_ids,
            at: Utc::now(),
        });
    }

    pub fn record_finalized(&self, upload_id: &UploadId, size: u64, chunks: u32) {
        self.stats.uploads_finalized.fetch_add(1, Ordering::Relaxed);
        self.emit(UploadEvent::Finalized {
            upload_id: upload_id.clone(),
            size,
            chunks,
            at: Utc::now(),
        });
    }

    pub fn record_aborted(&self, upload_id: &UploadId, error: &UploadError) {
        self.stats.uploads_aborted.fetch_add(1, Ordering::Relaxed);
        self.emit(UploadEvent::Aborted {
            upload_id: upload_id.clone(),
            error: error.to_string(),
            at: Utc::now(),
        });
    }

    fn emit(&self, event: UploadEvent) {
        debug!("Upload event {} for {}", event.event_name(), event.upload_id());
        // No receivers is fine
        let _ = self.event_broadcaster.send(event);
    }

    /// Subscribe to events emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.event_broadcaster.subscribe()
    }

    /// Event stream that skips over events lost by a lagging consumer
    pub fn events(&self) -> impl Stream<Item = UploadEvent> + Send + 'static {
        BroadcastStream::new(self.event_broadcaster.subscribe()).filter_map(|event| event.ok())
    }

    pub fn stats(&self) -> &UploadStats {
        &self.stats
    }
}

impl Default for ObservabilityLayer {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock-free upload counters
#[derive(Debug, Default)]
pub struct UploadStats {
    uploads_started: AtomicU64,
    uploads_finalized: AtomicU64,
    uploads_aborted: AtomicU64,
    chunks_completed: AtomicU64,
    chunks_failed: AtomicU64,
    chunks_resumed: AtomicU64,
    retries: AtomicU64,
    bytes_acknowledged: AtomicU64,
}

impl UploadStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uploads_started(&self) -> u64 {
        self.uploads_started.load(Ordering::Relaxed)
    }

    pub fn uploads_finalized(&self) -> u64 {
        self.uploads_finalized.load(Ordering::Relaxed)
    }

    pub fn uploads_aborted(&self) -> u64 {
        self.uploads_aborted.load(Ordering::Relaxed)
    }

    pub fn chunks_completed(&self) -> u64 {
        self.chunks_completed.load(Ordering::Relaxed)
    }

    pub fn chunks_failed(&self) -> u64 {
        self.chunks_failed.load(Ordering::Relaxed)
    }

    pub fn chunks_resumed(&self) -> u64 {
        self.chunks_resumed.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn bytes_acknowledged(&self) -> u64 {
        self.bytes_acknowledged.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uploads_started: self.uploads_started(),
            uploads_finalized: self.uploads_finalized(),
            uploads_aborted: self.uploads_aborted(),
            chunks_completed: self.chunks_completed(),
            chunks_failed: self.chunks_failed(),
            chunks_resumed: self.chunks_resumed(),
            retries: self.retries(),
            bytes_acknowledged: self.bytes_acknowledged(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub uploads_started: u64,
    pub uploads_finalized: u64,
    pub uploads_aborted: u64,
    pub chunks_completed: u64,
    pub chunks_failed: u64,
    pub chunks_resumed: u64,
    pub retries: u64,
    pub bytes_acknowledged: u64,
}
