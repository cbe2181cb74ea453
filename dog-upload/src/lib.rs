//! # dog-upload: Chunked, resumable object uploads
//!
//! `dog-upload` moves large objects into block-based object storage. The payload is split into
//! fixed-size chunks, chunks are uploaded concurrently by a bounded worker pool, failed chunks
//! are retried in waves, and the object is only created once every chunk is acknowledged.
//!
//! ## Key Features
//!
//! - **Two block protocols**: mkblk/bput/mkfile (`V1`) and init/upload-part/complete (`V2`)
//! - **Integrity checks**: every acknowledged slice is compared against a locally computed crc32 or md5
//! - **Bounded retries**: a chunk is attempted at most `max_retries` times before the upload aborts
//! - **Resume**: a progress recorder lets a new `put` of the same content skip acknowledged blocks
//! - **Backpressure**: the task queue is bounded, so reading never runs far ahead of uploading
//! - **Observability**: `tracing` spans plus a broadcast stream of [`UploadEvent`]s and live [`UploadStats`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dog_upload::prelude::*;
//!
//! # #[tokio::main]
//! # async fn main() -> UploadResult<()> {
//! let token = UpToken::parse(std::env::var("UPLOAD_TOKEN").unwrap_or_default())?;
//! let client = Arc::new(HttpTransport::new().map_err(UploadError::transport)?);
//! let hosts = Arc::new(StaticHosts::single("https://upload.example.com"));
//!
//! let uploader = ResumableUploader::new(client, token, hosts, UploadConfig::from_env("DOG_UPLOAD"))
//!     .with_recorder(Arc::new(FileRecorder::new("/tmp/dog-upload")));
//!
//! let params = ObjectParams::new()
//!     .with_key("videos/intro.mp4")
//!     .with_content_type("video/mp4")
//!     .with_fingerprint("intro.mp4:1048576000:1700000000");
//!
//! let outcome = uploader.put(params, UploadSource::from_file("intro.mp4").await?).await?;
//! println!("stored {:?}", outcome.put_ret()?.key);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐
//! │  ResumableUploader   │  ← put(): validate, resolve host, recover, finalize
//! ├──────────────────────┤
//! │  WaveScheduler       │  ← waves of chunk tasks, barrier, FailureAggregator
//! ├──────────────────────┤
//! │  WorkerPool          │  ← bounded queue, fixed workers, shareable
//! ├──────────────────────┤
//! │  BlockTransport      │  ← V1 / V2 block protocols
//! ├──────────────────────┤
//! │  RequestTransport    │  ← one HTTP exchange (reqwest or your own)
//! └──────────────────────┘
//! ```

pub mod aggregator;
mod config;
mod error;
mod events;
pub mod finalizer;
pub mod observability;
pub mod pool;
pub mod recorder;
pub mod scheduler;
pub mod source;
mod token;
pub mod transport;
mod types;
mod uploader;

// Re-export main types for clean API
pub use aggregator::{FailureAggregator, FailureEntry, WaveDecision};
pub use config::{
    Protocol, UploadConfig, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_RETRIES, DEFAULT_RECORD_TTL, DEFAULT_WORKERS, MAX_PARTS,
    MAX_PART_SIZE, MIN_PART_SIZE,
};
pub use error::{ChunkError, FailureClass, TransportError, UploadError, UploadResult};
pub use events::UploadEvent;
pub use finalizer::Finalizer;
pub use observability::{ObservabilityLayer, StatsSnapshot, UploadStats};
pub use pool::WorkerPool;
pub use recorder::{
    FileRecorder, MemoryRecorder, RecordHeader, RecordedBlock, RecoveryRecord, RecoverySession, ResumableRecorder,
    SessionKey,
};
pub use scheduler::{ChunkTaskContext, WaveScheduler};
pub use source::{ChunkSource, FileReadAt, ReadAt, SizedChunkSource, StreamChunkSource, UploadSource};
pub use token::{HostResolver, StaticHosts, UpToken};
#[cfg(feature = "http")]
pub use transport::HttpTransport;
pub use transport::{
    ApiRequest, ApiResponse, BlockTransport, Method, RequestTransport, ResumedSession, SessionHandle, UploadTarget,
    V1Transport, V2Transport,
};
pub use types::{BlockToken, Chunk, CompletedBlock, ObjectParams, PutRet, UploadId, UploadOutcome, UploadProgress};
pub use uploader::ResumableUploader;

/// Prelude for convenient imports
pub mod prelude {
    #[cfg(feature = "http")]
    pub use crate::HttpTransport;
    pub use crate::{
        FileRecorder, MemoryRecorder, ObjectParams, Protocol, RequestTransport, ResumableUploader, StaticHosts,
        UpToken, UploadConfig, UploadError, UploadEvent, UploadOutcome, UploadResult, UploadSource, WorkerPool,
    };
}
