use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::UploadId;

/// Structured progress notifications for one upload
///
/// Delivered over a broadcast channel. Receivers that fall behind lose events instead of
/// slowing the upload down, so consumers must not block while handling them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum UploadEvent {
    /// Chunking started
    Started {
        upload_id: UploadId,
        size: Option<u64>,
        resumed_chunks: u32,
        at: DateTime<Utc>,
    },

    /// A chunk was fully acknowledged
    ChunkCompleted {
        upload_id: UploadId,
        chunk_id: u32,
        offset: u64,
        size: u64,
        attempt: u32,
        at: DateTime<Utc>,
    },

    /// A chunk attempt failed
    ChunkFailed {
        upload_id: UploadId,
        chunk_id: u32,
        attempt: u32,
        error: String,
        at: DateTime<Utc>,
    },

    /// A new wave of failed chunks is being submitted
    Retrying {
        upload_id: UploadId,
        wave: u32,
        chunk_ids: Vec<u32>,
        at: DateTime<Utc>,
    },

    /// The object was created
    Finalized {
        upload_id: UploadId,
        size: u64,
        chunks: u32,
        at: DateTime<Utc>,
    },

    /// The upload stopped with a terminal error
    Aborted {
        upload_id: UploadId,
        error: String,
        at: DateTime<Utc>,
    },
}

impl UploadEvent {
    /// Get event type name as string
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::ChunkCompleted { .. } => "chunk_completed",
            Self::ChunkFailed { .. } => "chunk_failed",
            Self::Retrying { .. } => "retrying",
            Self::Finalized { .. } => "finalized",
            Self::Aborted { .. } => "aborted",
        }
    }

    /// Get the upload ID from any event
    pub fn upload_id(&self) -> &UploadId {
        match self {
            Self::Started { upload_id, .. } => upload_id,
            Self::ChunkCompleted { upload_id, .. } => upload_id,
            Self::ChunkFailed { upload_id, .. } => upload_id,
            Self::Retrying { upload_id, .. } => upload_id,
            Self::Finalized { upload_id, .. } => upload_id,
            Self::Aborted { upload_id, .. } => upload_id,
        }
    }

    /// Chunk the event refers to, if any
    pub fn chunk_id(&self) -> Option<u32> {
        match self {
            Self::ChunkCompleted { chunk_id, .. } | Self::ChunkFailed { chunk_id, .. } => Some(*chunk_id),
            _ => None,
        }
    }

    /// Get the timestamp from any event
    pub fn timestamp(&self) -> &DateTime<Utc> {
        match self {
            Self::Started { at, .. } => at,
            Self::ChunkCompleted { at, .. } => at,
            Self::ChunkFailed { at, .. } => at,
            Self::Retrying { at, .. } => at,
            Self::Finalized { at, .. } => at,
            Self::Aborted { at, .. } => at,
        }
    }
}
