use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::{UploadError, UploadResult};

/// Unique identifier for one `put` call, used to correlate events and logs
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadId(pub String);

impl UploadId {
    /// Generate a new random upload ID
    pub fn new() -> Self {
        Self(format!("upl_{}", Uuid::new_v4().simple()))
    }

    /// Create from existing string
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UploadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One fixed-size slice of the source
///
/// `data` is never mutated; a retry re-submits the same bytes with a higher `attempt`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub id: u32,
    pub offset: u64,
    pub data: Bytes,
    pub attempt: u32,
}

impl Chunk {
    pub fn new(id: u32, offset: u64, data: Bytes) -> Self {
        Self {
            id,
            offset,
            data,
            attempt: 1,
        }
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Same chunk, scheduled for its next attempt
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }
}

/// Server-issued continuation state for one block or part
///
/// Tokens are only produced by transport calls or loaded back from a progress record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum BlockToken {
    /// mkblk/bput context
    #[non_exhaustive]
    V1 {
        ctx: String,
        /// crc32 of the last slice the server acknowledged
        checksum: u32,
        /// Bytes of the block acknowledged so far
        offset: u64,
        /// Host that issued `ctx`; follow-up slices must go there
        host: String,
        /// Unix seconds after which `ctx` is no longer accepted
        expired_at: i64,
    },
    /// Multipart part receipt
    #[non_exhaustive]
    V2 {
        etag: String,
        part_number: u32,
        /// Hex md5 of the part body
        md5: String,
    },
}

impl BlockToken {
    pub(crate) fn v1(ctx: String, checksum: u32, offset: u64, host: String, expired_at: i64) -> Self {
        Self::V1 {
            ctx,
            checksum,
            offset,
            host,
            expired_at,
        }
    }

    pub(crate) fn v2(etag: String, part_number: u32, md5: String) -> Self {
        Self::V2 {
            etag,
            part_number,
            md5,
        }
    }

    /// Bytes acknowledged by the server for this block
    pub fn acknowledged(&self, block_size: u64) -> u64 {
        match self {
            Self::V1 { offset, .. } => *offset,
            Self::V2 { .. } => block_size,
        }
    }

    /// Check if the whole block of `block_size` bytes is acknowledged
    pub fn is_complete(&self, block_size: u64) -> bool {
        self.acknowledged(block_size) >= block_size
    }

    /// Check if the server will no longer accept this token at `now` (unix seconds)
    pub fn is_expired_at(&self, now: i64) -> bool {
        match self {
            Self::V1 { expired_at, .. } => *expired_at > 0 && *expired_at <= now,
            Self::V2 { .. } => false,
        }
    }
}

/// A block acknowledged in full
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedBlock {
    pub chunk_id: u32,
    pub offset: u64,
    pub size: u64,
    pub token: BlockToken,
    /// Loaded from a progress record instead of uploaded by this call
    pub resumed: bool,
}

/// Acknowledged blocks of one upload keyed by chunk id
#[derive(Debug, Default)]
pub struct UploadProgress {
    blocks: Mutex<BTreeMap<u32, CompletedBlock>>,
}

impl UploadProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a completed block; a later insert for the same id replaces the earlier one
    pub fn insert(&self, block: CompletedBlock) {
        self.blocks.lock().insert(block.chunk_id, block);
    }

    pub fn len(&self) -> usize {
        self.blocks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.lock().is_empty()
    }

    /// Bytes covered by completed blocks
    pub fn acknowledged_bytes(&self) -> u64 {
        self.blocks.lock().values().map(|block| block.size).sum()
    }

    pub fn resumed_count(&self) -> usize {
        self.blocks.lock().values().filter(|block| block.resumed).count()
    }

    /// Tokens in ascending chunk id order, requiring exactly the ids `0..expected`
    pub fn ordered_tokens(&self, expected: u32) -> UploadResult<Vec<BlockToken>> {
        let blocks = self.blocks.lock();
        if blocks.len() != expected as usize {
            return Err(UploadError::invalid(format!(
                "Expected {} completed blocks, found {}",
                expected,
                blocks.len()
            )));
        }
        blocks
            .iter()
            .enumerate()
            .map(|(index, (id, block))| {
                if *id as usize != index {
                    Err(UploadError::invalid(format!("Missing completed block {}", index)))
                } else {
                    Ok(block.token.clone())
                }
            })
            .collect()
    }
}

/// Target object description for a `put`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectParams {
    /// Object key; `None` lets the service pick one
    pub key: Option<String>,
    pub content_type: Option<String>,
    /// User metadata sent as `x-qn-meta-*`
    pub metadata: BTreeMap<String, String>,
    /// Custom variables sent as `x:*`, keys without the prefix
    pub custom_vars: BTreeMap<String, String>,
    /// Content fingerprint of the source; enables resume when a recorder is configured
    pub fingerprint: Option<String>,
    /// File name reported by the multipart protocol
    pub file_name: Option<String>,
}

impl ObjectParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key<S: Into<String>>(mut self, key: S) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_content_type<S: Into<String>>(mut self, content_type: S) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_metadata<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_custom_var<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        let key = key.into();
        let key = key.strip_prefix("x:").map(str::to_string).unwrap_or(key);
        self.custom_vars.insert(key, value.into());
        self
    }

    pub fn with_fingerprint<S: Into<String>>(mut self, fingerprint: S) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    pub fn with_file_name<S: Into<String>>(mut self, name: S) -> Self {
        self.file_name = Some(name.into());
        self
    }
}

/// Default response body of a completed object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutRet {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub hash: Option<String>,
}

/// Result of a successful upload
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub upload_id: UploadId,
    /// Raw finalization response; its shape follows the upload token's return body
    pub response: serde_json::Value,
    pub size: u64,
    pub chunks: u32,
    pub resumed_chunks: u32,
}

impl UploadOutcome {
    /// Decode the default `{key, hash}` response
    pub fn put_ret(&self) -> UploadResult<PutRet> {
        Ok(serde_json::from_value(self.response.clone())?)
    }
}
