use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::transport::ResumedSession;
use crate::{BlockToken, Protocol, UploadError, UploadResult};

/// Format version written into every record header
pub const RECORD_VERSION: u32 = 1;

/// Identity of one resumable upload: target object plus source content
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey(String);

impl SessionKey {
    /// Hex sha256 over bucket, object key and source fingerprint
    pub fn derive(bucket: &str, key: Option<&str>, fingerprint: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bucket.as_bytes());
        hasher.update([0u8]);
        hasher.update(key.unwrap_or("~").as_bytes());
        hasher.update([0u8]);
        hasher.update(fingerprint.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// First entry of a record; a record is only trusted if its header matches the new upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordHeader {
    pub version: u32,
    pub bucket: String,
    #[serde(default)]
    pub key: Option<String>,
    pub fingerprint: String,
    pub protocol: Protocol,
    pub chunk_size: u64,
    /// Multipart upload id the recorded parts belong to
    #[serde(default)]
    pub upload_id: Option<String>,
    #[serde(default)]
    pub upload_expires_at: Option<i64>,
    pub created_at: i64,
}

impl RecordHeader {
    pub fn new(bucket: &str, key: Option<&str>, fingerprint: &str, protocol: Protocol, chunk_size: u64) -> Self {
        Self {
            version: RECORD_VERSION,
            bucket: bucket.to_string(),
            key: key.map(str::to_string),
            fingerprint: fingerprint.to_string(),
            protocol,
            chunk_size,
            upload_id: None,
            upload_expires_at: None,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn with_session(mut self, session: Option<ResumedSession>) -> Self {
        self.upload_id = session.as_ref().map(|s| s.upload_id.clone());
        self.upload_expires_at = session.map(|s| s.expires_at);
        self
    }

    /// Multipart session stored in this header
    pub fn resumed_session(&self) -> Option<ResumedSession> {
        Some(ResumedSession {
            upload_id: self.upload_id.clone()?,
            expires_at: self.upload_expires_at.unwrap_or_default(),
        })
    }

    /// Check that blocks recorded under `self` can be reused for an upload described by `other`
    pub fn is_compatible(&self, other: &RecordHeader) -> bool {
        self.version == other.version
            && self.bucket == other.bucket
            && self.key == other.key
            && self.fingerprint == other.fingerprint
            && self.protocol == other.protocol
            && self.chunk_size == other.chunk_size
    }
}

/// One fully acknowledged block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedBlock {
    pub offset: u64,
    pub size: u64,
    pub token: BlockToken,
    /// Unix seconds
    pub uploaded_at: i64,
}

/// Header plus acknowledged blocks, as loaded from a recorder
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryRecord {
    pub header: RecordHeader,
    pub blocks: Vec<RecordedBlock>,
}

impl RecoveryRecord {
    pub fn offsets(&self) -> Vec<u64> {
        self.blocks.iter().map(|block| block.offset).collect()
    }
}

/// Durable store of upload progress keyed by session
#[async_trait]
pub trait ResumableRecorder: Send + Sync {
    async fn load(&self, key: &SessionKey) -> UploadResult<Option<RecoveryRecord>>;

    /// Start a new record, replacing any existing one
    async fn create(&self, key: &SessionKey, header: RecordHeader) -> UploadResult<()>;

    async fn append(&self, key: &SessionKey, block: &RecordedBlock) -> UploadResult<()>;

    /// Remove the record; removing a missing record succeeds
    async fn clear(&self, key: &SessionKey) -> UploadResult<()>;
}

/// In-process recorder; progress survives a failed `put` but not a restart
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    records: DashMap<SessionKey, RecoveryRecord>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl ResumableRecorder for MemoryRecorder {
    async fn load(&self, key: &SessionKey) -> UploadResult<Option<RecoveryRecord>> {
        Ok(self.records.get(key).map(|record| record.value().clone()))
    }

    async fn create(&self, key: &SessionKey, header: RecordHeader) -> UploadResult<()> {
        self.records.insert(
            key.clone(),
            RecoveryRecord {
                header,
                blocks: Vec::new(),
            },
        );
        Ok(())
    }

    async fn append(&self, key: &SessionKey, block: &RecordedBlock) -> UploadResult<()> {
        let mut record = self
            .records
            .get_mut(key)
            .ok_or_else(|| UploadError::recorder(format!("no record for session {}", key)))?;
        record.blocks.push(block.clone());
        Ok(())
    }

    async fn clear(&self, key: &SessionKey) -> UploadResult<()> {
        self.records.remove(key);
        Ok(())
    }
}

/// One JSON-lines file per session under a directory
///
/// The first line is the [`RecordHeader`], every further line one [`RecordedBlock`]. Writes
/// are append-only, so a crash can at worst leave a truncated last line, which is ignored on
/// load.
#[derive(Debug)]
pub struct FileRecorder {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileRecorder {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &SessionKey) -> PathBuf {
        self.dir.join(format!("{}.jsonl", key.as_str()))
    }
}

#[async_trait]
impl ResumableRecorder for FileRecorder {
    async fn load(&self, key: &SessionKey) -> UploadResult<Option<RecoveryRecord>> {
        let path = self.path(key);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(UploadError::recorder(err)),
        };

        let mut lines = content.lines().filter(|line| !line.trim().is_empty());
        let Some(first) = lines.next() else {
            return Ok(None);
        };
        let header: RecordHeader = match serde_json::from_str(first) {
            Ok(header) => header,
            Err(err) => {
                warn!("Ignoring progress record {} with unreadable header: {}", path.display(), err);
                return Ok(None);
            }
        };

        let mut blocks = Vec::new();
        for line in lines {
            match serde_json::from_str::<RecordedBlock>(line) {
                Ok(block) => blocks.push(block),
                Err(err) => {
                    warn!("Stopping at unreadable line in {}: {}", path.display(), err);
                    break;
                }
            }
        }
        Ok(Some(RecoveryRecord { header, blocks }))
    }

    async fn create(&self, key: &SessionKey, header: RecordHeader) -> UploadResult<()> {
        let _guard = self.write_lock.lock().await;
        fs::create_dir_all(&self.dir).await.map_err(UploadError::recorder)?;
        let mut line = serde_json::to_string(&header)?;
        line.push('\n');
        fs::write(self.path(key), line).await.map_err(UploadError::recorder)?;
        Ok(())
    }

    async fn append(&self, key: &SessionKey, block: &RecordedBlock) -> UploadResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut line = serde_json::to_string(block)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .append(true)
            .open(self.path(key))
            .await
            .map_err(UploadError::recorder)?;
        file.write_all(line.as_bytes()).await.map_err(UploadError::recorder)?;
        file.flush().await.map_err(UploadError::recorder)?;
        Ok(())
    }

    async fn clear(&self, key: &SessionKey) -> UploadResult<()> {
        let _guard = self.write_lock.lock().await;
        match fs::remove_file(self.path(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(UploadError::recorder(err)),
        }
    }
}

/// Recorder bound to one upload
///
/// Recorder failures never fail the upload: they only cost the ability to resume, so they
/// are logged and swallowed here.
#[derive(Clone)]
pub struct RecoverySession {
    recorder: Arc<dyn ResumableRecorder>,
    key: SessionKey,
    header: RecordHeader,
}

impl RecoverySession {
    pub fn new(recorder: Arc<dyn ResumableRecorder>, key: SessionKey, header: RecordHeader) -> Self {
        Self { recorder, key, header }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Load the trusted part of an earlier record
    ///
    /// A record whose header does not match is cleared. Blocks older than `ttl`, with an
    /// expired context, or repeating an offset are dropped.
    pub async fn load_trusted(&self, ttl: Duration) -> Option<RecoveryRecord> {
        let record = match self.recorder.load(&self.key).await {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(err) => {
                warn!("Failed to load progress record {}: {}", self.key, err);
                return None;
            }
        };

        if !record.header.is_compatible(&self.header) {
            info!("Progress record {} does not match this upload; starting over", self.key);
            self.discard().await;
            return None;
        }

        let now = chrono::Utc::now().timestamp();
        let ttl = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let mut by_offset = BTreeMap::new();
        for block in record.blocks {
            if block.uploaded_at.saturating_add(ttl) <= now || block.token.is_expired_at(now) {
                debug!("Dropping stale recorded block at offset {}", block.offset);
                continue;
            }
            by_offset.insert(block.offset, block);
        }

        Some(RecoveryRecord {
            header: record.header,
            blocks: by_offset.into_values().collect(),
        })
    }

    /// Write a fresh header for this upload, forgetting earlier blocks
    pub async fn start(&self, session: Option<ResumedSession>) {
        let header = self.header.clone().with_session(session);
        if let Err(err) = self.recorder.create(&self.key, header).await {
            warn!("Failed to create progress record {}: {}", self.key, err);
        }
    }

    /// Persist a fully acknowledged block
    pub async fn record(&self, block: RecordedBlock) {
        if let Err(err) = self.recorder.append(&self.key, &block).await {
            warn!("Failed to record block at offset {}: {}", block.offset, err);
        }
    }

    /// Drop the record
    pub async fn discard(&self) {
        if let Err(err) = self.recorder.clear(&self.key).await {
            warn!("Failed to clear progress record {}: {}", self.key, err);
        }
    }
}
