use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{UploadError, UploadResult};

/// Default number of concurrent upload workers
pub const DEFAULT_WORKERS: usize = 4;

/// Pending tasks allowed per worker when `queue_depth` is unset
pub const QUEUE_DEPTH_PER_WORKER: usize = 4;

/// Default chunk (block/part) size: 4 MiB
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Default attempts per chunk
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// How long an acknowledged block stays usable for resume
pub const DEFAULT_RECORD_TTL: Duration = Duration::from_secs(5 * 24 * 60 * 60);

/// Smallest part accepted by the multipart protocol (except the last part)
pub const MIN_PART_SIZE: u64 = 1024 * 1024;

/// Largest part accepted by the multipart protocol
pub const MAX_PART_SIZE: u64 = 1024 * 1024 * 1024;

/// Upper bound on parts in one multipart upload
pub const MAX_PARTS: u64 = 10_000;

/// Block protocol used for an upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// mkblk / bput / mkfile
    #[default]
    V1,
    /// init parts / upload part / complete parts
    V2,
}

impl FromStr for Protocol {
    type Err = UploadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "v1" | "1" => Ok(Self::V1),
            "v2" | "2" => Ok(Self::V2),
            other => Err(UploadError::invalid(format!("Unknown upload protocol: {}", other))),
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::V1 => write!(f, "v1"),
            Self::V2 => write!(f, "v2"),
        }
    }
}

/// Configuration for resumable uploads
///
/// Zero values mean "unset" and are replaced by defaults in [`UploadConfig::normalized`].
#[derive(Debug, Clone, PartialEq)]
pub struct UploadConfig {
    /// Concurrent upload workers
    pub workers: usize,

    /// Pending task capacity; `workers * 4` when unset, never below `workers`
    pub queue_depth: Option<usize>,

    /// Bytes per chunk (one block for V1, one part for V2)
    pub chunk_size: u64,

    /// V1 only: bytes sent per mkblk/bput call; defaults to the whole block
    pub slice_size: Option<u64>,

    /// Attempts per chunk before the upload aborts
    pub max_retries: u32,

    /// Block protocol
    pub protocol: Protocol,

    /// Recovered blocks older than this are uploaded again
    pub record_ttl: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            queue_depth: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            slice_size: None,
            max_retries: DEFAULT_MAX_RETRIES,
            protocol: Protocol::V1,
            record_ttl: DEFAULT_RECORD_TTL,
        }
    }
}

impl UploadConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set worker count
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set pending task capacity
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = Some(depth);
        self
    }

    /// Set chunk size
    pub fn with_chunk_size(mut self, bytes: u64) -> Self {
        self.chunk_size = bytes;
        self
    }

    /// Set the V1 slice size
    pub fn with_slice_size(mut self, bytes: u64) -> Self {
        self.slice_size = Some(bytes);
        self
    }

    /// Set attempts per chunk
    pub fn with_max_retries(mut self, attempts: u32) -> Self {
        self.max_retries = attempts;
        self
    }

    /// Select the block protocol
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Set how long recovered blocks stay usable
    pub fn with_record_ttl(mut self, ttl: Duration) -> Self {
        self.record_ttl = ttl;
        self
    }

    /// Effective queue depth after defaults
    pub fn effective_queue_depth(&self) -> usize {
        let workers = self.effective_workers();
        self.queue_depth
            .filter(|depth| *depth > 0)
            .unwrap_or(workers * QUEUE_DEPTH_PER_WORKER)
            .max(workers)
    }

    /// Effective worker count after defaults
    pub fn effective_workers(&self) -> usize {
        if self.workers == 0 {
            DEFAULT_WORKERS
        } else {
            self.workers
        }
    }

    /// Effective V1 slice size after defaults
    pub fn effective_slice_size(&self) -> u64 {
        let chunk_size = if self.chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            self.chunk_size
        };
        self.slice_size
            .filter(|size| *size > 0)
            .unwrap_or(chunk_size)
            .min(chunk_size)
    }

    /// Copy with every unset value replaced by its default
    pub fn normalized(&self) -> Self {
        let mut config = self.clone();
        config.workers = self.effective_workers();
        config.queue_depth = Some(self.effective_queue_depth());
        if config.chunk_size == 0 {
            config.chunk_size = DEFAULT_CHUNK_SIZE;
        }
        config.slice_size = Some(self.effective_slice_size());
        if config.max_retries == 0 {
            config.max_retries = DEFAULT_MAX_RETRIES;
        }
        if config.record_ttl.is_zero() {
            config.record_ttl = DEFAULT_RECORD_TTL;
        }
        config
    }

    /// Check limits imposed by the selected protocol
    pub fn validate(&self) -> UploadResult<()> {
        let config = self.normalized();
        if usize::try_from(config.chunk_size).is_err() {
            return Err(UploadError::invalid(format!(
                "Chunk size {} does not fit in memory on this platform",
                config.chunk_size
            )));
        }
        if config.protocol == Protocol::V2
            && !(MIN_PART_SIZE..=MAX_PART_SIZE).contains(&config.chunk_size)
        {
            return Err(UploadError::invalid(format!(
                "Part size {} must be between {} and {} bytes",
                config.chunk_size, MIN_PART_SIZE, MAX_PART_SIZE
            )));
        }
        Ok(())
    }

    /// Load overrides from `<PREFIX>__WORKERS`, `<PREFIX>__QUEUE_DEPTH`, `<PREFIX>__CHUNK_SIZE`,
    /// `<PREFIX>__SLICE_SIZE`, `<PREFIX>__MAX_RETRIES` and `<PREFIX>__PROTOCOL`.
    ///
    /// Unparsable values are logged and ignored.
    pub fn from_env(prefix: &str) -> Self {
        let mut config = Self::default();
        let var = |name: &str| std::env::var(format!("{}__{}", prefix, name)).ok();

        if let Some(value) = var("WORKERS") {
            match value.parse() {
                Ok(workers) => config.workers = workers,
                Err(_) => warn!("Ignoring invalid {}__WORKERS: {}", prefix, value),
            }
        }
        if let Some(value) = var("QUEUE_DEPTH") {
            match value.parse() {
                Ok(depth) => config.queue_depth = Some(depth),
                Err(_) => warn!("Ignoring invalid {}__QUEUE_DEPTH: {}", prefix, value),
            }
        }
        if let Some(value) = var("CHUNK_SIZE") {
            match value.parse() {
                Ok(size) => config.chunk_size = size,
                Err(_) => warn!("Ignoring invalid {}__CHUNK_SIZE: {}", prefix, value),
            }
        }
        if let Some(value) = var("SLICE_SIZE") {
            match value.parse() {
                Ok(size) => config.slice_size = Some(size),
                Err(_) => warn!("Ignoring invalid {}__SLICE_SIZE: {}", prefix, value),
            }
        }
        if let Some(value) = var("MAX_RETRIES") {
            match value.parse() {
                Ok(attempts) => config.max_retries = attempts,
                Err(_) => warn!("Ignoring invalid {}__MAX_RETRIES: {}", prefix, value),
            }
        }
        if let Some(value) = var("PROTOCOL") {
            match value.parse() {
                Ok(protocol) => config.protocol = protocol,
                Err(_) => warn!("Ignoring invalid {}__PROTOCOL: {}", prefix, value),
            }
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_non_zero() {
        let config = UploadConfig::default().normalized();
        assert_eq!(config.workers, 4);
        assert_eq!(config.queue_depth, Some(16));
        assert_eq!(config.chunk_size, 4 * 1024 * 1024);
        assert_eq!(config.slice_size, Some(4 * 1024 * 1024));
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn zero_values_fall_back_to_defaults() {
        let config = UploadConfig::new()
            .with_workers(0)
            .with_chunk_size(0)
            .with_max_retries(0)
            .normalized();
        assert_eq!(config.workers, DEFAULT_WORKERS);
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.max_retries, DEFAULT_MAX_RETRIES);
    }

    #[test]
    fn queue_depth_never_below_workers() {
        let config = UploadConfig::new().with_workers(8).with_queue_depth(2);
        assert_eq!(config.effective_queue_depth(), 8);

        let config = UploadConfig::new().with_workers(3);
        assert_eq!(config.effective_queue_depth(), 12);
    }

    #[test]
    fn slice_size_is_capped_by_chunk_size() {
        let config = UploadConfig::new().with_chunk_size(1024).with_slice_size(4096);
        assert_eq!(config.effective_slice_size(), 1024);

        let config = UploadConfig::new().with_chunk_size(1024).with_slice_size(256);
        assert_eq!(config.effective_slice_size(), 256);
    }

    #[test]
    fn v2_rejects_small_parts() {
        let config = UploadConfig::new()
            .with_protocol(Protocol::V2)
            .with_chunk_size(512 * 1024);
        assert!(matches!(config.validate(), Err(UploadError::Invalid { .. })));

        let config = UploadConfig::new()
            .with_protocol(Protocol::V2)
            .with_chunk_size(MIN_PART_SIZE);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn protocol_parses_case_insensitively() {
        assert_eq!("V2".parse::<Protocol>().unwrap(), Protocol::V2);
        assert_eq!("v1".parse::<Protocol>().unwrap(), Protocol::V1);
        assert!("v3".parse::<Protocol>().is_err());
    }

    #[test]
    fn from_env_reads_prefixed_values() {
        std::env::set_var("DOG_UPLOAD_CFG_TEST__WORKERS", "6");
        std::env::set_var("DOG_UPLOAD_CFG_TEST__CHUNK_SIZE", "1048576");
        std::env::set_var("DOG_UPLOAD_CFG_TEST__PROTOCOL", "v2");
        std::env::set_var("DOG_UPLOAD_CFG_TEST__MAX_RETRIES", "not-a-number");

        let config = UploadConfig::from_env("DOG_UPLOAD_CFG_TEST");
        assert_eq!(config.workers, 6);
        assert_eq!(config.chunk_size, 1_048_576);
        assert_eq!(config.protocol, Protocol::V2);
        assert_eq!(config.max_retries, DEFAULT_MAX_RETRIES);
    }
}
