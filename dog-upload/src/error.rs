use thiserror::Error;

/// Result type for upload operations
pub type UploadResult<T> = Result<T, UploadError>;

/// Coarse failure class of a terminal upload error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    Read,
    ChecksumMismatch,
    InvalidContext,
    Transport,
    Cancelled,
    MaxRetriesExceeded,
    Finalize,
    Invalid,
    Token,
    Recorder,
    Serialization,
}

/// Terminal errors surfaced to the caller of an upload
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Failed to read upload source: {source}")]
    Read {
        #[from]
        source: std::io::Error,
    },

    #[error("Checksum mismatch for chunk {chunk_id}: sent {expected}, server received {actual}")]
    ChecksumMismatch {
        chunk_id: u32,
        expected: String,
        actual: String,
    },

    #[error("Invalid or expired block context for chunk {chunk_id}")]
    InvalidContext { chunk_id: u32 },

    #[error("Transport error: {source}")]
    Transport {
        #[source]
        source: TransportError,
    },

    #[error("Upload cancelled")]
    Cancelled,

    #[error("Chunk {chunk_id} failed after {attempts} attempts: {source}")]
    MaxRetriesExceeded {
        chunk_id: u32,
        attempts: u32,
        #[source]
        source: Box<UploadError>,
    },

    #[error("Finalization failed: {source}")]
    Finalize {
        #[source]
        source: Box<UploadError>,
    },

    #[error("Invalid request: {message}")]
    Invalid { message: String },

    #[error("Invalid upload token: {message}")]
    Token { message: String },

    #[error("Progress recorder error: {message}")]
    Recorder { message: String },

    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
}

impl UploadError {
    /// Create an invalid request error
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Create an upload token error
    pub fn token<S: Into<String>>(message: S) -> Self {
        Self::Token {
            message: message.into(),
        }
    }

    /// Create a recorder error from anything displayable
    pub fn recorder<E: std::fmt::Display>(error: E) -> Self {
        Self::Recorder {
            message: error.to_string(),
        }
    }

    /// Wrap a transport failure
    pub fn transport(source: TransportError) -> Self {
        Self::Transport { source }
    }

    /// Wrap an error raised by the finalization call
    pub fn finalize(source: UploadError) -> Self {
        Self::Finalize {
            source: Box::new(source),
        }
    }

    /// Failure class of this error
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Read { .. } => FailureClass::Read,
            Self::ChecksumMismatch { .. } => FailureClass::ChecksumMismatch,
            Self::InvalidContext { .. } => FailureClass::InvalidContext,
            Self::Transport { .. } => FailureClass::Transport,
            Self::Cancelled => FailureClass::Cancelled,
            Self::MaxRetriesExceeded { .. } => FailureClass::MaxRetriesExceeded,
            Self::Finalize { .. } => FailureClass::Finalize,
            Self::Invalid { .. } => FailureClass::Invalid,
            Self::Token { .. } => FailureClass::Token,
            Self::Recorder { .. } => FailureClass::Recorder,
            Self::Serialization { .. } => FailureClass::Serialization,
        }
    }

    /// Class of the innermost error, looking through retry and finalize wrappers
    pub fn root_class(&self) -> FailureClass {
        match self {
            Self::MaxRetriesExceeded { source, .. } | Self::Finalize { source } => source.root_class(),
            other => other.class(),
        }
    }

    /// Check if this error is a cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Failure of a single request/response exchange with the storage service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    /// HTTP status when the service answered, `None` for network failures
    pub status: Option<u16>,
    pub message: String,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(code) => write!(f, "HTTP {}: {}", code, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for TransportError {}

impl TransportError {
    /// A failure before any response was received
    pub fn network<S: Into<String>>(message: S) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    /// A non-success response from the service
    pub fn status<S: Into<String>>(status: u16, message: S) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }

    /// A response that could not be decoded
    pub fn decode<S: Into<String>>(message: S) -> Self {
        Self {
            status: None,
            message: format!("malformed response: {}", message.into()),
        }
    }
}

/// Outcome of one chunk attempt - determines retry behavior
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChunkError {
    /// The server acknowledged bytes that do not match what was sent
    #[error("Checksum mismatch: sent {expected}, server received {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// The server rejected the block context; the block restarts from byte 0
    #[error("Invalid or expired block context")]
    InvalidContext,

    /// Network or HTTP failure
    #[error("Transport error: {0}")]
    Transport(TransportError),

    /// Upload was cancelled before the attempt started
    #[error("Upload cancelled")]
    Cancelled,
}

impl ChunkError {
    /// Check if this error may be retried within the attempt budget
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }

    /// Check if the block token must be discarded
    pub fn is_invalid_context(&self) -> bool {
        matches!(self, Self::InvalidContext)
    }

    /// Check if this failure came from cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Convert into the caller-visible error for `chunk_id`
    pub fn into_upload_error(self, chunk_id: u32) -> UploadError {
        match self {
            Self::ChecksumMismatch { expected, actual } => UploadError::ChecksumMismatch {
                chunk_id,
                expected,
                actual,
            },
            Self::InvalidContext => UploadError::InvalidContext { chunk_id },
            Self::Transport(source) => UploadError::Transport { source },
            Self::Cancelled => UploadError::Cancelled,
        }
    }
}

impl From<TransportError> for ChunkError {
    fn from(err: TransportError) -> Self {
        Self::Transport(err)
    }
}
