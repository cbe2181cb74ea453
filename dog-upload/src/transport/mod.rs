//! Block transports and the request seam they are built on
//!
//! [`RequestTransport`] performs one HTTP exchange. [`BlockTransport`] turns chunks into
//! server-side blocks on top of it, with one implementation per [`Protocol`].

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::{BlockToken, Chunk, ChunkError, ObjectParams, Protocol, TransportError, UpToken, UploadResult};

#[cfg(feature = "http")]
mod http;
mod v1;
mod v2;

#[cfg(feature = "http")]
pub use http::HttpTransport;
pub use v1::V1Transport;
pub use v2::V2Transport;

/// Status the V1 endpoints return for an unknown or expired block context
pub const STATUS_INVALID_CTX: u16 = 701;

/// Status the V2 endpoints return for an unknown or expired upload id
pub const STATUS_NO_SUCH_UPLOAD: u16 = 612;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
}

/// One outgoing request
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl ApiRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new(Method::Put, url)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// First header named `name`, compared case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// A response of any status
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// 200 response carrying `value` as JSON
    pub fn json_ok(value: &serde_json::Value) -> Self {
        Self::new(200, Bytes::from(value.to_string()))
            .with_header("Content-Type", "application/json")
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, TransportError> {
        serde_json::from_slice(&self.body).map_err(|e| TransportError::decode(e.to_string()))
    }

    /// Server error message: the `error` field of a JSON body, else the raw body
    pub fn error_message(&self) -> String {
        serde_json::from_slice::<ErrorBody>(&self.body)
            .map(|body| body.error)
            .unwrap_or_else(|_| String::from_utf8_lossy(&self.body).into_owned())
    }

    /// This response as a transport error
    pub fn into_error(self) -> TransportError {
        TransportError::status(self.status, self.error_message())
    }
}

/// Performs one request/response exchange
///
/// Any HTTP answer is `Ok`, including error statuses; `Err` means no response was received.
#[async_trait]
pub trait RequestTransport: Send + Sync {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError>;
}

/// Where blocks of one upload go
#[derive(Debug, Clone)]
pub struct UploadTarget {
    pub token: UpToken,
    /// Endpoint chosen by the host resolver, without trailing slash
    pub host: String,
    pub key: Option<String>,
}

/// Multipart session left behind by an earlier attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumedSession {
    pub upload_id: String,
    /// Unix seconds
    pub expires_at: i64,
}

/// Per-upload state returned by [`BlockTransport::init`]
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub target: UploadTarget,
    /// Multipart upload id, `None` for V1
    pub upload_id: Option<String>,
    pub expires_at: Option<i64>,
}

impl SessionHandle {
    /// Session as stored in a progress record
    pub fn resumable(&self) -> Option<ResumedSession> {
        Some(ResumedSession {
            upload_id: self.upload_id.clone()?,
            expires_at: self.expires_at.unwrap_or_default(),
        })
    }
}

/// Uploads chunks as server-side blocks and assembles them into an object
#[async_trait]
pub trait BlockTransport: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Open the upload, reusing `resumed` when the service still accepts it
    async fn init(&self, target: &UploadTarget, resumed: Option<&ResumedSession>) -> UploadResult<SessionHandle>;

    /// Upload one chunk
    ///
    /// `token` holds the partial state of an earlier attempt and is updated after each
    /// verified call, so a failed attempt leaves the last good state behind. On an invalid
    /// context it is cleared and the next attempt restarts the block. Once `cancel` fires no
    /// further request is started; the call in flight is allowed to finish.
    async fn upload_chunk(
        &self,
        session: &SessionHandle,
        chunk: &Chunk,
        token: &mut Option<BlockToken>,
        cancel: &CancellationToken,
    ) -> Result<BlockToken, ChunkError>;

    /// Create the object from `tokens`, which are in ascending chunk order
    async fn complete(
        &self,
        session: &SessionHandle,
        params: &ObjectParams,
        total_size: u64,
        tokens: Vec<BlockToken>,
    ) -> UploadResult<serde_json::Value>;
}

/// Block transport for `protocol`
pub fn block_transport(
    protocol: Protocol,
    client: Arc<dyn RequestTransport>,
    slice_size: u64,
) -> Arc<dyn BlockTransport> {
    match protocol {
        Protocol::V1 => Arc::new(V1Transport::new(client).with_slice_size(slice_size)),
        Protocol::V2 => Arc::new(V2Transport::new(client)),
    }
}

/// Map a non-success response to a chunk error
pub(crate) fn chunk_error(response: ApiResponse, invalid_context_status: u16) -> ChunkError {
    if response.status == invalid_context_status {
        ChunkError::InvalidContext
    } else {
        ChunkError::Transport(response.into_error())
    }
}

pub(crate) fn encode_segment(value: &str) -> String {
    use base64::engine::general_purpose::URL_SAFE;
    use base64::Engine;
    URL_SAFE.encode(value.as_bytes())
}
