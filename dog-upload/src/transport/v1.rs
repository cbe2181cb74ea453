use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    chunk_error, encode_segment, ApiRequest, BlockTransport, RequestTransport, ResumedSession, SessionHandle,
    UploadTarget, STATUS_INVALID_CTX,
};
use crate::{BlockToken, Chunk, ChunkError, ObjectParams, Protocol, UploadError, UploadResult};

const META_PREFIX: &str = "x-qn-meta-";

#[derive(Debug, Deserialize)]
struct BlockResponse {
    ctx: String,
    crc32: u64,
    offset: u64,
    #[serde(default)]
    host: String,
    #[serde(default)]
    expired_at: i64,
}

/// mkblk / bput / mkfile
///
/// A block is sent in slices: `mkblk` carries the first slice and the block size, each
/// `bput` appends the next slice to the context returned by the previous call. Every answer
/// reports the crc32 of the slice the server stored.
pub struct V1Transport {
    client: Arc<dyn RequestTransport>,
    slice_size: u64,
}

impl V1Transport {
    pub fn new(client: Arc<dyn RequestTransport>) -> Self {
        Self {
            client,
            slice_size: 0,
        }
    }

    /// Bytes per mkblk/bput call; 0 sends each block in one call
    pub fn with_slice_size(mut self, slice_size: u64) -> Self {
        self.slice_size = slice_size;
        self
    }

    fn mkfile_url(&self, session: &SessionHandle, params: &ObjectParams, total_size: u64) -> String {
        let mut url = format!("{}/mkfile/{}", session.target.host, total_size);
        if let Some(key) = session.target.key.as_deref().or(params.key.as_deref()) {
            url.push_str(&format!("/key/{}", encode_segment(key)));
        }
        if let Some(mime) = &params.content_type {
            url.push_str(&format!("/mimeType/{}", encode_segment(mime)));
        }
        if let Some(name) = &params.file_name {
            url.push_str(&format!("/fname/{}", encode_segment(name)));
        }
        for (key, value) in &params.metadata {
            let name = if key.starts_with(META_PREFIX) {
                key.clone()
            } else {
                format!("{}{}", META_PREFIX, key)
            };
            url.push_str(&format!("/{}/{}", name, encode_segment(value)));
        }
        for (key, value) in &params.custom_vars {
            url.push_str(&format!("/x:{}/{}", key, encode_segment(value)));
        }
        url
    }
}

#[async_trait]
impl BlockTransport for V1Transport {
    fn protocol(&self) -> Protocol {
        Protocol::V1
    }

    async fn init(&self, target: &UploadTarget, _resumed: Option<&ResumedSession>) -> UploadResult<SessionHandle> {
        Ok(SessionHandle {
            target: target.clone(),
            upload_id: None,
            expires_at: None,
        })
    }

    async fn upload_chunk(
        &self,
        session: &SessionHandle,
        chunk: &Chunk,
        token: &mut Option<BlockToken>,
        cancel: &CancellationToken,
    ) -> Result<BlockToken, ChunkError> {
        let block_size = chunk.len();
        let slice_size = if self.slice_size == 0 {
            block_size.max(1)
        } else {
            self.slice_size
        };

        let now = chrono::Utc::now().timestamp();
        if let Some(current) = token.as_ref() {
            let unusable = match current {
                BlockToken::V1 { offset, .. } => *offset > block_size || current.is_expired_at(now),
                _ => true,
            };
            if unusable {
                debug!("Discarding stale context for chunk {}", chunk.id);
                *token = None;
            }
        }

        loop {
            if cancel.is_cancelled() {
                return Err(ChunkError::Cancelled);
            }
            let (acked, request) = match token.as_ref() {
                Some(BlockToken::V1 { ctx, offset, host, .. }) => {
                    if *offset >= block_size {
                        break;
                    }
                    (*offset, ApiRequest::post(format!("{}/bput/{}/{}", host, ctx, offset)))
                }
                _ => (0, ApiRequest::post(format!("{}/mkblk/{}", session.target.host, block_size))),
            };

            let end = (acked + slice_size).min(block_size);
            let slice = chunk.data.slice(acked as usize..end as usize);
            let expected = crc32fast::hash(&slice);
            let request = request
                .with_header("Authorization", session.target.token.authorization())
                .with_header("Content-Type", "application/octet-stream")
                .with_body(slice);

            let response = self.client.send(request).await?;
            if !response.is_success() {
                let err = chunk_error(response, STATUS_INVALID_CTX);
                if err.is_invalid_context() {
                    *token = None;
                }
                return Err(err);
            }

            let body: BlockResponse = response.json()?;
            if body.crc32 != u64::from(expected) {
                return Err(ChunkError::ChecksumMismatch {
                    expected: expected.to_string(),
                    actual: body.crc32.to_string(),
                });
            }
            if body.offset != end {
                *token = None;
                return Err(ChunkError::InvalidContext);
            }

            let host = match token.as_ref() {
                _ if !body.host.is_empty() => body.host.trim_end_matches('/').to_string(),
                Some(BlockToken::V1 { host, .. }) => host.clone(),
                _ => session.target.host.clone(),
            };
            *token = Some(BlockToken::v1(body.ctx, expected, body.offset, host, body.expired_at));

            if end >= block_size {
                break;
            }
        }

        token
            .clone()
            .ok_or(ChunkError::InvalidContext)
    }

    async fn complete(
        &self,
        session: &SessionHandle,
        params: &ObjectParams,
        total_size: u64,
        tokens: Vec<BlockToken>,
    ) -> UploadResult<serde_json::Value> {
        let contexts = tokens
            .into_iter()
            .map(|token| match token {
                BlockToken::V1 { ctx, .. } => Ok(ctx),
                _ => Err(UploadError::invalid("mkfile requires V1 block contexts")),
            })
            .collect::<UploadResult<Vec<_>>>()?;

        let request = ApiRequest::post(self.mkfile_url(session, params, total_size))
            .with_header("Authorization", session.target.token.authorization())
            .with_header("Content-Type", "text/plain")
            .with_body(contexts.join(","));

        let response = self.client.send(request).await.map_err(UploadError::transport)?;
        if !response.is_success() {
            return Err(UploadError::transport(response.into_error()));
        }
        if response.body.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        response.json().map_err(UploadError::transport)
    }
}
