use std::sync::Arc;

use async_trait::async_trait;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{
    chunk_error, encode_segment, ApiRequest, BlockTransport, RequestTransport, ResumedSession, SessionHandle,
    UploadTarget, STATUS_NO_SUCH_UPLOAD,
};
use crate::{BlockToken, Chunk, ChunkError, ObjectParams, Protocol, UploadError, UploadResult};

/// Sessions closer to expiry than this are not reused
const RESUME_MARGIN_SECS: i64 = 60;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitResponse {
    upload_id: String,
    #[serde(default)]
    expire_at: i64,
}

#[derive(Debug, Deserialize)]
struct PartResponse {
    etag: String,
    md5: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CompletedPart<'a> {
    part_number: u32,
    etag: &'a str,
}

/// init parts / upload part / complete parts
///
/// One upload id covers the whole object; chunk `n` becomes part `n + 1`.
pub struct V2Transport {
    client: Arc<dyn RequestTransport>,
}

impl V2Transport {
    pub fn new(client: Arc<dyn RequestTransport>) -> Self {
        Self { client }
    }

    fn object_url(target: &UploadTarget) -> String {
        let key = target
            .key
            .as_deref()
            .map(encode_segment)
            .unwrap_or_else(|| "~".to_string());
        format!("{}/buckets/{}/objects/{}/uploads", target.host, target.token.bucket(), key)
    }
}

#[async_trait]
impl BlockTransport for V2Transport {
    fn protocol(&self) -> Protocol {
        Protocol::V2
    }

    async fn init(&self, target: &UploadTarget, resumed: Option<&ResumedSession>) -> UploadResult<SessionHandle> {
        let now = chrono::Utc::now().timestamp();
        if let Some(resumed) = resumed.filter(|session| session.expires_at > now + RESUME_MARGIN_SECS) {
            debug!("Reusing multipart upload {}", resumed.upload_id);
            return Ok(SessionHandle {
                target: target.clone(),
                upload_id: Some(resumed.upload_id.clone()),
                expires_at: Some(resumed.expires_at),
            });
        }

        let request = ApiRequest::post(Self::object_url(target))
            .with_header("Authorization", target.token.authorization());
        let response = self.client.send(request).await.map_err(UploadError::transport)?;
        if !response.is_success() {
            return Err(UploadError::transport(response.into_error()));
        }
        let body: InitResponse = response.json().map_err(UploadError::transport)?;
        info!("Opened multipart upload {}", body.upload_id);

        Ok(SessionHandle {
            target: target.clone(),
            upload_id: Some(body.upload_id),
            expires_at: Some(body.expire_at),
        })
    }

    async fn upload_chunk(
        &self,
        session: &SessionHandle,
        chunk: &Chunk,
        token: &mut Option<BlockToken>,
        cancel: &CancellationToken,
    ) -> Result<BlockToken, ChunkError> {
        // Parts are uploaded whole; nothing partial carries over
        *token = None;
        if cancel.is_cancelled() {
            return Err(ChunkError::Cancelled);
        }
        let upload_id = session.upload_id.as_deref().ok_or(ChunkError::InvalidContext)?;
        let part_number = chunk.id + 1;
        let expected = hex::encode(Md5::digest(&chunk.data));

        let request = ApiRequest::put(format!(
            "{}/{}/{}",
            Self::object_url(&session.target),
            upload_id,
            part_number
        ))
        .with_header("Authorization", session.target.token.authorization())
        .with_header("Content-Type", "application/octet-stream")
        .with_header("Content-MD5", expected.clone())
        .with_body(chunk.data.clone());

        let response = self.client.send(request).await?;
        if !response.is_success() {
            return Err(chunk_error(response, STATUS_NO_SUCH_UPLOAD));
        }
        let body: PartResponse = response.json()?;
        if !body.md5.eq_ignore_ascii_case(&expected) {
            return Err(ChunkError::ChecksumMismatch {
                expected,
                actual: body.md5,
            });
        }

        let part = BlockToken::v2(body.etag, part_number, expected);
        *token = Some(part.clone());
        Ok(part)
    }

    async fn complete(
        &self,
        session: &SessionHandle,
        params: &ObjectParams,
        _total_size: u64,
        tokens: Vec<BlockToken>,
    ) -> UploadResult<Value> {
        let upload_id = session
            .upload_id
            .as_deref()
            .ok_or_else(|| UploadError::invalid("multipart upload was never initialized"))?;

        let parts = tokens
            .iter()
            .map(|token| match token {
                BlockToken::V2 { etag, part_number, .. } => Ok(CompletedPart {
                    part_number: *part_number,
                    etag,
                }),
                _ => Err(UploadError::invalid("complete parts requires V2 part receipts")),
            })
            .collect::<UploadResult<Vec<_>>>()?;

        let mut body = Map::new();
        body.insert("parts".into(), serde_json::to_value(&parts)?);
        if let Some(name) = &params.file_name {
            body.insert("fname".into(), Value::from(name.as_str()));
        }
        if let Some(mime) = &params.content_type {
            body.insert("mimeType".into(), Value::from(mime.as_str()));
        }
        if !params.metadata.is_empty() {
            let metadata: Map<String, Value> = params
                .metadata
                .iter()
                .map(|(key, value)| {
                    let key = if key.starts_with("x-qn-meta-") {
                        key.clone()
                    } else {
                        format!("x-qn-meta-{}", key)
                    };
                    (key, Value::from(value.as_str()))
                })
                .collect();
            body.insert("metadata".into(), Value::Object(metadata));
        }
        if !params.custom_vars.is_empty() {
            let vars: Map<String, Value> = params
                .custom_vars
                .iter()
                .map(|(key, value)| (format!("x:{}", key), Value::from(value.as_str())))
                .collect();
            body.insert("customVars".into(), Value::Object(vars));
        }

        let request = ApiRequest::post(format!("{}/{}", Self::object_url(&session.target), upload_id))
            .with_header("Authorization", session.target.token.authorization())
            .with_header("Content-Type", "application/json")
            .with_body(serde_json::to_vec(&Value::Object(body))?);

        let response = self.client.send(request).await.map_err(UploadError::transport)?;
        if !response.is_success() {
            return Err(UploadError::transport(response.into_error()));
        }
        if response.body.is_empty() {
            return Ok(Value::Null);
        }
        response.json().map_err(UploadError::transport)
    }
}
