#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use md5::{Digest, Md5};
use parking_lot::Mutex;
use serde_json::{json, Value};
use sha2::Sha256;

use dog_upload::{ApiRequest, ApiResponse, Method, RequestTransport, TransportError, UpToken};

pub const HOST: &str = "http://up.fake";
pub const BUCKET: &str = "media";

/// What a matching request gets instead of normal handling
#[derive(Debug, Clone)]
pub enum FaultAction {
    Status(u16),
    Network,
    CorruptChecksum,
    Delay(Duration),
}

pub struct Fault {
    matcher: Box<dyn Fn(&ApiRequest) -> bool + Send + Sync>,
    action: FaultAction,
    remaining: AtomicU32,
}

/// Block storage service kept in memory
///
/// Speaks both block protocols, assembles objects and answers `{key, hash, fsize}` where
/// `hash` is the hex sha256 of the object.
#[derive(Default)]
pub struct FakeObjectService {
    blocks: DashMap<String, BytesMut>,
    parts: DashMap<String, BTreeMap<u32, Bytes>>,
    pub objects: DashMap<String, Bytes>,
    faults: Mutex<Vec<Fault>>,
    next_id: AtomicUsize,
    pub started: AtomicUsize,
    pub finished: AtomicUsize,
    in_flight: AtomicUsize,
    /// Most block uploads running at once
    pub peak_in_flight: AtomicUsize,
    pub block_calls: AtomicUsize,
    pub finalize_calls: AtomicUsize,
    pub init_calls: AtomicUsize,
    pub requests: Mutex<Vec<String>>,
}

impl FakeObjectService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Apply `action` to the next `times` requests accepted by `matcher`
    pub fn inject<F>(&self, times: u32, action: FaultAction, matcher: F)
    where
        F: Fn(&ApiRequest) -> bool + Send + Sync + 'static,
    {
        self.faults.lock().push(Fault {
            matcher: Box::new(matcher),
            action,
            remaining: AtomicU32::new(times),
        });
    }

    /// Drop every open multipart upload, as the service does once they expire
    pub fn forget_uploads(&self) {
        self.parts.clear();
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.objects.get(key).map(|entry| entry.value().clone())
    }

    fn take_fault(&self, request: &ApiRequest) -> Option<FaultAction> {
        let faults = self.faults.lock();
        for fault in faults.iter() {
            if (fault.matcher)(request) {
                let left = fault.remaining.load(Ordering::SeqCst);
                if left > 0 {
                    fault.remaining.store(left - 1, Ordering::SeqCst);
                    return Some(fault.action.clone());
                }
            }
        }
        None
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn store_object(&self, key: Option<String>, data: Bytes) -> ApiResponse {
        let key = key.unwrap_or_else(|| self.next_id("auto"));
        let hash = hex::encode(Sha256::digest(&data));
        let fsize = data.len();
        self.objects.insert(key.clone(), data);
        ApiResponse::json_ok(&json!({"key": key, "hash": hash, "fsize": fsize}))
    }

    fn block_ack(&self, ctx: &str, slice: &[u8], offset: usize, corrupt: bool) -> ApiResponse {
        let mut crc = crc32fast::hash(slice);
        if corrupt {
            crc = crc.wrapping_add(1);
        }
        ApiResponse::json_ok(&json!({
            "ctx": ctx,
            "checksum": "",
            "crc32": crc,
            "offset": offset,
            "host": HOST,
            "expired_at": chrono::Utc::now().timestamp() + 3600,
        }))
    }

    fn handle(&self, request: &ApiRequest, corrupt: bool) -> ApiResponse {
        let path = request.url.strip_prefix(HOST).unwrap_or(&request.url).to_string();
        let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();

        match segments.as_slice() {
            ["mkblk", _size] => {
                self.block_calls.fetch_add(1, Ordering::SeqCst);
                let ctx = self.next_id("ctx");
                self.blocks.insert(ctx.clone(), BytesMut::from(&request.body[..]));
                self.block_ack(&ctx, &request.body, request.body.len(), corrupt)
            }
            ["bput", ctx, offset] => {
                self.block_calls.fetch_add(1, Ordering::SeqCst);
                let Some(mut block) = self.blocks.get_mut(*ctx) else {
                    return ApiResponse::new(701, r#"{"error":"invalid context"}"#);
                };
                if offset.parse::<usize>().ok() != Some(block.len()) {
                    return ApiResponse::new(701, r#"{"error":"invalid offset"}"#);
                }
                block.extend_from_slice(&request.body);
                let len = block.len();
                drop(block);
                self.block_ack(ctx, &request.body, len, corrupt)
            }
            ["mkfile", size, rest @ ..] => {
                self.finalize_calls.fetch_add(1, Ordering::SeqCst);
                let mut key = None;
                for pair in rest.chunks(2) {
                    if let [name, value] = pair {
                        if *name == "key" {
                            key = URL_SAFE
                                .decode(value)
                                .ok()
                                .and_then(|raw| String::from_utf8(raw).ok());
                        }
                    }
                }
                let body = String::from_utf8_lossy(&request.body).into_owned();
                let mut data = BytesMut::new();
                for ctx in body.split(',').filter(|ctx| !ctx.is_empty()) {
                    match self.blocks.get(ctx) {
                        Some(block) => data.extend_from_slice(&block),
                        None => return ApiResponse::new(701, r#"{"error":"unknown context"}"#),
                    }
                }
                if size.parse::<usize>().ok() != Some(data.len()) {
                    return ApiResponse::new(400, r#"{"error":"size mismatch"}"#);
                }
                self.store_object(key, data.freeze())
            }
            ["buckets", _bucket, "objects", key, "uploads"] => {
                self.init_calls.fetch_add(1, Ordering::SeqCst);
                let upload_id = self.next_id("upload");
                self.parts.insert(format!("{}/{}", key, upload_id), BTreeMap::new());
                ApiResponse::json_ok(&json!({
                    "uploadId": upload_id,
                    "expireAt": chrono::Utc::now().timestamp() + 3600,
                }))
            }
            ["buckets", _bucket, "objects", key, "uploads", upload_id, part] => {
                self.block_calls.fetch_add(1, Ordering::SeqCst);
                let Some(mut parts) = self.parts.get_mut(&format!("{}/{}", key, upload_id)) else {
                    return ApiResponse::new(612, r#"{"error":"no such upload"}"#);
                };
                let md5 = hex::encode(Md5::digest(&request.body));
                if request.header("Content-MD5") != Some(md5.as_str()) {
                    return ApiResponse::new(400, r#"{"error":"md5 header mismatch"}"#);
                }
                let Ok(number) = part.parse::<u32>() else {
                    return ApiResponse::new(400, r#"{"error":"bad part number"}"#);
                };
                parts.insert(number, request.body.clone());
                let reported = if corrupt { "0".repeat(32) } else { md5.clone() };
                ApiResponse::json_ok(&json!({"etag": format!("etag-{}", md5), "md5": reported}))
            }
            ["buckets", _bucket, "objects", key, "uploads", upload_id] => {
                self.finalize_calls.fetch_add(1, Ordering::SeqCst);
                let Some((_, parts)) = self.parts.remove(&format!("{}/{}", key, upload_id)) else {
                    return ApiResponse::new(612, r#"{"error":"no such upload"}"#);
                };
                let Ok(body) = serde_json::from_slice::<Value>(&request.body) else {
                    return ApiResponse::new(400, r#"{"error":"bad body"}"#);
                };
                let mut data = BytesMut::new();
                let mut last = 0;
                for part in body["parts"].as_array().cloned().unwrap_or_default() {
                    let number = part["partNumber"].as_u64().unwrap_or(0) as u32;
                    if number <= last {
                        return ApiResponse::new(400, r#"{"error":"parts out of order"}"#);
                    }
                    last = number;
                    let Some(bytes) = parts.get(&number) else {
                        return ApiResponse::new(400, r#"{"error":"missing part"}"#);
                    };
                    if part["etag"].as_str() != Some(format!("etag-{}", hex::encode(Md5::digest(bytes))).as_str()) {
                        return ApiResponse::new(400, r#"{"error":"etag mismatch"}"#);
                    }
                    data.extend_from_slice(bytes);
                }
                let key = if *key == "~" {
                    None
                } else {
                    URL_SAFE
                        .decode(key)
                        .ok()
                        .and_then(|raw| String::from_utf8(raw).ok())
                };
                self.store_object(key, data.freeze())
            }
            _ => ApiResponse::new(404, r#"{"error":"no such endpoint"}"#),
        }
    }
}

#[async_trait]
impl RequestTransport for FakeObjectService {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let is_block = is_block_request(&request);
        if is_block {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        }
        self.requests.lock().push(request.url.clone());

        let fault = self.take_fault(&request);
        let result = match fault {
            Some(FaultAction::Status(status)) => Ok(ApiResponse::new(status, r#"{"error":"injected"}"#)),
            Some(FaultAction::Network) => Err(TransportError::network("connection reset")),
            Some(FaultAction::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(self.handle(&request, false))
            }
            Some(FaultAction::CorruptChecksum) => Ok(self.handle(&request, true)),
            None => Ok(self.handle(&request, false)),
        };

        if is_block {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        self.finished.fetch_add(1, Ordering::SeqCst);
        result
    }
}

fn is_block_request(request: &ApiRequest) -> bool {
    matches!(request.method, Method::Put) || request.url.contains("/mkblk/") || request.url.contains("/bput/")
}

/// Token scoped to [`BUCKET`], valid for an hour
pub fn up_token() -> UpToken {
    let policy = json!({"scope": BUCKET, "deadline": chrono::Utc::now().timestamp() + 3600});
    UpToken::parse(format!("test-ak:test-sig:{}", URL_SAFE.encode(policy.to_string()))).unwrap()
}

/// `len` bytes where every byte encodes its chunk index, so chunks are distinguishable
pub fn patterned(len: usize, chunk_size: usize) -> Vec<u8> {
    (0..len)
        .map(|i| ((i / chunk_size) as u8).wrapping_mul(31).wrapping_add((i % 251) as u8))
        .collect()
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Matches block requests whose body starts with the first bytes of `chunk`
pub fn body_starts_with(chunk: &[u8]) -> impl Fn(&ApiRequest) -> bool + Send + Sync + 'static {
    let prefix = chunk[..chunk.len().min(16)].to_vec();
    move |request: &ApiRequest| !request.body.is_empty() && request.body.starts_with(&prefix)
}
