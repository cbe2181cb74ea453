use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::Deserialize;

use crate::{UploadError, UploadResult};

#[derive(Debug, Clone, Deserialize)]
struct PutPolicy {
    scope: String,
    #[serde(default)]
    deadline: Option<i64>,
}

/// Upload authorization token of the shape `<access key>:<signature>:<base64 policy>`
///
/// Only the policy's `scope` and `deadline` are read. The token is attached verbatim to every
/// block request and is never verified here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpToken {
    raw: String,
    access_key: String,
    bucket: String,
    key: Option<String>,
    deadline: Option<i64>,
}

impl UpToken {
    pub fn parse(raw: impl Into<String>) -> UploadResult<Self> {
        let raw = raw.into();
        let mut parts = raw.splitn(3, ':');
        let (Some(access_key), Some(_signature), Some(encoded_policy)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(UploadError::token("expected <access key>:<signature>:<policy>"));
        };
        if access_key.is_empty() {
            return Err(UploadError::token("empty access key"));
        }

        let decoded = URL_SAFE
            .decode(encoded_policy)
            .or_else(|_| URL_SAFE_NO_PAD.decode(encoded_policy.trim_end_matches('=')))
            .map_err(|e| UploadError::token(format!("policy is not base64: {}", e)))?;
        let policy: PutPolicy = serde_json::from_slice(&decoded)
            .map_err(|e| UploadError::token(format!("policy is not valid JSON: {}", e)))?;

        let (bucket, key) = match policy.scope.split_once(':') {
            Some((bucket, key)) => (bucket.to_string(), Some(key.to_string())),
            None => (policy.scope.clone(), None),
        };
        if bucket.is_empty() {
            return Err(UploadError::token("policy scope has no bucket"));
        }

        Ok(Self {
            access_key: access_key.to_string(),
            raw,
            bucket,
            key,
            deadline: policy.deadline,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn access_key(&self) -> &str {
        &self.access_key
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Key fixed by the policy scope, if any
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// Unix seconds after which the token is rejected
    pub fn deadline(&self) -> Option<i64> {
        self.deadline
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        matches!(self.deadline, Some(deadline) if deadline <= now)
    }

    /// `Authorization` header value for block requests
    pub fn authorization(&self) -> String {
        format!("UpToken {}", self.raw)
    }
}

impl std::fmt::Display for UpToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// Maps an account and bucket to the endpoint that accepts block uploads
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, access_key: &str, bucket: &str) -> UploadResult<String>;
}

/// Fixed endpoint list, handed out round-robin
#[derive(Debug)]
pub struct StaticHosts {
    hosts: Vec<String>,
    next: AtomicUsize,
}

impl StaticHosts {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            hosts: hosts
                .into_iter()
                .map(|host| host.into().trim_end_matches('/').to_string())
                .collect(),
            next: AtomicUsize::new(0),
        }
    }

    pub fn single(host: impl Into<String>) -> Self {
        Self::new([host.into()])
    }
}

#[async_trait]
impl HostResolver for StaticHosts {
    async fn resolve(&self, _access_key: &str, bucket: &str) -> UploadResult<String> {
        if self.hosts.is_empty() {
            return Err(UploadError::invalid(format!("No upload host configured for bucket {}", bucket)));
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.hosts.len();
        Ok(self.hosts[index].clone())
    }
}
