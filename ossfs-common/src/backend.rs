//! Contract between the filesystem layer and an object-storage backend.
//!
//! Each backend handles the raw wire protocol for one kind of store (an
//! S3-compatible HTTP endpoint, an in-process map). The filesystem layer is
//! responsible for path translation, caching, retries, and error
//! translation; the adapter is responsible only for issuing single calls
//! and reporting what the service said.

use std::ops::Range;

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// Error reported by a backend adapter, before translation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// The service answered with an error document or status.
    #[error("{code} (HTTP {status}): {message}")]
    Service {
        status: u16,
        code: String,
        message: String,
    },
    /// The request never produced a response (connect failure, reset, timeout).
    #[error("request failed: {0}")]
    Request(String),
    /// The call was rejected before reaching the network.
    #[error("client error: {0}")]
    Client(String),
}

impl BackendError {
    pub fn service(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        BackendError::Service {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Service error code, if the service sent one.
    pub fn code(&self) -> Option<&str> {
        match self {
            BackendError::Service { code, .. } => Some(code),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            BackendError::Service { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Request(_) => true,
            BackendError::Service { status, code, .. } => {
                *status == 503 || code == "SlowDown" || code == "RequestTimeout"
            }
            BackendError::Client(_) => false,
        }
    }
}

/// A container as reported by the service listing.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketInfo {
    pub name: String,
    pub creation_date: Option<DateTime<Utc>>,
}

/// One object row of a listing page.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
}

/// A single page of a prefix/delimiter listing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListPage {
    pub objects: Vec<ObjectSummary>,
    /// Grouped prefixes, each ending with the delimiter.
    pub common_prefixes: Vec<String>,
    /// Token for the next page; `None` when the listing is complete.
    pub next_token: Option<String>,
}

/// Result of a head request on one object.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectMeta {
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
    /// Created through append-at-offset and may be appended to again.
    pub appendable: bool,
}

/// Descriptor of an uploaded multipart part, kept until completion.
#[derive(Debug, Clone, PartialEq)]
pub struct PartInfo {
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
    /// Hex sha256 of the part body.
    pub checksum: String,
}

#[async_trait::async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Point the adapter at a new service endpoint.
    fn set_endpoint(&self, endpoint: &str);

    /// Whether requests are sent without credentials.
    fn is_anonymous(&self) -> bool;

    /// Whether `append_object` is available.
    fn supports_append(&self) -> bool {
        true
    }

    async fn list_buckets(&self) -> Result<Vec<BucketInfo>, BackendError>;

    /// Probe a single container; fails with `NoSuchBucket` when absent.
    async fn bucket_info(&self, bucket: &str) -> Result<BucketInfo, BackendError>;

    /// One page of keys under `prefix`. An empty `delimiter` lists flat.
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: &str,
        continuation: Option<&str>,
        max_keys: usize,
    ) -> Result<ListPage, BackendError>;

    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMeta, BackendError>;

    /// Fetch an object, or the half-open byte `range` of it.
    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<Range<u64>>,
    ) -> Result<Bytes, BackendError>;

    /// Store a whole object. Returns the new etag.
    async fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> Result<String, BackendError>;

    /// Extend an appendable object at `position`. Returns the next append position.
    async fn append_object(
        &self,
        bucket: &str,
        key: &str,
        position: u64,
        data: Bytes,
    ) -> Result<u64, BackendError>;

    /// Start a multipart session. Returns the upload id.
    async fn init_multipart(&self, bucket: &str, key: &str) -> Result<String, BackendError>;

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<PartInfo, BackendError>;

    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[PartInfo],
    ) -> Result<(), BackendError>;

    async fn abort_multipart(&self, bucket: &str, key: &str, upload_id: &str) -> Result<(), BackendError>;

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), BackendError>;

    /// Remove many keys from one container in a single request.
    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<(), BackendError>;

    /// Server-side copy within one container.
    async fn copy_object(&self, bucket: &str, src_key: &str, dst_key: &str) -> Result<(), BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(BackendError::Request("reset".into()).is_transient());
        assert!(BackendError::service(503, "ServiceUnavailable", "busy").is_transient());
        assert!(BackendError::service(503, "SlowDown", "").is_transient());
        assert!(!BackendError::service(404, "NoSuchKey", "").is_transient());
        assert!(!BackendError::Client("endpoint is required".into()).is_transient());
    }

    #[test]
    fn test_code_accessor() {
        let err = BackendError::service(403, "AccessDenied", "nope");
        assert_eq!(err.code(), Some("AccessDenied"));
        assert_eq!(err.status(), Some(403));
        assert_eq!(BackendError::Request("x".into()).code(), None);
    }
}
