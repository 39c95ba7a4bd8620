//! S3-compatible HTTP backend.
//!
//! Speaks the S3 REST dialect with path-style addressing, plus the OSS
//! extensions for append-at-offset. Requests are signed with AWS Signature
//! V4 by hand over reqwest; anonymous clients send them unsigned.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, Response};
use sha2::{Digest, Sha256};
use tracing::debug;

use ossfs_common::backend::{
    BackendError, BucketInfo, ListPage, ObjectBackend, ObjectMeta, ObjectSummary, PartInfo,
};

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone, Default)]
pub struct S3Config {
    /// Service endpoint, e.g. `https://oss-cn-hangzhou.aliyuncs.com`.
    pub endpoint: Option<String>,
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Temporary-credential token, sent as `x-amz-security-token`.
    pub security_token: Option<String>,
    pub connect_timeout: Option<Duration>,
}

impl std::fmt::Debug for S3Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Config")
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("access_key_id", &self.access_key_id)
            .field("anonymous", &self.is_anonymous())
            .finish()
    }
}

impl S3Config {
    fn is_anonymous(&self) -> bool {
        self.access_key_id.is_none() || self.secret_access_key.is_none()
    }
}

pub struct S3Backend {
    config: S3Config,
    endpoint: RwLock<Option<String>>,
    client: Client,
}

/// One request before signing.
struct S3Request<'a> {
    method: Method,
    bucket: &'a str,
    key: &'a str,
    query: Vec<(&'static str, String)>,
    headers: BTreeMap<String, String>,
    body: Bytes,
}

impl<'a> S3Request<'a> {
    fn new(method: Method, bucket: &'a str, key: &'a str) -> Self {
        Self {
            method,
            bucket,
            key,
            query: Vec::new(),
            headers: BTreeMap::new(),
            body: Bytes::new(),
        }
    }

    fn query(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.query.push((name, value.into()));
        self
    }

    fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    fn body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }
}

impl S3Backend {
    pub fn new(config: S3Config) -> Result<Self, BackendError> {
        let mut builder = Client::builder();
        if let Some(timeout) = config.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| BackendError::Client(format!("failed to build HTTP client: {}", e)))?;
        let endpoint = config.endpoint.as_deref().map(normalize_endpoint);
        Ok(Self {
            config,
            endpoint: RwLock::new(endpoint),
            client,
        })
    }

    fn endpoint(&self) -> Result<String, BackendError> {
        self.endpoint
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| BackendError::Client("no endpoint configured".into()))
    }

    async fn send(&self, req: S3Request<'_>) -> Result<Response, BackendError> {
        let endpoint = self.endpoint()?;
        let now = Utc::now();
        let date_time = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();

        let uri = canonical_uri(req.bucket, req.key);
        let query = canonical_query(&req.query);
        let payload_hash = body_hash(&req.body);

        let mut headers = req.headers;
        headers.insert("host".to_string(), url_host(&endpoint));
        headers.insert("x-amz-content-sha256".to_string(), payload_hash.clone());
        headers.insert("x-amz-date".to_string(), date_time.clone());
        if let Some(token) = &self.config.security_token {
            headers.insert("x-amz-security-token".to_string(), token.clone());
        }

        let authorization = match (&self.config.access_key_id, &self.config.secret_access_key) {
            (Some(access_key), Some(secret)) => Some(sign(
                &SigningInput {
                    method: req.method.as_str(),
                    uri: &uri,
                    query: &query,
                    headers: &headers,
                    payload_hash: &payload_hash,
                    date_time: &date_time,
                    date: &date,
                },
                access_key,
                secret,
                &self.config.region,
            )),
            _ => None,
        };

        let mut url = format!("{}{}", endpoint.trim_end_matches('/'), uri);
        if !query.is_empty() {
            url.push('?');
            url.push_str(&query);
        }

        let mut builder = self.client.request(req.method.clone(), &url);
        for (name, value) in headers.iter().filter(|(name, _)| name.as_str() != "host") {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(auth) = authorization {
            builder = builder.header("authorization", auth);
        }

        debug!(method = %req.method, bucket = %req.bucket, key = %req.key, "S3 request");
        let resp = builder
            .body(req.body)
            .send()
            .await
            .map_err(|e| BackendError::Request(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(service_error(status.as_u16(), &body))
    }

    async fn send_text(&self, req: S3Request<'_>) -> Result<String, BackendError> {
        let resp = self.send(req).await?;
        resp.text()
            .await
            .map_err(|e| BackendError::Request(format!("failed to read response body: {}", e)))
    }
}

fn service_error(status: u16, body: &str) -> BackendError {
    BackendError::Service {
        status,
        code: extract_tag(body, "Code").unwrap_or_default(),
        message: extract_tag(body, "Message").unwrap_or_default(),
    }
}

/// Give a bodiless 404 (HEAD responses) the code a GET would have carried.
fn with_missing_code(err: BackendError, code: &str) -> BackendError {
    match err {
        BackendError::Service { status: 404, code: c, message } if c.is_empty() => BackendError::Service {
            status: 404,
            code: code.to_string(),
            message,
        },
        other => other,
    }
}

fn normalize_endpoint(endpoint: &str) -> String {
    let endpoint = endpoint.trim_end_matches('/');
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("https://{}", endpoint)
    }
}

/// Path-style URI: `/bucket/key` with each key segment URI-encoded.
fn canonical_uri(bucket: &str, key: &str) -> String {
    if bucket.is_empty() {
        return "/".to_string();
    }
    let mut uri = format!("/{}", urlencoding::encode(bucket));
    if !key.is_empty() {
        uri.push('/');
        let encoded: Vec<_> = key.split('/').map(|seg| urlencoding::encode(seg).into_owned()).collect();
        uri.push_str(&encoded.join("/"));
    }
    uri
}

/// Sorted, encoded query string used both on the wire and in the signature.
fn canonical_query(params: &[(&str, String)]) -> String {
    let mut pairs: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (urlencoding::encode(k).into_owned(), urlencoding::encode(v).into_owned()))
        .collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

struct SigningInput<'a> {
    method: &'a str,
    uri: &'a str,
    query: &'a str,
    headers: &'a BTreeMap<String, String>,
    payload_hash: &'a str,
    date_time: &'a str,
    date: &'a str,
}

/// AWS Signature V4 `Authorization` header value.
fn sign(input: &SigningInput<'_>, access_key: &str, secret: &str, region: &str) -> String {
    let canonical_headers: String = input
        .headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
        .collect();
    let signed_headers = input.headers.keys().cloned().collect::<Vec<_>>().join(";");

    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        input.method, input.uri, input.query, canonical_headers, signed_headers, input.payload_hash
    );

    let credential_scope = format!("{}/{}/s3/aws4_request", input.date, region);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        input.date_time,
        credential_scope,
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let signing_key = derive_signing_key(secret, input.date, region);
    let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

    format!(
        "AWS4-HMAC-SHA256 Credential={}/{},SignedHeaders={},Signature={}",
        access_key, credential_scope, signed_headers, signature
    )
}

fn derive_signing_key(secret: &str, date: &str, region: &str) -> Vec<u8> {
    let key = format!("AWS4{}", secret);
    let k_date = hmac_sha256(key.as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, b"s3");
    hmac_sha256(&k_service, b"aws4_request")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC key length ok");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn body_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Host (and port) part of a URL, as sent in the `host` header.
fn url_host(url: &str) -> String {
    let without_scheme = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    without_scheme.split('/').next().unwrap_or(without_scheme).to_string()
}

fn header_str(resp: &Response, name: &str) -> Option<String> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn trim_etag(etag: &str) -> String {
    etag.trim_matches('"').to_string()
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn xml_unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Text of the first `<tag>` element, unescaped.
fn extract_tag(xml: &str, tag: &str) -> Option<String> {
    let re = regex::Regex::new(&format!(r"<{tag}(?:\s[^>]*)?>([^<]*)</{tag}>")).ok()?;
    re.captures(xml)
        .and_then(|cap| cap.get(1))
        .map(|m| xml_unescape(m.as_str().trim()))
}

/// Inner text of every `<tag>...</tag>` block.
fn blocks<'x>(xml: &'x str, tag: &str) -> Vec<&'x str> {
    let Ok(re) = regex::Regex::new(&format!(r"(?s)<{tag}>(.*?)</{tag}>")) else {
        return Vec::new();
    };
    re.captures_iter(xml)
        .filter_map(|cap| cap.get(1))
        .map(|m| m.as_str())
        .collect()
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .or_else(|_| DateTime::parse_from_rfc2822(value))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_list_buckets(xml: &str) -> Vec<BucketInfo> {
    blocks(xml, "Bucket")
        .into_iter()
        .filter_map(|block| {
            Some(BucketInfo {
                name: extract_tag(block, "Name")?,
                creation_date: extract_tag(block, "CreationDate").as_deref().and_then(parse_timestamp),
            })
        })
        .collect()
}

fn parse_list_objects(xml: &str) -> ListPage {
    let objects = blocks(xml, "Contents")
        .into_iter()
        .filter_map(|block| {
            Some(ObjectSummary {
                key: extract_tag(block, "Key")?,
                size: extract_tag(block, "Size").and_then(|s| s.parse().ok()).unwrap_or(0),
                last_modified: extract_tag(block, "LastModified").as_deref().and_then(parse_timestamp),
                etag: extract_tag(block, "ETag").map(|e| trim_etag(&e)),
            })
        })
        .collect();
    let common_prefixes = blocks(xml, "CommonPrefixes")
        .into_iter()
        .filter_map(|block| extract_tag(block, "Prefix"))
        .collect();
    let truncated = extract_tag(xml, "IsTruncated").is_some_and(|t| t == "true");
    let next_token = if truncated {
        extract_tag(xml, "NextContinuationToken").filter(|t| !t.is_empty())
    } else {
        None
    };
    ListPage {
        objects,
        common_prefixes,
        next_token,
    }
}

fn complete_multipart_body(parts: &[PartInfo]) -> String {
    let mut xml = String::from("<CompleteMultipartUpload>");
    for part in parts {
        xml.push_str(&format!(
            "<Part><PartNumber>{}</PartNumber><ETag>\"{}\"</ETag></Part>",
            part.part_number,
            xml_escape(&part.etag)
        ));
    }
    xml.push_str("</CompleteMultipartUpload>");
    xml
}

fn delete_objects_body(keys: &[String]) -> String {
    let mut xml = String::from("<Delete><Quiet>true</Quiet>");
    for key in keys {
        xml.push_str(&format!("<Object><Key>{}</Key></Object>", xml_escape(key)));
    }
    xml.push_str("</Delete>");
    xml
}

/// Quiet-mode batch deletes answer 200 and list only the keys that failed.
/// The first failure becomes the call's error; a retryable code keeps the
/// batch retryable.
fn batch_delete_failure(reply: &str) -> Option<BackendError> {
    let failed: Vec<&str> = blocks(reply, "Error")
        .into_iter()
        .filter(|block| extract_tag(block, "Code").as_deref() != Some("NoSuchKey"))
        .collect();
    let first = failed.first()?;
    let code = extract_tag(first, "Code").unwrap_or_default();
    let key = extract_tag(first, "Key").unwrap_or_default();
    let status = match code.as_str() {
        "AccessDenied" => 403,
        "NoSuchBucket" => 404,
        "InternalError" | "ServiceUnavailable" | "SlowDown" => 503,
        _ => 500,
    };
    Some(BackendError::Service {
        status,
        code,
        message: format!(
            "{} of the batch failed to delete, first {}: {}",
            failed.len(),
            key,
            extract_tag(first, "Message").unwrap_or_default()
        ),
    })
}

fn sha256_base64(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(Sha256::digest(data))
}

#[async_trait]
impl ObjectBackend for S3Backend {
    fn set_endpoint(&self, endpoint: &str) {
        *self.endpoint.write().unwrap_or_else(PoisonError::into_inner) = Some(normalize_endpoint(endpoint));
    }

    fn is_anonymous(&self) -> bool {
        self.config.is_anonymous()
    }

    async fn list_buckets(&self) -> Result<Vec<BucketInfo>, BackendError> {
        let body = self.send_text(S3Request::new(Method::GET, "", "")).await?;
        Ok(parse_list_buckets(&body))
    }

    async fn bucket_info(&self, bucket: &str) -> Result<BucketInfo, BackendError> {
        self.send(S3Request::new(Method::HEAD, bucket, ""))
            .await
            .map_err(|e| with_missing_code(e, "NoSuchBucket"))?;
        Ok(BucketInfo {
            name: bucket.to_string(),
            creation_date: None,
        })
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: &str,
        continuation: Option<&str>,
        max_keys: usize,
    ) -> Result<ListPage, BackendError> {
        let mut req = S3Request::new(Method::GET, bucket, "")
            .query("list-type", "2")
            .query("prefix", prefix);
        if !delimiter.is_empty() {
            req = req.query("delimiter", delimiter);
        }
        if max_keys > 0 {
            req = req.query("max-keys", max_keys.to_string());
        }
        if let Some(token) = continuation {
            req = req.query("continuation-token", token);
        }
        let body = self.send_text(req).await?;
        Ok(parse_list_objects(&body))
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMeta, BackendError> {
        let resp = self
            .send(S3Request::new(Method::HEAD, bucket, key))
            .await
            .map_err(|e| with_missing_code(e, "NoSuchKey"))?;
        Ok(ObjectMeta {
            size: header_str(&resp, "content-length")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            last_modified: header_str(&resp, "last-modified").as_deref().and_then(parse_timestamp),
            etag: header_str(&resp, "etag").map(|e| trim_etag(&e)),
            appendable: header_str(&resp, "x-oss-object-type").is_some_and(|t| t == "Appendable"),
        })
    }

    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<Range<u64>>,
    ) -> Result<Bytes, BackendError> {
        let mut req = S3Request::new(Method::GET, bucket, key);
        if let Some(r) = &range {
            if r.end <= r.start {
                return Ok(Bytes::new());
            }
            req = req
                .header("range", format!("bytes={}-{}", r.start, r.end - 1))
                .header("x-oss-range-behavior", "standard");
        }
        let resp = self.send(req).await?;
        resp.bytes()
            .await
            .map_err(|e| BackendError::Request(format!("failed to read object body: {}", e)))
    }

    async fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> Result<String, BackendError> {
        let len = data.len();
        let resp = self
            .send(
                S3Request::new(Method::PUT, bucket, key)
                    .header("content-type", "application/octet-stream")
                    .body(data),
            )
            .await?;
        debug!(bucket = %bucket, key = %key, bytes = len, "S3 put complete");
        Ok(header_str(&resp, "etag").map(|e| trim_etag(&e)).unwrap_or_default())
    }

    async fn append_object(
        &self,
        bucket: &str,
        key: &str,
        position: u64,
        data: Bytes,
    ) -> Result<u64, BackendError> {
        let expected = position + data.len() as u64;
        let resp = self
            .send(
                S3Request::new(Method::POST, bucket, key)
                    .query("append", "")
                    .query("position", position.to_string())
                    .body(data),
            )
            .await?;
        Ok(header_str(&resp, "x-oss-next-append-position")
            .and_then(|v| v.parse().ok())
            .unwrap_or(expected))
    }

    async fn init_multipart(&self, bucket: &str, key: &str) -> Result<String, BackendError> {
        let body = self
            .send_text(S3Request::new(Method::POST, bucket, key).query("uploads", ""))
            .await?;
        extract_tag(&body, "UploadId")
            .ok_or_else(|| BackendError::service(500, "MalformedResponse", "missing UploadId"))
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<PartInfo, BackendError> {
        let size = data.len() as u64;
        let checksum = body_hash(&data);
        let resp = self
            .send(
                S3Request::new(Method::PUT, bucket, key)
                    .query("partNumber", part_number.to_string())
                    .query("uploadId", upload_id)
                    .header("x-amz-checksum-sha256", sha256_base64(&data))
                    .body(data),
            )
            .await?;
        Ok(PartInfo {
            part_number,
            etag: header_str(&resp, "etag").map(|e| trim_etag(&e)).unwrap_or_default(),
            size,
            checksum,
        })
    }

    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[PartInfo],
    ) -> Result<(), BackendError> {
        let body = self
            .send_text(
                S3Request::new(Method::POST, bucket, key)
                    .query("uploadId", upload_id)
                    .header("content-type", "application/xml")
                    .body(Bytes::from(complete_multipart_body(parts))),
            )
            .await?;
        // Completion can fail after a 200 status line.
        if body.contains("<Error>") {
            return Err(service_error(500, &body));
        }
        debug!(bucket = %bucket, key = %key, parts = parts.len(), "Multipart upload complete");
        Ok(())
    }

    async fn abort_multipart(&self, bucket: &str, key: &str, upload_id: &str) -> Result<(), BackendError> {
        self.send(S3Request::new(Method::DELETE, bucket, key).query("uploadId", upload_id))
            .await?;
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), BackendError> {
        match self.send(S3Request::new(Method::DELETE, bucket, key)).await {
            Ok(_) => Ok(()),
            Err(BackendError::Service { status: 404, code, .. }) if code != "NoSuchBucket" => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<(), BackendError> {
        let body = delete_objects_body(keys);
        let checksum = sha256_base64(body.as_bytes());
        let reply = self
            .send_text(
                S3Request::new(Method::POST, bucket, "")
                    .query("delete", "")
                    .header("content-type", "application/xml")
                    .header("x-amz-checksum-sha256", checksum)
                    .body(Bytes::from(body)),
            )
            .await?;
        if let Some(err) = batch_delete_failure(&reply) {
            return Err(err);
        }
        debug!(bucket = %bucket, keys = keys.len(), "Batch delete complete");
        Ok(())
    }

    async fn copy_object(&self, bucket: &str, src_key: &str, dst_key: &str) -> Result<(), BackendError> {
        let body = self
            .send_text(
                S3Request::new(Method::PUT, bucket, dst_key)
                    .header("x-amz-copy-source", canonical_uri(bucket, src_key)),
            )
            .await?;
        if body.contains("<Error>") {
            return Err(service_error(500, &body));
        }
        Ok(())
    }
}
