//! In-process object store.
//!
//! Mirrors the service semantics the filesystem layer depends on: paged
//! prefix/delimiter listings, appendable vs. normal objects, multipart
//! sessions, quiet batch delete, and server-side copy. Faults can be queued
//! per operation and every call is counted, which is what the test-suite
//! uses to observe caching, batching, and retry behavior.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::{Bound, Range};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::debug;

use ossfs_common::backend::{
    BackendError, BucketInfo, ListPage, ObjectBackend, ObjectMeta, ObjectSummary, PartInfo,
};

const DEFAULT_PAGE_SIZE: usize = 1000;

/// Backend operations, for fault injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ListBuckets,
    BucketInfo,
    ListObjects,
    HeadObject,
    GetObject,
    PutObject,
    AppendObject,
    InitMultipart,
    UploadPart,
    CompleteMultipart,
    AbortMultipart,
    DeleteObject,
    DeleteObjects,
    CopyObject,
}

struct StoredObject {
    data: Bytes,
    modified: DateTime<Utc>,
    etag: String,
    appendable: bool,
}

impl StoredObject {
    fn new(data: Bytes, appendable: bool) -> Self {
        Self {
            etag: etag_of(&data),
            data,
            modified: Utc::now(),
            appendable,
        }
    }
}

struct MemoryBucket {
    created: DateTime<Utc>,
    objects: BTreeMap<String, StoredObject>,
}

struct PendingUpload {
    bucket: String,
    key: String,
    parts: BTreeMap<u32, (Bytes, String)>,
}

#[derive(Default)]
struct MemoryState {
    endpoint: Option<String>,
    buckets: BTreeMap<String, MemoryBucket>,
    uploads: HashMap<String, PendingUpload>,
    faults: HashMap<Operation, VecDeque<BackendError>>,
    delays: HashMap<Operation, VecDeque<Duration>>,
    calls: HashMap<Operation, usize>,
}

impl MemoryState {
    /// Count the call and surface a queued fault, if any.
    fn enter(&mut self, op: Operation) -> Result<(), BackendError> {
        *self.calls.entry(op).or_insert(0) += 1;
        match self.faults.get_mut(&op).and_then(|queue| queue.pop_front()) {
            Some(err) => {
                debug!(?op, error = %err, "Injected backend fault");
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn bucket(&self, name: &str) -> Result<&MemoryBucket, BackendError> {
        self.buckets.get(name).ok_or_else(|| no_such_bucket(name))
    }

    fn bucket_mut(&mut self, name: &str) -> Result<&mut MemoryBucket, BackendError> {
        self.buckets.get_mut(name).ok_or_else(|| no_such_bucket(name))
    }
}

pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    anonymous: bool,
    append: bool,
    page_size: usize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            anonymous: false,
            append: true,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Behave like a client without credentials.
    pub fn anonymous(mut self) -> Self {
        self.anonymous = true;
        self
    }

    /// Behave like a service without append-at-offset.
    pub fn without_append(mut self) -> Self {
        self.append = false;
        self
    }

    /// Cap listing pages below the service default of 1000 keys.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_bucket(self, name: &str) -> Self {
        self.create_bucket(name);
        self
    }

    pub fn create_bucket(&self, name: &str) {
        self.lock().buckets.entry(name.to_string()).or_insert_with(|| MemoryBucket {
            created: Utc::now(),
            objects: BTreeMap::new(),
        });
    }

    /// Queue `count` failures for the next calls of `op`.
    pub fn fail_next(&self, op: Operation, count: usize, err: BackendError) {
        let mut state = self.lock();
        let queue = state.faults.entry(op).or_default();
        for _ in 0..count {
            queue.push_back(err.clone());
        }
    }

    /// Stall the next `count` calls of `op` for `delay` before they run.
    pub fn delay_next(&self, op: Operation, count: usize, delay: Duration) {
        let mut state = self.lock();
        let queue = state.delays.entry(op).or_default();
        for _ in 0..count {
            queue.push_back(delay);
        }
    }

    pub fn clear_faults(&self) {
        let mut state = self.lock();
        state.faults.clear();
        state.delays.clear();
    }

    async fn pause(&self, op: Operation) {
        let delay = self.lock().delays.get_mut(&op).and_then(|queue| queue.pop_front());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    /// Number of calls of `op` since creation or the last reset.
    pub fn calls(&self, op: Operation) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn reset_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn endpoint(&self) -> Option<String> {
        self.lock().endpoint.clone()
    }

    /// Read an object directly, bypassing fault injection and counters.
    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        let state = self.lock();
        state
            .buckets
            .get(bucket)
            .and_then(|b| b.objects.get(key))
            .map(|o| o.data.clone())
    }

    pub fn object_count(&self, bucket: &str) -> usize {
        self.lock().buckets.get(bucket).map_or(0, |b| b.objects.len())
    }

    /// Multipart sessions that were started and neither completed nor aborted.
    pub fn pending_uploads(&self) -> usize {
        self.lock().uploads.len()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn etag_of(data: &[u8]) -> String {
    let digest = hex::encode(Sha256::digest(data));
    digest[..32].to_string()
}

fn no_such_bucket(name: &str) -> BackendError {
    BackendError::service(404, "NoSuchBucket", format!("The specified bucket does not exist: {}", name))
}

fn no_such_key(key: &str) -> BackendError {
    BackendError::service(404, "NoSuchKey", format!("The specified key does not exist: {}", key))
}

fn no_such_upload(upload_id: &str) -> BackendError {
    BackendError::service(404, "NoSuchUpload", format!("The specified upload does not exist: {}", upload_id))
}

/// Continuation tokens carry whether the last emitted item was a grouped
/// prefix (`P`) or a key (`K`), since both may end with the delimiter.
fn encode_token(is_prefix: bool, value: &str) -> String {
    format!("{}{}", if is_prefix { 'P' } else { 'K' }, value)
}

fn decode_token(token: &str) -> Option<(bool, &str)> {
    let mut chars = token.chars();
    match chars.next() {
        Some('P') => Some((true, chars.as_str())),
        Some('K') => Some((false, chars.as_str())),
        _ => None,
    }
}

#[async_trait]
impl ObjectBackend for MemoryBackend {
    fn set_endpoint(&self, endpoint: &str) {
        self.lock().endpoint = Some(endpoint.to_string());
    }

    fn is_anonymous(&self) -> bool {
        self.anonymous
    }

    fn supports_append(&self) -> bool {
        self.append
    }

    async fn list_buckets(&self) -> Result<Vec<BucketInfo>, BackendError> {
        self.pause(Operation::ListBuckets).await;
        let mut state = self.lock();
        state.enter(Operation::ListBuckets)?;
        if self.anonymous {
            return Err(BackendError::service(403, "AccessDenied", "anonymous access"));
        }
        Ok(state
            .buckets
            .iter()
            .map(|(name, b)| BucketInfo {
                name: name.clone(),
                creation_date: Some(b.created),
            })
            .collect())
    }

    async fn bucket_info(&self, bucket: &str) -> Result<BucketInfo, BackendError> {
        self.pause(Operation::BucketInfo).await;
        let mut state = self.lock();
        state.enter(Operation::BucketInfo)?;
        let b = state.bucket(bucket)?;
        Ok(BucketInfo {
            name: bucket.to_string(),
            creation_date: Some(b.created),
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
        self.pause(Operation::ListObjects).await;
        let mut state = self.lock();
        state.enter(Operation::ListObjects)?;
        let b = state.bucket(bucket)?;
        let max_keys = if max_keys == 0 { self.page_size } else { max_keys.min(self.page_size) };

        let mut skip_under: Option<String> = None;
        let start = match continuation.map(decode_token) {
            Some(Some((is_prefix, value))) => {
                if is_prefix {
                    skip_under = Some(value.to_string());
                }
                Bound::Excluded(value.to_string())
            }
            Some(None) => {
                return Err(BackendError::service(400, "InvalidArgument", "malformed continuation token"));
            }
            None => Bound::Included(prefix.to_string()),
        };

        let mut page = ListPage::default();
        let mut emitted = 0;
        let mut last: Option<(bool, String)> = None;
        for (key, obj) in b.objects.range::<String, _>((start, Bound::Unbounded)) {
            if !key.starts_with(prefix) {
                break;
            }
            if let Some(group) = &skip_under {
                if key.starts_with(group.as_str()) {
                    continue;
                }
            }
            let rest = &key[prefix.len()..];
            let group = if delimiter.is_empty() {
                None
            } else {
                rest.find(delimiter)
                    .map(|idx| format!("{}{}", prefix, &rest[..idx + delimiter.len()]))
            };
            if emitted == max_keys {
                page.next_token = last.as_ref().map(|(p, v)| encode_token(*p, v));
                break;
            }
            match group {
                Some(group) => {
                    page.common_prefixes.push(group.clone());
                    skip_under = Some(group.clone());
                    last = Some((true, group));
                }
                None => {
                    page.objects.push(ObjectSummary {
                        key: key.clone(),
                        size: obj.data.len() as u64,
                        last_modified: Some(obj.modified),
                        etag: Some(obj.etag.clone()),
                    });
                    last = Some((false, key.clone()));
                }
            }
            emitted += 1;
        }
        Ok(page)
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMeta, BackendError> {
        self.pause(Operation::HeadObject).await;
        let mut state = self.lock();
        state.enter(Operation::HeadObject)?;
        let obj = state.bucket(bucket)?.objects.get(key).ok_or_else(|| no_such_key(key))?;
        Ok(ObjectMeta {
            size: obj.data.len() as u64,
            last_modified: Some(obj.modified),
            etag: Some(obj.etag.clone()),
            appendable: obj.appendable,
        })
    }

    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<Range<u64>>,
    ) -> Result<Bytes, BackendError> {
        self.pause(Operation::GetObject).await;
        let mut state = self.lock();
        state.enter(Operation::GetObject)?;
        let obj = state.bucket(bucket)?.objects.get(key).ok_or_else(|| no_such_key(key))?;
        let len = obj.data.len() as u64;
        match range {
            None => Ok(obj.data.clone()),
            Some(r) if r.start >= len && !(r.start == 0 && len == 0) => Err(BackendError::service(
                416,
                "InvalidRange",
                format!("range start {} beyond object size {}", r.start, len),
            )),
            Some(r) => {
                let end = r.end.min(len).max(r.start);
                Ok(obj.data.slice(r.start as usize..end as usize))
            }
        }
    }

    async fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> Result<String, BackendError> {
        self.pause(Operation::PutObject).await;
        let mut state = self.lock();
        state.enter(Operation::PutObject)?;
        let obj = StoredObject::new(data, false);
        let etag = obj.etag.clone();
        state.bucket_mut(bucket)?.objects.insert(key.to_string(), obj);
        Ok(etag)
    }

    async fn append_object(
        &self,
        bucket: &str,
        key: &str,
        position: u64,
        data: Bytes,
    ) -> Result<u64, BackendError> {
        self.pause(Operation::AppendObject).await;
        let mut state = self.lock();
        state.enter(Operation::AppendObject)?;
        if !self.append {
            return Err(BackendError::service(501, "NotImplemented", "append is not supported"));
        }
        let b = state.bucket_mut(bucket)?;
        match b.objects.get_mut(key) {
            Some(obj) => {
                if !obj.appendable {
                    return Err(BackendError::service(409, "ObjectNotAppendable", "the object is not appendable"));
                }
                if obj.data.len() as u64 != position {
                    return Err(BackendError::service(409, "PositionNotEqualToLength", "position mismatch"));
                }
                let mut merged = BytesMut::with_capacity(obj.data.len() + data.len());
                merged.extend_from_slice(&obj.data);
                merged.extend_from_slice(&data);
                *obj = StoredObject::new(merged.freeze(), true);
                Ok(obj.data.len() as u64)
            }
            None => {
                if position != 0 {
                    return Err(BackendError::service(409, "PositionNotEqualToLength", "position mismatch"));
                }
                let next = data.len() as u64;
                b.objects.insert(key.to_string(), StoredObject::new(data, true));
                Ok(next)
            }
        }
    }

    async fn init_multipart(&self, bucket: &str, key: &str) -> Result<String, BackendError> {
        self.pause(Operation::InitMultipart).await;
        let mut state = self.lock();
        state.enter(Operation::InitMultipart)?;
        state.bucket(bucket)?;
        let upload_id = uuid::Uuid::new_v4().simple().to_string();
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<PartInfo, BackendError> {
        self.pause(Operation::UploadPart).await;
        let mut state = self.lock();
        state.enter(Operation::UploadPart)?;
        let upload = state.uploads.get_mut(upload_id).ok_or_else(|| no_such_upload(upload_id))?;
        let etag = etag_of(&data);
        let info = PartInfo {
            part_number,
            etag: etag.clone(),
            size: data.len() as u64,
            checksum: hex::encode(Sha256::digest(&data)),
        };
        upload.parts.insert(part_number, (data, etag));
        Ok(info)
    }

    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[PartInfo],
    ) -> Result<(), BackendError> {
        self.pause(Operation::CompleteMultipart).await;
        let mut state = self.lock();
        state.enter(Operation::CompleteMultipart)?;
        let upload = state.uploads.get(upload_id).ok_or_else(|| no_such_upload(upload_id))?;
        if upload.bucket != bucket || upload.key != key {
            return Err(no_such_upload(upload_id));
        }
        if parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            return Err(BackendError::service(400, "InvalidPartOrder", "parts must be ascending"));
        }
        let mut assembled = BytesMut::new();
        for part in parts {
            match upload.parts.get(&part.part_number) {
                Some((data, etag)) if *etag == part.etag => assembled.extend_from_slice(data),
                _ => {
                    return Err(BackendError::service(
                        400,
                        "InvalidPart",
                        format!("part {} was not uploaded", part.part_number),
                    ))
                }
            }
        }
        state.uploads.remove(upload_id);
        state
            .bucket_mut(bucket)?
            .objects
            .insert(key.to_string(), StoredObject::new(assembled.freeze(), false));
        Ok(())
    }

    async fn abort_multipart(&self, _bucket: &str, _key: &str, upload_id: &str) -> Result<(), BackendError> {
        self.pause(Operation::AbortMultipart).await;
        let mut state = self.lock();
        state.enter(Operation::AbortMultipart)?;
        state
            .uploads
            .remove(upload_id)
            .map(|_| ())
            .ok_or_else(|| no_such_upload(upload_id))
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), BackendError> {
        self.pause(Operation::DeleteObject).await;
        let mut state = self.lock();
        state.enter(Operation::DeleteObject)?;
        state.bucket_mut(bucket)?.objects.remove(key);
        Ok(())
    }

    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<(), BackendError> {
        self.pause(Operation::DeleteObjects).await;
        let mut state = self.lock();
        state.enter(Operation::DeleteObjects)?;
        if keys.len() > 1000 {
            return Err(BackendError::service(400, "MalformedXML", "too many keys"));
        }
        let b = state.bucket_mut(bucket)?;
        for key in keys {
            b.objects.remove(key);
        }
        Ok(())
    }

    async fn copy_object(&self, bucket: &str, src_key: &str, dst_key: &str) -> Result<(), BackendError> {
        self.pause(Operation::CopyObject).await;
        let mut state = self.lock();
        state.enter(Operation::CopyObject)?;
        let b = state.bucket_mut(bucket)?;
        let data = b.objects.get(src_key).ok_or_else(|| no_such_key(src_key))?.data.clone();
        b.objects.insert(dst_key.to_string(), StoredObject::new(data, false));
        Ok(())
    }
}
