//! Whole-object and chunked transfers.

use std::ops::Range;
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use ossfs_common::backend::{BackendError, PartInfo};
use ossfs_common::chunking;
use ossfs_common::error::FsError;
use ossfs_common::path::{self, ResolvedLocation};

use crate::fs::{join_error, OssFileSystem};
use crate::traits::AsyncFileSystem;

/// Most parts a multipart session may hold.
const MAX_PARTS: u64 = 10_000;

/// Bytes an append at `at` took, from the next position the service reported.
fn appended_len(target: &str, at: u64, sent: u64) -> Result<usize, FsError> {
    match sent.checked_sub(at) {
        Some(n) if n > 0 => Ok(n as usize),
        _ => Err(FsError::Io {
            path: target.to_string(),
            source: BackendError::service(
                500,
                "",
                format!("append at {} reported next position {}", at, sent),
            ),
        }),
    }
}

pub(crate) fn object_location(target: &str) -> Result<ResolvedLocation, FsError> {
    let loc = path::resolve(target);
    if loc.key.is_empty() {
        return Err(FsError::InvalidArgument(format!("{} is not an object path", loc.to_path())));
    }
    Ok(loc)
}

impl OssFileSystem {
    /// Bytes of an object, or of the half-open `range` of it. A range
    /// starting at or past the end yields nothing.
    pub async fn cat_file(&self, target: &str, range: Option<Range<u64>>) -> Result<Bytes, FsError> {
        let loc = object_location(target)?;
        match range {
            None => {
                let backend = self.backend();
                let (container, key) = (loc.container.as_str(), loc.key.as_str());
                self.call("get_object", &loc.to_path(), |_| backend.get_object(container, key, None))
                    .await
            }
            Some(r) if r.start >= r.end => Ok(Bytes::new()),
            Some(r) => match self.read_range(&loc, r).await {
                Err(err) if is_invalid_range(&err) => Ok(Bytes::new()),
                other => other,
            },
        }
    }

    pub async fn cat(&self, target: &str) -> Result<Bytes, FsError> {
        self.cat_file(target, None).await
    }

    /// Replace the content of an object.
    ///
    /// Payloads below `min(5 GiB, 2 × block_size)` go out in one put; larger
    /// ones as a multipart upload of block-sized parts.
    pub async fn pipe(&self, target: &str, data: Bytes) -> Result<(), FsError> {
        let loc = object_location(target)?;
        let block_size = self.config().default_block_size;
        self.invalidate_cache(Some(&loc.to_path()));
        let result = if (data.len() as u64) < chunking::single_put_limit(block_size) {
            self.put_whole(&loc, data).await.map(|_| ())
        } else {
            let parts = chunking::part_ranges(data.len() as u64, block_size as u64);
            let upload_id = self.init_multipart(&loc).await?;
            let mut uploaded = Vec::with_capacity(parts.len());
            let mut failure = None;
            for (idx, range) in parts.into_iter().enumerate() {
                let chunk = data.slice(range.start as usize..range.end as usize);
                match self.upload_part(&loc, &upload_id, idx as u32 + 1, chunk).await {
                    Ok(part) => uploaded.push(part),
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }
            match failure {
                None => self.complete_multipart(&loc, &upload_id, &uploaded).await,
                Some(err) => {
                    self.abort_quietly(&loc, &upload_id).await;
                    Err(err)
                }
            }
        };
        self.invalidate_cache(Some(&loc.to_path()));
        result
    }

    /// Download one object to a local path. A remote directory becomes a
    /// local directory.
    pub async fn get_file(&self, remote: &str, local: &Path) -> Result<(), FsError> {
        if AsyncFileSystem::isdir(self, remote).await? {
            tokio::fs::create_dir_all(local).await?;
            return Ok(());
        }
        let loc = object_location(remote)?;
        let size = self.head(&loc).await?.size;
        if size < self.config().multipart_threshold {
            let data = self.cat_file(remote, None).await?;
            tokio::fs::write(local, &data).await?;
            debug!(path = %loc.to_path(), bytes = data.len(), "Downloaded object");
            return Ok(());
        }

        let mut file = tokio::fs::File::create(local).await?;
        file.set_len(size).await?;
        let part_size = self.config().default_block_size as u64;
        let limit = self.config().pool_size.max(1);
        let mut pending = chunking::part_ranges(size, part_size).into_iter();
        let mut tasks = JoinSet::new();
        loop {
            while tasks.len() < limit {
                let Some(range) = pending.next() else { break };
                let fs = self.clone();
                let loc = loc.clone();
                tasks.spawn(async move {
                    let start = range.start;
                    fs.read_range(&loc, range).await.map(|data| (start, data))
                });
            }
            let Some(joined) = tasks.join_next().await else { break };
            let (start, data) = joined.map_err(join_error)??;
            file.seek(std::io::SeekFrom::Start(start)).await?;
            file.write_all(&data).await?;
        }
        file.flush().await?;
        debug!(path = %loc.to_path(), bytes = size, "Downloaded object in ranges");
        Ok(())
    }

    /// Upload one local file. Local directories are skipped; the remote
    /// namespace has no directories to create.
    pub async fn put_file(&self, local: &Path, remote: &str) -> Result<(), FsError> {
        let meta = tokio::fs::metadata(local).await?;
        if meta.is_dir() {
            return Ok(());
        }
        let loc = object_location(remote)?;
        self.invalidate_cache(Some(&loc.to_path()));
        let result = if meta.len() < self.config().multipart_threshold {
            let data = tokio::fs::read(local).await?;
            self.put_whole(&loc, Bytes::from(data)).await.map(|_| ())
        } else {
            self.put_file_multipart(local, &loc, meta.len()).await
        };
        self.invalidate_cache(Some(&loc.to_path()));
        result
    }

    async fn put_file_multipart(&self, local: &Path, loc: &ResolvedLocation, len: u64) -> Result<(), FsError> {
        let block = self.config().default_block_size as u64;
        let part_size = block.max(len.div_ceil(MAX_PARTS));
        let upload_id = self.init_multipart(loc).await?;
        let result = async {
            let mut file = tokio::fs::File::open(local).await?;
            let mut parts = Vec::new();
            for (idx, range) in chunking::part_ranges(len, part_size).into_iter().enumerate() {
                let mut buf = vec![0u8; (range.end - range.start) as usize];
                file.read_exact(&mut buf).await?;
                parts.push(self.upload_part(loc, &upload_id, idx as u32 + 1, Bytes::from(buf)).await?);
            }
            self.complete_multipart(loc, &upload_id, &parts).await
        }
        .await;
        if result.is_err() {
            self.abort_quietly(loc, &upload_id).await;
        }
        result
    }

    /// Upload a local file, or with `recursive` a whole local tree, under `remote`.
    pub async fn put(&self, local: &Path, remote: &str, recursive: bool) -> Result<(), FsError> {
        let meta = tokio::fs::metadata(local).await?;
        if !meta.is_dir() {
            return self.put_file(local, remote).await;
        }
        if !recursive {
            return Err(FsError::InvalidArgument(format!(
                "{} is a directory; pass recursive to upload it",
                local.display()
            )));
        }
        let root = local.to_path_buf();
        let files = tokio::task::spawn_blocking(move || local_tree(&root))
            .await
            .map_err(join_error)??;
        let base = path::normalize(remote);
        for (file, rel) in files {
            self.put_file(&file, &format!("{}/{}", base, rel)).await?;
        }
        Ok(())
    }

    /// Download an object, or with `recursive` everything under a remote
    /// directory, to `local`.
    pub async fn get(&self, remote: &str, local: &Path, recursive: bool) -> Result<(), FsError> {
        if !recursive || !AsyncFileSystem::isdir(self, remote).await? {
            return self.get_file(remote, local).await;
        }
        let base = path::normalize(remote);
        let found = self.find(&base, &crate::bulk::FindOptions::default()).await?;
        tokio::fs::create_dir_all(local).await?;
        for name in found.keys() {
            let rel = name[base.len()..].trim_start_matches('/');
            let dest = local.join(rel);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            self.get_file(name, &dest).await?;
        }
        Ok(())
    }

    /// Read `range` from an object, following short responses until the end
    /// of the range or of the object. A transient failure retries with a
    /// halved request, down to 64 KiB.
    pub(crate) async fn read_range(&self, loc: &ResolvedLocation, range: Range<u64>) -> Result<Bytes, FsError> {
        let backend = self.backend();
        let (container, key) = (loc.container.as_str(), loc.key.as_str());
        let target = loc.to_path();
        let mut out = BytesMut::with_capacity((range.end - range.start) as usize);
        let mut pos = range.start;
        while pos < range.end {
            let remaining = (range.end - pos) as usize;
            let fetched = self
                .call("get_object", &target, |attempt| {
                    let len = chunking::shrink_for_attempt(remaining, attempt) as u64;
                    backend.get_object(container, key, Some(pos..pos + len))
                })
                .await;
            let chunk = match fetched {
                Ok(chunk) => chunk,
                // Ran past the end after a short read.
                Err(err) if pos > range.start && is_invalid_range(&err) => break,
                Err(err) => return Err(err),
            };
            if chunk.is_empty() {
                break;
            }
            pos += chunk.len() as u64;
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    /// Append `data` at `position`, returning the next append position. A
    /// transient failure retries with a halved chunk, down to 64 KiB.
    pub(crate) async fn append_chunk(&self, loc: &ResolvedLocation, position: u64, data: Bytes) -> Result<u64, FsError> {
        let backend = self.backend();
        let (container, key) = (loc.container.as_str(), loc.key.as_str());
        let target = loc.to_path();
        if data.is_empty() {
            return self
                .call("append_object", &target, |_| {
                    backend.append_object(container, key, position, Bytes::new())
                })
                .await;
        }
        let mut next = position;
        let mut rest = data;
        while !rest.is_empty() {
            let remaining = rest.clone();
            let at = next;
            let sent = self
                .call("append_object", &target, |attempt| {
                    let len = chunking::shrink_for_attempt(remaining.len(), attempt);
                    backend.append_object(container, key, at, remaining.slice(..len))
                })
                .await?;
            let shipped = appended_len(&target, at, sent)?;
            next = sent;
            rest = rest.slice(shipped.min(rest.len())..);
        }
        Ok(next)
    }

    pub(crate) async fn put_whole(&self, loc: &ResolvedLocation, data: Bytes) -> Result<String, FsError> {
        let backend = self.backend();
        let (container, key) = (loc.container.as_str(), loc.key.as_str());
        self.call("put_object", &loc.to_path(), |_| backend.put_object(container, key, data.clone()))
            .await
    }

    pub(crate) async fn init_multipart(&self, loc: &ResolvedLocation) -> Result<String, FsError> {
        let backend = self.backend();
        let (container, key) = (loc.container.as_str(), loc.key.as_str());
        let upload_id = self
            .call("init_multipart_upload", &loc.to_path(), |_| backend.init_multipart(container, key))
            .await?;
        debug!(path = %loc.to_path(), upload_id = %upload_id, "Started multipart upload");
        Ok(upload_id)
    }

    pub(crate) async fn upload_part(
        &self,
        loc: &ResolvedLocation,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<PartInfo, FsError> {
        let backend = self.backend();
        let (container, key) = (loc.container.as_str(), loc.key.as_str());
        self.call("upload_part", &loc.to_path(), |_| {
            backend.upload_part(container, key, upload_id, part_number, data.clone())
        })
        .await
    }

    pub(crate) async fn complete_multipart(
        &self,
        loc: &ResolvedLocation,
        upload_id: &str,
        parts: &[PartInfo],
    ) -> Result<(), FsError> {
        let backend = self.backend();
        let (container, key) = (loc.container.as_str(), loc.key.as_str());
        self.call("complete_multipart_upload", &loc.to_path(), |_| {
            backend.complete_multipart(container, key, upload_id, parts)
        })
        .await
    }

    pub(crate) async fn abort_multipart(&self, loc: &ResolvedLocation, upload_id: &str) -> Result<(), FsError> {
        let backend = self.backend();
        let (container, key) = (loc.container.as_str(), loc.key.as_str());
        self.call("abort_multipart_upload", &loc.to_path(), |_| {
            backend.abort_multipart(container, key, upload_id)
        })
        .await
    }

    async fn abort_quietly(&self, loc: &ResolvedLocation, upload_id: &str) {
        if let Err(err) = self.abort_multipart(loc, upload_id).await {
            warn!(path = %loc.to_path(), upload_id = %upload_id, error = %err, "Failed to abort multipart upload");
        }
    }
}

fn is_invalid_range(err: &FsError) -> bool {
    err.backend_source()
        .is_some_and(|e| e.status() == Some(416) || e.code() == Some("InvalidRange"))
}

/// Regular files under `root` with their `/`-joined relative paths, sorted.
fn local_tree(root: &Path) -> Result<Vec<(PathBuf, String)>, FsError> {
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| FsError::Local(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| FsError::InvalidArgument(e.to_string()))?;
        let rel = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        files.push((entry.path().to_path_buf(), rel));
    }
    Ok(files)
}
