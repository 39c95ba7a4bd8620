//! Buffered file handles over single objects.

use std::io::SeekFrom;
use std::str::FromStr;

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use ossfs_common::backend::PartInfo;
use ossfs_common::chunking;
use ossfs_common::error::FsError;
use ossfs_common::path::ResolvedLocation;

use crate::config::{CacheType, UploadStrategy};
use crate::fs::OssFileSystem;
use crate::read_cache::ReadCache;
use crate::transfer::object_location;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    /// Replace the object.
    Write,
    /// Extend the object, creating it when missing.
    Append,
}

impl FromStr for OpenMode {
    type Err = FsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "r" | "rb" => Ok(OpenMode::Read),
            "w" | "wb" => Ok(OpenMode::Write),
            "a" | "ab" => Ok(OpenMode::Append),
            other => Err(FsError::InvalidArgument(format!("unsupported open mode {:?}", other))),
        }
    }
}

/// Per-handle settings; unset fields fall back to the filesystem config.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub mode: OpenMode,
    pub block_size: Option<usize>,
    pub cache_type: Option<CacheType>,
}

impl OpenOptions {
    pub fn new(mode: OpenMode) -> Self {
        Self {
            mode,
            block_size: None,
            cache_type: None,
        }
    }

    pub fn block_size(mut self, block_size: usize) -> Self {
        self.block_size = Some(block_size);
        self
    }

    pub fn cache_type(mut self, cache_type: CacheType) -> Self {
        self.cache_type = Some(cache_type);
        self
    }
}

#[derive(Debug)]
enum Upload {
    /// Append-at-offset; `position` is the next server-side offset.
    Append {
        position: u64,
        started: bool,
        truncate: bool,
    },
    Multipart {
        upload_id: Option<String>,
        parts: Vec<PartInfo>,
    },
}

/// An open object.
///
/// Read handles fetch lazily through a [`ReadCache`]. Write and append
/// handles buffer until a block is full, then ship it as an append or as a
/// multipart part; `close` ships the remainder and commits. A handle is
/// owned by one caller and is not internally synchronized.
pub struct OssFile {
    fs: OssFileSystem,
    loc: ResolvedLocation,
    mode: OpenMode,
    block_size: usize,
    /// Read cursor, or for writers the offset where buffered bytes begin
    /// plus the buffer length.
    pos: u64,
    /// Object size for readers.
    size: u64,
    cache: Option<ReadCache>,
    buffer: BytesMut,
    upload: Option<Upload>,
    closed: bool,
}

impl std::fmt::Debug for OssFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OssFile")
            .field("path", &self.loc.to_path())
            .field("mode", &self.mode)
            .field("pos", &self.pos)
            .field("closed", &self.closed)
            .finish()
    }
}

impl OssFileSystem {
    /// Open with a mode string: `r`, `w`, or `a`, optionally suffixed `b`.
    pub async fn open(&self, target: &str, mode: &str) -> Result<OssFile, FsError> {
        self.open_with(target, OpenOptions::new(mode.parse()?)).await
    }

    pub async fn open_with(&self, target: &str, opts: OpenOptions) -> Result<OssFile, FsError> {
        OssFile::open(self, target, opts).await
    }
}

impl OssFile {
    async fn open(fs: &OssFileSystem, target: &str, opts: OpenOptions) -> Result<Self, FsError> {
        let loc = object_location(target)?;
        let block_size = opts.block_size.unwrap_or(fs.config().default_block_size).max(1);
        let mut file = Self {
            fs: fs.clone(),
            loc,
            mode: opts.mode,
            block_size,
            pos: 0,
            size: 0,
            cache: None,
            buffer: BytesMut::new(),
            upload: None,
            closed: false,
        };
        match opts.mode {
            OpenMode::Read => {
                let meta = fs.head(&file.loc).await?;
                let policy = opts.cache_type.unwrap_or(fs.config().default_cache_type);
                file.size = meta.size;
                file.cache = Some(ReadCache::new(policy, block_size, meta.size));
            }
            OpenMode::Write => {
                fs.bucket_info(&file.loc.container).await?;
                file.upload = Some(if file.use_append() {
                    Upload::Append {
                        position: 0,
                        started: false,
                        truncate: true,
                    }
                } else {
                    Upload::Multipart {
                        upload_id: None,
                        parts: Vec::new(),
                    }
                });
            }
            OpenMode::Append => {
                fs.bucket_info(&file.loc.container).await?;
                let existing = match fs.head(&file.loc).await {
                    Ok(meta) => Some(meta),
                    Err(err) if err.is_not_found() => None,
                    Err(err) => return Err(err),
                };
                let use_append = file.use_append();
                file.upload = Some(match existing {
                    Some(meta) if meta.appendable && use_append => {
                        file.pos = meta.size;
                        Upload::Append {
                            position: meta.size,
                            started: true,
                            truncate: false,
                        }
                    }
                    Some(meta) => {
                        // Not appendable in place: rewrite existing content first.
                        let current = fs.cat_file(target, None).await?;
                        debug!(path = %file.loc.to_path(), bytes = meta.size, "Append rewrites existing object");
                        file.buffer.extend_from_slice(&current);
                        file.pos = current.len() as u64;
                        Upload::Multipart {
                            upload_id: None,
                            parts: Vec::new(),
                        }
                    }
                    None if use_append => Upload::Append {
                        position: 0,
                        started: false,
                        truncate: false,
                    },
                    None => Upload::Multipart {
                        upload_id: None,
                        parts: Vec::new(),
                    },
                });
                if file.buffer.len() >= file.block_size {
                    file.ship().await?;
                }
            }
        }
        debug!(path = %file.loc.to_path(), mode = ?file.mode, block_size, "Opened file");
        Ok(file)
    }

    fn use_append(&self) -> bool {
        self.fs.config().upload_strategy == UploadStrategy::Append && self.fs.backend().supports_append()
    }

    pub fn path(&self) -> String {
        self.loc.to_path()
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Object size for readers; bytes in the object once committed for writers.
    pub fn size(&self) -> u64 {
        match self.mode {
            OpenMode::Read => self.size,
            _ => self.pos,
        }
    }

    pub fn tell(&self) -> u64 {
        self.pos
    }

    /// Id of the multipart session in progress, if any.
    pub fn upload_id(&self) -> Option<&str> {
        match &self.upload {
            Some(Upload::Multipart {
                upload_id: Some(id), ..
            }) => Some(id),
            _ => None,
        }
    }

    fn check_open(&self) -> Result<(), FsError> {
        if self.closed {
            return Err(FsError::InvalidOperation(format!("{} is closed", self.loc.to_path())));
        }
        Ok(())
    }

    fn check_readable(&self) -> Result<(), FsError> {
        self.check_open()?;
        if self.mode != OpenMode::Read {
            return Err(FsError::InvalidOperation("file not in read mode".into()));
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<(), FsError> {
        self.check_open()?;
        if self.mode == OpenMode::Read {
            return Err(FsError::InvalidOperation("file not in write mode".into()));
        }
        Ok(())
    }

    /// Move the cursor. Writers may only "seek" to where they already are.
    pub fn seek(&mut self, to: SeekFrom) -> Result<u64, FsError> {
        self.check_open()?;
        let target = match to {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
            SeekFrom::End(delta) => self.size().checked_add_signed(delta),
        };
        let Some(target) = target else {
            return Err(FsError::InvalidArgument("seek before start of file".into()));
        };
        if self.mode != OpenMode::Read && target != self.pos {
            return Err(FsError::InvalidOperation("cannot seek a file opened for writing".into()));
        }
        self.pos = target;
        Ok(target)
    }

    /// Bytes `start..end` of the object, clamped to its size; empty when
    /// nothing of the span lies inside the object. Bypasses the read cache.
    pub async fn fetch_range(&self, start: u64, end: u64) -> Result<Bytes, FsError> {
        self.check_readable()?;
        match chunking::clamp_range(start, end, self.size) {
            Some(range) => self.fs.read_range(&self.loc, range).await,
            None => Ok(Bytes::new()),
        }
    }

    /// Up to `n` bytes from the cursor, or everything left with `None`.
    pub async fn read(&mut self, n: Option<usize>) -> Result<Bytes, FsError> {
        self.check_readable()?;
        let end = match n {
            Some(n) => self.pos.saturating_add(n as u64),
            None => self.size,
        };
        let Some(want) = chunking::clamp_range(self.pos, end, self.size) else {
            return Ok(Bytes::new());
        };
        let Some(cache) = self.cache.as_mut() else {
            return Err(FsError::InvalidOperation("file not in read mode".into()));
        };
        for span in cache.plan(&want) {
            let data = self.fs.read_range(&self.loc, span.clone()).await?;
            cache.fill(span.start, data);
        }
        let out = match cache.take(&want) {
            Some(data) => data,
            None => cache.take_partial(&want),
        };
        self.pos += out.len() as u64;
        Ok(out)
    }

    /// Read into `buf`, returning the count; 0 at end of file.
    pub async fn read_into(&mut self, buf: &mut [u8]) -> Result<usize, FsError> {
        let data = self.read(Some(buf.len())).await?;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<usize, FsError> {
        self.check_writable()?;
        self.buffer.extend_from_slice(data);
        self.pos += data.len() as u64;
        if self.buffer.len() >= self.block_size {
            self.ship().await?;
        }
        Ok(data.len())
    }

    /// Ship whatever can go out before close: the whole buffer for append
    /// uploads, full blocks for multipart.
    pub async fn flush(&mut self) -> Result<(), FsError> {
        if self.closed || self.mode == OpenMode::Read {
            return Ok(());
        }
        self.ship().await
    }

    async fn ship(&mut self) -> Result<(), FsError> {
        match self.upload {
            Some(Upload::Append { .. }) if !self.buffer.is_empty() => self.ship_append().await,
            Some(Upload::Multipart { .. }) => {
                while self.buffer.len() >= self.block_size {
                    let part = Bytes::copy_from_slice(&self.buffer[..self.block_size]);
                    self.ship_part(part).await?;
                    let _ = self.buffer.split_to(self.block_size);
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn ship_append(&mut self) -> Result<(), FsError> {
        let Some(Upload::Append {
            position,
            started,
            truncate,
        }) = self.upload.as_mut()
        else {
            return Ok(());
        };
        if *truncate {
            match self.fs.rm_file(&self.loc.to_path()).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
            *truncate = false;
        }
        let data = Bytes::copy_from_slice(&self.buffer);
        *position = self.fs.append_chunk(&self.loc, *position, data).await?;
        *started = true;
        self.buffer.clear();
        Ok(())
    }

    async fn ship_part(&mut self, data: Bytes) -> Result<(), FsError> {
        let Some(Upload::Multipart { upload_id, parts }) = self.upload.as_mut() else {
            return Ok(());
        };
        let id = match upload_id.clone() {
            Some(id) => id,
            None => {
                let id = self.fs.init_multipart(&self.loc).await?;
                *upload_id = Some(id.clone());
                id
            }
        };
        let part_number = parts.len() as u32 + 1;
        let part = self.fs.upload_part(&self.loc, &id, part_number, data).await?;
        parts.push(part);
        Ok(())
    }

    /// Ship the remainder and commit. A failed close leaves the handle open
    /// with its upload session, so it can be retried or aborted.
    pub async fn close(&mut self) -> Result<(), FsError> {
        if self.closed {
            return Ok(());
        }
        if self.mode != OpenMode::Read {
            self.commit().await?;
            self.fs.invalidate_cache(Some(&self.loc.to_path()));
            debug!(path = %self.loc.to_path(), bytes = self.pos, "Committed file");
        }
        self.closed = true;
        self.cache = None;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), FsError> {
        match self.upload {
            Some(Upload::Append { started, .. }) => {
                if !self.buffer.is_empty() || !started {
                    self.ship_append().await?;
                }
                Ok(())
            }
            Some(Upload::Multipart { upload_id: None, .. }) => {
                let data = Bytes::copy_from_slice(&self.buffer);
                self.fs.put_whole(&self.loc, data).await?;
                self.buffer.clear();
                Ok(())
            }
            Some(Upload::Multipart { .. }) => {
                self.ship().await?;
                if !self.buffer.is_empty() {
                    let rest = Bytes::copy_from_slice(&self.buffer);
                    self.ship_part(rest).await?;
                    self.buffer.clear();
                }
                let Some(Upload::Multipart {
                    upload_id: Some(id),
                    parts,
                }) = self.upload.as_ref()
                else {
                    return Ok(());
                };
                self.fs.complete_multipart(&self.loc, id, parts).await?;
                self.upload = Some(Upload::Multipart {
                    upload_id: None,
                    parts: Vec::new(),
                });
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Drop buffered data and abort a multipart session in progress. The
    /// handle is closed afterwards.
    pub async fn abort(&mut self) -> Result<(), FsError> {
        if let Some(id) = self.upload_id().map(str::to_string) {
            self.fs.abort_multipart(&self.loc, &id).await?;
            debug!(path = %self.loc.to_path(), upload_id = %id, "Aborted multipart upload");
        }
        self.upload = None;
        self.buffer.clear();
        self.closed = true;
        Ok(())
    }
}

impl Drop for OssFile {
    fn drop(&mut self) {
        if self.closed || self.mode == OpenMode::Read {
            return;
        }
        if let Some(id) = self.upload_id() {
            warn!(path = %self.loc.to_path(), upload_id = %id, "File dropped with an open multipart upload");
        } else if !self.buffer.is_empty() {
            warn!(path = %self.loc.to_path(), bytes = self.buffer.len(), "File dropped with unwritten data");
        }
    }
}
