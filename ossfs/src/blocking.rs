//! Blocking front end: every call drives the async filesystem to completion
//! on a tokio runtime.
//!
//! Must not be called from inside an async context.

use std::collections::BTreeMap;
use std::io;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use tokio::runtime::{Handle, Runtime};
use tracing::warn;

use ossfs_common::backend::ObjectBackend;
use ossfs_common::entry::EntryInfo;
use ossfs_common::error::FsError;

use crate::bulk::{FindOptions, WalkEntry};
use crate::config::FsConfig;
use crate::file::{OpenOptions, OssFile};
use crate::fs::OssFileSystem;
use crate::traits::FileSystem;

fn build_runtime() -> Result<Arc<Runtime>, FsError> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("ossfs-blocking")
        .build()?;
    Ok(Arc::new(rt))
}

#[derive(Clone)]
pub struct BlockingFileSystem {
    fs: OssFileSystem,
    rt: Handle,
    /// Keeps an owned runtime alive; `None` when borrowing the caller's.
    _owned: Option<Arc<Runtime>>,
}

impl std::fmt::Debug for BlockingFileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingFileSystem").field("fs", &self.fs).finish()
    }
}

impl BlockingFileSystem {
    pub fn new(config: FsConfig) -> Result<Self, FsError> {
        Self::from_async(OssFileSystem::new(config)?)
    }

    pub fn with_backend(config: FsConfig, backend: Arc<dyn ObjectBackend>) -> Result<Self, FsError> {
        Self::from_async(OssFileSystem::with_backend(config, backend)?)
    }

    /// Wrap an async filesystem with a dedicated runtime.
    pub fn from_async(fs: OssFileSystem) -> Result<Self, FsError> {
        let owned = build_runtime()?;
        Ok(Self {
            fs,
            rt: owned.handle().clone(),
            _owned: Some(owned),
        })
    }

    /// Wrap an async filesystem, running calls on an existing multi-thread
    /// runtime.
    pub fn with_handle(fs: OssFileSystem, rt: Handle) -> Self {
        Self { fs, rt, _owned: None }
    }

    pub fn inner(&self) -> &OssFileSystem {
        &self.fs
    }

    pub fn open_with(&self, path: &str, opts: OpenOptions) -> Result<BlockingFile, FsError> {
        let file = self.rt.block_on(self.fs.open_with(path, opts))?;
        Ok(BlockingFile {
            file,
            rt: self.rt.clone(),
            _owned: self._owned.clone(),
        })
    }

    pub fn set_endpoint(&self, endpoint: &str) -> Result<(), FsError> {
        self.fs.set_endpoint(endpoint)
    }

    pub fn rm_file(&self, path: &str) -> Result<(), FsError> {
        self.rt.block_on(self.fs.rm_file(path))
    }

    pub fn bulk_delete(&self, paths: &[String]) -> Result<(), FsError> {
        self.rt.block_on(self.fs.bulk_delete(paths))
    }

    pub fn cp_file(&self, src: &str, dst: &str) -> Result<(), FsError> {
        self.rt.block_on(self.fs.cp_file(src, dst))
    }

    pub fn get(&self, remote: &str, local: &Path, recursive: bool) -> Result<(), FsError> {
        self.rt.block_on(self.fs.get(remote, local, recursive))
    }

    pub fn modified(&self, path: &str) -> Result<chrono::DateTime<chrono::Utc>, FsError> {
        self.rt.block_on(self.fs.modified(path))
    }

    pub fn created(&self, path: &str) -> Result<chrono::DateTime<chrono::Utc>, FsError> {
        self.rt.block_on(self.fs.created(path))
    }

    pub fn ukey(&self, path: &str) -> Result<String, FsError> {
        self.rt.block_on(self.fs.ukey(path))
    }

    pub fn checksum(&self, path: &str) -> Result<String, FsError> {
        self.rt.block_on(self.fs.checksum(path))
    }
}

impl FileSystem for BlockingFileSystem {
    type File = BlockingFile;

    fn ls(&self, path: &str) -> Result<Vec<EntryInfo>, FsError> {
        self.rt.block_on(self.fs.ls(path))
    }

    fn info(&self, path: &str) -> Result<EntryInfo, FsError> {
        self.rt.block_on(self.fs.info(path))
    }

    fn exists(&self, path: &str) -> Result<bool, FsError> {
        self.rt.block_on(self.fs.exists(path))
    }

    fn open(&self, path: &str, mode: &str) -> Result<BlockingFile, FsError> {
        self.open_with(path, OpenOptions::new(mode.parse()?))
    }

    fn cat_file(&self, path: &str, range: Option<Range<u64>>) -> Result<Bytes, FsError> {
        self.rt.block_on(self.fs.cat_file(path, range))
    }

    fn pipe(&self, path: &str, data: Bytes) -> Result<(), FsError> {
        self.rt.block_on(self.fs.pipe(path, data))
    }

    fn rm(&self, paths: &[&str], recursive: bool, maxdepth: Option<usize>) -> Result<(), FsError> {
        self.rt.block_on(self.fs.rm(paths, recursive, maxdepth))
    }

    fn cp(&self, src: &str, dst: &str, recursive: bool) -> Result<(), FsError> {
        self.rt.block_on(self.fs.cp(src, dst, recursive))
    }

    fn mv(&self, src: &str, dst: &str, recursive: bool) -> Result<(), FsError> {
        self.rt.block_on(self.fs.mv(src, dst, recursive))
    }

    fn mkdir(&self, path: &str) -> Result<(), FsError> {
        self.rt.block_on(self.fs.mkdir(path))
    }

    fn touch(&self, path: &str, truncate: bool) -> Result<(), FsError> {
        self.rt.block_on(self.fs.touch(path, truncate))
    }

    fn find(&self, path: &str, opts: &FindOptions) -> Result<BTreeMap<String, EntryInfo>, FsError> {
        self.rt.block_on(self.fs.find(path, opts))
    }

    fn walk(&self, path: &str, maxdepth: Option<usize>) -> Result<Vec<WalkEntry>, FsError> {
        self.rt.block_on(self.fs.walk(path, maxdepth))
    }

    fn glob(&self, pattern: &str) -> Result<Vec<String>, FsError> {
        self.rt.block_on(self.fs.glob(pattern))
    }

    fn du(&self, path: &str) -> Result<u64, FsError> {
        self.rt.block_on(self.fs.du(path))
    }

    fn get_file(&self, remote: &str, local: &Path) -> Result<(), FsError> {
        self.rt.block_on(self.fs.get_file(remote, local))
    }

    fn put_file(&self, local: &Path, remote: &str) -> Result<(), FsError> {
        self.rt.block_on(self.fs.put_file(local, remote))
    }

    fn put(&self, local: &Path, remote: &str, recursive: bool) -> Result<(), FsError> {
        self.rt.block_on(self.fs.put(local, remote, recursive))
    }

    fn invalidate_cache(&self, path: Option<&str>) {
        self.fs.invalidate_cache(path)
    }
}

/// A file handle whose calls block. Implements the std I/O traits; dropping
/// an unclosed writer commits it.
pub struct BlockingFile {
    file: OssFile,
    rt: Handle,
    /// The filesystem's owned runtime; a handle may outlive the filesystem.
    _owned: Option<Arc<Runtime>>,
}

impl BlockingFile {
    pub fn path(&self) -> String {
        self.file.path()
    }

    pub fn tell(&self) -> u64 {
        self.file.tell()
    }

    pub fn size(&self) -> u64 {
        self.file.size()
    }

    /// Up to `n` bytes from the cursor, or everything left with `None`.
    pub fn read_bytes(&mut self, n: Option<usize>) -> Result<Bytes, FsError> {
        self.rt.block_on(self.file.read(n))
    }

    pub fn close(&mut self) -> Result<(), FsError> {
        self.rt.block_on(self.file.close())
    }

    pub fn abort(&mut self) -> Result<(), FsError> {
        self.rt.block_on(self.file.abort())
    }
}

impl io::Read for BlockingFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.rt.block_on(self.file.read_into(buf))?)
    }
}

impl io::Write for BlockingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.rt.block_on(self.file.write(buf))?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(self.rt.block_on(self.file.flush())?)
    }
}

impl io::Seek for BlockingFile {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        Ok(self.file.seek(pos)?)
    }
}

impl Drop for BlockingFile {
    fn drop(&mut self) {
        if self.file.is_closed() {
            return;
        }
        if let Err(e) = self.rt.block_on(self.file.close()) {
            warn!(path = %self.file.path(), error = %e, "Failed to close file on drop");
        }
    }
}
