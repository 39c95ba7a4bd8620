//! The filesystem contract, in a non-blocking and a blocking flavour.
//!
//! Both share the path resolution, classification, and chunk arithmetic in
//! `ossfs-common`; they differ only in how a call waits for the network.

use std::collections::BTreeMap;
use std::io::{Read, Seek, Write};
use std::ops::Range;
use std::path::Path;

use bytes::Bytes;

use ossfs_common::entry::EntryInfo;
use ossfs_common::error::FsError;

use crate::bulk::{FindOptions, WalkEntry};
use crate::file::OssFile;
use crate::fs::OssFileSystem;

/// Non-blocking filesystem contract.
#[async_trait::async_trait]
pub trait AsyncFileSystem: Send + Sync {
    type File: Send;

    /// Entries directly under `path`, sorted by name.
    async fn ls(&self, path: &str) -> Result<Vec<EntryInfo>, FsError>;

    async fn info(&self, path: &str) -> Result<EntryInfo, FsError>;

    async fn exists(&self, path: &str) -> Result<bool, FsError>;

    async fn open(&self, path: &str, mode: &str) -> Result<Self::File, FsError>;

    async fn cat_file(&self, path: &str, range: Option<Range<u64>>) -> Result<Bytes, FsError>;

    async fn pipe(&self, path: &str, data: Bytes) -> Result<(), FsError>;

    async fn rm(&self, paths: &[&str], recursive: bool, maxdepth: Option<usize>) -> Result<(), FsError>;

    async fn cp(&self, src: &str, dst: &str, recursive: bool) -> Result<(), FsError>;

    async fn mv(&self, src: &str, dst: &str, recursive: bool) -> Result<(), FsError>;

    async fn mkdir(&self, path: &str) -> Result<(), FsError>;

    async fn touch(&self, path: &str, truncate: bool) -> Result<(), FsError>;

    async fn find(&self, path: &str, opts: &FindOptions) -> Result<BTreeMap<String, EntryInfo>, FsError>;

    async fn walk(&self, path: &str, maxdepth: Option<usize>) -> Result<Vec<WalkEntry>, FsError>;

    async fn glob(&self, pattern: &str) -> Result<Vec<String>, FsError>;

    async fn du(&self, path: &str) -> Result<u64, FsError>;

    async fn get_file(&self, remote: &str, local: &Path) -> Result<(), FsError>;

    async fn put_file(&self, local: &Path, remote: &str) -> Result<(), FsError>;

    async fn put(&self, local: &Path, remote: &str, recursive: bool) -> Result<(), FsError>;

    fn invalidate_cache(&self, path: Option<&str>);

    /// Names from [`ls`](Self::ls), same order.
    async fn ls_names(&self, path: &str) -> Result<Vec<String>, FsError> {
        Ok(self.ls(path).await?.into_iter().map(|e| e.name).collect())
    }

    /// Missing and inaccessible paths are not directories.
    async fn isdir(&self, path: &str) -> Result<bool, FsError> {
        match self.info(path).await {
            Ok(entry) => Ok(entry.is_dir()),
            Err(err) if err.is_absent() => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn isfile(&self, path: &str) -> Result<bool, FsError> {
        match self.info(path).await {
            Ok(entry) => Ok(entry.is_file()),
            Err(err) if err.is_absent() => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn size(&self, path: &str) -> Result<u64, FsError> {
        Ok(self.info(path).await?.size)
    }

    async fn cat(&self, path: &str) -> Result<Bytes, FsError> {
        self.cat_file(path, None).await
    }
}

/// Blocking filesystem contract; each call waits for its round trips.
pub trait FileSystem: Send + Sync {
    type File: Read + Write + Seek;

    fn ls(&self, path: &str) -> Result<Vec<EntryInfo>, FsError>;

    fn info(&self, path: &str) -> Result<EntryInfo, FsError>;

    fn exists(&self, path: &str) -> Result<bool, FsError>;

    fn open(&self, path: &str, mode: &str) -> Result<Self::File, FsError>;

    fn cat_file(&self, path: &str, range: Option<Range<u64>>) -> Result<Bytes, FsError>;

    fn pipe(&self, path: &str, data: Bytes) -> Result<(), FsError>;

    fn rm(&self, paths: &[&str], recursive: bool, maxdepth: Option<usize>) -> Result<(), FsError>;

    fn cp(&self, src: &str, dst: &str, recursive: bool) -> Result<(), FsError>;

    fn mv(&self, src: &str, dst: &str, recursive: bool) -> Result<(), FsError>;

    fn mkdir(&self, path: &str) -> Result<(), FsError>;

    fn touch(&self, path: &str, truncate: bool) -> Result<(), FsError>;

    fn find(&self, path: &str, opts: &FindOptions) -> Result<BTreeMap<String, EntryInfo>, FsError>;

    fn walk(&self, path: &str, maxdepth: Option<usize>) -> Result<Vec<WalkEntry>, FsError>;

    fn glob(&self, pattern: &str) -> Result<Vec<String>, FsError>;

    fn du(&self, path: &str) -> Result<u64, FsError>;

    fn get_file(&self, remote: &str, local: &Path) -> Result<(), FsError>;

    fn put_file(&self, local: &Path, remote: &str) -> Result<(), FsError>;

    fn put(&self, local: &Path, remote: &str, recursive: bool) -> Result<(), FsError>;

    fn invalidate_cache(&self, path: Option<&str>);

    fn ls_names(&self, path: &str) -> Result<Vec<String>, FsError> {
        Ok(self.ls(path)?.into_iter().map(|e| e.name).collect())
    }

    fn isdir(&self, path: &str) -> Result<bool, FsError> {
        match self.info(path) {
            Ok(entry) => Ok(entry.is_dir()),
            Err(err) if err.is_absent() => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn isfile(&self, path: &str) -> Result<bool, FsError> {
        match self.info(path) {
            Ok(entry) => Ok(entry.is_file()),
            Err(err) if err.is_absent() => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn size(&self, path: &str) -> Result<u64, FsError> {
        Ok(self.info(path)?.size)
    }

    fn cat(&self, path: &str) -> Result<Bytes, FsError> {
        self.cat_file(path, None)
    }
}

#[async_trait::async_trait]
impl AsyncFileSystem for OssFileSystem {
    type File = OssFile;

    async fn ls(&self, path: &str) -> Result<Vec<EntryInfo>, FsError> {
        OssFileSystem::ls(self, path).await
    }

    async fn info(&self, path: &str) -> Result<EntryInfo, FsError> {
        OssFileSystem::info(self, path).await
    }

    async fn exists(&self, path: &str) -> Result<bool, FsError> {
        OssFileSystem::exists(self, path).await
    }

    async fn open(&self, path: &str, mode: &str) -> Result<OssFile, FsError> {
        OssFileSystem::open(self, path, mode).await
    }

    async fn cat_file(&self, path: &str, range: Option<Range<u64>>) -> Result<Bytes, FsError> {
        OssFileSystem::cat_file(self, path, range).await
    }

    async fn pipe(&self, path: &str, data: Bytes) -> Result<(), FsError> {
        OssFileSystem::pipe(self, path, data).await
    }

    async fn rm(&self, paths: &[&str], recursive: bool, maxdepth: Option<usize>) -> Result<(), FsError> {
        OssFileSystem::rm(self, paths, recursive, maxdepth).await
    }

    async fn cp(&self, src: &str, dst: &str, recursive: bool) -> Result<(), FsError> {
        OssFileSystem::cp(self, src, dst, recursive).await
    }

    async fn mv(&self, src: &str, dst: &str, recursive: bool) -> Result<(), FsError> {
        OssFileSystem::mv(self, src, dst, recursive).await
    }

    async fn mkdir(&self, path: &str) -> Result<(), FsError> {
        OssFileSystem::mkdir(self, path).await
    }

    async fn touch(&self, path: &str, truncate: bool) -> Result<(), FsError> {
        OssFileSystem::touch(self, path, truncate).await
    }

    async fn find(&self, path: &str, opts: &FindOptions) -> Result<BTreeMap<String, EntryInfo>, FsError> {
        OssFileSystem::find(self, path, opts).await
    }

    async fn walk(&self, path: &str, maxdepth: Option<usize>) -> Result<Vec<WalkEntry>, FsError> {
        OssFileSystem::walk(self, path, maxdepth).await
    }

    async fn glob(&self, pattern: &str) -> Result<Vec<String>, FsError> {
        OssFileSystem::glob(self, pattern).await
    }

    async fn du(&self, path: &str) -> Result<u64, FsError> {
        OssFileSystem::du(self, path).await
    }

    async fn get_file(&self, remote: &str, local: &Path) -> Result<(), FsError> {
        OssFileSystem::get_file(self, remote, local).await
    }

    async fn put_file(&self, local: &Path, remote: &str) -> Result<(), FsError> {
        OssFileSystem::put_file(self, local, remote).await
    }

    async fn put(&self, local: &Path, remote: &str, recursive: bool) -> Result<(), FsError> {
        OssFileSystem::put(self, local, remote, recursive).await
    }

    fn invalidate_cache(&self, path: Option<&str>) {
        OssFileSystem::invalidate_cache(self, path)
    }

    async fn cat(&self, path: &str) -> Result<Bytes, FsError> {
        OssFileSystem::cat(self, path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use ossfs_backend::{MemoryBackend, ObjectBackend, Operation};
    use ossfs_common::backend::BackendError;

    use crate::config::FsConfig;

    async fn generic_sizes<F: AsyncFileSystem>(fs: &F, path: &str) -> Result<(bool, bool, u64), FsError> {
        Ok((fs.isdir(path).await?, fs.isfile(path).await?, fs.size(path).await?))
    }

    #[tokio::test]
    async fn test_provided_methods() {
        let backend = Arc::new(MemoryBackend::new().with_bucket("b"));
        backend.put_object("b", "d/f", Bytes::from_static(b"12345")).await.unwrap();
        let fs = OssFileSystem::with_backend(FsConfig::default(), backend.clone()).unwrap();

        assert_eq!(generic_sizes(&fs, "/b/d/f").await.unwrap(), (false, true, 5));
        assert_eq!(generic_sizes(&fs, "/b/d").await.unwrap(), (true, false, 0));
        assert!(!AsyncFileSystem::isdir(&fs, "/b/missing").await.unwrap());
        assert!(!AsyncFileSystem::isfile(&fs, "/b/missing").await.unwrap());
        assert_eq!(AsyncFileSystem::ls_names(&fs, "/b/d").await.unwrap(), vec!["/b/d/f"]);
        assert_eq!(AsyncFileSystem::cat(&fs, "/b/d/f").await.unwrap(), Bytes::from_static(b"12345"));
    }

    #[tokio::test]
    async fn test_isdir_propagates_io_failures() {
        let backend = Arc::new(MemoryBackend::new().with_bucket("b"));
        let fs = OssFileSystem::with_backend(FsConfig::default(), backend.clone()).unwrap();
        backend.fail_next(Operation::HeadObject, 1, BackendError::service(500, "InternalError", "boom"));
        assert!(AsyncFileSystem::isdir(&fs, "/b/x").await.is_err());
    }
}
