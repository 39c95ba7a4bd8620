//! Directory listings synthesized from prefix/delimiter queries.

use std::sync::Arc;

use tracing::{debug, warn};

use ossfs_common::entry::{self, EntryInfo};
use ossfs_common::error::FsError;
use ossfs_common::path;

use crate::fs::OssFileSystem;

/// Shape of a single listing query.
#[derive(Debug, Clone)]
pub struct ListOptions {
    /// `"/"` groups keys into immediate children; empty lists flat.
    pub delimiter: String,
    /// Extra key prefix below the directory; bypasses the cache.
    pub prefix: Option<String>,
    /// Skip the cache lookup (the result still repopulates it).
    pub refresh: bool,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            delimiter: path::DELIMITER.to_string(),
            prefix: None,
            refresh: false,
        }
    }
}

impl ListOptions {
    pub fn flat(prefix: impl Into<String>) -> Self {
        Self {
            delimiter: String::new(),
            prefix: Some(prefix.into()),
            refresh: false,
        }
    }

    fn cacheable(&self) -> bool {
        self.delimiter == path::DELIMITER && self.prefix.is_none()
    }
}

impl OssFileSystem {
    /// Entries directly under `path`, sorted by name.
    ///
    /// A file path yields that file's own entry; a missing or inaccessible
    /// path yields an empty listing.
    pub async fn ls(&self, target: &str) -> Result<Vec<EntryInfo>, FsError> {
        let loc = path::resolve(target);
        if loc.is_root() {
            return Ok(self.list_buckets().await?.to_vec());
        }
        let entries = self.list_children(target, &ListOptions::default()).await?;
        if !entries.is_empty() || loc.key.is_empty() {
            return Ok(entries.to_vec());
        }
        // Not a directory; it may be a file listed by its parent.
        let name = loc.to_path();
        let siblings = self.list_children(&path::parent(&name), &ListOptions::default()).await?;
        Ok(siblings
            .iter()
            .filter(|e| e.is_file() && e.name == name)
            .cloned()
            .collect())
    }

    /// Immediate children of a directory or container.
    ///
    /// Standard listings are served from and stored into the directory
    /// cache. NotFound and PermissionDenied fold into an empty result, which
    /// is not cached.
    pub async fn list_children(&self, target: &str, opts: &ListOptions) -> Result<Arc<Vec<EntryInfo>>, FsError> {
        let loc = path::resolve(target);
        if loc.is_root() {
            return self.list_buckets().await;
        }
        let dir = loc.to_path();
        let cache = &self.inner.cache;
        if opts.cacheable() && !opts.refresh {
            if let Some(hit) = cache.get(&dir) {
                return Ok(hit);
            }
        }

        let ticket = cache.begin_fill();
        let mut prefix = loc.dir_prefix();
        if let Some(extra) = &opts.prefix {
            prefix.push_str(extra);
        }
        debug!(path = %dir, prefix = %prefix, "Get directory listing");
        match self.list_prefix(&loc.container, &prefix, &opts.delimiter).await {
            Ok(mut entries) => {
                entry::sort_entries(&mut entries);
                if opts.cacheable() {
                    cache.insert(&dir, entries.clone(), ticket);
                }
                Ok(Arc::new(entries))
            }
            Err(err) if err.is_absent() => {
                debug!(path = %dir, error = %err, "Listing folded to empty");
                Ok(Arc::new(Vec::new()))
            }
            Err(err) => Err(err),
        }
    }

    /// Every container, as directory entries.
    pub(crate) async fn list_buckets(&self) -> Result<Arc<Vec<EntryInfo>>, FsError> {
        let cache = &self.inner.cache;
        if let Some(hit) = cache.get(path::ROOT) {
            return Ok(hit);
        }
        let backend = self.backend();
        if backend.is_anonymous() {
            warn!("cannot list buckets if not logged in");
            return Ok(Arc::new(Vec::new()));
        }
        let ticket = cache.begin_fill();
        let buckets = self.call("list_buckets", path::ROOT, |_| backend.list_buckets()).await?;
        let mut entries: Vec<EntryInfo> = buckets.iter().map(EntryInfo::from_bucket).collect();
        entry::sort_entries(&mut entries);
        cache.insert(path::ROOT, entries.clone(), ticket);
        Ok(Arc::new(entries))
    }

    /// Drain every page of one prefix query.
    async fn list_prefix(&self, container: &str, prefix: &str, delimiter: &str) -> Result<Vec<EntryInfo>, FsError> {
        let backend = self.backend();
        let target = path::join(container, prefix.trim_end_matches('/'));
        let mut entries = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let continuation = token.as_deref();
            let page = self
                .call("list_objects", &target, |_| {
                    backend.list_objects(container, prefix, delimiter, continuation, 0)
                })
                .await?;
            entries.extend(entry::classify_page(container, prefix, &page));
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use ossfs_backend::{MemoryBackend, ObjectBackend, Operation};

    use crate::config::FsConfig;

    async fn setup(keys: &[&str]) -> (OssFileSystem, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new().with_bucket("b").with_page_size(3));
        for key in keys {
            backend.put_object("b", key, Bytes::from_static(b"data")).await.unwrap();
        }
        let fs = OssFileSystem::with_backend(FsConfig::default(), backend.clone()).unwrap();
        (fs, backend)
    }

    fn names(entries: &[EntryInfo]) -> Vec<&str> {
        entries.iter().map(|e| e.name.as_str()).collect()
    }

    #[tokio::test]
    async fn test_ls_directory() {
        let (fs, _) = setup(&["dir/b", "dir/a", "dir/sub/x", "dir/", "other"]).await;
        let entries = fs.ls("/b/dir").await.unwrap();
        assert_eq!(names(&entries), vec!["/b/dir/a", "/b/dir/b", "/b/dir/sub"]);
        assert_eq!(entries[0].size, 4);
        assert!(entries[2].is_dir());
        assert_eq!(entries[2].size, 0);
    }

    #[tokio::test]
    async fn test_ls_file_fallback() {
        let (fs, _) = setup(&["dir/a"]).await;
        let entries = fs.ls("oss://b/dir/a").await.unwrap();
        assert_eq!(names(&entries), vec!["/b/dir/a"]);
        assert!(entries[0].is_file());
        assert!(fs.ls("/b/dir/missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_listing_is_cached() {
        let (fs, backend) = setup(&["dir/a", "dir/b"]).await;
        fs.ls("/b/dir").await.unwrap();
        let calls = backend.calls(Operation::ListObjects);
        fs.ls("/b/dir/").await.unwrap();
        assert_eq!(backend.calls(Operation::ListObjects), calls);

        let refreshed = ListOptions {
            refresh: true,
            ..Default::default()
        };
        fs.list_children("/b/dir", &refreshed).await.unwrap();
        assert!(backend.calls(Operation::ListObjects) > calls);
    }

    #[tokio::test]
    async fn test_prefixed_listing_bypasses_cache() {
        let (fs, _) = setup(&["dir/apple", "dir/avocado", "dir/banana", "dir/deep/apricot"]).await;
        let found = fs.list_children("/b/dir", &ListOptions::flat("a")).await.unwrap();
        assert_eq!(names(&found), vec!["/b/dir/apple", "/b/dir/avocado"]);
        assert!(!fs.dircache().contains("/b/dir"));
    }

    #[tokio::test]
    async fn test_missing_bucket_lists_empty() {
        let (fs, _) = setup(&[]).await;
        assert!(fs.ls("/nope").await.unwrap().is_empty());
        assert!(fs.ls("/nope/dir").await.unwrap().is_empty());
        assert!(!fs.dircache().contains("/nope"));
    }

    #[tokio::test]
    async fn test_root_lists_buckets() {
        let (fs, backend) = setup(&[]).await;
        backend.create_bucket("a");
        let entries = fs.ls("/").await.unwrap();
        assert_eq!(names(&entries), vec!["/a", "/b"]);
        assert!(entries.iter().all(|e| e.is_dir()));
    }

    #[tokio::test]
    async fn test_anonymous_root_is_empty() {
        let backend = Arc::new(MemoryBackend::new().with_bucket("b").anonymous());
        let fs = OssFileSystem::with_backend(FsConfig::default(), backend.clone()).unwrap();
        assert!(fs.ls("").await.unwrap().is_empty());
        assert_eq!(backend.calls(Operation::ListBuckets), 0);
    }
}
