//! Existence and metadata resolution.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::debug;

use ossfs_common::backend::{BucketInfo, ObjectMeta};
use ossfs_common::entry::EntryInfo;
use ossfs_common::error::FsError;
use ossfs_common::path::{self, ResolvedLocation};

use crate::fs::OssFileSystem;
use crate::listing::ListOptions;

impl OssFileSystem {
    /// Whether `path` is the root, a container, an object, or a synthetic
    /// directory.
    ///
    /// NotFound and PermissionDenied fold into `false`; other failures
    /// propagate.
    pub async fn exists(&self, target: &str) -> Result<bool, FsError> {
        let loc = path::resolve(target);
        if loc.is_root() {
            return Ok(true);
        }
        if !self.bucket_exists(&loc.container).await {
            return Ok(false);
        }
        if loc.key.is_empty() {
            return Ok(true);
        }
        let name = loc.to_path();
        if self.cached_entry(&name).is_some() {
            return Ok(true);
        }
        match self.head(&loc).await {
            Ok(_) => return Ok(true),
            Err(err) if err.is_absent() => {}
            Err(err) => return Err(err),
        }
        self.dir_exists(&loc).await
    }

    /// Entry describing `path`. Fails NotFound when nothing lives there.
    pub async fn info(&self, target: &str) -> Result<EntryInfo, FsError> {
        let loc = path::resolve(target);
        if loc.is_root() {
            return Ok(EntryInfo::directory(path::ROOT));
        }
        if loc.key.is_empty() {
            let bucket = self.bucket_info(&loc.container).await?;
            return Ok(EntryInfo::from_bucket(&bucket));
        }
        let name = loc.to_path();
        if let Some(hit) = self.cached_entry(&name) {
            return Ok(hit);
        }
        match self.head(&loc).await {
            Ok(meta) => return Ok(EntryInfo::from_meta(&name, &meta)),
            Err(err) if err.is_absent() => {}
            Err(err) => return Err(err),
        }
        if self.dir_exists(&loc).await? {
            return Ok(EntryInfo::directory(name));
        }
        Err(FsError::not_found(name))
    }

    /// Last modification time of an object. Containers and directories have none.
    pub async fn modified(&self, target: &str) -> Result<DateTime<Utc>, FsError> {
        let loc = path::resolve(target);
        if loc.key.is_empty() {
            return Err(FsError::InvalidOperation("bucket has no modified timestamp".into()));
        }
        let entry = self.info(target).await?;
        if entry.is_dir() {
            return Err(FsError::InvalidOperation("directory has no modified timestamp".into()));
        }
        let meta = self.head(&loc).await?;
        meta.last_modified
            .ok_or_else(|| FsError::InvalidOperation(format!("{} reports no modified timestamp", entry.name)))
    }

    /// Creation time of a container. Objects have none.
    pub async fn created(&self, target: &str) -> Result<DateTime<Utc>, FsError> {
        let loc = path::resolve(target);
        if loc.is_root() || !loc.key.is_empty() {
            return Err(FsError::InvalidOperation("only buckets have a created timestamp".into()));
        }
        let bucket = self.bucket_info(&loc.container).await?;
        bucket
            .creation_date
            .ok_or_else(|| FsError::InvalidOperation(format!("{} reports no creation date", loc.container)))
    }

    /// Opaque token that changes whenever the object content changes.
    pub async fn ukey(&self, target: &str) -> Result<String, FsError> {
        let loc = path::resolve(target);
        let meta = self.head(&loc).await?;
        Ok(meta.etag.unwrap_or_default())
    }

    /// Hex sha256 over the object's etag and its entry.
    pub async fn checksum(&self, target: &str) -> Result<String, FsError> {
        let ukey = self.ukey(target).await?;
        let entry = self.info(target).await?;
        let mut hasher = Sha256::new();
        hasher.update(ukey.as_bytes());
        hasher.update(format!("{}:{}:{:?}", entry.name, entry.size, entry.last_modified).as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }

    pub(crate) async fn head(&self, loc: &ResolvedLocation) -> Result<ObjectMeta, FsError> {
        if loc.key.is_empty() {
            return Err(FsError::InvalidArgument(format!("{} is not an object path", loc.to_path())));
        }
        let backend = self.backend();
        let (container, key) = (loc.container.as_str(), loc.key.as_str());
        self.call("head_object", &loc.to_path(), |_| backend.head_object(container, key))
            .await
    }

    pub(crate) async fn bucket_info(&self, container: &str) -> Result<BucketInfo, FsError> {
        let backend = self.backend();
        self.call("bucket_info", &path::join(container, ""), |_| backend.bucket_info(container))
            .await
    }

    /// Container probe that folds every failure into `false`.
    pub(crate) async fn bucket_exists(&self, container: &str) -> bool {
        if container.is_empty() {
            return false;
        }
        match self.bucket_info(container).await {
            Ok(_) => true,
            Err(err) => {
                debug!(bucket = %container, error = %err, "Bucket probe failed");
                false
            }
        }
    }

    /// A directory exists when anything lives under `key/`, or its
    /// zero-byte marker does.
    pub(crate) async fn dir_exists(&self, loc: &ResolvedLocation) -> Result<bool, FsError> {
        let children = self.list_children(&loc.to_path(), &ListOptions::default()).await?;
        if !children.is_empty() {
            return Ok(true);
        }
        let marker = ResolvedLocation {
            container: loc.container.clone(),
            key: loc.dir_prefix(),
        };
        match self.head(&marker).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_absent() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// The entry for `name` from its parent's cached listing, preferring a
    /// file over a same-named directory.
    fn cached_entry(&self, name: &str) -> Option<EntryInfo> {
        let listing = self.inner.cache.get(&path::parent(name))?;
        let mut matches = listing.iter().filter(|e| e.name == name);
        let first = matches.next()?.clone();
        if first.is_file() {
            return Some(first);
        }
        Some(matches.find(|e| e.is_file()).cloned().unwrap_or(first))
    }
}
