//! Tree traversal and multi-object operations.

use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;
use tokio::task::JoinSet;
use tracing::debug;

use ossfs_common::chunking::{self, MAX_BATCH_DELETE};
use ossfs_common::entry::EntryInfo;
use ossfs_common::error::FsError;
use ossfs_common::path::{self, ResolvedLocation};

use crate::fs::{join_error, OssFileSystem};
use crate::listing::ListOptions;
use crate::traits::AsyncFileSystem;
use crate::transfer::object_location;

/// Options for [`OssFileSystem::find`].
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    /// Levels to descend; `None` is unbounded.
    pub maxdepth: Option<usize>,
    /// Include directories in the result.
    pub withdirs: bool,
    /// Flat key-prefix filter below the path. Excludes the other two options.
    pub prefix: Option<String>,
}

/// One directory visited by [`OssFileSystem::walk`].
#[derive(Debug, Clone, PartialEq)]
pub struct WalkEntry {
    pub root: String,
    pub dirs: Vec<EntryInfo>,
    pub files: Vec<EntryInfo>,
}

impl OssFileSystem {
    /// Breadth-first traversal below `path`.
    pub async fn walk(&self, target: &str, maxdepth: Option<usize>) -> Result<Vec<WalkEntry>, FsError> {
        if maxdepth == Some(0) {
            return Err(FsError::InvalidArgument("maxdepth must be at least 1".into()));
        }
        let mut out = Vec::new();
        let mut queue = VecDeque::from([(path::normalize(target), 1usize)]);
        while let Some((dir, depth)) = queue.pop_front() {
            let listing = self.list_children(&dir, &ListOptions::default()).await?;
            if listing.is_empty() {
                continue;
            }
            let (dirs, files): (Vec<EntryInfo>, Vec<EntryInfo>) = listing.iter().cloned().partition(|e| e.is_dir());
            if maxdepth.map_or(true, |max| depth < max) {
                queue.extend(dirs.iter().map(|d| (d.name.clone(), depth + 1)));
            }
            out.push(WalkEntry { root: dir, dirs, files });
        }
        Ok(out)
    }

    /// Every file below `path`, keyed and sorted by name. A file path
    /// yields itself.
    pub async fn find(&self, target: &str, opts: &FindOptions) -> Result<BTreeMap<String, EntryInfo>, FsError> {
        let norm = path::normalize(target);
        if path::is_root(&norm) {
            return Err(FsError::InvalidArgument("cannot traverse all buckets".into()));
        }
        let mut out = BTreeMap::new();
        if let Some(prefix) = &opts.prefix {
            if opts.withdirs || opts.maxdepth.is_some() {
                return Err(FsError::InvalidArgument(
                    "can not specify 'prefix' option alongside 'withdirs'/'maxdepth' options".into(),
                ));
            }
            let found = self.list_children(&norm, &ListOptions::flat(prefix.as_str())).await?;
            for entry in found.iter().filter(|e| e.is_file()) {
                out.insert(entry.name.clone(), entry.clone());
            }
            return Ok(out);
        }

        for level in self.walk(&norm, opts.maxdepth).await? {
            if opts.withdirs {
                out.extend(level.dirs.into_iter().map(|d| (d.name.clone(), d)));
            }
            out.extend(level.files.into_iter().map(|f| (f.name.clone(), f)));
        }
        let loc = path::resolve(&norm);
        if !loc.key.is_empty() && !out.contains_key(&norm) {
            match self.head(&loc).await {
                Ok(meta) => {
                    out.insert(norm.clone(), EntryInfo::from_meta(&norm, &meta));
                }
                Err(err) if err.is_absent() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(out)
    }

    /// Paths matching a shell-style pattern: `*`, `?`, `[..]`, and `**`
    /// as a whole component.
    pub async fn glob(&self, pattern: &str) -> Result<Vec<String>, FsError> {
        let norm = path::normalize(pattern);
        let Some(wild) = norm.find(['*', '?', '[']) else {
            return Ok(if self.exists(&norm).await? { vec![norm] } else { Vec::new() });
        };
        let root = match norm[..wild].rfind('/') {
            Some(0) | None => path::ROOT.to_string(),
            Some(idx) => norm[..idx].to_string(),
        };
        let matcher = glob::Pattern::new(&norm).map_err(|e| FsError::InvalidArgument(e.to_string()))?;
        let options = glob::MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };
        let depth = if norm.contains("**") {
            None
        } else {
            Some(path::depth_below(&norm, &root))
        };

        let mut candidates = Vec::new();
        if path::is_root(&root) {
            for bucket in self.list_buckets().await?.iter() {
                candidates.push(bucket.name.clone());
                if depth == Some(1) {
                    continue;
                }
                let below = FindOptions {
                    maxdepth: depth.map(|d| d - 1),
                    withdirs: true,
                    prefix: None,
                };
                candidates.extend(self.find(&bucket.name, &below).await?.into_keys());
            }
        } else {
            let below = FindOptions {
                maxdepth: depth,
                withdirs: true,
                prefix: None,
            };
            candidates.extend(self.find(&root, &below).await?.into_keys());
        }
        let mut matched: Vec<String> = candidates
            .into_iter()
            .filter(|name| matcher.matches_with(name, options))
            .collect();
        matched.sort();
        matched.dedup();
        Ok(matched)
    }

    /// Total bytes of the files below `path`.
    pub async fn du(&self, target: &str) -> Result<u64, FsError> {
        let found = self.find(target, &FindOptions::default()).await?;
        Ok(found.values().map(|e| e.size).sum())
    }

    /// Delete objects. With `recursive`, directories go with everything
    /// below them, down to `maxdepth` levels.
    ///
    /// Keys are grouped per container and removed with bulk deletes of at
    /// most 1000 keys, a few batches in flight at a time.
    pub async fn rm(&self, targets: &[&str], recursive: bool, maxdepth: Option<usize>) -> Result<(), FsError> {
        let mut per_container: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut touched = Vec::with_capacity(targets.len());
        for target in targets {
            let loc = path::resolve(target);
            if loc.key.is_empty() {
                return Err(FsError::InvalidArgument(format!(
                    "cannot remove bucket or root {}",
                    loc.to_path()
                )));
            }
            let keys = if recursive {
                self.expand_for_delete(&loc, maxdepth).await?
            } else {
                self.single_delete_key(&loc).await?
            };
            per_container.entry(loc.container.clone()).or_default().extend(keys);
            touched.push(loc.to_path());
        }

        let mut result = Ok(());
        for (container, keys) in per_container {
            if let Err(err) = self.delete_keys(&container, keys).await {
                result = Err(err);
                break;
            }
        }
        for name in &touched {
            self.invalidate_cache(Some(name));
        }
        result
    }

    /// Keys to remove for a recursive delete: files, directory markers, and
    /// the path's own marker.
    async fn expand_for_delete(&self, loc: &ResolvedLocation, maxdepth: Option<usize>) -> Result<Vec<String>, FsError> {
        let name = loc.to_path();
        let opts = FindOptions {
            maxdepth,
            withdirs: true,
            prefix: None,
        };
        let found = self.find(&name, &opts).await?;
        if found.is_empty() && !self.exists(&name).await? {
            return Err(FsError::not_found(name));
        }
        let mut keys: Vec<String> = found
            .values()
            .map(|entry| {
                let key = path::resolve(&entry.name).key;
                if entry.is_dir() {
                    format!("{}/", key)
                } else {
                    key
                }
            })
            .collect();
        keys.push(loc.dir_prefix());
        Ok(keys)
    }

    async fn single_delete_key(&self, loc: &ResolvedLocation) -> Result<Vec<String>, FsError> {
        let entry = self.info(&loc.to_path()).await?;
        if entry.is_file() {
            return Ok(vec![loc.key.clone()]);
        }
        let children = self.list_children(&entry.name, &ListOptions::default()).await?;
        if !children.is_empty() {
            return Err(FsError::InvalidArgument(format!(
                "{} is a non-empty directory; pass recursive to remove it",
                entry.name
            )));
        }
        Ok(vec![loc.dir_prefix()])
    }

    async fn delete_keys(&self, container: &str, mut keys: Vec<String>) -> Result<(), FsError> {
        keys.sort();
        keys.dedup();
        let batches: Vec<Vec<String>> = keys.chunks(MAX_BATCH_DELETE).map(<[String]>::to_vec).collect();
        debug!(bucket = %container, keys = keys.len(), batches = batches.len(), "Bulk delete");
        let limit = self.config().max_concurrent_batches.max(1);
        let mut pending = batches.into_iter();
        let mut tasks = JoinSet::new();
        loop {
            while tasks.len() < limit {
                let Some(batch) = pending.next() else { break };
                let fs = self.clone();
                let container = container.to_string();
                tasks.spawn(async move { fs.delete_batch(&container, &batch).await });
            }
            let Some(joined) = tasks.join_next().await else { break };
            joined.map_err(join_error)??;
        }
        Ok(())
    }

    async fn delete_batch(&self, container: &str, keys: &[String]) -> Result<(), FsError> {
        let backend = self.backend();
        self.call("batch_delete_objects", &path::join(container, ""), |_| {
            backend.delete_objects(container, keys)
        })
        .await
    }

    /// Remove up to 1000 keys of one container in a single call.
    pub async fn bulk_delete(&self, paths: &[String]) -> Result<(), FsError> {
        if paths.is_empty() {
            return Ok(());
        }
        let (container, keys) = chunking::batch_delete_keys(paths)?;
        let result = self.delete_batch(&container, &keys).await;
        for p in paths {
            self.invalidate_cache(Some(p));
        }
        result
    }

    /// Delete a single object.
    pub async fn rm_file(&self, target: &str) -> Result<(), FsError> {
        let loc = object_location(target)?;
        let backend = self.backend();
        let (container, key) = (loc.container.as_str(), loc.key.as_str());
        let result = self
            .call("delete_object", &loc.to_path(), |_| backend.delete_object(container, key))
            .await;
        self.invalidate_cache(Some(&loc.to_path()));
        result
    }

    /// Copy one object. Within a container the copy happens server-side;
    /// across containers the bytes relay through a local temporary file that
    /// is removed whatever the outcome.
    pub async fn cp_file(&self, src: &str, dst: &str) -> Result<(), FsError> {
        let from = object_location(src)?;
        let to = object_location(dst)?;
        self.invalidate_cache(Some(&to.to_path()));
        let result = if from.container == to.container {
            let backend = self.backend();
            self.call("copy_object", &to.to_path(), |_| {
                backend.copy_object(&from.container, &from.key, &to.key)
            })
            .await
        } else {
            self.relay_copy(&from, &to).await
        };
        self.invalidate_cache(Some(&to.to_path()));
        result
    }

    async fn relay_copy(&self, from: &ResolvedLocation, to: &ResolvedLocation) -> Result<(), FsError> {
        let dir = self.config().staging_dir.clone().unwrap_or_else(std::env::temp_dir);
        let staged = tempfile::Builder::new()
            .prefix(".ossfs-copy-")
            .tempfile_in(&dir)?
            .into_temp_path();
        debug!(src = %from.to_path(), dst = %to.to_path(), staged = %staged.display(), "Relay copy");
        self.get_file(&from.to_path(), &staged).await?;
        self.put_file(&staged, &to.to_path()).await
    }

    /// Copy a file, or with `recursive` every file below a directory.
    pub async fn cp(&self, src: &str, dst: &str, recursive: bool) -> Result<(), FsError> {
        if !recursive || !AsyncFileSystem::isdir(self, src).await? {
            return self.cp_file(src, dst).await;
        }
        let base = path::normalize(src);
        let dst_base = path::normalize(dst);
        for name in self.find(&base, &FindOptions::default()).await?.keys() {
            let rel = name[base.len()..].trim_start_matches('/');
            self.cp_file(name, &format!("{}/{}", dst_base, rel)).await?;
        }
        Ok(())
    }

    /// Copy then delete the source.
    pub async fn mv(&self, src: &str, dst: &str, recursive: bool) -> Result<(), FsError> {
        self.cp(src, dst, recursive).await?;
        self.rm(&[src], recursive, None).await
    }

    /// Create a directory as a zero-byte `key/` marker. The container must
    /// already exist.
    pub async fn mkdir(&self, target: &str) -> Result<(), FsError> {
        let loc = path::resolve(target);
        if loc.is_root() {
            return Err(FsError::InvalidArgument("cannot create the root".into()));
        }
        self.bucket_info(&loc.container).await?;
        if loc.key.is_empty() {
            return Ok(());
        }
        let marker = ResolvedLocation {
            container: loc.container.clone(),
            key: loc.dir_prefix(),
        };
        self.put_whole(&marker, Bytes::new()).await?;
        self.invalidate_cache(Some(&loc.to_path()));
        Ok(())
    }

    /// Create an empty object, or with `truncate` empty an existing one.
    pub async fn touch(&self, target: &str, truncate: bool) -> Result<(), FsError> {
        if truncate || !self.exists(target).await? {
            return self.pipe(target, Bytes::new()).await;
        }
        Err(FsError::InvalidOperation(format!(
            "{} exists; touch without truncate cannot update it",
            path::normalize(target)
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use ossfs_backend::{MemoryBackend, ObjectBackend, Operation};
    use ossfs_common::backend::BackendError;
    use ossfs_common::error::ErrorKind;

    use crate::config::FsConfig;

    async fn setup(keys: &[&str]) -> (OssFileSystem, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new().with_bucket("b").with_bucket("c"));
        for key in keys {
            backend.put_object("b", key, Bytes::from_static(b"abc")).await.unwrap();
        }
        let fs = OssFileSystem::with_backend(FsConfig::default(), backend.clone()).unwrap();
        (fs, backend)
    }

    const TREE: &[&str] = &["t/a", "t/b", "t/sub/c", "t/sub/deep/d", "t/empty/"];

    #[tokio::test]
    async fn test_walk_levels() {
        let (fs, _) = setup(TREE).await;
        let levels = fs.walk("/b/t", None).await.unwrap();
        let roots: Vec<&str> = levels.iter().map(|l| l.root.as_str()).collect();
        assert_eq!(roots, vec!["/b/t", "/b/t/sub", "/b/t/sub/deep"]);
        assert_eq!(levels[0].files.len(), 2);
        assert_eq!(levels[0].dirs.len(), 2);

        let shallow = fs.walk("/b/t", Some(1)).await.unwrap();
        assert_eq!(shallow.len(), 1);
        assert_eq!(fs.walk("/b/t", Some(0)).await.unwrap_err().kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_find() {
        let (fs, _) = setup(TREE).await;
        let all = fs.find("/b/t", &FindOptions::default()).await.unwrap();
        let names: Vec<&str> = all.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["/b/t/a", "/b/t/b", "/b/t/sub/c", "/b/t/sub/deep/d"]);

        let with_dirs = FindOptions {
            withdirs: true,
            maxdepth: Some(2),
            prefix: None,
        };
        let found = fs.find("/b/t", &with_dirs).await.unwrap();
        assert!(found.contains_key("/b/t/sub/deep"));
        assert!(found.contains_key("/b/t/empty"));
        assert!(!found.contains_key("/b/t/sub/deep/d"));

        let itself = fs.find("/b/t/a", &FindOptions::default()).await.unwrap();
        assert_eq!(itself.keys().collect::<Vec<_>>(), vec!["/b/t/a"]);
    }

    #[tokio::test]
    async fn test_find_prefix() {
        let (fs, _) = setup(&["p/apple", "p/avocado", "p/banana", "p/a-dir/x"]).await;
        let opts = FindOptions {
            prefix: Some("a".into()),
            ..Default::default()
        };
        let found = fs.find("/b/p", &opts).await.unwrap();
        let names: Vec<&str> = found.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["/b/p/a-dir/x", "/b/p/apple", "/b/p/avocado"]);

        let conflicting = FindOptions {
            prefix: Some("a".into()),
            withdirs: true,
            maxdepth: None,
        };
        assert_eq!(fs.find("/b/p", &conflicting).await.unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert_eq!(fs.find("/", &FindOptions::default()).await.unwrap_err().kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_glob() {
        let (fs, _) = setup(&["g/one.txt", "g/two.txt", "g/three.csv", "g/sub/four.txt"]).await;
        assert_eq!(fs.glob("/b/g/*.txt").await.unwrap(), vec!["/b/g/one.txt", "/b/g/two.txt"]);
        assert_eq!(fs.glob("/b/g/t?o.txt").await.unwrap(), vec!["/b/g/two.txt"]);
        assert_eq!(
            fs.glob("/b/g/**/*.txt").await.unwrap(),
            vec!["/b/g/one.txt", "/b/g/sub/four.txt", "/b/g/two.txt"]
        );
        assert_eq!(fs.glob("/b/g/one.txt").await.unwrap(), vec!["/b/g/one.txt"]);
        assert!(fs.glob("/b/g/none").await.unwrap().is_empty());
        assert_eq!(fs.glob("/[bc]").await.unwrap(), vec!["/b", "/c"]);
    }

    #[tokio::test]
    async fn test_du() {
        let (fs, _) = setup(TREE).await;
        assert_eq!(fs.du("/b/t").await.unwrap(), 12);
        assert_eq!(fs.du("/b/t/a").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_rm_file_and_dirs() {
        let (fs, backend) = setup(TREE).await;
        fs.ls("/b/t").await.unwrap();
        fs.rm(&["/b/t/a"], false, None).await.unwrap();
        assert!(!fs.exists("/b/t/a").await.unwrap());
        assert!(fs.ls("/b/t").await.unwrap().iter().all(|e| e.name != "/b/t/a"));

        let err = fs.rm(&["/b/t/sub"], false, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        fs.rm(&["/b/t/empty"], false, None).await.unwrap();
        assert!(backend.object("b", "t/empty/").is_none());

        fs.rm(&["/b/t"], true, None).await.unwrap();
        assert_eq!(backend.object_count("b"), 0);
        assert!(!fs.exists("/b/t").await.unwrap());

        assert!(fs.rm(&["/b/t/gone"], false, None).await.unwrap_err().is_not_found());
        assert!(fs.rm(&["/b/t/gone"], true, None).await.unwrap_err().is_not_found());
        assert_eq!(fs.rm(&["/b"], true, None).await.unwrap_err().kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_rm_batches() {
        let (fs, backend) = setup(&[]).await;
        for i in 0..1500 {
            backend.put_object("b", &format!("many/{i:05}"), Bytes::new()).await.unwrap();
        }
        fs.rm(&["/b/many"], true, None).await.unwrap();
        assert_eq!(backend.calls(Operation::DeleteObjects), 2);
        assert_eq!(backend.object_count("b"), 0);
    }

    #[tokio::test]
    async fn test_bulk_delete() {
        let (fs, backend) = setup(&["x", "y"]).await;
        fs.bulk_delete(&[]).await.unwrap();
        assert_eq!(backend.calls(Operation::DeleteObjects), 0);
        fs.bulk_delete(&["/b/x".to_string(), "/b/y".to_string()]).await.unwrap();
        assert_eq!(backend.object_count("b"), 0);
        let mixed = ["/b/x".to_string(), "/c/y".to_string()];
        assert_eq!(fs.bulk_delete(&mixed).await.unwrap_err().kind(), ErrorKind::InvalidArgument);

        fs.pipe("/b/z", Bytes::from_static(b"z")).await.unwrap();
        fs.rm_file("/b/z").await.unwrap();
        assert!(!fs.exists("/b/z").await.unwrap());
    }

    #[tokio::test]
    async fn test_copy_same_container_is_server_side() {
        let (fs, backend) = setup(&["src"]).await;
        fs.cp_file("/b/src", "/b/dst").await.unwrap();
        assert_eq!(backend.calls(Operation::CopyObject), 1);
        assert_eq!(backend.calls(Operation::GetObject), 0);
        assert_eq!(fs.cat("/b/dst").await.unwrap(), Bytes::from_static(b"abc"));
    }

    #[tokio::test]
    async fn test_copy_across_containers_cleans_up() {
        let staging = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::new().with_bucket("b").with_bucket("c"));
        backend.put_object("b", "src", Bytes::from_static(b"payload")).await.unwrap();
        let config = FsConfig {
            staging_dir: Some(staging.path().to_path_buf()),
            ..Default::default()
        };
        let fs = OssFileSystem::with_backend(config, backend.clone()).unwrap();

        fs.cp_file("/b/src", "/c/dst").await.unwrap();
        assert_eq!(backend.object("c", "dst").unwrap(), Bytes::from_static(b"payload"));
        assert_eq!(std::fs::read_dir(staging.path()).unwrap().count(), 0);

        backend.fail_next(Operation::PutObject, 1, BackendError::service(400, "InvalidArgument", "nope"));
        assert!(fs.cp_file("/b/src", "/c/other").await.is_err());
        assert_eq!(std::fs::read_dir(staging.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_cp_and_mv_recursive() {
        let (fs, backend) = setup(&["d/one", "d/sub/two"]).await;
        fs.cp("/b/d", "/b/copy", true).await.unwrap();
        assert!(backend.object("b", "copy/sub/two").is_some());
        fs.mv("/b/copy", "/c/moved", true).await.unwrap();
        assert!(backend.object("c", "moved/one").is_some());
        assert!(backend.object("b", "copy/one").is_none());
        assert!(!fs.exists("/b/copy").await.unwrap());
    }

    #[tokio::test]
    async fn test_mkdir_and_touch() {
        let (fs, backend) = setup(&[]).await;
        fs.mkdir("/b/newdir").await.unwrap();
        assert_eq!(backend.object("b", "newdir/").unwrap().len(), 0);
        assert!(fs.info("/b/newdir").await.unwrap().is_dir());
        assert!(fs.mkdir("/nobucket/dir").await.unwrap_err().is_not_found());
        assert_eq!(fs.mkdir("/").await.unwrap_err().kind(), ErrorKind::InvalidArgument);

        fs.touch("/b/t", false).await.unwrap();
        assert_eq!(fs.info("/b/t").await.unwrap().size, 0);
        assert_eq!(fs.touch("/b/t", false).await.unwrap_err().kind(), ErrorKind::InvalidOperation);
        fs.pipe("/b/t", Bytes::from_static(b"full")).await.unwrap();
        fs.touch("/b/t", true).await.unwrap();
        assert!(backend.object("b", "t").unwrap().is_empty());
    }
}
