//! Directory entries and the delimiter classification that fabricates a
//! hierarchy out of flat key listings.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::backend::{BucketInfo, ListPage, ObjectMeta, ObjectSummary};
use crate::path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

/// One entry of a listing, or the result of `info`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryInfo {
    /// Normalized path (`/container/key`).
    pub name: String,
    pub kind: EntryKind,
    /// Always zero for directories.
    pub size: u64,
    /// Unreliable (absent) for synthetic directories.
    pub last_modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
}

impl EntryInfo {
    pub fn file(name: impl Into<String>, size: u64, last_modified: Option<DateTime<Utc>>) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::File,
            size,
            last_modified,
            etag: None,
        }
    }

    pub fn directory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::Directory,
            size: 0,
            last_modified: None,
            etag: None,
        }
    }

    pub fn from_summary(container: &str, obj: &ObjectSummary) -> Self {
        Self {
            name: path::join(container, &obj.key),
            kind: EntryKind::File,
            size: obj.size,
            last_modified: obj.last_modified,
            etag: obj.etag.clone(),
        }
    }

    pub fn from_meta(name: &str, meta: &ObjectMeta) -> Self {
        Self {
            name: path::normalize(name),
            kind: EntryKind::File,
            size: meta.size,
            last_modified: meta.last_modified,
            etag: meta.etag.clone(),
        }
    }

    pub fn from_bucket(bucket: &BucketInfo) -> Self {
        Self::directory(path::join(&bucket.name, ""))
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    pub fn base_name(&self) -> &str {
        path::base_name(&self.name)
    }
}

/// Turn one listing page into entries.
///
/// Common prefixes become directories with their delimiter trimmed. An
/// object whose key equals the queried prefix is the directory's own marker
/// and is skipped; other marker keys (only seen in flat listings) become
/// directories.
pub fn classify_page(container: &str, prefix: &str, page: &ListPage) -> Vec<EntryInfo> {
    let mut entries = Vec::with_capacity(page.objects.len() + page.common_prefixes.len());
    for common in &page.common_prefixes {
        let key = common.strip_suffix(path::DELIMITER).unwrap_or(common);
        entries.push(EntryInfo::directory(path::join(container, key)));
    }
    for obj in &page.objects {
        if !prefix.is_empty() && obj.key == prefix {
            continue;
        }
        match obj.key.strip_suffix(path::DELIMITER) {
            Some(dir) => entries.push(EntryInfo::directory(path::join(container, dir))),
            None => entries.push(EntryInfo::from_summary(container, obj)),
        }
    }
    entries
}

/// Sort by name, the order every listing is returned in.
pub fn sort_entries(entries: &mut [EntryInfo]) {
    entries.sort_by(|a, b| a.name.cmp(&b.name));
}
