//! A filesystem view over object storage.
//!
//! Paths look like `/bucket/key/parts` (optionally `oss://` or endpoint-URL
//! prefixed). Directories are inferred from key prefixes; a listing of a
//! directory is cached until a write under it invalidates the entry.
//!
//! [`OssFileSystem`] is the async implementation; [`BlockingFileSystem`]
//! drives the same code from synchronous callers.

pub mod blocking;
pub mod bulk;
pub mod config;
pub mod dircache;
pub mod file;
pub mod fs;
pub mod listing;
mod metadata;
pub mod read_cache;
pub mod traits;
mod transfer;

pub use blocking::{BlockingFile, BlockingFileSystem};
pub use bulk::{FindOptions, WalkEntry};
pub use config::{CacheType, Credentials, FsConfig, UploadStrategy};
pub use dircache::DirCache;
pub use file::{OpenMode, OpenOptions, OssFile};
pub use fs::OssFileSystem;
pub use listing::ListOptions;
pub use traits::{AsyncFileSystem, FileSystem};

pub use ossfs_common::{EntryInfo, EntryKind, ErrorKind, FsError};
