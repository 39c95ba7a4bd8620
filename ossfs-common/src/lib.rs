//! Pure pieces shared by the blocking and async filesystem front ends:
//! path resolution, entry classification, the error taxonomy, transfer
//! arithmetic, and the backend contract.

pub mod backend;
pub mod chunking;
pub mod entry;
pub mod error;
pub mod path;

pub use backend::{BackendError, BucketInfo, ListPage, ObjectBackend, ObjectMeta, ObjectSummary, PartInfo};
pub use entry::{EntryInfo, EntryKind};
pub use error::{ErrorKind, FsError};
pub use path::ResolvedLocation;
