//! Object-storage backends implementing [`ObjectBackend`].
//!
//! - [`s3::S3Backend`]: S3-compatible HTTP endpoints (OSS, MinIO, AWS)
//! - [`memory::MemoryBackend`]: in-process store used by tests and local tooling

pub mod memory;
pub mod s3;

pub use memory::{MemoryBackend, Operation};
pub use ossfs_common::backend::ObjectBackend;
pub use s3::{S3Backend, S3Config};
