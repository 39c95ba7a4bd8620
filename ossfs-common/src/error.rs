//! Filesystem error taxonomy and the translation from backend errors.

use std::io;

use crate::backend::BackendError;

/// Service codes that mean the addressed container or key does not exist.
const NOT_FOUND_CODES: &[&str] = &["NoSuchBucket", "NoSuchKey", "NoSuchUpload"];
/// Service codes that mean access control rejected the call.
const DENIED_CODES: &[&str] = &["AccessDenied", "InvalidAccessKeyId", "SignatureDoesNotMatch"];

#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("not found: {path}")]
    NotFound {
        path: String,
        #[source]
        source: Option<BackendError>,
    },
    #[error("permission denied: {path}")]
    PermissionDenied {
        path: String,
        #[source]
        source: Option<BackendError>,
    },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("transient I/O failure on {path}")]
    Transient {
        path: String,
        #[source]
        source: BackendError,
    },
    #[error("I/O failure on {path}")]
    Io {
        path: String,
        #[source]
        source: BackendError,
    },
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("local I/O error: {0}")]
    Local(#[from] io::Error),
}

/// Flat classification of [`FsError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    PermissionDenied,
    InvalidArgument,
    AlreadyExists,
    TransientIo,
    GenericIo,
    InvalidOperation,
}

impl FsError {
    pub fn not_found(path: impl Into<String>) -> Self {
        FsError::NotFound {
            path: path.into(),
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            FsError::NotFound { .. } => ErrorKind::NotFound,
            FsError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            FsError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            FsError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            FsError::Transient { .. } => ErrorKind::TransientIo,
            FsError::Io { .. } | FsError::Local(_) => ErrorKind::GenericIo,
            FsError::InvalidOperation(_) => ErrorKind::InvalidOperation,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Missing or inaccessible: the two outcomes a boolean probe folds into `false`.
    pub fn is_absent(&self) -> bool {
        matches!(self.kind(), ErrorKind::NotFound | ErrorKind::PermissionDenied)
    }

    /// The untranslated backend error, when there was one.
    pub fn backend_source(&self) -> Option<&BackendError> {
        match self {
            FsError::NotFound { source, .. } | FsError::PermissionDenied { source, .. } => {
                source.as_ref()
            }
            FsError::Transient { source, .. } | FsError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Map a backend error for `path` onto the filesystem taxonomy.
pub fn translate(err: BackendError, path: &str) -> FsError {
    let path = path.to_string();
    match &err {
        BackendError::Client(msg) => FsError::InvalidArgument(msg.clone()),
        BackendError::Request(_) => FsError::Transient { path, source: err },
        BackendError::Service { status, code, .. } => {
            if NOT_FOUND_CODES.contains(&code.as_str()) || (*status == 404 && code.is_empty()) {
                FsError::NotFound {
                    path,
                    source: Some(err),
                }
            } else if DENIED_CODES.contains(&code.as_str()) || (*status == 403 && code.is_empty()) {
                FsError::PermissionDenied {
                    path,
                    source: Some(err),
                }
            } else if err.is_transient() {
                FsError::Transient { path, source: err }
            } else {
                FsError::Io { path, source: err }
            }
        }
    }
}

impl From<FsError> for io::Error {
    fn from(err: FsError) -> Self {
        let kind = match err.kind() {
            ErrorKind::NotFound => io::ErrorKind::NotFound,
            ErrorKind::PermissionDenied => io::ErrorKind::PermissionDenied,
            ErrorKind::InvalidArgument => io::ErrorKind::InvalidInput,
            ErrorKind::AlreadyExists => io::ErrorKind::AlreadyExists,
            ErrorKind::TransientIo => io::ErrorKind::Interrupted,
            ErrorKind::InvalidOperation => io::ErrorKind::Unsupported,
            ErrorKind::GenericIo => match err {
                FsError::Local(io_err) => return io_err,
                _ => io::ErrorKind::Other,
            },
        };
        io::Error::new(kind, err)
    }
}
