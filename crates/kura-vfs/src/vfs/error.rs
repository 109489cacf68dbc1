//! Share VFS error taxonomy.

use std::io;
use std::sync::Arc;
use thiserror::Error;

use super::types::Handle;

/// VFS error type.
///
/// Cloneable so a failed lazy stream can be replayed on every later read
/// of the same handle. I/O and adapter errors are shared, not copied.
#[derive(Debug, Clone, Error)]
pub enum VfsError {
    /// Unknown or already-closed handle.
    #[error("bad handle: {0}")]
    BadHandle(Handle),

    /// File or directory not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Path already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Permission denied.
    ///
    /// Raised for both metadata password failures and missing capability
    /// bits; the two are never distinguished.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Operation intentionally not implemented.
    #[error("operation not supported")]
    NotSupported,

    /// A background upload for this path has not finished yet.
    #[error("resource busy: {0}")]
    Busy(String),

    /// Expected a file.
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// Expected a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Invalid path (e.g. escapes the user's base path).
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Local I/O error, usually on a scratch file.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// Storage adapter failure, surfaced unchanged.
    #[error("{0}")]
    Backend(Arc<anyhow::Error>),

    #[error("{0}")]
    Other(String),
}

impl VfsError {
    // Constructors take the offending path, or a message for `other`.

    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists(path.into())
    }

    pub fn permission_denied(path: impl Into<String>) -> Self {
        Self::PermissionDenied(path.into())
    }

    /// The path has an upload in flight; clients may retry.
    pub fn busy(path: impl Into<String>) -> Self {
        Self::Busy(path.into())
    }

    pub fn is_a_directory(path: impl Into<String>) -> Self {
        Self::IsADirectory(path.into())
    }

    pub fn not_a_directory(path: impl Into<String>) -> Self {
        Self::NotADirectory(path.into())
    }

    pub fn invalid_path(path: impl Into<String>) -> Self {
        Self::InvalidPath(path.into())
    }

    /// Wrap an opaque storage adapter error.
    pub fn backend(err: impl Into<anyhow::Error>) -> Self {
        Self::Backend(Arc::new(err.into()))
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Returns true for [`VfsError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns true for [`VfsError::BadHandle`].
    pub fn is_bad_handle(&self) -> bool {
        matches!(self, Self::BadHandle(_))
    }
}

impl From<io::Error> for VfsError {
    fn from(e: io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

/// Convert VfsError to std::io::Error so protocol layers can map it to
/// their own status codes.
impl From<VfsError> for io::Error {
    fn from(e: VfsError) -> Self {
        match e {
            VfsError::BadHandle(h) => {
                io::Error::new(io::ErrorKind::InvalidInput, format!("bad handle: {h}"))
            }
            VfsError::NotFound(msg) => io::Error::new(io::ErrorKind::NotFound, msg),
            VfsError::AlreadyExists(msg) => io::Error::new(io::ErrorKind::AlreadyExists, msg),
            VfsError::PermissionDenied(msg) => {
                io::Error::new(io::ErrorKind::PermissionDenied, msg)
            }
            VfsError::NotSupported => {
                io::Error::new(io::ErrorKind::Unsupported, "operation not supported")
            }
            VfsError::Busy(msg) => io::Error::new(io::ErrorKind::ResourceBusy, msg),
            VfsError::IsADirectory(msg) => io::Error::new(io::ErrorKind::IsADirectory, msg),
            VfsError::NotADirectory(msg) => io::Error::new(io::ErrorKind::NotADirectory, msg),
            VfsError::InvalidPath(msg) => io::Error::new(io::ErrorKind::InvalidInput, msg),
            VfsError::Io(e) => io::Error::new(e.kind(), e.to_string()),
            VfsError::Backend(e) => io::Error::other(e.to_string()),
            VfsError::Other(msg) => io::Error::other(msg),
        }
    }
}

/// VFS result type.
pub type VfsResult<T> = Result<T, VfsError>;
