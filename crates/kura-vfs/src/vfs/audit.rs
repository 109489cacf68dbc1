//! Audit logging decorator.
//!
//! [`AuditedFs`] wraps any [`ShareVfs`] and records each protocol call
//! through `tracing`. It never changes a result. Successful namespace
//! changes log at INFO, failures at ERROR, and conditions a well-behaved
//! client triggers routinely (a retried close, a lookup probing for a
//! missing name) at WARN. Data-path successes are not logged.

use async_trait::async_trait;

use super::error::{VfsError, VfsResult};
use super::ops::ShareVfs;
use super::types::{Attributes, DirInfo, Handle, OpenFlags, StatFs};

/// Logging wrapper around a [`ShareVfs`].
#[derive(Debug)]
pub struct AuditedFs<F> {
    inner: F,
    user: String,
}

impl<F: ShareVfs> AuditedFs<F> {
    pub fn new(inner: F, user: impl Into<String>) -> Self {
        Self {
            inner,
            user: user.into(),
        }
    }

    pub fn inner(&self) -> &F {
        &self.inner
    }

    pub fn into_inner(self) -> F {
        self.inner
    }

    fn failed(&self, op: &'static str, handle: Option<Handle>, e: &VfsError) {
        tracing::error!(user = %self.user, op, handle = ?handle, error = %e, "share call failed");
    }
}

#[async_trait]
impl<F: ShareVfs> ShareVfs for AuditedFs<F> {
    async fn open(&self, path: &str, flags: OpenFlags, mode: u32) -> VfsResult<Handle> {
        let result = self.inner.open(path, flags, mode).await;
        match &result {
            Ok(handle) => {
                tracing::info!(user = %self.user, path, flags = format_args!("{:o}", flags.bits()), handle = %handle, "open");
            }
            Err(e) => {
                tracing::error!(user = %self.user, path, flags = format_args!("{:o}", flags.bits()), error = %e, "open failed");
            }
        }
        result
    }

    async fn opendir(&self, path: &str) -> VfsResult<Handle> {
        let result = self.inner.opendir(path).await;
        match &result {
            Ok(handle) => tracing::info!(user = %self.user, path, handle = %handle, "opendir"),
            Err(e) => tracing::error!(user = %self.user, path, error = %e, "opendir failed"),
        }
        result
    }

    async fn close(&self, handle: Handle) -> VfsResult<()> {
        let result = self.inner.close(handle).await;
        match &result {
            Ok(()) => tracing::info!(user = %self.user, handle = %handle, "close"),
            Err(VfsError::BadHandle(_)) => {
                tracing::warn!(user = %self.user, handle = %handle, "duplicate close");
            }
            Err(e) => self.failed("close", Some(handle), e),
        }
        result
    }

    async fn getattr(&self, handle: Handle) -> VfsResult<Attributes> {
        let result = self.inner.getattr(handle).await;
        if let Err(e) = &result {
            self.failed("getattr", Some(handle), e);
        }
        result
    }

    async fn lookup(&self, handle: Handle, name: &str) -> VfsResult<Attributes> {
        let result = self.inner.lookup(handle, name).await;
        match &result {
            Ok(_) => {}
            Err(VfsError::NotFound(_)) => {
                tracing::warn!(user = %self.user, handle = %handle, name, "lookup: not found");
            }
            Err(e) => {
                tracing::error!(user = %self.user, handle = %handle, name, error = %e, "lookup failed");
            }
        }
        result
    }

    async fn read(&self, handle: Handle, buf: &mut [u8], offset: u64) -> VfsResult<usize> {
        let len = buf.len();
        let result = self.inner.read(handle, buf, offset).await;
        if let Err(e) = &result {
            tracing::error!(user = %self.user, handle = %handle, len, offset, error = %e, "read failed");
        }
        result
    }

    async fn write(&self, handle: Handle, buf: &[u8], offset: u64) -> VfsResult<usize> {
        let result = self.inner.write(handle, buf, offset).await;
        if let Err(e) = &result {
            tracing::error!(user = %self.user, handle = %handle, len = buf.len(), offset, error = %e, "write failed");
        }
        result
    }

    async fn readdir(&self, handle: Handle, pos: u64) -> VfsResult<Option<Vec<DirInfo>>> {
        // End of directory is Ok(None) and goes unlogged.
        let result = self.inner.readdir(handle, pos).await;
        if let Err(e) = &result {
            tracing::error!(user = %self.user, handle = %handle, pos, error = %e, "readdir failed");
        }
        result
    }

    async fn mkdir(&self, path: &str, mode: u32) -> VfsResult<Attributes> {
        let result = self.inner.mkdir(path, mode).await;
        match &result {
            Ok(_) => tracing::info!(user = %self.user, path, mode = format_args!("{mode:o}"), "mkdir"),
            Err(e) => tracing::error!(user = %self.user, path, error = %e, "mkdir failed"),
        }
        result
    }

    async fn unlink(&self, handle: Handle) -> VfsResult<()> {
        let result = self.inner.unlink(handle).await;
        match &result {
            Ok(()) => tracing::info!(user = %self.user, handle = %handle, "unlink"),
            Err(e) => self.failed("unlink", Some(handle), e),
        }
        result
    }

    async fn rename(&self, handle: Handle, new_path: &str) -> VfsResult<()> {
        let result = self.inner.rename(handle, new_path).await;
        match &result {
            Ok(()) => tracing::info!(user = %self.user, handle = %handle, to = new_path, "rename"),
            Err(e) => {
                tracing::error!(user = %self.user, handle = %handle, to = new_path, error = %e, "rename failed");
            }
        }
        result
    }

    async fn flush(&self, handle: Handle) -> VfsResult<()> {
        self.inner.flush(handle).await
    }

    async fn fsync(&self, handle: Handle) -> VfsResult<()> {
        self.inner.fsync(handle).await
    }

    async fn statfs(&self, handle: Handle) -> VfsResult<StatFs> {
        self.inner.statfs(handle).await
    }

    async fn setattr(&self, handle: Handle, attributes: &Attributes) -> VfsResult<Attributes> {
        self.inner.setattr(handle, attributes).await
    }

    async fn truncate(&self, handle: Handle, size: u64) -> VfsResult<()> {
        self.inner.truncate(handle, size).await
    }

    async fn symlink(&self, handle: Handle, target: &str, mode: u32) -> VfsResult<Attributes> {
        self.inner.symlink(handle, target, mode).await
    }

    async fn readlink(&self, handle: Handle) -> VfsResult<String> {
        self.inner.readlink(handle).await
    }

    async fn link(&self, handle: Handle, new_path: &str) -> VfsResult<Attributes> {
        self.inner.link(handle, new_path).await
    }

    async fn listxattr(&self, handle: Handle) -> VfsResult<Vec<String>> {
        self.inner.listxattr(handle).await
    }

    async fn getxattr(&self, handle: Handle, name: &str) -> VfsResult<Vec<u8>> {
        self.inner.getxattr(handle, name).await
    }

    async fn setxattr(&self, handle: Handle, name: &str, value: &[u8]) -> VfsResult<()> {
        self.inner.setxattr(handle, name, value).await
    }

    async fn removexattr(&self, handle: Handle, name: &str) -> VfsResult<()> {
        self.inner.removexattr(handle, name).await
    }
}
