//! Share VFS operations trait.
//!
//! This is the surface a file-sharing protocol server drives: handle
//! based, with explicit offsets and one-shot directory enumeration.
//! Paths are logical share paths, relative to the session user's root.

use async_trait::async_trait;

use super::error::{VfsError, VfsResult};
use super::types::{Attributes, DirInfo, Handle, OpenFlags, StatFs};

/// Handle-oriented filesystem operations for one protocol session.
#[async_trait]
pub trait ShareVfs: Send + Sync {
    // ========================================================================
    // Handles
    // ========================================================================

    /// Open a file.
    ///
    /// Read-only opens register a read session. Create or create+truncate
    /// opens with read-write access stage a new upload. Append is never
    /// supported, nor is in-place rewriting of a committed object.
    async fn open(&self, path: &str, flags: OpenFlags, mode: u32) -> VfsResult<Handle>;

    /// Open a directory for enumeration.
    async fn opendir(&self, path: &str) -> VfsResult<Handle>;

    /// Close a handle. Closing a write handle submits the upload.
    ///
    /// A second close of the same handle returns `BadHandle` and changes
    /// nothing.
    async fn close(&self, handle: Handle) -> VfsResult<()>;

    /// Attributes of the resource behind a handle.
    async fn getattr(&self, handle: Handle) -> VfsResult<Attributes>;

    /// Attributes of `name` inside the directory behind `handle`.
    async fn lookup(&self, handle: Handle, name: &str) -> VfsResult<Attributes>;

    // ========================================================================
    // Data
    // ========================================================================

    /// Read up to `buf.len()` bytes at `offset`. Returns 0 at end of file.
    async fn read(&self, handle: Handle, buf: &mut [u8], offset: u64) -> VfsResult<usize>;

    /// Write `buf` at `offset` into a staged upload.
    async fn write(&self, handle: Handle, buf: &[u8], offset: u64) -> VfsResult<usize>;

    /// Enumerate a directory.
    ///
    /// Only the first successful call at position 0 returns entries; every
    /// later call, and any call at a non-zero position, returns `None`.
    /// A call that fails leaves the directory unread, so it can be retried.
    /// Resuming from an arbitrary position is not supported.
    async fn readdir(&self, handle: Handle, pos: u64) -> VfsResult<Option<Vec<DirInfo>>>;

    // ========================================================================
    // Namespace
    // ========================================================================

    /// Create a directory.
    async fn mkdir(&self, path: &str, mode: u32) -> VfsResult<Attributes>;

    /// Remove the object behind a read handle. The handle is released
    /// whether or not the removal succeeds.
    async fn unlink(&self, handle: Handle) -> VfsResult<()>;

    /// Rename or move the object behind a read handle to `new_path`. The
    /// handle is released whether or not the rename succeeds.
    async fn rename(&self, handle: Handle, new_path: &str) -> VfsResult<()>;

    // ========================================================================
    // Sync
    // ========================================================================

    /// Flush staged bytes of a write handle to disk.
    async fn flush(&self, handle: Handle) -> VfsResult<()>;

    async fn fsync(&self, _handle: Handle) -> VfsResult<()> {
        Ok(())
    }

    async fn statfs(&self, _handle: Handle) -> VfsResult<StatFs> {
        Ok(StatFs::default())
    }

    // ========================================================================
    // Not supported
    // ========================================================================

    async fn setattr(&self, _handle: Handle, _attributes: &Attributes) -> VfsResult<Attributes> {
        Err(VfsError::NotSupported)
    }

    async fn truncate(&self, _handle: Handle, _size: u64) -> VfsResult<()> {
        Err(VfsError::NotSupported)
    }

    async fn symlink(&self, _handle: Handle, _target: &str, _mode: u32) -> VfsResult<Attributes> {
        Err(VfsError::NotSupported)
    }

    async fn readlink(&self, _handle: Handle) -> VfsResult<String> {
        Err(VfsError::NotSupported)
    }

    async fn link(&self, _handle: Handle, _new_path: &str) -> VfsResult<Attributes> {
        Err(VfsError::NotSupported)
    }

    async fn listxattr(&self, _handle: Handle) -> VfsResult<Vec<String>> {
        Err(VfsError::NotSupported)
    }

    async fn getxattr(&self, _handle: Handle, _name: &str) -> VfsResult<Vec<u8>> {
        Err(VfsError::NotSupported)
    }

    async fn setxattr(&self, _handle: Handle, _name: &str, _value: &[u8]) -> VfsResult<()> {
        Err(VfsError::NotSupported)
    }

    async fn removexattr(&self, _handle: Handle, _name: &str) -> VfsResult<()> {
        Err(VfsError::NotSupported)
    }

    // ========================================================================
    // Convenience methods (default implementations)
    // ========================================================================

    /// Read the whole resource behind a handle.
    async fn read_all(&self, handle: Handle) -> VfsResult<Vec<u8>> {
        let mut data = Vec::new();
        let mut chunk = vec![0u8; 64 * 1024];
        loop {
            let n = self.read(handle, &mut chunk, data.len() as u64).await?;
            if n == 0 {
                return Ok(data);
            }
            data.extend_from_slice(&chunk[..n]);
        }
    }

    /// Open `path` for create+truncate, write `data`, and close.
    ///
    /// On a write error the handle stays open so nothing partial is
    /// submitted; it is released when the session disconnects.
    async fn write_all(&self, path: &str, data: &[u8]) -> VfsResult<()> {
        let handle = self.open(path, OpenFlags::create_truncate(), 0o644).await?;
        self.write(handle, data, 0).await?;
        self.close(handle).await
    }
}
