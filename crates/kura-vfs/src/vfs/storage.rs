//! Storage facade contracts.
//!
//! The share VFS does not talk to cloud stores, git trees or disks
//! directly. It consumes one [`StorageFs`] implementation, which in turn
//! hands back background [`Job`]s for uploads. Everything here is
//! addressed by full backend path (the user's base path already joined).

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use tempfile::TempPath;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use super::error::VfsResult;
use crate::limit::RateLimiter;

/// Backend object descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Full backend path of the object.
    pub path: String,
    /// Base name.
    pub name: String,
    /// Size in bytes (0 for folders).
    pub size: u64,
    /// Last modification time.
    pub modified: SystemTime,
    /// Whether this is a folder.
    pub is_folder: bool,
}

impl ObjectInfo {
    /// Describe a file.
    pub fn file(path: impl Into<String>, size: u64, modified: SystemTime) -> Self {
        let path = path.into();
        let name = super::path::base_name(&path).to_string();
        Self {
            path,
            name,
            size,
            modified,
            is_folder: false,
        }
    }

    /// Describe a folder.
    pub fn folder(path: impl Into<String>, modified: SystemTime) -> Self {
        let path = path.into();
        let name = super::path::base_name(&path).to_string();
        Self {
            path,
            name,
            size: 0,
            modified,
            is_folder: true,
        }
    }
}

/// A resolved read link (usually a URL the adapter can fetch ranges from).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub url: String,
}

impl Link {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

/// Random-access byte source for an open read link.
#[async_trait]
pub trait RangeReader: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`.
    ///
    /// Returns 0 at or past the end of the object.
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> VfsResult<usize>;

    /// Total size of the object.
    fn size(&self) -> u64;

    /// Release any connection held by the reader.
    async fn close(&self) -> VfsResult<()> {
        Ok(())
    }
}

/// Background job state, as reported by the job tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    WaitingRetry,
    Canceling,
    Succeeded,
    Failed,
    Canceled,
}

impl JobState {
    /// Succeeded, failed or canceled.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

/// A background upload submitted to the storage facade.
pub trait Job: Send + Sync + std::fmt::Debug {
    /// Tracker-assigned identifier.
    fn id(&self) -> &str;

    /// Current state. Polled, never awaited.
    fn state(&self) -> JobState;

    /// Number of bytes being committed.
    fn total_bytes(&self) -> u64;

    /// When the job started, if it has.
    fn start_time(&self) -> Option<SystemTime>;
}

/// Shared job handle.
pub type JobRef = Arc<dyn Job>;

/// A fully staged upload, handed to [`StorageFs::put_as_job`].
///
/// Owns the scratch file; it is deleted when the upload is dropped.
pub struct Upload {
    /// Destination base name.
    pub name: String,
    /// Number of staged bytes.
    pub size: u64,
    /// Modification time to record.
    pub modified: SystemTime,
    /// Sniffed content type.
    pub mimetype: String,
    file: File,
    scratch: TempPath,
    limiter: Arc<RateLimiter>,
}

impl std::fmt::Debug for Upload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upload")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("mimetype", &self.mimetype)
            .field("scratch", &self.scratch)
            .finish()
    }
}

impl Upload {
    /// `file` must be positioned at the start of the staged content.
    pub fn new(
        name: impl Into<String>,
        size: u64,
        modified: SystemTime,
        mimetype: impl Into<String>,
        file: File,
        scratch: TempPath,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            name: name.into(),
            size,
            modified,
            mimetype: mimetype.into(),
            file,
            scratch,
            limiter,
        }
    }

    /// Scratch file location.
    pub fn scratch_path(&self) -> &std::path::Path {
        &self.scratch
    }

    /// Read the whole staged content, charging the server-upload limiter.
    pub async fn read_to_end(mut self) -> VfsResult<Vec<u8>> {
        let mut data = Vec::with_capacity(self.size as usize);
        let mut chunk = vec![0u8; 64 * 1024];
        loop {
            let n = self.file.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            self.limiter.wait_n(n).await;
            data.extend_from_slice(&chunk[..n]);
        }
        Ok(data)
    }

    /// Take the raw scratch file for adapters that stream it themselves.
    ///
    /// The returned [`TempPath`] deletes the file when dropped. Bytes read
    /// this way are not rate limited; use [`Upload::limiter`] to charge them.
    pub fn into_parts(self) -> (File, TempPath) {
        (self.file, self.scratch)
    }

    /// The server-upload limiter this upload should be charged against.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }
}

/// Path-addressed storage facade consumed by the share VFS.
///
/// Adapters report missing objects as `NotFound`, authorization failures
/// as `PermissionDenied`, and type mismatches as `NotADirectory` /
/// `IsADirectory`. Anything else should be wrapped with
/// [`VfsError::backend`](super::VfsError::backend) and is passed through
/// to the protocol layer untouched.
#[async_trait]
pub trait StorageFs: Send + Sync {
    /// Get object metadata.
    async fn get(&self, path: &str) -> VfsResult<ObjectInfo>;

    /// List the children of a folder.
    async fn list(&self, path: &str) -> VfsResult<Vec<ObjectInfo>>;

    /// Resolve a read link for a file, with refreshed metadata.
    async fn link(&self, path: &str) -> VfsResult<(Link, ObjectInfo)>;

    /// Open a random-access reader over a resolved link.
    async fn open_link(&self, link: &Link, obj: &ObjectInfo) -> VfsResult<Box<dyn RangeReader>>;

    /// Create folder `name` under `parent`.
    async fn make_dir(&self, parent: &str, name: &str) -> VfsResult<()>;

    /// Remove an object.
    async fn remove(&self, path: &str) -> VfsResult<()>;

    /// Rename an object in place.
    async fn rename(&self, path: &str, new_name: &str) -> VfsResult<()>;

    /// Move an object into another folder, keeping its name.
    async fn move_to(&self, path: &str, dst_dir: &str) -> VfsResult<()>;

    /// Submit a staged upload into `dst_dir` as a background job.
    ///
    /// Returns `None` when the adapter committed synchronously and there
    /// is nothing to poll.
    async fn put_as_job(&self, dst_dir: &str, upload: Upload) -> VfsResult<Option<JobRef>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_object_info_names() {
        let f = ObjectInfo::file("/docs/report.pdf", 10, SystemTime::UNIX_EPOCH);
        assert_eq!(f.name, "report.pdf");
        assert!(!f.is_folder);

        let d = ObjectInfo::folder("/docs", SystemTime::UNIX_EPOCH);
        assert_eq!(d.name, "docs");
        assert!(d.is_folder);
    }

    #[test]
    fn test_job_state_terminal() {
        assert!(JobState::Succeeded.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Canceled.is_terminal());
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Canceling.is_terminal());
    }

    #[tokio::test]
    async fn test_upload_read_to_end() {
        let mut named = tempfile::NamedTempFile::new().unwrap();
        named.write_all(b"staged bytes").unwrap();
        let (file, scratch) = named.into_parts();
        let path = scratch.to_path_buf();
        let mut file = File::from_std(file);
        tokio::io::AsyncSeekExt::rewind(&mut file).await.unwrap();

        let upload = Upload::new(
            "a.txt",
            12,
            SystemTime::now(),
            "text/plain",
            file,
            scratch,
            Arc::new(RateLimiter::unlimited()),
        );
        assert_eq!(upload.read_to_end().await.unwrap(), b"staged bytes");
        assert!(!path.exists(), "scratch file should be removed");
    }
}
