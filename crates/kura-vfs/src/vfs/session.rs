//! Read and write sessions.
//!
//! A session is the state behind one open handle. Read sessions wrap a
//! backend object and open their byte stream lazily; write sessions own
//! a local scratch file that becomes an [`Upload`] on close.

use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::SystemTime;

use tempfile::TempPath;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, OnceCell};

use super::attr;
use super::auth::{Access, AccessGate};
use super::error::{VfsError, VfsResult};
use super::path;
use super::sniff;
use super::storage::{ObjectInfo, RangeReader, StorageFs, Upload};
use super::types::Attributes;
use crate::limit::{LimitedReader, RateLimiter};

type Stream = Result<Arc<dyn RangeReader>, VfsError>;

/// State of a handle opened for reading or directory enumeration.
pub struct ReadSession {
    path: String,
    backend_path: String,
    obj: ObjectInfo,
    stream: OnceCell<Stream>,
    enumerated: AtomicBool,
}

impl std::fmt::Debug for ReadSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadSession")
            .field("path", &self.path)
            .field("backend_path", &self.backend_path)
            .field("is_folder", &self.obj.is_folder)
            .field("stream_open", &self.stream.initialized())
            .finish()
    }
}

impl ReadSession {
    pub fn new(path: impl Into<String>, backend_path: impl Into<String>, obj: ObjectInfo) -> Self {
        Self {
            path: path.into(),
            backend_path: backend_path.into(),
            obj,
            stream: OnceCell::new(),
            enumerated: AtomicBool::new(false),
        }
    }

    /// Logical share path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Backend path (user base path joined).
    pub fn backend_path(&self) -> &str {
        &self.backend_path
    }

    pub fn object(&self) -> &ObjectInfo {
        &self.obj
    }

    pub fn is_dir(&self) -> bool {
        self.obj.is_folder
    }

    pub fn attributes(&self) -> VfsResult<Attributes> {
        attr::object_attributes(&self.obj)
    }

    /// Mark the directory as enumerated. Returns true only for the first
    /// caller.
    pub fn begin_enumeration(&self) -> bool {
        !self.enumerated.swap(true, Ordering::AcqRel)
    }

    pub fn is_enumerated(&self) -> bool {
        self.enumerated.load(Ordering::Acquire)
    }

    /// Read at `offset`, opening the backend stream on first use.
    ///
    /// Initialization runs at most once. If it fails, every later read
    /// returns the same error.
    pub async fn read_at(
        &self,
        buf: &mut [u8],
        offset: u64,
        gate: &AccessGate,
        storage: &dyn StorageFs,
        limiter: &Arc<RateLimiter>,
    ) -> VfsResult<usize> {
        let stream = self
            .stream
            .get_or_init(|| self.open_stream(gate, storage, limiter))
            .await
            .clone()?;
        if offset >= stream.size() {
            return Ok(0);
        }
        stream.read_at(buf, offset).await
    }

    async fn open_stream(
        &self,
        gate: &AccessGate,
        storage: &dyn StorageFs,
        limiter: &Arc<RateLimiter>,
    ) -> Stream {
        if self.obj.is_folder {
            return Err(VfsError::is_a_directory(&self.path));
        }
        // Access may have been revoked since the handle was opened.
        gate.check(&self.backend_path, Access::Read).await?;

        let (link, obj) = storage.link(&self.backend_path).await?;
        let reader = storage.open_link(&link, &obj).await?;
        tracing::debug!(path = %self.backend_path, size = obj.size, "opened read stream");
        Ok(Arc::new(LimitedReader::new(reader, Arc::clone(limiter))))
    }

    /// Release the backend stream, if one was opened.
    pub async fn close(&self) -> VfsResult<()> {
        match self.stream.get() {
            Some(Ok(stream)) => stream.close().await,
            _ => Ok(()),
        }
    }
}

struct Staged {
    file: File,
    scratch: TempPath,
}

/// State of a handle opened for writing: a scratch file staging the
/// bytes until close.
pub struct WriteSession {
    path: String,
    backend_path: String,
    staged: Mutex<Option<Staged>>,
    high_water: AtomicU64,
}

impl std::fmt::Debug for WriteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteSession")
            .field("path", &self.path)
            .field("backend_path", &self.backend_path)
            .field("len", &self.len())
            .finish()
    }
}

impl WriteSession {
    /// Create a fresh, empty scratch file in `temp_dir`.
    pub async fn create(
        temp_dir: &Path,
        path: impl Into<String>,
        backend_path: impl Into<String>,
    ) -> VfsResult<Self> {
        let dir = temp_dir.to_path_buf();
        let named = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new().prefix("kura-").tempfile_in(dir)
        })
        .await
        .map_err(|e| VfsError::other(format!("scratch file task failed: {e}")))??;
        let (file, scratch) = named.into_parts();

        Ok(Self {
            path: path.into(),
            backend_path: backend_path.into(),
            staged: Mutex::new(Some(Staged {
                file: File::from_std(file),
                scratch,
            })),
            high_water: AtomicU64::new(0),
        })
    }

    /// Logical share path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Backend path the upload will be committed to.
    pub fn backend_path(&self) -> &str {
        &self.backend_path
    }

    /// Highest byte offset written so far.
    pub fn len(&self) -> u64 {
        self.high_water.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn gone(&self) -> VfsError {
        VfsError::other(format!("{}: write session already committed", self.path))
    }

    pub async fn read_at(&self, buf: &mut [u8], offset: u64) -> VfsResult<usize> {
        let mut staged = self.staged.lock().await;
        let staged = staged.as_mut().ok_or_else(|| self.gone())?;
        staged.file.seek(SeekFrom::Start(offset)).await?;

        let mut filled = 0;
        while filled < buf.len() {
            let n = staged.file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    pub async fn write_at(&self, buf: &[u8], offset: u64) -> VfsResult<usize> {
        let mut staged = self.staged.lock().await;
        let staged = staged.as_mut().ok_or_else(|| self.gone())?;
        staged.file.seek(SeekFrom::Start(offset)).await?;
        staged.file.write_all(buf).await?;
        staged.file.flush().await?;
        self.high_water
            .fetch_max(offset + buf.len() as u64, Ordering::AcqRel);
        Ok(buf.len())
    }

    /// Push staged bytes to disk.
    pub async fn flush(&self) -> VfsResult<()> {
        let mut staged = self.staged.lock().await;
        let staged = staged.as_mut().ok_or_else(|| self.gone())?;
        staged.file.flush().await?;
        staged.file.sync_all().await?;
        Ok(())
    }

    /// Attributes of the scratch file.
    pub async fn attributes(&self) -> VfsResult<Attributes> {
        let staged = self.staged.lock().await;
        let staged = staged.as_ref().ok_or_else(|| self.gone())?;
        attr::scratch_attributes(&staged.file, &self.backend_path).await
    }

    /// Turn the staged bytes into an [`Upload`] for the storage facade.
    ///
    /// The content type is sniffed from the first bytes, size is the
    /// scratch file length, and the modification time is now. The
    /// session is unusable afterwards.
    pub async fn into_upload(&self, limiter: Arc<RateLimiter>) -> VfsResult<Upload> {
        let Staged { mut file, scratch } =
            self.staged.lock().await.take().ok_or_else(|| self.gone())?;

        file.flush().await?;
        let size = file.metadata().await?.len();

        file.rewind().await?;
        let mut head = vec![0u8; sniff::SNIFF_LEN];
        let mut filled = 0;
        while filled < head.len() {
            let n = file.read(&mut head[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        let mimetype = sniff::detect_content_type(&head[..filled]);
        file.rewind().await?;

        Ok(Upload::new(
            path::base_name(&self.backend_path),
            size,
            SystemTime::now(),
            mimetype,
            file,
            scratch,
            limiter,
        ))
    }

    /// Drop the staged bytes without committing.
    pub async fn discard(&self) {
        if let Some(staged) = self.staged.lock().await.take() {
            tracing::debug!(path = %self.backend_path, scratch = %staged.scratch.display(), "discarding staged upload");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::auth::{Permissions, User};
    use crate::vfs::backends::{MemoryMetaStore, MemoryStorage};

    fn gate(perms: Permissions) -> AccessGate {
        let user = Arc::new(User::new("amy", "/", perms));
        AccessGate::new(user, Arc::new(MemoryMetaStore::new()), "")
    }

    #[tokio::test]
    async fn test_write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let session = WriteSession::create(dir.path(), "/a.txt", "/a.txt").await.unwrap();

        assert_eq!(session.write_at(b"hello", 0).await.unwrap(), 5);
        assert_eq!(session.write_at(b"world", 10).await.unwrap(), 5);
        assert_eq!(session.len(), 15);

        let mut buf = [0u8; 32];
        let n = session.read_at(&mut buf, 0).await.unwrap();
        assert_eq!(n, 15);
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(&buf[10..15], b"world");

        let attr = session.attributes().await.unwrap();
        assert_eq!(attr.size, 15);
    }

    #[tokio::test]
    async fn test_into_upload_sniffs_and_consumes() {
        let dir = tempfile::tempdir().unwrap();
        let session = WriteSession::create(dir.path(), "/doc.pdf", "/home/doc.pdf")
            .await
            .unwrap();
        session.write_at(b"%PDF-1.4 body", 0).await.unwrap();

        let upload = session
            .into_upload(Arc::new(RateLimiter::unlimited()))
            .await
            .unwrap();
        assert_eq!(upload.name, "doc.pdf");
        assert_eq!(upload.size, 13);
        assert_eq!(upload.mimetype, "application/pdf");

        let mut buf = [0u8; 4];
        assert!(session.read_at(&mut buf, 0).await.is_err());
        assert_eq!(upload.read_to_end().await.unwrap(), b"%PDF-1.4 body");
    }

    #[tokio::test]
    async fn test_discard_removes_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let session = WriteSession::create(dir.path(), "/a", "/a").await.unwrap();
        session.write_at(b"x", 0).await.unwrap();
        session.discard().await;
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_read_session_streams_backend() {
        let storage = MemoryStorage::new();
        storage.put_file("/notes.txt", b"0123456789");
        let obj = storage.get("/notes.txt").await.unwrap();
        let session = ReadSession::new("/notes.txt", "/notes.txt", obj);
        let limiter = Arc::new(RateLimiter::unlimited());
        let gate = gate(Permissions::READ);

        let mut buf = [0u8; 4];
        let n = session.read_at(&mut buf, 3, &gate, &storage, &limiter).await.unwrap();
        assert_eq!(&buf[..n], b"3456");

        let n = session.read_at(&mut buf, 10, &gate, &storage, &limiter).await.unwrap();
        assert_eq!(n, 0);
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_failure_is_sticky() {
        let storage = MemoryStorage::new();
        storage.put_file("/locked.txt", b"secret");
        let obj = storage.get("/locked.txt").await.unwrap();
        let session = ReadSession::new("/locked.txt", "/locked.txt", obj);
        let limiter = Arc::new(RateLimiter::unlimited());

        let mut buf = [0u8; 4];
        let denied = gate(Permissions::empty());
        assert!(matches!(
            session.read_at(&mut buf, 0, &denied, &storage, &limiter).await,
            Err(VfsError::PermissionDenied(_))
        ));

        // Even with a permitted gate the remembered failure is returned.
        let allowed = gate(Permissions::READ);
        assert!(matches!(
            session.read_at(&mut buf, 0, &allowed, &storage, &limiter).await,
            Err(VfsError::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_folder_read_is_a_directory() {
        let storage = MemoryStorage::new();
        storage.put_folder("/docs");
        let obj = storage.get("/docs").await.unwrap();
        let session = ReadSession::new("/docs", "/docs", obj);
        let limiter = Arc::new(RateLimiter::unlimited());

        let mut buf = [0u8; 4];
        let err = session
            .read_at(&mut buf, 0, &gate(Permissions::READ), &storage, &limiter)
            .await
            .unwrap_err();
        assert!(matches!(err, VfsError::IsADirectory(_)));
        assert!(!session.is_enumerated());
        assert!(session.begin_enumeration());
        assert!(session.is_enumerated());
        assert!(!session.begin_enumeration());
    }
}
