//! Share state and per-client sessions.
//!
//! A [`Share`] is built once per exported share and owns everything the
//! sessions have in common: the storage facade, the metadata store, the
//! stream limiters and the handle table. Each connected protocol client
//! gets its own [`ShareFs`], bound to one user.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;

use super::attr;
use super::audit::AuditedFs;
use super::auth::{Access, AccessGate, MetaStore, Permissions, User};
use super::error::{VfsError, VfsResult};
use super::ops::ShareVfs;
use super::path;
use super::session::{ReadSession, WriteSession};
use super::storage::{JobRef, ObjectInfo, StorageFs};
use super::table::{HandleTable, JobProbe, Opened, PendingEntry, SessionId};
use super::types::{Attributes, DirInfo, Handle, OpenFlags};
use crate::config::ShareConfig;
use crate::limit::StreamLimits;

/// Server-wide state of one exported share.
#[derive(Clone)]
pub struct Share {
    name: String,
    storage: Arc<dyn StorageFs>,
    metas: Arc<dyn MetaStore>,
    limits: Arc<StreamLimits>,
    temp_dir: PathBuf,
    table: Arc<HandleTable>,
}

impl std::fmt::Debug for Share {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Share")
            .field("name", &self.name)
            .field("temp_dir", &self.temp_dir)
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

impl Share {
    /// Create a share with default settings and the given limiters.
    pub fn new(
        storage: Arc<dyn StorageFs>,
        metas: Arc<dyn MetaStore>,
        limits: Arc<StreamLimits>,
    ) -> Self {
        let defaults = ShareConfig::default();
        Self {
            name: defaults.share_name,
            storage,
            metas,
            limits,
            temp_dir: defaults.temp_dir,
            table: Arc::new(HandleTable::new()),
        }
    }

    /// Create a share from configuration. The limiters are built from
    /// `config.limits`; hand [`Share::limits`] to
    /// [`watch_limits`](crate::config::watch_limits) to hot-reload them.
    pub fn from_config(
        config: &ShareConfig,
        storage: Arc<dyn StorageFs>,
        metas: Arc<dyn MetaStore>,
    ) -> Self {
        Self {
            name: config.share_name.clone(),
            storage,
            metas,
            limits: Arc::new(StreamLimits::new(&config.limits)),
            temp_dir: config.temp_dir.clone(),
            table: Arc::new(HandleTable::new()),
        }
    }

    /// Directory for staged upload scratch files.
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = dir.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limits(&self) -> &Arc<StreamLimits> {
        &self.limits
    }

    pub fn table(&self) -> &Arc<HandleTable> {
        &self.table
    }

    pub fn storage(&self) -> &Arc<dyn StorageFs> {
        &self.storage
    }

    /// Start a session for `user` with no metadata password.
    pub fn open_session(&self, user: User) -> VfsResult<ShareFs> {
        self.open_session_with_password(user, "")
    }

    /// Start a session for `user`, presenting `password` to password
    /// protected folders.
    pub fn open_session_with_password(
        &self,
        user: User,
        password: impl Into<String>,
    ) -> VfsResult<ShareFs> {
        if !user.can(Permissions::SHARE_ACCESS) {
            return Err(VfsError::permission_denied(&self.name));
        }
        let user = Arc::new(user);
        let root = ReadSession::new(
            "/",
            user.base_path.clone(),
            ObjectInfo::folder(user.base_path.clone(), SystemTime::now()),
        );
        let session = self.table.new_session();
        tracing::debug!(share = %self.name, user = %user.name, session = session.0, "session opened");

        Ok(ShareFs {
            share: self.clone(),
            session,
            gate: AccessGate::new(user, Arc::clone(&self.metas), password),
            root: Arc::new(root),
        })
    }

    /// Start a session whose calls are logged.
    pub fn open_audited_session(
        &self,
        user: User,
        password: impl Into<String>,
    ) -> VfsResult<AuditedFs<ShareFs>> {
        let fs = self.open_session_with_password(user, password)?;
        let name = fs.user().name.clone();
        Ok(AuditedFs::new(fs, name))
    }
}

/// One protocol client's view of a share.
///
/// Handle 0 is this session's root directory. Every other handle comes
/// from the share's table and is only valid in the session that opened
/// it.
pub struct ShareFs {
    share: Share,
    session: SessionId,
    gate: AccessGate,
    root: Arc<ReadSession>,
}

impl std::fmt::Debug for ShareFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShareFs")
            .field("share", &self.share.name)
            .field("session", &self.session)
            .field("user", &self.user().name)
            .finish()
    }
}

impl ShareFs {
    pub fn user(&self) -> &User {
        self.gate.user()
    }

    pub fn session_id(&self) -> SessionId {
        self.session
    }

    /// Release every handle this session still holds.
    ///
    /// Read streams are closed; staged uploads are discarded without
    /// being submitted.
    pub async fn disconnect(&self) {
        for opened in self.share.table.evict_session(self.session) {
            match opened {
                Opened::Read(read) => {
                    if let Err(e) = read.close().await {
                        tracing::debug!(path = %read.backend_path(), error = %e, "stream close failed");
                    }
                }
                Opened::Write(write) => write.discard().await,
            }
        }
        tracing::debug!(user = %self.user().name, session = self.session.0, "session disconnected");
    }

    /// Resolve a client path to `(logical, backend)`. Paths climbing above
    /// the user's root are rejected before cleaning can clamp them.
    fn resolve(&self, raw: &str) -> VfsResult<(String, String)> {
        let backend = self.user().join_path(raw)?;
        Ok((path::clean(raw), backend))
    }

    fn opened(&self, handle: Handle) -> VfsResult<Opened> {
        if handle.is_root() {
            return Ok(Opened::Read(Arc::clone(&self.root)));
        }
        self.share.table.get(self.session, handle)
    }

    fn dir_session(&self, handle: Handle) -> VfsResult<Arc<ReadSession>> {
        match self.opened(handle)? {
            Opened::Read(read) if read.is_dir() => Ok(read),
            Opened::Read(read) => Err(VfsError::not_a_directory(read.path())),
            Opened::Write(_) => Err(VfsError::BadHandle(handle)),
        }
    }

    async fn start_upload(&self, logical: String, backend: String) -> VfsResult<Handle> {
        let write = Arc::new(WriteSession::create(&self.share.temp_dir, logical, backend).await?);
        match self.share.table.insert_write(self.session, Arc::clone(&write)) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                write.discard().await;
                Err(e)
            }
        }
    }

    async fn commit(&self, write: Arc<WriteSession>) -> VfsResult<()> {
        let backend = write.backend_path().to_string();
        match self.submit(&write).await {
            Ok(job) => {
                if let Some(job) = &job {
                    tracing::debug!(path = %backend, job = job.id(), "upload submitted");
                }
                self.share.table.finish_commit(&backend, job);
                Ok(())
            }
            Err(e) => {
                self.share.table.finish_commit(&backend, None);
                write.discard().await;
                Err(e)
            }
        }
    }

    async fn submit(&self, write: &WriteSession) -> VfsResult<Option<JobRef>> {
        let limiter = Arc::clone(self.share.limits.server_upload());
        let upload = write.into_upload(limiter).await?;
        let backend = write.backend_path();

        // The upload replaces whatever is there.
        if let Err(e) = self.share.storage.remove(backend).await {
            tracing::debug!(path = %backend, error = %e, "pre-upload remove failed");
        }
        self.share.storage.put_as_job(path::parent(backend), upload).await
    }

    async fn release(&self, read: &ReadSession) {
        if let Err(e) = read.close().await {
            tracing::debug!(path = %read.backend_path(), error = %e, "stream close failed");
        }
    }
}

impl Drop for ShareFs {
    fn drop(&mut self) {
        // Scratch files are removed as the write sessions drop. Read streams
        // are closed on the runtime when there is one; `disconnect` is the
        // way to close them deterministically.
        let evicted = self.share.table.evict_session(self.session);
        if evicted.is_empty() {
            return;
        }
        tracing::debug!(session = self.session.0, handles = evicted.len(), "evicted handles on drop");

        let reads: Vec<Arc<ReadSession>> = evicted
            .into_iter()
            .filter_map(|opened| match opened {
                Opened::Read(read) => Some(read),
                Opened::Write(_) => None,
            })
            .collect();
        if reads.is_empty() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    for read in reads {
                        if let Err(e) = read.close().await {
                            tracing::debug!(path = %read.backend_path(), error = %e, "stream close failed");
                        }
                    }
                });
            }
            Err(_) => {
                tracing::debug!(streams = reads.len(), "no runtime, read streams dropped unclosed");
            }
        }
    }
}

#[async_trait]
impl ShareVfs for ShareFs {
    async fn open(&self, path: &str, flags: OpenFlags, _mode: u32) -> VfsResult<Handle> {
        if flags.contains(OpenFlags::APPEND) {
            return Err(VfsError::NotSupported);
        }
        let (logical, backend) = self.resolve(path)?;
        let create = flags.wants_create();
        let access = if create { Access::Write } else { Access::Read };
        self.gate.check(&backend, access).await?;

        if self.share.table.writer_for(&backend).is_some() {
            return Err(if create {
                VfsError::already_exists(logical)
            } else {
                VfsError::busy(logical)
            });
        }

        let existing = match self.share.table.probe_job(&backend) {
            JobProbe::Busy => return Err(VfsError::busy(logical)),
            JobProbe::Gone => None,
            JobProbe::Absent | JobProbe::Succeeded => match self.share.storage.get(&backend).await {
                Ok(obj) => Some(obj),
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e),
            },
        };

        let Some(obj) = existing else {
            if !create {
                return Err(VfsError::not_found(logical));
            }
            return self.start_upload(logical, backend).await;
        };

        if flags.contains(OpenFlags::CREATE | OpenFlags::EXCLUSIVE) {
            return Err(VfsError::already_exists(logical));
        }
        if flags.writable() {
            if !flags.contains(OpenFlags::CREATE | OpenFlags::TRUNCATE) {
                return Err(VfsError::NotSupported);
            }
            if obj.is_folder {
                return Err(VfsError::is_a_directory(logical));
            }
            return self.start_upload(logical, backend).await;
        }

        let read = Arc::new(ReadSession::new(logical, backend, obj));
        Ok(self.share.table.insert_read(self.session, read))
    }

    async fn opendir(&self, path: &str) -> VfsResult<Handle> {
        let (logical, backend) = self.resolve(path)?;
        self.gate.check(&backend, Access::Read).await?;

        let obj = self.share.storage.get(&backend).await?;
        if !obj.is_folder {
            return Err(VfsError::not_a_directory(logical));
        }
        let read = Arc::new(ReadSession::new(logical, backend, obj));
        Ok(self.share.table.insert_read(self.session, read))
    }

    async fn close(&self, handle: Handle) -> VfsResult<()> {
        if handle.is_root() {
            return Ok(());
        }
        match self.share.table.begin_commit(self.session, handle)? {
            Opened::Read(read) => read.close().await,
            Opened::Write(write) => self.commit(write).await,
        }
    }

    async fn getattr(&self, handle: Handle) -> VfsResult<Attributes> {
        match self.opened(handle)? {
            Opened::Read(read) => read.attributes(),
            Opened::Write(write) => write.attributes().await,
        }
    }

    async fn lookup(&self, handle: Handle, name: &str) -> VfsResult<Attributes> {
        let dir = self.dir_session(handle)?;
        let logical = path::join(dir.path(), name);
        let backend = self.user().join_path(&logical)?;
        self.gate.check(&backend, Access::Read).await?;

        // Live writer first, then in-flight upload, then the backend.
        if let Some(write) = self.share.table.writer_for(&backend) {
            if let Ok(attributes) = write.attributes().await {
                return Ok(attributes);
            }
        }
        match self.share.table.probe_job(&backend) {
            JobProbe::Busy => return Err(VfsError::busy(logical)),
            JobProbe::Gone => return Err(VfsError::not_found(logical)),
            JobProbe::Absent | JobProbe::Succeeded => {}
        }
        let obj = self.share.storage.get(&backend).await?;
        attr::object_attributes(&obj)
    }

    async fn read(&self, handle: Handle, buf: &mut [u8], offset: u64) -> VfsResult<usize> {
        let n = match self.opened(handle)? {
            Opened::Write(write) => write.read_at(buf, offset).await?,
            Opened::Read(read) => {
                read.read_at(
                    buf,
                    offset,
                    &self.gate,
                    self.share.storage.as_ref(),
                    self.share.limits.server_download(),
                )
                .await?
            }
        };
        self.share.limits.client_download().wait_n(n).await;
        Ok(n)
    }

    async fn write(&self, handle: Handle, buf: &[u8], offset: u64) -> VfsResult<usize> {
        let Opened::Write(write) = self.opened(handle)? else {
            return Err(VfsError::BadHandle(handle));
        };
        let n = write.write_at(buf, offset).await?;
        self.share.limits.client_upload().wait_n(n).await;
        Ok(n)
    }

    async fn readdir(&self, handle: Handle, pos: u64) -> VfsResult<Option<Vec<DirInfo>>> {
        let dir = self.dir_session(handle)?;
        if pos != 0 || dir.is_enumerated() {
            return Ok(None);
        }
        self.gate.check(dir.backend_path(), Access::Read).await?;

        let children = self.share.storage.list(dir.backend_path()).await?;
        let own = dir.attributes()?;
        // Concurrent callers may all have listed; only one gets the entries.
        if !dir.begin_enumeration() {
            return Ok(None);
        }

        let mut entries = Vec::with_capacity(children.len() + 2);
        entries.push(DirInfo::new(".", own.clone()));
        if dir.path() != "/" {
            entries.push(DirInfo::new("..", own));
        }

        let mut seen = HashMap::new();
        for obj in children {
            match attr::object_attributes(&obj) {
                Ok(attributes) => {
                    seen.insert(obj.name.clone(), entries.len());
                    entries.push(DirInfo::new(obj.name, attributes));
                }
                Err(e) => {
                    tracing::debug!(path = %obj.path, error = %e, "skipping entry");
                }
            }
        }

        // A live writer shadows the stored object; a running job only fills
        // in names the backend does not list yet.
        for (name, pending) in self.share.table.pending_in(dir.backend_path()) {
            let attributes = match pending {
                PendingEntry::Job(attributes) => {
                    if seen.contains_key(&name) {
                        continue;
                    }
                    attributes
                }
                PendingEntry::Writer(write) => match write.attributes().await {
                    Ok(attributes) => attributes,
                    Err(_) => continue,
                },
            };
            match seen.get(&name) {
                Some(&index) => entries[index] = DirInfo::new(name, attributes),
                None => {
                    seen.insert(name.clone(), entries.len());
                    entries.push(DirInfo::new(name, attributes));
                }
            }
        }

        Ok(Some(entries))
    }

    async fn mkdir(&self, path: &str, _mode: u32) -> VfsResult<Attributes> {
        let (logical, backend) = self.resolve(path)?;
        if logical == "/" {
            return Err(VfsError::already_exists(logical));
        }
        self.gate.check(&backend, Access::Write).await?;

        let (parent, name) = path::split(&backend);
        self.share.storage.make_dir(parent, name).await?;
        let obj = self.share.storage.get(&backend).await?;
        attr::object_attributes(&obj)
    }

    async fn unlink(&self, handle: Handle) -> VfsResult<()> {
        if handle.is_root() {
            return Err(VfsError::permission_denied(self.root.path()));
        }
        let read = self.share.table.remove_read(self.session, handle)?;
        self.release(&read).await;

        self.gate.check(read.backend_path(), Access::Remove).await?;
        self.share.storage.remove(read.backend_path()).await
    }

    async fn rename(&self, handle: Handle, new_path: &str) -> VfsResult<()> {
        if handle.is_root() {
            return Err(VfsError::permission_denied(self.root.path()));
        }
        let read = self.share.table.remove_read(self.session, handle)?;
        self.release(&read).await;

        let src = read.backend_path();
        let (_, dst) = self.resolve(new_path)?;
        let (src_dir, src_base) = path::split(src);
        let (dst_dir, dst_base) = path::split(&dst);

        if src_dir == dst_dir {
            self.gate.check(src, Access::Rename).await?;
            return self.share.storage.rename(src, dst_base).await;
        }

        self.gate.check(src, Access::Move).await?;
        if src_base != dst_base {
            self.gate.check(src, Access::Rename).await?;
        }
        self.share.storage.move_to(src, dst_dir).await?;
        if src_base != dst_base {
            let moved = path::join(dst_dir, src_base);
            self.share.storage.rename(&moved, dst_base).await?;
        }
        Ok(())
    }

    async fn flush(&self, handle: Handle) -> VfsResult<()> {
        match self.opened(handle)? {
            Opened::Write(write) => write.flush().await,
            Opened::Read(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::auth::Meta;
    use crate::vfs::backends::{JobMode, MemoryMetaStore, MemoryStorage};

    struct Fixture {
        storage: Arc<MemoryStorage>,
        metas: Arc<MemoryMetaStore>,
        share: Share,
        _scratch: tempfile::TempDir,
    }

    fn fixture(mode: JobMode) -> Fixture {
        let scratch = tempfile::tempdir().unwrap();
        let storage = Arc::new(MemoryStorage::with_job_mode(mode));
        let metas = Arc::new(MemoryMetaStore::new());
        let share = Share::new(
            storage.clone(),
            metas.clone(),
            Arc::new(StreamLimits::unlimited()),
        )
        .with_temp_dir(scratch.path());
        Fixture {
            storage,
            metas,
            share,
            _scratch: scratch,
        }
    }

    fn admin() -> User {
        User::new("amy", "/", Permissions::all())
    }

    #[tokio::test]
    async fn test_session_needs_share_access() {
        let f = fixture(JobMode::Immediate);
        let user = User::new("eve", "/", Permissions::READ);
        assert!(matches!(
            f.share.open_session(user),
            Err(VfsError::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_append_not_supported() {
        let f = fixture(JobMode::Immediate);
        let fs = f.share.open_session(admin()).unwrap();
        let err = fs
            .open("/a", OpenFlags::create() | OpenFlags::APPEND, 0o644)
            .await
            .unwrap_err();
        assert!(matches!(err, VfsError::NotSupported));
    }

    #[tokio::test]
    async fn test_open_missing_without_create() {
        let f = fixture(JobMode::Immediate);
        let fs = f.share.open_session(admin()).unwrap();
        assert!(fs.open("/nope", OpenFlags::read(), 0).await.unwrap_err().is_not_found());
        // Write-only create is not write intent.
        let flags = OpenFlags::WRITE_ONLY | OpenFlags::CREATE;
        assert!(fs.open("/nope", flags, 0).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_open_existing_flag_matrix() {
        let f = fixture(JobMode::Immediate);
        f.storage.put_file("/a.txt", b"abc");
        let fs = f.share.open_session(admin()).unwrap();

        assert!(matches!(
            fs.open("/a.txt", OpenFlags::create_exclusive(), 0).await,
            Err(VfsError::AlreadyExists(_))
        ));
        assert!(matches!(
            fs.open("/a.txt", OpenFlags::READ_WRITE, 0).await,
            Err(VfsError::NotSupported)
        ));
        assert!(matches!(
            fs.open("/a.txt", OpenFlags::create(), 0).await,
            Err(VfsError::NotSupported)
        ));

        let h = fs.open("/a.txt", OpenFlags::read(), 0).await.unwrap();
        assert_eq!(fs.read_all(h).await.unwrap(), b"abc");
        fs.close(h).await.unwrap();
    }

    #[tokio::test]
    async fn test_truncate_restarts_upload() {
        let f = fixture(JobMode::Immediate);
        f.storage.put_file("/a.txt", b"old content");
        let fs = f.share.open_session(admin()).unwrap();

        let h = fs.open("/a.txt", OpenFlags::create_truncate(), 0).await.unwrap();
        assert_eq!(fs.getattr(h).await.unwrap().size, 0);
        fs.write(h, b"new", 0).await.unwrap();
        fs.close(h).await.unwrap();

        f.storage.wait_idle().await;
        let dir = fs.opendir("/").await.unwrap();
        assert_eq!(fs.lookup(dir, "a.txt").await.unwrap().size, 3);
        assert_eq!(f.storage.read_file("/a.txt").unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_live_writer_blocks_other_opens() {
        let f = fixture(JobMode::Manual);
        let fs = f.share.open_session(admin()).unwrap();
        let h = fs.open("/p.bin", OpenFlags::create(), 0).await.unwrap();

        assert!(matches!(
            fs.open("/p.bin", OpenFlags::create_truncate(), 0).await,
            Err(VfsError::AlreadyExists(_))
        ));
        assert!(matches!(
            fs.open("/p.bin", OpenFlags::read(), 0).await,
            Err(VfsError::Busy(_))
        ));
        fs.close(h).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_on_read_handle_is_bad_handle() {
        let f = fixture(JobMode::Immediate);
        f.storage.put_file("/r.txt", b"x");
        let fs = f.share.open_session(admin()).unwrap();
        let h = fs.open("/r.txt", OpenFlags::read(), 0).await.unwrap();
        assert!(fs.write(h, b"y", 0).await.unwrap_err().is_bad_handle());
        assert!(fs.write(Handle::ROOT, b"y", 0).await.unwrap_err().is_bad_handle());
    }

    #[tokio::test]
    async fn test_handles_are_session_scoped() {
        let f = fixture(JobMode::Immediate);
        f.storage.put_file("/r.txt", b"x");
        let a = f.share.open_session(admin()).unwrap();
        let b = f.share.open_session(admin()).unwrap();

        let h = a.open("/r.txt", OpenFlags::read(), 0).await.unwrap();
        assert!(b.getattr(h).await.unwrap_err().is_bad_handle());
        assert!(b.close(h).await.unwrap_err().is_bad_handle());
        a.close(h).await.unwrap();
    }

    #[tokio::test]
    async fn test_root_handle_rules() {
        let f = fixture(JobMode::Immediate);
        let fs = f.share.open_session(admin()).unwrap();

        assert!(fs.getattr(Handle::ROOT).await.unwrap().is_dir());
        fs.close(Handle::ROOT).await.unwrap();
        fs.close(Handle::ROOT).await.unwrap();
        assert!(matches!(
            fs.unlink(Handle::ROOT).await,
            Err(VfsError::PermissionDenied(_))
        ));
        assert!(matches!(
            fs.rename(Handle::ROOT, "/x").await,
            Err(VfsError::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_readdir_shows_uploads_in_progress() {
        let f = fixture(JobMode::Manual);
        f.storage.put_folder("/docs");
        f.storage.put_file("/docs/old.txt", b"1");
        let fs = f.share.open_session(admin()).unwrap();

        let writing = fs.open("/docs/new.txt", OpenFlags::create(), 0).await.unwrap();
        fs.write(writing, b"12345", 0).await.unwrap();
        let committing = fs.open("/docs/sent.txt", OpenFlags::create(), 0).await.unwrap();
        fs.write(committing, b"1234567", 0).await.unwrap();
        fs.close(committing).await.unwrap();

        let dir = fs.opendir("/docs").await.unwrap();
        let entries = fs.readdir(dir, 0).await.unwrap().unwrap();
        let mut names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec![".", "..", "new.txt", "old.txt", "sent.txt"]);

        let new = entries.iter().find(|e| e.name == "new.txt").unwrap();
        assert_eq!(new.attributes.size, 5);
        let sent = entries.iter().find(|e| e.name == "sent.txt").unwrap();
        assert_eq!(sent.attributes.size, 7);

        assert!(fs.readdir(dir, 0).await.unwrap().is_none());
        assert!(fs.readdir(dir, 3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_readdir_retries_after_backend_failure() {
        let f = fixture(JobMode::Manual);
        f.storage.put_file("/d/a.txt", b"abc");
        let fs = f.share.open_session(admin()).unwrap();
        let dir = fs.opendir("/d").await.unwrap();

        f.storage.inject_fault("/d", "upstream timed out");
        assert!(matches!(fs.readdir(dir, 0).await, Err(VfsError::Backend(_))));

        f.storage.clear_fault("/d");
        let entries = fs.readdir(dir, 0).await.unwrap().unwrap();
        assert!(entries.iter().any(|e| e.name == "a.txt"));
        assert!(fs.readdir(dir, 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_readdir_prefers_live_writer_over_stored_file() {
        let f = fixture(JobMode::Manual);
        f.storage.put_file("/docs/a.txt", b"0123456789");
        let fs = f.share.open_session(admin()).unwrap();

        let w = fs.open("/docs/a.txt", OpenFlags::create_truncate(), 0).await.unwrap();
        fs.write(w, b"abc", 0).await.unwrap();

        let dir = fs.opendir("/docs").await.unwrap();
        let entries = fs.readdir(dir, 0).await.unwrap().unwrap();
        let listed: Vec<&DirInfo> = entries.iter().filter(|e| e.name == "a.txt").collect();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].attributes.size, 3);
        assert_eq!(fs.lookup(dir, "a.txt").await.unwrap().size, 3);
    }

    #[tokio::test]
    async fn test_readdir_on_file_and_write_handles() {
        let f = fixture(JobMode::Manual);
        f.storage.put_file("/f.txt", b"1");
        let fs = f.share.open_session(admin()).unwrap();

        let file = fs.open("/f.txt", OpenFlags::read(), 0).await.unwrap();
        assert!(matches!(
            fs.readdir(file, 0).await,
            Err(VfsError::NotADirectory(_))
        ));
        let w = fs.open("/w.txt", OpenFlags::create(), 0).await.unwrap();
        assert!(fs.readdir(w, 0).await.unwrap_err().is_bad_handle());
        assert!(matches!(
            fs.opendir("/f.txt").await,
            Err(VfsError::NotADirectory(_))
        ));
    }

    #[tokio::test]
    async fn test_mkdir() {
        let f = fixture(JobMode::Immediate);
        let fs = f.share.open_session(admin()).unwrap();
        let attr = fs.mkdir("/photos", 0o755).await.unwrap();
        assert!(attr.is_dir());
        assert_eq!(attr.mode, attr::DIR_MODE);
        assert!(fs.mkdir("/photos", 0o755).await.is_err());
        assert!(matches!(
            fs.mkdir("/", 0o755).await,
            Err(VfsError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_unlink_releases_handle_and_removes() {
        let f = fixture(JobMode::Immediate);
        f.storage.put_file("/gone.txt", b"x");
        let fs = f.share.open_session(admin()).unwrap();

        let h = fs.open("/gone.txt", OpenFlags::read(), 0).await.unwrap();
        fs.unlink(h).await.unwrap();
        assert!(f.storage.get("/gone.txt").await.unwrap_err().is_not_found());
        assert!(fs.close(h).await.unwrap_err().is_bad_handle());
    }

    #[tokio::test]
    async fn test_unlink_denied_still_releases_handle() {
        let f = fixture(JobMode::Immediate);
        f.storage.put_file("/keep.txt", b"x");
        let user = User::new("ro", "/", Permissions::READ | Permissions::SHARE_ACCESS);
        let fs = f.share.open_session(user).unwrap();

        let h = fs.open("/keep.txt", OpenFlags::read(), 0).await.unwrap();
        assert!(matches!(
            fs.unlink(h).await,
            Err(VfsError::PermissionDenied(_))
        ));
        assert!(f.storage.get("/keep.txt").await.is_ok());
        assert!(fs.getattr(h).await.unwrap_err().is_bad_handle());
    }

    #[tokio::test]
    async fn test_rename_same_dir_and_move() {
        let f = fixture(JobMode::Immediate);
        f.storage.put_folder("/a");
        f.storage.put_folder("/b");
        f.storage.put_file("/a/one.txt", b"1");
        let fs = f.share.open_session(admin()).unwrap();

        let h = fs.open("/a/one.txt", OpenFlags::read(), 0).await.unwrap();
        fs.rename(h, "/a/two.txt").await.unwrap();
        assert!(f.storage.get("/a/two.txt").await.is_ok());

        let h = fs.open("/a/two.txt", OpenFlags::read(), 0).await.unwrap();
        fs.rename(h, "/b/three.txt").await.unwrap();
        assert!(f.storage.get("/a/two.txt").await.unwrap_err().is_not_found());
        assert_eq!(f.storage.read_file("/b/three.txt").unwrap(), b"1");
    }

    #[tokio::test]
    async fn test_move_with_new_name_needs_rename_bit() {
        let f = fixture(JobMode::Immediate);
        f.storage.put_folder("/a");
        f.storage.put_folder("/b");
        f.storage.put_file("/a/one.txt", b"1");
        let perms = Permissions::READ
            | Permissions::MOVE
            | Permissions::SHARE_MANAGE
            | Permissions::SHARE_ACCESS;
        let fs = f.share.open_session(User::new("mover", "/", perms)).unwrap();

        let h = fs.open("/a/one.txt", OpenFlags::read(), 0).await.unwrap();
        assert!(matches!(
            fs.rename(h, "/b/renamed.txt").await,
            Err(VfsError::PermissionDenied(_))
        ));

        let h = fs.open("/a/one.txt", OpenFlags::read(), 0).await.unwrap();
        fs.rename(h, "/b/one.txt").await.unwrap();
        assert!(f.storage.get("/b/one.txt").await.is_ok());
    }

    #[tokio::test]
    async fn test_base_path_scoping() {
        let f = fixture(JobMode::Immediate);
        f.storage.put_folder("/home");
        f.storage.put_folder("/home/amy");
        f.storage.put_file("/home/amy/mine.txt", b"m");
        f.storage.put_file("/secret.txt", b"s");
        let user = User::new("amy", "/home/amy", Permissions::all());
        let fs = f.share.open_session(user).unwrap();

        let root = fs.readdir(Handle::ROOT, 0).await.unwrap().unwrap();
        let names: Vec<&str> = root.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec![".", "mine.txt"]);

        assert!(matches!(
            fs.open("/../../secret.txt", OpenFlags::read(), 0).await,
            Err(VfsError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn test_password_protected_folder() {
        let f = fixture(JobMode::Immediate);
        f.storage.put_folder("/vault");
        f.storage.put_file("/vault/key.txt", b"k");
        f.metas.insert(Meta {
            path: "/vault".into(),
            password: "open sesame".into(),
            password_applies_to_subfolders: true,
            ..Default::default()
        });

        let user = User::new("amy", "/", Permissions::all() - Permissions::ACCESS_WITHOUT_PASSWORD);
        let fs = f.share.open_session(user.clone()).unwrap();
        assert!(matches!(
            fs.open("/vault/key.txt", OpenFlags::read(), 0).await,
            Err(VfsError::PermissionDenied(_))
        ));

        let fs = f.share.open_session_with_password(user, "open sesame").unwrap();
        let h = fs.open("/vault/key.txt", OpenFlags::read(), 0).await.unwrap();
        assert_eq!(fs.read_all(h).await.unwrap(), b"k");
    }

    #[tokio::test]
    async fn test_disconnect_discards_staged_uploads() {
        let f = fixture(JobMode::Manual);
        let scratch = f.share.temp_dir.clone();
        let fs = f.share.open_session(admin()).unwrap();

        let h = fs.open("/big.bin", OpenFlags::create(), 0).await.unwrap();
        fs.write(h, b"partial", 0).await.unwrap();
        fs.disconnect().await;

        assert!(fs.getattr(h).await.unwrap_err().is_bad_handle());
        assert!(f.share.table().is_empty());
        assert_eq!(f.share.table().job_count(), 0);
        assert_eq!(std::fs::read_dir(scratch).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_closes_read_streams() {
        let f = fixture(JobMode::Manual);
        f.storage.put_file("/r.txt", b"abc");
        let fs = f.share.open_session(admin()).unwrap();

        let h = fs.open("/r.txt", OpenFlags::read(), 0).await.unwrap();
        let mut buf = [0u8; 3];
        fs.read(h, &mut buf, 0).await.unwrap();
        assert_eq!(f.storage.open_readers(), 1);

        fs.disconnect().await;
        assert_eq!(f.storage.open_readers(), 0);
    }

    #[tokio::test]
    async fn test_dropped_session_closes_read_streams() {
        let f = fixture(JobMode::Manual);
        f.storage.put_file("/r.txt", b"abc");
        let fs = f.share.open_session(admin()).unwrap();

        let h = fs.open("/r.txt", OpenFlags::read(), 0).await.unwrap();
        let mut buf = [0u8; 3];
        fs.read(h, &mut buf, 0).await.unwrap();
        drop(fs);

        for _ in 0..100 {
            if f.storage.open_readers() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(f.storage.open_readers(), 0);
        assert!(f.share.table().is_empty());
    }

    #[tokio::test]
    async fn test_flush_and_unsupported() {
        let f = fixture(JobMode::Manual);
        let fs = f.share.open_session(admin()).unwrap();
        let h = fs.open("/f.bin", OpenFlags::create(), 0).await.unwrap();
        fs.flush(h).await.unwrap();
        fs.fsync(h).await.unwrap();
        assert!(fs.flush(Handle(999)).await.unwrap_err().is_bad_handle());

        assert!(matches!(fs.truncate(h, 0).await, Err(VfsError::NotSupported)));
        assert!(matches!(fs.symlink(h, "/t", 0).await, Err(VfsError::NotSupported)));
        assert!(matches!(fs.readlink(h).await, Err(VfsError::NotSupported)));
        assert!(matches!(fs.link(h, "/l").await, Err(VfsError::NotSupported)));
        assert!(matches!(fs.listxattr(h).await, Err(VfsError::NotSupported)));
        assert!(matches!(fs.getxattr(h, "user.x").await, Err(VfsError::NotSupported)));
        assert!(matches!(
            fs.setxattr(h, "user.x", b"v").await,
            Err(VfsError::NotSupported)
        ));
        assert!(matches!(
            fs.removexattr(h, "user.x").await,
            Err(VfsError::NotSupported)
        ));
        let attr = fs.getattr(h).await.unwrap();
        assert!(matches!(fs.setattr(h, &attr).await, Err(VfsError::NotSupported)));
        assert_eq!(fs.statfs(h).await.unwrap(), crate::vfs::StatFs::default());
    }
}
