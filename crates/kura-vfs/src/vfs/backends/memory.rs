//! In-memory storage facade.
//!
//! Used for testing and embedding. All data is ephemeral. Uploads run as
//! background jobs; in [`JobMode::Manual`] they stay pending until the
//! test resolves them, which is how in-flight behavior gets exercised.
//! Finished jobs are forgotten the next time a job is submitted.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::vfs::auth::{Meta, MetaStore};
use crate::vfs::error::{VfsError, VfsResult};
use crate::vfs::path;
use crate::vfs::storage::{
    Job, JobRef, JobState, Link, ObjectInfo, RangeReader, StorageFs, Upload,
};

const LINK_SCHEME: &str = "memory://";

/// Entry in the memory store.
#[derive(Debug, Clone)]
enum Entry {
    File {
        data: Arc<Vec<u8>>,
        modified: SystemTime,
    },
    Folder {
        modified: SystemTime,
    },
}

impl Entry {
    fn info(&self, path: &str) -> ObjectInfo {
        match self {
            Entry::File { data, modified } => ObjectInfo::file(path, data.len() as u64, *modified),
            Entry::Folder { modified } => ObjectInfo::folder(path, *modified),
        }
    }
}

type Entries = Arc<RwLock<HashMap<String, Entry>>>;

/// How submitted uploads progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JobMode {
    /// Commit on a spawned task as soon as the upload is submitted.
    #[default]
    Immediate,
    /// Stay pending until [`MemoryStorage::complete_job`],
    /// [`MemoryStorage::fail_job`] or [`MemoryStorage::cancel_job`].
    Manual,
}

/// A background upload into a [`MemoryStorage`].
#[derive(Debug)]
pub struct MemoryJob {
    id: String,
    seq: u64,
    path: String,
    total: u64,
    started: SystemTime,
    state: Mutex<JobState>,
    data: Mutex<Option<Vec<u8>>>,
}

impl MemoryJob {
    fn new(seq: u64, path: String, total: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            seq,
            path,
            total,
            started: SystemTime::now(),
            state: Mutex::new(JobState::Pending),
            data: Mutex::new(None),
        }
    }

    /// Destination path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Move to `next` unless already terminal. Returns whether it moved.
    fn transition(&self, next: JobState) -> bool {
        let mut state = self.state.lock();
        if state.is_terminal() {
            return false;
        }
        *state = next;
        true
    }
}

impl Job for MemoryJob {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> JobState {
        *self.state.lock()
    }

    fn total_bytes(&self) -> u64 {
        self.total
    }

    fn start_time(&self) -> Option<SystemTime> {
        Some(self.started)
    }
}

/// In-memory storage backend.
///
/// Thread-safe via internal locks. Paths are cleaned absolute strings;
/// the root folder always exists.
#[derive(Debug)]
pub struct MemoryStorage {
    entries: Entries,
    jobs: DashMap<String, Arc<MemoryJob>>,
    faults: DashMap<String, String>,
    next_job: AtomicU64,
    mode: JobMode,
    running: Mutex<Vec<JoinHandle<()>>>,
    open_readers: Arc<AtomicUsize>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    /// Create an empty store that commits uploads immediately.
    pub fn new() -> Self {
        Self::with_job_mode(JobMode::Immediate)
    }

    pub fn with_job_mode(mode: JobMode) -> Self {
        let mut entries = HashMap::new();
        entries.insert(
            "/".to_string(),
            Entry::Folder {
                modified: SystemTime::now(),
            },
        );
        Self {
            entries: Arc::new(RwLock::new(entries)),
            jobs: DashMap::new(),
            faults: DashMap::new(),
            next_job: AtomicU64::new(1),
            mode,
            running: Mutex::new(Vec::new()),
            open_readers: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn insert_with_parents(entries: &mut HashMap<String, Entry>, path: &str, entry: Entry) {
        let mut current = String::new();
        let parent = path::parent(path);
        for segment in parent.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            entries.entry(current.clone()).or_insert(Entry::Folder {
                modified: SystemTime::now(),
            });
        }
        entries.insert(path.to_string(), entry);
    }

    /// Store a file, creating parent folders as needed.
    pub fn put_file(&self, path: &str, data: &[u8]) {
        let path = path::clean(path);
        let entry = Entry::File {
            data: Arc::new(data.to_vec()),
            modified: SystemTime::now(),
        };
        Self::insert_with_parents(&mut self.entries.write(), &path, entry);
    }

    /// Create a folder, and its parents, if missing.
    pub fn put_folder(&self, path: &str) {
        let path = path::clean(path);
        let mut entries = self.entries.write();
        if !entries.contains_key(&path) {
            let entry = Entry::Folder {
                modified: SystemTime::now(),
            };
            Self::insert_with_parents(&mut entries, &path, entry);
        }
    }

    /// Contents of a stored file.
    pub fn read_file(&self, path: &str) -> Option<Vec<u8>> {
        match self.entries.read().get(&path::clean(path)) {
            Some(Entry::File { data, .. }) => Some(data.as_ref().clone()),
            _ => None,
        }
    }

    /// Make every operation touching `path` fail with an opaque backend
    /// error carrying `message`.
    pub fn inject_fault(&self, path: &str, message: impl Into<String>) {
        self.faults.insert(path::clean(path), message.into());
    }

    pub fn clear_fault(&self, path: &str) {
        self.faults.remove(&path::clean(path));
    }

    fn check_fault(&self, path: &str) -> VfsResult<()> {
        match self.faults.get(path) {
            Some(message) => Err(VfsError::backend(anyhow::anyhow!("{}", message.value()))),
            None => Ok(()),
        }
    }

    fn new_job(&self, path: String, total: u64) -> MemoryJob {
        MemoryJob::new(self.next_job.fetch_add(1, Ordering::Relaxed), path, total)
    }

    /// Register `job`, dropping jobs that already reached a terminal state.
    fn insert_job(&self, job: &Arc<MemoryJob>) {
        self.jobs.retain(|_, j| !j.state().is_terminal());
        self.jobs.insert(job.id.clone(), Arc::clone(job));
    }

    /// Jobs still tracked by the store, finished or not.
    pub fn tracked_jobs(&self) -> usize {
        self.jobs.len()
    }

    /// Readers opened through [`StorageFs::open_link`] and not yet closed.
    pub fn open_readers(&self) -> usize {
        self.open_readers.load(Ordering::Acquire)
    }

    /// Register a pending job for `path` without an upload behind it.
    ///
    /// Completing it stores `size` zero bytes.
    pub fn track_job(&self, path: &str, size: u64) -> JobRef {
        let job = Arc::new(self.new_job(path::clean(path), size));
        *job.data.lock() = Some(vec![0u8; size as usize]);
        self.insert_job(&job);
        job
    }

    /// The most recently started job for `path`.
    pub fn latest_job(&self, path: &str) -> Option<JobRef> {
        let path = path::clean(path);
        self.jobs
            .iter()
            .filter(|j| j.path == path)
            .max_by_key(|j| j.seq)
            .map(|j| Arc::clone(j.value()) as JobRef)
    }

    /// Commit a manual job's bytes and mark it succeeded.
    pub fn complete_job(&self, id: &str) -> bool {
        let Some(job) = self.jobs.get(id).map(|j| Arc::clone(j.value())) else {
            return false;
        };
        if job.state().is_terminal() {
            return false;
        }
        let data = job.data.lock().take().unwrap_or_default();
        Self::commit(&self.entries, &job.path, data);
        job.transition(JobState::Succeeded)
    }

    /// Mark a job failed. Nothing is stored.
    pub fn fail_job(&self, id: &str) -> bool {
        self.jobs
            .get(id)
            .is_some_and(|j| j.transition(JobState::Failed))
    }

    /// Mark a job canceled. Nothing is stored.
    pub fn cancel_job(&self, id: &str) -> bool {
        self.jobs
            .get(id)
            .is_some_and(|j| j.transition(JobState::Canceled))
    }

    /// Wait for every spawned commit task to finish.
    pub async fn wait_idle(&self) {
        loop {
            let handles = std::mem::take(&mut *self.running.lock());
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                let _ = handle.await;
            }
        }
    }

    fn commit(entries: &Entries, path: &str, data: Vec<u8>) {
        let entry = Entry::File {
            data: Arc::new(data),
            modified: SystemTime::now(),
        };
        Self::insert_with_parents(&mut entries.write(), path, entry);
    }

    fn folder_exists(&self, path: &str) -> VfsResult<()> {
        match self.entries.read().get(path) {
            Some(Entry::Folder { .. }) => Ok(()),
            Some(Entry::File { .. }) => Err(VfsError::not_a_directory(path)),
            None => Err(VfsError::not_found(path)),
        }
    }

    /// Move `src` and everything below it to `dst`.
    fn relocate(&self, src: &str, dst: &str) -> VfsResult<()> {
        if src == "/" {
            return Err(VfsError::permission_denied(src));
        }
        let mut entries = self.entries.write();
        if !entries.contains_key(src) {
            return Err(VfsError::not_found(src));
        }
        if entries.contains_key(dst) {
            return Err(VfsError::already_exists(dst));
        }
        if path::is_within(src, dst) {
            return Err(VfsError::invalid_path(dst));
        }

        let moving: Vec<String> = entries
            .keys()
            .filter(|k| path::is_within(src, k))
            .cloned()
            .collect();
        for old in moving {
            if let Some(entry) = entries.remove(&old) {
                let new = format!("{dst}{}", &old[src.len()..]);
                entries.insert(new, entry);
            }
        }
        Ok(())
    }
}

struct MemoryReader {
    data: Arc<Vec<u8>>,
    open: Arc<AtomicUsize>,
    closed: AtomicBool,
}

#[async_trait]
impl RangeReader for MemoryReader {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> VfsResult<usize> {
        let start = (offset as usize).min(self.data.len());
        let end = (start + buf.len()).min(self.data.len());
        buf[..end - start].copy_from_slice(&self.data[start..end]);
        Ok(end - start)
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    async fn close(&self) -> VfsResult<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.open.fetch_sub(1, Ordering::AcqRel);
        }
        Ok(())
    }
}

#[async_trait]
impl StorageFs for MemoryStorage {
    async fn get(&self, path: &str) -> VfsResult<ObjectInfo> {
        let path = path::clean(path);
        self.check_fault(&path)?;
        self.entries
            .read()
            .get(&path)
            .map(|e| e.info(&path))
            .ok_or_else(|| VfsError::not_found(path.clone()))
    }

    async fn list(&self, path: &str) -> VfsResult<Vec<ObjectInfo>> {
        let path = path::clean(path);
        self.check_fault(&path)?;
        self.folder_exists(&path)?;

        let entries = self.entries.read();
        let mut result: Vec<ObjectInfo> = entries
            .iter()
            .filter(|(k, _)| k.as_str() != path && path::parent(k) == path)
            .map(|(k, e)| e.info(k))
            .collect();
        result.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(result)
    }

    async fn link(&self, path: &str) -> VfsResult<(Link, ObjectInfo)> {
        let path = path::clean(path);
        self.check_fault(&path)?;
        let obj = self.get(&path).await?;
        if obj.is_folder {
            return Err(VfsError::is_a_directory(path));
        }
        Ok((Link::new(format!("{LINK_SCHEME}{path}")), obj))
    }

    async fn open_link(&self, link: &Link, _obj: &ObjectInfo) -> VfsResult<Box<dyn RangeReader>> {
        let path = link
            .url
            .strip_prefix(LINK_SCHEME)
            .ok_or_else(|| VfsError::other(format!("unsupported link: {}", link.url)))?;
        match self.entries.read().get(path) {
            Some(Entry::File { data, .. }) => {
                self.open_readers.fetch_add(1, Ordering::AcqRel);
                Ok(Box::new(MemoryReader {
                    data: Arc::clone(data),
                    open: Arc::clone(&self.open_readers),
                    closed: AtomicBool::new(false),
                }))
            }
            Some(Entry::Folder { .. }) => Err(VfsError::is_a_directory(path)),
            None => Err(VfsError::not_found(path)),
        }
    }

    async fn make_dir(&self, parent: &str, name: &str) -> VfsResult<()> {
        let parent = path::clean(parent);
        let target = path::join(&parent, name);
        self.check_fault(&target)?;
        self.folder_exists(&parent)?;

        let mut entries = self.entries.write();
        if entries.contains_key(&target) {
            return Err(VfsError::already_exists(target));
        }
        entries.insert(
            target,
            Entry::Folder {
                modified: SystemTime::now(),
            },
        );
        Ok(())
    }

    async fn remove(&self, path: &str) -> VfsResult<()> {
        let path = path::clean(path);
        self.check_fault(&path)?;
        if path == "/" {
            return Err(VfsError::permission_denied("cannot remove root"));
        }
        let mut entries = self.entries.write();
        if entries.remove(&path).is_none() {
            return Err(VfsError::not_found(path));
        }
        entries.retain(|k, _| !path::is_within(&path, k));
        Ok(())
    }

    async fn rename(&self, path: &str, new_name: &str) -> VfsResult<()> {
        let path = path::clean(path);
        self.check_fault(&path)?;
        if new_name.is_empty() || new_name.contains('/') {
            return Err(VfsError::invalid_path(new_name));
        }
        let dst = path::join(path::parent(&path), new_name);
        self.relocate(&path, &dst)
    }

    async fn move_to(&self, path: &str, dst_dir: &str) -> VfsResult<()> {
        let path = path::clean(path);
        let dst_dir = path::clean(dst_dir);
        self.check_fault(&path)?;
        self.folder_exists(&dst_dir)?;
        let dst = path::join(&dst_dir, path::base_name(&path));
        self.relocate(&path, &dst)
    }

    async fn put_as_job(&self, dst_dir: &str, upload: Upload) -> VfsResult<Option<JobRef>> {
        let dst_dir = path::clean(dst_dir);
        let target = path::join(&dst_dir, &upload.name);
        self.check_fault(&target)?;
        self.folder_exists(&dst_dir)?;

        let job = Arc::new(self.new_job(target, upload.size));
        self.insert_job(&job);

        match self.mode {
            JobMode::Immediate => {
                let entries = Arc::clone(&self.entries);
                let task_job = Arc::clone(&job);
                let handle = tokio::spawn(async move {
                    task_job.transition(JobState::Running);
                    match upload.read_to_end().await {
                        Ok(data) => {
                            Self::commit(&entries, &task_job.path, data);
                            task_job.transition(JobState::Succeeded);
                        }
                        Err(e) => {
                            tracing::warn!(path = %task_job.path, error = %e, "memory upload failed");
                            task_job.transition(JobState::Failed);
                        }
                    }
                });
                let mut running = self.running.lock();
                running.retain(|h| !h.is_finished());
                running.push(handle);
            }
            JobMode::Manual => {
                let data = upload.read_to_end().await?;
                *job.data.lock() = Some(data);
            }
        }
        Ok(Some(job))
    }
}

/// In-memory metadata store.
#[derive(Debug, Clone, Default)]
pub struct MemoryMetaStore {
    metas: Arc<DashMap<String, Meta>>,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `meta` to its folder, replacing any existing meta there.
    pub fn insert(&self, mut meta: Meta) {
        meta.path = path::clean(&meta.path);
        self.metas.insert(meta.path.clone(), meta);
    }

    pub fn remove(&self, path: &str) -> Option<Meta> {
        self.metas.remove(&path::clean(path)).map(|(_, m)| m)
    }
}

#[async_trait]
impl MetaStore for MemoryMetaStore {
    async fn get_meta(&self, path: &str) -> VfsResult<Option<Meta>> {
        Ok(self.metas.get(path).map(|m| m.value().clone()))
    }
}
