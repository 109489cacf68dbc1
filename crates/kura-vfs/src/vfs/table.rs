//! Handle table.
//!
//! One table is shared by every session of a share. It owns the handle
//! maps, the per-path writer index and the background job entries behind
//! a single reader/writer lock. The lock is never held across an await:
//! callers do their I/O before or after a table call, never inside one.
//!
//! Job entries are resolved lazily: whoever next probes a path observes
//! the job's state and clears terminal entries.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{RwLock, RwLockUpgradableReadGuard};

use super::attr;
use super::error::{VfsError, VfsResult};
use super::path;
use super::session::{ReadSession, WriteSession};
use super::storage::{JobRef, JobState};
use super::types::{Attributes, Handle};

/// Identifies the session that owns a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

/// A registered handle's session.
#[derive(Debug, Clone)]
pub enum Opened {
    Read(Arc<ReadSession>),
    Write(Arc<WriteSession>),
}

enum JobEntry {
    /// Close accepted, submission to the backend in progress.
    Committing { size: u64 },
    Running(JobRef),
}

/// Outcome of consulting the job table for a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobProbe {
    /// No entry.
    Absent,
    /// Upload still in flight.
    Busy,
    /// Upload committed; entry cleared.
    Succeeded,
    /// Upload failed or was canceled; entry cleared, path reverts.
    Gone,
}

/// Something under a directory that the backend does not show yet.
#[derive(Debug, Clone)]
pub enum PendingEntry {
    Writer(Arc<WriteSession>),
    Job(Attributes),
}

#[derive(Default)]
struct Tables {
    next_handle: u64,
    reads: HashMap<Handle, (SessionId, Arc<ReadSession>)>,
    writes: HashMap<Handle, (SessionId, Arc<WriteSession>)>,
    writers: HashMap<String, Handle>,
    jobs: HashMap<String, JobEntry>,
}

impl Tables {
    fn issue(&mut self) -> Handle {
        // Handle 0 is the per-session root and never issued.
        self.next_handle += 1;
        Handle(self.next_handle)
    }

    fn take(&mut self, session: SessionId, handle: Handle) -> VfsResult<Opened> {
        if self.reads.get(&handle).is_some_and(|(owner, _)| *owner == session) {
            if let Some((_, read)) = self.reads.remove(&handle) {
                return Ok(Opened::Read(read));
            }
        }
        if self.writes.get(&handle).is_some_and(|(owner, _)| *owner == session) {
            if let Some((_, write)) = self.writes.remove(&handle) {
                if self.writers.get(write.backend_path()) == Some(&handle) {
                    self.writers.remove(write.backend_path());
                }
                return Ok(Opened::Write(write));
            }
        }
        Err(VfsError::BadHandle(handle))
    }
}

/// Server-wide handle and job table.
pub struct HandleTable {
    inner: RwLock<Tables>,
    next_session: AtomicU64,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HandleTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let t = self.inner.read();
        f.debug_struct("HandleTable")
            .field("reads", &t.reads.len())
            .field("writes", &t.writes.len())
            .field("jobs", &t.jobs.len())
            .field("next_handle", &t.next_handle)
            .finish()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Tables::default()),
            next_session: AtomicU64::new(1),
        }
    }

    /// Allocate an id for a new client session.
    pub fn new_session(&self) -> SessionId {
        SessionId(self.next_session.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a read session.
    pub fn insert_read(&self, session: SessionId, read: Arc<ReadSession>) -> Handle {
        let mut t = self.inner.write();
        let handle = t.issue();
        t.reads.insert(handle, (session, read));
        handle
    }

    /// Register a write session for its backend path.
    ///
    /// Re-checks, under the same lock acquisition that inserts, that no
    /// other writer owns the path and no upload for it is in flight. A
    /// terminal job entry is cleared. On error the caller still owns the
    /// session and should discard it.
    pub fn insert_write(&self, session: SessionId, write: Arc<WriteSession>) -> VfsResult<Handle> {
        let mut t = self.inner.write();
        let key = write.backend_path().to_string();

        if t.writers.contains_key(&key) {
            return Err(VfsError::already_exists(write.path()));
        }
        let in_flight = match t.jobs.get(&key) {
            Some(JobEntry::Committing { .. }) => Some(true),
            Some(JobEntry::Running(job)) => Some(!job.state().is_terminal()),
            None => None,
        };
        match in_flight {
            Some(true) => return Err(VfsError::busy(write.path())),
            Some(false) => {
                t.jobs.remove(&key);
            }
            None => {}
        }

        let handle = t.issue();
        t.writers.insert(key, handle);
        t.writes.insert(handle, (session, write));
        Ok(handle)
    }

    /// Look up a handle owned by `session`.
    pub fn get(&self, session: SessionId, handle: Handle) -> VfsResult<Opened> {
        let t = self.inner.read();
        if let Some((owner, read)) = t.reads.get(&handle) {
            if *owner == session {
                return Ok(Opened::Read(Arc::clone(read)));
            }
        }
        if let Some((owner, write)) = t.writes.get(&handle) {
            if *owner == session {
                return Ok(Opened::Write(Arc::clone(write)));
            }
        }
        Err(VfsError::BadHandle(handle))
    }

    /// Remove a handle of either kind.
    ///
    /// A write session removed this way is not committed.
    pub fn remove(&self, session: SessionId, handle: Handle) -> VfsResult<Opened> {
        self.inner.write().take(session, handle)
    }

    /// Remove a read session handle. Write handles are left alone.
    pub fn remove_read(&self, session: SessionId, handle: Handle) -> VfsResult<Arc<ReadSession>> {
        let mut t = self.inner.write();
        match t.reads.get(&handle) {
            Some((owner, _)) if *owner == session => {}
            _ => return Err(VfsError::BadHandle(handle)),
        }
        t.reads
            .remove(&handle)
            .map(|(_, read)| read)
            .ok_or(VfsError::BadHandle(handle))
    }

    /// Remove a handle for close.
    ///
    /// For a write session, the handle, the writer index entry and a new
    /// committing placeholder for its path change in one lock
    /// acquisition, so the path is never observed as absent in between.
    /// Finish with [`HandleTable::finish_commit`].
    pub fn begin_commit(&self, session: SessionId, handle: Handle) -> VfsResult<Opened> {
        let mut t = self.inner.write();
        let opened = t.take(session, handle)?;
        if let Opened::Write(write) = &opened {
            t.jobs.insert(
                write.backend_path().to_string(),
                JobEntry::Committing { size: write.len() },
            );
        }
        Ok(opened)
    }

    /// Replace the committing placeholder for `backend_path` with the
    /// submitted job, or clear it when there is nothing to poll.
    pub fn finish_commit(&self, backend_path: &str, job: Option<JobRef>) {
        let mut t = self.inner.write();
        if !matches!(t.jobs.get(backend_path), Some(JobEntry::Committing { .. })) {
            return;
        }
        match job {
            Some(job) => {
                t.jobs.insert(backend_path.to_string(), JobEntry::Running(job));
            }
            None => {
                t.jobs.remove(backend_path);
            }
        }
    }

    /// Resolve the job entry for `backend_path`, clearing it if terminal.
    pub fn probe_job(&self, backend_path: &str) -> JobProbe {
        let t = self.inner.upgradable_read();
        let state = match t.jobs.get(backend_path) {
            None => return JobProbe::Absent,
            Some(JobEntry::Committing { .. }) => return JobProbe::Busy,
            Some(JobEntry::Running(job)) => job.state(),
        };
        if !state.is_terminal() {
            return JobProbe::Busy;
        }

        let mut t = RwLockUpgradableReadGuard::upgrade(t);
        t.jobs.remove(backend_path);
        match state {
            JobState::Succeeded => JobProbe::Succeeded,
            _ => JobProbe::Gone,
        }
    }

    /// The live write session for `backend_path`, if any.
    pub fn writer_for(&self, backend_path: &str) -> Option<Arc<WriteSession>> {
        let t = self.inner.read();
        let handle = t.writers.get(backend_path)?;
        t.writes.get(handle).map(|(_, write)| Arc::clone(write))
    }

    /// Live writers and in-flight uploads directly under `dir`, by name.
    pub fn pending_in(&self, dir: &str) -> Vec<(String, PendingEntry)> {
        let t = self.inner.read();
        let mut out = Vec::new();

        for (key, handle) in &t.writers {
            if path::parent(key) != dir {
                continue;
            }
            if let Some((_, write)) = t.writes.get(handle) {
                out.push((
                    path::base_name(key).to_string(),
                    PendingEntry::Writer(Arc::clone(write)),
                ));
            }
        }
        for (key, entry) in &t.jobs {
            if path::parent(key) != dir {
                continue;
            }
            let attributes = match entry {
                JobEntry::Committing { size } => attr::pending_attributes(key, *size),
                JobEntry::Running(job) if job.state().is_terminal() => continue,
                JobEntry::Running(job) => match attr::job_attributes(job.as_ref()) {
                    Ok(a) => a,
                    Err(_) => continue,
                },
            };
            out.push((path::base_name(key).to_string(), PendingEntry::Job(attributes)));
        }
        out
    }

    /// Remove every handle owned by `session`.
    pub fn evict_session(&self, session: SessionId) -> Vec<Opened> {
        let mut t = self.inner.write();
        let handles: Vec<Handle> = t
            .reads
            .iter()
            .filter(|(_, (owner, _))| *owner == session)
            .map(|(h, _)| *h)
            .chain(
                t.writes
                    .iter()
                    .filter(|(_, (owner, _))| *owner == session)
                    .map(|(h, _)| *h),
            )
            .collect();
        handles
            .into_iter()
            .filter_map(|h| t.take(session, h).ok())
            .collect()
    }

    /// Number of registered handles across all sessions.
    pub fn len(&self) -> usize {
        let t = self.inner.read();
        t.reads.len() + t.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of job entries, including committing placeholders.
    pub fn job_count(&self) -> usize {
        self.inner.read().jobs.len()
    }
}
