//! Attribute synthesis.
//!
//! Backend objects, staged scratch files and in-flight jobs all have to
//! look like ordinary files to the protocol client. Identity is a 64-bit
//! FNV-1 hash of the full path (or job id); collisions only degrade inode
//! stability, nothing relies on uniqueness.

use std::time::{Duration, SystemTime};

use tokio::fs::File;

use super::error::{VfsError, VfsResult};
use super::storage::{Job, ObjectInfo};
use super::types::{Attributes, FileType};

/// Mode reported for folders.
pub const DIR_MODE: u32 = 0o755;
/// Mode reported for files.
pub const FILE_MODE: u32 = 0o644;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1 (multiply, then xor) over `bytes`.
pub fn fnv1_64(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET, |hash, &b| {
        hash.wrapping_mul(FNV_PRIME) ^ u64::from(b)
    })
}

/// Synthetic inode for a backend path.
pub fn path_inode(path: &str) -> u64 {
    fnv1_64(path.as_bytes())
}

fn since_epoch(time: SystemTime, what: &str) -> VfsResult<Duration> {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map_err(|_| VfsError::other(format!("{what}: modification time before epoch")))
}

/// Attributes of a backend object.
pub fn object_attributes(obj: &ObjectInfo) -> VfsResult<Attributes> {
    let (kind, mode) = if obj.is_folder {
        (FileType::Directory, DIR_MODE)
    } else {
        (FileType::File, FILE_MODE)
    };
    Ok(Attributes {
        inode: path_inode(&obj.path),
        size: obj.size,
        kind,
        mode,
        mtime: since_epoch(obj.modified, &obj.path)?,
    })
}

/// Attributes of a staged scratch file.
///
/// The scratch file has no stable logical path before commit, so its
/// identity is the OS file descriptor where one exists.
pub async fn scratch_attributes(file: &File, path: &str) -> VfsResult<Attributes> {
    let meta = file.metadata().await?;
    Ok(Attributes {
        inode: scratch_inode(file, path),
        size: meta.len(),
        kind: FileType::File,
        mode: scratch_mode(&meta),
        mtime: since_epoch(meta.modified()?, path)?,
    })
}

#[cfg(unix)]
fn scratch_inode(file: &File, _path: &str) -> u64 {
    use std::os::fd::AsRawFd;
    file.as_raw_fd() as u64
}

#[cfg(not(unix))]
fn scratch_inode(_file: &File, path: &str) -> u64 {
    path_inode(path)
}

#[cfg(unix)]
fn scratch_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn scratch_mode(_meta: &std::fs::Metadata) -> u32 {
    FILE_MODE
}

/// Attributes of an upload that is still being committed.
pub fn job_attributes(job: &dyn Job) -> VfsResult<Attributes> {
    let started = job.start_time().unwrap_or_else(SystemTime::now);
    Ok(Attributes {
        inode: fnv1_64(job.id().as_bytes()),
        size: job.total_bytes(),
        kind: FileType::File,
        mode: FILE_MODE,
        mtime: since_epoch(started, job.id())?,
    })
}

/// Attributes of a path whose commit has been accepted but not yet
/// handed a job.
pub fn pending_attributes(path: &str, size: u64) -> Attributes {
    let mtime = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default();
    Attributes {
        inode: path_inode(path),
        size,
        kind: FileType::File,
        mode: FILE_MODE,
        mtime,
    }
}
