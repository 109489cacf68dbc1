//! Core share VFS types.
//!
//! These are the records the protocol layer sees: numeric handles,
//! open flags, and synthesized attributes.

use std::fmt;
use std::time::Duration;

use bitflags::bitflags;

/// Opaque per-session handle naming an open resource.
///
/// Handles come from one monotonically increasing counter and are never
/// reused. [`Handle::ROOT`] is reserved for the session's root directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(pub u64);

impl Handle {
    /// The pre-bound root directory handle.
    pub const ROOT: Handle = Handle(0);

    /// Returns true for the root handle.
    pub fn is_root(&self) -> bool {
        *self == Self::ROOT
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

bitflags! {
    /// Open flags as passed by the protocol server (POSIX bit values).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        /// Open for writing only.
        const WRITE_ONLY = 0o1;
        /// Open for reading and writing.
        const READ_WRITE = 0o2;
        /// Create if not exists.
        const CREATE = 0o100;
        /// Fail if exists (with CREATE).
        const EXCLUSIVE = 0o200;
        /// Truncate on open.
        const TRUNCATE = 0o1000;
        /// Append mode.
        const APPEND = 0o2000;
    }
}

impl OpenFlags {
    /// Build from raw POSIX open flags, keeping unknown bits.
    pub fn from_posix(flags: i32) -> Self {
        Self::from_bits_retain(flags as u32)
    }

    /// Read-only access.
    pub fn read() -> Self {
        Self::empty()
    }

    /// Create with read-write access.
    pub fn create() -> Self {
        Self::READ_WRITE | Self::CREATE
    }

    /// Create and truncate.
    pub fn create_truncate() -> Self {
        Self::READ_WRITE | Self::CREATE | Self::TRUNCATE
    }

    /// Create exclusively (fail if exists).
    pub fn create_exclusive() -> Self {
        Self::READ_WRITE | Self::CREATE | Self::EXCLUSIVE
    }

    /// Whether the open carries write intent.
    ///
    /// Only `READ_WRITE` counts; write-only opens are treated as reads
    /// of an existing object.
    pub fn writable(&self) -> bool {
        self.contains(Self::READ_WRITE)
    }

    /// Write intent plus `CREATE`.
    pub fn wants_create(&self) -> bool {
        self.writable() && self.contains(Self::CREATE)
    }
}

/// File type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// Regular file.
    File,
    /// Directory.
    Directory,
}

impl FileType {
    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        matches!(self, FileType::File)
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self, FileType::Directory)
    }
}

/// Protocol attribute record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attributes {
    /// Synthetic inode number. Deterministic per path, not guaranteed unique.
    pub inode: u64,
    /// Size in bytes.
    pub size: u64,
    /// File type.
    pub kind: FileType,
    /// Unix mode bits (e.g., 0o644).
    pub mode: u32,
    /// Last modification time, relative to the Unix epoch.
    pub mtime: Duration,
}

impl Attributes {
    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        self.kind.is_file()
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }
}

/// One directory enumeration entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirInfo {
    /// Entry name (not full path).
    pub name: String,
    /// Entry attributes.
    pub attributes: Attributes,
}

impl DirInfo {
    /// Create a new directory entry.
    pub fn new(name: impl Into<String>, attributes: Attributes) -> Self {
        Self {
            name: name.into(),
            attributes,
        }
    }
}

/// Filesystem statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatFs {
    /// Total blocks.
    pub blocks: u64,
    /// Free blocks.
    pub bfree: u64,
    /// Available blocks (to non-root).
    pub bavail: u64,
    /// Total inodes.
    pub files: u64,
    /// Free inodes.
    pub ffree: u64,
    /// Block size.
    pub bsize: u32,
    /// Maximum name length.
    pub namelen: u32,
}

impl Default for StatFs {
    fn default() -> Self {
        Self {
            blocks: 1024 * 1024,
            bfree: 512 * 1024,
            bavail: 512 * 1024,
            files: 1024 * 1024,
            ffree: 512 * 1024,
            bsize: 4096,
            namelen: 255,
        }
    }
}
