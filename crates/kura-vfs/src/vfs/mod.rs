//! Share virtual filesystem.
//!
//! Bridges a handle-oriented file-sharing protocol onto a path-based
//! storage facade. Key components:
//!
//! - [`ShareVfs`] - Protocol-facing operations trait
//! - [`Share`] / [`ShareFs`] - A shared export and one session on it
//! - [`HandleTable`](table::HandleTable) - Server-wide handle and job registry
//! - [`StorageFs`] - Facade contract the backends implement
//! - [`AuditedFs`] - Logging decorator over any [`ShareVfs`]
//! - [`MemoryStorage`] - In-memory facade (for testing)
//!
//! ## Design Decisions
//!
//! - **Handles over paths**: clients address open resources by handle;
//!   handle 0 is each session's root directory and is never issued.
//! - **Staged uploads**: writes land in a local scratch file and reach
//!   the store as a background job when the handle closes.
//! - **Jobs stay visible**: a path with an upload in flight reports as
//!   busy, then resolves to the committed object or to nothing.

pub mod attr;
pub mod audit;
pub mod auth;
pub mod backends;
mod error;
mod ops;
pub mod path;
pub mod session;
pub mod share;
pub mod sniff;
pub mod storage;
pub mod table;
mod types;

pub use audit::AuditedFs;
pub use auth::{Access, AccessGate, Meta, MetaStore, Permissions, User};
pub use backends::{JobMode, MemoryMetaStore, MemoryStorage};
pub use error::{VfsError, VfsResult};
pub use ops::ShareVfs;
pub use share::{Share, ShareFs};
pub use storage::{Job, JobRef, JobState, Link, ObjectInfo, RangeReader, StorageFs, Upload};
pub use types::{Attributes, DirInfo, FileType, Handle, OpenFlags, StatFs};
