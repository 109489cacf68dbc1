//! # kura-vfs
//!
//! Share VFS for kura. Exposes a path-based storage facade to
//! handle-oriented file-sharing protocol servers.
//!
//! A [`Share`] is one exported store. Each protocol connection opens a
//! [`ShareFs`] session on it and drives it through [`ShareVfs`]:
//! - Reads stream lazily from the store, rate limited per direction
//! - Writes stage into a scratch file and upload as a background job
//! - Attributes are synthesized for objects, staged files and jobs
//! - Every call is authorized against the session user and folder metas

pub mod config;
pub mod limit;
pub mod vfs;

pub use config::{ConfigError, LimitSettings, ShareConfig, watch_limits};
pub use limit::{Limit, RateLimiter, StreamLimits};
pub use vfs::{
    AuditedFs, Attributes, DirInfo, FileType, Handle, OpenFlags, Permissions, Share, ShareFs,
    ShareVfs, StatFs, StorageFs, User, VfsError, VfsResult,
};
