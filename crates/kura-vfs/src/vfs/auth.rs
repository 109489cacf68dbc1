//! Authorization gate.
//!
//! Every share operation resolves the nearest access-control [`Meta`] for
//! the path it touches and checks it together with the caller's
//! [`Permissions`]. Mutating operations additionally need
//! [`Permissions::SHARE_MANAGE`]. All failures collapse into one
//! `PermissionDenied` carrying only the path.

use std::sync::Arc;

use async_trait::async_trait;
use bitflags::bitflags;

use super::error::{VfsError, VfsResult};
use super::path;

bitflags! {
    /// Caller capability bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Permissions: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const RENAME = 1 << 2;
        const MOVE = 1 << 3;
        const REMOVE = 1 << 4;
        /// May connect to the share at all.
        const SHARE_ACCESS = 1 << 5;
        /// May perform any mutating share operation.
        const SHARE_MANAGE = 1 << 6;
        /// Bypass meta passwords.
        const ACCESS_WITHOUT_PASSWORD = 1 << 7;
    }
}

/// A share user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub name: String,
    /// Backend path the user's share root maps to.
    pub base_path: String,
    pub permissions: Permissions,
}

impl User {
    pub fn new(name: impl Into<String>, base_path: &str, permissions: Permissions) -> Self {
        Self {
            name: name.into(),
            base_path: path::clean(base_path),
            permissions,
        }
    }

    /// Resolve a logical share path to a backend path.
    pub fn join_path(&self, logical: &str) -> VfsResult<String> {
        path::join_base(&self.base_path, logical)
    }

    pub fn can(&self, bits: Permissions) -> bool {
        self.permissions.contains(bits)
    }
}

/// Access-control metadata attached to a folder.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Meta {
    /// Folder the meta is attached to.
    pub path: String,
    /// Required password; empty for none.
    pub password: String,
    /// Whether the password also guards subfolders.
    pub password_applies_to_subfolders: bool,
    /// Grant write access to anyone who can access the folder.
    pub write: bool,
    /// Whether the write grant extends to subfolders.
    pub write_applies_to_subfolders: bool,
}

impl Meta {
    fn applies(meta_path: &str, req_path: &str, to_subfolders: bool) -> bool {
        meta_path == req_path || (to_subfolders && path::is_within(meta_path, req_path))
    }

    /// Whether the password guards `req_path`.
    pub fn password_applies(&self, req_path: &str) -> bool {
        Self::applies(&self.path, req_path, self.password_applies_to_subfolders)
    }

    /// Whether the write grant covers `req_path`.
    pub fn write_applies(&self, req_path: &str) -> bool {
        self.write && Self::applies(&self.path, req_path, self.write_applies_to_subfolders)
    }
}

/// Lookup of access-control metadata by exact folder path.
#[async_trait]
pub trait MetaStore: Send + Sync {
    /// Meta attached exactly at `path`, if any.
    async fn get_meta(&self, path: &str) -> VfsResult<Option<Meta>>;
}

/// Find the meta of `path` or its closest ancestor.
pub async fn nearest_meta(store: &dyn MetaStore, req_path: &str) -> VfsResult<Option<Meta>> {
    let mut current = path::clean(req_path);
    loop {
        if let Some(meta) = store.get_meta(&current).await? {
            return Ok(Some(meta));
        }
        if current == "/" {
            return Ok(None);
        }
        current = path::parent(&current).to_string();
    }
}

/// The operation being authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Stat, list, open for read, download.
    Read,
    /// Create or overwrite an object, make a folder.
    Write,
    Rename,
    Move,
    Remove,
}

impl Access {
    fn required(&self) -> Permissions {
        match self {
            Access::Read => Permissions::READ,
            Access::Write => Permissions::WRITE | Permissions::SHARE_MANAGE,
            Access::Rename => Permissions::RENAME | Permissions::SHARE_MANAGE,
            Access::Move => Permissions::MOVE | Permissions::SHARE_MANAGE,
            Access::Remove => Permissions::REMOVE | Permissions::SHARE_MANAGE,
        }
    }
}

/// Whether `user` passes the meta-level check for `req_path`.
pub fn can_access(user: &User, meta: Option<&Meta>, req_path: &str, password: &str) -> bool {
    if user.can(Permissions::ACCESS_WITHOUT_PASSWORD) {
        return true;
    }
    let Some(meta) = meta else { return true };
    if meta.password.is_empty() || !meta.password_applies(req_path) {
        return true;
    }
    meta.password == password
}

/// Per-session authorization gate.
#[derive(Clone)]
pub struct AccessGate {
    user: Arc<User>,
    metas: Arc<dyn MetaStore>,
    password: String,
}

impl std::fmt::Debug for AccessGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessGate")
            .field("user", &self.user.name)
            .finish_non_exhaustive()
    }
}

impl AccessGate {
    pub fn new(user: Arc<User>, metas: Arc<dyn MetaStore>, password: impl Into<String>) -> Self {
        Self {
            user,
            metas,
            password: password.into(),
        }
    }

    pub fn user(&self) -> &Arc<User> {
        &self.user
    }

    /// Authorize `access` on the backend path `req_path`.
    ///
    /// Write access is judged by the meta of the parent folder, since the
    /// target usually does not exist yet.
    pub async fn check(&self, req_path: &str, access: Access) -> VfsResult<()> {
        let meta_path = match access {
            Access::Write => path::parent(req_path),
            _ => req_path,
        };
        let meta = nearest_meta(self.metas.as_ref(), meta_path).await?;

        if !can_access(&self.user, meta.as_ref(), req_path, &self.password) {
            return Err(VfsError::permission_denied(req_path));
        }

        let mut required = access.required();
        if access == Access::Write
            && meta.as_ref().is_some_and(|m| m.write_applies(meta_path))
        {
            required.remove(Permissions::WRITE);
        }
        if !self.user.can(required) {
            return Err(VfsError::permission_denied(req_path));
        }
        Ok(())
    }
}
