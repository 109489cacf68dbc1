//! Logical path helpers.
//!
//! Paths on the share are `/`-separated strings, always absolute after
//! cleaning. These never touch the host filesystem.

use super::error::{VfsError, VfsResult};

/// Clean a path: force a leading `/`, drop empty and `.` segments,
/// resolve `..` (clamped at the root), strip any trailing `/`.
pub fn clean(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Join a relative name (or path) onto a base, then clean.
pub fn join(base: &str, name: &str) -> String {
    clean(&format!("{base}/{name}"))
}

/// Parent directory of a cleaned path. The root is its own parent.
pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

/// Last segment of a cleaned path (empty for the root).
pub fn base_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}

/// Split a cleaned path into `(parent, base_name)`.
pub fn split(path: &str) -> (&str, &str) {
    (parent(path), base_name(path))
}

/// Whether `path` is `root` or lies below it. Both must be cleaned.
pub fn is_within(root: &str, path: &str) -> bool {
    root == "/" || path == root || path.starts_with(&format!("{root}/"))
}

/// Resolve a client-supplied logical path against a user's base path.
///
/// Logical paths may not climb above the base via `..`; such paths are
/// rejected rather than clamped.
pub fn join_base(base: &str, logical: &str) -> VfsResult<String> {
    let mut depth: usize = 0;
    for segment in logical.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| VfsError::invalid_path(logical))?;
            }
            _ => depth += 1,
        }
    }
    Ok(join(&clean(base), logical))
}
