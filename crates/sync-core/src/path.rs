//! Vault-relative path rules.
//!
//! Paths are `/`-separated, relative to the vault root, and never carry a
//! leading or trailing separator. The root itself has no record and is
//! represented by the empty string only as a parent.

use thiserror::Error;

/// Upper bound on the byte length of a stored path.
pub const MAX_PATH_LEN: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("Empty path not allowed")]
    Empty,

    #[error("Path too long ({0} bytes)")]
    TooLong(usize),

    #[error("Absolute path not allowed: {0}")]
    Absolute(String),

    #[error("Empty path segment not allowed: {0}")]
    EmptySegment(String),

    #[error("Path traversal not allowed: {0}")]
    Traversal(String),

    #[error("Backslash in path not allowed: {0}")]
    Backslash(String),

    #[error("Control character in path not allowed: {0:?}")]
    ControlCharacter(String),
}

/// Check that `path` is acceptable as a record key.
pub fn validate(path: &str) -> Result<(), PathError> {
    if path.is_empty() {
        return Err(PathError::Empty);
    }
    if path.len() > MAX_PATH_LEN {
        return Err(PathError::TooLong(path.len()));
    }
    if path.starts_with('/') {
        return Err(PathError::Absolute(path.into()));
    }
    if path.contains('\\') {
        return Err(PathError::Backslash(path.into()));
    }
    // Covers NUL as well.
    if path.chars().any(char::is_control) {
        return Err(PathError::ControlCharacter(path.into()));
    }
    for segment in path.split('/') {
        match segment {
            "" => return Err(PathError::EmptySegment(path.into())),
            "." | ".." => return Err(PathError::Traversal(path.into())),
            _ => {}
        }
    }
    Ok(())
}

/// Parent folder path, or `None` for a top-level path.
pub fn parent(path: &str) -> Option<&str> {
    path.rsplit_once('/').map(|(parent, _)| parent)
}

/// Last segment of the path.
pub fn name(path: &str) -> &str {
    path.rsplit_once('/').map_or(path, |(_, name)| name)
}

/// Number of segments; top-level paths have depth 1.
pub fn depth(path: &str) -> usize {
    if path.is_empty() {
        0
    } else {
        path.split('/').count()
    }
}

/// Join a parent path (empty for the root) and a child name.
pub fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

/// True when `path` lies strictly below `ancestor`.
pub fn is_descendant(path: &str, ancestor: &str) -> bool {
    path.len() > ancestor.len() + 1
        && path.starts_with(ancestor)
        && path.as_bytes()[ancestor.len()] == b'/'
}

/// True when `path` is `prefix` or lies below it. Every path is within the
/// empty prefix.
pub fn is_within(path: &str, prefix: &str) -> bool {
    prefix.is_empty() || path == prefix || is_descendant(path, prefix)
}

/// `path` with ` (tag)` added to its last segment, before the extension
/// unless `whole_name` is set.
pub fn tagged(path: &str, tag: &str, whole_name: bool) -> String {
    let (dir, name) = path.rsplit_once('/').unwrap_or(("", path));
    let name = match name.rfind('.') {
        Some(dot) if dot > 0 && !whole_name => {
            format!("{} ({tag}){}", &name[..dot], &name[dot..])
        }
        _ => format!("{name} ({tag})"),
    };
    join(dir, &name)
}

/// Move `path` from under `from` to under `to`.
///
/// Returns `None` when `path` is neither `from` nor one of its descendants.
pub fn rebase(path: &str, from: &str, to: &str) -> Option<String> {
    if path == from {
        return Some(to.to_string());
    }
    if is_descendant(path, from) {
        return Some(format!("{to}{}", &path[from.len()..]));
    }
    None
}
