//! Path normalization for the virtual file system.
//!
//! Every path entering the VFS goes through [`normalize`]; stored keys are
//! always in canonical form, so lookups never miss on formatting.

use super::VfsError;

/// Canonicalizes a VFS path: trims whitespace, converts `\` to `/`, collapses
/// duplicate separators, enforces a leading `/`, strips a trailing `/` (except
/// for the root itself). Rejects empty paths and paths containing NUL.
pub fn normalize(path: &str) -> Result<String, VfsError> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(VfsError::InvalidPath("empty path".to_string()));
    }
    if trimmed.contains('\0') {
        return Err(VfsError::InvalidPath("path contains NUL".to_string()));
    }

    let mut out = String::with_capacity(trimmed.len() + 1);
    out.push('/');
    for segment in trimmed.split(['/', '\\']) {
        if segment.is_empty() {
            continue;
        }
        if !out.ends_with('/') {
            out.push('/');
        }
        out.push_str(segment);
    }
    Ok(out)
}

/// True when `path` sits under `prefix` (both canonical). `/a` is a prefix of
/// `/a/b` but not of `/ab`.
pub fn has_prefix(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    path == prefix || path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/')
}
