//! Project-boundary path validation.
//!
//! Validation happens before anything is spawned or touched: a path that
//! is absolute, traverses upward, or escapes the boundary through a
//! symlink is rejected with a security error.

use std::path::{Component, Path, PathBuf};

use crate::error::SandboxError;

/// Validate that `candidate` (a path relative to `root`) stays inside the
/// boundary, returning the canonical absolute path.
///
/// `root` must already be canonical.
pub fn validate_within(root: &Path, candidate: &str) -> Result<PathBuf, SandboxError> {
    let rel = Path::new(candidate);

    if rel.as_os_str().is_empty() {
        return Err(SandboxError::Security("empty path".to_string()));
    }
    if rel.is_absolute() {
        return Err(SandboxError::Security(format!(
            "`{candidate}` is absolute; paths must be relative to the project root"
        )));
    }
    for component in rel.components() {
        match component {
            Component::ParentDir => {
                return Err(SandboxError::Security(format!(
                    "`{candidate}` traverses outside the project root"
                )))
            }
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(SandboxError::Security(format!(
                    "`{candidate}` is not a plain relative path"
                )))
            }
        }
    }

    // Canonicalize to resolve symlinks, then re-check the boundary.
    let joined = root.join(rel);
    let canonical = joined.canonicalize()?;
    if !canonical.starts_with(root) {
        return Err(SandboxError::Security(format!(
            "`{candidate}` resolves outside the project root"
        )));
    }

    Ok(canonical)
}

/// Like [`validate_within`], but for paths that may not exist yet (write
/// targets). The deepest existing ancestor is canonicalized instead.
pub fn validate_target_within(root: &Path, candidate: &str) -> Result<PathBuf, SandboxError> {
    let rel = Path::new(candidate);

    if rel.as_os_str().is_empty() {
        return Err(SandboxError::Security("empty path".to_string()));
    }
    if rel.is_absolute() {
        return Err(SandboxError::Security(format!(
            "`{candidate}` is absolute; paths must be relative to the project root"
        )));
    }
    for component in rel.components() {
        if matches!(component, Component::ParentDir) {
            return Err(SandboxError::Security(format!(
                "`{candidate}` traverses outside the project root"
            )));
        }
    }

    let joined = root.join(rel);
    let parent = joined
        .parent()
        .ok_or_else(|| SandboxError::Security(format!("`{candidate}` has no parent")))?;

    // Walk up to the deepest ancestor that exists; symlinked ancestors
    // must still land inside the boundary.
    let mut probe = parent.to_path_buf();
    loop {
        match probe.canonicalize() {
            Ok(canonical) => {
                if !canonical.starts_with(root) {
                    return Err(SandboxError::Security(format!(
                        "`{candidate}` resolves outside the project root"
                    )));
                }
                break;
            }
            Err(_) => match probe.parent() {
                Some(next) => probe = next.to_path_buf(),
                None => {
                    return Err(SandboxError::Security(format!(
                        "`{candidate}` has no resolvable ancestor"
                    )))
                }
            },
        }
    }

    Ok(joined)
}
