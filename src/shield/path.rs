//! Path canonicalization — refuses escape from a declared workspace.
//!
//! Normalize `.`/`..` components, then canonicalize (resolving every
//! symlink) either the path itself or, if it doesn't exist yet, its nearest
//! existing ancestor, and require the result to sit under the canonical
//! workspace root. This catches a symlink planted at a not-yet-existing
//! path component, not just one at the leaf.

use std::path::{Component, Path, PathBuf};

use crate::error::CoreError;

/// Resolves `path` (interpreted relative to `workspace`) and succeeds only
/// if the fully resolved path has the workspace's resolved absolute path as
/// a prefix. Invoked before every write-oriented file tool.
pub fn canonicalize(path: &str, workspace: &Path) -> Result<PathBuf, CoreError> {
    let workspace_canonical = workspace.canonicalize().map_err(|e| CoreError::Io(e))?;

    let requested = Path::new(path);
    if requested.is_absolute() {
        return Err(CoreError::InvalidInput {
            reason: "absolute paths are not allowed".to_string(),
        });
    }

    let mut normalized = PathBuf::new();
    for component in requested.components() {
        match component {
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(CoreError::InvalidInput {
                        reason: "path escapes workspace".to_string(),
                    });
                }
            }
            Component::Normal(part) => normalized.push(part),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }

    let effective = workspace_canonical.join(&normalized);

    let canonical_to_check = if effective.exists() {
        effective.canonicalize().map_err(|e| CoreError::Io(e))?
    } else {
        // Walk up to the nearest existing ancestor, canonicalize *that*
        // (resolving any symlink hiding there), then reattach the
        // not-yet-existing suffix underneath the resolved ancestor. This
        // is what stops `workspace/not-yet-created/../../etc` style
        // escapes hidden behind a component that doesn't exist yet.
        let mut ancestor = effective.as_path();
        let mut suffix = PathBuf::new();
        loop {
            match ancestor.parent() {
                Some(parent) if !parent.exists() => {
                    if let Some(name) = ancestor.file_name() {
                        suffix = PathBuf::from(name).join(&suffix);
                    }
                    ancestor = parent;
                }
                Some(parent) => {
                    if let Some(name) = ancestor.file_name() {
                        suffix = PathBuf::from(name).join(&suffix);
                    }
                    let canonical_parent = parent.canonicalize().map_err(|e| CoreError::Io(e))?;
                    break canonical_parent.join(&suffix);
                }
                None => {
                    break ancestor.to_path_buf();
                }
            }
        }
    };

    if !canonical_to_check.starts_with(&workspace_canonical) {
        return Err(CoreError::InvalidInput {
            reason: format!(
                "path '{path}' escapes workspace (resolved to {})",
                canonical_to_check.display()
            ),
        });
    }

    Ok(canonical_to_check)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    #[cfg(unix)]
    use std::os::unix::fs::symlink;

    #[test]
    fn accepts_plain_relative_path() {
        let tmp = tempfile::tempdir().unwrap();
        let resolved = canonicalize("notes.txt", tmp.path()).unwrap();
        assert!(resolved.starts_with(tmp.path().canonicalize().unwrap()));
    }

    #[test]
    fn rejects_absolute_path() {
        let tmp = tempfile::tempdir().unwrap();
        let err = canonicalize("/etc/passwd", tmp.path()).unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput { .. }));
    }

    #[test]
    fn rejects_dotdot_traversal_out_of_workspace() {
        let tmp = tempfile::tempdir().unwrap();
        let workspace = tmp.path().join("ws");
        fs::create_dir_all(&workspace).unwrap();
        let err = canonicalize("../outside", &workspace).unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput { .. }));
    }

    #[test]
    fn rejects_deeper_dotdot_traversal_out_of_workspace() {
        let tmp = tempfile::tempdir().unwrap();
        let workspace = tmp.path().join("ws");
        fs::create_dir_all(&workspace).unwrap();
        let err = canonicalize("../../etc/passwd", &workspace).unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput { .. }));
    }

    #[test]
    fn accepts_dotdot_that_stays_within_workspace() {
        let tmp = tempfile::tempdir().unwrap();
        let workspace = tmp.path().join("ws");
        fs::create_dir_all(&workspace).unwrap();
        let resolved = canonicalize("a/../notes.txt", &workspace).unwrap();
        assert!(resolved.starts_with(workspace.canonicalize().unwrap()));
    }

    #[cfg(unix)]
    #[test]
    fn rejects_symlink_escaping_workspace() {
        let tmp = tempfile::tempdir().unwrap();
        let workspace = tmp.path().join("ws");
        fs::create_dir_all(&workspace).unwrap();
        let evil = workspace.join("evil");
        symlink("/etc/passwd", &evil).unwrap();

        let result = canonicalize("evil", &workspace);
        assert!(result.is_err());
    }
}
