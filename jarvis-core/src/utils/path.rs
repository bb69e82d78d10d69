use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use crate::error::{GovResult, GovernanceError};

/// Resolve `raw` against the workspace `root` and require the result to stay
/// within the canonicalized root. Returns the canonical path.
///
/// Relative inputs join onto the root. Every existing prefix is canonicalized
/// as it is walked, so symlinks are followed before `..` is applied; once a
/// component does not exist the remainder is normalized lexically. This lets
/// create-file targets resolve while still rejecting symlink escapes.
pub fn resolve(raw: &Path, root: &Path) -> GovResult<PathBuf> {
    let root = root.canonicalize()?;
    let candidate = if raw.is_absolute() {
        raw.to_path_buf()
    } else {
        root.join(raw)
    };

    let resolved = canonicalize_lenient(&candidate)?;
    if !resolved.starts_with(&root) {
        return Err(GovernanceError::Containment {
            path: raw.display().to_string(),
            root,
        });
    }
    Ok(resolved)
}

/// Canonicalize the longest existing prefix of `path`, then append the rest.
fn canonicalize_lenient(path: &Path) -> GovResult<PathBuf> {
    let mut out = PathBuf::new();
    let mut on_disk = true;

    for comp in path.components() {
        match comp {
            Component::Prefix(_) | Component::RootDir => out.push(comp.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(name) => {
                out.push(name);
                if on_disk {
                    match out.canonicalize() {
                        Ok(c) => out = c,
                        Err(e) if e.kind() == ErrorKind::NotFound => on_disk = false,
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
    }
    Ok(out)
}

/// Render `path` relative to `root` with `/` separators (`.` for the root).
pub fn relative_display(root: &Path, path: &Path) -> String {
    match path.strip_prefix(root) {
        Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
        Ok(rel) => rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/"),
        Err(_) => path.display().to_string(),
    }
}
