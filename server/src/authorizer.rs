//! Allow-list checks for every path the server touches.
//!
//! Roots are canonicalized once. Candidate paths are resolved the same way
//! before the containment test, so symlinks and `..` segments cannot be used
//! to step outside a root. Paths that do not exist yet (a file about to be
//! created, a file that was just deleted) resolve through their nearest
//! existing ancestor; a dangling link on the way is resolved to its target.

use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("path not allowed: {path}")]
pub struct AccessDenied {
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct PathAuthorizer {
    roots: Vec<PathBuf>,
}

impl PathAuthorizer {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        let roots = roots
            .into_iter()
            .filter_map(|root| match resolve(&root) {
                Some(resolved) => {
                    if !resolved.exists() {
                        warn!(root = %root.display(), "allowed root does not exist yet");
                    }
                    Some(resolved)
                }
                None => {
                    warn!(root = %root.display(), "cannot resolve allowed root, ignoring it");
                    None
                }
            })
            .collect();
        Self { roots }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    pub fn is_allowed(&self, path: &Path) -> bool {
        self.check(path).is_ok()
    }

    /// Resolve `path` and confirm it sits under an allowed root.
    ///
    /// Returns the resolved form on success.
    pub fn check(&self, path: &Path) -> Result<PathBuf, AccessDenied> {
        let denied = || AccessDenied { path: path.display().to_string() };
        if self.roots.is_empty() {
            return Err(denied());
        }
        let resolved = resolve(path).ok_or_else(denied)?;
        if self.roots.iter().any(|root| resolved.starts_with(root)) {
            Ok(resolved)
        } else {
            Err(denied())
        }
    }
}

/// Link hops followed while resolving one path before giving up.
const MAX_LINK_HOPS: usize = 40;

/// Canonical absolute form of `path`, whether or not it exists.
fn resolve(path: &Path) -> Option<PathBuf> {
    resolve_with_hops(path, 0)
}

fn resolve_with_hops(path: &Path, hops: usize) -> Option<PathBuf> {
    if path.as_os_str().is_empty() {
        return None;
    }
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().ok()?.join(path)
    };

    // Walk up until something exists, then replay the missing tail.
    let mut existing = absolute.as_path();
    let mut tail: Vec<Component<'_>> = Vec::new();
    let mut base = loop {
        match existing.canonicalize() {
            Ok(canonical) => break canonical,
            Err(_) => {
                let parent = existing.parent()?;
                tail.push(existing.components().next_back()?);
                existing = parent;
            }
        }
    };

    for component in tail.into_iter().rev() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                base.pop();
            }
            Component::Normal(part) => {
                base.push(part);
                // A dangling link fails canonicalize but still redirects writes.
                if is_symlink(&base) {
                    if hops >= MAX_LINK_HOPS {
                        return None;
                    }
                    let target = std::fs::read_link(&base).ok()?;
                    let link_dir = base.parent()?.to_path_buf();
                    base = resolve_with_hops(&link_dir.join(target), hops + 1)?;
                }
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(base)
}

fn is_symlink(path: &Path) -> bool {
    std::fs::symlink_metadata(path).map(|m| m.file_type().is_symlink()).unwrap_or(false)
}
