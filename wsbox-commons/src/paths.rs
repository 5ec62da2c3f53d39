use std::path::{Path, PathBuf};

use path_clean::PathClean;
use thiserror::Error;
use tracing::warn;

/// Reasons a caller-supplied path is refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("path '{path}' escapes {}", .root.display())]
    Escape { path: String, root: PathBuf },
    #[error("invalid path '{path}': {reason}")]
    Invalid { path: String, reason: &'static str },
}

/// Canonicalize a root directory, falling back to its lexical form when the
/// directory does not exist yet.
pub fn canonicalize_root(root: &Path) -> PathBuf {
    std::fs::canonicalize(root).unwrap_or_else(|error| {
        warn!(
            path = %root.display(),
            %error,
            "Failed to canonicalize root; falling back to lexical path"
        );
        root.clean()
    })
}

/// Containment checks against one root directory.
///
/// The root is symlink-resolved once at construction. Paths handed to
/// [`PathGuard::resolve`] are only cleaned lexically, so a symlink created
/// inside the root is never followed while deciding containment.
#[derive(Debug, Clone)]
pub struct PathGuard {
    root: PathBuf,
    declared: PathBuf,
}

impl PathGuard {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let declared = root.as_ref().clean();
        let root = canonicalize_root(&declared);
        Self { root, declared }
    }

    /// Canonical root every resolved path starts with.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Join `rel` onto the root and reject the result when it leaves the root.
    ///
    /// Absolute inputs are accepted only when they already sit under the root
    /// (either its canonical or its declared spelling).
    pub fn resolve(&self, rel: impl AsRef<Path>) -> Result<PathBuf, PathError> {
        let rel = rel.as_ref();
        let display = rel.to_string_lossy().into_owned();

        if rel.as_os_str().is_empty() {
            return Err(PathError::Invalid {
                path: display,
                reason: "path is empty",
            });
        }
        if rel.as_os_str().as_encoded_bytes().contains(&0) {
            return Err(PathError::Invalid {
                path: display,
                reason: "path contains a NUL byte",
            });
        }

        if rel.is_absolute() {
            return self
                .rebase(&rel.clean())
                .ok_or_else(|| self.escape(display));
        }

        let joined = self.root.join(rel).clean();
        if joined.starts_with(&self.root) {
            Ok(joined)
        } else {
            Err(self.escape(display))
        }
    }

    /// Same containment rule as [`PathGuard::resolve`] without building a path.
    pub fn is_within(&self, candidate: impl AsRef<Path>) -> bool {
        let candidate = candidate.as_ref();
        if candidate.is_absolute() {
            self.rebase(&candidate.clean()).is_some()
        } else {
            self.root.join(candidate).clean().starts_with(&self.root)
        }
    }

    /// Path of `absolute` relative to the root, if it is contained.
    pub fn relative(&self, absolute: &Path) -> Option<PathBuf> {
        let rebased = self.rebase(&absolute.clean())?;
        rebased
            .strip_prefix(&self.root)
            .ok()
            .map(Path::to_path_buf)
    }

    fn rebase(&self, absolute: &Path) -> Option<PathBuf> {
        if absolute.starts_with(&self.root) {
            return Some(absolute.to_path_buf());
        }
        absolute
            .strip_prefix(&self.declared)
            .ok()
            .map(|rest| self.root.join(rest))
    }

    fn escape(&self, path: String) -> PathError {
        PathError::Escape {
            path,
            root: self.root.clone(),
        }
    }
}

/// Resolve `rel` under `root`, see [`PathGuard::resolve`].
pub fn resolve(root: &Path, rel: &Path) -> Result<PathBuf, PathError> {
    PathGuard::new(root).resolve(rel)
}

/// Whether `candidate` stays inside `root`, see [`PathGuard::is_within`].
pub fn is_within(root: &Path, candidate: &Path) -> bool {
    PathGuard::new(root).is_within(candidate)
}
