//! Blocking filesystem helpers for materializing and tearing down trees.
//!
//! Callers on an async runtime are expected to run these inside
//! `spawn_blocking`.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use walkdir::WalkDir;

/// Write `bytes` to `path` through a sibling temp file and an atomic rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    fs::create_dir_all(parent)?;
    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

/// Whether an entry name is listed in `exclude`.
pub fn is_excluded(name: &std::ffi::OsStr, exclude: &[String]) -> bool {
    exclude.iter().any(|item| name == item.as_str())
}

/// Copy a single filesystem entry without following symlinks.
///
/// Directories are created (not recursed) with default permissions, regular files keep their
/// permission bits, symlinks are recreated with the same target. Other file
/// types are skipped.
pub fn copy_entry(src: &Path, dst: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(src)?;
    let file_type = meta.file_type();
    if file_type.is_dir() {
        fs::create_dir_all(dst)?;
    } else if file_type.is_file() {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(src, dst)?;
    } else if file_type.is_symlink() {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        let target = fs::read_link(src)?;
        remove_path(dst)?;
        symlink(&target, dst)?;
    }
    Ok(())
}

/// Recursively copy `src` into `dst`, skipping entries named in `exclude`.
/// Returns the number of regular bytes copied.
pub fn copy_tree(src: &Path, dst: &Path, exclude: &[String]) -> io::Result<u64> {
    fs::create_dir_all(dst)?;
    let mut copied = 0u64;
    let walker = WalkDir::new(src)
        .follow_links(false)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !is_excluded(entry.file_name(), exclude));

    for entry in walker {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(io::Error::other)?;
        let target = dst.join(rel);
        copy_entry(entry.path(), &target)?;
        if entry.file_type().is_file() {
            copied += entry.metadata().map_err(io::Error::other)?.len();
        }
    }
    Ok(copied)
}

/// Remove a file, symlink, or directory tree. Missing paths are not an error.
pub fn remove_path(path: &Path) -> io::Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    let result = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Empty a directory while keeping the directory itself.
pub fn clear_dir(path: &Path) -> io::Result<()> {
    if !path.exists() {
        return fs::create_dir_all(path);
    }
    for entry in fs::read_dir(path)? {
        remove_path(&entry?.path())?;
    }
    Ok(())
}

/// Whether an I/O error means the disk or the user quota is full.
pub fn is_quota_error(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(code) if code == libc::ENOSPC || code == libc::EDQUOT)
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn symlink(_target: &Path, _link: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "symlinks are only supported on unix hosts",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn copy_tree_skips_excluded_entries() -> anyhow::Result<()> {
        let src = assert_fs::TempDir::new()?;
        let dst = assert_fs::TempDir::new()?;
        fs::create_dir_all(src.path().join("nested/.git"))?;
        fs::write(src.path().join("nested/a.txt"), "alpha")?;
        fs::write(src.path().join("nested/.git/HEAD"), "ref")?;
        fs::write(src.path().join("top.txt"), "top")?;

        let copied = copy_tree(src.path(), dst.path(), &[".git".to_string()])?;

        assert_eq!(copied, 8);
        assert_eq!(fs::read_to_string(dst.path().join("nested/a.txt"))?, "alpha");
        assert!(!dst.path().join("nested/.git").exists());
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn copy_tree_recreates_symlinks() -> anyhow::Result<()> {
        let src = assert_fs::TempDir::new()?;
        let dst = assert_fs::TempDir::new()?;
        std::os::unix::fs::symlink("/etc/hostname", src.path().join("link"))?;

        copy_tree(src.path(), dst.path(), &[])?;

        assert_eq!(
            fs::read_link(dst.path().join("link"))?,
            Path::new("/etc/hostname")
        );
        Ok(())
    }

    #[test]
    fn write_atomic_replaces_content() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("meta.json");
        write_atomic(&path, b"{\"v\":1}")?;
        write_atomic(&path, b"{\"v\":2}")?;
        assert_eq!(fs::read_to_string(&path)?, "{\"v\":2}");
        Ok(())
    }

    #[test]
    fn remove_path_tolerates_missing_entries() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        remove_path(&dir.path().join("missing"))?;
        fs::create_dir_all(dir.path().join("tree/inner"))?;
        remove_path(&dir.path().join("tree"))?;
        assert!(!dir.path().join("tree").exists());
        Ok(())
    }

    #[test]
    fn clear_dir_keeps_directory() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let upper = dir.path().join("upper");
        fs::create_dir_all(upper.join("x"))?;
        fs::write(upper.join("y"), "y")?;
        clear_dir(&upper)?;
        assert!(upper.is_dir());
        assert_eq!(fs::read_dir(&upper)?.count(), 0);
        Ok(())
    }

    #[test]
    fn quota_errors_are_detected() {
        assert!(is_quota_error(&io::Error::from_raw_os_error(libc::ENOSPC)));
        assert!(!is_quota_error(&io::Error::from_raw_os_error(libc::EACCES)));
    }
}
