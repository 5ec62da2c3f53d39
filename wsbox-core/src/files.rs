//! File tools operating on a sandbox's merged view.
//!
//! Every function blocks; the executor calls them through `spawn_blocking`.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use path_clean::PathClean;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;
use wsbox_commons::PathGuard;
use wsbox_commons::fs::remove_path;

use crate::error::{EngineError, EngineResult};
use crate::sandbox::Sandbox;

/// Largest file `read_file` returns.
pub const MAX_READ_BYTES: u64 = 16 * 1024 * 1024;
/// Entries returned by one `list_files` call.
pub const MAX_LIST_ENTRIES: usize = 10_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encoding {
    #[default]
    #[serde(rename = "auto")]
    Auto,
    #[serde(rename = "utf-8", alias = "utf8")]
    Utf8,
    #[serde(rename = "base64")]
    Base64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    File,
    Directory,
    Symlink,
}

impl EntryType {
    pub fn of(file_type: fs::FileType) -> Self {
        if file_type.is_symlink() {
            EntryType::Symlink
        } else if file_type.is_dir() {
            EntryType::Directory
        } else {
            EntryType::File
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FileEntry {
    pub path: String,
    pub name: String,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Listing {
    pub path: String,
    pub entries: Vec<FileEntry>,
    pub total: usize,
    pub truncated: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub recursive: bool,
    pub include_hidden: bool,
    pub pattern: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    pub encoding: Encoding,
    pub start_line: Option<usize>,
    pub end_line: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileContent {
    pub path: String,
    pub content: String,
    pub encoding: Encoding,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_lines: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_line: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_line: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct WriteOptions {
    pub encoding: Encoding,
    pub create_dirs: bool,
    pub mode: Option<u32>,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            encoding: Encoding::Utf8,
            create_dirs: true,
            mode: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WriteOutcome {
    pub path: String,
    pub bytes_written: usize,
    pub created: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteOutcome {
    pub path: String,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MkdirOutcome {
    pub path: String,
    pub created: bool,
}

/// A caller path mapped into the merged view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub absolute: PathBuf,
    /// `/`-separated path relative to the merged root; empty for the root.
    pub relative: String,
}

/// File access confined to one sandbox's merged directory.
#[derive(Debug, Clone)]
pub struct SandboxFs {
    guard: PathGuard,
    scope_parts: Vec<String>,
    host_scope: PathBuf,
}

impl SandboxFs {
    pub fn new(sandbox: &Sandbox) -> Self {
        let scope_parts = if sandbox.scope_path == "." {
            Vec::new()
        } else {
            sandbox.scope_path.split('/').map(str::to_string).collect()
        };
        Self {
            guard: PathGuard::new(&sandbox.merged_dir),
            scope_parts,
            host_scope: sandbox.host_scope_dir().clean(),
        }
    }

    pub fn root(&self) -> &Path {
        self.guard.root()
    }

    /// Map a caller path into the merged view. `follow_leaf` also checks
    /// where a symlink at the final component points.
    pub fn resolve(&self, raw: &str, follow_leaf: bool) -> EngineResult<Resolved> {
        let raw = raw.trim();
        let input = if raw.is_empty() { "." } else { raw };
        let path = Path::new(input);

        let relative = if path.is_absolute() {
            let cleaned = path.clean();
            if let Ok(rest) = cleaned.strip_prefix(&self.host_scope) {
                rest.to_path_buf()
            } else if let Some(rest) = self.guard.relative(&cleaned) {
                rest
            } else {
                return Err(EngineError::PathEscape(format!(
                    "path '{raw}' is outside the sandbox"
                )));
            }
        } else {
            self.strip_scope_prefix(path)
        };

        let absolute = if relative.as_os_str().is_empty() {
            self.guard.root().to_path_buf()
        } else {
            self.guard.resolve(&relative)?
        };
        self.check_symlinks(&absolute, follow_leaf, raw)?;

        let relative = absolute
            .strip_prefix(self.guard.root())
            .map(join_components)
            .unwrap_or_default();
        Ok(Resolved { absolute, relative })
    }

    /// `src/x` addresses `x` in a sandbox scoped to `src`, unless the scope
    /// itself has an entry named `src`.
    fn strip_scope_prefix(&self, path: &Path) -> PathBuf {
        if self.scope_parts.is_empty() {
            return path.to_path_buf();
        }
        let parts: Vec<&std::ffi::OsStr> = path
            .components()
            .filter_map(|component| match component {
                Component::Normal(part) => Some(part),
                _ => None,
            })
            .collect();
        let leading_normal = matches!(path.components().next(), Some(Component::Normal(_)));
        let matches_scope = leading_normal
            && parts.len() >= self.scope_parts.len()
            && parts
                .iter()
                .zip(&self.scope_parts)
                .all(|(part, scope)| *part == scope.as_str());
        if !matches_scope {
            return path.to_path_buf();
        }
        let shadowed = fs::symlink_metadata(self.guard.root().join(parts[0])).is_ok();
        if shadowed {
            return path.to_path_buf();
        }
        path.components().skip(self.scope_parts.len()).collect()
    }

    fn check_symlinks(&self, absolute: &Path, follow_leaf: bool, raw: &str) -> EngineResult<()> {
        let escape = || {
            EngineError::PathEscape(format!("path '{raw}' leaves the sandbox through a symlink"))
        };
        let root = self.guard.root();

        // Deepest existing ancestor, canonicalized, must stay under the root.
        let mut probe = if follow_leaf {
            Some(absolute)
        } else {
            absolute.parent()
        };
        while let Some(candidate) = probe {
            if !candidate.starts_with(root) {
                break;
            }
            match fs::canonicalize(candidate) {
                Ok(real) => {
                    if !real.starts_with(root) {
                        return Err(escape());
                    }
                    break;
                }
                Err(_) => probe = candidate.parent(),
            }
        }

        // A dangling symlink leaf is judged by its lexical target.
        if follow_leaf
            && let Ok(meta) = fs::symlink_metadata(absolute)
            && meta.file_type().is_symlink()
            && fs::metadata(absolute).is_err()
        {
            let target = fs::read_link(absolute)
                .map_err(|err| EngineError::io(err, "failed to read symlink"))?;
            let parent = absolute.parent().unwrap_or(root);
            let landed = parent.join(target).clean();
            if !landed.starts_with(root) {
                return Err(escape());
            }
        }
        Ok(())
    }

    pub fn list(&self, path: &str, options: &ListOptions) -> EngineResult<Listing> {
        let resolved = self.resolve(path, true)?;
        let meta = fs::metadata(&resolved.absolute)
            .map_err(|err| EngineError::io_lookup(err, format!("cannot list '{path}'")))?;
        if !meta.is_dir() {
            return Err(EngineError::invalid_args(format!("'{path}' is not a directory")));
        }
        let pattern = options
            .pattern
            .as_deref()
            .map(glob::Pattern::new)
            .transpose()
            .map_err(|err| EngineError::invalid_args(format!("invalid pattern: {err}")))?;

        let root = self.guard.root();
        let walker = WalkDir::new(&resolved.absolute)
            .follow_links(false)
            .min_depth(1)
            .max_depth(if options.recursive { usize::MAX } else { 1 })
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() == 0
                    || options.include_hidden
                    || !entry.file_name().to_string_lossy().starts_with('.')
            });

        let mut entries = Vec::new();
        let mut total = 0usize;
        for entry in walker {
            let entry = entry.map_err(|err| {
                EngineError::Internal(anyhow::Error::new(err).context("failed to walk directory"))
            })?;
            let rel = entry
                .path()
                .strip_prefix(root)
                .map(join_components)
                .unwrap_or_default();
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(pattern) = &pattern {
                let subject = if pattern.as_str().contains('/') { &rel } else { &name };
                if !pattern.matches(subject) {
                    continue;
                }
            }
            total += 1;
            if entries.len() >= MAX_LIST_ENTRIES {
                continue;
            }
            let meta = entry.metadata().ok();
            entries.push(FileEntry {
                path: rel,
                name,
                entry_type: EntryType::of(entry.file_type()),
                size: meta
                    .as_ref()
                    .filter(|meta| meta.is_file())
                    .map_or(0, |meta| meta.len()),
                modified: meta
                    .and_then(|meta| meta.modified().ok())
                    .map(DateTime::<Utc>::from),
            });
        }

        Ok(Listing {
            path: resolved.relative,
            truncated: total > entries.len(),
            entries,
            total,
        })
    }

    pub fn read(&self, path: &str, options: &ReadOptions) -> EngineResult<FileContent> {
        let resolved = self.resolve(path, true)?;
        let meta = fs::metadata(&resolved.absolute)
            .map_err(|err| EngineError::io_lookup(err, format!("cannot read '{path}'")))?;
        if meta.is_dir() {
            return Err(EngineError::invalid_args(format!("'{path}' is a directory")));
        }
        if meta.len() > MAX_READ_BYTES {
            return Err(EngineError::invalid_args(format!(
                "'{path}' is {} bytes; read_file returns at most {MAX_READ_BYTES}",
                meta.len()
            )));
        }
        let bytes = fs::read(&resolved.absolute)
            .map_err(|err| EngineError::io_lookup(err, format!("cannot read '{path}'")))?;
        let size = bytes.len() as u64;
        let ranged = options.start_line.is_some() || options.end_line.is_some();

        let text = match options.encoding {
            Encoding::Base64 => None,
            Encoding::Auto => String::from_utf8(bytes.clone()).ok(),
            Encoding::Utf8 => Some(String::from_utf8(bytes.clone()).map_err(|_| {
                EngineError::invalid_args(format!(
                    "'{path}' is not valid UTF-8; use encoding=base64"
                ))
            })?),
        };

        let Some(text) = text else {
            if ranged {
                return Err(EngineError::invalid_args(
                    "start_line/end_line require a UTF-8 file",
                ));
            }
            return Ok(FileContent {
                path: resolved.relative,
                content: BASE64.encode(&bytes),
                encoding: Encoding::Base64,
                size,
                total_lines: None,
                start_line: None,
                end_line: None,
            });
        };

        if !ranged {
            return Ok(FileContent {
                path: resolved.relative,
                content: text,
                encoding: Encoding::Utf8,
                size,
                total_lines: None,
                start_line: None,
                end_line: None,
            });
        }

        let lines: Vec<&str> = text.split_inclusive('\n').collect();
        let total = lines.len();
        let start = options.start_line.unwrap_or(1);
        if start == 0 {
            return Err(EngineError::invalid_args("start_line is 1-based"));
        }
        let end = options.end_line.unwrap_or(total).min(total);
        if options.end_line.is_some_and(|end| end < start) {
            return Err(EngineError::invalid_args("end_line must not precede start_line"));
        }
        let content = if start > total {
            String::new()
        } else {
            lines[start - 1..end].concat()
        };
        Ok(FileContent {
            path: resolved.relative,
            content,
            encoding: Encoding::Utf8,
            size,
            total_lines: Some(total),
            start_line: Some(start),
            end_line: Some(end.max(start.saturating_sub(1))),
        })
    }

    pub fn write(&self, path: &str, content: &str, options: &WriteOptions) -> EngineResult<WriteOutcome> {
        let resolved = self.resolve(path, true)?;
        if resolved.relative.is_empty() {
            return Err(EngineError::invalid_args("cannot write to the sandbox root"));
        }
        let bytes = match options.encoding {
            Encoding::Base64 => BASE64
                .decode(content.trim())
                .map_err(|err| EngineError::invalid_args(format!("invalid base64 content: {err}")))?,
            Encoding::Auto | Encoding::Utf8 => content.as_bytes().to_vec(),
        };

        let created = match fs::metadata(&resolved.absolute) {
            Ok(meta) if meta.is_dir() => {
                return Err(EngineError::invalid_args(format!("'{path}' is a directory")));
            }
            Ok(_) => false,
            Err(err) if err.kind() == io::ErrorKind::NotFound => true,
            Err(err) => return Err(EngineError::io(err, format!("cannot stat '{path}'"))),
        };

        if let Some(parent) = resolved.absolute.parent() {
            if options.create_dirs {
                fs::create_dir_all(parent).map_err(|err| {
                    EngineError::io(err, format!("failed to create parents of '{path}'"))
                })?;
            } else if !parent.is_dir() {
                return Err(EngineError::not_found(format!(
                    "parent directory of '{path}' does not exist"
                )));
            }
        }
        fs::write(&resolved.absolute, &bytes)
            .map_err(|err| EngineError::io(err, format!("failed to write '{path}'")))?;
        if let Some(mode) = options.mode {
            set_mode(&resolved.absolute, mode)?;
        }

        Ok(WriteOutcome {
            path: resolved.relative,
            bytes_written: bytes.len(),
            created,
        })
    }

    pub fn delete(&self, path: &str, recursive: bool) -> EngineResult<DeleteOutcome> {
        let resolved = self.resolve(path, false)?;
        if resolved.relative.is_empty() {
            return Err(EngineError::invalid_args("cannot delete the sandbox root"));
        }
        let meta = fs::symlink_metadata(&resolved.absolute)
            .map_err(|err| EngineError::io_lookup(err, format!("cannot delete '{path}'")))?;
        let entry_type = EntryType::of(meta.file_type());
        if entry_type == EntryType::Directory && !recursive {
            let empty = fs::read_dir(&resolved.absolute)
                .map_err(|err| EngineError::io(err, format!("cannot read '{path}'")))?
                .next()
                .is_none();
            if !empty {
                return Err(EngineError::invalid_args(format!(
                    "directory '{path}' is not empty; pass recursive=true"
                )));
            }
        }
        remove_path(&resolved.absolute)
            .map_err(|err| EngineError::io(err, format!("failed to delete '{path}'")))?;
        Ok(DeleteOutcome {
            path: resolved.relative,
            entry_type,
            deleted: true,
        })
    }

    pub fn create_dir(&self, path: &str, parents: bool, mode: Option<u32>) -> EngineResult<MkdirOutcome> {
        let resolved = self.resolve(path, true)?;
        match fs::metadata(&resolved.absolute) {
            Ok(meta) if meta.is_dir() => {
                return Ok(MkdirOutcome {
                    path: resolved.relative,
                    created: false,
                });
            }
            Ok(_) => {
                return Err(EngineError::conflict(format!(
                    "'{path}' exists and is not a directory"
                )));
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(EngineError::io(err, format!("cannot stat '{path}'"))),
        }

        let result = if parents {
            fs::create_dir_all(&resolved.absolute)
        } else {
            fs::create_dir(&resolved.absolute)
        };
        result.map_err(|err| EngineError::io_lookup(err, format!("failed to create '{path}'")))?;
        if let Some(mode) = mode {
            set_mode(&resolved.absolute, mode)?;
        }
        Ok(MkdirOutcome {
            path: resolved.relative,
            created: true,
        })
    }
}

fn join_components(path: &Path) -> String {
    path.components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> EngineResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
        .map_err(|err| EngineError::io(err, format!("failed to chmod {}", path.display())))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> EngineResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{OwnerType, SandboxStatus};
    use pretty_assertions::assert_eq;
    use serde_json::Map;
    use uuid::Uuid;

    struct Fixture {
        _temp: assert_fs::TempDir,
        project: PathBuf,
        merged: PathBuf,
        fs: SandboxFs,
    }

    fn fixture(scope: &str) -> anyhow::Result<Fixture> {
        let temp = assert_fs::TempDir::new()?;
        let root = fs::canonicalize(temp.path())?;
        let project = root.join("project");
        let merged = root.join("sandbox/merged");
        fs::create_dir_all(&project)?;
        fs::create_dir_all(&merged)?;
        let sandbox = Sandbox {
            id: Uuid::nil(),
            scope_path: scope.to_string(),
            project_root: project.clone(),
            owner: "a1".into(),
            owner_type: OwnerType::Agent,
            status: SandboxStatus::Active,
            no_lock: false,
            lower_dir: root.join("sandbox/lower"),
            upper_dir: root.join("sandbox/upper"),
            work_dir: root.join("sandbox/work"),
            merged_dir: merged.clone(),
            overlay_kind: Default::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            metadata: Map::new(),
        };
        Ok(Fixture {
            fs: SandboxFs::new(&sandbox),
            _temp: temp,
            project,
            merged,
        })
    }

    #[test]
    fn scope_prefix_and_host_paths_map_into_merged() -> anyhow::Result<()> {
        let fx = fixture("src")?;
        assert_eq!(fx.fs.resolve("src/new.txt", true)?.relative, "new.txt");
        assert_eq!(fx.fs.resolve("new.txt", true)?.relative, "new.txt");
        let host = fx.project.join("src/lib/mod.rs");
        let resolved = fx.fs.resolve(&host.to_string_lossy(), true)?;
        assert_eq!(resolved.relative, "lib/mod.rs");
        assert_eq!(resolved.absolute, fx.merged.join("lib/mod.rs"));

        // A real `src` entry inside the scope wins over the prefix rule.
        fs::create_dir_all(fx.merged.join("src"))?;
        assert_eq!(fx.fs.resolve("src/new.txt", true)?.relative, "src/new.txt");
        Ok(())
    }

    #[test]
    fn escapes_are_rejected() -> anyhow::Result<()> {
        let fx = fixture("src")?;
        for bad in ["../../etc/passwd", "/etc/passwd", "a/../../x"] {
            let err = fx.fs.resolve(bad, true).unwrap_err();
            assert_eq!(err.code(), crate::ErrorCode::PathEscape, "{bad}");
        }
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_out_of_the_sandbox_are_not_followed() -> anyhow::Result<()> {
        let fx = fixture(".")?;
        std::os::unix::fs::symlink("/etc", fx.merged.join("etc"))?;
        std::os::unix::fs::symlink("/nonexistent/target", fx.merged.join("dangling"))?;
        std::os::unix::fs::symlink("inner.txt", fx.merged.join("alias"))?;

        let err = fx.fs.read("etc/passwd", &ReadOptions::default()).unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::PathEscape);
        let err = fx.fs.write("dangling", "x", &WriteOptions::default()).unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::PathEscape);

        // In-sandbox links work, and deleting an outward link only removes the link.
        fx.fs.write("alias", "through link", &WriteOptions::default())?;
        assert_eq!(fs::read_to_string(fx.merged.join("inner.txt"))?, "through link");
        fx.fs.delete("etc", false)?;
        assert!(Path::new("/etc").is_dir());
        Ok(())
    }

    #[test]
    fn write_then_read_round_trips_both_encodings() -> anyhow::Result<()> {
        let fx = fixture("src")?;
        let outcome = fx.fs.write("src/new.txt", "hello", &WriteOptions::default())?;
        assert!(outcome.created);
        assert_eq!(outcome.bytes_written, 5);
        let read = fx.fs.read("new.txt", &ReadOptions::default())?;
        assert_eq!(read.content, "hello");
        assert_eq!(read.encoding, Encoding::Utf8);

        let binary = BASE64.encode([0u8, 159, 146, 150]);
        fx.fs.write(
            "bin/blob",
            &binary,
            &WriteOptions {
                encoding: Encoding::Base64,
                ..WriteOptions::default()
            },
        )?;
        let read = fx.fs.read("bin/blob", &ReadOptions::default())?;
        assert_eq!(read.encoding, Encoding::Base64);
        assert_eq!(read.content, binary);

        let err = fx
            .fs
            .read(
                "bin/blob",
                &ReadOptions {
                    encoding: Encoding::Utf8,
                    ..ReadOptions::default()
                },
            )
            .unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::InvalidArgs);
        Ok(())
    }

    #[test]
    fn line_ranges_are_one_based_and_clamped() -> anyhow::Result<()> {
        let fx = fixture(".")?;
        fx.fs.write("f.txt", "a\nb\nc\nd\n", &WriteOptions::default())?;
        let read = fx.fs.read(
            "f.txt",
            &ReadOptions {
                start_line: Some(2),
                end_line: Some(3),
                ..ReadOptions::default()
            },
        )?;
        assert_eq!(read.content, "b\nc\n");
        assert_eq!(read.total_lines, Some(4));

        let tail = fx.fs.read(
            "f.txt",
            &ReadOptions {
                start_line: Some(3),
                end_line: Some(99),
                ..ReadOptions::default()
            },
        )?;
        assert_eq!(tail.content, "c\nd\n");
        assert_eq!(tail.end_line, Some(4));
        Ok(())
    }

    #[test]
    fn listing_honours_hidden_recursion_and_pattern() -> anyhow::Result<()> {
        let fx = fixture(".")?;
        fx.fs.write("a.rs", "", &WriteOptions::default())?;
        fx.fs.write(".hidden", "", &WriteOptions::default())?;
        fx.fs.write("nested/b.rs", "", &WriteOptions::default())?;
        fx.fs.write("nested/c.txt", "", &WriteOptions::default())?;

        let flat = fx.fs.list("", &ListOptions::default())?;
        let names: Vec<&str> = flat.entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(names, vec!["a.rs", "nested"]);

        let deep = fx.fs.list(
            ".",
            &ListOptions {
                recursive: true,
                include_hidden: true,
                pattern: Some("*.rs".into()),
            },
        )?;
        let names: Vec<&str> = deep.entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(names, vec!["a.rs", "nested/b.rs"]);
        assert!(!deep.truncated);
        Ok(())
    }

    #[test]
    fn directories_and_deletes() -> anyhow::Result<()> {
        let fx = fixture(".")?;
        assert!(fx.fs.create_dir("x/y", true, None)?.created);
        assert!(!fx.fs.create_dir("x/y", true, None)?.created);
        let err = fx.fs.create_dir("p/q", false, None).unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::NotFound);

        fx.fs.write("x/y/file", "1", &WriteOptions::default())?;
        let err = fx.fs.create_dir("x/y/file", true, None).unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::Conflict);

        let err = fx.fs.delete("x", false).unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::InvalidArgs);
        let outcome = fx.fs.delete("x", true)?;
        assert_eq!(outcome.entry_type, EntryType::Directory);
        assert!(!fx.merged.join("x").exists());

        let err = fx.fs.delete("x", true).unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::NotFound);
        let err = fx.fs.delete(".", true).unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::InvalidArgs);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn write_applies_octal_mode() -> anyhow::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let fx = fixture(".")?;
        fx.fs.write(
            "run.sh",
            "#!/bin/sh\n",
            &WriteOptions {
                mode: Some(0o755),
                ..WriteOptions::default()
            },
        )?;
        let mode = fs::metadata(fx.merged.join("run.sh"))?.permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        Ok(())
    }
}
