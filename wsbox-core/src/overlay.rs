//! The four directories behind a sandbox.
//!
//! `lower` is a private snapshot of the scoped host subtree; the host tree is
//! never modified here. With a kernel overlay, `merged` is an overlayfs mount
//! of `upper` over `lower`. With the copy layer, `merged` starts as a copy of
//! `lower` and takes writes directly while `upper` stays empty. Either way the
//! set of changes is `merged` compared against `lower`.
//!
//! Every function here blocks; async callers use `spawn_blocking`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use wsbox_commons::fs::{clear_dir, copy_entry, copy_tree, remove_path};
use wsbox_config::{OverlayConfig, OverlayMode};

use crate::error::{EngineError, EngineResult};
use crate::sandbox::Sandbox;

/// Mechanism actually backing a sandbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlayKind {
    Kernel,
    #[default]
    Copy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayDirs {
    pub lower: PathBuf,
    pub upper: PathBuf,
    pub work: PathBuf,
    pub merged: PathBuf,
}

impl OverlayDirs {
    pub fn under(sandbox_dir: &Path) -> Self {
        Self {
            lower: sandbox_dir.join("lower"),
            upper: sandbox_dir.join("upper"),
            work: sandbox_dir.join("work"),
            merged: sandbox_dir.join("merged"),
        }
    }

    pub fn of(sandbox: &Sandbox) -> Self {
        Self {
            lower: sandbox.lower_dir.clone(),
            upper: sandbox.upper_dir.clone(),
            work: sandbox.work_dir.clone(),
            merged: sandbox.merged_dir.clone(),
        }
    }

    fn create_all(&self) -> io::Result<()> {
        for dir in [&self.lower, &self.upper, &self.work, &self.merged] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Outcome of provisioning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provisioned {
    pub kind: OverlayKind,
    /// Why a kernel overlay was not used, when `auto` fell back.
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OverlayLayer {
    mode: OverlayMode,
    exclude: Vec<String>,
}

impl OverlayLayer {
    pub fn new(config: &OverlayConfig) -> Self {
        Self {
            mode: config.mode,
            exclude: config.exclude.clone(),
        }
    }

    pub fn exclude(&self) -> &[String] {
        &self.exclude
    }

    /// Snapshot `source` into `lower` and present it through `merged`.
    pub fn provision(&self, source: &Path, dirs: &OverlayDirs) -> EngineResult<Provisioned> {
        dirs.create_all()
            .map_err(|err| EngineError::io(err, "failed to create overlay directories"))?;
        let bytes = copy_tree(source, &dirs.lower, &self.exclude).map_err(|err| {
            EngineError::io(
                err,
                format!("failed to snapshot {} into lower layer", source.display()),
            )
        })?;
        debug!(source = %source.display(), bytes, "lower layer materialized");

        match self.mode {
            OverlayMode::Copy => {
                self.materialize_copy(dirs)?;
                Ok(Provisioned {
                    kind: OverlayKind::Copy,
                    fallback_reason: None,
                })
            }
            OverlayMode::Kernel => {
                mount_overlay(dirs).map_err(|err| {
                    EngineError::OverlayUnsupported(format!(
                        "kernel overlay mount on {} failed: {err}",
                        dirs.merged.display()
                    ))
                })?;
                Ok(Provisioned {
                    kind: OverlayKind::Kernel,
                    fallback_reason: None,
                })
            }
            OverlayMode::Auto => match mount_overlay(dirs) {
                Ok(()) => Ok(Provisioned {
                    kind: OverlayKind::Kernel,
                    fallback_reason: None,
                }),
                Err(err) => {
                    let reason = format!("kernel overlay unavailable: {err}");
                    warn!(merged = %dirs.merged.display(), %reason, "falling back to copy layer");
                    self.materialize_copy(dirs)?;
                    Ok(Provisioned {
                        kind: OverlayKind::Copy,
                        fallback_reason: Some(reason),
                    })
                }
            },
        }
    }

    fn materialize_copy(&self, dirs: &OverlayDirs) -> EngineResult<()> {
        clear_dir(&dirs.merged)
            .and_then(|_| copy_tree(&dirs.lower, &dirs.merged, &self.exclude))
            .map(|_| ())
            .map_err(|err| EngineError::io(err, "failed to materialize merged directory"))
    }

    /// Make sure a kernel overlay is mounted (after a stop or an engine
    /// restart). No-op for the copy layer.
    pub fn ensure_mounted(&self, dirs: &OverlayDirs, kind: OverlayKind) -> EngineResult<()> {
        if kind == OverlayKind::Copy || is_mounted(&dirs.merged) {
            return Ok(());
        }
        info!(merged = %dirs.merged.display(), "remounting overlay");
        mount_overlay(dirs).map_err(|err| {
            EngineError::OverlayUnsupported(format!(
                "failed to remount overlay on {}: {err}",
                dirs.merged.display()
            ))
        })
    }

    pub fn unmount(&self, dirs: &OverlayDirs, kind: OverlayKind) -> EngineResult<()> {
        if kind == OverlayKind::Copy {
            return Ok(());
        }
        unmount_overlay(&dirs.merged)
            .map_err(|err| EngineError::io(err, "failed to unmount overlay"))
    }

    /// Remove every overlay directory. Only sandbox-private paths are touched.
    pub fn teardown(&self, dirs: &OverlayDirs, kind: OverlayKind) -> EngineResult<()> {
        self.unmount(dirs, kind)?;
        for dir in [&dirs.merged, &dirs.upper, &dirs.work, &dirs.lower] {
            remove_path(dir).map_err(|err| {
                EngineError::io(err, format!("failed to remove {}", dir.display()))
            })?;
        }
        Ok(())
    }

    /// Throw away every change so `merged` equals `lower` again.
    pub fn reset(&self, dirs: &OverlayDirs, kind: OverlayKind) -> EngineResult<()> {
        match kind {
            OverlayKind::Copy => self.materialize_copy(dirs),
            OverlayKind::Kernel => self.with_unmounted(dirs, || {
                clear_dir(&dirs.upper)?;
                clear_dir(&dirs.work)
            }),
        }
    }

    /// Restore `paths` (relative, `/`-separated) in `merged` to their
    /// `lower` state.
    pub fn revert(
        &self,
        dirs: &OverlayDirs,
        kind: OverlayKind,
        paths: &[String],
    ) -> EngineResult<()> {
        let mut paths: Vec<&String> = paths.iter().collect();
        paths.sort();
        match kind {
            OverlayKind::Copy => paths
                .iter()
                .try_for_each(|rel| restore_entry(&dirs.lower, &dirs.merged, rel))
                .map_err(|err| EngineError::io(err, "failed to revert sandbox entries")),
            OverlayKind::Kernel => self.with_unmounted(dirs, || {
                for rel in &paths {
                    revert_upper(dirs, rel)?;
                }
                Ok(())
            }),
        }
    }

    /// Fold `paths` from `merged` into `lower` after they were promoted to the
    /// host, so they no longer show up as changes.
    pub fn absorb(
        &self,
        dirs: &OverlayDirs,
        kind: OverlayKind,
        paths: &[String],
    ) -> EngineResult<()> {
        let mut paths: Vec<&String> = paths.iter().collect();
        paths.sort();
        match kind {
            OverlayKind::Copy => paths
                .iter()
                .try_for_each(|rel| restore_entry(&dirs.merged, &dirs.lower, rel))
                .map_err(|err| EngineError::io(err, "failed to update lower layer")),
            OverlayKind::Kernel => {
                // Read the union view while it is still mounted.
                let stage = tempfile::Builder::new()
                    .prefix(".absorb-")
                    .tempdir_in(
                        dirs.lower
                            .parent()
                            .unwrap_or_else(|| Path::new(std::path::MAIN_SEPARATOR_STR)),
                    )
                    .map_err(|err| EngineError::io(err, "failed to create absorb staging"))?;
                for rel in &paths {
                    let src = dirs.merged.join(rel.as_str());
                    if fs::symlink_metadata(&src).is_ok() {
                        copy_entry(&src, &stage.path().join(rel.as_str()))
                            .map_err(|err| EngineError::io(err, "failed to stage entry"))?;
                    }
                }
                self.with_unmounted(dirs, || {
                    for rel in &paths {
                        restore_entry(stage.path(), &dirs.lower, rel)?;
                    }
                    Ok(())
                })
            }
        }
    }

    /// Drop redundant upper-layer state once `merged` and `lower` agree.
    pub fn compact(&self, dirs: &OverlayDirs, kind: OverlayKind) -> EngineResult<()> {
        match kind {
            OverlayKind::Copy => clear_dir(&dirs.upper)
                .map_err(|err| EngineError::io(err, "failed to clear upper layer")),
            OverlayKind::Kernel => self.reset(dirs, kind),
        }
    }

    fn with_unmounted<F>(&self, dirs: &OverlayDirs, change: F) -> EngineResult<()>
    where
        F: FnOnce() -> io::Result<()>,
    {
        unmount_overlay(&dirs.merged)
            .map_err(|err| EngineError::io(err, "failed to unmount overlay"))?;
        let changed = change().map_err(|err| EngineError::io(err, "failed to edit layers"));
        let remounted = mount_overlay(dirs).map_err(|err| {
            EngineError::OverlayUnsupported(format!("failed to remount overlay: {err}"))
        });
        changed.and(remounted)
    }
}

/// Make `to/rel` match `from/rel` without descending into directories.
fn restore_entry(from: &Path, to: &Path, rel: &str) -> io::Result<()> {
    let src = from.join(rel);
    let dst = to.join(rel);
    let src_meta = match fs::symlink_metadata(&src) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return remove_path(&dst),
        Err(err) => return Err(err),
    };
    let dst_is_dir = fs::symlink_metadata(&dst).is_ok_and(|meta| meta.is_dir());
    if src_meta.is_dir() {
        if !dst_is_dir {
            remove_path(&dst)?;
            fs::create_dir_all(&dst)?;
        }
        return Ok(());
    }
    remove_path(&dst)?;
    copy_entry(&src, &dst)
}

/// Kernel-overlay revert: replace the upper entry so the lower one shows.
fn revert_upper(dirs: &OverlayDirs, rel: &str) -> io::Result<()> {
    let upper = dirs.upper.join(rel);
    let lower = dirs.lower.join(rel);
    remove_path(&upper)?;
    match fs::symlink_metadata(&lower) {
        Ok(meta) if meta.is_dir() => fs::create_dir_all(&upper),
        Ok(_) => copy_entry(&lower, &upper),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

#[cfg(target_os = "linux")]
fn mount_overlay(dirs: &OverlayDirs) -> io::Result<()> {
    use nix::mount::{MsFlags, mount};

    for dir in [&dirs.lower, &dirs.upper, &dirs.work] {
        let text = dir.to_string_lossy();
        if text.contains(',') || text.contains(':') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("overlay path {text} contains ',' or ':'"),
            ));
        }
    }
    let options = format!(
        "lowerdir={},upperdir={},workdir={}",
        dirs.lower.display(),
        dirs.upper.display(),
        dirs.work.display()
    );
    mount(
        Some("overlay"),
        &dirs.merged,
        Some("overlay"),
        MsFlags::empty(),
        Some(options.as_str()),
    )
    .map_err(io::Error::from)
}

#[cfg(not(target_os = "linux"))]
fn mount_overlay(_dirs: &OverlayDirs) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "overlay mounts require Linux",
    ))
}

#[cfg(target_os = "linux")]
fn unmount_overlay(merged: &Path) -> io::Result<()> {
    use nix::errno::Errno;
    use nix::mount::{MntFlags, umount2};

    match umount2(merged, MntFlags::MNT_DETACH) {
        Ok(()) | Err(Errno::EINVAL) | Err(Errno::ENOENT) => Ok(()),
        Err(errno) => Err(io::Error::from(errno)),
    }
}

#[cfg(not(target_os = "linux"))]
fn unmount_overlay(_merged: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(target_os = "linux")]
fn is_mounted(path: &Path) -> bool {
    let Ok(mountinfo) = fs::read_to_string("/proc/self/mountinfo") else {
        return false;
    };
    let wanted = path.to_string_lossy();
    mountinfo
        .lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .any(|mount_point| mount_point == wanted)
}

#[cfg(not(target_os = "linux"))]
fn is_mounted(_path: &Path) -> bool {
    false
}
