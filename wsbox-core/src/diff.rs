//! Change detection and promotion.
//!
//! The change set of a sandbox is `merged` compared against `lower`. Approval
//! promotes a selection of changes into the host scope directory in two
//! phases: every new entry is first copied into a staging directory next to
//! the target, then moved into place with a journal of backups so a failure
//! (or a cancellation) before the VCS commit restores the host tree exactly.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;
use wsbox_commons::TelemetrySink;
use wsbox_commons::fs::{copy_entry, is_excluded, remove_path};

use crate::error::{EngineError, EngineResult, ErrorCode};
use crate::events::EngineEvent;
use crate::files::{EntryType, SandboxFs};
use crate::overlay::{OverlayDirs, OverlayKind};
use crate::registry::{ApprovalOutcome, SandboxRegistry};
use crate::sandbox::{Sandbox, SandboxStatus};
use crate::textdiff::{DiffOptions, diff_lines};
use crate::vcs::{CommitRequest, VcsAdapter};

/// Files larger than this get no unified diff text.
pub const MAX_TEXT_DIFF_BYTES: u64 = 256 * 1024;
const STAGE_PREFIX: &str = ".wsbox-stage-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Node {
    entry_type: EntryType,
    /// SHA-256 of the bytes, or of the link target for symlinks.
    hash: Option<String>,
    size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Change {
    path: String,
    kind: ChangeKind,
    old: Option<Node>,
    new: Option<Node>,
}

impl Change {
    fn current(&self) -> Option<&Node> {
        self.new.as_ref().or(self.old.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeEntry {
    pub path: String,
    pub kind: ChangeKind,
    pub entry_type: EntryType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    pub old_hash: Option<String>,
    pub new_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiffSummary {
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffReport {
    pub sandbox_id: Uuid,
    pub changes: Vec<ChangeEntry>,
    pub summary: DiffSummary,
}

#[derive(Debug, Clone, Default)]
pub struct ApproveRequest {
    pub commit_message: Option<String>,
    /// Defaults to the sandbox owner.
    pub actor: Option<String>,
    /// Restrict the approval to these paths (and everything below them).
    pub files: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApproveReport {
    pub success: bool,
    pub applied: usize,
    pub remaining: usize,
    pub commit_hash: Option<String>,
    pub files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Failure class when `success` is false.
    #[serde(skip)]
    pub error_code: Option<ErrorCode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectReport {
    pub discarded: usize,
    pub status: SandboxStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscardReport {
    pub discarded: usize,
    pub remaining: usize,
    pub files: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unmatched: Vec<String>,
}

fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn hash_file(path: &Path) -> io::Result<(String, u64)> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let size = io::copy(&mut file, &mut hasher)?;
    Ok((format!("{:x}", hasher.finalize()), size))
}

fn rel_string(rel: &Path) -> String {
    rel.components()
        .map(|part| part.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Every entry under `root` keyed by its `/`-separated relative path.
fn snapshot(root: &Path, exclude: &[String]) -> io::Result<BTreeMap<String, Node>> {
    let mut nodes = BTreeMap::new();
    if !root.exists() {
        return Ok(nodes);
    }
    let walker = WalkDir::new(root)
        .follow_links(false)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !is_excluded(entry.file_name(), exclude));
    for entry in walker {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry.path().strip_prefix(root).map_err(io::Error::other)?;
        let file_type = entry.file_type();
        let node = if file_type.is_dir() {
            Node {
                entry_type: EntryType::Directory,
                hash: None,
                size: 0,
            }
        } else if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            let bytes = target.as_os_str().as_encoded_bytes();
            Node {
                entry_type: EntryType::Symlink,
                hash: Some(hash_bytes(bytes)),
                size: bytes.len() as u64,
            }
        } else if file_type.is_file() {
            let (hash, size) = hash_file(entry.path())?;
            Node {
                entry_type: EntryType::File,
                hash: Some(hash),
                size,
            }
        } else {
            continue;
        };
        nodes.insert(rel_string(rel), node);
    }
    Ok(nodes)
}

/// Changes from `lower` to `merged`, ordered by path.
fn compute_changes(lower: &Path, merged: &Path, exclude: &[String]) -> io::Result<Vec<Change>> {
    let mut old = snapshot(lower, exclude)?;
    let mut new = snapshot(merged, exclude)?;
    let paths: BTreeSet<String> = old.keys().chain(new.keys()).cloned().collect();

    let mut changes = Vec::new();
    for path in paths {
        let before = old.remove(&path);
        let after = new.remove(&path);
        let kind = match (&before, &after) {
            (None, Some(_)) => ChangeKind::Added,
            (Some(_), None) => ChangeKind::Deleted,
            (Some(a), Some(b)) if a != b => ChangeKind::Modified,
            _ => continue,
        };
        changes.push(Change {
            path,
            kind,
            old: before,
            new: after,
        });
    }
    Ok(changes)
}

fn covers(filter: &str, path: &str) -> bool {
    filter.is_empty()
        || path == filter
        || path
            .strip_prefix(filter)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Split `changes` into those covered by `filters` and the filters that
/// matched nothing.
fn select(changes: &[Change], filters: &[String]) -> (Vec<Change>, Vec<String>) {
    let selected = changes
        .iter()
        .filter(|change| filters.iter().any(|filter| covers(filter, &change.path)))
        .cloned()
        .collect();
    let unmatched = filters
        .iter()
        .filter(|filter| !changes.iter().any(|change| covers(filter, &change.path)))
        .cloned()
        .collect();
    (selected, unmatched)
}

fn text_diff(lower: &Path, merged: &Path, change: &Change) -> Option<String> {
    let new = change.new.as_ref()?;
    if new.entry_type != EntryType::File || new.size > MAX_TEXT_DIFF_BYTES {
        return None;
    }
    let old_text = match &change.old {
        Some(old) if old.entry_type == EntryType::File && old.size <= MAX_TEXT_DIFF_BYTES => {
            String::from_utf8(fs::read(lower.join(&change.path)).ok()?).ok()?
        }
        Some(_) => return None,
        None => String::new(),
    };
    let new_text = String::from_utf8(fs::read(merged.join(&change.path)).ok()?).ok()?;
    let old_label = if change.old.is_some() {
        format!("a/{}", change.path)
    } else {
        "/dev/null".to_string()
    };
    let diff = diff_lines(&old_text, &new_text, DiffOptions::default());
    (!diff.is_empty()).then(|| diff.unified(&old_label, &format!("b/{}", change.path)))
}

fn report(
    sandbox: &Sandbox,
    changes: Vec<Change>,
    include_diff: bool,
) -> DiffReport {
    let mut summary = DiffSummary {
        total: changes.len(),
        ..DiffSummary::default()
    };
    let entries = changes
        .into_iter()
        .filter_map(|change| {
            match change.kind {
                ChangeKind::Added => summary.added += 1,
                ChangeKind::Modified => summary.modified += 1,
                ChangeKind::Deleted => summary.deleted += 1,
            }
            let current = change.current()?.clone();
            let diff = (include_diff && change.kind != ChangeKind::Deleted)
                .then(|| text_diff(&sandbox.lower_dir, &sandbox.merged_dir, &change))
                .flatten();
            Some(ChangeEntry {
                entry_type: current.entry_type,
                size: (current.entry_type != EntryType::Directory).then_some(current.size),
                old_hash: change.old.and_then(|node| node.hash),
                new_hash: change.new.and_then(|node| node.hash),
                path: change.path,
                kind: change.kind,
                diff,
            })
        })
        .collect();
    DiffReport {
        sandbox_id: sandbox.id,
        changes: entries,
        summary,
    }
}

#[derive(Debug)]
enum Undo {
    Placed(PathBuf),
    Moved { backup: PathBuf, target: PathBuf },
    CreatedDir(PathBuf),
}

/// Host-side edits of one approval, reversible until [`Promotion::finish`].
#[derive(Debug)]
struct Promotion {
    stage: TempDir,
    undo: Vec<Undo>,
    backups: usize,
}

/// A promotion that stopped part-way; the host tree is already restored.
struct PromoteFailure {
    applied: usize,
    error: EngineError,
}

impl Promotion {
    fn begin(host: &Path) -> io::Result<Self> {
        let stage = tempfile::Builder::new()
            .prefix(STAGE_PREFIX)
            .tempdir_in(host)?;
        fs::create_dir(stage.path().join("new"))?;
        fs::create_dir(stage.path().join("backup"))?;
        Ok(Self {
            stage,
            undo: Vec::new(),
            backups: 0,
        })
    }

    fn staged(&self, index: usize) -> PathBuf {
        self.stage.path().join("new").join(index.to_string())
    }

    /// Move whatever sits at `target` out of the way.
    fn set_aside(&mut self, target: &Path) -> io::Result<()> {
        if fs::symlink_metadata(target).is_err() {
            return Ok(());
        }
        let backup = self
            .stage
            .path()
            .join("backup")
            .join(self.backups.to_string());
        self.backups += 1;
        fs::rename(target, &backup)?;
        self.undo.push(Undo::Moved {
            backup,
            target: target.to_path_buf(),
        });
        Ok(())
    }

    fn create_parents(&mut self, host: &Path, target: &Path) -> io::Result<()> {
        let mut missing = Vec::new();
        let mut cursor = target.parent();
        while let Some(dir) = cursor {
            if dir == host || dir.exists() {
                break;
            }
            missing.push(dir.to_path_buf());
            cursor = dir.parent();
        }
        for dir in missing.into_iter().rev() {
            fs::create_dir(&dir)?;
            self.undo.push(Undo::CreatedDir(dir));
        }
        Ok(())
    }

    fn apply(&mut self, host: &Path, index: usize, change: &Change) -> io::Result<()> {
        let target = host.join(&change.path);
        match &change.new {
            None => self.set_aside(&target),
            Some(node) if node.entry_type == EntryType::Directory => {
                if fs::symlink_metadata(&target).is_ok_and(|meta| meta.is_dir()) {
                    return Ok(());
                }
                self.set_aside(&target)?;
                self.create_parents(host, &target)?;
                fs::create_dir(&target)?;
                self.undo.push(Undo::CreatedDir(target));
                Ok(())
            }
            Some(_) => {
                self.set_aside(&target)?;
                self.create_parents(host, &target)?;
                fs::rename(self.staged(index), &target)?;
                self.undo.push(Undo::Placed(target));
                Ok(())
            }
        }
    }

    fn rollback(mut self) {
        while let Some(step) = self.undo.pop() {
            let result = match &step {
                Undo::Placed(target) => remove_path(target),
                Undo::Moved { backup, target } => {
                    remove_path(target).and_then(|()| fs::rename(backup, target))
                }
                Undo::CreatedDir(dir) => fs::remove_dir(dir),
            };
            if let Err(error) = result {
                warn!(?step, %error, "failed to undo promotion step");
            }
        }
    }

    /// Keep the promoted state and drop the backups.
    fn finish(self) {
        let path = self.stage.path().to_path_buf();
        if let Err(error) = self.stage.close() {
            warn!(path = %path.display(), %error, "failed to remove staging directory");
        }
    }
}

/// Deletions deepest first, then additions and modifications parents first.
fn promotion_order(changes: &[Change]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..changes.len())
        .filter(|&i| changes[i].kind == ChangeKind::Deleted)
        .rev()
        .collect();
    order.extend((0..changes.len()).filter(|&i| changes[i].kind != ChangeKind::Deleted));
    order
}

fn promote(
    host: &Path,
    merged: &Path,
    changes: &[Change],
    cancel: &CancellationToken,
) -> Result<Promotion, PromoteFailure> {
    let fail = |applied, error| PromoteFailure { applied, error };
    let mut promotion = Promotion::begin(host)
        .map_err(|err| fail(0, EngineError::io(err, "failed to create staging directory")))?;

    for (index, change) in changes.iter().enumerate() {
        let is_entry = change
            .new
            .as_ref()
            .is_some_and(|node| node.entry_type != EntryType::Directory);
        if is_entry
            && let Err(err) = copy_entry(&merged.join(&change.path), &promotion.staged(index))
        {
            let error = EngineError::io(err, format!("failed to stage {}", change.path));
            promotion.rollback();
            return Err(fail(0, error));
        }
    }

    let mut applied = 0;
    for index in promotion_order(changes) {
        if cancel.is_cancelled() {
            promotion.rollback();
            return Err(fail(applied, EngineError::Cancelled));
        }
        let change = &changes[index];
        if let Err(err) = promotion.apply(host, index, change) {
            let error = EngineError::io(err, format!("failed to apply {}", change.path));
            promotion.rollback();
            return Err(fail(applied, error));
        }
        applied += 1;
    }
    Ok(promotion)
}

/// Computes, applies and reverts sandbox change sets.
pub struct DiffEngine {
    registry: Arc<SandboxRegistry>,
    vcs: Arc<dyn VcsAdapter>,
    telemetry: Arc<dyn TelemetrySink<EngineEvent>>,
    commit_locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl DiffEngine {
    pub fn new(
        registry: Arc<SandboxRegistry>,
        vcs: Arc<dyn VcsAdapter>,
        telemetry: Arc<dyn TelemetrySink<EngineEvent>>,
    ) -> Self {
        Self {
            registry,
            vcs,
            telemetry,
            commit_locks: Mutex::new(HashMap::new()),
        }
    }

    fn emit(&self, event: EngineEvent) {
        if let Err(error) = self.telemetry.record(&event) {
            debug!(%error, "telemetry sink rejected event");
        }
    }

    fn commit_lock(&self, project_root: &Path) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.commit_locks
                .lock()
                .entry(project_root.to_path_buf())
                .or_default(),
        )
    }

    async fn changes(&self, sandbox: &Sandbox) -> EngineResult<Vec<Change>> {
        let lower = sandbox.lower_dir.clone();
        let merged = sandbox.merged_dir.clone();
        let exclude = self.registry.overlay().exclude().to_vec();
        tokio::task::spawn_blocking(move || compute_changes(&lower, &merged, &exclude))
            .await?
            .map_err(|err| EngineError::io(err, "failed to scan sandbox changes"))
    }

    /// Normalize caller paths the way file tools do; paths that cannot
    /// address anything in the sandbox are returned as unmatched.
    fn filters(sandbox: &Sandbox, files: &[String]) -> (Vec<String>, Vec<String>) {
        let fs = SandboxFs::new(sandbox);
        let mut filters = Vec::new();
        let mut rejected = Vec::new();
        for raw in files {
            match fs.resolve(raw, false) {
                Ok(resolved) => filters.push(resolved.relative),
                Err(error) => {
                    debug!(path = %raw, %error, "ignoring unusable path");
                    rejected.push(raw.clone());
                }
            }
        }
        (filters, rejected)
    }

    /// The current change set. A stopped kernel-backed sandbox is mounted
    /// for the duration of the scan.
    pub async fn diff(&self, id: Uuid, include_diff: bool) -> EngineResult<DiffReport> {
        let sandbox = self.registry.get(id)?;
        match sandbox.status {
            status if status.allows_diff_read() => {}
            SandboxStatus::Approving => {
                return Err(EngineError::conflict(format!(
                    "sandbox {id} has an approval in progress"
                )));
            }
            status => {
                return Err(EngineError::invalid_state(format!(
                    "sandbox {id} is {status}; its changes cannot be read"
                )));
            }
        }

        if sandbox.status == SandboxStatus::Stopped && sandbox.overlay_kind == OverlayKind::Kernel {
            let guard = self.registry.lock(id).await?;
            let sandbox = guard.snapshot();
            let overlay = self.registry.overlay().clone();
            let exclude = overlay.exclude().to_vec();
            let scanned = sandbox.clone();
            let changes = tokio::task::spawn_blocking(move || {
                let dirs = OverlayDirs::of(&scanned);
                overlay.ensure_mounted(&dirs, scanned.overlay_kind)?;
                let changes = compute_changes(&dirs.lower, &dirs.merged, &exclude)
                    .map_err(|err| EngineError::io(err, "failed to scan sandbox changes"));
                if scanned.status == SandboxStatus::Stopped
                    && let Err(error) = overlay.unmount(&dirs, scanned.overlay_kind)
                {
                    warn!(sandbox_id = %scanned.id, %error, "failed to unmount after diff");
                }
                changes
            })
            .await??;
            return self.report_blocking(sandbox, changes, include_diff).await;
        }

        let changes = self.changes(&sandbox).await?;
        self.report_blocking(sandbox, changes, include_diff).await
    }

    async fn report_blocking(
        &self,
        sandbox: Sandbox,
        changes: Vec<Change>,
        include_diff: bool,
    ) -> EngineResult<DiffReport> {
        Ok(tokio::task::spawn_blocking(move || report(&sandbox, changes, include_diff)).await?)
    }

    /// Promote changes into the host tree and commit them.
    pub async fn approve(
        &self,
        id: Uuid,
        request: ApproveRequest,
        cancel: &CancellationToken,
    ) -> EngineResult<ApproveReport> {
        let sandbox = self.registry.get(id)?;
        let host = sandbox.host_scope_dir();
        if !self.vcs.is_tracked(&host).await? {
            return Err(EngineError::NoVcs(format!(
                "{} is not under {} version control",
                host.display(),
                self.vcs.name()
            )));
        }

        let guard = self.registry.begin_approval(id).await?;
        let sandbox = guard.snapshot();
        let commit_lock = self.commit_lock(&sandbox.project_root);
        let _commit = commit_lock.lock().await;

        let changes = self.changes(&sandbox).await?;
        let (selected, mut unmatched) = match &request.files {
            Some(files) => {
                let (filters, rejected) = Self::filters(&sandbox, files);
                let (selected, mut unmatched) = select(&changes, &filters);
                unmatched.extend(rejected);
                (selected, unmatched)
            }
            None => (changes.clone(), Vec::new()),
        };
        unmatched.sort();
        let unmatched_error = (!unmatched.is_empty())
            .then(|| format!("not in the change set: {}", unmatched.join(", ")));

        if selected.is_empty() {
            self.registry.finish_approval(guard, ApprovalOutcome::Aborted)?;
            return Ok(ApproveReport {
                success: true,
                applied: 0,
                remaining: changes.len(),
                commit_hash: None,
                files: Vec::new(),
                error: unmatched_error,
                error_code: None,
            });
        }

        let paths: Vec<String> = selected.iter().map(|change| change.path.clone()).collect();
        let promotion = {
            let host = host.clone();
            let merged = sandbox.merged_dir.clone();
            let cancel = cancel.clone();
            let selected = selected.clone();
            tokio::task::spawn_blocking(move || promote(&host, &merged, &selected, &cancel))
                .await?
        };
        let promotion = match promotion {
            Ok(promotion) => promotion,
            Err(PromoteFailure { error: EngineError::Cancelled, .. }) => {
                self.registry.finish_approval(guard, ApprovalOutcome::Aborted)?;
                return Err(EngineError::Cancelled);
            }
            Err(failure) => {
                warn!(sandbox_id = %id, error = %failure.error, "promotion failed; host tree restored");
                self.registry.finish_approval(guard, ApprovalOutcome::Aborted)?;
                return Ok(ApproveReport {
                    success: false,
                    applied: failure.applied,
                    remaining: changes.len(),
                    commit_hash: None,
                    files: Vec::new(),
                    error: Some(failure.error.public_message()),
                    error_code: Some(failure.error.code()),
                });
            }
        };

        let commit_request = CommitRequest {
            message: request.commit_message.unwrap_or_default(),
            actor: request
                .actor
                .filter(|actor| !actor.trim().is_empty())
                .unwrap_or_else(|| sandbox.owner.clone()),
            sandbox_id: id,
        };
        let committed = if cancel.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            match self.vcs.stage(&host, &paths).await {
                Ok(()) => self
                    .vcs
                    .commit(&host, &paths, &commit_request)
                    .await
                    .map_err(EngineError::Internal),
                Err(error) => Err(EngineError::Internal(error)),
            }
        };
        let commit_hash = match committed {
            Ok(hash) => hash,
            Err(error) => {
                if let Err(rollback) = self.vcs.rollback(&host, &paths).await {
                    warn!(sandbox_id = %id, error = %rollback, "failed to roll back the index after failed commit");
                }
                tokio::task::spawn_blocking(move || promotion.rollback()).await?;
                self.registry.finish_approval(guard, ApprovalOutcome::Aborted)?;
                if matches!(error, EngineError::Cancelled) {
                    return Err(error);
                }
                warn!(sandbox_id = %id, error = ?error, "commit failed; host tree restored");
                return Ok(ApproveReport {
                    success: false,
                    applied: 0,
                    remaining: changes.len(),
                    commit_hash: None,
                    files: Vec::new(),
                    error: Some(format!("commit failed: {error}")),
                    error_code: Some(error.code()),
                });
            }
        };
        tokio::task::spawn_blocking(move || promotion.finish()).await?;

        let overlay = self.registry.overlay().clone();
        let dirs = OverlayDirs::of(&sandbox);
        let kind = sandbox.overlay_kind;
        let absorbed = paths.clone();
        tokio::task::spawn_blocking(move || overlay.absorb(&dirs, kind, &absorbed)).await??;

        let remaining = self.changes(&sandbox).await?.len();
        if remaining == 0 {
            let overlay = self.registry.overlay().clone();
            let dirs = OverlayDirs::of(&sandbox);
            tokio::task::spawn_blocking(move || overlay.compact(&dirs, kind)).await??;
        }
        self.registry.finish_approval(guard, ApprovalOutcome::Applied)?;

        info!(
            sandbox_id = %id,
            applied = paths.len(),
            remaining,
            commit = commit_hash.as_deref().unwrap_or("-"),
            "changes approved"
        );
        self.emit(EngineEvent::ChangesApproved {
            sandbox_id: id,
            applied: paths.len(),
            commit_hash: commit_hash.clone(),
        });
        Ok(ApproveReport {
            success: true,
            applied: paths.len(),
            remaining,
            commit_hash,
            files: paths,
            error: unmatched_error,
            error_code: None,
        })
    }

    /// Throw every change away. The host tree is never touched.
    pub async fn reject(&self, id: Uuid, actor: Option<&str>) -> EngineResult<RejectReport> {
        let guard = self.registry.begin_approval(id).await?;
        let sandbox = guard.snapshot();
        let discarded = self.changes(&sandbox).await?.len();

        let overlay = self.registry.overlay().clone();
        let dirs = OverlayDirs::of(&sandbox);
        let kind = sandbox.overlay_kind;
        tokio::task::spawn_blocking(move || overlay.reset(&dirs, kind)).await??;
        let sandbox = self.registry.finish_approval(guard, ApprovalOutcome::Rejected)?;

        info!(sandbox_id = %id, discarded, actor = actor.unwrap_or("-"), "changes rejected");
        self.emit(EngineEvent::ChangesRejected {
            sandbox_id: id,
            discarded,
        });
        Ok(RejectReport {
            discarded,
            status: sandbox.status,
        })
    }

    /// Revert the listed paths (and everything below them) to their
    /// snapshot state.
    pub async fn discard(
        &self,
        id: Uuid,
        files: &[String],
        actor: Option<&str>,
    ) -> EngineResult<DiscardReport> {
        if files.is_empty() {
            return Err(EngineError::invalid_args("files must list at least one path"));
        }
        let guard = self.registry.begin_approval(id).await?;
        let sandbox = guard.snapshot();
        let changes = self.changes(&sandbox).await?;
        let (filters, rejected) = Self::filters(&sandbox, files);
        let (selected, mut unmatched) = select(&changes, &filters);
        unmatched.extend(rejected);
        unmatched.sort();

        let paths: Vec<String> = selected.into_iter().map(|change| change.path).collect();
        if !paths.is_empty() {
            let overlay = self.registry.overlay().clone();
            let dirs = OverlayDirs::of(&sandbox);
            let kind = sandbox.overlay_kind;
            let reverted = paths.clone();
            tokio::task::spawn_blocking(move || overlay.revert(&dirs, kind, &reverted)).await??;
        }
        let remaining = self.changes(&sandbox).await?.len();
        self.registry.finish_approval(guard, ApprovalOutcome::Aborted)?;

        info!(
            sandbox_id = %id,
            discarded = paths.len(),
            remaining,
            actor = actor.unwrap_or("-"),
            "files discarded"
        );
        self.emit(EngineEvent::FilesDiscarded {
            sandbox_id: id,
            discarded: paths.len(),
        });
        Ok(DiscardReport {
            discarded: paths.len(),
            remaining,
            files: paths,
            unmatched,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{FixedClock, SequentialIds};
    use crate::overlay::OverlayLayer;
    use crate::registry::CreateSandbox;
    use anyhow::{Result, bail};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicBool, Ordering};
    use wsbox_commons::MemoryTelemetry;
    use wsbox_config::{OverlayConfig, OverlayMode};

    /// Records commits instead of running a VCS.
    #[derive(Default)]
    struct FakeVcs {
        untracked: bool,
        fail_commit: AtomicBool,
        commits: Mutex<Vec<(String, Vec<String>)>>,
        rolled_back: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl VcsAdapter for FakeVcs {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn is_tracked(&self, _root: &Path) -> Result<bool> {
            Ok(!self.untracked)
        }

        async fn stage(&self, _root: &Path, _paths: &[String]) -> Result<()> {
            Ok(())
        }

        async fn commit(
            &self,
            _root: &Path,
            paths: &[String],
            request: &CommitRequest,
        ) -> Result<Option<String>> {
            if self.fail_commit.load(Ordering::SeqCst) {
                bail!("hook rejected the commit");
            }
            self.commits
                .lock()
                .push((request.message.clone(), paths.to_vec()));
            Ok(Some("f00dfeed".to_string()))
        }

        async fn rollback(&self, _root: &Path, paths: &[String]) -> Result<()> {
            self.rolled_back.lock().extend(paths.iter().cloned());
            Ok(())
        }
    }

    struct Fixture {
        _temp: tempfile::TempDir,
        host: PathBuf,
        registry: Arc<SandboxRegistry>,
        vcs: Arc<FakeVcs>,
        engine: DiffEngine,
        sandbox: Sandbox,
    }

    async fn fixture(vcs: FakeVcs) -> Result<Fixture> {
        let temp = tempfile::tempdir()?;
        let project = temp.path().join("project");
        fs::create_dir_all(project.join("src/keep"))?;
        fs::create_dir_all(project.join("src/.git"))?;
        fs::write(project.join("src/main.rs"), "fn main() {}\n")?;
        fs::write(project.join("src/keep/old.txt"), "old\n")?;
        let start = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap_or_default();
        let telemetry = Arc::new(MemoryTelemetry::new());
        let registry = Arc::new(SandboxRegistry::open(
            temp.path().join("engine/sandboxes"),
            OverlayLayer::new(&OverlayConfig {
                mode: OverlayMode::Copy,
                exclude: vec![".git".to_string()],
            }),
            Arc::new(FixedClock::new(start)),
            Arc::new(SequentialIds::new()),
            telemetry.clone(),
        )?);
        let sandbox = registry
            .create(CreateSandbox {
                scope_path: "src".to_string(),
                project_root: project.clone(),
                owner: "a1".to_string(),
                ..CreateSandbox::default()
            })
            .await?;
        let vcs = Arc::new(vcs);
        let engine = DiffEngine::new(registry.clone(), vcs.clone(), telemetry);
        Ok(Fixture {
            _temp: temp,
            host: sandbox.host_scope_dir(),
            registry,
            vcs,
            engine,
            sandbox,
        })
    }

    fn write(fx: &Fixture, rel: &str, content: &str) -> Result<()> {
        let path = fx.sandbox.merged_dir.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    fn paths(report: &DiffReport) -> Vec<(String, ChangeKind)> {
        report
            .changes
            .iter()
            .map(|change| (change.path.clone(), change.kind))
            .collect()
    }

    #[test]
    fn changes_are_classified_and_ordered() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let lower = temp.path().join("lower");
        let merged = temp.path().join("merged");
        for root in [&lower, &merged] {
            fs::create_dir_all(root.join("dir"))?;
            fs::create_dir_all(root.join(".git"))?;
            fs::write(root.join("same.txt"), "same")?;
        }
        fs::write(lower.join("edit.txt"), "before")?;
        fs::write(merged.join("edit.txt"), "after")?;
        fs::write(lower.join("gone.txt"), "x")?;
        fs::write(merged.join("dir/new.txt"), "hello")?;
        fs::write(merged.join(".git/HEAD"), "ref")?;
        fs::write(lower.join("flip"), "file")?;
        fs::create_dir(merged.join("flip"))?;

        let changes = compute_changes(&lower, &merged, &[".git".to_string()])?;
        let kinds: Vec<(&str, ChangeKind)> = changes
            .iter()
            .map(|change| (change.path.as_str(), change.kind))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("dir/new.txt", ChangeKind::Added),
                ("edit.txt", ChangeKind::Modified),
                ("flip", ChangeKind::Modified),
                ("gone.txt", ChangeKind::Deleted),
            ]
        );
        assert_eq!(changes[0].new.as_ref().map(|node| node.size), Some(5));
        Ok(())
    }

    #[test]
    fn filters_cover_whole_subtrees() {
        assert!(covers("a", "a"));
        assert!(covers("a", "a/b.txt"));
        assert!(!covers("a", "ab.txt"));
        assert!(covers("", "anything"));
    }

    #[tokio::test]
    async fn diff_reports_unified_text() -> Result<()> {
        let fx = fixture(FakeVcs::default()).await?;
        write(&fx, "main.rs", "fn main() { run(); }\n")?;
        write(&fx, "new.txt", "hello")?;
        fs::remove_file(fx.sandbox.merged_dir.join("keep/old.txt"))?;

        let report = fx.engine.diff(fx.sandbox.id, true).await?;
        assert_eq!(
            paths(&report),
            vec![
                ("keep/old.txt".to_string(), ChangeKind::Deleted),
                ("main.rs".to_string(), ChangeKind::Modified),
                ("new.txt".to_string(), ChangeKind::Added),
            ]
        );
        assert_eq!(
            report.summary,
            DiffSummary {
                added: 1,
                modified: 1,
                deleted: 1,
                total: 3
            }
        );
        let main = &report.changes[1];
        let text = main.diff.as_deref().unwrap_or_default();
        assert!(text.contains("--- a/main.rs"));
        assert!(text.contains("+fn main() { run(); }"));
        assert_eq!(report.changes[2].size, Some(5));
        assert!(report.changes[0].diff.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn approve_all_promotes_and_clears_the_diff() -> Result<()> {
        let fx = fixture(FakeVcs::default()).await?;
        write(&fx, "new.txt", "hello")?;
        write(&fx, "nested/deep/file.txt", "deep")?;
        fs::remove_file(fx.sandbox.merged_dir.join("keep/old.txt"))?;

        let report = fx
            .engine
            .approve(
                fx.sandbox.id,
                ApproveRequest {
                    commit_message: Some("agent work".into()),
                    ..ApproveRequest::default()
                },
                &CancellationToken::new(),
            )
            .await?;
        assert!(report.success);
        assert_eq!(report.remaining, 0);
        assert_eq!(report.commit_hash.as_deref(), Some("f00dfeed"));
        assert_eq!(fs::read_to_string(fx.host.join("new.txt"))?, "hello");
        assert_eq!(fs::read_to_string(fx.host.join("nested/deep/file.txt"))?, "deep");
        assert!(!fx.host.join("keep/old.txt").exists());
        assert!(fx.host.join(".git").is_dir());
        assert!(
            fs::read_dir(&fx.host)?
                .filter_map(|entry| entry.ok())
                .all(|entry| !entry.file_name().to_string_lossy().starts_with(STAGE_PREFIX))
        );

        let commits = fx.vcs.commits.lock().clone();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].0, "agent work");
        assert!(fx.engine.diff(fx.sandbox.id, false).await?.changes.is_empty());
        assert_eq!(fx.registry.get(fx.sandbox.id)?.status, SandboxStatus::Active);
        Ok(())
    }

    #[tokio::test]
    async fn partial_approval_leaves_the_rest() -> Result<()> {
        let fx = fixture(FakeVcs::default()).await?;
        write(&fx, "a.txt", "A")?;
        write(&fx, "b.txt", "B")?;

        let report = fx
            .engine
            .approve(
                fx.sandbox.id,
                ApproveRequest {
                    files: Some(vec!["src/a.txt".into(), "missing.txt".into()]),
                    ..ApproveRequest::default()
                },
                &CancellationToken::new(),
            )
            .await?;
        assert!(report.success);
        assert_eq!((report.applied, report.remaining), (1, 1));
        assert_eq!(report.files, vec!["a.txt".to_string()]);
        assert!(report.error.as_deref().is_some_and(|e| e.contains("missing.txt")));
        assert!(fx.host.join("a.txt").is_file());
        assert!(!fx.host.join("b.txt").exists());

        let report = fx.engine.diff(fx.sandbox.id, false).await?;
        assert_eq!(paths(&report), vec![("b.txt".to_string(), ChangeKind::Added)]);
        Ok(())
    }

    #[tokio::test]
    async fn failed_commit_restores_the_host_tree() -> Result<()> {
        let vcs = FakeVcs::default();
        vcs.fail_commit.store(true, Ordering::SeqCst);
        let fx = fixture(vcs).await?;
        write(&fx, "main.rs", "changed\n")?;
        write(&fx, "fresh/new.txt", "new")?;
        fs::remove_file(fx.sandbox.merged_dir.join("keep/old.txt"))?;

        let report = fx
            .engine
            .approve(fx.sandbox.id, ApproveRequest::default(), &CancellationToken::new())
            .await?;
        assert!(!report.success);
        assert_eq!(report.error_code, Some(ErrorCode::InternalError));
        assert_eq!(report.remaining, 4);
        assert_eq!(fs::read_to_string(fx.host.join("main.rs"))?, "fn main() {}\n");
        assert_eq!(fs::read_to_string(fx.host.join("keep/old.txt"))?, "old\n");
        assert!(!fx.host.join("fresh").exists());
        assert_eq!(fx.vcs.rolled_back.lock().len(), 4);
        assert_eq!(fx.registry.get(fx.sandbox.id)?.status, SandboxStatus::Active);
        assert_eq!(fx.engine.diff(fx.sandbox.id, false).await?.summary.total, 4);
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_approval_writes_nothing() -> Result<()> {
        let fx = fixture(FakeVcs::default()).await?;
        write(&fx, "new.txt", "hello")?;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = fx
            .engine
            .approve(fx.sandbox.id, ApproveRequest::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
        assert!(!fx.host.join("new.txt").exists());
        assert!(fx.vcs.commits.lock().is_empty());
        assert_eq!(fx.registry.get(fx.sandbox.id)?.status, SandboxStatus::Active);
        Ok(())
    }

    #[tokio::test]
    async fn untracked_host_is_refused_before_any_write() -> Result<()> {
        let fx = fixture(FakeVcs {
            untracked: true,
            ..FakeVcs::default()
        })
        .await?;
        write(&fx, "new.txt", "hello")?;
        let err = fx
            .engine
            .approve(fx.sandbox.id, ApproveRequest::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoVcs);
        assert!(!fx.host.join("new.txt").exists());
        Ok(())
    }

    #[tokio::test]
    async fn empty_approval_commits_nothing() -> Result<()> {
        let fx = fixture(FakeVcs::default()).await?;
        let report = fx
            .engine
            .approve(fx.sandbox.id, ApproveRequest::default(), &CancellationToken::new())
            .await?;
        assert!(report.success);
        assert_eq!((report.applied, report.remaining), (0, 0));
        assert_eq!(report.commit_hash, None);
        assert!(fx.vcs.commits.lock().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn reject_is_repeatable() -> Result<()> {
        let fx = fixture(FakeVcs::default()).await?;
        write(&fx, "scratch.txt", "x")?;
        let first = fx.engine.reject(fx.sandbox.id, Some("u")).await?;
        assert_eq!(first.discarded, 1);
        assert_eq!(first.status, SandboxStatus::Active);
        assert!(!fx.sandbox.merged_dir.join("scratch.txt").exists());
        assert!(!fx.host.join("scratch.txt").exists());

        let second = fx.engine.reject(fx.sandbox.id, Some("u")).await?;
        assert_eq!(second.discarded, 0);
        Ok(())
    }

    #[tokio::test]
    async fn discard_reverts_only_named_paths() -> Result<()> {
        let fx = fixture(FakeVcs::default()).await?;
        write(&fx, "main.rs", "edited\n")?;
        write(&fx, "tmp/a.txt", "a")?;
        write(&fx, "tmp/b.txt", "b")?;

        let report = fx
            .engine
            .discard(fx.sandbox.id, &["tmp".into(), "nope".into()], None)
            .await?;
        assert_eq!(report.discarded, 3);
        assert_eq!(report.remaining, 1);
        assert_eq!(report.unmatched, vec!["nope".to_string()]);
        assert!(!fx.sandbox.merged_dir.join("tmp").exists());
        assert_eq!(
            fs::read_to_string(fx.sandbox.merged_dir.join("main.rs"))?,
            "edited\n"
        );

        let err = fx.engine.discard(fx.sandbox.id, &[], None).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgs);
        Ok(())
    }

    #[tokio::test]
    async fn diff_of_a_stopped_copy_sandbox_is_readable() -> Result<()> {
        let fx = fixture(FakeVcs::default()).await?;
        write(&fx, "new.txt", "hello")?;
        let guard = fx.registry.lock(fx.sandbox.id).await?;
        fx.registry.stop(&guard).await?;
        drop(guard);

        let report = fx.engine.diff(fx.sandbox.id, false).await?;
        assert_eq!(report.summary.added, 1);
        let err = fx.engine.reject(fx.sandbox.id, None).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidState);
        Ok(())
    }
}
