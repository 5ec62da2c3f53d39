//! Authoritative store of sandbox records.
//!
//! Records live in memory behind a read-write lock and are mirrored to
//! `<root>/sandboxes/<uuid>/meta.json`, rewritten atomically on every
//! transition. Each sandbox carries its own async operation lock so that
//! lifecycle and diff operations on one sandbox run one at a time while
//! different sandboxes proceed in parallel.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wsbox_commons::fs::{remove_path, write_atomic};
use wsbox_commons::{PathGuard, TelemetrySink};

use crate::clock::{Clock, IdSource};
use crate::error::{EngineError, EngineResult};
use crate::events::EngineEvent;
use crate::overlay::{OverlayDirs, OverlayKind, OverlayLayer};
use crate::sandbox::{OwnerType, Sandbox, SandboxStatus};

pub const META_FILE: &str = "meta.json";
pub const LOGS_DIR: &str = "logs";
const DEFAULT_LIST_LIMIT: usize = 100;

#[derive(Debug, Clone, Default)]
pub struct CreateSandbox {
    pub scope_path: String,
    pub project_root: PathBuf,
    pub owner: String,
    pub owner_type: OwnerType,
    pub no_lock: bool,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub owner: Option<String>,
    pub project_root: Option<PathBuf>,
    pub status: Vec<SandboxStatus>,
    pub limit: Option<usize>,
    pub offset: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SandboxPage {
    pub sandboxes: Vec<Sandbox>,
    pub total_count: usize,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug)]
pub(crate) struct SandboxEntry {
    record: Mutex<Sandbox>,
    dir: PathBuf,
    op: Arc<tokio::sync::Mutex<()>>,
    diff_busy: AtomicBool,
}

impl SandboxEntry {
    fn new(record: Sandbox, dir: PathBuf) -> Self {
        Self {
            record: Mutex::new(record),
            dir,
            op: Arc::new(tokio::sync::Mutex::new(())),
            diff_busy: AtomicBool::new(false),
        }
    }

    fn snapshot(&self) -> Sandbox {
        self.record.lock().clone()
    }

    fn status(&self) -> SandboxStatus {
        self.record.lock().status
    }
}

/// Exclusive right to run a lifecycle operation on one sandbox.
pub struct SandboxGuard {
    entry: Arc<SandboxEntry>,
    _op: OwnedMutexGuard<()>,
}

impl SandboxGuard {
    pub fn id(&self) -> Uuid {
        self.entry.record.lock().id
    }

    pub fn snapshot(&self) -> Sandbox {
        self.entry.snapshot()
    }
}

/// Clears the per-sandbox diff flag when the owning operation ends.
struct DiffBusy(Arc<SandboxEntry>);

impl DiffBusy {
    fn acquire(entry: Arc<SandboxEntry>) -> Option<Self> {
        (!entry.diff_busy.swap(true, Ordering::SeqCst)).then_some(Self(entry))
    }
}

impl Drop for DiffBusy {
    fn drop(&mut self) {
        self.0.diff_busy.store(false, Ordering::SeqCst);
    }
}

/// Held for the duration of approve, reject or discard. The sandbox is in
/// `approving` while this exists; dropping it without [`SandboxRegistry::finish_approval`]
/// returns the sandbox to `active`.
pub struct ApprovalGuard {
    _op: OwnedMutexGuard<()>,
    busy: DiffBusy,
    clock: Arc<dyn Clock>,
    finished: bool,
}

impl ApprovalGuard {
    fn entry(&self) -> &SandboxEntry {
        &self.busy.0
    }

    pub fn snapshot(&self) -> Sandbox {
        self.entry().snapshot()
    }
}

impl Drop for ApprovalGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let entry = &self.busy.0;
        let mut record = entry.record.lock();
        if record.status == SandboxStatus::Approving {
            record.status = SandboxStatus::Active;
            record.updated_at = self.clock.now();
            if let Err(error) = persist(&entry.dir, &record) {
                warn!(sandbox_id = %record.id, %error, "failed to persist approval rollback");
            }
        }
    }
}

fn persist(dir: &Path, record: &Sandbox) -> EngineResult<()> {
    let bytes = serde_json::to_vec_pretty(record).map_err(|err| {
        EngineError::Internal(anyhow::Error::new(err).context("failed to serialize sandbox record"))
    })?;
    let path = dir.join(META_FILE);
    write_atomic(&path, &bytes)
        .map_err(|err| EngineError::io(err, format!("failed to write {}", path.display())))
}

fn load_record(dir: &Path) -> anyhow::Result<Sandbox> {
    use anyhow::Context;
    let path = dir.join(META_FILE);
    let raw = fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

/// Validate `scope` against `project_root`, returning the canonical root and
/// the scope as a `/`-separated relative path (`.` for the root itself).
pub fn normalize_scope(project_root: &Path, scope: &str) -> EngineResult<(PathBuf, String)> {
    let scope = scope.trim();
    if scope.is_empty() {
        return Err(EngineError::invalid_args("scope_path must not be empty"));
    }
    if !project_root.is_absolute() {
        return Err(EngineError::invalid_args(format!(
            "project_root must be absolute, got {}",
            project_root.display()
        )));
    }
    if !project_root.is_dir() {
        return Err(EngineError::invalid_args(format!(
            "project_root {} is not a directory",
            project_root.display()
        )));
    }

    let guard = PathGuard::new(project_root);
    let resolved = guard.resolve(scope).map_err(|err| {
        EngineError::invalid_args(format!("scope_path escapes project_root: {err}"))
    })?;
    if !resolved.is_dir() {
        return Err(EngineError::invalid_args(format!(
            "scope_path '{scope}' is not a directory under {}",
            project_root.display()
        )));
    }
    let real = fs::canonicalize(&resolved)
        .map_err(|err| EngineError::io(err, "failed to resolve scope_path"))?;
    if !real.starts_with(guard.root()) {
        return Err(EngineError::invalid_args(format!(
            "scope_path '{scope}' resolves outside project_root"
        )));
    }

    let relative = resolved
        .strip_prefix(guard.root())
        .map_err(|err| EngineError::Internal(anyhow::Error::new(err)))?;
    let parts: Vec<String> = relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    let scope = if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    };
    Ok((guard.root().to_path_buf(), scope))
}

pub struct SandboxRegistry {
    sandboxes_dir: PathBuf,
    overlay: OverlayLayer,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdSource>,
    telemetry: Arc<dyn TelemetrySink<EngineEvent>>,
    entries: RwLock<HashMap<Uuid, Arc<SandboxEntry>>>,
}

impl SandboxRegistry {
    /// Open the registry, recovering any records left by a previous run.
    pub fn open(
        sandboxes_dir: impl Into<PathBuf>,
        overlay: OverlayLayer,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdSource>,
        telemetry: Arc<dyn TelemetrySink<EngineEvent>>,
    ) -> EngineResult<Self> {
        let sandboxes_dir = sandboxes_dir.into();
        fs::create_dir_all(&sandboxes_dir).map_err(|err| {
            EngineError::io(
                err,
                format!("failed to create {}", sandboxes_dir.display()),
            )
        })?;
        let registry = Self {
            sandboxes_dir,
            overlay,
            clock,
            ids,
            telemetry,
            entries: RwLock::new(HashMap::new()),
        };
        registry.recover()?;
        Ok(registry)
    }

    fn recover(&self) -> EngineResult<()> {
        let dir_entries = fs::read_dir(&self.sandboxes_dir)
            .map_err(|err| EngineError::io(err, "failed to scan sandboxes directory"))?;
        let mut recovered = HashMap::new();

        for dir_entry in dir_entries.flatten() {
            let dir = dir_entry.path();
            if !dir.is_dir() {
                continue;
            }
            let mut record = match load_record(&dir) {
                Ok(record) => record,
                Err(error) => {
                    warn!(dir = %dir.display(), error = ?error, "skipping unreadable sandbox");
                    continue;
                }
            };
            let dirs = OverlayDirs::of(&record);

            match record.status {
                SandboxStatus::Creating | SandboxStatus::Deleted => {
                    info!(sandbox_id = %record.id, status = %record.status, "removing leftover sandbox");
                    if let Err(error) = self.overlay.teardown(&dirs, record.overlay_kind) {
                        warn!(sandbox_id = %record.id, %error, "overlay teardown failed");
                    }
                    if let Err(error) = remove_path(&dir) {
                        warn!(sandbox_id = %record.id, %error, "failed to remove sandbox directory");
                    }
                    continue;
                }
                SandboxStatus::Approving => {
                    info!(sandbox_id = %record.id, "interrupted approval; returning sandbox to active");
                    record.status = SandboxStatus::Active;
                    record.updated_at = self.clock.now();
                    persist(&dir, &record)?;
                }
                _ => {}
            }

            if record.status == SandboxStatus::Active
                && let Err(error) = self.overlay.ensure_mounted(&dirs, record.overlay_kind)
            {
                warn!(sandbox_id = %record.id, %error, "failed to remount overlay");
            }
            // Processes do not survive a restart, and neither do their logs.
            if let Err(error) = remove_path(&dir.join(LOGS_DIR)) {
                warn!(sandbox_id = %record.id, %error, "failed to clear stale logs");
            }

            debug!(sandbox_id = %record.id, status = %record.status, "recovered sandbox");
            recovered.insert(record.id, Arc::new(SandboxEntry::new(record, dir)));
        }

        *self.entries.write() = recovered;
        Ok(())
    }

    pub fn sandbox_dir(&self, id: Uuid) -> PathBuf {
        self.sandboxes_dir.join(id.to_string())
    }

    pub fn logs_dir(&self, id: Uuid) -> PathBuf {
        self.sandbox_dir(id).join(LOGS_DIR)
    }

    pub fn overlay(&self) -> &OverlayLayer {
        &self.overlay
    }

    fn emit(&self, event: EngineEvent) {
        if let Err(error) = self.telemetry.record(&event) {
            debug!(%error, "telemetry sink rejected event");
        }
    }

    fn entry(&self, id: Uuid) -> EngineResult<Arc<SandboxEntry>> {
        let entry = self
            .entries
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("sandbox {id} not found")))?;
        if entry.status().is_terminal() {
            return Err(EngineError::not_found(format!("sandbox {id} not found")));
        }
        Ok(entry)
    }

    fn lock_holder(
        entries: &HashMap<Uuid, Arc<SandboxEntry>>,
        candidate: &Sandbox,
    ) -> Option<Uuid> {
        entries.values().find_map(|entry| {
            let record = entry.record.lock();
            (record.id != candidate.id
                && record.holds_lock()
                && record.lock_key() == candidate.lock_key())
            .then_some(record.id)
        })
    }

    /// Move `entry` to `to`, persisting the record. Fails with
    /// `invalid_state` when the edge does not exist.
    fn transition(&self, entry: &SandboxEntry, to: SandboxStatus) -> EngineResult<Sandbox> {
        let mut record = entry.record.lock();
        let from = record.status;
        if from.is_terminal() {
            return Err(EngineError::not_found(format!("sandbox {} not found", record.id)));
        }
        if !from.can_transition(to) {
            return Err(EngineError::invalid_state(format!(
                "sandbox {} is {from}; cannot move to {to}",
                record.id
            )));
        }
        let previous = record.clone();
        record.status = to;
        record.updated_at = self.clock.now();
        if let Err(error) = persist(&entry.dir, &record) {
            *record = previous;
            return Err(error);
        }
        let snapshot = record.clone();
        drop(record);

        info!(sandbox_id = %snapshot.id, %from, %to, "sandbox transition");
        self.emit(EngineEvent::SandboxTransition {
            sandbox_id: snapshot.id,
            from: Some(from),
            to,
        });
        Ok(snapshot)
    }

    pub async fn create(&self, request: CreateSandbox) -> EngineResult<Sandbox> {
        let (project_root, scope_path) =
            normalize_scope(&request.project_root, &request.scope_path)?;
        let owner = request.owner.trim().to_string();
        if owner.is_empty() {
            return Err(EngineError::invalid_args("owner must not be empty"));
        }

        let id = self.ids.new_id();
        let dir = self.sandbox_dir(id);
        let dirs = OverlayDirs::under(&dir);
        let now = self.clock.now();
        let record = Sandbox {
            id,
            scope_path,
            project_root,
            owner,
            owner_type: request.owner_type,
            status: SandboxStatus::Creating,
            no_lock: request.no_lock,
            lower_dir: dirs.lower.clone(),
            upper_dir: dirs.upper.clone(),
            work_dir: dirs.work.clone(),
            merged_dir: dirs.merged.clone(),
            overlay_kind: OverlayKind::Copy,
            created_at: now,
            updated_at: now,
            metadata: request.metadata,
        };

        let entry = Arc::new(SandboxEntry::new(record.clone(), dir.clone()));
        {
            let mut entries = self.entries.write();
            if entries.contains_key(&id) {
                return Err(EngineError::Internal(anyhow::anyhow!(
                    "sandbox id {id} already allocated"
                )));
            }
            if record.holds_lock()
                && let Some(holder) = Self::lock_holder(&entries, &record)
            {
                return Err(EngineError::conflict(format!(
                    "sandbox {holder} is already active for scope '{}' in {} (owner {})",
                    record.scope_path,
                    record.project_root.display(),
                    record.owner
                )));
            }
            entries.insert(id, Arc::clone(&entry));
        }
        self.emit(EngineEvent::SandboxTransition {
            sandbox_id: id,
            from: None,
            to: SandboxStatus::Creating,
        });

        let overlay = self.overlay.clone();
        let source = record.host_scope_dir();
        let provision_entry = Arc::clone(&entry);
        let provisioned = tokio::task::spawn_blocking(move || {
            fs::create_dir_all(&provision_entry.dir)
                .map_err(|err| EngineError::io(err, "failed to create sandbox directory"))?;
            persist(&provision_entry.dir, &provision_entry.snapshot())?;
            overlay.provision(&source, &dirs)
        })
        .await
        .map_err(EngineError::from)
        .and_then(|result| result);

        match provisioned {
            Ok(provisioned) => {
                entry.record.lock().overlay_kind = provisioned.kind;
                if let Some(reason) = provisioned.fallback_reason {
                    self.emit(EngineEvent::OverlayFallback {
                        sandbox_id: id,
                        reason,
                    });
                }
                match self.transition(&entry, SandboxStatus::Active) {
                    Ok(sandbox) => Ok(sandbox),
                    Err(error) => {
                        self.abandon(&entry).await;
                        Err(error)
                    }
                }
            }
            Err(error) => {
                warn!(sandbox_id = %id, %error, "sandbox initialization failed");
                self.abandon(&entry).await;
                Err(error)
            }
        }
    }

    /// Tear down a sandbox whose creation failed.
    async fn abandon(&self, entry: &Arc<SandboxEntry>) {
        let snapshot = {
            let mut record = entry.record.lock();
            record.status = SandboxStatus::Deleted;
            record.updated_at = self.clock.now();
            record.clone()
        };
        self.entries.write().remove(&snapshot.id);
        self.emit(EngineEvent::SandboxTransition {
            sandbox_id: snapshot.id,
            from: Some(SandboxStatus::Creating),
            to: SandboxStatus::Deleted,
        });

        let overlay = self.overlay.clone();
        let dir = entry.dir.clone();
        let cleanup = tokio::task::spawn_blocking(move || {
            let dirs = OverlayDirs::of(&snapshot);
            overlay.teardown(&dirs, snapshot.overlay_kind)?;
            remove_path(&dir).map_err(|err| EngineError::io(err, "failed to remove sandbox"))
        })
        .await;
        match cleanup {
            Ok(Ok(())) => {}
            Ok(Err(error)) => warn!(%error, "cleanup after failed create did not finish"),
            Err(error) => warn!(%error, "cleanup task failed"),
        }
    }

    pub fn get(&self, id: Uuid) -> EngineResult<Sandbox> {
        self.entry(id).map(|entry| entry.snapshot())
    }

    pub fn list(&self, filter: &ListFilter) -> SandboxPage {
        let mut matching: Vec<Sandbox> = self
            .entries
            .read()
            .values()
            .map(|entry| entry.snapshot())
            .filter(|sandbox| !sandbox.status.is_terminal())
            .filter(|sandbox| {
                filter
                    .owner
                    .as_ref()
                    .is_none_or(|owner| &sandbox.owner == owner)
            })
            .filter(|sandbox| {
                filter
                    .project_root
                    .as_ref()
                    .is_none_or(|root| &sandbox.project_root == root)
            })
            .filter(|sandbox| filter.status.is_empty() || filter.status.contains(&sandbox.status))
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let total_count = matching.len();
        let limit = filter.limit.unwrap_or(DEFAULT_LIST_LIMIT);
        let sandboxes = matching
            .into_iter()
            .skip(filter.offset)
            .take(limit)
            .collect();
        SandboxPage {
            sandboxes,
            total_count,
            limit,
            offset: filter.offset,
        }
    }

    /// Wait for exclusive access to a sandbox's lifecycle.
    pub async fn lock(&self, id: Uuid) -> EngineResult<SandboxGuard> {
        let entry = self.entry(id)?;
        let op = Arc::clone(&entry.op).lock_owned().await;
        if entry.status().is_terminal() {
            return Err(EngineError::not_found(format!("sandbox {id} not found")));
        }
        Ok(SandboxGuard { entry, _op: op })
    }

    pub async fn start(&self, guard: &SandboxGuard) -> EngineResult<Sandbox> {
        let current = guard.snapshot();
        if current.status != SandboxStatus::Stopped {
            return Err(EngineError::invalid_state(format!(
                "sandbox {} is {}; only a stopped sandbox can be started",
                current.id, current.status
            )));
        }
        if !current.no_lock {
            let entries = self.entries.read();
            if let Some(holder) = Self::lock_holder(&entries, &current) {
                return Err(EngineError::conflict(format!(
                    "sandbox {holder} is already active for scope '{}' (owner {})",
                    current.scope_path, current.owner
                )));
            }
        }

        let overlay = self.overlay.clone();
        let dirs = OverlayDirs::of(&current);
        let kind = current.overlay_kind;
        tokio::task::spawn_blocking(move || overlay.ensure_mounted(&dirs, kind)).await??;
        self.transition(&guard.entry, SandboxStatus::Active)
    }

    /// Stop a sandbox. Its processes must already have been torn down.
    pub async fn stop(&self, guard: &SandboxGuard) -> EngineResult<Sandbox> {
        let stopped = self.transition(&guard.entry, SandboxStatus::Stopped)?;
        let overlay = self.overlay.clone();
        let dirs = OverlayDirs::of(&stopped);
        let kind = stopped.overlay_kind;
        if let Err(error) = tokio::task::spawn_blocking(move || overlay.unmount(&dirs, kind)).await? {
            warn!(sandbox_id = %stopped.id, %error, "failed to unmount overlay on stop");
        }
        Ok(stopped)
    }

    /// Delete a sandbox and every directory it owns. Processes must already
    /// have been torn down.
    pub async fn delete(&self, guard: &SandboxGuard) -> EngineResult<Sandbox> {
        if guard.entry.status() == SandboxStatus::Creating {
            return Err(EngineError::conflict(format!(
                "sandbox {} is still being created",
                guard.id()
            )));
        }
        let deleted = self.transition(&guard.entry, SandboxStatus::Deleted)?;
        self.entries.write().remove(&deleted.id);

        let overlay = self.overlay.clone();
        let dir = guard.entry.dir.clone();
        let snapshot = deleted.clone();
        tokio::task::spawn_blocking(move || {
            overlay.teardown(&OverlayDirs::of(&snapshot), snapshot.overlay_kind)?;
            remove_path(&dir).map_err(|err| {
                EngineError::io(err, format!("failed to remove {}", dir.display()))
            })
        })
        .await??;
        Ok(deleted)
    }

    /// Enter `approving`. A second diff operation on the same sandbox fails
    /// with `conflict` instead of queueing.
    pub async fn begin_approval(&self, id: Uuid) -> EngineResult<ApprovalGuard> {
        let entry = self.entry(id)?;
        let Some(busy) = DiffBusy::acquire(Arc::clone(&entry)) else {
            return Err(EngineError::conflict(format!(
                "sandbox {id} already has an approval in progress"
            )));
        };
        if entry.status() == SandboxStatus::Approving {
            return Err(EngineError::conflict(format!(
                "sandbox {id} already has an approval in progress"
            )));
        }

        let op = Arc::clone(&entry.op).lock_owned().await;
        let current = entry.status();
        if current != SandboxStatus::Active {
            return Err(if current.is_terminal() {
                EngineError::not_found(format!("sandbox {id} not found"))
            } else {
                EngineError::invalid_state(format!(
                    "sandbox {id} is {current}; approvals require an active sandbox"
                ))
            });
        }
        self.transition(&entry, SandboxStatus::Approving)?;
        Ok(ApprovalGuard {
            _op: op,
            busy,
            clock: Arc::clone(&self.clock),
            finished: false,
        })
    }

    /// Leave `approving`. Rejection passes through `discarded` back to `active`.
    pub fn finish_approval(
        &self,
        mut guard: ApprovalGuard,
        outcome: ApprovalOutcome,
    ) -> EngineResult<Sandbox> {
        let result = match outcome {
            ApprovalOutcome::Applied | ApprovalOutcome::Aborted => {
                self.transition(guard.entry(), SandboxStatus::Active)
            }
            ApprovalOutcome::Rejected => self
                .transition(guard.entry(), SandboxStatus::Discarded)
                .and_then(|_| self.transition(guard.entry(), SandboxStatus::Active)),
        };
        if result.is_ok() {
            guard.finished = true;
        }
        result
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Applied,
    /// Nothing was promoted or the operation failed; back to `active`.
    Aborted,
    Rejected,
}
