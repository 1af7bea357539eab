//! Sequencing a snapshot backup as one transaction
//!
//! Forward path: resolve and size, pre-flush, freeze, create and confirm the
//! snapshot, release, mount, archive, unmount, remove. Every step that
//! acquires something pushes the matching [`Cleanup`] first; on any failure
//! the stack is unwound in reverse and cleanup errors are attached to the
//! primary error. On success each cleanup is completed explicitly in order.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::mem::discriminant;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{error, info, warn};

use crate::archive::{ArchiveManifest, ArchivePolicy, ArchiveStreamer, SnapshotSummary, StreamContext};
use crate::cancel::CancelToken;
use crate::error::{BackupError, Result};
use crate::events::{BackupEvent, EventSink, LogSink};
use crate::lock::{LockCoordinator, LockPolicy, LockState, ReplicationInfo};
use crate::snapshot::{SnapshotHandle, SnapshotManager, SnapshotState, validate_name};
use crate::utils::fmt::{format_bytes, format_interval};
use crate::utils::io::{build_excluder, clear_dir, directory_size, remove_dir_if_exists};
use crate::utils::mounts::{canonical_or_self, remap};
use crate::volume::{SizeLimits, SizePolicy, VolumeDescriptor, VolumeInspector, compute_size};

/// Sources with a run in progress in this process.
static ACTIVE_SOURCES: Lazy<Mutex<HashSet<PathBuf>>> = Lazy::new(|| Mutex::new(HashSet::new()));
static MOUNT_ROOT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Everything one run needs; not modified once the run starts.
#[derive(Debug, Clone, Serialize)]
pub struct BackupRequest {
    pub source_path: PathBuf,
    pub snapshot_size: SizePolicy,
    pub size_limits: SizeLimits,
    /// Snapshot name; empty selects `<lv>_snapshot`
    pub snapshot_name_prefix: String,
    /// Directory the snapshot is mounted under; `None` uses a fresh temporary one
    pub mount_root: Option<PathBuf>,
    pub lock_policy: LockPolicy,
    pub archive_policy: ArchivePolicy,
    /// Where archive members are written; must be absent or empty
    pub output_dir: PathBuf,
}

impl BackupRequest {
    pub fn new(source_path: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_path: source_path.into(),
            snapshot_size: SizePolicy::default(),
            size_limits: SizeLimits::default(),
            snapshot_name_prefix: String::new(),
            mount_root: None,
            lock_policy: LockPolicy::default(),
            archive_policy: ArchivePolicy::default(),
            output_dir: output_dir.into(),
        }
    }

    pub fn snapshot_name(&self, volume: &VolumeDescriptor) -> String {
        if self.snapshot_name_prefix.is_empty() {
            format!("{}_snapshot", volume.logical_volume)
        } else {
            self.snapshot_name_prefix.clone()
        }
    }
}

/// What a run would do, computed without touching anything.
#[derive(Debug, Clone, Serialize)]
pub struct BackupPlan {
    pub volume: VolumeDescriptor,
    pub snapshot_name: String,
    pub snapshot_size: u64,
    /// `None` when a temporary mount root will be created
    pub mount_path: Option<PathBuf>,
    /// Data directory relative to the root of the snapshot
    pub archive_path: PathBuf,
    /// Bytes in regular files under the source, excluded paths skipped
    pub estimated_bytes: u64,
    pub lock_driver: &'static str,
    pub lock_policy: LockPolicy,
    pub archive_policy: ArchivePolicy,
}

/// Undo action registered by a forward step.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Cleanup {
    ReleaseLock,
    UnmountSnapshot,
    RemoveSnapshot,
    DiscardOutput(PathBuf),
    ClearOutput(PathBuf),
    RemoveMountRoot(PathBuf),
}

/// Advisory lock keyed by canonical source path, held for one run.
struct SourceGuard(PathBuf);

impl SourceGuard {
    fn acquire(source: &Path) -> Result<SourceGuard> {
        let key = canonical_or_self(source);
        let mut active = ACTIVE_SOURCES.lock();
        if !active.insert(key.clone()) {
            return Err(BackupError::Busy(key));
        }
        Ok(SourceGuard(key))
    }
}

impl Drop for SourceGuard {
    fn drop(&mut self) {
        ACTIVE_SOURCES.lock().remove(&self.0);
    }
}

pub struct Orchestrator {
    inspector: Box<dyn VolumeInspector>,
    lock: LockCoordinator,
    snapshots: SnapshotManager,
    streamer: Box<dyn ArchiveStreamer>,
    events: Arc<dyn EventSink>,
    cancel: CancelToken,
}

impl Orchestrator {
    pub fn new(
        inspector: Box<dyn VolumeInspector>,
        lock: LockCoordinator,
        snapshots: SnapshotManager,
        streamer: Box<dyn ArchiveStreamer>,
    ) -> Self {
        Self {
            inspector,
            lock,
            snapshots,
            streamer,
            events: Arc::new(LogSink),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that cancels this orchestrator's runs.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn lock_state(&self) -> LockState {
        self.lock.state()
    }

    pub fn lock_driver(&self) -> &'static str {
        self.lock.driver_name()
    }

    pub fn snapshot_state(&self) -> SnapshotState {
        self.snapshots.state()
    }

    pub fn snapshot(&self) -> Option<&SnapshotHandle> {
        self.snapshots.handle()
    }

    /// Resolve, size and name the snapshot without side effects.
    pub fn plan(&self, request: &BackupRequest) -> Result<BackupPlan> {
        request.archive_policy.compression.validate()?;
        let volume = self.inspector.resolve(&request.source_path)?;
        let snapshot_size = compute_size(&volume, &request.snapshot_size, &request.size_limits)?;
        let snapshot_name = request.snapshot_name(&volume);
        validate_name(&snapshot_name)?;

        let source = canonical_or_self(&request.source_path);
        let archive_path = source
            .strip_prefix(&volume.mount_point)
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let excluder = build_excluder(&source, &request.archive_policy.exclude)
            .map_err(|e| BackupError::InvalidConfig(format!("exclude pattern: {}", e)))?;
        let estimated_bytes = directory_size(&source, &excluder)
            .map_err(|(path, err)| BackupError::ArchiveReadFailed { path, source: err })?;

        Ok(BackupPlan {
            mount_path: request.mount_root.as_ref().map(|root| root.join(&snapshot_name)),
            volume,
            snapshot_name,
            snapshot_size,
            archive_path,
            estimated_bytes,
            lock_driver: self.lock.driver_name(),
            lock_policy: request.lock_policy,
            archive_policy: request.archive_policy.clone(),
        })
    }

    /// Run one backup. Either everything succeeds and the manifest is
    /// returned, or every resource acquired on the way has been released.
    pub fn run(&mut self, request: &BackupRequest) -> Result<ArchiveManifest> {
        let _guard = SourceGuard::acquire(&request.source_path)?;
        let start = Instant::now();
        info!(target: "snapfreeze::orchestrator", "Starting snapshot backup of {}", request.source_path.display());
        self.events.emit(&BackupEvent::RunStarted { source: request.source_path.clone() });

        let mut unwind = Vec::new();
        let result = match self.forward(request, &mut unwind) {
            Ok(manifest) => Ok(manifest),
            Err(primary) => {
                error!(target: "snapfreeze::orchestrator", kind = primary.kind(), "Backup failed: {}", primary);
                let failures = self.unwind(&mut unwind);
                Err(primary.with_cleanup(failures))
            }
        };

        match &result {
            Ok(manifest) => info!(
                target: "snapfreeze::orchestrator",
                "Backup finished in {}: {} members, {} written",
                format_interval(start.elapsed()),
                manifest.members.len(),
                format_bytes(manifest.total_compressed_bytes())
            ),
            Err(e) if !e.cleanup_failures().is_empty() => error!(
                target: "snapfreeze::orchestrator",
                "{} cleanup step(s) failed; manual cleanup may be required",
                e.cleanup_failures().len()
            ),
            Err(_) => info!(target: "snapfreeze::orchestrator", "All resources released after failure"),
        }
        self.events.emit(&BackupEvent::RunFinished { success: result.is_ok() });
        result
    }

    fn forward(&mut self, request: &BackupRequest, unwind: &mut Vec<Cleanup>) -> Result<ArchiveManifest> {
        self.cancel.check()?;
        let plan = self.plan(request)?;
        self.events.emit(&BackupEvent::VolumeResolved {
            device: plan.volume.device_path.clone(),
            snapshot_size: plan.snapshot_size,
        });

        info!(
            target: "snapfreeze::orchestrator",
            "About {} to archive from {}",
            format_bytes(plan.estimated_bytes),
            request.source_path.display()
        );

        // a directory the caller handed us stays; only what we wrote goes
        if prepare_output_dir(&request.output_dir)? {
            unwind.push(Cleanup::DiscardOutput(request.output_dir.clone()));
        } else {
            unwind.push(Cleanup::ClearOutput(request.output_dir.clone()));
        }

        let freeze = request.lock_policy.freeze_for_snapshot;
        if request.lock_policy.pre_flush {
            self.lock.pre_flush();
        }
        self.cancel.check()?;

        let mut replication: Option<ReplicationInfo> = None;
        if freeze {
            unwind.push(Cleanup::ReleaseLock);
            replication = self.lock.freeze()?.replication;
            self.events.emit(&BackupEvent::FreezeStarted);
        }

        // frozen: metadata-speed steps only
        unwind.push(Cleanup::RemoveSnapshot);
        let snapshot = self
            .snapshots
            .create(&plan.volume, plan.snapshot_size, &plan.snapshot_name)
            .map(|handle| SnapshotSummary {
                name: handle.name.clone(),
                device_path: handle.device_path.clone(),
                size_bytes: handle.size_bytes,
                created_at: handle.created_at,
            })?;
        self.events.emit(&BackupEvent::SnapshotCreated { device: snapshot.device_path.clone() });
        self.snapshots.confirm()?;
        if freeze {
            self.complete(unwind, Cleanup::ReleaseLock)?;
        }

        self.cancel.check()?;
        self.ensure_thawed("mount")?;
        let mount_root = prepare_mount_root(request.mount_root.as_deref(), unwind)?;
        unwind.push(Cleanup::UnmountSnapshot);
        let mounted = self.snapshots.mount(&mount_root)?;
        self.events.emit(&BackupEvent::SnapshotMounted { path: mounted.clone() });

        self.cancel.check()?;
        self.snapshots.verify()?;
        self.ensure_thawed("archive")?;
        let source = canonical_or_self(&request.source_path);
        let archive_root = remap(&source, &plan.volume.mount_point, &mounted);
        info!(target: "snapfreeze::orchestrator", "Archiving {} from the snapshot", archive_root.display());
        let ctx = StreamContext {
            output_dir: &request.output_dir,
            cancel: &self.cancel,
            events: self.events.as_ref(),
        };
        let mut manifest = self.streamer.run(&archive_root, &request.archive_policy, &ctx)?;

        self.snapshots.verify()?;
        self.complete(unwind, Cleanup::UnmountSnapshot)?;
        self.complete(unwind, Cleanup::RemoveSnapshot)?;
        if let Some(root) = unwind.iter().find_map(|c| match c {
            Cleanup::RemoveMountRoot(root) => Some(root.clone()),
            _ => None,
        }) {
            self.complete(unwind, Cleanup::RemoveMountRoot(root))?;
        }
        // the output is the result now
        unwind.retain(|c| !matches!(c, Cleanup::DiscardOutput(_) | Cleanup::ClearOutput(_)));

        manifest.replication = replication;
        manifest.freeze_ms = self.lock.last_freeze_duration().map(|d| d.as_millis() as u64);
        manifest.snapshot = Some(snapshot);
        Ok(manifest)
    }

    fn ensure_thawed(&self, step: &str) -> Result<()> {
        if self.lock.state() == LockState::Frozen {
            return Err(BackupError::Lock {
                driver: self.lock.driver_name(),
                reason: format!("writes are still frozen before {}", step),
            });
        }
        Ok(())
    }

    /// Take `action` off the unwind stack and perform it now.
    fn complete(&mut self, unwind: &mut Vec<Cleanup>, action: Cleanup) -> Result<()> {
        let Some(pos) = unwind.iter().rposition(|c| discriminant(c) == discriminant(&action)) else {
            return Ok(());
        };
        let action = unwind.remove(pos);
        self.perform(action)
    }

    /// Run every registered cleanup in reverse, collecting failures.
    fn unwind(&mut self, unwind: &mut Vec<Cleanup>) -> Vec<BackupError> {
        let mut failures = Vec::new();
        while let Some(action) = unwind.pop() {
            if let Err(e) = self.perform(action.clone()) {
                warn!(target: "snapfreeze::orchestrator", "Cleanup step {:?} failed: {}", action, e);
                failures.push(e);
            }
        }
        failures
    }

    fn perform(&mut self, action: Cleanup) -> Result<()> {
        match action {
            Cleanup::ReleaseLock => {
                let held = self.lock.release()?;
                if let Some(held) = held {
                    self.events.emit(&BackupEvent::FreezeEnded { held_ms: held.as_millis() as u64 });
                }
                Ok(())
            }
            Cleanup::UnmountSnapshot => self.snapshots.unmount(),
            Cleanup::RemoveSnapshot => {
                let present = !matches!(self.snapshots.state(), SnapshotState::Absent | SnapshotState::Removed);
                self.snapshots.remove()?;
                if present {
                    if let Some(handle) = self.snapshots.handle() {
                        self.events.emit(&BackupEvent::SnapshotRemoved { device: handle.device_path.clone() });
                    }
                }
                Ok(())
            }
            Cleanup::DiscardOutput(dir) => {
                warn!(target: "snapfreeze::orchestrator", "Discarding partial output in {}", dir.display());
                remove_dir_if_exists(&dir).map_err(BackupError::from)
            }
            Cleanup::ClearOutput(dir) => {
                warn!(target: "snapfreeze::orchestrator", "Clearing partial output from {}", dir.display());
                clear_dir(&dir).map_err(BackupError::from)
            }
            Cleanup::RemoveMountRoot(dir) => match fs::remove_dir(&dir) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => Err(BackupError::from(e)),
                _ => Ok(()),
            },
        }
    }
}

/// Returns whether the directory was created by this call.
fn prepare_output_dir(dir: &Path) -> Result<bool> {
    let write_failed = |source| BackupError::ArchiveWriteFailed { path: dir.to_path_buf(), source };
    if dir.exists() {
        let mut entries = fs::read_dir(dir).map_err(write_failed)?;
        if entries.next().is_some() {
            return Err(BackupError::InvalidConfig(format!(
                "output directory '{}' is not empty",
                dir.display()
            )));
        }
        return Ok(false);
    }
    fs::create_dir_all(dir).map_err(write_failed)?;
    Ok(true)
}

/// The configured mount root, or a fresh one under the temp directory.
/// Directories created here are registered for removal.
fn prepare_mount_root(configured: Option<&Path>, unwind: &mut Vec<Cleanup>) -> Result<PathBuf> {
    if let Some(root) = configured {
        if !root.exists() {
            fs::create_dir_all(root)?;
            unwind.push(Cleanup::RemoveMountRoot(root.to_path_buf()));
        }
        return Ok(root.to_path_buf());
    }

    let base = std::env::temp_dir();
    loop {
        let seq = MOUNT_ROOT_SEQ.fetch_add(1, Ordering::Relaxed);
        let candidate = base.join(format!("snapfreeze-{}-{}", std::process::id(), seq));
        match fs::create_dir(&candidate) {
            Ok(()) => {
                unwind.push(Cleanup::RemoveMountRoot(candidate.clone()));
                return Ok(candidate);
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::TarStreamer;
    use crate::events::Recorder;
    use crate::lock::testing::ScriptedDriver;
    use crate::snapshot::testing::{FakeBackend, origin};

    struct FixedVolume(VolumeDescriptor);

    impl VolumeInspector for FixedVolume {
        fn resolve(&self, _path: &Path) -> Result<VolumeDescriptor> {
            Ok(self.0.clone())
        }
    }

    fn orchestrator(source: &Path) -> (Orchestrator, FakeBackend, Arc<Mutex<Vec<&'static str>>>) {
        let (driver, calls) = ScriptedDriver::new();
        let (orch, backend) = orchestrator_with(source, driver);
        (orch, backend, calls)
    }

    fn orchestrator_with(source: &Path, driver: ScriptedDriver) -> (Orchestrator, FakeBackend) {
        let mut volume = origin();
        volume.mount_point = canonical_or_self(source);
        let backend = FakeBackend::default();
        let orch = Orchestrator::new(
            Box::new(FixedVolume(volume)),
            LockCoordinator::new(Box::new(driver)),
            SnapshotManager::new(Box::new(backend.clone())),
            Box::new(TarStreamer),
        );
        (orch, backend)
    }

    #[test]
    fn test_default_snapshot_name() {
        let request = BackupRequest::new("/var/lib/mysql", "/backups/out");
        assert_eq!(request.snapshot_name(&origin()), "mysql_snapshot");
        let named = BackupRequest { snapshot_name_prefix: "nightly".into(), ..request };
        assert_eq!(named.snapshot_name(&origin()), "nightly");
    }

    #[test]
    fn test_plan_has_no_side_effects() {
        let source = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let (orch, backend, calls) = orchestrator(source.path());
        let mut request = BackupRequest::new(source.path(), work.path().join("out"));
        request.mount_root = Some(work.path().join("mnt"));

        let plan = orch.plan(&request).unwrap();
        assert_eq!(plan.snapshot_name, "mysql_snapshot");
        assert_eq!(plan.snapshot_size % (4 << 20), 0);
        assert_eq!(plan.mount_path, Some(work.path().join("mnt/mysql_snapshot")));
        assert_eq!(plan.archive_path, PathBuf::new());
        assert_eq!(plan.lock_driver, "scripted");

        assert!(!work.path().join("out").exists());
        assert!(!work.path().join("mnt").exists());
        assert!(backend.0.lock().calls.is_empty());
        assert!(calls.lock().is_empty());
    }

    #[test]
    fn test_plan_estimates_source_bytes() {
        let source = tempfile::tempdir().unwrap();
        fs::create_dir_all(source.path().join("shop")).unwrap();
        fs::create_dir_all(source.path().join("lost+found")).unwrap();
        fs::write(source.path().join("shop/orders.ibd"), vec![0u8; 4096]).unwrap();
        fs::write(source.path().join("ibdata1"), vec![0u8; 1000]).unwrap();
        fs::write(source.path().join("lost+found/#123"), vec![0u8; 500]).unwrap();
        let (orch, _, _) = orchestrator(source.path());

        let plan = orch.plan(&BackupRequest::new(source.path(), "/unused")).unwrap();
        assert_eq!(plan.estimated_bytes, 5096);

        let mut request = BackupRequest::new(source.path(), "/unused");
        request.archive_policy.exclude.push("ibdata1".into());
        assert_eq!(orch.plan(&request).unwrap().estimated_bytes, 4096);
    }

    #[test]
    fn test_plan_rejects_reserved_name() {
        let source = tempfile::tempdir().unwrap();
        let (orch, _, _) = orchestrator(source.path());
        let mut request = BackupRequest::new(source.path(), "/unused");
        request.snapshot_name_prefix = "snapshot-nightly".into();
        assert!(matches!(orch.plan(&request), Err(BackupError::InvalidConfig(_))));
    }

    #[test]
    fn test_source_guard_is_exclusive() {
        let source = tempfile::tempdir().unwrap();
        let guard = SourceGuard::acquire(source.path()).unwrap();
        assert!(matches!(SourceGuard::acquire(source.path()), Err(BackupError::Busy(_))));
        drop(guard);
        assert!(SourceGuard::acquire(source.path()).is_ok());
    }

    #[test]
    fn test_busy_source_is_rejected_without_side_effects() {
        let source = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let (mut orch, backend, calls) = orchestrator(source.path());
        let _held = SourceGuard::acquire(source.path()).unwrap();

        let err = orch.run(&BackupRequest::new(source.path(), work.path().join("out"))).unwrap_err();
        assert!(matches!(err, BackupError::Busy(_)));
        assert!(backend.0.lock().calls.is_empty());
        assert!(calls.lock().is_empty());
    }

    #[test]
    fn test_non_empty_output_dir_is_refused() {
        let source = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let out = work.path().join("out");
        fs::create_dir(&out).unwrap();
        fs::write(out.join("keep.me"), "x").unwrap();
        let (mut orch, backend, _) = orchestrator(source.path());

        let err = orch.run(&BackupRequest::new(source.path(), &out)).unwrap_err();
        assert!(matches!(err, BackupError::InvalidConfig(_)));
        assert!(out.join("keep.me").exists());
        assert!(backend.0.lock().calls.is_empty());
    }

    #[test]
    fn test_failed_run_keeps_an_existing_output_dir() {
        let source = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let out = work.path().join("out");
        fs::create_dir(&out).unwrap();
        let (mut orch, backend, _) = orchestrator(source.path());
        backend.0.lock().fail_mount = true;
        let mut request = BackupRequest::new(source.path(), &out);
        request.mount_root = Some(work.path().join("mnt"));

        assert!(orch.run(&request).is_err());
        assert!(out.is_dir());
        assert_eq!(fs::read_dir(&out).unwrap().count(), 0);
        assert_eq!(orch.snapshot_state(), SnapshotState::Removed);
    }

    #[test]
    fn test_failed_run_removes_an_output_dir_it_created() {
        let source = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let out = work.path().join("out");
        let (mut orch, backend, _) = orchestrator(source.path());
        backend.0.lock().fail_mount = true;
        let mut request = BackupRequest::new(source.path(), &out);
        request.mount_root = Some(work.path().join("mnt"));

        assert!(orch.run(&request).is_err());
        assert!(!out.exists());
    }

    #[test]
    fn test_failed_freeze_emits_no_freeze_events() {
        let source = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let (mut driver, _) = ScriptedDriver::new();
        driver.lock_results.push_back(Err(crate::lock::DriverError::Failed("Access denied".into())));
        let recorder = Arc::new(Recorder::new());
        let (orch, backend) = orchestrator_with(source.path(), driver);
        let mut orch = orch.with_events(recorder.clone());

        let err = orch.run(&BackupRequest::new(source.path(), work.path().join("out"))).unwrap_err();
        assert!(matches!(err.primary(), BackupError::Lock { .. }));
        assert!(backend.0.lock().calls.is_empty());
        let kinds: Vec<_> = recorder
            .events()
            .iter()
            .map(|e| serde_json::to_value(e).unwrap()["event"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(kinds, vec!["run-started", "volume-resolved", "run-finished"]);
    }

    #[test]
    fn test_events_in_order() {
        let source = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        // the fake backend mounts nothing, so the mounted tree is empty
        let recorder = Arc::new(Recorder::new());
        let (orch, _, calls) = orchestrator(source.path());
        let mut orch = orch.with_events(recorder.clone());
        let mut request = BackupRequest::new(source.path(), work.path().join("out"));
        request.mount_root = Some(work.path().join("mnt"));

        let manifest = orch.run(&request).unwrap();
        assert_eq!(manifest.members.len(), 1);
        assert_eq!(manifest.replication.as_ref().map(|r| r.log_position), Some(154));
        assert!(manifest.freeze_ms.is_some());
        assert_eq!(*calls.lock(), vec!["flush", "lock", "unlock"]);
        assert!(!work.path().join("mnt").exists());

        let kinds: Vec<_> = recorder
            .events()
            .iter()
            .map(|e| serde_json::to_value(e).unwrap()["event"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            kinds,
            vec![
                "run-started",
                "volume-resolved",
                "freeze-started",
                "snapshot-created",
                "freeze-ended",
                "snapshot-mounted",
                "unit-started",
                "unit-completed",
                "snapshot-removed",
                "run-finished",
            ]
        );
    }
}
