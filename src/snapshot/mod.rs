//! Copy-on-write snapshot lifecycle
//!
//! [`SnapshotManager`] owns exactly one [`SnapshotHandle`] and moves it
//! through `absent -> created -> mounted -> unmounted -> removed`. Any
//! failing transition lands the handle in `failed`, from which only
//! removal of whatever is still present is attempted. `unmount()` and
//! `remove()` are idempotent so cleanup paths can call them freely.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::error::{BackupError, Result};
use crate::utils::fmt::{format_bytes, format_interval};
use crate::volume::VolumeDescriptor;

pub mod lvm;

pub use lvm::LvmSnapshots;

const RESERVED_NAMES: [&str; 2] = [".", ".."];
const RESERVED_PREFIXES: [&str; 2] = ["snapshot", "pvmove"];
const RESERVED_SUBSTRINGS: [&str; 4] = ["_mlog", "_mimage", "_rimage", "_tdata"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SnapshotState {
    Absent,
    Created,
    Mounted,
    Unmounted,
    Removed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotHandle {
    pub name: String,
    pub device_path: PathBuf,
    pub size_bytes: u64,
    pub created_at: DateTime<Local>,
    pub state: SnapshotState,
    /// Set while mounted, and kept after a failure so cleanup knows where to look
    pub mount_path: Option<PathBuf>,
    pub fs_type: String,
}

/// Host operations behind a snapshot.
pub trait SnapshotBackend: Send {
    /// Device path a snapshot called `name` of `origin` will have.
    fn device_for(&self, origin: &VolumeDescriptor, name: &str) -> PathBuf;

    fn create(&self, origin: &VolumeDescriptor, name: &str, extents: u64) -> Result<PathBuf>;

    fn exists(&self, device: &Path) -> Result<bool>;

    /// Mount `device` read-only at `at`.
    fn mount(&self, device: &Path, at: &Path, fs_type: &str) -> Result<()>;

    fn unmount(&self, device: &Path, at: &Path) -> Result<()>;

    fn is_mounted(&self, device: &Path, at: &Path) -> Result<bool>;

    fn remove(&self, device: &Path) -> Result<()>;

    /// Copy-on-write space in use, in percent.
    fn usage(&self, _device: &Path) -> Option<f64> {
        None
    }
}

/// Check a snapshot name against the LVM naming rules.
pub fn validate_name(name: &str) -> Result<()> {
    let invalid = |msg: String| Err(BackupError::InvalidConfig(msg));

    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || "+_.-".contains(c)) {
        return invalid(format!(
            "invalid snapshot-name '{}': only a-z A-Z 0-9 + _ . - are allowed",
            name
        ));
    }
    if name.starts_with('-') {
        return invalid(format!("invalid snapshot-name '{}': must not start with '-'", name));
    }
    if RESERVED_NAMES.contains(&name) {
        return invalid(format!("snapshot-name '{}' is reserved", name));
    }
    if let Some(prefix) = RESERVED_PREFIXES.iter().find(|p| name.starts_with(*p)) {
        return invalid(format!("snapshot names starting with '{}' are reserved by LVM", prefix));
    }
    if let Some(part) = RESERVED_SUBSTRINGS.iter().find(|s| name.contains(*s)) {
        return invalid(format!("snapshot names containing '{}' are reserved by LVM", part));
    }
    Ok(())
}

pub struct SnapshotManager {
    backend: Box<dyn SnapshotBackend>,
    handle: Option<SnapshotHandle>,
    /// Mount directory this manager created and must remove again
    created_dir: Option<PathBuf>,
}

impl SnapshotManager {
    pub fn new(backend: Box<dyn SnapshotBackend>) -> Self {
        Self { backend, handle: None, created_dir: None }
    }

    pub fn state(&self) -> SnapshotState {
        self.handle.as_ref().map_or(SnapshotState::Absent, |h| h.state)
    }

    pub fn handle(&self) -> Option<&SnapshotHandle> {
        self.handle.as_ref()
    }

    fn set_state(&mut self, state: SnapshotState) {
        if let Some(handle) = self.handle.as_mut() {
            handle.state = state;
        }
    }

    /// Create a snapshot of `origin`. Called while writes are frozen.
    pub fn create(&mut self, origin: &VolumeDescriptor, size_bytes: u64, name: &str) -> Result<&SnapshotHandle> {
        match self.state() {
            SnapshotState::Absent | SnapshotState::Removed => {}
            other => {
                return Err(BackupError::SnapshotState(format!(
                    "cannot create '{}' while the current snapshot is {:?}",
                    name, other
                )));
            }
        }
        validate_name(name)?;
        if origin.extent_size == 0 {
            return Err(BackupError::SnapshotCreateFailed {
                name: name.to_string(),
                reason: "origin reports a zero extent size".into(),
            });
        }
        let extents = size_bytes.div_ceil(origin.extent_size);
        let device = self.backend.device_for(origin, name);

        // a volume that predates this call is never ours to clean up
        if self.backend.exists(&device)? {
            self.handle = None;
            return Err(BackupError::SnapshotCreateFailed {
                name: name.to_string(),
                reason: format!("'{}' already exists", device.display()),
            });
        }

        let mut handle = SnapshotHandle {
            name: name.to_string(),
            device_path: device,
            size_bytes: extents * origin.extent_size,
            created_at: Local::now(),
            state: SnapshotState::Absent,
            mount_path: None,
            fs_type: origin.fs_type.clone(),
        };
        self.created_dir = None;

        match self.backend.create(origin, name, extents) {
            Ok(device) => {
                handle.device_path = device;
                handle.state = SnapshotState::Created;
                info!(
                    target: "snapfreeze::snapshot",
                    "Created snapshot {} ({})",
                    handle.device_path.display(),
                    format_bytes(handle.size_bytes)
                );
                Ok(self.handle.insert(handle))
            }
            Err(e) => {
                // lvcreate may fail after allocating the volume
                handle.state = SnapshotState::Failed;
                self.handle = Some(handle);
                Err(e)
            }
        }
    }

    /// Check the snapshot exists and stands on its own. Metadata-speed only.
    pub fn confirm(&mut self) -> Result<()> {
        let handle = self.expect_state(SnapshotState::Created, "confirm")?;
        let device = handle.device_path.clone();
        match self.backend.exists(&device) {
            Ok(true) => Ok(()),
            Ok(false) => {
                self.set_state(SnapshotState::Failed);
                Err(BackupError::SnapshotState(format!(
                    "snapshot '{}' vanished right after creation",
                    device.display()
                )))
            }
            Err(e) => {
                self.set_state(SnapshotState::Failed);
                Err(e)
            }
        }
    }

    /// Mount read-only at `mount_root/<name>` and return the mounted path.
    pub fn mount(&mut self, mount_root: &Path) -> Result<PathBuf> {
        let handle = self.expect_state(SnapshotState::Created, "mount")?;
        let device = handle.device_path.clone();
        let fs_type = handle.fs_type.clone();
        let at = mount_root.join(&handle.name);

        if !at.exists() {
            fs::create_dir_all(&at).map_err(|e| BackupError::MountFailed {
                device: device.clone(),
                mountpoint: at.clone(),
                reason: format!("cannot create mount directory: {}", e),
            })?;
            self.created_dir = Some(at.clone());
        }
        if let Some(handle) = self.handle.as_mut() {
            handle.mount_path = Some(at.clone());
        }

        if let Err(e) = self.backend.mount(&device, &at, &fs_type) {
            self.set_state(SnapshotState::Failed);
            self.remove_created_dir();
            return Err(e);
        }
        match self.backend.is_mounted(&device, &at) {
            Ok(true) => {}
            Ok(false) => {
                self.set_state(SnapshotState::Failed);
                return Err(BackupError::SnapshotState(format!(
                    "'{}' reported mounted but has no mount table entry at '{}'",
                    device.display(),
                    at.display()
                )));
            }
            Err(e) => {
                self.set_state(SnapshotState::Failed);
                return Err(e);
            }
        }

        self.set_state(SnapshotState::Mounted);
        info!(target: "snapfreeze::snapshot", "Mounted {} read-only at {}", device.display(), at.display());
        Ok(at)
    }

    /// Confirm the recorded state agrees with the host mount table.
    pub fn verify(&self) -> Result<()> {
        let Some(handle) = self.handle.as_ref() else {
            return Ok(());
        };
        let expect_mounted = match handle.state {
            SnapshotState::Mounted => true,
            SnapshotState::Created | SnapshotState::Unmounted => false,
            _ => return Ok(()),
        };
        let at = match (&handle.mount_path, expect_mounted) {
            (Some(at), _) => at,
            (None, false) => return Ok(()),
            (None, true) => {
                return Err(BackupError::SnapshotState(format!(
                    "'{}' is recorded as mounted without a mount path",
                    handle.device_path.display()
                )));
            }
        };
        let mounted = self.backend.is_mounted(&handle.device_path, at)?;
        if mounted != expect_mounted {
            return Err(BackupError::SnapshotState(format!(
                "'{}' is recorded as {:?} but the mount table says it is {}mounted at '{}'",
                handle.device_path.display(),
                handle.state,
                if mounted { "" } else { "not " },
                at.display()
            )));
        }
        Ok(())
    }

    /// Unmount the snapshot. A no-op unless it is mounted.
    pub fn unmount(&mut self) -> Result<()> {
        let Some(handle) = self.handle.as_ref() else {
            return Ok(());
        };
        if handle.state != SnapshotState::Mounted {
            return Ok(());
        }
        let device = handle.device_path.clone();
        let Some(at) = handle.mount_path.clone() else {
            self.set_state(SnapshotState::Failed);
            return Err(BackupError::SnapshotState(format!(
                "'{}' is recorded as mounted without a mount path",
                device.display()
            )));
        };

        if let Err(e) = self.backend.unmount(&device, &at) {
            self.set_state(SnapshotState::Failed);
            return Err(e);
        }
        self.set_state(SnapshotState::Unmounted);
        info!(target: "snapfreeze::snapshot", "Unmounted {}", at.display());
        self.remove_created_dir();
        Ok(())
    }

    /// Remove the snapshot, unmounting first if needed. A no-op once removed.
    pub fn remove(&mut self) -> Result<()> {
        let Some(handle) = self.handle.as_ref() else {
            return Ok(());
        };
        match handle.state {
            SnapshotState::Absent | SnapshotState::Removed => Ok(()),
            SnapshotState::Mounted => {
                self.unmount()?;
                self.remove_present()
            }
            SnapshotState::Created | SnapshotState::Unmounted => self.remove_present(),
            SnapshotState::Failed => self.remove_failed(),
        }
    }

    fn remove_present(&mut self) -> Result<()> {
        let Some(handle) = self.handle.as_ref() else {
            return Ok(());
        };
        let device = handle.device_path.clone();
        let lifetime = Local::now().signed_duration_since(handle.created_at);
        if let Some(usage) = self.backend.usage(&device) {
            info!(target: "snapfreeze::snapshot", "Final snapshot usage for {}: {:.2}%", device.display(), usage);
        }
        if let Err(e) = self.backend.remove(&device) {
            self.set_state(SnapshotState::Failed);
            return Err(e);
        }
        self.set_state(SnapshotState::Removed);
        info!(
            target: "snapfreeze::snapshot",
            "Removed snapshot {} after {}",
            device.display(),
            format_interval(lifetime.to_std().unwrap_or_default())
        );
        Ok(())
    }

    /// Remove whatever of a failed snapshot is still on the host.
    fn remove_failed(&mut self) -> Result<()> {
        let Some(handle) = self.handle.as_ref() else {
            return Ok(());
        };
        let device = handle.device_path.clone();
        if let Some(at) = handle.mount_path.clone() {
            if self.backend.is_mounted(&device, &at)? {
                warn!(target: "snapfreeze::snapshot", "Unmounting failed snapshot from {}", at.display());
                self.backend.unmount(&device, &at)?;
            }
            self.remove_created_dir();
        }
        if self.backend.exists(&device)? {
            warn!(target: "snapfreeze::snapshot", "Removing failed snapshot {}", device.display());
            self.backend.remove(&device)?;
        }
        self.set_state(SnapshotState::Removed);
        Ok(())
    }

    fn expect_state(&self, wanted: SnapshotState, action: &str) -> Result<&SnapshotHandle> {
        match self.handle.as_ref() {
            Some(handle) if handle.state == wanted => Ok(handle),
            Some(handle) => Err(BackupError::SnapshotState(format!(
                "cannot {} snapshot '{}' in state {:?}",
                action, handle.name, handle.state
            ))),
            None => Err(BackupError::SnapshotState(format!("cannot {} before a snapshot exists", action))),
        }
    }

    fn remove_created_dir(&mut self) {
        if let Some(dir) = self.created_dir.take() {
            match fs::remove_dir(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(target: "snapfreeze::snapshot", "Could not remove {}: {}", dir.display(), e),
            }
        }
    }
}

impl Drop for SnapshotManager {
    fn drop(&mut self) {
        match self.state() {
            SnapshotState::Absent | SnapshotState::Removed => {}
            state => {
                warn!(target: "snapfreeze::snapshot", "Snapshot manager dropped with snapshot {:?}; removing", state);
                if let Err(e) = self.remove() {
                    error!(target: "snapfreeze::snapshot", "{}", e);
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};
    use std::sync::Arc;

    #[derive(Default)]
    pub struct FakeHost {
        pub devices: HashSet<PathBuf>,
        /// mount point -> device
        pub mounts: HashMap<PathBuf, PathBuf>,
        pub calls: Vec<String>,
        pub fail_create: bool,
        /// Allocate the device, then report failure
        pub fail_create_after_alloc: bool,
        pub fail_mount: bool,
        pub fail_unmount: bool,
        pub fail_remove: bool,
    }

    #[derive(Clone, Default)]
    pub struct FakeBackend(pub Arc<Mutex<FakeHost>>);

    impl SnapshotBackend for FakeBackend {
        fn device_for(&self, origin: &VolumeDescriptor, name: &str) -> PathBuf {
            PathBuf::from("/dev").join(&origin.volume_group).join(name)
        }

        fn create(&self, origin: &VolumeDescriptor, name: &str, extents: u64) -> Result<PathBuf> {
            let mut host = self.0.lock();
            host.calls.push(format!("create {} {}", name, extents));
            let device = self.device_for(origin, name);
            if host.fail_create_after_alloc {
                host.devices.insert(device);
                return Err(BackupError::SnapshotCreateFailed { name: name.into(), reason: "device busy".into() });
            }
            if host.fail_create || host.devices.contains(&device) {
                return Err(BackupError::SnapshotCreateFailed { name: name.into(), reason: "already exists".into() });
            }
            host.devices.insert(device.clone());
            Ok(device)
        }

        fn exists(&self, device: &Path) -> Result<bool> {
            Ok(self.0.lock().devices.contains(device))
        }

        fn mount(&self, device: &Path, at: &Path, _fs_type: &str) -> Result<()> {
            let mut host = self.0.lock();
            host.calls.push("mount".into());
            if host.fail_mount {
                return Err(BackupError::MountFailed {
                    device: device.into(),
                    mountpoint: at.into(),
                    reason: "wrong fs type".into(),
                });
            }
            host.mounts.insert(at.to_path_buf(), device.to_path_buf());
            Ok(())
        }

        fn unmount(&self, device: &Path, at: &Path) -> Result<()> {
            let mut host = self.0.lock();
            host.calls.push("unmount".into());
            if host.fail_unmount {
                return Err(BackupError::UnmountFailed { device: device.into(), reason: "target is busy".into() });
            }
            host.mounts.remove(at);
            Ok(())
        }

        fn is_mounted(&self, device: &Path, at: &Path) -> Result<bool> {
            Ok(self.0.lock().mounts.get(at).is_some_and(|d| d == device))
        }

        fn remove(&self, device: &Path) -> Result<()> {
            let mut host = self.0.lock();
            host.calls.push("remove".into());
            if host.fail_remove {
                return Err(BackupError::RemoveFailed { device: device.into(), reason: "in use".into() });
            }
            host.devices.remove(device);
            Ok(())
        }
    }

    pub fn origin() -> VolumeDescriptor {
        VolumeDescriptor {
            device_path: PathBuf::from("/dev/vg0/mysql"),
            volume_group: "vg0".into(),
            logical_volume: "mysql".into(),
            total_extents: 25600,
            free_extents: 12800,
            extent_size: 4 << 20,
            lv_size: 50 << 30,
            mount_point: PathBuf::from("/var/lib/mysql"),
            fs_type: "ext4".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{origin, FakeBackend};
    use super::*;

    fn manager() -> (SnapshotManager, FakeBackend) {
        let backend = FakeBackend::default();
        (SnapshotManager::new(Box::new(backend.clone())), backend)
    }

    #[test]
    fn test_full_lifecycle() {
        let root = tempfile::tempdir().unwrap();
        let (mut snaps, backend) = manager();

        let handle = snaps.create(&origin(), 1 << 30, "mysql_snapshot").unwrap();
        assert_eq!(handle.state, SnapshotState::Created);
        assert_eq!(handle.device_path, PathBuf::from("/dev/vg0/mysql_snapshot"));
        assert_eq!(handle.size_bytes, 1 << 30);
        snaps.confirm().unwrap();

        let at = snaps.mount(root.path()).unwrap();
        assert_eq!(at, root.path().join("mysql_snapshot"));
        assert_eq!(snaps.state(), SnapshotState::Mounted);
        snaps.verify().unwrap();

        snaps.unmount().unwrap();
        assert_eq!(snaps.state(), SnapshotState::Unmounted);
        assert!(!at.exists());
        snaps.verify().unwrap();

        snaps.remove().unwrap();
        assert_eq!(snaps.state(), SnapshotState::Removed);
        let host = backend.0.lock();
        assert!(host.devices.is_empty());
        assert!(host.mounts.is_empty());
    }

    #[test]
    fn test_unmount_and_remove_are_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let (mut snaps, backend) = manager();
        snaps.create(&origin(), 1 << 30, "snapshot1").unwrap_err();
        // reserved prefix; nothing was created
        assert_eq!(snaps.state(), SnapshotState::Absent);

        snaps.create(&origin(), 1 << 30, "data_snap").unwrap();
        snaps.mount(root.path()).unwrap();
        snaps.unmount().unwrap();
        snaps.unmount().unwrap();
        assert_eq!(snaps.state(), SnapshotState::Unmounted);
        snaps.remove().unwrap();
        snaps.remove().unwrap();
        assert_eq!(snaps.state(), SnapshotState::Removed);

        let host = backend.0.lock();
        assert_eq!(host.calls.iter().filter(|c| *c == "unmount").count(), 1);
        assert_eq!(host.calls.iter().filter(|c| *c == "remove").count(), 1);
    }

    #[test]
    fn test_remove_while_mounted_unmounts_first() {
        let root = tempfile::tempdir().unwrap();
        let (mut snaps, backend) = manager();
        snaps.create(&origin(), 1 << 30, "data_snap").unwrap();
        snaps.mount(root.path()).unwrap();
        snaps.remove().unwrap();
        assert_eq!(snaps.state(), SnapshotState::Removed);
        assert_eq!(backend.0.lock().calls, vec!["create data_snap 256", "mount", "unmount", "remove"]);
    }

    #[test]
    fn test_mount_failure_then_remove() {
        let root = tempfile::tempdir().unwrap();
        let (mut snaps, backend) = manager();
        backend.0.lock().fail_mount = true;
        snaps.create(&origin(), 1 << 30, "data_snap").unwrap();
        let err = snaps.mount(root.path()).unwrap_err();
        assert!(matches!(err, BackupError::MountFailed { .. }));
        assert_eq!(snaps.state(), SnapshotState::Failed);
        assert!(!root.path().join("data_snap").exists());

        snaps.remove().unwrap();
        assert_eq!(snaps.state(), SnapshotState::Removed);
        assert!(backend.0.lock().devices.is_empty());
    }

    #[test]
    fn test_create_failure_cleans_up_allocated_volume() {
        let (mut snaps, backend) = manager();
        backend.0.lock().fail_create_after_alloc = true;
        let err = snaps.create(&origin(), 1 << 30, "data_snap").unwrap_err();
        assert!(matches!(err, BackupError::SnapshotCreateFailed { .. }));
        assert_eq!(snaps.state(), SnapshotState::Failed);
        snaps.remove().unwrap();
        assert_eq!(snaps.state(), SnapshotState::Removed);
        assert!(backend.0.lock().devices.is_empty());
    }

    #[test]
    fn test_existing_volume_with_the_same_name_is_left_alone() {
        let (mut snaps, backend) = manager();
        let foreign = PathBuf::from("/dev/vg0/home");
        backend.0.lock().devices.insert(foreign.clone());

        let err = snaps.create(&origin(), 1 << 30, "home").unwrap_err();
        assert!(matches!(err, BackupError::SnapshotCreateFailed { .. }));
        assert_eq!(snaps.state(), SnapshotState::Absent);

        snaps.remove().unwrap();
        drop(snaps);
        let host = backend.0.lock();
        assert!(host.devices.contains(&foreign));
        assert!(host.calls.is_empty());
    }

    #[test]
    fn test_mount_requires_created_state() {
        let root = tempfile::tempdir().unwrap();
        let (mut snaps, _) = manager();
        assert!(matches!(snaps.mount(root.path()), Err(BackupError::SnapshotState(_))));
    }

    #[test]
    fn test_verify_detects_vanished_mount() {
        let root = tempfile::tempdir().unwrap();
        let (mut snaps, backend) = manager();
        snaps.create(&origin(), 1 << 30, "data_snap").unwrap();
        let at = snaps.mount(root.path()).unwrap();
        backend.0.lock().mounts.remove(&at);
        assert!(matches!(snaps.verify(), Err(BackupError::SnapshotState(_))));
    }

    #[test]
    fn test_failed_remove_is_reported_and_retried() {
        let (mut snaps, backend) = manager();
        snaps.create(&origin(), 1 << 30, "data_snap").unwrap();
        backend.0.lock().fail_remove = true;
        assert!(matches!(snaps.remove(), Err(BackupError::RemoveFailed { .. })));
        assert_eq!(snaps.state(), SnapshotState::Failed);

        backend.0.lock().fail_remove = false;
        snaps.remove().unwrap();
        assert_eq!(snaps.state(), SnapshotState::Removed);
    }

    #[test]
    fn test_drop_removes_leftover_snapshot() {
        let root = tempfile::tempdir().unwrap();
        let backend = FakeBackend::default();
        {
            let mut snaps = SnapshotManager::new(Box::new(backend.clone()));
            snaps.create(&origin(), 1 << 30, "data_snap").unwrap();
            snaps.mount(root.path()).unwrap();
        }
        let host = backend.0.lock();
        assert!(host.devices.is_empty());
        assert!(host.mounts.is_empty());
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("mysql_snapshot").is_ok());
        assert!(validate_name("db-01.snap+x").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name("snapshot_of_db").is_err());
        assert!(validate_name("pvmove0").is_err());
        assert!(validate_name("db_rimage_1").is_err());
        assert!(validate_name("-flag").is_err());
    }
}
