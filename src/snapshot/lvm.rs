use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use super::SnapshotBackend;
use crate::error::{BackupError, Result};
use crate::utils::cmd::{CommandRunner, SystemRunner};
use crate::utils::lvm::{self, LvsError};
use crate::utils::mounts::{self, PROC_MOUNTS};
use crate::volume::VolumeDescriptor;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_MOUNT_TIMEOUT: Duration = Duration::from_secs(60);
/// Stacked mounts of the same device need one umount each
const MAX_UNMOUNT_ROUNDS: usize = 5;

/// LVM2 snapshots driven through `lvcreate`, `mount`, `umount` and `lvremove`.
pub struct LvmSnapshots<R = SystemRunner> {
    runner: R,
    extra_mount_options: Vec<String>,
    create_options: Vec<String>,
    mount_timeout: Duration,
    mounts_path: PathBuf,
}

impl LvmSnapshots<SystemRunner> {
    pub fn new() -> Self {
        Self::with_runner(SystemRunner)
    }
}

impl Default for LvmSnapshots<SystemRunner> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: CommandRunner> LvmSnapshots<R> {
    pub fn with_runner(runner: R) -> Self {
        Self {
            runner,
            extra_mount_options: Vec::new(),
            create_options: Vec::new(),
            mount_timeout: DEFAULT_MOUNT_TIMEOUT,
            mounts_path: PathBuf::from(PROC_MOUNTS),
        }
    }

    pub fn with_mount_options(mut self, options: Vec<String>) -> Self {
        self.extra_mount_options = options;
        self
    }

    /// Extra arguments for `lvcreate`, e.g. `--addtag`.
    pub fn with_create_options(mut self, options: Vec<String>) -> Self {
        self.create_options = options;
        self
    }

    pub fn with_mount_timeout(mut self, timeout: Duration) -> Self {
        self.mount_timeout = timeout;
        self
    }

    pub fn with_mount_table(mut self, path: impl Into<PathBuf>) -> Self {
        self.mounts_path = path.into();
        self
    }

    /// Always read-only; xfs refuses a duplicate filesystem UUID without `nouuid`.
    fn mount_options(&self, fs_type: &str) -> Vec<String> {
        let mut options = vec!["ro".to_string()];
        if fs_type == "xfs" {
            options.push("nouuid".to_string());
        }
        for opt in &self.extra_mount_options {
            let opt = opt.trim();
            // never let configuration turn the mount writable
            if opt.is_empty() || opt == "rw" || options.iter().any(|o| o == opt) {
                continue;
            }
            options.push(opt.to_string());
        }
        options
    }
}

impl<R: CommandRunner> SnapshotBackend for LvmSnapshots<R> {
    fn device_for(&self, origin: &VolumeDescriptor, name: &str) -> PathBuf {
        PathBuf::from("/dev").join(&origin.volume_group).join(name)
    }

    fn create(&self, origin: &VolumeDescriptor, name: &str, extents: u64) -> Result<PathBuf> {
        let args = lvm::lvcreate_snapshot_argv(&origin.device_path, name, extents, &self.create_options);
        self.runner
            .run(&args, Some(COMMAND_TIMEOUT))
            .map_err(|e| BackupError::SnapshotCreateFailed {
                name: name.to_string(),
                reason: e.reason(),
            })?;
        Ok(self.device_for(origin, name))
    }

    fn exists(&self, device: &Path) -> Result<bool> {
        match lvm::lvs(&self.runner, device, Some(COMMAND_TIMEOUT)) {
            Ok(found) => Ok(found.is_some()),
            Err(LvsError::Command(e)) => Err(e.into()),
            Err(LvsError::Parse(msg)) => Err(BackupError::SnapshotState(msg)),
        }
    }

    fn mount(&self, device: &Path, at: &Path, fs_type: &str) -> Result<()> {
        let args = lvm::mount_argv(device, at, &self.mount_options(fs_type));
        self.runner
            .run(&args, Some(self.mount_timeout))
            .map_err(|e| BackupError::MountFailed {
                device: device.to_path_buf(),
                mountpoint: at.to_path_buf(),
                reason: e.reason(),
            })?;
        Ok(())
    }

    fn unmount(&self, device: &Path, at: &Path) -> Result<()> {
        for round in 0..MAX_UNMOUNT_ROUNDS {
            if !self.is_mounted(device, at)? {
                return Ok(());
            }
            if round > 0 {
                debug!(target: "snapfreeze::snapshot", "{} still mounted, unmounting again", at.display());
            }
            self.runner
                .run(&lvm::umount_argv(at), Some(self.mount_timeout))
                .map_err(|e| BackupError::UnmountFailed {
                    device: device.to_path_buf(),
                    reason: e.reason(),
                })?;
        }
        if self.is_mounted(device, at)? {
            warn!(target: "snapfreeze::snapshot", "{} is still mounted after {} rounds", at.display(), MAX_UNMOUNT_ROUNDS);
            return Err(BackupError::UnmountFailed {
                device: device.to_path_buf(),
                reason: format!("still mounted at '{}'", at.display()),
            });
        }
        Ok(())
    }

    fn is_mounted(&self, device: &Path, at: &Path) -> Result<bool> {
        let entries = mounts::read_mounts(&self.mounts_path)?;
        let at = mounts::canonical_or_self(at);
        Ok(mounts::mount_points_of_device(&entries, device)
            .iter()
            .any(|p| mounts::canonical_or_self(p) == at))
    }

    fn remove(&self, device: &Path) -> Result<()> {
        self.runner
            .run(&lvm::lvremove_argv(device), Some(COMMAND_TIMEOUT))
            .map_err(|e| BackupError::RemoveFailed {
                device: device.to_path_buf(),
                reason: e.reason(),
            })?;
        Ok(())
    }

    fn usage(&self, device: &Path) -> Option<f64> {
        lvm::snapshot_usage(&self.runner, device, Some(COMMAND_TIMEOUT))
    }
}
