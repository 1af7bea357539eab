use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use super::{VolumeDescriptor, VolumeInspector};
use crate::error::{BackupError, Result};
use crate::utils::cmd::{CommandRunner, SystemRunner};
use crate::utils::fmt::format_bytes;
use crate::utils::lvm::{self, LvsError};
use crate::utils::mounts::{self, PROC_MOUNTS};

const LVS_TIMEOUT: Duration = Duration::from_secs(60);

/// Resolves paths to LVM2 logical volumes via the mount table and `lvs`.
pub struct LvmInspector<R = SystemRunner> {
    runner: R,
    mounts_path: PathBuf,
}

impl LvmInspector<SystemRunner> {
    pub fn new() -> Self {
        Self::with_runner(SystemRunner)
    }
}

impl Default for LvmInspector<SystemRunner> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: CommandRunner> LvmInspector<R> {
    pub fn with_runner(runner: R) -> Self {
        Self { runner, mounts_path: PathBuf::from(PROC_MOUNTS) }
    }

    /// Read the mount table from somewhere other than `/proc/mounts`.
    pub fn with_mount_table(mut self, path: impl Into<PathBuf>) -> Self {
        self.mounts_path = path.into();
        self
    }
}

impl<R: CommandRunner> VolumeInspector for LvmInspector<R> {
    fn resolve(&self, path: &Path) -> Result<VolumeDescriptor> {
        let unsupported = |reason: String| BackupError::NotOnSupportedVolume {
            path: path.to_path_buf(),
            reason,
        };

        let canonical = fs::canonicalize(path).map_err(|e| unsupported(e.to_string()))?;
        let mount_point = mounts::mount_point_of(&canonical).map_err(|e| unsupported(e.to_string()))?;
        let entries = mounts::read_mounts(&self.mounts_path)?;
        let entry = mounts::entry_for_mount_point(&entries, &mount_point)
            .ok_or_else(|| unsupported(format!("no mount table entry for '{}'", mount_point.display())))?;

        let lv = match lvm::lvs(&self.runner, &entry.device, Some(LVS_TIMEOUT)) {
            Ok(Some(lv)) => lv,
            Ok(None) => {
                return Err(unsupported(format!(
                    "'{}' is not an LVM logical volume",
                    entry.device.display()
                )));
            }
            Err(LvsError::Command(e)) => return Err(e.into()),
            Err(LvsError::Parse(msg)) => return Err(unsupported(msg)),
        };
        if lv.is_snapshot() {
            return Err(unsupported(format!("'{}' is itself a snapshot volume", lv.device().display())));
        }

        let descriptor = VolumeDescriptor {
            device_path: lv.device(),
            volume_group: lv.vg_name,
            logical_volume: lv.lv_name,
            total_extents: lv.vg_extent_count,
            free_extents: lv.vg_free_count,
            extent_size: lv.vg_extent_size,
            lv_size: lv.lv_size,
            mount_point,
            fs_type: entry.fs_type.clone(),
        };
        info!(
            target: "snapfreeze::volume",
            "Resolved '{}' to {} ({} free in volume group '{}')",
            path.display(),
            descriptor.device_path.display(),
            format_bytes(descriptor.free_bytes()),
            descriptor.volume_group
        );
        Ok(descriptor)
    }
}
