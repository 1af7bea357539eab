//! Resolving the volume behind a path and sizing its snapshot
//!
//! [`VolumeInspector`] turns a directory into a [`VolumeDescriptor`]; the
//! descriptor is a read-only fact about the host and is re-resolved at the
//! start of every run. [`compute_size`] applies a [`SizePolicy`] to it.

use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{BackupError, Result};
use crate::utils::fmt::{format_bytes, parse_bytes};

pub mod lvm;

pub use lvm::LvmInspector;

/// Default share of the volume group's free space given to a snapshot.
pub const DEFAULT_PERCENT_OF_FREE: f64 = 0.20;

/// Logical volume backing a directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeDescriptor {
    /// `/dev/<vg>/<lv>`
    pub device_path: PathBuf,
    pub volume_group: String,
    pub logical_volume: String,
    pub total_extents: u64,
    pub free_extents: u64,
    /// Extent size in bytes
    pub extent_size: u64,
    /// Size of the logical volume in bytes
    pub lv_size: u64,
    /// Where the volume's filesystem is mounted
    pub mount_point: PathBuf,
    pub fs_type: String,
}

impl VolumeDescriptor {
    pub fn free_bytes(&self) -> u64 {
        self.free_extents.saturating_mul(self.extent_size)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_extents.saturating_mul(self.extent_size)
    }

    fn extents_ceil(&self, bytes: u64) -> u64 {
        bytes.div_ceil(self.extent_size)
    }
}

pub trait VolumeInspector: Send {
    /// Resolve the snapshot-capable volume behind `path`.
    ///
    /// Fails with [`BackupError::NotOnSupportedVolume`] when the backing
    /// store cannot be snapshotted.
    fn resolve(&self, path: &Path) -> Result<VolumeDescriptor>;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SizePolicy {
    /// Exact size in bytes, rounded up to whole extents
    Explicit(u64),
    /// Fraction of the free extents in `(0, 1]`
    PercentOfFree(f64),
}

impl Default for SizePolicy {
    fn default() -> Self {
        SizePolicy::PercentOfFree(DEFAULT_PERCENT_OF_FREE)
    }
}

impl SizePolicy {
    /// Parse a `snapshot-size` option.
    ///
    /// Empty selects the default; `N%FREE` or `N%` is a share of free space;
    /// anything else is a size, where a bare integer counts megabytes.
    pub fn parse(value: &str) -> Result<SizePolicy> {
        let value = value.trim();
        if value.is_empty() {
            return Ok(SizePolicy::default());
        }

        let upper = value.to_ascii_uppercase();
        if let Some(percent) = upper.strip_suffix("%FREE").or_else(|| upper.strip_suffix('%')) {
            let percent: f64 = percent
                .trim()
                .parse()
                .map_err(|_| BackupError::InvalidConfig(format!("snapshot-size '{}' is not a valid percentage", value)))?;
            if !(percent > 0.0 && percent <= 100.0) {
                return Err(BackupError::InvalidConfig(format!(
                    "snapshot-size '{}' must be between 0% and 100% of free space",
                    value
                )));
            }
            return Ok(SizePolicy::PercentOfFree(percent / 100.0));
        }

        let bytes = if value.chars().all(|c| c.is_ascii_digit()) {
            parse_bytes(&format!("{}M", value))
        } else {
            parse_bytes(value)
        }
        .map_err(|e| BackupError::InvalidConfig(format!("snapshot-size: {}", e)))?;
        Ok(SizePolicy::Explicit(bytes))
    }
}

/// Policy constants bounding a snapshot's size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SizeLimits {
    /// Floor applied to percentage-based sizes
    pub min_snapshot_size: u64,
    /// Share of free space an explicit size must leave untouched, in percent
    pub reserve_percent: f64,
}

impl Default for SizeLimits {
    fn default() -> Self {
        Self {
            min_snapshot_size: 256 << 20,
            reserve_percent: 5.0,
        }
    }
}

/// Snapshot size in bytes for `descriptor` under `policy`, always a whole
/// number of extents.
pub fn compute_size(descriptor: &VolumeDescriptor, policy: &SizePolicy, limits: &SizeLimits) -> Result<u64> {
    if descriptor.extent_size == 0 {
        return Err(BackupError::NotOnSupportedVolume {
            path: descriptor.device_path.clone(),
            reason: "volume group reports a zero extent size".into(),
        });
    }

    let extents = match *policy {
        SizePolicy::PercentOfFree(fraction) => {
            let share = (descriptor.free_extents as f64 * fraction).floor() as u64;
            let floor = descriptor.extents_ceil(limits.min_snapshot_size);
            let extents = share.max(floor);
            if extents == 0 || extents > descriptor.free_extents {
                return Err(BackupError::InsufficientSpace {
                    requested: extents.max(1).saturating_mul(descriptor.extent_size),
                    available: descriptor.free_bytes(),
                });
            }
            info!(
                target: "snapfreeze::volume",
                "Auto-sizing snapshot to {:.0}% of free space: {} ({} extents)",
                fraction * 100.0,
                format_bytes(extents * descriptor.extent_size),
                extents
            );
            extents
        }
        SizePolicy::Explicit(bytes) => {
            let extents = descriptor.extents_ceil(bytes);
            if extents == 0 {
                return Err(BackupError::InvalidConfig("snapshot-size must be at least one extent".into()));
            }
            let free = descriptor.free_bytes();
            let reserve = (free as f64 * limits.reserve_percent / 100.0).ceil() as u64;
            let usable = free.saturating_sub(reserve);
            let requested = extents.saturating_mul(descriptor.extent_size);
            if requested > usable {
                return Err(BackupError::InsufficientSpace { requested, available: usable });
            }
            info!(
                target: "snapfreeze::volume",
                "Using requested snapshot size {} rounded to extent size {}: {}",
                format_bytes(bytes),
                format_bytes(descriptor.extent_size),
                format_bytes(requested)
            );
            extents
        }
    };

    Ok(extents * descriptor.extent_size)
}
