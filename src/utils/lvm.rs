//! Thin wrappers over the LVM2 command line tools.

use std::path::{Path, PathBuf};
use std::time::Duration;

use super::cmd::{argv, CommandError, CommandRunner};

/// Columns always requested from `lvs`, in output order.
pub const LVS_COLUMNS: [&str; 7] = [
    "vg_name",
    "lv_name",
    "lv_attr",
    "lv_size",
    "vg_free_count",
    "vg_extent_size",
    "vg_extent_count",
];

/// One row of `lvs` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LvInfo {
    pub vg_name: String,
    pub lv_name: String,
    pub lv_attr: String,
    pub lv_size: u64,
    pub vg_free_count: u64,
    pub vg_extent_size: u64,
    pub vg_extent_count: u64,
}

impl LvInfo {
    pub fn device(&self) -> PathBuf {
        Path::new("/dev").join(&self.vg_name).join(&self.lv_name)
    }

    /// `lv_attr` starts with `s` (or `S` when invalid) for snapshot volumes.
    pub fn is_snapshot(&self) -> bool {
        matches!(self.lv_attr.chars().next(), Some('s') | Some('S'))
    }
}

pub fn lvs_argv(device: &Path) -> Vec<String> {
    let mut args = argv([
        "lvs",
        "--noheadings",
        "--separator=,",
        "--nosuffix",
        "--units=b",
    ]);
    args.push(format!("--options={}", LVS_COLUMNS.join(",")));
    args.push(device.display().to_string());
    args
}

pub fn parse_lvs(output: &str) -> Result<Vec<LvInfo>, String> {
    output
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            let values: Vec<&str> = line.split(',').map(str::trim).collect();
            if values.len() != LVS_COLUMNS.len() {
                return Err(format!(
                    "expected {} columns from lvs, got {}: '{}'",
                    LVS_COLUMNS.len(),
                    values.len(),
                    line.trim()
                ));
            }
            let number = |idx: usize| -> Result<u64, String> {
                values[idx]
                    .parse::<u64>()
                    .map_err(|_| format!("lvs column {} is not a number: '{}'", LVS_COLUMNS[idx], values[idx]))
            };
            Ok(LvInfo {
                vg_name: values[0].to_string(),
                lv_name: values[1].to_string(),
                lv_attr: values[2].to_string(),
                lv_size: number(3)?,
                vg_free_count: number(4)?,
                vg_extent_size: number(5)?,
                vg_extent_count: number(6)?,
            })
        })
        .collect()
}

/// Look up a logical volume by device path.
///
/// `Ok(None)` when `lvs` does not know the device.
pub fn lvs<R: CommandRunner + ?Sized>(
    runner: &R,
    device: &Path,
    timeout: Option<Duration>,
) -> Result<Option<LvInfo>, LvsError> {
    match runner.run(&lvs_argv(device), timeout) {
        Ok(output) => Ok(parse_lvs(&output).map_err(LvsError::Parse)?.into_iter().next()),
        Err(CommandError::Failed { .. }) => Ok(None),
        Err(e) => Err(LvsError::Command(e)),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LvsError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("unexpected lvs output: {0}")]
    Parse(String),
}

/// Percentage of the snapshot's copy-on-write space in use.
pub fn snapshot_usage<R: CommandRunner + ?Sized>(runner: &R, device: &Path, timeout: Option<Duration>) -> Option<f64> {
    let args = argv([
        "lvs".to_string(),
        "--noheadings".to_string(),
        "--nosuffix".to_string(),
        "--options=data_percent".to_string(),
        device.display().to_string(),
    ]);
    runner
        .run(&args, timeout)
        .ok()
        .and_then(|out| out.trim().replace(',', ".").parse::<f64>().ok())
}

/// `extra` is passed through to `lvcreate` after the origin.
pub fn lvcreate_snapshot_argv(origin: &Path, name: &str, extents: u64, extra: &[String]) -> Vec<String> {
    let mut args = vec![
        "lvcreate".to_string(),
        "--snapshot".to_string(),
        format!("--name={}", name),
        format!("--extents={}", extents),
        origin.display().to_string(),
    ];
    args.extend(extra.iter().filter(|o| !o.trim().is_empty()).cloned());
    args
}

pub fn lvremove_argv(device: &Path) -> Vec<String> {
    vec!["lvremove".to_string(), "--force".to_string(), device.display().to_string()]
}

pub fn mount_argv(device: &Path, at: &Path, options: &[String]) -> Vec<String> {
    let mut args = vec!["mount".to_string()];
    if !options.is_empty() {
        args.push("-o".to_string());
        args.push(options.join(","));
    }
    args.push(device.display().to_string());
    args.push(at.display().to_string());
    args
}

pub fn umount_argv(at: &Path) -> Vec<String> {
    vec!["umount".to_string(), at.display().to_string()]
}
