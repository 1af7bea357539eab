//! Streaming a mounted snapshot into archive members
//!
//! An [`ArchiveStreamer`] turns the data directory on the mounted snapshot
//! into one member per logical unit, or a single member for the whole
//! tree, and describes what it wrote in an [`ArchiveManifest`]. It fails
//! fast on the first unreadable file and never deletes partial output;
//! discarding that is up to the caller.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::cancel::CancelToken;
use crate::error::{BackupError, Result};
use crate::events::EventSink;
use crate::lock::ReplicationInfo;

pub mod tar;

pub use self::tar::TarStreamer;

/// Member holding the top-level files of a per-unit archive.
pub const SHARED_UNIT: &str = "_shared";
/// Member holding the whole tree when units are not split out.
pub const WHOLE_TREE_UNIT: &str = "backup";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMethod {
    None,
    #[default]
    Zstd,
}

impl CompressionMethod {
    pub fn extension(&self) -> &'static str {
        match self {
            CompressionMethod::None => "",
            CompressionMethod::Zstd => ".zst",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Compression {
    pub method: CompressionMethod,
    pub level: i32,
    /// Compress while streaming; otherwise compression is left to a later pass
    pub inline: bool,
}

impl Default for Compression {
    fn default() -> Self {
        Self { method: CompressionMethod::Zstd, level: 3, inline: true }
    }
}

impl Compression {
    pub fn validate(&self) -> Result<()> {
        if self.method == CompressionMethod::Zstd && !(1..=19).contains(&self.level) {
            return Err(BackupError::InvalidConfig(format!(
                "zstd compression level must be between 1 and 19, got {}",
                self.level
            )));
        }
        Ok(())
    }

    /// Whether members get compressed while they are written.
    pub fn applied_inline(&self) -> bool {
        self.inline && self.method != CompressionMethod::None
    }

    /// Compression was requested but not performed here.
    pub fn deferred(&self) -> bool {
        !self.inline && self.method != CompressionMethod::None
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchivePolicy {
    pub per_logical_unit: bool,
    pub compression: Compression,
    /// gitignore-style patterns skipped everywhere in the tree
    pub exclude: Vec<String>,
}

impl Default for ArchivePolicy {
    fn default() -> Self {
        Self {
            per_logical_unit: false,
            compression: Compression::default(),
            exclude: vec!["lost+found".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveMember {
    pub logical_unit: String,
    /// File name inside the output directory
    pub file_name: String,
    pub file_count: u64,
    /// Uncompressed size of the member stream
    pub byte_count: u64,
    /// Size on disk
    pub compressed_byte_count: u64,
    /// SHA-256 of the file on disk
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub name: String,
    pub device_path: PathBuf,
    pub size_bytes: u64,
    pub created_at: DateTime<Local>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveManifest {
    pub members: Vec<ArchiveMember>,
    pub compression: Compression,
    pub compression_deferred: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication: Option<ReplicationInfo>,
    /// How long writers were blocked, in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freeze_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<SnapshotSummary>,
}

impl ArchiveManifest {
    pub fn member(&self, unit: &str) -> Option<&ArchiveMember> {
        self.members.iter().find(|m| m.logical_unit == unit)
    }

    pub fn total_bytes(&self) -> u64 {
        self.members.iter().map(|m| m.byte_count).sum()
    }

    pub fn total_compressed_bytes(&self) -> u64 {
        self.members.iter().map(|m| m.compressed_byte_count).sum()
    }
}

/// Where a run writes and who it reports to.
pub struct StreamContext<'a> {
    pub output_dir: &'a Path,
    pub cancel: &'a CancelToken,
    pub events: &'a dyn EventSink,
}

pub trait ArchiveStreamer: Send {
    /// Archive the tree at `root` into `ctx.output_dir`.
    fn run(&self, root: &Path, policy: &ArchivePolicy, ctx: &StreamContext<'_>) -> Result<ArchiveManifest>;
}
