//! Error types for a snapshot backup run
//!
//! Every component reports failures as a [`BackupError`]. The orchestrator
//! is the only place that decides about rollback; when rollback itself
//! fails, the secondary errors are attached to the primary one through
//! [`BackupError::CleanupFailed`] so the root cause is never masked.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::utils::cmd::CommandError;

/// Result type alias for backup operations
pub type Result<T> = std::result::Result<T, BackupError>;

#[derive(Debug, Error)]
pub enum BackupError {
    /// The path is not backed by a snapshot-capable volume
    #[error("'{path}' is not on a snapshot-capable volume: {reason}")]
    NotOnSupportedVolume { path: PathBuf, reason: String },

    /// Requested snapshot does not fit the free capacity of the volume group
    #[error("insufficient space for snapshot: requested {requested} bytes, {available} bytes usable")]
    InsufficientSpace { requested: u64, available: u64 },

    /// Writers did not quiesce within the bounded wait
    #[error("writes did not quiesce after {attempts} attempt(s) of {timeout:?}")]
    LockTimeout { attempts: u32, timeout: Duration },

    /// Lock driver failure other than a timeout
    #[error("lock driver '{driver}' failed: {reason}")]
    Lock { driver: &'static str, reason: String },

    #[error("failed to create snapshot '{name}': {reason}")]
    SnapshotCreateFailed { name: String, reason: String },

    #[error("failed to mount '{device}' at '{mountpoint}': {reason}")]
    MountFailed {
        device: PathBuf,
        mountpoint: PathBuf,
        reason: String,
    },

    #[error("failed to unmount '{device}': {reason}")]
    UnmountFailed { device: PathBuf, reason: String },

    #[error("failed to remove snapshot '{device}': {reason}")]
    RemoveFailed { device: PathBuf, reason: String },

    /// Recorded snapshot state and the host mount table disagree
    #[error("snapshot state disagrees with the host: {0}")]
    SnapshotState(String),

    #[error("failed to read '{path}': {source}")]
    ArchiveReadFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write archive '{path}': {source}")]
    ArchiveWriteFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Primary failure plus everything that went wrong while rolling back
    #[error("{primary} (cleanup also failed: {})", join_failures(.failures))]
    CleanupFailed {
        primary: Box<BackupError>,
        failures: Vec<BackupError>,
    },

    #[error("a backup of '{0}' is already running in this process")]
    Busy(PathBuf),

    #[error("backup cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

fn join_failures(failures: &[BackupError]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl BackupError {
    /// The root cause, looking through any attached cleanup failures.
    pub fn primary(&self) -> &BackupError {
        match self {
            BackupError::CleanupFailed { primary, .. } => primary.primary(),
            other => other,
        }
    }

    /// Secondary errors raised while rolling back, if any.
    pub fn cleanup_failures(&self) -> &[BackupError] {
        match self {
            BackupError::CleanupFailed { failures, .. } => failures,
            _ => &[],
        }
    }

    /// Attach cleanup failures; a no-op when there are none.
    pub fn with_cleanup(self, failures: Vec<BackupError>) -> BackupError {
        if failures.is_empty() {
            return self;
        }
        match self {
            BackupError::CleanupFailed {
                primary,
                failures: mut existing,
            } => {
                existing.extend(failures);
                BackupError::CleanupFailed {
                    primary,
                    failures: existing,
                }
            }
            primary => BackupError::CleanupFailed {
                primary: Box::new(primary),
                failures,
            },
        }
    }

    /// Stable short name of the error kind, used in logs and events.
    pub fn kind(&self) -> &'static str {
        match self.primary() {
            BackupError::NotOnSupportedVolume { .. } => "not-on-supported-volume",
            BackupError::InsufficientSpace { .. } => "insufficient-space",
            BackupError::LockTimeout { .. } => "lock-timeout",
            BackupError::Lock { .. } => "lock",
            BackupError::SnapshotCreateFailed { .. } => "snapshot-create-failed",
            BackupError::MountFailed { .. } => "mount-failed",
            BackupError::UnmountFailed { .. } => "unmount-failed",
            BackupError::RemoveFailed { .. } => "remove-failed",
            BackupError::SnapshotState(_) => "snapshot-state",
            BackupError::ArchiveReadFailed { .. } => "archive-read-failed",
            BackupError::ArchiveWriteFailed { .. } => "archive-write-failed",
            BackupError::CleanupFailed { .. } => "cleanup-failed",
            BackupError::Busy(_) => "busy",
            BackupError::Cancelled => "cancelled",
            BackupError::InvalidConfig(_) => "invalid-config",
            BackupError::Command(_) => "command",
            BackupError::Io(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_cleanup_keeps_primary() {
        let err = BackupError::MountFailed {
            device: PathBuf::from("/dev/vg0/data_snapshot"),
            mountpoint: PathBuf::from("/mnt/snap"),
            reason: "wrong fs type".into(),
        }
        .with_cleanup(vec![BackupError::RemoveFailed {
            device: PathBuf::from("/dev/vg0/data_snapshot"),
            reason: "device busy".into(),
        }]);

        assert!(matches!(err.primary(), BackupError::MountFailed { .. }));
        assert_eq!(err.cleanup_failures().len(), 1);
        assert_eq!(err.kind(), "mount-failed");

        let msg = err.to_string();
        assert!(msg.contains("wrong fs type"));
        assert!(msg.contains("cleanup also failed"));
        assert!(msg.contains("device busy"));
    }

    #[test]
    fn test_with_cleanup_empty_is_noop() {
        let err = BackupError::Cancelled.with_cleanup(Vec::new());
        assert!(matches!(err, BackupError::Cancelled));
        assert!(err.cleanup_failures().is_empty());
    }

    #[test]
    fn test_with_cleanup_accumulates() {
        let err = BackupError::Cancelled
            .with_cleanup(vec![BackupError::InvalidConfig("one".into())])
            .with_cleanup(vec![BackupError::InvalidConfig("two".into())]);
        assert_eq!(err.cleanup_failures().len(), 2);
        assert!(matches!(err.primary(), BackupError::Cancelled));
    }

    #[test]
    fn test_display_read_failure_names_path() {
        let err = BackupError::ArchiveReadFailed {
            path: PathBuf::from("/mnt/snap/b/t1.ibd"),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(err.to_string().contains("/mnt/snap/b/t1.ibd"));
    }
}
