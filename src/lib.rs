//! Crash-consistent snapshot backups of a running database.
//!
//! A run briefly freezes writes, creates a copy-on-write snapshot of the
//! volume holding the data directory, releases the freeze, then archives
//! the frozen image from the mounted snapshot while the database keeps
//! running. [`Orchestrator`] sequences the steps and guarantees that no
//! lock, mount or snapshot outlives the run, whatever its outcome.

pub mod archive;
pub mod cancel;
pub mod config;
pub mod error;
pub mod events;
pub mod lock;
pub mod logging;
pub mod orchestrator;
pub mod snapshot;
pub mod utils;
pub mod volume;

pub use archive::{ArchiveManifest, ArchivePolicy, ArchiveStreamer, Compression, CompressionMethod, TarStreamer};
pub use cancel::CancelToken;
pub use error::{BackupError, Result};
pub use events::{BackupEvent, EventSink, LogSink, Recorder};
pub use lock::{LockCoordinator, LockDriver, LockPolicy, LockState};
pub use orchestrator::{BackupPlan, BackupRequest, Orchestrator};
pub use snapshot::{SnapshotBackend, SnapshotManager, SnapshotState};
pub use volume::{SizeLimits, SizePolicy, VolumeDescriptor, VolumeInspector};
