//! Progress events emitted during a backup run
//!
//! Observers implement [`EventSink`]. [`LogSink`] writes events to the
//! log, [`Recorder`] keeps them for later inspection, and any
//! `Fn(&BackupEvent)` closure works as a sink too.

use parking_lot::Mutex;
use serde::Serialize;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::utils::fmt::format_bytes;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum BackupEvent {
    RunStarted { source: PathBuf },
    VolumeResolved { device: PathBuf, snapshot_size: u64 },
    FreezeStarted,
    FreezeEnded { held_ms: u64 },
    SnapshotCreated { device: PathBuf },
    SnapshotMounted { path: PathBuf },
    UnitStarted { unit: String },
    UnitCompleted { unit: String, bytes: u64, compressed_bytes: u64 },
    SnapshotRemoved { device: PathBuf },
    RunFinished { success: bool },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &BackupEvent);
}

impl<F> EventSink for F
where
    F: Fn(&BackupEvent) + Send + Sync,
{
    fn emit(&self, event: &BackupEvent) {
        self(event)
    }
}

/// Sink that logs every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: &BackupEvent) {
        match event {
            BackupEvent::UnitCompleted { unit, bytes, compressed_bytes } => info!(
                target: "snapfreeze::events",
                "Unit '{}' complete: {} ({} written)",
                unit,
                format_bytes(*bytes),
                format_bytes(*compressed_bytes)
            ),
            other => debug!(target: "snapfreeze::events", "{:?}", other),
        }
    }
}

/// Sink that keeps every event in order.
#[derive(Debug, Default)]
pub struct Recorder {
    events: Mutex<Vec<BackupEvent>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<BackupEvent> {
        self.events.lock().clone()
    }
}

impl EventSink for Recorder {
    fn emit(&self, event: &BackupEvent) {
        self.events.lock().push(event.clone());
    }
}
