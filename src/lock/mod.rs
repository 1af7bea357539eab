//! Write-freeze coordination for the source database
//!
//! A [`LockDriver`] knows how to flush, block and unblock writers of one
//! kind of database. [`LockCoordinator`] wraps a driver in the
//! `idle -> pre-flushed -> frozen -> idle` state machine, owns the bounded
//! retry of `freeze()`, and guarantees writers are released: `release()` is
//! idempotent, and a coordinator dropped while frozen releases on drop.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::error::{BackupError, Result};
use crate::utils::fmt::format_interval;

pub mod mysql;
pub mod noop;

pub use mysql::MySqlFlushLock;
pub use noop::NoLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LockState {
    Idle,
    PreFlushed,
    Frozen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LockMode {
    None,
    PreFlushed,
    Frozen,
}

/// Binary log coordinates captured while writes were frozen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationInfo {
    pub log_file: String,
    pub log_position: u64,
}

/// What the caller holds between `freeze()` and `release()`.
#[derive(Debug, Clone, Serialize)]
pub struct LockSession {
    pub held_since: Option<DateTime<Local>>,
    pub mode: LockMode,
    pub replication: Option<ReplicationInfo>,
}

/// Which lock steps a run performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LockPolicy {
    pub pre_flush: bool,
    pub freeze_for_snapshot: bool,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self { pre_flush: true, freeze_for_snapshot: true }
    }
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Failed(String),
}

pub trait LockDriver: Send {
    fn name(&self) -> &'static str;

    /// Flush in-memory state to stable storage without blocking writers.
    fn flush(&mut self) -> std::result::Result<(), DriverError>;

    /// Block new writers and wait up to `timeout` for in-flight ones to finish.
    fn lock(&mut self, timeout: Duration) -> std::result::Result<(), DriverError>;

    /// Unblock writers. Must be safe after a partial or failed `lock`.
    fn unlock(&mut self) -> std::result::Result<(), DriverError>;

    /// Metadata-speed facts worth recording while frozen.
    fn replication_info(&mut self) -> std::result::Result<Option<ReplicationInfo>, DriverError> {
        Ok(None)
    }

    /// Whether the lock taken by `lock` is still in force.
    fn lock_held(&mut self) -> std::result::Result<(), DriverError> {
        Ok(())
    }
}

pub struct LockCoordinator {
    driver: Box<dyn LockDriver>,
    state: LockState,
    timeout: Duration,
    attempts: u32,
    frozen_at: Option<Instant>,
    /// The driver may hold a partial lock that still needs undoing
    dirty: bool,
    last_freeze: Option<Duration>,
}

impl LockCoordinator {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DEFAULT_ATTEMPTS: u32 = 2;

    pub fn new(driver: Box<dyn LockDriver>) -> Self {
        Self {
            driver,
            state: LockState::Idle,
            timeout: Self::DEFAULT_TIMEOUT,
            attempts: Self::DEFAULT_ATTEMPTS,
            frozen_at: None,
            dirty: false,
            last_freeze: None,
        }
    }

    /// Bounded wait per freeze attempt and total attempts (at least one).
    pub fn with_timeout(mut self, timeout: Duration, attempts: u32) -> Self {
        self.timeout = timeout;
        self.attempts = attempts.max(1);
        self
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    pub fn driver_name(&self) -> &'static str {
        self.driver.name()
    }

    /// How long writers were blocked by the most recent freeze.
    pub fn last_freeze_duration(&self) -> Option<Duration> {
        self.last_freeze
    }

    /// Advisory flush ahead of the freeze. Failures are logged, never fatal.
    pub fn pre_flush(&mut self) {
        if self.state != LockState::Idle {
            return;
        }
        let start = Instant::now();
        match self.driver.flush() {
            Ok(()) => {
                self.state = LockState::PreFlushed;
                info!(target: "snapfreeze::lock", "Pre-flush took {}", format_interval(start.elapsed()));
            }
            Err(e) => {
                warn!(target: "snapfreeze::lock", driver = self.driver.name(), "Pre-flush failed, continuing: {}", e);
            }
        }
    }

    /// Freeze writers, retrying timed-out attempts up to the configured bound.
    pub fn freeze(&mut self) -> Result<LockSession> {
        if self.state == LockState::Frozen {
            return Err(BackupError::Lock {
                driver: self.driver.name(),
                reason: "writes are already frozen".into(),
            });
        }
        let pre_flushed = self.state == LockState::PreFlushed;

        for attempt in 1..=self.attempts {
            info!(target: "snapfreeze::lock", "Freezing writes via {} (attempt {}/{})", self.driver.name(), attempt, self.attempts);
            let start = Instant::now();
            self.dirty = true;
            match self.driver.lock(self.timeout) {
                Ok(()) => {
                    self.state = LockState::Frozen;
                    self.frozen_at = Some(Instant::now());
                    info!(target: "snapfreeze::lock", "Writes frozen after {}", format_interval(start.elapsed()));
                    let replication = match self.driver.replication_info() {
                        Ok(info) => info,
                        Err(e) => {
                            warn!(target: "snapfreeze::lock", "Could not record replication info: {}", e);
                            None
                        }
                    };
                    if let Err(e) = self.driver.lock_held() {
                        self.undo_partial();
                        self.frozen_at = None;
                        return Err(BackupError::Lock {
                            driver: self.driver.name(),
                            reason: format!("lock lost while frozen: {}", e),
                        });
                    }
                    if let Some(r) = &replication {
                        info!(target: "snapfreeze::lock", "Recorded binary log position {}:{}", r.log_file, r.log_position);
                    }
                    return Ok(LockSession {
                        held_since: Some(Local::now()),
                        mode: LockMode::Frozen,
                        replication,
                    });
                }
                Err(DriverError::Timeout(waited)) => {
                    warn!(
                        target: "snapfreeze::lock",
                        "Writes did not quiesce within {} (attempt {}/{})",
                        format_interval(waited),
                        attempt,
                        self.attempts
                    );
                    self.undo_partial();
                }
                Err(DriverError::Failed(reason)) => {
                    self.undo_partial();
                    return Err(BackupError::Lock { driver: self.driver.name(), reason });
                }
            }
        }

        self.state = LockState::Idle;
        if pre_flushed {
            info!(target: "snapfreeze::lock", "Pre-flush state discarded after failed freeze");
        }
        Err(BackupError::LockTimeout { attempts: self.attempts, timeout: self.timeout })
    }

    fn undo_partial(&mut self) {
        match self.driver.unlock() {
            Ok(()) => self.dirty = false,
            Err(e) => warn!(target: "snapfreeze::lock", "Undoing partial freeze failed: {}", e),
        }
        self.state = LockState::Idle;
    }

    /// Unblock writers. Idempotent: returns `Ok(None)` when nothing was held.
    pub fn release(&mut self) -> Result<Option<Duration>> {
        if self.state != LockState::Frozen && !self.dirty {
            self.state = LockState::Idle;
            return Ok(None);
        }

        let held = self.frozen_at.take().map(|t| t.elapsed());
        let result = self.driver.unlock();
        self.state = LockState::Idle;
        self.dirty = false;
        if let Some(held) = held {
            self.last_freeze = Some(held);
            info!(target: "snapfreeze::lock", "Writes were frozen for {}", format_interval(held));
        }
        match result {
            Ok(()) => Ok(held),
            Err(e) => Err(BackupError::Lock {
                driver: self.driver.name(),
                reason: format!("release failed: {}", e),
            }),
        }
    }
}

impl Drop for LockCoordinator {
    fn drop(&mut self) {
        if self.state == LockState::Frozen || self.dirty {
            warn!(target: "snapfreeze::lock", "Lock coordinator dropped while holding writes; releasing");
            if let Err(e) = self.release() {
                error!(target: "snapfreeze::lock", "{}", e);
            }
        }
    }
}
