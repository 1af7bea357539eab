use std::time::Duration;

use super::{DriverError, LockDriver};

/// Driver for `lock-tables = false`: every step succeeds without touching the database.
#[derive(Debug, Default)]
pub struct NoLock;

impl LockDriver for NoLock {
    fn name(&self) -> &'static str { "none" }

    fn flush(&mut self) -> Result<(), DriverError> { Ok(()) }

    fn lock(&mut self, _timeout: Duration) -> Result<(), DriverError> { Ok(()) }

    fn unlock(&mut self) -> Result<(), DriverError> { Ok(()) }
}
