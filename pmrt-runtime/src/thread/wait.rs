//! Waiting by yielding
//!
//! There is no blocking primitive: a waiting thread yields until its
//! condition changes. Conditions are usually flags set by interrupt
//! handlers or by other threads.

use super::{Scheduler, ThreadAborted};

impl Scheduler {
    /// Yields while `cond` holds
    pub fn wait_while(&self, mut cond: impl FnMut() -> bool) -> Result<(), ThreadAborted> {
        while cond() {
            self.yield_now()?;
        }
        Ok(())
    }

    /// Yields until `cond` holds
    pub fn wait_until(&self, mut cond: impl FnMut() -> bool) -> Result<(), ThreadAborted> {
        self.wait_while(|| !cond())
    }

    /// Yields until `cond` holds or `expired` does. Returns whether `cond`
    /// was met; `cond` is checked first, so a condition met at the deadline
    /// still counts.
    pub fn wait_until_or(
        &self,
        mut cond: impl FnMut() -> bool,
        mut expired: impl FnMut() -> bool,
    ) -> Result<bool, ThreadAborted> {
        loop {
            if cond() {
                return Ok(true);
            }
            if expired() {
                return Ok(false);
            }
            self.yield_now()?;
        }
    }
}
