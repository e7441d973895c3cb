//! Thread configuration

use alloc::string::String;

use pmrt_api::Result;

use super::{Scheduler, Thread, ThreadError};

/// Configures a thread before it is created.
///
/// ```ignore
/// let worker = scheduler
///     .builder()
///     .name("poller")
///     .stack_size(16 * 1024)
///     .spawn(scheduler, |s| loop { s.yield_now()?; })?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct ThreadBuilder {
    stack_size: Option<usize>,
    name: Option<String>,
}

impl ThreadBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stack size in bytes; the scheduler default when unset
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(String::from(name));
        self
    }

    /// Creates the thread without starting it
    pub fn create<F>(self, scheduler: &Scheduler, f: F) -> Result<Thread>
    where
        F: FnOnce(&Scheduler) -> core::result::Result<(), ThreadError> + Send + 'static,
    {
        scheduler.create_with(self.stack_size, self.name, f)
    }

    pub fn spawn<F>(self, scheduler: &Scheduler, f: F) -> Result<Thread>
    where
        F: FnOnce(&Scheduler) -> core::result::Result<(), ThreadError> + Send + 'static,
    {
        let thread = self.create(scheduler, f)?;
        scheduler.start(&thread)?;
        Ok(thread)
    }
}
