//! Cooperative threads
//!
//! Threads never preempt each other: [`Scheduler::yield_now`] is the only
//! suspension point, and everything that waits is built on it. Each thread
//! owns a stack in locked memory with its entry closure stored at the top.
//! Interrupts may still arrive at any time and run on the interrupt stack,
//! where they can queue work for a thread through
//! [`Scheduler::invoke_main`] and [`Scheduler::invoke_next`].
//!
//! Aborting a thread only sets a flag. The thread sees
//! `Err(ThreadAborted)` from its next yield and is expected to return it
//! (usually with `?`) so that it ends on its own stack.

mod builder;
mod scheduler;
mod tcb;
mod wait;

use core::fmt;

use pmrt_api::Error;

pub use builder::ThreadBuilder;
pub use scheduler::{Scheduler, Thread};

/// Thread identifier; ids are never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(usize);

/// The thread the runtime was started on
pub const MAIN_THREAD_ID: ThreadId = ThreadId(1);

impl ThreadId {
    pub(crate) const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> usize {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Thread lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    /// Created, not yet run
    Starting,
    Running,
    /// Closure returned; exit handlers are running
    Finishing,
    Finished,
}

impl ThreadState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => ThreadState::Starting,
            1 => ThreadState::Running,
            2 => ThreadState::Finishing,
            _ => ThreadState::Finished,
        }
    }
}

/// Marker delivered by `yield_now` to a thread that has been aborted.
///
/// Generic error handling must pass it on; see [`ThreadError::suppress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadAborted;

impl fmt::Display for ThreadAborted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("thread aborted")
    }
}

/// Error type of thread closures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadError {
    Aborted,
    Failed(Error),
}

impl ThreadError {
    /// Swallows an ordinary failure but keeps the abort marker going
    pub fn suppress(self) -> Result<(), ThreadAborted> {
        match self {
            ThreadError::Aborted => Err(ThreadAborted),
            ThreadError::Failed(err) => {
                log::debug!(target: "pmrt::thread", "suppressed: {}", err);
                Ok(())
            }
        }
    }

    pub fn is_abort(&self) -> bool {
        matches!(self, ThreadError::Aborted)
    }
}

impl From<ThreadAborted> for ThreadError {
    fn from(_: ThreadAborted) -> Self {
        ThreadError::Aborted
    }
}

impl From<Error> for ThreadError {
    fn from(err: Error) -> Self {
        ThreadError::Failed(err)
    }
}

impl From<crate::exception::CpuException> for ThreadError {
    fn from(exception: crate::exception::CpuException) -> Self {
        ThreadError::Failed(exception.into())
    }
}

impl fmt::Display for ThreadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadError::Aborted => f.write_str("thread aborted"),
            ThreadError::Failed(err) => write!(f, "thread failed: {}", err),
        }
    }
}

/// How a thread ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadExit {
    Completed,
    Aborted,
    Failed(Error),
}

impl From<Result<(), ThreadError>> for ThreadExit {
    fn from(result: Result<(), ThreadError>) -> Self {
        match result {
            Ok(()) => ThreadExit::Completed,
            Err(ThreadError::Aborted) => ThreadExit::Aborted,
            Err(ThreadError::Failed(err)) => ThreadExit::Failed(err),
        }
    }
}
