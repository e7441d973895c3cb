//! Error handling module for the protected-mode runtime

use core::fmt;
use alloc::format;
use alloc::string::{String, ToString};

use crate::host::{CpuFault, HostCall};

/// Failure reported by the host call gate.
///
/// Carries the numeric code returned by the host and the call that produced
/// it. Host errors are never retried silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostError {
    /// Host function that failed
    pub call: HostCall,
    /// Error code as reported by the host
    pub code: u16,
}

impl HostError {
    /// Creates a new host error
    pub const fn new(call: HostCall, code: u16) -> Self {
        Self { call, code }
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed with code {:#06x}", self.call, self.code)
    }
}

/// Result type for host calls
pub type HostResult<T> = core::result::Result<T, HostError>;

/// Common error type used throughout the runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Host protocol error
    Host(HostError),
    /// Out of (locked) memory
    OutOfMemory,
    /// Invalid argument
    InvalidArgument(&'static str),
    /// Operation not permitted in the current state or context
    InvalidState(&'static str),
    /// Resource not found
    NotFound(&'static str),
    /// CPU fault converted into an error
    Cpu(CpuFault),
    /// Custom error with code and message
    Custom(i32, String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Host(err) => write!(f, "Host error: {}", err),
            Error::OutOfMemory => write!(f, "Out of memory"),
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::NotFound(msg) => write!(f, "Not found: {}", msg),
            Error::Cpu(fault) => write!(f, "CPU fault: {}", fault),
            Error::Custom(code, msg) => write!(f, "Error {}: {}", code, msg),
        }
    }
}

impl From<HostError> for Error {
    fn from(err: HostError) -> Self {
        Error::Host(err)
    }
}

impl From<CpuFault> for Error {
    fn from(fault: CpuFault) -> Self {
        Error::Cpu(fault)
    }
}

/// Result type for operations that can fail
pub type Result<T> = core::result::Result<T, Error>;

/// Error context trait for adding context to errors
pub trait ErrorContext<T> {
    /// Adds context to the error
    fn context(self, context: &str) -> Result<T>;
}

impl<T, E: Into<Error>> ErrorContext<T> for core::result::Result<T, E> {
    fn context(self, context: &str) -> Result<T> {
        self.map_err(|error| {
            let error: Error = error.into();
            let code = match &error {
                Error::Host(host) => i32::from(host.code),
                Error::Custom(code, _) => *code,
                _ => -1,
            };
            Error::Custom(code, format!("{}: {}", context, error))
        })
    }
}

/// Creates a new invalid argument error
pub fn invalid_argument(msg: &'static str) -> Error {
    Error::InvalidArgument(msg)
}

/// Creates a new invalid state error
pub fn invalid_state(msg: &'static str) -> Error {
    Error::InvalidState(msg)
}

/// Creates a new custom error
pub fn custom(code: i32, msg: &str) -> Error {
    Error::Custom(code, msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_error_display() {
        let err = Error::from(HostError::new(HostCall::SetInterruptVector, 0x8022));
        assert_eq!(
            format!("{}", err),
            "Host error: set interrupt vector failed with code 0x8022"
        );
    }

    #[test]
    fn test_context_keeps_host_code() {
        let res: HostResult<()> = Err(HostError::new(HostCall::LockRegion, 0x8013));
        match res.context("locking thread stack") {
            Err(Error::Custom(code, msg)) => {
                assert_eq!(code, 0x8013);
                assert!(msg.starts_with("locking thread stack: "));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
