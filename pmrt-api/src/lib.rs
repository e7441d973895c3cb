//! PMRT API - Host interface and shared types for the protected-mode runtime
//!
//! This crate provides the types every other PMRT crate builds on:
//!
//! - **Error**: the crate-wide [`Error`] enum and host error codes
//! - **Host**: the [`Host`] trait, the single seam to the DPMI host and the CPU
//! - **Sync**: re-exports of the lock types used by the runtime
//! - **Sim**: an in-memory host model for tests (feature `sim`)
//!
//! # Usage
//!
//! ```rust
//! use pmrt_api::host::Host;
//! use pmrt_api::sim::SimulatedHost;
//!
//! let host = SimulatedHost::new();
//! let was_enabled = host.disable_interrupts();
//! assert!(was_enabled);
//! host.enable_interrupts();
//! ```

#![no_std]
#![allow(dead_code)]

#[cfg(any(test, feature = "std"))]
extern crate std;

extern crate alloc;

pub mod error;
pub mod host;
pub mod sync;

#[cfg(feature = "sim")]
pub mod sim;

// Re-export commonly used types
pub use crate::error::{Error, ErrorContext, HostError, HostResult, Result};
pub use crate::host::{Cr0, CpuFault, FarPointer, FpuState, Host, HostCall};
