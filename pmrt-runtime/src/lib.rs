//! PMRT Runtime - Threads, interrupts and fault handling for protected mode
//!
//! The runtime runs a program under a DPMI-style host on a single
//! instruction stream with no kernel underneath. It provides:
//!
//! - **Threads**: [`Scheduler`], cooperative round-robin threads that only
//!   switch at [`Scheduler::yield_now`]
//! - **Interrupts**: [`InterruptController`], chained hardware interrupt
//!   handlers running on a private stack pool
//! - **Exceptions**: [`ExceptionBridge`], chained fault handlers, and
//!   [`catch_faults`] turning faults in the program's code into
//!   [`CpuException`] values
//! - **FPU**: [`FpuSwitch`], lazy numeric state switching through CR0.TS
//! - **Runtime**: [`Runtime`], which builds all of the above in order and
//!   restores the host's vectors when dropped
//!
//! # Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use pmrt_api::sim::SimulatedHost;
//! use pmrt_runtime::{Runtime, RuntimeConfig};
//!
//! let runtime = Runtime::new(Arc::new(SimulatedHost::new()), RuntimeConfig::default()).unwrap();
//! let scheduler = runtime.scheduler();
//! let worker = scheduler.spawn(|s| {
//!     s.yield_now()?;
//!     Ok(())
//! }).unwrap();
//! scheduler.join(&worker).unwrap();
//! ```

#![no_std]
#![allow(dead_code)]

#[cfg(any(test, feature = "std"))]
extern crate std;

extern crate alloc;

#[macro_use]
pub mod debug;

pub mod arch;
pub mod chain;
pub mod config;
pub mod cpu;
pub mod exception;
pub mod fpu;
pub mod interrupt;
pub mod runtime;
pub mod thread;

#[cfg(feature = "sim")]
pub mod sim;

pub use crate::config::RuntimeConfig;
pub use crate::cpu::{Cpu, MaskGuard};
pub use crate::exception::{CpuException, ExceptionBridge, ExceptionState, FaultRecord, catch_faults};
pub use crate::fpu::FpuSwitch;
pub use crate::interrupt::{HandlerId, InterruptController, IrqContext, IrqFlags};
pub use crate::runtime::Runtime;
pub use crate::thread::{Scheduler, Thread, ThreadAborted, ThreadBuilder, ThreadError, ThreadExit, ThreadId};
