//! Synchronization primitives for the runtime
//!
//! The runtime serialises with the interrupt mask rather than with locks, so
//! a `Mutex` here is only ever taken with interrupts disabled and never held
//! across a handler call or a context switch.

pub use spin::Mutex;
pub use spin::MutexGuard;
pub use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};
