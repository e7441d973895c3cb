//! PMRT Memory - Locked memory for interrupt and fault context
//!
//! Memory touched with interrupts masked, on an interrupt stack or while a
//! fault is being handled must never page. This crate provides:
//!
//! - **Heap**: [`LockedHeap`], size-class pools plus dedicated large regions
//! - **Pool**: [`MemoryPool`], the fixed-size block allocator behind each class
//! - **Boxes**: [`LockedBox`] for owned values
//! - **Closures**: [`LockedFnOnce`] and [`LockedFn`] for type-erased callbacks
//! - **Sharing**: [`LockedArc`], reference-counted values
//!
//! # Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use pmrt_api::sim::SimulatedHost;
//! use pmrt_memory::{LockedBox, LockedHeap};
//!
//! let heap = Arc::new(LockedHeap::new(Arc::new(SimulatedHost::new())));
//! let value = LockedBox::new(&heap, 42u32).unwrap();
//! assert_eq!(*value, 42);
//! ```

#![no_std]
#![allow(dead_code)]

#[cfg(any(test, feature = "std"))]
extern crate std;

extern crate alloc;

pub mod boxed;
pub mod closure;
pub mod heap;
pub mod pool;
pub mod shared;

pub use crate::boxed::LockedBox;
pub use crate::closure::{LockedFn, LockedFnOnce};
pub use crate::heap::{HeapStats, IrqSave, LockedHeap, CHUNK_SIZE, MAX_CLASS_SIZE};
pub use crate::pool::{MemoryPool, PoolStats};
pub use crate::shared::LockedArc;
