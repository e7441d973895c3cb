//! Interrupt stack pool
//!
//! Interrupt and exception dispatch never run on the interrupted stack: it
//! may be halfway through a thread switch. Every nesting level instead
//! gets a fixed frame of one locked region. When the free space left after
//! entering a level drops under the low-water mark, growth (doubling the
//! region) is scheduled. It is carried out by [`InterruptStack::maintain`]
//! from thread context, when nothing runs on the old region and new memory
//! may be locked.
//!
//! Dispatch reads the region through atomics only, so it never contends
//! for a lock held by the code it interrupted.

use alloc::sync::Arc;
use core::alloc::Layout;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use log::{error, info};
use pmrt_api::{Error, Result};
use pmrt_memory::{IrqSave, LockedHeap};

use crate::arch::STACK_ALIGN;

pub struct InterruptStack {
    heap: Arc<LockedHeap>,
    frame_size: usize,
    low_water: usize,
    /// Base address of the region
    base: AtomicUsize,
    size: AtomicUsize,
    depth: AtomicUsize,
    grow_pending: AtomicBool,
    max_depth: AtomicUsize,
    growths: AtomicUsize,
}

impl InterruptStack {
    pub fn new(heap: Arc<LockedHeap>, size: usize, frame_size: usize, low_water: usize) -> Result<Self> {
        if frame_size == 0 || size < frame_size {
            return Err(Error::InvalidArgument("interrupt stack smaller than one frame"));
        }
        let frame_size = (frame_size + STACK_ALIGN - 1) & !(STACK_ALIGN - 1);
        let base = heap.allocate(Self::layout(size)?)?;
        Ok(Self {
            heap,
            frame_size,
            low_water,
            base: AtomicUsize::new(base.as_ptr() as usize),
            size: AtomicUsize::new(size),
            depth: AtomicUsize::new(0),
            grow_pending: AtomicBool::new(false),
            max_depth: AtomicUsize::new(0),
            growths: AtomicUsize::new(0),
        })
    }

    fn layout(size: usize) -> Result<Layout> {
        Layout::from_size_align(size, STACK_ALIGN).map_err(|_| Error::InvalidArgument("interrupt stack size"))
    }

    /// Reserves the frame for a new nesting level and returns its stack top
    pub fn acquire(&self) -> usize {
        let base = self.base.load(Ordering::Acquire);
        let size = self.size.load(Ordering::Acquire);
        let level = self.depth.fetch_add(1, Ordering::Relaxed);
        let used = (level + 1) * self.frame_size;
        if used > size {
            error!(target: "pmrt::irq", "interrupt stack exhausted at nesting level {}", level);
            panic!("interrupt stack exhausted");
        }
        if size - used < self.low_water {
            self.grow_pending.store(true, Ordering::Relaxed);
        }
        self.max_depth.fetch_max(level + 1, Ordering::Relaxed);
        let top = base + size - level * self.frame_size;
        top & !(STACK_ALIGN - 1)
    }

    /// Releases the innermost frame
    pub fn release(&self) {
        let previous = self.depth.fetch_sub(1, Ordering::Relaxed);
        if previous == 0 {
            error!(target: "pmrt::irq", "interrupt stack released more often than acquired");
            panic!("interrupt stack underflow");
        }
    }

    /// Whether growth is waiting for [`maintain`](Self::maintain)
    pub fn grow_pending(&self) -> bool {
        self.grow_pending.load(Ordering::Relaxed)
    }

    /// Performs pending growth. Must be called from thread context.
    pub fn maintain(&self) -> Result<()> {
        if self.depth() != 0 {
            return Err(Error::InvalidState("interrupt stack grown while in use"));
        }
        if !self.grow_pending.swap(false, Ordering::Relaxed) {
            return Ok(());
        }
        let new_size = self.size.load(Ordering::Acquire) * 2;
        let grown = Self::layout(new_size).and_then(|layout| self.heap.allocate(layout));
        let base = match grown {
            Ok(base) => base,
            Err(err) => {
                self.grow_pending.store(true, Ordering::Relaxed);
                error!(target: "pmrt::irq", "growing interrupt stack to {} bytes: {}", new_size, err);
                return Err(err);
            }
        };
        let (old_base, old_size) = {
            let _irq = IrqSave::new(&**self.heap.host());
            (
                self.base.swap(base.as_ptr() as usize, Ordering::AcqRel),
                self.size.swap(new_size, Ordering::AcqRel),
            )
        };
        if let (Some(old), Ok(layout)) = (NonNull::new(old_base as *mut u8), Self::layout(old_size)) {
            unsafe { self.heap.deallocate(old, layout) };
        }
        self.growths.fetch_add(1, Ordering::Relaxed);
        info!(target: "pmrt::irq", "interrupt stack grown to {} bytes", new_size);
        Ok(())
    }

    /// Current capacity in bytes
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Nesting levels currently running on the pool
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Deepest nesting observed so far
    pub fn max_depth(&self) -> usize {
        self.max_depth.load(Ordering::Relaxed)
    }

    pub fn growths(&self) -> usize {
        self.growths.load(Ordering::Relaxed)
    }
}

impl Drop for InterruptStack {
    fn drop(&mut self) {
        let base = NonNull::new(*self.base.get_mut() as *mut u8);
        if let (Some(base), Ok(layout)) = (base, Self::layout(*self.size.get_mut())) {
            unsafe { self.heap.deallocate(base, layout) };
        }
    }
}
