//! Interrupt context allocation tests
//!
//! A counting global allocator watches interrupt handlers; everything they
//! allocate has to come from memory the locked heap already holds.

mod common;

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::runtime;
use pmrt_api::Error;
use pmrt_runtime::interrupt::IrqFlags;
use pmrt_runtime::sim::{self, IrqDelivery};

struct CountingAlloc;

static ALLOCATIONS: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static COUNTING: Cell<bool> = const { Cell::new(false) };
}

fn counting() -> bool {
    COUNTING.try_with(Cell::get).unwrap_or(false)
}

unsafe impl GlobalAlloc for CountingAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if counting() {
            ALLOCATIONS.fetch_add(1, Ordering::Relaxed);
        }
        unsafe { System.alloc(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { System.dealloc(ptr, layout) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if counting() {
            ALLOCATIONS.fetch_add(1, Ordering::Relaxed);
        }
        unsafe { System.realloc(ptr, layout, new_size) }
    }
}

#[global_allocator]
static GLOBAL: CountingAlloc = CountingAlloc;

/// Runs `f` with the global allocator counting on this host thread
fn counted<R>(f: impl FnOnce() -> R) -> (R, usize) {
    let before = ALLOCATIONS.load(Ordering::Relaxed);
    COUNTING.with(|c| c.set(true));
    let result = f();
    COUNTING.with(|c| c.set(false));
    (result, ALLOCATIONS.load(Ordering::Relaxed) - before)
}

#[test]
fn test_deferred_calls_from_irq_use_reserved_memory_only() {
    const CALLS: usize = 600;

    let (host, runtime) = runtime();
    let scheduler = runtime.scheduler().clone();
    let heap = runtime.heap().clone();
    let chunks = heap.stats().chunks;

    let ran = Arc::new(AtomicUsize::new(0));
    let queued = Arc::new(AtomicUsize::new(0));
    let refused = Arc::new(AtomicUsize::new(0));
    let global = Arc::new(AtomicUsize::new(0));
    let (s, r, q, f, g) = (scheduler.clone(), ran.clone(), queued.clone(), refused.clone(), global.clone());
    let id = runtime
        .interrupts()
        .add(5, IrqFlags::empty(), move |ctx| {
            let ((), allocations) = counted(|| {
                for _ in 0..CALLS {
                    let r = r.clone();
                    match s.invoke_next(move || {
                        r.fetch_add(1, Ordering::Relaxed);
                    }) {
                        Ok(()) => q.fetch_add(1, Ordering::Relaxed),
                        Err(Error::OutOfMemory) => f.fetch_add(1, Ordering::Relaxed),
                        Err(err) => panic!("unexpected error from invoke_next: {err}"),
                    };
                }
            });
            g.fetch_add(allocations, Ordering::Relaxed);
            ctx.acknowledge();
            Ok(())
        })
        .unwrap();

    assert_eq!(sim::raise_irq(host.as_ref(), 5).unwrap(), IrqDelivery::Handled);
    assert_eq!(global.load(Ordering::Relaxed), 0);
    assert_eq!(heap.stats().chunks, chunks);
    let queued = queued.load(Ordering::Relaxed);
    assert!(queued > 0);
    assert_eq!(queued + refused.load(Ordering::Relaxed), CALLS);
    assert_eq!(ran.load(Ordering::Relaxed), 0);

    // Back in thread context the queue drains and the heap tops up.
    scheduler.yield_now().unwrap();
    assert_eq!(ran.load(Ordering::Relaxed), queued);
    scheduler.yield_now().unwrap();
    assert!(!heap.maintenance_due());
    assert!(!runtime.interrupt_stack().grow_pending());

    runtime.interrupts().remove(5, id).unwrap();
}

#[test]
fn test_large_allocation_in_irq_fails_without_locking_memory() {
    let (host, runtime) = runtime();
    let heap = runtime.heap().clone();
    let large_blocks = heap.stats().large_blocks;

    let outcome = Arc::new(spin::Mutex::new(None));
    let (h, o) = (heap.clone(), outcome.clone());
    let id = runtime
        .interrupts()
        .add(6, IrqFlags::empty(), move |ctx| {
            let layout = Layout::from_size_align(64 * 1024, 16).unwrap();
            let (result, allocations) = counted(|| h.allocate(layout));
            if let Ok(ptr) = result {
                unsafe { h.deallocate(ptr, layout) };
            }
            *o.lock() = Some((result.err(), allocations));
            ctx.acknowledge();
            Ok(())
        })
        .unwrap();

    assert_eq!(sim::raise_irq(host.as_ref(), 6).unwrap(), IrqDelivery::Handled);
    assert_eq!(*outcome.lock(), Some((Some(Error::OutOfMemory), 0)));
    assert_eq!(heap.stats().large_blocks, large_blocks);

    runtime.interrupts().remove(6, id).unwrap();
}
