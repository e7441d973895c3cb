//! Type-erased closures in locked memory
//!
//! Interrupt handlers and deferred calls are created in ordinary code and
//! later run with interrupts masked or on an interrupt stack. Their captured
//! state therefore has to live in locked memory, which rules out
//! `Box<dyn Fn>`. These wrappers move the closure into a [`LockedHeap`]
//! block and keep a pair of monomorphised shims to call and drop it.

use alloc::sync::Arc;
use core::alloc::Layout;
use core::marker::PhantomData;
use core::ptr::NonNull;

use pmrt_api::Result;

use crate::heap::LockedHeap;

struct Erased {
    data: NonNull<u8>,
    layout: Layout,
    drop: unsafe fn(*mut u8),
    heap: Arc<LockedHeap>,
}

impl Erased {
    fn new<F>(heap: &Arc<LockedHeap>, f: F) -> Result<Self> {
        let layout = Layout::new::<F>();
        let data = heap.allocate(layout)?;
        unsafe { data.cast::<F>().as_ptr().write(f) };
        Ok(Self { data, layout, drop: drop_shim::<F>, heap: heap.clone() })
    }

    /// Releases the block without dropping its contents
    unsafe fn forget_contents(&mut self) {
        self.drop = noop_drop;
    }
}

impl Drop for Erased {
    fn drop(&mut self) {
        unsafe {
            (self.drop)(self.data.as_ptr());
            self.heap.deallocate(self.data, self.layout);
        }
    }
}

unsafe fn drop_shim<F>(data: *mut u8) {
    unsafe { data.cast::<F>().drop_in_place() };
}

unsafe fn noop_drop(_: *mut u8) {}

/// A `FnOnce() + Send` stored in locked memory
pub struct LockedFnOnce {
    erased: Erased,
    call: unsafe fn(*mut u8),
}

unsafe impl Send for LockedFnOnce {}

impl LockedFnOnce {
    pub fn new<F: FnOnce() + Send + 'static>(heap: &Arc<LockedHeap>, f: F) -> Result<Self> {
        unsafe fn call_shim<F: FnOnce()>(data: *mut u8) {
            let f = unsafe { data.cast::<F>().read() };
            f();
        }
        Ok(Self { erased: Erased::new(heap, f)?, call: call_shim::<F> })
    }

    pub fn call(mut self) {
        // The shim moves the closure out; only the block is left to free.
        unsafe {
            self.erased.forget_contents();
            (self.call)(self.erased.data.as_ptr());
        }
    }
}

/// A shareable `Fn(&mut A) -> R` stored in locked memory
pub struct LockedFn<A: ?Sized, R> {
    erased: Erased,
    call: unsafe fn(*const u8, &mut A) -> R,
    _marker: PhantomData<fn(&mut A) -> R>,
}

unsafe impl<A: ?Sized, R> Send for LockedFn<A, R> {}
unsafe impl<A: ?Sized, R> Sync for LockedFn<A, R> {}

impl<A: ?Sized, R> LockedFn<A, R> {
    pub fn new<F>(heap: &Arc<LockedHeap>, f: F) -> Result<Self>
    where
        F: Fn(&mut A) -> R + Send + Sync + 'static,
    {
        unsafe fn call_shim<F: Fn(&mut A) -> R, A: ?Sized, R>(data: *const u8, arg: &mut A) -> R {
            unsafe { (*data.cast::<F>())(arg) }
        }
        Ok(Self {
            erased: Erased::new(heap, f)?,
            call: call_shim::<F, A, R>,
            _marker: PhantomData,
        })
    }

    pub fn call(&self, arg: &mut A) -> R {
        unsafe { (self.call)(self.erased.data.as_ptr(), arg) }
    }
}
