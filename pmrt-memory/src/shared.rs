//! Shared ownership in locked memory

use alloc::sync::Arc;
use core::alloc::Layout;
use core::fmt;
use core::marker::PhantomData;
use core::ops::Deref;
use core::ptr::NonNull;
use core::sync::atomic::{self, AtomicUsize, Ordering};

use pmrt_api::Result;

use crate::heap::LockedHeap;

struct Inner<T> {
    count: AtomicUsize,
    heap: Arc<LockedHeap>,
    value: T,
}

/// An `Arc` whose allocation, reference count included, comes from a
/// [`LockedHeap`]. The last reference drops the value and returns the
/// block to its pool.
pub struct LockedArc<T> {
    ptr: NonNull<Inner<T>>,
    _marker: PhantomData<Inner<T>>,
}

unsafe impl<T: Send + Sync> Send for LockedArc<T> {}
unsafe impl<T: Send + Sync> Sync for LockedArc<T> {}

impl<T> LockedArc<T> {
    pub fn new(heap: &Arc<LockedHeap>, value: T) -> Result<Self> {
        let ptr = heap.allocate(Layout::new::<Inner<T>>())?.cast::<Inner<T>>();
        let inner = Inner { count: AtomicUsize::new(1), heap: heap.clone(), value };
        unsafe { ptr.as_ptr().write(inner) };
        Ok(Self { ptr, _marker: PhantomData })
    }

    fn inner(&self) -> &Inner<T> {
        unsafe { self.ptr.as_ref() }
    }

    /// Stable address of the shared value
    pub fn as_ptr(this: &Self) -> *const T {
        unsafe { &raw const (*this.ptr.as_ptr()).value }
    }

    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        this.ptr == other.ptr
    }

    pub fn strong_count(this: &Self) -> usize {
        this.inner().count.load(Ordering::Acquire)
    }
}

impl<T> Clone for LockedArc<T> {
    fn clone(&self) -> Self {
        self.inner().count.fetch_add(1, Ordering::Relaxed);
        Self { ptr: self.ptr, _marker: PhantomData }
    }
}

impl<T> Deref for LockedArc<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner().value
    }
}

impl<T> Drop for LockedArc<T> {
    fn drop(&mut self) {
        if self.inner().count.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        atomic::fence(Ordering::Acquire);
        unsafe {
            let inner = self.ptr.as_ptr();
            let heap = core::ptr::read(&raw const (*inner).heap);
            (&raw mut (*inner).value).drop_in_place();
            heap.deallocate(self.ptr.cast(), Layout::new::<Inner<T>>());
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for LockedArc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmrt_api::sim::SimulatedHost;

    #[test]
    fn test_last_reference_frees_block() {
        let heap = Arc::new(LockedHeap::new(Arc::new(SimulatedHost::new())));
        let marker = Arc::new(());
        let a = LockedArc::new(&heap, marker.clone()).unwrap();
        let b = a.clone();
        assert_eq!(LockedArc::strong_count(&a), 2);
        assert!(LockedArc::ptr_eq(&a, &b));
        assert_eq!(LockedArc::as_ptr(&a), LockedArc::as_ptr(&b));
        drop(a);
        assert!(heap.stats().in_use > 0);
        drop(b);
        assert_eq!(heap.stats().in_use, 0);
        assert_eq!(Arc::strong_count(&marker), 1);
    }
}
