//! Owned values in locked memory

use alloc::sync::Arc;
use core::alloc::Layout;
use core::fmt;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;

use pmrt_api::Result;

use crate::heap::LockedHeap;

/// A `Box` whose allocation comes from a [`LockedHeap`]
pub struct LockedBox<T> {
    ptr: NonNull<T>,
    heap: Arc<LockedHeap>,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for LockedBox<T> {}
unsafe impl<T: Sync> Sync for LockedBox<T> {}

impl<T> LockedBox<T> {
    pub fn new(heap: &Arc<LockedHeap>, value: T) -> Result<Self> {
        let ptr = heap.allocate(Layout::new::<T>())?.cast::<T>();
        unsafe { ptr.as_ptr().write(value) };
        Ok(Self { ptr, heap: heap.clone(), _marker: PhantomData })
    }

    /// Stable address of the contained value
    pub fn as_ptr(this: &Self) -> *mut T {
        this.ptr.as_ptr()
    }

    /// The contained value as a raw pointer that may be written through
    pub fn as_non_null(this: &Self) -> NonNull<T> {
        this.ptr
    }

    /// Moves the value out, releasing the locked block
    pub fn into_inner(this: Self) -> T {
        let this = core::mem::ManuallyDrop::new(this);
        unsafe {
            let value = this.ptr.as_ptr().read();
            this.heap.deallocate(this.ptr.cast(), Layout::new::<T>());
            drop(core::ptr::read(&this.heap));
            value
        }
    }
}

impl<T> Deref for LockedBox<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> DerefMut for LockedBox<T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { self.ptr.as_mut() }
    }
}

impl<T> Drop for LockedBox<T> {
    fn drop(&mut self) {
        unsafe {
            self.ptr.as_ptr().drop_in_place();
            self.heap.deallocate(self.ptr.cast(), Layout::new::<T>());
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for LockedBox<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
