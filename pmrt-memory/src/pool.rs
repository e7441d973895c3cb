//! Fixed-size block pools
//!
//! A pool carves one locked chunk into equally sized blocks chained through
//! an intrusive free list. Allocation and release are O(1) and never touch
//! the host, which makes pools usable from interrupt context.

use core::ptr::{self, NonNull};

/// Memory pool statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Total number of blocks in the pool.
    pub total_blocks: usize,
    /// Number of blocks currently in use.
    pub used_blocks: usize,
    /// Total size of the pool in bytes.
    pub pool_size: usize,
}

/// A memory pool for fixed-size blocks
pub struct MemoryPool {
    /// Base address of the pool
    base: NonNull<u8>,
    /// Block size (rounded up to the alignment)
    block_size: usize,
    /// Total number of blocks in the pool
    total_blocks: usize,
    /// Number of used blocks
    used_blocks: usize,
    /// Head of the free list
    free_list: *mut u8,
}

impl MemoryPool {
    /// Create a new memory pool over `size` bytes at `base`.
    ///
    /// # Safety
    ///
    /// - `base` must point to `size` bytes of valid, writable memory that
    ///   nothing else accesses while the pool is alive
    /// - `base` must be aligned to `alignment`
    /// - `alignment` must be a power of two no smaller than a pointer
    pub unsafe fn new(base: NonNull<u8>, size: usize, block_size: usize, alignment: usize) -> Option<Self> {
        debug_assert!(alignment.is_power_of_two());
        let block_size = block_size.max(core::mem::size_of::<*mut u8>());
        let aligned_block_size = (block_size + alignment - 1) & !(alignment - 1);

        let max_blocks = size / aligned_block_size;
        if max_blocks == 0 {
            return None;
        }

        // Chain all blocks together, lowest address first.
        let mut free_list = ptr::null_mut();
        for i in (0..max_blocks).rev() {
            unsafe {
                let block = base.as_ptr().add(i * aligned_block_size);
                (block as *mut *mut u8).write(free_list);
                free_list = block;
            }
        }

        Some(Self {
            base,
            block_size: aligned_block_size,
            total_blocks: max_blocks,
            used_blocks: 0,
            free_list,
        })
    }

    /// Take one block, or `None` if the pool is exhausted
    pub fn alloc(&mut self) -> Option<NonNull<u8>> {
        let block = NonNull::new(self.free_list)?;
        unsafe {
            self.free_list = (block.as_ptr() as *mut *mut u8).read();
        }
        self.used_blocks += 1;
        Some(block)
    }

    /// Return a block to the pool.
    ///
    /// Returns `false` (and does nothing) if `ptr` is not a block of this pool.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`alloc`](Self::alloc) on this pool
    /// and not released since.
    pub unsafe fn dealloc(&mut self, ptr: NonNull<u8>) -> bool {
        if !self.contains(ptr) {
            return false;
        }
        unsafe {
            (ptr.as_ptr() as *mut *mut u8).write(self.free_list);
        }
        self.free_list = ptr.as_ptr();
        self.used_blocks = self.used_blocks.saturating_sub(1);
        true
    }

    /// Whether `ptr` is the start of one of this pool's blocks
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;
        let base = self.base.as_ptr() as usize;
        addr >= base
            && addr < base + self.total_blocks * self.block_size
            && (addr - base) % self.block_size == 0
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            total_blocks: self.total_blocks,
            used_blocks: self.used_blocks,
            pool_size: self.total_blocks * self.block_size,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn free_blocks(&self) -> usize {
        self.total_blocks - self.used_blocks
    }

    pub fn is_empty(&self) -> bool {
        self.used_blocks == 0
    }

    pub fn is_full(&self) -> bool {
        self.used_blocks == self.total_blocks
    }
}

// The pool only hands out raw blocks; ownership rules are the caller's.
unsafe impl Send for MemoryPool {}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[repr(align(64))]
    struct Arena([u8; 1024]);

    #[test]
    fn test_pool_exhaustion_and_reuse() {
        let mut arena = Arena([0; 1024]);
        let base = NonNull::new(arena.0.as_mut_ptr()).unwrap();
        let mut pool = unsafe { MemoryPool::new(base, 1024, 100, 64) }.unwrap();
        assert_eq!(pool.block_size(), 128);
        assert_eq!(pool.stats().total_blocks, 8);

        let mut blocks = vec![];
        while let Some(block) = pool.alloc() {
            blocks.push(block);
        }
        assert_eq!(blocks.len(), 8);
        assert!(pool.is_full());

        let last = blocks.pop().unwrap();
        assert!(unsafe { pool.dealloc(last) });
        assert_eq!(pool.alloc(), Some(last));
    }

    #[test]
    fn test_foreign_pointer_rejected() {
        let mut arena = Arena([0; 1024]);
        let base = NonNull::new(arena.0.as_mut_ptr()).unwrap();
        let mut pool = unsafe { MemoryPool::new(base, 1024, 64, 64) }.unwrap();
        let block = pool.alloc().unwrap();
        let inside = NonNull::new(unsafe { block.as_ptr().add(8) }).unwrap();
        assert!(!unsafe { pool.dealloc(inside) });
        assert!(unsafe { pool.dealloc(block) });
        assert!(pool.is_empty());
    }
}
