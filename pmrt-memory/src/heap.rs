//! Locked heap
//!
//! Every byte handed out by [`LockedHeap`] lives in a region the host has
//! been asked to keep resident, so it can be touched with interrupts masked
//! and from interrupt or fault context without risking a page fault.
//!
//! Small requests are served from power-of-two size classes, each backed by
//! a list of locked chunks carved up by a [`MemoryPool`]. Anything larger
//! than the biggest class gets a dedicated locked region. Chunks are kept
//! for the lifetime of the heap so steady-state allocation never calls the
//! host.
//!
//! New chunks come from the global allocator, which is neither resident
//! nor reentrant. Between [`LockedHeap::enter_atomic`] and
//! [`LockedHeap::leave_atomic`] (interrupt and exception dispatch) the heap
//! therefore only hands out blocks of existing chunks and fails with
//! [`Error::OutOfMemory`] otherwise. Classes that ran low there are topped
//! up, and large regions freed there are released, by the next
//! [`LockedHeap::maintain`] from thread context.

use alloc::alloc::{alloc, dealloc};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::alloc::Layout;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use log::{debug, error};
use pmrt_api::{Error, Host, Result};
use spin::Mutex;

use crate::pool::MemoryPool;

/// Smallest block handed out
pub const MIN_BLOCK_SIZE: usize = 16;
/// Largest request served from a size class
pub const MAX_CLASS_SIZE: usize = 4096;
/// Bytes locked at a time for a size class
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Free blocks below which a class is topped up by [`LockedHeap::maintain`]
const LOW_WATER_BLOCKS: usize = 16;

const CLASS_COUNT: usize = (MAX_CLASS_SIZE.trailing_zeros() - MIN_BLOCK_SIZE.trailing_zeros() + 1) as usize;

static_assertions::const_assert!(MAX_CLASS_SIZE.is_power_of_two());
static_assertions::const_assert!(CHUNK_SIZE % MAX_CLASS_SIZE == 0);

/// Heap usage counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes currently handed out (rounded up to block sizes)
    pub in_use: usize,
    /// Highest value `in_use` has reached
    pub high_water: usize,
    /// Locked chunks backing the size classes
    pub chunks: usize,
    /// Dedicated regions for large blocks
    pub large_blocks: usize,
    /// Total bytes locked with the host
    pub locked_bytes: usize,
}

struct Chunk {
    base: NonNull<u8>,
    layout: Layout,
    pool: MemoryPool,
}

struct LargeBlock {
    base: NonNull<u8>,
    layout: Layout,
    /// Freed in atomic context, region not yet returned
    released: bool,
}

struct HeapInner {
    classes: [Vec<Chunk>; CLASS_COUNT],
    large: Vec<LargeBlock>,
    /// Bit per class that ran low in atomic context
    starved: u32,
    stats: HeapStats,
}

// Raw chunk pointers are owned by the heap and only touched under its lock.
unsafe impl Send for HeapInner {}

impl HeapInner {
    fn account_alloc(&mut self, bytes: usize) {
        self.stats.in_use += bytes;
        self.stats.high_water = self.stats.high_water.max(self.stats.in_use);
    }

    fn free_blocks(&self, class: usize) -> usize {
        self.classes[class].iter().map(|chunk| chunk.pool.free_blocks()).sum()
    }
}

/// Disables interrupts for the lifetime of the guard, restoring the
/// previous state on drop.
pub struct IrqSave<'a> {
    host: &'a dyn Host,
    was_enabled: bool,
}

impl<'a> IrqSave<'a> {
    pub fn new(host: &'a dyn Host) -> Self {
        let was_enabled = host.disable_interrupts();
        Self { host, was_enabled }
    }
}

impl Drop for IrqSave<'_> {
    fn drop(&mut self) {
        if self.was_enabled {
            self.host.enable_interrupts();
        }
    }
}

/// Allocator of host-locked memory
pub struct LockedHeap {
    host: Arc<dyn Host>,
    inner: Mutex<HeapInner>,
    /// Nesting of interrupt and exception dispatch
    atomic: AtomicUsize,
    maintenance_due: AtomicBool,
}

impl LockedHeap {
    pub fn new(host: Arc<dyn Host>) -> Self {
        Self {
            host,
            inner: Mutex::new(HeapInner {
                classes: core::array::from_fn(|_| Vec::new()),
                large: Vec::new(),
                starved: 0,
                stats: HeapStats::default(),
            }),
            atomic: AtomicUsize::new(0),
            maintenance_due: AtomicBool::new(false),
        }
    }

    pub fn host(&self) -> &Arc<dyn Host> {
        &self.host
    }

    /// Marks the start of interrupt or exception dispatch. Until the
    /// matching [`leave_atomic`](Self::leave_atomic) no new memory is
    /// obtained from the global allocator.
    pub fn enter_atomic(&self) {
        self.atomic.fetch_add(1, Ordering::Relaxed);
    }

    pub fn leave_atomic(&self) {
        self.atomic.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn in_atomic(&self) -> bool {
        self.atomic.load(Ordering::Relaxed) != 0
    }

    /// Whether [`maintain`](Self::maintain) has work to do
    pub fn maintenance_due(&self) -> bool {
        self.maintenance_due.load(Ordering::Acquire)
    }

    /// Size class index serving `layout`, or `None` for large blocks
    fn class_of(layout: &Layout) -> Option<usize> {
        let size = layout.size().max(layout.align()).max(MIN_BLOCK_SIZE).next_power_of_two();
        if size > MAX_CLASS_SIZE {
            return None;
        }
        Some((size.trailing_zeros() - MIN_BLOCK_SIZE.trailing_zeros()) as usize)
    }

    const fn class_size(class: usize) -> usize {
        MIN_BLOCK_SIZE << class
    }

    /// Obtains `layout` bytes of ordinary memory and locks them
    fn lock_new_region(&self, layout: Layout) -> Result<NonNull<u8>> {
        let base = NonNull::new(unsafe { alloc(layout) }).ok_or(Error::OutOfMemory)?;
        if let Err(err) = self.host.lock_region(base.as_ptr() as usize, layout.size()) {
            error!(target: "pmrt::memory", "failed to lock {} bytes: {}", layout.size(), err);
            unsafe { dealloc(base.as_ptr(), layout) };
            return Err(err.into());
        }
        Ok(base)
    }

    fn release_region(&self, base: NonNull<u8>, layout: Layout) {
        if let Err(err) = self.host.unlock_region(base.as_ptr() as usize, layout.size()) {
            error!(target: "pmrt::memory", "failed to unlock region at {:p}: {}", base, err);
        }
        unsafe { dealloc(base.as_ptr(), layout) };
    }

    /// Locks a fresh chunk for `class` and adds it to the class
    fn add_chunk(&self, inner: &mut HeapInner, class: usize) -> Result<()> {
        let block_size = Self::class_size(class);
        let chunk_layout =
            Layout::from_size_align(CHUNK_SIZE, block_size).map_err(|_| Error::InvalidArgument("chunk layout"))?;
        let base = self.lock_new_region(chunk_layout)?;
        let Some(pool) = (unsafe { MemoryPool::new(base, CHUNK_SIZE, block_size, block_size) }) else {
            self.release_region(base, chunk_layout);
            return Err(Error::OutOfMemory);
        };
        inner.classes[class].push(Chunk { base, layout: chunk_layout, pool });
        inner.stats.chunks += 1;
        inner.stats.locked_bytes += CHUNK_SIZE;
        debug!(target: "pmrt::memory", "new {}-byte class chunk at {:p}", block_size, base);
        Ok(())
    }

    fn mark_starved(&self, inner: &mut HeapInner, class: usize) {
        inner.starved |= 1 << class;
        self.maintenance_due.store(true, Ordering::Release);
    }

    /// Allocates a block of locked memory.
    ///
    /// Zero-sized requests return a dangling, well-aligned pointer. In
    /// atomic context only free blocks of existing chunks are used.
    pub fn allocate(&self, layout: Layout) -> Result<NonNull<u8>> {
        if layout.size() == 0 {
            return Ok(dangling(layout));
        }
        let _irq = IrqSave::new(&*self.host);
        let mut inner = self.inner.lock();
        let atomic = self.in_atomic();

        let Some(class) = Self::class_of(&layout) else {
            if atomic {
                error!(target: "pmrt::memory", "{}-byte region requested in interrupt context", layout.size());
                return Err(Error::OutOfMemory);
            }
            let base = self.lock_new_region(layout)?;
            inner.large.push(LargeBlock { base, layout, released: false });
            inner.stats.large_blocks += 1;
            inner.stats.locked_bytes += layout.size();
            inner.account_alloc(layout.size());
            return Ok(base);
        };

        let found = inner.classes[class].iter_mut().find_map(|chunk| chunk.pool.alloc());
        let block = match found {
            Some(block) => block,
            None if atomic => {
                self.mark_starved(&mut inner, class);
                error!(
                    target: "pmrt::memory",
                    "{}-byte class exhausted in interrupt context",
                    Self::class_size(class)
                );
                return Err(Error::OutOfMemory);
            }
            None => {
                self.add_chunk(&mut inner, class)?;
                inner.classes[class]
                    .last_mut()
                    .and_then(|chunk| chunk.pool.alloc())
                    .ok_or(Error::OutOfMemory)?
            }
        };
        if atomic && inner.free_blocks(class) < LOW_WATER_BLOCKS {
            self.mark_starved(&mut inner, class);
        }
        inner.account_alloc(Self::class_size(class));
        Ok(block)
    }

    /// Makes sure at least `blocks` blocks able to hold `layout` are free,
    /// so that interrupt context can allocate them. Must be called from
    /// thread context.
    pub fn reserve(&self, layout: Layout, blocks: usize) -> Result<()> {
        if self.in_atomic() {
            return Err(Error::InvalidState("heap reservation in interrupt context"));
        }
        let class = Self::class_of(&layout).ok_or(Error::InvalidArgument("reservation larger than a size class"))?;
        let _irq = IrqSave::new(&*self.host);
        let mut inner = self.inner.lock();
        while inner.free_blocks(class) < blocks {
            self.add_chunk(&mut inner, class)?;
        }
        Ok(())
    }

    /// Tops up the classes that ran low in atomic context and releases the
    /// large regions freed there. Must be called from thread context.
    pub fn maintain(&self) -> Result<()> {
        if self.in_atomic() {
            return Err(Error::InvalidState("heap maintenance in interrupt context"));
        }
        if !self.maintenance_due.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let released = {
            let _irq = IrqSave::new(&*self.host);
            let mut inner = self.inner.lock();
            let starved = core::mem::take(&mut inner.starved);
            for class in (0..CLASS_COUNT).filter(|class| starved & (1 << class) != 0) {
                while inner.free_blocks(class) < LOW_WATER_BLOCKS {
                    if let Err(err) = self.add_chunk(&mut inner, class) {
                        inner.starved |= starved;
                        self.maintenance_due.store(true, Ordering::Release);
                        return Err(err);
                    }
                }
            }
            let mut released = Vec::new();
            inner.large.retain(|block| {
                if block.released {
                    released.push((block.base, block.layout));
                }
                !block.released
            });
            inner.stats.locked_bytes -= released.iter().map(|(_, layout)| layout.size()).sum::<usize>();
            released
        };
        for (base, layout) in released {
            self.release_region(base, layout);
        }
        Ok(())
    }

    /// Returns a block obtained from [`allocate`](Self::allocate).
    ///
    /// # Safety
    ///
    /// `ptr` must have been allocated by this heap with the same `layout` and
    /// must not be used afterwards.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() == 0 {
            return;
        }
        let _irq = IrqSave::new(&*self.host);
        let mut inner = self.inner.lock();

        match Self::class_of(&layout) {
            Some(class) => {
                let released = inner.classes[class]
                    .iter_mut()
                    .any(|chunk| unsafe { chunk.pool.dealloc(ptr) });
                if released {
                    inner.stats.in_use -= Self::class_size(class);
                } else {
                    error!(target: "pmrt::memory", "deallocating foreign block {:p}", ptr);
                }
            }
            None => match inner.large.iter().position(|b| b.base == ptr && !b.released) {
                Some(pos) if self.in_atomic() => {
                    let size = inner.large[pos].layout.size();
                    inner.large[pos].released = true;
                    inner.stats.large_blocks -= 1;
                    inner.stats.in_use -= size;
                    self.maintenance_due.store(true, Ordering::Release);
                }
                Some(pos) => {
                    let block = inner.large.swap_remove(pos);
                    inner.stats.large_blocks -= 1;
                    inner.stats.locked_bytes -= block.layout.size();
                    inner.stats.in_use -= block.layout.size();
                    drop(inner);
                    self.release_region(block.base, block.layout);
                }
                None => error!(target: "pmrt::memory", "deallocating unknown large block {:p}", ptr),
            },
        }
    }

    /// Grows a block to `new_size` bytes, keeping its contents.
    ///
    /// Fails with [`Error::OutOfMemory`] if no locked memory is available;
    /// the original block is untouched in that case.
    ///
    /// # Safety
    ///
    /// Same as [`deallocate`](Self::deallocate) for `ptr` and `layout`.
    pub unsafe fn grow(&self, ptr: NonNull<u8>, layout: Layout, new_size: usize) -> Result<NonNull<u8>> {
        if new_size < layout.size() {
            return Err(Error::InvalidArgument("grow to a smaller size"));
        }
        unsafe { self.resize(ptr, layout, new_size) }
    }

    /// Shrinks a block to `new_size` bytes, keeping the leading contents.
    ///
    /// # Safety
    ///
    /// Same as [`deallocate`](Self::deallocate) for `ptr` and `layout`.
    pub unsafe fn shrink(&self, ptr: NonNull<u8>, layout: Layout, new_size: usize) -> Result<NonNull<u8>> {
        if new_size > layout.size() {
            return Err(Error::InvalidArgument("shrink to a larger size"));
        }
        unsafe { self.resize(ptr, layout, new_size) }
    }

    unsafe fn resize(&self, ptr: NonNull<u8>, layout: Layout, new_size: usize) -> Result<NonNull<u8>> {
        let new_layout = Layout::from_size_align(new_size, layout.align())
            .map_err(|_| Error::InvalidArgument("resize layout"))?;
        if layout.size() != 0 && new_size != 0 {
            if let (Some(old), Some(new)) = (Self::class_of(&layout), Self::class_of(&new_layout)) {
                if old == new {
                    return Ok(ptr);
                }
            }
        }
        let new_ptr = self.allocate(new_layout)?;
        unsafe {
            ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), layout.size().min(new_size));
            self.deallocate(ptr, layout);
        }
        Ok(new_ptr)
    }

    pub fn stats(&self) -> HeapStats {
        let _irq = IrqSave::new(&*self.host);
        self.inner.lock().stats
    }
}

impl Drop for LockedHeap {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if inner.stats.in_use != 0 {
            error!(target: "pmrt::memory", "locked heap dropped with {} bytes in use", inner.stats.in_use);
        }
        let chunks: Vec<Chunk> = inner.classes.iter_mut().flat_map(|c| c.drain(..)).collect();
        let large: Vec<LargeBlock> = inner.large.drain(..).collect();
        for chunk in chunks {
            self.release_region(chunk.base, chunk.layout);
        }
        for block in large {
            self.release_region(block.base, block.layout);
        }
    }
}

fn dangling(layout: Layout) -> NonNull<u8> {
    // A non-zero address equal to the alignment is always suitably aligned.
    NonNull::new(layout.align() as *mut u8).unwrap_or(NonNull::dangling())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmrt_api::sim::SimulatedHost;
    use pmrt_api::HostCall;

    fn heap() -> (Arc<SimulatedHost>, LockedHeap) {
        let host = Arc::new(SimulatedHost::new());
        (host.clone(), LockedHeap::new(host))
    }

    #[test]
    fn test_small_blocks_share_a_chunk() {
        let (host, heap) = heap();
        let a = heap.allocate(Layout::from_size_align(24, 8).unwrap()).unwrap();
        let b = heap.allocate(Layout::from_size_align(30, 8).unwrap()).unwrap();
        assert_ne!(a, b);
        assert_eq!(heap.stats().chunks, 1);
        assert_eq!(heap.stats().in_use, 64);
        assert_eq!(host.locked_bytes(), CHUNK_SIZE);
        unsafe {
            heap.deallocate(a, Layout::from_size_align(24, 8).unwrap());
            heap.deallocate(b, Layout::from_size_align(30, 8).unwrap());
        }
        assert_eq!(heap.stats().in_use, 0);
    }

    #[test]
    fn test_large_block_gets_its_own_region() {
        let (host, heap) = heap();
        let layout = Layout::from_size_align(20_000, 16).unwrap();
        let block = heap.allocate(layout).unwrap();
        assert_eq!(heap.stats().large_blocks, 1);
        assert_eq!(host.locked_bytes(), 20_000);
        unsafe { heap.deallocate(block, layout) };
        assert_eq!(host.locked_bytes(), 0);
    }

    #[test]
    fn test_lock_failure_reports_host_error() {
        let (host, heap) = heap();
        host.fail_next(HostCall::LockRegion, 0x8013);
        let err = heap.allocate(Layout::from_size_align(64, 8).unwrap()).unwrap_err();
        assert!(matches!(err, Error::Host(e) if e.code == 0x8013));
        assert_eq!(heap.stats().chunks, 0);
    }

    #[test]
    fn test_alignment_is_honoured() {
        let (_host, heap) = heap();
        let layout = Layout::from_size_align(8, 256).unwrap();
        let block = heap.allocate(layout).unwrap();
        assert_eq!(block.as_ptr() as usize % 256, 0);
        unsafe { heap.deallocate(block, layout) };
    }

    #[test]
    fn test_interrupt_state_is_preserved() {
        let (host, heap) = heap();
        host.disable_interrupts();
        let layout = Layout::new::<u64>();
        let block = heap.allocate(layout).unwrap();
        assert!(!host.interrupts_enabled());
        unsafe { heap.deallocate(block, layout) };
        host.enable_interrupts();
        let _ = heap.stats();
        assert!(host.interrupts_enabled());
    }

    #[test]
    fn test_drop_unlocks_everything() {
        let host = Arc::new(SimulatedHost::new());
        {
            let heap = LockedHeap::new(host.clone());
            let layout = Layout::from_size_align(128, 8).unwrap();
            let block = heap.allocate(layout).unwrap();
            unsafe { heap.deallocate(block, layout) };
            assert_eq!(host.locked_bytes(), CHUNK_SIZE);
        }
        assert_eq!(host.locked_bytes(), 0);
    }

    #[test]
    fn test_atomic_context_never_locks_new_memory() {
        let (host, heap) = heap();
        let layout = Layout::from_size_align(64, 8).unwrap();
        heap.reserve(layout, 4).unwrap();
        let chunks = heap.stats().chunks;
        let locked = host.locked_bytes();

        heap.enter_atomic();
        let mut blocks = Vec::new();
        let err = loop {
            match heap.allocate(layout) {
                Ok(block) => blocks.push(block),
                Err(err) => break err,
            }
        };
        assert_eq!(err, Error::OutOfMemory);
        assert_eq!(blocks.len(), CHUNK_SIZE / 64);
        assert_eq!(heap.allocate(Layout::from_size_align(8192, 8).unwrap()), Err(Error::OutOfMemory));
        assert_eq!(heap.maintain(), Err(Error::InvalidState("heap maintenance in interrupt context")));
        heap.leave_atomic();

        assert_eq!(heap.stats().chunks, chunks);
        assert_eq!(host.locked_bytes(), locked);
        assert!(heap.maintenance_due());
        heap.maintain().unwrap();
        assert!(!heap.maintenance_due());
        assert_eq!(heap.stats().chunks, chunks + 1);

        heap.enter_atomic();
        let more = heap.allocate(layout).unwrap();
        heap.leave_atomic();
        blocks.push(more);
        for block in blocks {
            unsafe { heap.deallocate(block, layout) };
        }
        assert_eq!(heap.stats().in_use, 0);
    }

    #[test]
    fn test_large_block_freed_in_atomic_context_is_released_later() {
        let (host, heap) = heap();
        let layout = Layout::from_size_align(20_000, 16).unwrap();
        let block = heap.allocate(layout).unwrap();

        heap.enter_atomic();
        unsafe { heap.deallocate(block, layout) };
        heap.leave_atomic();
        assert_eq!(heap.stats().in_use, 0);
        assert_eq!(host.locked_bytes(), 20_000);

        heap.maintain().unwrap();
        assert_eq!(host.locked_bytes(), 0);
        assert_eq!(heap.stats().locked_bytes, 0);
    }
}
