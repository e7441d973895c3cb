//! Thread control blocks

use alloc::string::String;
use alloc::sync::Arc;
use core::alloc::Layout;
use core::cell::UnsafeCell;
use core::mem::{align_of, size_of};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use pmrt_api::{Error, FpuState, Result};
use pmrt_memory::{LockedBox, LockedFnOnce, LockedHeap};
use spin::Mutex;

use super::{Scheduler, ThreadError, ThreadExit, ThreadId, ThreadState};
use crate::arch::STACK_ALIGN;
use crate::chain::HandlerChain;
use crate::cpu::{Cpu, MaskGuard};

/// Written to the lowest word of every thread stack
pub(crate) const STACK_CANARY: usize = 0x5afe_57ac;

const fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// The thread's closure, stored above its stack
struct Entry {
    data: NonNull<u8>,
    call: unsafe fn(*mut u8, &Scheduler) -> core::result::Result<(), ThreadError>,
    drop: unsafe fn(*mut u8),
}

unsafe fn call_shim<F>(data: *mut u8, scheduler: &Scheduler) -> core::result::Result<(), ThreadError>
where
    F: FnOnce(&Scheduler) -> core::result::Result<(), ThreadError>,
{
    let f = unsafe { data.cast::<F>().read() };
    f(scheduler)
}

unsafe fn drop_shim<F>(data: *mut u8) {
    unsafe { data.cast::<F>().drop_in_place() };
}

/// Stack region with the entry closure co-located at its top
struct Stack {
    base: NonNull<u8>,
    layout: Layout,
    top: usize,
    heap: Arc<LockedHeap>,
}

impl Stack {
    fn new<F>(heap: &Arc<LockedHeap>, stack_size: usize, f: F) -> Result<(Self, Entry)>
    where
        F: FnOnce(&Scheduler) -> core::result::Result<(), ThreadError>,
    {
        let align = align_of::<F>().max(STACK_ALIGN);
        let stack_part = round_up(stack_size, align);
        let closure_part = round_up(size_of::<F>(), align);
        let layout = Layout::from_size_align(stack_part + closure_part, align)
            .map_err(|_| Error::InvalidArgument("thread stack size"))?;
        let base = heap.allocate(layout)?;
        let top = base.as_ptr() as usize + stack_part;
        unsafe {
            (top as *mut F).write(f);
            base.cast::<usize>().as_ptr().write(STACK_CANARY);
        }
        let entry = Entry {
            data: unsafe { NonNull::new_unchecked(top as *mut u8) },
            call: call_shim::<F>,
            drop: drop_shim::<F>,
        };
        Ok((Self { base, layout, top, heap: heap.clone() }, entry))
    }

    fn canary_intact(&self) -> bool {
        unsafe { self.base.cast::<usize>().as_ptr().read_volatile() == STACK_CANARY }
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe { self.heap.deallocate(self.base, self.layout) };
    }
}

pub(crate) struct ThreadControl {
    id: ThreadId,
    name: Option<String>,
    cpu: Arc<Cpu>,
    scheduler: NonNull<Scheduler>,
    state: AtomicU8,
    started: AtomicBool,
    suspended: AtomicBool,
    aborted: AtomicBool,
    /// Saved stack pointer while switched out
    saved_sp: UnsafeCell<usize>,
    /// Interrupt mask nesting while switched out
    mask_state: UnsafeCell<(usize, bool)>,
    /// Innermost fault recovery point while switched out
    recovery: AtomicUsize,
    stack: Option<Stack>,
    entry: UnsafeCell<Option<Entry>>,
    deferred: UnsafeCell<HandlerChain<LockedFnOnce>>,
    at_exit: UnsafeCell<HandlerChain<LockedFnOnce>>,
    exit: Mutex<Option<ThreadExit>>,
    fpu: LockedBox<FpuState>,
}

// Cells are only touched by the thread itself or with interrupts masked.
unsafe impl Send for ThreadControl {}
unsafe impl Sync for ThreadControl {}

impl ThreadControl {
    /// Control block for the thread already running when the scheduler
    /// starts. It has no stack or entry of its own.
    pub(crate) fn main(cpu: Arc<Cpu>) -> Result<Self> {
        let fpu = cpu.fpu().new_buffer()?;
        let tcb = Self::with_parts(super::MAIN_THREAD_ID, None, cpu, NonNull::dangling(), None, None, fpu);
        tcb.state.store(ThreadState::Running as u8, Ordering::Relaxed);
        tcb.started.store(true, Ordering::Relaxed);
        Ok(tcb)
    }

    pub(crate) fn new<F>(
        id: ThreadId,
        name: Option<String>,
        cpu: Arc<Cpu>,
        scheduler: NonNull<Scheduler>,
        stack_size: usize,
        f: F,
    ) -> Result<Self>
    where
        F: FnOnce(&Scheduler) -> core::result::Result<(), ThreadError> + Send + 'static,
    {
        let fpu = cpu.fpu().new_buffer()?;
        let (stack, entry) = Stack::new(cpu.heap(), stack_size, f)?;
        Ok(Self::with_parts(id, name, cpu, scheduler, Some(stack), Some(entry), fpu))
    }

    fn with_parts(
        id: ThreadId,
        name: Option<String>,
        cpu: Arc<Cpu>,
        scheduler: NonNull<Scheduler>,
        stack: Option<Stack>,
        entry: Option<Entry>,
        fpu: LockedBox<FpuState>,
    ) -> Self {
        Self {
            id,
            name,
            cpu,
            scheduler,
            state: AtomicU8::new(ThreadState::Starting as u8),
            started: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            saved_sp: UnsafeCell::new(0),
            mask_state: UnsafeCell::new((0, false)),
            recovery: AtomicUsize::new(0),
            stack,
            entry: UnsafeCell::new(entry),
            deferred: UnsafeCell::new(HandlerChain::new()),
            at_exit: UnsafeCell::new(HandlerChain::new()),
            exit: Mutex::new(None),
            fpu,
        }
    }

    pub(crate) fn id(&self) -> ThreadId {
        self.id
    }

    pub(crate) fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn scheduler(&self) -> &Scheduler {
        unsafe { self.scheduler.as_ref() }
    }

    pub(crate) fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Marks the thread started; returns `false` if it already was
    pub(crate) fn mark_started(&self) -> bool {
        !self.started.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    pub(crate) fn set_suspended(&self, suspended: bool) {
        self.suspended.store(suspended, Ordering::Release);
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub(crate) fn set_aborted(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    /// Eligible for round-robin selection. Suspension does not hold back
    /// an aborted thread.
    pub(crate) fn is_runnable(&self) -> bool {
        self.is_started() && (!self.is_suspended() || self.is_aborted()) && self.state() != ThreadState::Finished
    }

    pub(crate) fn is_main(&self) -> bool {
        self.id == super::MAIN_THREAD_ID
    }

    // ========================================================================
    // Switch state
    // ========================================================================

    /// Prepares the initial switch frame; `arg` is passed to the entry
    pub(crate) fn prepare(&self, entry: crate::arch::ThreadEntry, arg: usize, mask_state: (usize, bool)) {
        if let Some(stack) = &self.stack {
            unsafe {
                *self.saved_sp.get() = crate::arch::prepare_stack(stack.top, entry, arg);
                *self.mask_state.get() = mask_state;
            }
        }
    }

    pub(crate) fn saved_sp_slot(&self) -> *mut usize {
        self.saved_sp.get()
    }

    pub(crate) fn saved_sp(&self) -> usize {
        unsafe { *self.saved_sp.get() }
    }

    pub(crate) fn save_switch_state(&self, mask_state: (usize, bool), recovery: usize) {
        unsafe { *self.mask_state.get() = mask_state };
        self.recovery.store(recovery, Ordering::Relaxed);
    }

    pub(crate) fn switch_state(&self) -> ((usize, bool), usize) {
        (unsafe { *self.mask_state.get() }, self.recovery.load(Ordering::Relaxed))
    }

    pub(crate) fn canary_intact(&self) -> bool {
        self.stack.as_ref().is_none_or(Stack::canary_intact)
    }

    pub(crate) fn fpu_buffer(&self) -> NonNull<FpuState> {
        LockedBox::as_non_null(&self.fpu)
    }

    // ========================================================================
    // Closures
    // ========================================================================

    /// Runs the entry closure, or reports an abort if it never got to run
    pub(crate) fn run_entry(&self) -> core::result::Result<(), ThreadError> {
        let Some(entry) = (unsafe { (*self.entry.get()).take() }) else {
            return Ok(());
        };
        if self.is_aborted() {
            unsafe { (entry.drop)(entry.data.as_ptr()) };
            return Err(ThreadError::Aborted);
        }
        unsafe { (entry.call)(entry.data.as_ptr(), self.scheduler()) }
    }

    pub(crate) fn push_deferred(&self, _mask: &MaskGuard<'_>, call: LockedFnOnce) -> Result<()> {
        unsafe { &mut *self.deferred.get() }.push_back(self.cpu.heap(), call)
    }

    pub(crate) fn pop_deferred(&self, _mask: &MaskGuard<'_>) -> Option<LockedFnOnce> {
        unsafe { &mut *self.deferred.get() }.pop_front()
    }

    pub(crate) fn push_at_exit(&self, _mask: &MaskGuard<'_>, call: LockedFnOnce) -> Result<()> {
        unsafe { &mut *self.at_exit.get() }.push_front(self.cpu.heap(), call)
    }

    pub(crate) fn pop_at_exit(&self, _mask: &MaskGuard<'_>) -> Option<LockedFnOnce> {
        unsafe { &mut *self.at_exit.get() }.pop_front()
    }

    pub(crate) fn exit(&self) -> Option<ThreadExit> {
        self.exit.lock().clone()
    }

    pub(crate) fn set_exit(&self, exit: ThreadExit) {
        *self.exit.lock() = Some(exit);
    }
}

impl Drop for ThreadControl {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.get_mut().take() {
            unsafe { (entry.drop)(entry.data.as_ptr()) };
        }
        self.cpu.masked(|| self.cpu.fpu().release(LockedBox::as_non_null(&self.fpu)));
    }
}
