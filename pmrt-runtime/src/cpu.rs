//! Processor state shared by every runtime component
//!
//! There is exactly one instruction stream. [`Cpu`] holds what belongs to it
//! rather than to any one component: the host handle, the interrupt mask
//! nesting counter, the interrupt nesting depth, the identity of the running
//! thread, its innermost fault recovery point and the FPU switch.
//!
//! Work that may not happen in interrupt context (locking new memory,
//! growing the interrupt stack pool) is only flagged there and carried out
//! by [`Cpu::maintain`] on the next yield.

use alloc::sync::Arc;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use log::error;
use pmrt_api::{Error, Host};
use pmrt_memory::LockedHeap;
use spin::Once;

use crate::fpu::FpuSwitch;
use crate::interrupt::InterruptStack;

pub struct Cpu {
    host: Arc<dyn Host>,
    heap: Arc<LockedHeap>,
    /// Mask nesting depth
    noff: AtomicUsize,
    /// Were interrupts enabled before the outermost mask?
    intena: AtomicBool,
    /// Interrupt and exception nesting depth
    interrupt_depth: AtomicUsize,
    /// Id of the thread owning the instruction stream outside interrupts
    current_thread: AtomicUsize,
    /// Innermost fault recovery point of the running thread
    recovery: AtomicUsize,
    debug: AtomicBool,
    fpu: FpuSwitch,
    interrupt_stack: Once<Arc<InterruptStack>>,
}

impl Cpu {
    pub fn new(host: Arc<dyn Host>, heap: Arc<LockedHeap>, lazy_fpu: bool, debug: bool) -> pmrt_api::Result<Self> {
        let fpu = FpuSwitch::new(host.clone(), heap.clone(), lazy_fpu)?;
        Ok(Self {
            host,
            heap,
            noff: AtomicUsize::new(0),
            intena: AtomicBool::new(false),
            interrupt_depth: AtomicUsize::new(0),
            current_thread: AtomicUsize::new(crate::thread::MAIN_THREAD_ID.as_raw()),
            recovery: AtomicUsize::new(0),
            debug: AtomicBool::new(debug),
            fpu,
            interrupt_stack: Once::new(),
        })
    }

    pub fn host(&self) -> &dyn Host {
        &*self.host
    }

    pub fn host_arc(&self) -> &Arc<dyn Host> {
        &self.host
    }

    pub fn heap(&self) -> &Arc<LockedHeap> {
        &self.heap
    }

    pub fn fpu(&self) -> &FpuSwitch {
        &self.fpu
    }

    // ========================================================================
    // Interrupt masking
    // ========================================================================

    /// Disable interrupts, remembering the previous state at the outermost level
    pub fn push_off(&self) {
        let old = self.host.disable_interrupts();
        if self.noff.load(Ordering::Relaxed) == 0 {
            self.intena.store(old, Ordering::Relaxed);
        }
        self.noff.fetch_add(1, Ordering::Relaxed);
    }

    /// Re-enable interrupts if we've popped all push_off calls
    pub fn pop_off(&self) {
        debug_assert!(!self.host.interrupts_enabled(), "pop_off: interrupts enabled");
        let noff = self.noff.load(Ordering::Relaxed);
        if noff == 0 {
            error!(target: "pmrt", "pop_off without matching push_off");
            panic!("pop_off: noff < 1");
        }
        self.noff.store(noff - 1, Ordering::Relaxed);
        if noff == 1 && self.intena.load(Ordering::Relaxed) {
            self.host.enable_interrupts();
        }
    }

    /// Masks interrupts until the returned guard is dropped
    pub fn mask(&self) -> MaskGuard<'_> {
        self.push_off();
        MaskGuard { cpu: self, _not_send: PhantomData }
    }

    /// Runs `f` with interrupts masked
    pub fn masked<R>(&self, f: impl FnOnce() -> R) -> R {
        let _mask = self.mask();
        f()
    }

    pub fn mask_depth(&self) -> usize {
        self.noff.load(Ordering::Relaxed)
    }

    /// Mask nesting of the running thread, saved across a thread switch
    pub(crate) fn mask_state(&self) -> (usize, bool) {
        (self.noff.load(Ordering::Relaxed), self.intena.load(Ordering::Relaxed))
    }

    pub(crate) fn set_mask_state(&self, (noff, intena): (usize, bool)) {
        self.noff.store(noff, Ordering::Relaxed);
        self.intena.store(intena, Ordering::Relaxed);
    }

    /// Unwinds the mask nesting to `depth` after control skipped the
    /// matching `pop_off` calls.
    pub(crate) fn restore_mask_depth(&self, depth: usize) {
        while self.mask_depth() > depth {
            self.pop_off();
        }
    }

    // ========================================================================
    // Interrupt context
    // ========================================================================

    pub fn in_interrupt(&self) -> bool {
        self.interrupt_depth.load(Ordering::Relaxed) != 0
    }

    pub fn interrupt_depth(&self) -> usize {
        self.interrupt_depth.load(Ordering::Relaxed)
    }

    /// Brackets the start of an interrupt or exception dispatch
    pub(crate) fn enter_interrupt(&self) {
        self.heap.enter_atomic();
        self.interrupt_depth.fetch_add(1, Ordering::Relaxed);
        self.fpu.enter();
    }

    pub(crate) fn leave_interrupt(&self) {
        self.fpu.leave();
        self.interrupt_depth.fetch_sub(1, Ordering::Relaxed);
        self.heap.leave_atomic();
    }

    /// Registers the pool whose growth [`maintain`](Self::maintain) performs
    pub(crate) fn attach_interrupt_stack(&self, stack: Arc<InterruptStack>) {
        self.interrupt_stack.call_once(|| stack);
    }

    /// Carries out what interrupt context deferred: tops up the locked heap
    /// and grows the interrupt stack pool.
    pub fn maintain(&self) -> pmrt_api::Result<()> {
        if self.in_interrupt() {
            return Err(Error::InvalidState("maintenance from interrupt context"));
        }
        self.heap.maintain()?;
        if let Some(stack) = self.interrupt_stack.get() {
            stack.maintain()?;
        }
        Ok(())
    }

    // ========================================================================
    // Running thread
    // ========================================================================

    pub(crate) fn current_thread_raw(&self) -> usize {
        self.current_thread.load(Ordering::Relaxed)
    }

    pub(crate) fn set_current_thread_raw(&self, id: usize) {
        self.current_thread.store(id, Ordering::Relaxed);
    }

    pub(crate) fn recovery(&self) -> usize {
        self.recovery.load(Ordering::Relaxed)
    }

    pub(crate) fn set_recovery(&self, point: usize) {
        self.recovery.store(point, Ordering::Relaxed);
    }

    // ========================================================================
    // Debugging
    // ========================================================================

    pub fn debug_enabled(&self) -> bool {
        self.debug.load(Ordering::Relaxed)
    }

    pub fn set_debug(&self, enabled: bool) {
        self.debug.store(enabled, Ordering::Relaxed);
    }
}

/// Scoped interrupt mask; see [`Cpu::mask`]
pub struct MaskGuard<'a> {
    cpu: &'a Cpu,
    _not_send: PhantomData<*const ()>,
}

impl Drop for MaskGuard<'_> {
    fn drop(&mut self) {
        self.cpu.pop_off();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmrt_api::sim::SimulatedHost;
    use proptest::prelude::*;

    fn cpu(host: Arc<SimulatedHost>) -> Cpu {
        let heap = Arc::new(LockedHeap::new(host.clone()));
        Cpu::new(host, heap, true, false).unwrap()
    }

    #[test]
    fn test_mask_restores_disabled_state() {
        let host = Arc::new(SimulatedHost::new());
        let cpu = cpu(host.clone());
        host.disable_interrupts();
        cpu.masked(|| assert!(!host.interrupts_enabled()));
        assert!(!host.interrupts_enabled());
    }

    #[test]
    #[should_panic(expected = "pop_off")]
    fn test_unbalanced_pop_is_fatal() {
        let host = Arc::new(SimulatedHost::new());
        let cpu = cpu(host.clone());
        host.disable_interrupts();
        cpu.pop_off();
    }

    proptest! {
        #[test]
        fn prop_nested_masks_restore_state(depth in 0usize..32, enabled in any::<bool>()) {
            let host = Arc::new(SimulatedHost::new());
            let cpu = cpu(host.clone());
            if !enabled {
                host.disable_interrupts();
            }
            let guards: alloc::vec::Vec<_> = (0..depth).map(|_| cpu.mask()).collect();
            if depth > 0 {
                prop_assert!(!host.interrupts_enabled());
            }
            drop(guards);
            prop_assert_eq!(host.interrupts_enabled(), enabled);
            prop_assert_eq!(cpu.mask_depth(), 0);
        }
    }
}
