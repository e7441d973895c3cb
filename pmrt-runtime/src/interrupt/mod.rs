//! Chained hardware interrupt dispatch
//!
//! Each hardware line with at least one registered handler owns an
//! [`IrqEntry`]: its handler chain, the vector it displaced and a trampoline
//! installed as the new vector. On every occurrence the trampoline enters
//! the shared stub, which switches to the interrupt stack pool and calls
//! [`IrqEntry::dispatch`]:
//!
//! 1. bump the nesting depth and enter the FPU switch
//! 2. send End-Of-Interrupt unless a handler asked for `NO_AUTO_EOI`
//! 3. re-enable interrupts, masking the line first for `NO_REENTRY`, or
//!    not at all for `NO_REENTRY_AT_ALL`
//! 4. call handlers in registration order; once the occurrence has been
//!    acknowledged only `ALWAYS_CALL` handlers still run
//! 5. if nobody acknowledged it, or `ALWAYS_CHAIN` is set, chain to the
//!    previous vector with a far jump over an IRET frame
//!
//! Handler errors stop at the dispatcher: they are logged, never propagated
//! into the trampoline.

pub mod flags;
pub mod stack;

use alloc::sync::Arc;
use core::cell::{Cell, UnsafeCell};
use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use hashbrown::HashMap;
use log::{debug, error, info};
use pmrt_api::host::IRQ_LINES;
use pmrt_api::{Error, FarPointer, Result};
use pmrt_memory::{LockedBox, LockedFn};
use spin::Mutex;

pub use flags::IrqFlags;
pub use stack::InterruptStack;

use crate::arch::{self, Trampoline};
use crate::chain::HandlerChain;
use crate::cpu::Cpu;

/// Identifies a registered handler for [`InterruptController::remove`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What the entry stub does once dispatch returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Return to the interrupted code
    Return,
    /// Far-jump to the previously installed handler
    Chain(FarPointer),
}

/// Fields shared by interrupt and exception entries, at fixed offsets for
/// the entry stubs.
#[repr(C)]
pub struct EntryHeader {
    /// Previous handler as `[offset, selector]`
    pub(crate) chain_target: [usize; 2],
    /// Words of host frame the exception stub copies in and out
    pub(crate) copy_words: usize,
    pub(crate) stack: Arc<InterruptStack>,
}

impl EntryHeader {
    pub(crate) fn new(previous: FarPointer, copy_words: usize, stack: Arc<InterruptStack>) -> Self {
        Self {
            chain_target: [previous.offset, previous.selector as usize],
            copy_words,
            stack,
        }
    }
}

/// Per-occurrence state handed to interrupt handlers
pub struct IrqContext {
    irq: u8,
    acknowledged: Cell<bool>,
    eoi_sent: Cell<bool>,
    cpu: NonNull<Cpu>,
}

impl IrqContext {
    fn new(irq: u8, cpu: &Cpu) -> Self {
        Self {
            irq,
            acknowledged: Cell::new(false),
            eoi_sent: Cell::new(false),
            cpu: NonNull::from(cpu),
        }
    }

    fn cpu(&self) -> &Cpu {
        // Contexts only exist for the duration of a dispatch.
        unsafe { self.cpu.as_ref() }
    }

    pub fn irq(&self) -> u8 {
        self.irq
    }

    /// Marks the occurrence as handled and sends EOI if that has not
    /// happened yet. Later handlers without `ALWAYS_CALL` are skipped and
    /// the previous vector is not chained to.
    pub fn acknowledge(&self) {
        self.acknowledged.set(true);
        self.send_eoi();
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged.get()
    }

    fn send_eoi(&self) {
        if !self.eoi_sent.replace(true) {
            self.cpu().host().send_eoi(self.irq);
        }
    }

    /// Depth of interrupt nesting including this occurrence
    pub fn nesting(&self) -> usize {
        self.cpu().interrupt_depth()
    }
}

struct IrqHandler {
    id: HandlerId,
    flags: IrqFlags,
    func: LockedFn<IrqContext, Result<()>>,
}

/// Dispatch state of one hardware line
#[repr(C)]
pub struct IrqEntry {
    header: EntryHeader,
    irq: u8,
    vector: u8,
    previous: FarPointer,
    was_masked: bool,
    flags: AtomicU8,
    cpu: Arc<Cpu>,
    chain: UnsafeCell<HandlerChain<IrqHandler>>,
    trampoline: Option<Trampoline>,
}

// The chain is mutated only with interrupts masked and outside interrupt
// context, so dispatch never observes a partial update.
unsafe impl Sync for IrqEntry {}
unsafe impl Send for IrqEntry {}

impl IrqEntry {
    pub fn irq(&self) -> u8 {
        self.irq
    }

    pub fn vector(&self) -> u8 {
        self.vector
    }

    /// Handler that was installed before this entry
    pub fn previous(&self) -> FarPointer {
        self.previous
    }

    /// Combined flags of every handler on the line
    pub fn flags(&self) -> IrqFlags {
        IrqFlags::from_bits_retain(self.flags.load(Ordering::Relaxed))
    }

    pub fn handler_count(&self) -> usize {
        unsafe { &*self.chain.get() }.len()
    }

    fn recompute_flags(&self) {
        let combined = unsafe { &*self.chain.get() }
            .iter()
            .fold(IrqFlags::empty(), |acc, h| acc | h.flags);
        self.flags.store(combined.bits(), Ordering::Relaxed);
    }

    /// Runs the handler chain for one occurrence. Entered with interrupts
    /// disabled and returns with interrupts disabled.
    pub fn dispatch(&self) -> DispatchOutcome {
        let cpu = &*self.cpu;
        let host = cpu.host();
        cpu.enter_interrupt();

        let flags = self.flags();
        let mut ctx = IrqContext::new(self.irq, cpu);
        if !flags.contains(IrqFlags::NO_AUTO_EOI) {
            ctx.send_eoi();
        }

        let reentrant = !flags.contains(IrqFlags::NO_REENTRY_AT_ALL);
        let line_masked = reentrant && flags.contains(IrqFlags::NO_REENTRY);
        if line_masked {
            host.mask_irq(self.irq);
        }
        if reentrant {
            host.enable_interrupts();
        }

        let chain = unsafe { &*self.chain.get() };
        for handler in chain.iter() {
            if ctx.is_acknowledged() && !handler.flags.contains(IrqFlags::ALWAYS_CALL) {
                continue;
            }
            if let Err(err) = handler.func.call(&mut ctx) {
                error!(target: "pmrt::irq", "IRQ {} handler {} failed: {}", self.irq, handler.id, err);
            }
        }

        host.disable_interrupts();
        if line_masked {
            host.unmask_irq(self.irq);
        }

        let chain_on = !ctx.is_acknowledged() || flags.contains(IrqFlags::ALWAYS_CHAIN);
        cpu.leave_interrupt();
        if chain_on { DispatchOutcome::Chain(self.previous) } else { DispatchOutcome::Return }
    }

    /// Dispatch including the interrupt stack bookkeeping the entry stub
    /// performs around it
    pub fn run(&self) -> DispatchOutcome {
        self.header.stack.acquire();
        let outcome = self.dispatch();
        self.header.stack.release();
        outcome
    }

    /// Address installed in the vector table
    pub fn handler_address(&self) -> usize {
        self.trampoline.as_ref().map_or(0, Trampoline::address)
    }
}

/// Called by the entry stub on the interrupt stack. Returns non-zero to
/// chain to the previous handler.
pub(crate) unsafe extern "C" fn pmrt_irq_dispatch(entry: *const IrqEntry) -> usize {
    match unsafe { &*entry }.dispatch() {
        DispatchOutcome::Return => 0,
        DispatchOutcome::Chain(_) => 1,
    }
}

pub(crate) unsafe extern "C" fn pmrt_stack_acquire(header: *const EntryHeader) -> usize {
    unsafe { &*header }.stack.acquire()
}

pub(crate) unsafe extern "C" fn pmrt_stack_release(header: *const EntryHeader) {
    unsafe { &*header }.stack.release()
}

/// Registry of hardware interrupt handlers
pub struct InterruptController {
    cpu: Arc<Cpu>,
    stack: Arc<InterruptStack>,
    entries: Mutex<HashMap<u8, LockedBox<IrqEntry>>>,
    next_id: AtomicU64,
}

impl InterruptController {
    pub fn new(cpu: Arc<Cpu>, stack: Arc<InterruptStack>) -> Self {
        Self {
            cpu,
            stack,
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn stack(&self) -> &Arc<InterruptStack> {
        &self.stack
    }

    /// Registers `handler` on hardware line `irq`.
    ///
    /// The first handler on a line installs the line's trampoline in place
    /// of the current vector and unmasks the line.
    pub fn add<F>(&self, irq: u8, flags: IrqFlags, handler: F) -> Result<HandlerId>
    where
        F: Fn(&IrqContext) -> Result<()> + Send + Sync + 'static,
    {
        if irq >= IRQ_LINES {
            return Err(Error::InvalidArgument("IRQ line out of range"));
        }
        if self.cpu.in_interrupt() {
            return Err(Error::InvalidState("interrupt handlers cannot be changed from interrupt context"));
        }
        let heap = self.cpu.heap();
        let func = LockedFn::new(heap, move |ctx: &mut IrqContext| handler(ctx))?;
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let record = IrqHandler { id, flags, func };

        let _mask = self.cpu.mask();
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(&irq) {
            unsafe { &mut *entry.chain.get() }.push_back(heap, record)?;
            entry.recompute_flags();
            debug!(target: "pmrt::irq", "handler {} added to IRQ {}", id, irq);
            return Ok(id);
        }

        let host = self.cpu.host();
        let vector = host.irq_vector(irq);
        let previous = host.get_interrupt_vector(vector)?;
        let mut entry = LockedBox::new(
            heap,
            IrqEntry {
                header: EntryHeader::new(previous, 0, self.stack.clone()),
                irq,
                vector,
                previous,
                was_masked: host.irq_masked(irq),
                flags: AtomicU8::new(0),
                cpu: self.cpu.clone(),
                chain: UnsafeCell::new(HandlerChain::new()),
                trampoline: None,
            },
        )?;
        entry.chain.get_mut().push_back(heap, record)?;
        entry.recompute_flags();
        let trampoline = Trampoline::new(heap, LockedBox::as_ptr(&entry) as usize, arch::irq_entry_address())?;
        let address = trampoline.address();
        entry.trampoline = Some(trampoline);

        host.set_interrupt_vector(vector, FarPointer::new(host.code_selector(), address))?;
        host.unmask_irq(irq);
        entries.insert(irq, entry);
        info!(target: "pmrt::irq", "IRQ {} (vector {:#04x}) hooked, previous handler {}", irq, vector, previous);
        Ok(id)
    }

    /// Unregisters a handler. Removing the last handler of a line restores
    /// the previous vector and the line's original mask state.
    pub fn remove(&self, irq: u8, id: HandlerId) -> Result<()> {
        if self.cpu.in_interrupt() {
            return Err(Error::InvalidState("interrupt handlers cannot be changed from interrupt context"));
        }
        let _mask = self.cpu.mask();
        let mut entries = self.entries.lock();
        let entry = entries.get(&irq).ok_or(Error::NotFound("no handlers on IRQ line"))?;
        let chain = unsafe { &mut *entry.chain.get() };
        let removed = chain.remove_where(|h| h.id == id).ok_or(Error::NotFound("interrupt handler"))?;
        drop(removed);
        debug!(target: "pmrt::irq", "handler {} removed from IRQ {}", id, irq);

        if !chain.is_empty() {
            entry.recompute_flags();
            return Ok(());
        }
        // An empty chain chains straight through, so the entry stays valid
        // if the host refuses to restore the vector.
        entry.recompute_flags();
        Self::uninstall(&self.cpu, entry)?;
        entries.remove(&irq);
        Ok(())
    }

    fn uninstall(cpu: &Cpu, entry: &IrqEntry) -> Result<()> {
        let host = cpu.host();
        host.set_interrupt_vector(entry.vector, entry.previous)?;
        if entry.was_masked {
            host.mask_irq(entry.irq);
        }
        info!(target: "pmrt::irq", "IRQ {} unhooked, vector restored to {}", entry.irq, entry.previous);
        Ok(())
    }

    /// Whether `irq` currently has handlers
    pub fn is_hooked(&self, irq: u8) -> bool {
        self.cpu.masked(|| self.entries.lock().contains_key(&irq))
    }

    pub fn handler_count(&self, irq: u8) -> usize {
        self.cpu.masked(|| self.entries.lock().get(&irq).map_or(0, |e| e.handler_count()))
    }

    /// Combined flags of the handlers on `irq`
    pub fn flags(&self, irq: u8) -> IrqFlags {
        self.cpu.masked(|| self.entries.lock().get(&irq).map_or(IrqFlags::empty(), |e| e.flags()))
    }
}

impl Drop for InterruptController {
    fn drop(&mut self) {
        let _mask = self.cpu.mask();
        let entries = core::mem::take(&mut *self.entries.lock());
        for (irq, entry) in entries {
            if let Err(err) = Self::uninstall(&self.cpu, &entry) {
                error!(target: "pmrt::irq", "restoring IRQ {} vector: {}", irq, err);
                // The trampoline must outlive a vector that still points at it.
                core::mem::forget(entry);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmrt_api::sim::{self, SimulatedHost};
    use pmrt_api::{Host, HostCall};
    use pmrt_memory::LockedHeap;

    fn controller() -> (Arc<SimulatedHost>, InterruptController) {
        let host = Arc::new(SimulatedHost::new());
        let heap = Arc::new(LockedHeap::new(host.clone()));
        let cpu = Arc::new(Cpu::new(host.clone(), heap.clone(), true, false).unwrap());
        let stack = Arc::new(InterruptStack::new(heap, 16 * 1024, 4 * 1024, 4 * 1024).unwrap());
        (host, InterruptController::new(cpu, stack))
    }

    #[test]
    fn test_first_handler_installs_trampoline() {
        let (host, irqs) = controller();
        host.mask_irq(5);
        let id = irqs.add(5, IrqFlags::empty(), |_| Ok(())).unwrap();
        let installed = host.get_interrupt_vector(0x0d).unwrap();
        assert_eq!(installed.selector, sim::PROGRAM_CODE_SELECTOR);
        assert!(!host.irq_masked(5));
        irqs.remove(5, id).unwrap();
        assert_eq!(host.get_interrupt_vector(0x0d).unwrap(), sim::original_interrupt_vector(0x0d));
        assert!(host.irq_masked(5));
        assert!(!irqs.is_hooked(5));
    }

    #[test]
    fn test_failed_install_leaves_vector_untouched() {
        let (host, irqs) = controller();
        host.fail_next(HostCall::SetInterruptVector, 0x8022);
        let result = irqs.add(3, IrqFlags::empty(), |_| Ok(()));
        assert!(matches!(result, Err(Error::Host(_))));
        assert!(!irqs.is_hooked(3));
        assert_eq!(host.get_interrupt_vector(0x0b).unwrap(), sim::original_interrupt_vector(0x0b));
    }

    #[test]
    fn test_rejects_bad_line_and_unknown_handler() {
        let (_host, irqs) = controller();
        assert!(matches!(irqs.add(16, IrqFlags::empty(), |_| Ok(())), Err(Error::InvalidArgument(_))));
        let id = irqs.add(1, IrqFlags::empty(), |_| Ok(())).unwrap();
        assert!(matches!(irqs.remove(2, id), Err(Error::NotFound(_))));
        assert!(matches!(irqs.remove(1, HandlerId(999)), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_flags_are_combined() {
        let (_host, irqs) = controller();
        let a = irqs.add(4, IrqFlags::NO_AUTO_EOI, |_| Ok(())).unwrap();
        irqs.add(4, IrqFlags::ALWAYS_CHAIN, |_| Ok(())).unwrap();
        assert_eq!(irqs.flags(4), IrqFlags::NO_AUTO_EOI | IrqFlags::ALWAYS_CHAIN);
        irqs.remove(4, a).unwrap();
        assert_eq!(irqs.flags(4), IrqFlags::ALWAYS_CHAIN);
        assert_eq!(irqs.handler_count(4), 1);
    }

    #[test]
    fn test_drop_restores_all_vectors() {
        let (host, irqs) = controller();
        irqs.add(0, IrqFlags::empty(), |_| Ok(())).unwrap();
        irqs.add(12, IrqFlags::empty(), |_| Ok(())).unwrap();
        drop(irqs);
        assert_eq!(host.get_interrupt_vector(0x08).unwrap(), sim::original_interrupt_vector(0x08));
        assert_eq!(host.get_interrupt_vector(0x74).unwrap(), sim::original_interrupt_vector(0x74));
    }
}
