//! Exception handler chains and the re-raise path

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::fmt;
use core::mem::size_of;
use core::ops::Range;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use hashbrown::HashMap;
use log::{debug, error, info, warn};
use pmrt_api::{Error, FarPointer, Result};
use pmrt_memory::{LockedBox, LockedFn};
use spin::{Mutex, Once};

use super::frame::{EXTENDED_FRAME_WORDS, ExceptionScratch, ExceptionState, FRAME_WORDS};
use super::{CpuException, FaultRecord, recovery};
use crate::arch::{self, STACK_ALIGN, Trampoline};
use crate::chain::HandlerChain;
use crate::cpu::Cpu;
use crate::interrupt::{EntryHeader, InterruptStack};

/// Exception vectors a host lets programs intercept
pub const EXCEPTION_VECTORS: u8 = 32;

/// Identifies a registered exception handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExceptionHandlerId(u64);

impl fmt::Display for ExceptionHandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct ExceptionHandler {
    id: ExceptionHandlerId,
    func: LockedFn<ExceptionState, bool>,
}

/// Dispatch state of one exception vector
#[repr(C)]
pub struct ExceptionEntry {
    pub(crate) header: EntryHeader,
    pub(crate) scratch: UnsafeCell<ExceptionScratch>,
    vector: u8,
    previous: FarPointer,
    extended: bool,
    cpu: Arc<Cpu>,
    chain: UnsafeCell<HandlerChain<ExceptionHandler>>,
    trampoline: Option<Trampoline>,
}

// Chains change only with interrupts masked outside exception context; the
// scratch area is used by one exception level at a time.
unsafe impl Sync for ExceptionEntry {}
unsafe impl Send for ExceptionEntry {}

impl ExceptionEntry {
    pub fn vector(&self) -> u8 {
        self.vector
    }

    /// Handler that was installed before this entry
    pub fn previous(&self) -> FarPointer {
        self.previous
    }

    /// Whether the host delivers DPMI 1.0 frames to this entry
    pub fn is_extended(&self) -> bool {
        self.extended
    }

    pub fn handler_count(&self) -> usize {
        unsafe { &*self.chain.get() }.len()
    }

    /// Address installed as the exception handler
    pub fn handler_address(&self) -> usize {
        self.trampoline.as_ref().map_or(0, Trampoline::address)
    }

    /// Register and frame area the entry stub fills in
    pub(crate) fn scratch_ptr(&self) -> *mut ExceptionScratch {
        self.scratch.get()
    }

    /// Runs the handler chain over the saved registers and frame. Returns
    /// whether a handler fully handled the fault; otherwise the previous
    /// handler gets it.
    pub fn dispatch(&self) -> bool {
        let cpu = &*self.cpu;
        // The numeric state belongs to the faulting level until we enter.
        let fpu_status = matches!(self.vector, 0x10 | 0x13).then(|| cpu.fpu().live_state().status_word());
        cpu.enter_interrupt();

        let scratch = unsafe { NonNull::new_unchecked(self.scratch.get()) };
        let mut state = unsafe { ExceptionState::new(self.vector, scratch, self.extended, fpu_status) };
        let chain = unsafe { &*self.chain.get() };
        let handled = chain.iter().any(|handler| handler.func.call(&mut state));
        if !handled {
            debug!(target: "pmrt::exception", "exception {:#04x} at {} passed to {}", self.vector, state.fault_address(), self.previous);
        }

        cpu.leave_interrupt();
        handled
    }

    /// Dispatch including the interrupt stack bookkeeping the entry stub
    /// performs around it
    pub fn run(&self) -> bool {
        self.header.stack.acquire();
        let handled = self.dispatch();
        self.header.stack.release();
        handled
    }
}

/// Registry of exception handlers and owner of the re-raise path
pub struct ExceptionBridge {
    cpu: Arc<Cpu>,
    stack: Arc<InterruptStack>,
    code_range: Range<usize>,
    entries: Mutex<HashMap<u8, LockedBox<ExceptionEntry>>>,
    next_id: AtomicU64,
    reraise: Once<Trampoline>,
    reraise_handlers: Mutex<Vec<(u8, ExceptionHandlerId)>>,
    reraise_in_flight: AtomicBool,
    last_fault: Mutex<Option<FaultRecord>>,
}

impl ExceptionBridge {
    /// Creates a bridge converting faults whose instruction pointer lies in
    /// `code_range`.
    pub fn new(cpu: Arc<Cpu>, stack: Arc<InterruptStack>, code_range: Range<usize>) -> Arc<Self> {
        Arc::new(Self {
            cpu,
            stack,
            code_range,
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            reraise: Once::new(),
            reraise_handlers: Mutex::new(Vec::new()),
            reraise_in_flight: AtomicBool::new(false),
            last_fault: Mutex::new(None),
        })
    }

    /// Registers `handler` for exception `vector`. Newer handlers run
    /// before older ones; a handler returning `true` ends the chain.
    pub fn add<F>(&self, vector: u8, handler: F) -> Result<ExceptionHandlerId>
    where
        F: Fn(&mut ExceptionState) -> bool + Send + Sync + 'static,
    {
        if vector >= EXCEPTION_VECTORS {
            return Err(Error::InvalidArgument("exception vector out of range"));
        }
        if self.cpu.in_interrupt() {
            return Err(Error::InvalidState("exception handlers cannot be changed from interrupt context"));
        }
        let heap = self.cpu.heap();
        let id = ExceptionHandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let record = ExceptionHandler { id, func: LockedFn::new(heap, handler)? };

        let _mask = self.cpu.mask();
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(&vector) {
            unsafe { &mut *entry.chain.get() }.push_front(heap, record)?;
            debug!(target: "pmrt::exception", "handler {} added to exception {:#04x}", id, vector);
            return Ok(id);
        }

        let host = self.cpu.host();
        let previous = host.get_exception_handler(vector)?;
        let extended = host.supports_extended_frames();
        let words = if extended { EXTENDED_FRAME_WORDS } else { FRAME_WORDS };
        let mut entry = LockedBox::new(
            heap,
            ExceptionEntry {
                header: EntryHeader::new(previous, words, self.stack.clone()),
                scratch: UnsafeCell::new(ExceptionScratch::default()),
                vector,
                previous,
                extended,
                cpu: self.cpu.clone(),
                chain: UnsafeCell::new(HandlerChain::new()),
                trampoline: None,
            },
        )?;
        entry.chain.get_mut().push_front(heap, record)?;
        let trampoline = Trampoline::new(heap, LockedBox::as_ptr(&entry) as usize, arch::exception_entry_address())?;
        let address = trampoline.address();
        entry.trampoline = Some(trampoline);

        host.set_exception_handler(vector, FarPointer::new(host.code_selector(), address))?;
        entries.insert(vector, entry);
        info!(
            target: "pmrt::exception",
            "exception {:#04x} ({}) hooked, previous handler {}",
            vector,
            super::exception_name(vector),
            previous
        );
        Ok(id)
    }

    /// Unregisters a handler; removing the last one restores the previous
    /// host handler.
    pub fn remove(&self, vector: u8, id: ExceptionHandlerId) -> Result<()> {
        if self.cpu.in_interrupt() {
            return Err(Error::InvalidState("exception handlers cannot be changed from interrupt context"));
        }
        let _mask = self.cpu.mask();
        let mut entries = self.entries.lock();
        let entry = entries.get(&vector).ok_or(Error::NotFound("no handlers on exception vector"))?;
        let chain = unsafe { &mut *entry.chain.get() };
        chain.remove_where(|h| h.id == id).ok_or(Error::NotFound("exception handler"))?;
        debug!(target: "pmrt::exception", "handler {} removed from exception {:#04x}", id, vector);
        if !chain.is_empty() {
            return Ok(());
        }
        Self::uninstall(&self.cpu, entry)?;
        entries.remove(&vector);
        Ok(())
    }

    fn uninstall(cpu: &Cpu, entry: &ExceptionEntry) -> Result<()> {
        cpu.host().set_exception_handler(entry.vector, entry.previous)?;
        info!(target: "pmrt::exception", "exception {:#04x} unhooked, handler restored to {}", entry.vector, entry.previous);
        Ok(())
    }

    /// Installs the handler converting faults on `vectors` into
    /// [`CpuException`]s.
    pub fn install_reraise(self: &Arc<Self>, vectors: &[u8]) -> Result<()> {
        let heap = self.cpu.heap().clone();
        let data = Arc::as_ptr(self) as usize;
        self.reraise
            .try_call_once(|| Trampoline::new(&heap, data, arch::reraise_entry_address()))?;

        for &vector in vectors {
            let bridge: Weak<Self> = Arc::downgrade(self);
            let id = self.add(vector, move |state| bridge.upgrade().is_some_and(|b| b.try_reraise(state)))?;
            self.reraise_handlers.lock().push((vector, id));
        }
        Ok(())
    }

    /// Removes the handlers added by [`install_reraise`](Self::install_reraise)
    pub fn uninstall_reraise(&self) -> Result<()> {
        let handlers = core::mem::take(&mut *self.reraise_handlers.lock());
        for (vector, id) in handlers {
            self.remove(vector, id)?;
        }
        Ok(())
    }

    fn try_reraise(&self, state: &mut ExceptionState) -> bool {
        let host = self.cpu.host();
        let frame = *state.frame();
        if frame.cs as u16 != host.code_selector() {
            return false;
        }
        if !self.code_range.contains(&frame.eip) {
            return false;
        }
        let Some(trampoline) = self.reraise.get() else {
            return false;
        };
        if self.reraise_in_flight.swap(true, Ordering::AcqRel) {
            warn!(
                target: "pmrt::exception",
                "exception {:#04x} at {} during re-raise, passing it on",
                state.vector(),
                state.fault_address()
            );
            return false;
        }

        // Room for the fault number and address the re-raise stub pops.
        let sp = frame
            .esp
            .checked_sub(2 * size_of::<usize>())
            .map(|sp| sp & !(STACK_ALIGN - 1))
            .filter(|&sp| sp != 0);
        let Some(sp) = sp else {
            self.reraise_in_flight.store(false, Ordering::Release);
            warn!(
                target: "pmrt::exception",
                "exception {:#04x} at {} with no stack left, passing it on",
                state.vector(),
                state.fault_address()
            );
            return false;
        };

        let record = FaultRecord::capture(state);
        *self.last_fault.lock() = Some(record);

        unsafe {
            let slots = sp as *mut usize;
            slots.write(state.vector() as usize);
            slots.add(1).write(frame.eip);
        }
        let resumed = state.frame_mut();
        resumed.esp = sp;
        resumed.eip = trampoline.address();
        debug!(target: "pmrt::exception", "re-raising exception {:#04x} from {}", record.vector, record.fault_address());
        true
    }

    /// Hands the re-raised fault to the innermost recovery point of the
    /// running thread.
    pub(crate) fn deliver(&self, vector: u8, address: usize) -> ! {
        let record = self
            .cpu
            .masked(|| (*self.last_fault.lock()).filter(|r| r.vector == vector && r.frame.eip == address));
        self.reraise_in_flight.store(false, Ordering::Release);
        let Some(record) = record else {
            crate::debug::fatal(
                &self.cpu,
                format_args!("re-raised exception {:#04x} at {:#x} has no snapshot", vector, address),
            );
        };
        let exception = CpuException::new(record);
        recovery::resume(&self.cpu, exception)
    }

    /// Address of the re-raise trampoline, once installed
    pub fn reraise_address(&self) -> Option<usize> {
        self.reraise.get().map(Trampoline::address)
    }

    /// Whether a fault has been redirected but not yet delivered
    pub fn reraise_in_flight(&self) -> bool {
        self.reraise_in_flight.load(Ordering::Acquire)
    }

    /// Snapshot of the most recent re-raised fault
    pub fn last_fault(&self) -> Option<FaultRecord> {
        self.cpu.masked(|| *self.last_fault.lock())
    }

    pub fn is_hooked(&self, vector: u8) -> bool {
        self.cpu.masked(|| self.entries.lock().contains_key(&vector))
    }

    pub fn handler_count(&self, vector: u8) -> usize {
        self.cpu.masked(|| self.entries.lock().get(&vector).map_or(0, |e| e.handler_count()))
    }

    /// Entry for `vector` while it is hooked
    pub(crate) fn with_entry<R>(&self, vector: u8, f: impl FnOnce(&ExceptionEntry) -> R) -> Option<R> {
        let entry = self.cpu.masked(|| self.entries.lock().get(&vector).map(|e| LockedBox::as_ptr(e).cast_const()))?;
        Some(f(unsafe { &*entry }))
    }
}

impl Drop for ExceptionBridge {
    fn drop(&mut self) {
        let _mask = self.cpu.mask();
        let entries = core::mem::take(&mut *self.entries.lock());
        for (vector, entry) in entries {
            if let Err(err) = Self::uninstall(&self.cpu, &entry) {
                error!(target: "pmrt::exception", "restoring exception {:#04x} handler: {}", vector, err);
                core::mem::forget(entry);
            }
        }
    }
}
