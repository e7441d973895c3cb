//! Driver for the simulated host
//!
//! [`SimulatedHost`](pmrt_api::sim::SimulatedHost) only records what is
//! installed in its vector tables. This module plays the processor: it
//! looks up the vector, recognises the runtime's trampolines by their
//! code bytes and calls the dispatcher they point at, following chains to
//! previous handlers until one returns or the host's own handler is
//! reached. No trampoline code is ever executed.

use core::mem::size_of;

use log::trace;
use pmrt_api::host::IRQ_LINES;
use pmrt_api::{Cr0, Error, FarPointer, Host, Result};

use crate::arch::{self, Trampoline};
use crate::exception::frame::{ExceptionFrame, ExceptionScratch};
use crate::exception::{ExceptionBridge, ExceptionEntry};
use crate::interrupt::{DispatchOutcome, IrqEntry};
use crate::runtime::DEVICE_NOT_AVAILABLE;

/// Chains followed before a dispatch is considered looping
const MAX_CHAIN: usize = 64;

/// What became of a hardware interrupt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqDelivery {
    /// The line is masked on the PIC
    Masked,
    /// Interrupts are disabled; the request stays pending
    Blocked,
    /// A runtime handler dealt with it
    Handled,
    /// Passed on to a handler outside the runtime
    Host(FarPointer),
}

/// What became of a processor fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultDelivery {
    /// A runtime handler claimed the fault; the host resumes with `scratch`
    Handled(ExceptionScratch),
    /// Passed on to a handler outside the runtime
    Host(FarPointer, ExceptionScratch),
}

fn decode(host: &dyn Host, target: FarPointer, entry: usize) -> Option<usize> {
    if target.selector != host.code_selector() {
        return None;
    }
    let (data, to) = unsafe { Trampoline::decode(target.offset) }?;
    (to == entry).then_some(data)
}

/// Raises hardware interrupt `irq` as the PIC would
pub fn raise_irq(host: &dyn Host, irq: u8) -> Result<IrqDelivery> {
    if irq >= IRQ_LINES {
        return Err(Error::InvalidArgument("IRQ line out of range"));
    }
    if host.irq_masked(irq) {
        return Ok(IrqDelivery::Masked);
    }
    if !host.interrupts_enabled() {
        return Ok(IrqDelivery::Blocked);
    }

    // Interrupt gates clear IF; IRET sets it again.
    host.disable_interrupts();
    let mut target = host.get_interrupt_vector(host.irq_vector(irq))?;
    let mut delivery = IrqDelivery::Host(target);
    for _ in 0..MAX_CHAIN {
        let Some(data) = decode(host, target, arch::irq_entry_address()) else {
            delivery = IrqDelivery::Host(target);
            break;
        };
        let entry = unsafe { &*(data as *const IrqEntry) };
        trace!(target: "pmrt::sim", "IRQ {} enters trampoline at {}", irq, target);
        match entry.run() {
            DispatchOutcome::Return => {
                delivery = IrqDelivery::Handled;
                break;
            }
            DispatchOutcome::Chain(previous) => target = previous,
        }
    }
    host.enable_interrupts();
    Ok(delivery)
}

/// Raises fault `vector` with the given register and frame snapshot
pub fn raise_fault(host: &dyn Host, vector: u8, scratch: ExceptionScratch) -> Result<FaultDelivery> {
    let mut target = host.get_exception_handler(vector)?;
    let mut scratch = scratch;
    for _ in 0..MAX_CHAIN {
        let Some(data) = decode(host, target, arch::exception_entry_address()) else {
            break;
        };
        let entry = unsafe { &*(data as *const ExceptionEntry) };
        unsafe { entry.scratch_ptr().write(scratch) };
        let handled = entry.run();
        scratch = unsafe { entry.scratch_ptr().read() };
        if handled {
            return Ok(FaultDelivery::Handled(scratch));
        }
        target = entry.previous();
    }
    Ok(FaultDelivery::Host(target, scratch))
}

/// Resumes the program after a fault the way the host does on return from
/// an exception handler.
///
/// Resuming into anything but the re-raise trampoline only reports where
/// execution would continue.
pub fn resume_fault(host: &dyn Host, scratch: &ExceptionScratch) -> FarPointer {
    let frame = if host.supports_extended_frames() { &scratch.extended.frame } else { &scratch.frame };
    let target = FarPointer::new(frame.cs as u16, frame.eip);
    if let Some(data) = decode(host, target, arch::reraise_entry_address()) {
        let (vector, address) = unsafe {
            let slots = frame.esp as *const usize;
            (slots.read(), slots.add(1).read())
        };
        unsafe { crate::exception::pmrt_reraise(data as *const ExceptionBridge, vector, address) }
    }
    target
}

/// Builds a fault frame as if the instruction at `eip` in the program's
/// code faulted with its stack pointer at `esp`.
pub fn program_fault(host: &dyn Host, eip: usize, esp: usize) -> ExceptionScratch {
    let mut scratch = ExceptionScratch::default();
    scratch.frame = ExceptionFrame {
        eip,
        cs: host.code_selector() as usize,
        eflags: 0x202,
        esp,
        ..ExceptionFrame::default()
    };
    scratch.extended.frame = scratch.frame;
    scratch.regs.esp = esp;
    scratch
}

/// Stack the simulated program runs on when a fault is re-raised
#[repr(C, align(16))]
pub struct FaultStack([usize; 64]);

impl FaultStack {
    pub const fn new() -> Self {
        Self([0; 64])
    }

    /// Stack pointer at the top of the region
    pub fn top(&self) -> usize {
        self.0.as_ptr() as usize + size_of::<Self>()
    }
}

impl Default for FaultStack {
    fn default() -> Self {
        Self::new()
    }
}

/// Executes a numeric instruction: traps with "device not available" while
/// CR0.TS is set. Returns whether the trap was taken.
pub fn touch_fpu(host: &dyn Host) -> Result<bool> {
    let cr0 = match host.read_cr0() {
        Ok(cr0) => cr0,
        Err(_) if !host.control_register_access() => return Ok(false),
        Err(err) => return Err(err.into()),
    };
    if !cr0.contains(Cr0::TASK_SWITCHED) {
        return Ok(false);
    }
    let stack = FaultStack::new();
    let scratch = program_fault(host, 0, stack.top());
    match raise_fault(host, DEVICE_NOT_AVAILABLE, scratch)? {
        FaultDelivery::Handled(_) => Ok(true),
        FaultDelivery::Host(..) => Err(Error::InvalidState("device not available reached the host")),
    }
}
