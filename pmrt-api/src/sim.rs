//! Simulated host
//!
//! A deterministic, in-memory model of a DPMI host sitting on one x86 CPU.
//! It keeps the vector tables, the PIC mask and EOI counts, CR0, the live
//! numeric register file and the locked-region bookkeeping, and lets tests
//! inject host call failures.
//!
//! Nothing here executes code: installed handlers are only recorded. The
//! runtime's own `sim` driver decides what "running" a vector means.

use alloc::vec::Vec;

use spin::Mutex;

use crate::error::{HostError, HostResult};
use crate::host::{Cr0, FarPointer, FpuState, Host, HostCall, IRQ_LINES};

/// Code selector used for the host's own handlers
pub const HOST_CODE_SELECTOR: u16 = 0x0010;
/// Code selector reported for the program
pub const PROGRAM_CODE_SELECTOR: u16 = 0x00a7;
/// PIC mask at start-up: timer, keyboard and cascade enabled
pub const INITIAL_PIC_MASK: u16 = 0xfff8;
/// x87 control word after `fninit`
pub const FPU_DEFAULT_CONTROL_WORD: u16 = 0x037f;

/// Handler the host had installed for `vector` before anyone touched it
pub const fn original_interrupt_vector(vector: u8) -> FarPointer {
    FarPointer::new(HOST_CODE_SELECTOR, 0xf000 + vector as usize * 4)
}

/// Handler the host had installed for `exception` before anyone touched it
pub const fn original_exception_handler(exception: u8) -> FarPointer {
    FarPointer::new(HOST_CODE_SELECTOR, 0xe000 + exception as usize * 4)
}

/// Complete simulated machine state
#[derive(Debug)]
pub struct SimState {
    pub interrupts_enabled: bool,
    /// `cli` executions so far
    pub interrupt_disables: usize,
    pub vectors: [FarPointer; 256],
    pub exceptions: [FarPointer; 32],
    pub pic_mask: u16,
    pub eoi_count: [u32; IRQ_LINES as usize],
    pub cr0: Cr0,
    pub control_register_access: bool,
    pub extended_frames: bool,
    /// Live coprocessor registers
    pub fpu: FpuState,
    pub fpu_saves: usize,
    pub fpu_restores: usize,
    pub locked_regions: Vec<(usize, usize)>,
    pub breakpoints: usize,
    pending_failures: Vec<(HostCall, u16)>,
}

impl SimState {
    fn new() -> Self {
        let mut vectors = [FarPointer::default(); 256];
        for (i, v) in vectors.iter_mut().enumerate() {
            *v = original_interrupt_vector(i as u8);
        }
        let mut exceptions = [FarPointer::default(); 32];
        for (i, e) in exceptions.iter_mut().enumerate() {
            *e = original_exception_handler(i as u8);
        }
        let mut fpu = FpuState::new();
        fpu.bytes[..2].copy_from_slice(&FPU_DEFAULT_CONTROL_WORD.to_le_bytes());
        Self {
            interrupts_enabled: true,
            interrupt_disables: 0,
            vectors,
            exceptions,
            pic_mask: INITIAL_PIC_MASK,
            eoi_count: [0; IRQ_LINES as usize],
            cr0: Cr0::PROTECTION_ENABLE | Cr0::MONITOR_COPROCESSOR | Cr0::NUMERIC_ERROR,
            control_register_access: true,
            extended_frames: false,
            fpu,
            fpu_saves: 0,
            fpu_restores: 0,
            locked_regions: Vec::new(),
            breakpoints: 0,
            pending_failures: Vec::new(),
        }
    }

    fn take_failure(&mut self, call: HostCall) -> HostResult<()> {
        match self.pending_failures.iter().position(|(c, _)| *c == call) {
            Some(pos) => {
                let (call, code) = self.pending_failures.remove(pos);
                Err(HostError::new(call, code))
            }
            None => Ok(()),
        }
    }
}

/// In-memory host model
pub struct SimulatedHost {
    state: Mutex<SimState>,
}

impl SimulatedHost {
    pub fn new() -> Self {
        Self { state: Mutex::new(SimState::new()) }
    }

    /// Runs `f` with exclusive access to the machine state
    pub fn with_state<R>(&self, f: impl FnOnce(&mut SimState) -> R) -> R {
        f(&mut self.state.lock())
    }

    /// Makes the next `call` fail with `code`
    pub fn fail_next(&self, call: HostCall, code: u16) {
        self.state.lock().pending_failures.push((call, code));
    }

    pub fn set_control_register_access(&self, allowed: bool) {
        self.state.lock().control_register_access = allowed;
    }

    pub fn set_extended_frames(&self, extended: bool) {
        self.state.lock().extended_frames = extended;
    }

    pub fn eoi_count(&self, irq: u8) -> u32 {
        self.state.lock().eoi_count[irq as usize]
    }

    pub fn task_switched(&self) -> bool {
        self.state.lock().cr0.contains(Cr0::TASK_SWITCHED)
    }

    /// Byte `index` of the live coprocessor register file
    pub fn fpu_register(&self, index: usize) -> u8 {
        self.state.lock().fpu.bytes[index]
    }

    /// Writes directly into the live coprocessor register file
    pub fn set_fpu_register(&self, index: usize, value: u8) {
        self.state.lock().fpu.bytes[index] = value;
    }

    pub fn locked_bytes(&self) -> usize {
        self.state.lock().locked_regions.iter().map(|(_, size)| size).sum()
    }

    pub fn breakpoints(&self) -> usize {
        self.state.lock().breakpoints
    }

    pub fn interrupt_disables(&self) -> usize {
        self.state.lock().interrupt_disables
    }
}

impl Default for SimulatedHost {
    fn default() -> Self {
        Self::new()
    }
}

impl Host for SimulatedHost {
    fn disable_interrupts(&self) -> bool {
        let mut state = self.state.lock();
        state.interrupt_disables += 1;
        core::mem::replace(&mut state.interrupts_enabled, false)
    }

    fn enable_interrupts(&self) {
        self.state.lock().interrupts_enabled = true;
    }

    fn interrupts_enabled(&self) -> bool {
        self.state.lock().interrupts_enabled
    }

    fn get_interrupt_vector(&self, vector: u8) -> HostResult<FarPointer> {
        let mut state = self.state.lock();
        state.take_failure(HostCall::GetInterruptVector)?;
        Ok(state.vectors[vector as usize])
    }

    fn set_interrupt_vector(&self, vector: u8, handler: FarPointer) -> HostResult<()> {
        let mut state = self.state.lock();
        state.take_failure(HostCall::SetInterruptVector)?;
        state.vectors[vector as usize] = handler;
        Ok(())
    }

    fn get_exception_handler(&self, exception: u8) -> HostResult<FarPointer> {
        let mut state = self.state.lock();
        state.take_failure(HostCall::GetExceptionHandler)?;
        state
            .exceptions
            .get(exception as usize)
            .copied()
            .ok_or(HostError::new(HostCall::GetExceptionHandler, 0x8021))
    }

    fn set_exception_handler(&self, exception: u8, handler: FarPointer) -> HostResult<()> {
        let mut state = self.state.lock();
        state.take_failure(HostCall::SetExceptionHandler)?;
        match state.exceptions.get_mut(exception as usize) {
            Some(slot) => {
                *slot = handler;
                Ok(())
            }
            None => Err(HostError::new(HostCall::SetExceptionHandler, 0x8021)),
        }
    }

    fn supports_extended_frames(&self) -> bool {
        self.state.lock().extended_frames
    }

    fn irq_vector(&self, irq: u8) -> u8 {
        if irq < 8 { 0x08 + irq } else { 0x70 + (irq - 8) }
    }

    fn mask_irq(&self, irq: u8) {
        self.state.lock().pic_mask |= 1 << irq;
    }

    fn unmask_irq(&self, irq: u8) {
        let mut state = self.state.lock();
        state.pic_mask &= !(1 << irq);
        if irq >= 8 {
            state.pic_mask &= !(1 << 2);
        }
    }

    fn irq_masked(&self, irq: u8) -> bool {
        self.state.lock().pic_mask & (1 << irq) != 0
    }

    fn send_eoi(&self, irq: u8) {
        self.state.lock().eoi_count[irq as usize] += 1;
    }

    fn control_register_access(&self) -> bool {
        self.state.lock().control_register_access
    }

    fn read_cr0(&self) -> HostResult<Cr0> {
        let mut state = self.state.lock();
        state.take_failure(HostCall::ReadControlRegister)?;
        if !state.control_register_access {
            return Err(HostError::new(HostCall::ReadControlRegister, 0x8001));
        }
        Ok(state.cr0)
    }

    fn write_cr0(&self, value: Cr0) -> HostResult<()> {
        let mut state = self.state.lock();
        state.take_failure(HostCall::WriteControlRegister)?;
        if !state.control_register_access {
            return Err(HostError::new(HostCall::WriteControlRegister, 0x8001));
        }
        state.cr0 = value;
        Ok(())
    }

    fn fpu_save(&self, target: &mut FpuState) {
        let mut state = self.state.lock();
        target.bytes = state.fpu.bytes;
        state.fpu_saves += 1;
    }

    fn fpu_restore(&self, source: &FpuState) {
        let mut state = self.state.lock();
        state.fpu.bytes = source.bytes;
        state.fpu_restores += 1;
    }

    fn fpu_init(&self) {
        let mut state = self.state.lock();
        state.fpu = FpuState::new();
        state.fpu.bytes[..2].copy_from_slice(&FPU_DEFAULT_CONTROL_WORD.to_le_bytes());
    }

    fn lock_region(&self, address: usize, size: usize) -> HostResult<()> {
        let mut state = self.state.lock();
        state.take_failure(HostCall::LockRegion)?;
        state.locked_regions.push((address, size));
        Ok(())
    }

    fn unlock_region(&self, address: usize, size: usize) -> HostResult<()> {
        let mut state = self.state.lock();
        state.take_failure(HostCall::UnlockRegion)?;
        match state.locked_regions.iter().position(|r| *r == (address, size)) {
            Some(pos) => {
                state.locked_regions.swap_remove(pos);
                Ok(())
            }
            None => Err(HostError::new(HostCall::UnlockRegion, 0x8025)),
        }
    }

    fn code_selector(&self) -> u16 {
        PROGRAM_CODE_SELECTOR
    }

    fn breakpoint(&self) {
        self.state.lock().breakpoints += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_injected_failure_is_consumed_once() {
        let host = SimulatedHost::new();
        host.fail_next(HostCall::SetInterruptVector, 0x8022);
        let target = FarPointer::new(PROGRAM_CODE_SELECTOR, 0x1234);
        assert_eq!(
            host.set_interrupt_vector(0x08, target),
            Err(HostError::new(HostCall::SetInterruptVector, 0x8022))
        );
        assert_eq!(host.set_interrupt_vector(0x08, target), Ok(()));
        assert_eq!(host.get_interrupt_vector(0x08), Ok(target));
    }

    #[test]
    fn test_slave_unmask_opens_cascade() {
        let host = SimulatedHost::new();
        host.mask_irq(2);
        host.unmask_irq(12);
        assert!(!host.irq_masked(12));
        assert!(!host.irq_masked(2));
    }

    #[test]
    fn test_denied_control_register_access() {
        let host = SimulatedHost::new();
        host.set_control_register_access(false);
        assert!(host.read_cr0().is_err());
        assert!(!host.control_register_access());
    }
}
