//! Host interface
//!
//! Everything the runtime needs from the protected-mode host and from the
//! CPU goes through the [`Host`] trait: interrupt flag control, vector and
//! exception handler installation, the 8259 PIC, control registers, numeric
//! coprocessor state and memory locking.
//!
//! Two implementations exist. `DpmiHost` talks to a DPMI host through the
//! `int 0x31` call gate on the 32-bit x86 target. `SimulatedHost` (feature
//! `sim`) keeps the whole machine state in memory so the runtime can be
//! exercised on a development machine.

use core::fmt;

use bitflags::bitflags;
use static_assertions::const_assert_eq;

use crate::error::HostResult;

#[cfg(target_arch = "x86")]
pub mod dpmi;

/// Number of hardware interrupt lines served by the cascaded 8259 pair
pub const IRQ_LINES: u8 = 16;

/// Size of an FXSAVE area
pub const FPU_STATE_SIZE: usize = 512;

/// Host functions that can fail, used to tag [`HostError`](crate::error::HostError)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostCall {
    GetInterruptVector,
    SetInterruptVector,
    GetExceptionHandler,
    SetExceptionHandler,
    LockRegion,
    UnlockRegion,
    ReadControlRegister,
    WriteControlRegister,
}

impl fmt::Display for HostCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HostCall::GetInterruptVector => "get interrupt vector",
            HostCall::SetInterruptVector => "set interrupt vector",
            HostCall::GetExceptionHandler => "get exception handler",
            HostCall::SetExceptionHandler => "set exception handler",
            HostCall::LockRegion => "lock linear region",
            HostCall::UnlockRegion => "unlock linear region",
            HostCall::ReadControlRegister => "read control register",
            HostCall::WriteControlRegister => "write control register",
        };
        f.write_str(name)
    }
}

/// A selector:offset pair naming a handler entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FarPointer {
    pub selector: u16,
    pub offset: usize,
}

impl FarPointer {
    pub const fn new(selector: u16, offset: usize) -> Self {
        Self { selector, offset }
    }
}

impl fmt::Display for FarPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:08x}", self.selector, self.offset)
    }
}

bitflags! {
    /// CR0 bits the runtime touches
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Cr0: u32 {
        const PROTECTION_ENABLE = 1 << 0;
        const MONITOR_COPROCESSOR = 1 << 1;
        const EMULATION = 1 << 2;
        const TASK_SWITCHED = 1 << 3;
        const NUMERIC_ERROR = 1 << 5;
    }
}

/// Saved numeric coprocessor state (FXSAVE layout)
#[repr(C, align(16))]
#[derive(Clone)]
pub struct FpuState {
    pub bytes: [u8; FPU_STATE_SIZE],
}

const_assert_eq!(core::mem::size_of::<FpuState>(), FPU_STATE_SIZE);

impl FpuState {
    pub const fn new() -> Self {
        Self { bytes: [0; FPU_STATE_SIZE] }
    }

    /// FPU control word (offset 0 of the FXSAVE area)
    pub fn control_word(&self) -> u16 {
        u16::from_le_bytes([self.bytes[0], self.bytes[1]])
    }

    /// FPU status word (offset 2 of the FXSAVE area)
    pub fn status_word(&self) -> u16 {
        u16::from_le_bytes([self.bytes[2], self.bytes[3]])
    }
}

impl Default for FpuState {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FpuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FpuState")
            .field("control_word", &self.control_word())
            .field("status_word", &self.status_word())
            .finish()
    }
}

/// Condensed description of a CPU fault, small enough to travel inside
/// [`Error`](crate::error::Error).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuFault {
    pub vector: u8,
    pub address: FarPointer,
    pub error_code: usize,
}

impl fmt::Display for CpuFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "exception {:#04x} at {}, error code {:#x}",
            self.vector, self.address, self.error_code
        )
    }
}

/// Interface to the protected-mode host and the processor.
///
/// Methods returning [`HostResult`] map one-to-one to host calls; the rest
/// are plain instructions or port I/O that cannot fail.
pub trait Host: Send + Sync {
    /// Disables interrupts, returning whether they were enabled before
    fn disable_interrupts(&self) -> bool;
    fn enable_interrupts(&self);
    fn interrupts_enabled(&self) -> bool;

    fn get_interrupt_vector(&self, vector: u8) -> HostResult<FarPointer>;
    fn set_interrupt_vector(&self, vector: u8, handler: FarPointer) -> HostResult<()>;
    fn get_exception_handler(&self, exception: u8) -> HostResult<FarPointer>;
    fn set_exception_handler(&self, exception: u8, handler: FarPointer) -> HostResult<()>;
    /// Whether exception handlers receive the extended (DPMI 1.0) frame
    fn supports_extended_frames(&self) -> bool;

    /// Interrupt vector the PIC raises for `irq`
    fn irq_vector(&self, irq: u8) -> u8;
    fn mask_irq(&self, irq: u8);
    fn unmask_irq(&self, irq: u8);
    fn irq_masked(&self, irq: u8) -> bool;
    fn send_eoi(&self, irq: u8);

    /// Checked at run time: may CR0 be read and written at all?
    fn control_register_access(&self) -> bool;
    fn read_cr0(&self) -> HostResult<Cr0>;
    fn write_cr0(&self, value: Cr0) -> HostResult<()>;

    fn fpu_save(&self, state: &mut FpuState);
    fn fpu_restore(&self, state: &FpuState);
    /// Resets the live coprocessor state
    fn fpu_init(&self);

    fn lock_region(&self, address: usize, size: usize) -> HostResult<()>;
    fn unlock_region(&self, address: usize, size: usize) -> HostResult<()>;

    /// Code selector of the program running under the host
    fn code_selector(&self) -> u16;
    fn breakpoint(&self);
}
