//! CPU exception bridge
//!
//! Exception handlers are chained per vector just like interrupt handlers,
//! newest first, and each returns whether it fully handled the fault. The
//! runtime's own handler for the re-raised vectors turns a fault in the
//! program's code into a [`CpuException`] returned from the innermost
//! [`catch_faults`] call: it rewrites the fault frame so that, once the
//! host resumes, control enters a trampoline that abandons the faulting
//! stack and resumes the recovery point.
//!
//! Faults raised while the host itself runs, outside the configured code
//! range, or while another re-raise is still on its way fall through to the
//! previously installed handler.

pub mod bridge;
pub mod frame;
pub mod recovery;

use core::fmt;

use pmrt_api::{CpuFault, Error, FarPointer};

pub use bridge::{ExceptionBridge, ExceptionEntry, ExceptionHandlerId};
pub use frame::{ExceptionFrame, ExceptionState, ExtendedFrame, Registers, exception_name};
pub use recovery::catch_faults;

/// Snapshot of the most recently re-raised fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultRecord {
    pub vector: u8,
    pub registers: Registers,
    pub frame: ExceptionFrame,
    /// DPMI 1.0 fields
    pub extended: Option<ExtendedFrame>,
    /// FPU status word for numeric faults
    pub fpu_status: Option<u16>,
}

impl FaultRecord {
    pub(crate) fn capture(state: &ExceptionState) -> Self {
        Self {
            vector: state.vector(),
            registers: *state.registers(),
            frame: *state.frame(),
            extended: state.extended().copied(),
            fpu_status: state.fpu_status(),
        }
    }

    pub fn fault_address(&self) -> FarPointer {
        FarPointer::new(self.frame.cs as u16, self.frame.eip)
    }
}

/// A processor fault converted into an error value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuException {
    vector: u8,
    name: &'static str,
    record: FaultRecord,
}

impl CpuException {
    pub(crate) fn new(record: FaultRecord) -> Self {
        Self {
            vector: record.vector,
            name: exception_name(record.vector),
            record,
        }
    }

    pub fn vector(&self) -> u8 {
        self.vector
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn record(&self) -> &FaultRecord {
        &self.record
    }

    pub fn fault_address(&self) -> FarPointer {
        self.record.fault_address()
    }
}

impl fmt::Display for CpuException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = &self.record;
        write!(
            f,
            "{} (exception {:#04x}) at {}, error code {:#x}",
            self.name,
            self.vector,
            r.fault_address(),
            r.frame.error_code
        )?;
        write!(
            f,
            "\n  eax={:#010x} ebx={:#010x} ecx={:#010x} edx={:#010x}",
            r.registers.eax, r.registers.ebx, r.registers.ecx, r.registers.edx
        )?;
        write!(
            f,
            "\n  esi={:#010x} edi={:#010x} ebp={:#010x} esp={:#010x}",
            r.registers.esi, r.registers.edi, r.registers.ebp, r.frame.esp
        )?;
        write!(f, "\n  ss={:#06x} eflags={:#010x}", r.frame.ss, r.frame.eflags)?;
        if let Some(ext) = &r.extended {
            write!(
                f,
                "\n  ds={:#06x} es={:#06x} fs={:#06x} gs={:#06x} cr2={:#010x}",
                ext.ds, ext.es, ext.fs, ext.gs, ext.cr2
            )?;
        }
        if let Some(status) = r.fpu_status {
            write!(f, "\n  fpu status={:#06x}", status)?;
        }
        Ok(())
    }
}

impl From<CpuException> for Error {
    fn from(exception: CpuException) -> Self {
        Error::Cpu(CpuFault {
            vector: exception.vector,
            address: exception.fault_address(),
            error_code: exception.record.frame.error_code,
        })
    }
}

/// Called by the exception entry stub on the interrupt stack. Returns
/// non-zero to chain to the previous handler.
pub(crate) unsafe extern "C" fn pmrt_exception_dispatch(entry: *const ExceptionEntry) -> usize {
    usize::from(!unsafe { &*entry }.dispatch())
}

/// Entered through the re-raise trampoline on the faulting thread's stack
pub(crate) unsafe extern "C" fn pmrt_reraise(bridge: *const ExceptionBridge, vector: usize, address: usize) -> ! {
    unsafe { &*bridge }.deliver(vector as u8, address)
}
