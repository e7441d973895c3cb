//! Register and fault frame layouts
//!
//! The host calls an exception handler with a far return address and the
//! fault frame on its own stack. Hosts implementing DPMI 1.0 additionally
//! place an extended frame, with the segment registers and the page fault
//! address, right after the 0.9 frame. The entry stub copies both into an
//! [`ExceptionScratch`] in locked memory and copies them back on return.

use core::fmt;
use core::mem::{offset_of, size_of};
use core::ptr::NonNull;

use pmrt_api::FarPointer;
use static_assertions::{assert_eq_size, const_assert_eq};

/// General purpose registers at the time of the fault, in `pushad` order.
///
/// `esp` is the handler's own stack pointer as `pushad` saw it; the
/// faulting stack pointer is part of the [`ExceptionFrame`].
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Registers {
    pub edi: usize,
    pub esi: usize,
    pub ebp: usize,
    pub esp: usize,
    pub ebx: usize,
    pub edx: usize,
    pub ecx: usize,
    pub eax: usize,
}

/// DPMI 0.9 exception frame
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExceptionFrame {
    /// Where the handler returns to inside the host
    pub return_eip: usize,
    pub return_cs: usize,
    pub error_code: usize,
    /// Faulting instruction
    pub eip: usize,
    pub cs: usize,
    pub eflags: usize,
    pub esp: usize,
    pub ss: usize,
}

/// DPMI 1.0 exception frame
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtendedFrame {
    pub frame: ExceptionFrame,
    pub es: usize,
    pub ds: usize,
    pub fs: usize,
    pub gs: usize,
    /// Linear fault address of a page fault
    pub cr2: usize,
    pub pte: usize,
}

/// Words the entry stub copies for a 0.9 frame
pub const FRAME_WORDS: usize = size_of::<ExceptionFrame>() / size_of::<usize>();
/// Words the entry stub copies when the host delivers extended frames
pub const EXTENDED_FRAME_WORDS: usize = FRAME_WORDS + size_of::<ExtendedFrame>() / size_of::<usize>();

/// Everything the entry stub saves for one exception level
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExceptionScratch {
    pub regs: Registers,
    pub frame: ExceptionFrame,
    pub extended: ExtendedFrame,
}

assert_eq_size!(Registers, [usize; 8]);
assert_eq_size!(ExceptionFrame, [usize; 8]);
assert_eq_size!(ExtendedFrame, [usize; 14]);
const_assert_eq!(
    offset_of!(ExceptionScratch, extended),
    offset_of!(ExceptionScratch, frame) + size_of::<ExceptionFrame>()
);

/// Short name of an exception vector
pub fn exception_name(vector: u8) -> &'static str {
    match vector {
        0x00 => "divide error",
        0x01 => "debug",
        0x02 => "non-maskable interrupt",
        0x03 => "breakpoint",
        0x04 => "overflow",
        0x05 => "bound range exceeded",
        0x06 => "invalid opcode",
        0x07 => "device not available",
        0x08 => "double fault",
        0x09 => "coprocessor segment overrun",
        0x0a => "invalid TSS",
        0x0b => "segment not present",
        0x0c => "stack segment fault",
        0x0d => "general protection fault",
        0x0e => "page fault",
        0x10 => "x87 floating point error",
        0x11 => "alignment check",
        0x12 => "machine check",
        0x13 => "SIMD floating point error",
        _ => "unknown exception",
    }
}

/// View of one exception occurrence handed to exception handlers.
///
/// Changes made through [`frame_mut`](Self::frame_mut) and
/// [`registers_mut`](Self::registers_mut) take effect when the handler
/// reports the fault as handled and the host resumes the program.
pub struct ExceptionState {
    vector: u8,
    scratch: NonNull<ExceptionScratch>,
    extended: bool,
    fpu_status: Option<u16>,
}

impl ExceptionState {
    /// # Safety
    ///
    /// `scratch` must stay valid and unaliased for the life of the state.
    pub(crate) unsafe fn new(
        vector: u8,
        scratch: NonNull<ExceptionScratch>,
        extended: bool,
        fpu_status: Option<u16>,
    ) -> Self {
        Self { vector, scratch, extended, fpu_status }
    }

    fn scratch(&self) -> &ExceptionScratch {
        unsafe { self.scratch.as_ref() }
    }

    fn scratch_mut(&mut self) -> &mut ExceptionScratch {
        unsafe { self.scratch.as_mut() }
    }

    pub fn vector(&self) -> u8 {
        self.vector
    }

    pub fn registers(&self) -> &Registers {
        &self.scratch().regs
    }

    pub fn registers_mut(&mut self) -> &mut Registers {
        &mut self.scratch_mut().regs
    }

    /// The frame the host resumes from
    pub fn frame(&self) -> &ExceptionFrame {
        let scratch = self.scratch();
        if self.extended { &scratch.extended.frame } else { &scratch.frame }
    }

    pub fn frame_mut(&mut self) -> &mut ExceptionFrame {
        let extended = self.extended;
        let scratch = self.scratch_mut();
        if extended { &mut scratch.extended.frame } else { &mut scratch.frame }
    }

    /// DPMI 1.0 fields, if the host provides them
    pub fn extended(&self) -> Option<&ExtendedFrame> {
        self.extended.then(|| &self.scratch().extended)
    }

    /// Faulting instruction
    pub fn fault_address(&self) -> FarPointer {
        let frame = self.frame();
        FarPointer::new(frame.cs as u16, frame.eip)
    }

    pub fn error_code(&self) -> usize {
        self.frame().error_code
    }

    /// FPU status word at the time of a numeric fault
    pub fn fpu_status(&self) -> Option<u16> {
        self.fpu_status
    }
}

impl fmt::Debug for ExceptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExceptionState")
            .field("vector", &self.vector)
            .field("frame", self.frame())
            .field("registers", self.registers())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extended_frame_selects_resume_frame() {
        let mut scratch = ExceptionScratch::default();
        scratch.frame.eip = 0x1000;
        scratch.extended.frame.eip = 0x2000;
        scratch.extended.cr2 = 0xdead_0000;
        let ptr = NonNull::from(&mut scratch);

        let plain = unsafe { ExceptionState::new(0x0e, ptr, false, None) };
        assert_eq!(plain.frame().eip, 0x1000);
        assert!(plain.extended().is_none());
        drop(plain);

        let mut ext = unsafe { ExceptionState::new(0x0e, ptr, true, None) };
        assert_eq!(ext.frame().eip, 0x2000);
        assert_eq!(ext.extended().map(|e| e.cr2), Some(0xdead_0000));
        ext.frame_mut().eip = 0x3000;
        drop(ext);
        assert_eq!(scratch.extended.frame.eip, 0x3000);
        assert_eq!(scratch.frame.eip, 0x1000);
    }

    #[test]
    fn test_copy_sizes() {
        assert_eq!(FRAME_WORDS, 8);
        assert_eq!(EXTENDED_FRAME_WORDS, 22);
        assert_eq!(exception_name(0x0d), "general protection fault");
    }
}
