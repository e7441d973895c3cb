//! DPMI host
//!
//! [`Host`] implementation for a 32-bit DPMI client. Vector and memory
//! services go through the `int 0x31` call gate, the PIC is driven with
//! port I/O and the coprocessor with `fxsave`/`fxrstor`.

use core::arch::asm;

use crate::error::{HostError, HostResult};
use crate::host::{Cr0, FarPointer, FpuState, Host, HostCall};

const PIC1_CMD: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_CMD: u16 = 0xa0;
const PIC2_DATA: u16 = 0xa1;
const PIC_EOI: u8 = 0x20;

#[inline]
unsafe fn inb(port: u16) -> u8 {
    let value: u8;
    unsafe { asm!("in al, dx", out("al") value, in("dx") port, options(nomem, nostack, preserves_flags)) };
    value
}

#[inline]
unsafe fn outb(port: u16, value: u8) {
    unsafe { asm!("out dx, al", in("dx") port, in("al") value, options(nomem, nostack, preserves_flags)) };
}

/// Host services of a DPMI 0.9/1.0 server
pub struct DpmiHost {
    master_base: u8,
    slave_base: u8,
    major_version: u8,
}

impl DpmiHost {
    /// Queries the host version and PIC bases (function 0x0400)
    pub fn new() -> Self {
        let ax: u16;
        let dx: u16;
        unsafe {
            asm!(
                "int 0x31",
                inout("ax") 0x0400u16 => ax,
                out("bx") _,
                out("cx") _,
                out("dx") dx,
            );
        }
        Self {
            master_base: (dx >> 8) as u8,
            slave_base: dx as u8,
            major_version: (ax >> 8) as u8,
        }
    }

    fn get_vector(function: u16, number: u8, call: HostCall) -> HostResult<FarPointer> {
        let selector: u16;
        let offset: u32;
        let failed: u8;
        let code: u16;
        unsafe {
            asm!(
                "int 0x31",
                "setc {failed}",
                failed = out(reg_byte) failed,
                inout("ax") function => code,
                in("bl") number,
                out("cx") selector,
                out("edx") offset,
            );
        }
        if failed != 0 {
            return Err(HostError::new(call, code));
        }
        Ok(FarPointer::new(selector, offset as usize))
    }

    fn set_vector(function: u16, number: u8, handler: FarPointer, call: HostCall) -> HostResult<()> {
        let failed: u8;
        let code: u16;
        unsafe {
            asm!(
                "int 0x31",
                "setc {failed}",
                failed = out(reg_byte) failed,
                inout("ax") function => code,
                in("bl") number,
                in("cx") handler.selector,
                in("edx") handler.offset as u32,
            );
        }
        if failed != 0 {
            return Err(HostError::new(call, code));
        }
        Ok(())
    }

    fn region_call(function: u16, address: usize, size: usize, call: HostCall) -> HostResult<()> {
        let failed: u8;
        let code: u16;
        unsafe {
            asm!(
                "push esi",
                "mov esi, {size_hi:e}",
                "int 0x31",
                "setc {failed}",
                "pop esi",
                size_hi = in(reg) (size >> 16) as u32,
                failed = out(reg_byte) failed,
                inout("ax") function => code,
                in("bx") (address >> 16) as u16,
                in("cx") address as u16,
                in("di") size as u16,
            );
        }
        if failed != 0 {
            return Err(HostError::new(call, code));
        }
        Ok(())
    }

    fn pic_data_port(irq: u8) -> (u16, u8) {
        if irq < 8 { (PIC1_DATA, irq) } else { (PIC2_DATA, irq - 8) }
    }
}

impl Default for DpmiHost {
    fn default() -> Self {
        Self::new()
    }
}

impl Host for DpmiHost {
    fn disable_interrupts(&self) -> bool {
        let ax: u16;
        unsafe { asm!("int 0x31", inout("ax") 0x0900u16 => ax) };
        ax as u8 != 0
    }

    fn enable_interrupts(&self) {
        unsafe { asm!("int 0x31", inout("ax") 0x0901u16 => _) };
    }

    fn interrupts_enabled(&self) -> bool {
        let ax: u16;
        unsafe { asm!("int 0x31", inout("ax") 0x0902u16 => ax) };
        ax as u8 != 0
    }

    fn get_interrupt_vector(&self, vector: u8) -> HostResult<FarPointer> {
        Self::get_vector(0x0204, vector, HostCall::GetInterruptVector)
    }

    fn set_interrupt_vector(&self, vector: u8, handler: FarPointer) -> HostResult<()> {
        Self::set_vector(0x0205, vector, handler, HostCall::SetInterruptVector)
    }

    fn get_exception_handler(&self, exception: u8) -> HostResult<FarPointer> {
        let function = if self.supports_extended_frames() { 0x0210 } else { 0x0202 };
        Self::get_vector(function, exception, HostCall::GetExceptionHandler)
    }

    fn set_exception_handler(&self, exception: u8, handler: FarPointer) -> HostResult<()> {
        let function = if self.supports_extended_frames() { 0x0212 } else { 0x0203 };
        Self::set_vector(function, exception, handler, HostCall::SetExceptionHandler)
    }

    fn supports_extended_frames(&self) -> bool {
        self.major_version >= 1
    }

    fn irq_vector(&self, irq: u8) -> u8 {
        if irq < 8 { self.master_base + irq } else { self.slave_base + (irq - 8) }
    }

    fn mask_irq(&self, irq: u8) {
        let (port, bit) = Self::pic_data_port(irq);
        unsafe { outb(port, inb(port) | (1 << bit)) };
    }

    fn unmask_irq(&self, irq: u8) {
        let (port, bit) = Self::pic_data_port(irq);
        unsafe {
            outb(port, inb(port) & !(1 << bit));
            if irq >= 8 {
                outb(PIC1_DATA, inb(PIC1_DATA) & !(1 << 2));
            }
        }
    }

    fn irq_masked(&self, irq: u8) -> bool {
        let (port, bit) = Self::pic_data_port(irq);
        unsafe { inb(port) & (1 << bit) != 0 }
    }

    fn send_eoi(&self, irq: u8) {
        unsafe {
            if irq >= 8 {
                outb(PIC2_CMD, PIC_EOI);
            }
            outb(PIC1_CMD, PIC_EOI);
        }
    }

    fn control_register_access(&self) -> bool {
        // Only a ring 0 client may touch CR0.
        self.code_selector() & 3 == 0
    }

    fn read_cr0(&self) -> HostResult<Cr0> {
        if !self.control_register_access() {
            return Err(HostError::new(HostCall::ReadControlRegister, 0x8001));
        }
        let value: u32;
        unsafe { asm!("mov {}, cr0", out(reg) value, options(nomem, nostack)) };
        Ok(Cr0::from_bits_retain(value))
    }

    fn write_cr0(&self, value: Cr0) -> HostResult<()> {
        if !self.control_register_access() {
            return Err(HostError::new(HostCall::WriteControlRegister, 0x8001));
        }
        unsafe { asm!("mov cr0, {}", in(reg) value.bits(), options(nostack)) };
        Ok(())
    }

    fn fpu_save(&self, state: &mut FpuState) {
        unsafe { asm!("fxsave [{}]", in(reg) state.bytes.as_mut_ptr(), options(nostack)) };
    }

    fn fpu_restore(&self, state: &FpuState) {
        unsafe { asm!("fxrstor [{}]", in(reg) state.bytes.as_ptr(), options(nostack)) };
    }

    fn fpu_init(&self) {
        unsafe { asm!("fninit", options(nomem, nostack)) };
    }

    fn lock_region(&self, address: usize, size: usize) -> HostResult<()> {
        Self::region_call(0x0600, address, size, HostCall::LockRegion)
    }

    fn unlock_region(&self, address: usize, size: usize) -> HostResult<()> {
        Self::region_call(0x0601, address, size, HostCall::UnlockRegion)
    }

    fn code_selector(&self) -> u16 {
        let cs: u16;
        unsafe { asm!("mov {0:x}, cs", out(reg) cs, options(nomem, nostack, preserves_flags)) };
        cs
    }

    fn breakpoint(&self) {
        unsafe { asm!("int3", options(nomem, nostack)) };
    }
}
