//! 32-bit protected mode shims
//!
//! Hardware interrupt and exception handlers are entered on a stack the
//! host provides, whose selector usually differs from the program's data
//! selector. The entry stubs therefore reload the data segments, copy
//! whatever the Rust side needs into locked memory and switch to the
//! runtime's interrupt stack before calling into Rust.

use core::arch::{asm, global_asm};
use core::mem::offset_of;
use core::sync::atomic::{AtomicU16, Ordering};

use super::{GuardedFn, ThreadEntry, STACK_ALIGN};
use crate::exception::frame::{ExceptionScratch, Registers};
use crate::exception::ExceptionEntry;
use crate::interrupt::EntryHeader;

/// Program data selector, read by the entry stubs through `cs:`
static DATA_SELECTOR: AtomicU16 = AtomicU16::new(0);

/// Words in the frame saved by `pmrt_switch_context`: gs, fs, es, eflags,
/// edi, esi, ebx, ebp and the return address.
pub const SWITCH_FRAME_WORDS: usize = 9;

global_asm!(
    r#"
.section .text
.globl pmrt_switch_context
.p2align 4
pmrt_switch_context:
    mov eax, [esp + 4]
    mov edx, [esp + 8]
    push ebp
    push ebx
    push esi
    push edi
    pushfd
    push es
    push fs
    push gs
    mov [eax], esp
    mov esp, edx
    pop gs
    pop fs
    pop es
    popfd
    pop edi
    pop esi
    pop ebx
    pop ebp
    ret

.globl pmrt_thread_start
.p2align 4
pmrt_thread_start:
    push ebx
    call esi
    ud2

.globl pmrt_call_guarded
.p2align 4
pmrt_call_guarded:
    push ebp
    push ebx
    push esi
    push edi
    mov eax, [esp + 20]
    mov ecx, [esp + 24]
    mov edx, [esp + 28]
    mov [eax], esp
    sub esp, 12
    push edx
    call ecx
    add esp, 16
    xor eax, eax
    pop edi
    pop esi
    pop ebx
    pop ebp
    ret

.globl pmrt_resume_guarded
.p2align 4
pmrt_resume_guarded:
    mov eax, [esp + 8]
    mov esp, [esp + 4]
    pop edi
    pop esi
    pop ebx
    pop ebp
    ret

.globl pmrt_irq_entry
.p2align 4
pmrt_irq_entry:
    push edx
    push ebx
    push ebp
    push ds
    push es
    cld
    mov ebx, eax
    mov ax, cs:[{selector}]
    mov ds, ax
    mov es, ax
    mov ebp, esp
    push ebx
    call {acquire}
    add esp, 4
    mov dx, ss
    mov cx, ds
    mov ss, cx
    mov esp, eax
    push edx
    push ebp
    sub esp, 4
    push ebx
    call {irq_dispatch}
    add esp, 8
    pop ebp
    pop edx
    mov ss, dx
    mov esp, ebp
    mov ebp, eax
    push ebx
    call {release}
    add esp, 4
    test ebp, ebp
    jz 2f
    mov ecx, [ebx + {chain}]
    mov [esp + 28], ecx
    mov ecx, [ebx + {chain} + 4]
    mov [esp + 32], ecx
    pop es
    pop ds
    pop ebp
    pop ebx
    pop edx
    pop ecx
    pop eax
    retf
2:
    pop es
    pop ds
    pop ebp
    pop ebx
    pop edx
    pop ecx
    pop eax
    add esp, 8
    iretd

.globl pmrt_exception_entry
.p2align 4
pmrt_exception_entry:
    push edx
    push ebx
    push ebp
    push esi
    push edi
    push ds
    push es
    cld
    mov ebx, eax
    mov ax, cs:[{selector}]
    mov es, ax
    mov ecx, [esp + 8]
    mov es:[ebx + {r_edi}], ecx
    mov ecx, [esp + 12]
    mov es:[ebx + {r_esi}], ecx
    mov ecx, [esp + 16]
    mov es:[ebx + {r_ebp}], ecx
    mov ecx, [esp + 20]
    mov es:[ebx + {r_ebx}], ecx
    mov ecx, [esp + 24]
    mov es:[ebx + {r_edx}], ecx
    mov ecx, [esp + 28]
    mov es:[ebx + {r_ecx}], ecx
    mov ecx, [esp + 32]
    mov es:[ebx + {r_eax}], ecx
    lea esi, [esp + 44]
    lea edi, [ebx + {frame}]
    mov ecx, es:[ebx + {words}]
    push ss
    pop ds
    rep movsd
    mov ds, ax
    mov ebp, esp
    push ebx
    call {acquire}
    add esp, 4
    mov dx, ss
    mov cx, ds
    mov ss, cx
    mov esp, eax
    push edx
    push ebp
    sub esp, 4
    push ebx
    call {exception_dispatch}
    add esp, 8
    pop ebp
    pop edx
    mov ss, dx
    mov esp, ebp
    mov ebp, eax
    lea esi, [ebx + {frame}]
    lea edi, [esp + 44]
    mov ecx, [ebx + {words}]
    push ss
    pop es
    rep movsd
    mov cx, ds
    mov es, cx
    mov ecx, [ebx + {r_edi}]
    mov [esp + 8], ecx
    mov ecx, [ebx + {r_esi}]
    mov [esp + 12], ecx
    mov ecx, [ebx + {r_ebp}]
    mov [esp + 16], ecx
    mov ecx, [ebx + {r_ebx}]
    mov [esp + 20], ecx
    mov ecx, [ebx + {r_edx}]
    mov [esp + 24], ecx
    mov ecx, [ebx + {r_ecx}]
    mov [esp + 28], ecx
    mov ecx, [ebx + {r_eax}]
    mov [esp + 32], ecx
    push ebx
    call {release}
    add esp, 4
    test ebp, ebp
    jz 2f
    mov ecx, [ebx + {chain}]
    mov [esp + 36], ecx
    mov ecx, [ebx + {chain} + 4]
    mov [esp + 40], ecx
    pop es
    pop ds
    pop edi
    pop esi
    pop ebp
    pop ebx
    pop edx
    pop ecx
    pop eax
    retf
2:
    pop es
    pop ds
    pop edi
    pop esi
    pop ebp
    pop ebx
    pop edx
    pop ecx
    pop eax
    add esp, 8
    retf

.globl pmrt_reraise_entry
.p2align 4
pmrt_reraise_entry:
    mov ecx, [esp + 16]
    mov edx, [esp + 20]
    and esp, -16
    sub esp, 4
    push edx
    push ecx
    push eax
    call {reraise}
    ud2
"#,
    selector = sym DATA_SELECTOR,
    acquire = sym crate::interrupt::pmrt_stack_acquire,
    release = sym crate::interrupt::pmrt_stack_release,
    irq_dispatch = sym crate::interrupt::pmrt_irq_dispatch,
    exception_dispatch = sym crate::exception::pmrt_exception_dispatch,
    reraise = sym crate::exception::pmrt_reraise,
    chain = const offset_of!(EntryHeader, chain_target),
    words = const offset_of!(EntryHeader, copy_words),
    frame = const offset_of!(ExceptionEntry, scratch) + offset_of!(ExceptionScratch, frame),
    r_edi = const offset_of!(ExceptionEntry, scratch) + offset_of!(ExceptionScratch, regs) + offset_of!(Registers, edi),
    r_esi = const offset_of!(ExceptionEntry, scratch) + offset_of!(ExceptionScratch, regs) + offset_of!(Registers, esi),
    r_ebp = const offset_of!(ExceptionEntry, scratch) + offset_of!(ExceptionScratch, regs) + offset_of!(Registers, ebp),
    r_ebx = const offset_of!(ExceptionEntry, scratch) + offset_of!(ExceptionScratch, regs) + offset_of!(Registers, ebx),
    r_edx = const offset_of!(ExceptionEntry, scratch) + offset_of!(ExceptionScratch, regs) + offset_of!(Registers, edx),
    r_ecx = const offset_of!(ExceptionEntry, scratch) + offset_of!(ExceptionScratch, regs) + offset_of!(Registers, ecx),
    r_eax = const offset_of!(ExceptionEntry, scratch) + offset_of!(ExceptionScratch, regs) + offset_of!(Registers, eax),
);

unsafe extern "C" {
    fn pmrt_switch_context(save: *mut usize, target: usize);
    fn pmrt_thread_start();
    fn pmrt_call_guarded(slot: *mut usize, f: GuardedFn, arg: usize) -> usize;
    fn pmrt_resume_guarded(sp: usize, value: usize) -> !;
    fn pmrt_irq_entry();
    fn pmrt_exception_entry();
    fn pmrt_reraise_entry();
}

/// Records the program's data selector for the entry stubs
pub fn init() {
    let ds: u16;
    unsafe { asm!("mov {0:x}, ds", out(reg) ds, options(nomem, nostack, preserves_flags)) };
    DATA_SELECTOR.store(ds, Ordering::Relaxed);
}

/// Saves the callee-saved registers, flags and segments on the current
/// stack, stores the stack pointer in `*save` and resumes `target`.
///
/// # Safety
///
/// `target` must come from a previous switch or from [`prepare_stack`], and
/// its stack must still be alive.
#[inline]
pub unsafe fn switch_context(save: *mut usize, target: usize) {
    unsafe { pmrt_switch_context(save, target) }
}

/// Builds the frame a new thread starts from.
///
/// # Safety
///
/// `top` must be the end of a writable stack region of at least
/// `SWITCH_FRAME_WORDS + 3` words, aligned to [`STACK_ALIGN`].
pub unsafe fn prepare_stack(top: usize, entry: ThreadEntry, arg: usize) -> usize {
    debug_assert_eq!(top % STACK_ALIGN, 0);
    let (es, fs, gs, flags): (u16, u16, u16, usize);
    unsafe {
        asm!(
            "mov {0:x}, es",
            "mov {1:x}, fs",
            "mov {2:x}, gs",
            out(reg) es,
            out(reg) fs,
            out(reg) gs,
            options(nomem, nostack, preserves_flags),
        );
        asm!("pushfd", "pop {}", out(reg) flags, options(nomem, preserves_flags));
    }
    // pmrt_thread_start pushes the argument; the call must see a 16-byte
    // aligned stack.
    let sp = top - 48;
    let frame = sp as *mut usize;
    unsafe {
        frame.write(gs as usize);
        frame.add(1).write(fs as usize);
        frame.add(2).write(es as usize);
        frame.add(3).write(flags);
        frame.add(4).write(0); // edi
        frame.add(5).write(entry as *const () as usize); // esi
        frame.add(6).write(arg); // ebx
        frame.add(7).write(0); // ebp
        frame.add(8).write(pmrt_thread_start as *const () as usize);
    }
    sp
}

/// See the x86-64 variant.
///
/// # Safety
///
/// `*slot` is only valid while `f` runs.
pub unsafe fn call_guarded(slot: *mut usize, f: GuardedFn, arg: usize) -> usize {
    unsafe { pmrt_call_guarded(slot, f, arg) }
}

/// See the x86-64 variant.
///
/// # Safety
///
/// The guarded call must still be active. Frames between the two points are
/// discarded without running destructors.
pub unsafe fn resume_guarded(sp: usize, value: usize) -> ! {
    unsafe { pmrt_resume_guarded(sp, value) }
}

pub fn irq_entry_address() -> usize {
    pmrt_irq_entry as *const () as usize
}

pub fn reraise_entry_address() -> usize {
    pmrt_reraise_entry as *const () as usize
}

pub fn exception_entry_address() -> usize {
    pmrt_exception_entry as *const () as usize
}
