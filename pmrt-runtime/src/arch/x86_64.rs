//! x86-64 (System V) shims
//!
//! The runtime targets 32-bit DPMI programs; this variant exists so the
//! scheduler and fault recovery run natively on a 64-bit development host.

use core::arch::global_asm;

use super::{GuardedFn, ThreadEntry, STACK_ALIGN};

/// Initial MXCSR: all exceptions masked, round to nearest
const INITIAL_MXCSR: u32 = 0x1f80;
/// Initial x87 control word: all exceptions masked, 64-bit precision
const INITIAL_FCW: u16 = 0x037f;

/// Words in the frame saved by `pmrt_switch_context`: MXCSR/FCW,
/// r15, r14, r13, r12, rbx, rbp and the return address.
pub const SWITCH_FRAME_WORDS: usize = 8;

global_asm!(
    r#"
.section .text
.globl pmrt_switch_context
.p2align 4
pmrt_switch_context:
    push rbp
    push rbx
    push r12
    push r13
    push r14
    push r15
    sub rsp, 8
    stmxcsr [rsp]
    fnstcw [rsp + 4]
    mov [rdi], rsp
    mov rsp, rsi
    ldmxcsr [rsp]
    fldcw [rsp + 4]
    add rsp, 8
    pop r15
    pop r14
    pop r13
    pop r12
    pop rbx
    pop rbp
    ret

.globl pmrt_thread_start
.p2align 4
pmrt_thread_start:
    mov rdi, rbx
    call r12
    ud2

.globl pmrt_call_guarded
.p2align 4
pmrt_call_guarded:
    push rbp
    push rbx
    push r12
    push r13
    push r14
    push r15
    sub rsp, 8
    stmxcsr [rsp]
    fnstcw [rsp + 4]
    mov [rdi], rsp
    mov rdi, rdx
    call rsi
    xor eax, eax
    add rsp, 8
    pop r15
    pop r14
    pop r13
    pop r12
    pop rbx
    pop rbp
    ret

.globl pmrt_resume_guarded
.p2align 4
pmrt_resume_guarded:
    mov rax, rsi
    mov rsp, rdi
    ldmxcsr [rsp]
    fldcw [rsp + 4]
    add rsp, 8
    pop r15
    pop r14
    pop r13
    pop r12
    pop rbx
    pop rbp
    ret
"#
);

unsafe extern "C" {
    fn pmrt_switch_context(save: *mut usize, target: usize);
    fn pmrt_thread_start();
    fn pmrt_call_guarded(slot: *mut usize, f: GuardedFn, arg: usize) -> usize;
    fn pmrt_resume_guarded(sp: usize, value: usize) -> !;
}

/// Saves the callee-saved registers on the current stack, stores the stack
/// pointer in `*save` and resumes the context saved at `target`.
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
/// The first switch to the returned pointer calls `entry(arg)` with a
/// correctly aligned stack.
///
/// # Safety
///
/// `top` must be the end of a writable stack region of at least
/// `SWITCH_FRAME_WORDS` words, aligned to [`STACK_ALIGN`].
pub unsafe fn prepare_stack(top: usize, entry: ThreadEntry, arg: usize) -> usize {
    debug_assert_eq!(top % STACK_ALIGN, 0);
    let sp = top - SWITCH_FRAME_WORDS * 8;
    let frame = sp as *mut usize;
    unsafe {
        frame.write((INITIAL_FCW as usize) << 32 | INITIAL_MXCSR as usize);
        frame.add(1).write(0); // r15
        frame.add(2).write(0); // r14
        frame.add(3).write(0); // r13
        frame.add(4).write(entry as *const () as usize); // r12
        frame.add(5).write(arg); // rbx
        frame.add(6).write(0); // rbp
        frame.add(7).write(pmrt_thread_start as *const () as usize);
    }
    sp
}

/// Calls `f(arg)` after saving a context that [`resume_guarded`] can return
/// to. Returns 0 when `f` returns normally, or the value passed to
/// [`resume_guarded`].
///
/// # Safety
///
/// `*slot` is only valid while `f` runs.
pub unsafe fn call_guarded(slot: *mut usize, f: GuardedFn, arg: usize) -> usize {
    unsafe { pmrt_call_guarded(slot, f, arg) }
}

/// Abandons the current stack and returns `value` from the
/// [`call_guarded`] invocation that filled `sp`.
///
/// # Safety
///
/// The guarded call must still be active. Frames between the two points are
/// discarded without running destructors.
pub unsafe fn resume_guarded(sp: usize, value: usize) -> ! {
    unsafe { pmrt_resume_guarded(sp, value) }
}

/// Address interrupt trampolines jump to. Trampolines are not executed on
/// this target; the simulated host decodes them and calls the dispatcher.
pub fn irq_entry_address() -> usize {
    crate::interrupt::pmrt_irq_dispatch as *const () as usize
}

/// Address the exception trampoline of the re-raise path jumps to
pub fn reraise_entry_address() -> usize {
    crate::exception::pmrt_reraise as *const () as usize
}

/// Address exception trampolines jump to
pub fn exception_entry_address() -> usize {
    crate::exception::pmrt_exception_dispatch as *const () as usize
}

/// Records the data selector used by the entry stubs. Nothing to do here.
pub fn init() {}
