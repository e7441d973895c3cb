//! Fault recovery points
//!
//! [`catch_faults`] runs a closure behind a saved context. A re-raised
//! fault abandons the faulting frames and resumes that context, so the
//! closure's locals are leaked rather than dropped.

use core::ptr;

use super::CpuException;
use crate::arch;
use crate::cpu::Cpu;
use crate::debug;

struct RecoveryPoint {
    saved_sp: usize,
    prev: usize,
    mask_depth: usize,
    exception: Option<CpuException>,
}

struct GuardedCall<F, R> {
    f: Option<F>,
    result: Option<R>,
}

unsafe extern "C" fn run_guarded<F: FnOnce() -> R, R>(arg: usize) {
    let call = unsafe { &mut *(arg as *mut GuardedCall<F, R>) };
    if let Some(f) = call.f.take() {
        call.result = Some(f());
    }
}

/// Runs `f`, converting a processor fault raised by the running thread
/// inside it into `Err`.
///
/// Only faults on the re-raised vectors, taken in the program's own code,
/// are converted.
pub fn catch_faults<F, R>(cpu: &Cpu, f: F) -> Result<R, CpuException>
where
    F: FnOnce() -> R,
{
    let mut point = RecoveryPoint {
        saved_sp: 0,
        prev: cpu.recovery(),
        mask_depth: cpu.mask_depth(),
        exception: None,
    };
    let mut call = GuardedCall { f: Some(f), result: None };
    let point_ptr = ptr::addr_of_mut!(point);
    let call_ptr = ptr::addr_of_mut!(call);

    cpu.set_recovery(point_ptr as usize);
    let resumed = unsafe {
        arch::call_guarded(ptr::addr_of_mut!((*point_ptr).saved_sp), run_guarded::<F, R>, call_ptr as usize)
    };
    let point = unsafe { &mut *point_ptr };
    cpu.set_recovery(point.prev);

    if resumed != 0 {
        cpu.restore_mask_depth(point.mask_depth);
        return match point.exception.take() {
            Some(exception) => Err(exception),
            None => debug::fatal(cpu, format_args!("fault recovery resumed without an exception")),
        };
    }
    match unsafe { &mut *call_ptr }.result.take() {
        Some(result) => Ok(result),
        None => debug::fatal(cpu, format_args!("guarded call returned without a result")),
    }
}

/// Resumes the innermost recovery point of the running thread with
/// `exception`. Without one the fault is fatal.
pub(crate) fn resume(cpu: &Cpu, exception: CpuException) -> ! {
    let point = cpu.recovery() as *mut RecoveryPoint;
    if point.is_null() {
        debug::fatal(cpu, format_args!("unhandled {}", exception));
    }
    unsafe {
        (*point).exception = Some(exception);
        arch::resume_guarded((*point).saved_sp, 1)
    }
}
