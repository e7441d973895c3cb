//! Platform shims
//!
//! Everything that depends on the instruction set lives here: the
//! cooperative context switch, initial thread stack frames, guarded calls
//! that a fault can resume, and the trampoline code blocks installed as
//! interrupt and exception vectors.
//!
//! The portable code above this module only sees saved stack pointers
//! (`usize`) and trampoline addresses.

#[cfg(target_arch = "x86")]
mod x86;
#[cfg(target_arch = "x86")]
pub use x86::*;

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use x86_64::*;

pub mod trampoline;

pub use trampoline::Trampoline;

/// Alignment of thread stacks and of the stack top handed to [`prepare_stack`]
pub const STACK_ALIGN: usize = 16;

/// Entry point of a new thread, called with the argument given to
/// [`prepare_stack`]. It must never return.
pub type ThreadEntry = extern "C" fn(usize) -> !;

/// Function run by [`call_guarded`]
pub type GuardedFn = unsafe extern "C" fn(usize);
