//! Debug toggle, breakpoints and runtime assertions

use core::fmt;

use log::error;

use crate::cpu::Cpu;

/// Traps into an attached debugger when the debug toggle is on
pub fn breakpoint(cpu: &Cpu) {
    if cpu.debug_enabled() {
        cpu.host().breakpoint();
    }
}

/// Reports a failed assertion: logs it, traps, then panics
#[cold]
pub fn assertion_failed(cpu: &Cpu, args: fmt::Arguments<'_>) -> ! {
    error!(target: "pmrt", "assertion failed: {}", args);
    breakpoint(cpu);
    panic!("assertion failed: {}", args);
}

/// Checks a runtime invariant while the debug toggle is on
#[macro_export]
macro_rules! runtime_assert {
    ($cpu:expr, $cond:expr, $($arg:tt)+) => {
        if $cpu.debug_enabled() && !$cond {
            $crate::debug::assertion_failed($cpu, format_args!($($arg)+));
        }
    };
}

/// Reports an unrecoverable condition. Unlike [`runtime_assert!`] this is
/// checked regardless of the debug toggle.
#[cold]
pub fn fatal(cpu: &Cpu, args: fmt::Arguments<'_>) -> ! {
    error!(target: "pmrt", "fatal: {}", args);
    breakpoint(cpu);
    panic!("{}", args);
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use pmrt_api::sim::SimulatedHost;
    use pmrt_memory::LockedHeap;

    fn cpu(host: &Arc<SimulatedHost>, debug: bool) -> Cpu {
        let heap = Arc::new(LockedHeap::new(host.clone()));
        Cpu::new(host.clone(), heap, true, debug).unwrap()
    }

    #[test]
    fn test_breakpoint_follows_toggle() {
        let host = Arc::new(SimulatedHost::new());
        let cpu = cpu(&host, false);
        breakpoint(&cpu);
        assert_eq!(host.breakpoints(), 0);
        cpu.set_debug(true);
        breakpoint(&cpu);
        assert_eq!(host.breakpoints(), 1);
    }

    #[test]
    fn test_assert_is_inert_without_debug() {
        let host = Arc::new(SimulatedHost::new());
        let cpu = cpu(&host, false);
        runtime_assert!(&cpu, 1 + 1 == 3, "never checked");
    }

    #[test]
    #[should_panic(expected = "assertion failed: depth 4")]
    fn test_assert_traps_and_panics() {
        let host = Arc::new(SimulatedHost::new());
        let cpu = cpu(&host, true);
        runtime_assert!(&cpu, false, "depth {}", 4);
    }
}
