//! Exception bridge integration tests
//!
//! Faults are raised through the simulated host; re-raised faults really
//! unwind to the recovery point saved by `catch_faults`.

mod common;

use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use common::{EventLog, runtime, runtime_on, runtime_with};
use pmrt_api::sim::{HOST_CODE_SELECTOR, PROGRAM_CODE_SELECTOR, SimulatedHost, original_exception_handler};
use pmrt_api::{Error, FarPointer, Host};
use pmrt_runtime::config::DEFAULT_RERAISE_VECTORS;
use pmrt_runtime::sim::{self, FaultDelivery, FaultStack};
use pmrt_runtime::{RuntimeConfig, catch_faults};

/// Faults at `eip` in the program's code and resumes the way the host
/// would. Returns only if no runtime handler redirected the fault.
fn fault(host: &SimulatedHost, vector: u8, eip: usize, stack: &FaultStack) -> FarPointer {
    let scratch = sim::program_fault(host, eip, stack.top());
    match sim::raise_fault(host, vector, scratch) {
        Ok(FaultDelivery::Handled(resumed)) => sim::resume_fault(host, &resumed),
        Ok(FaultDelivery::Host(target, _)) => target,
        Err(_) => FarPointer::default(),
    }
}

#[test]
fn test_fault_in_program_code_becomes_error() {
    let (host, runtime) = runtime();
    let stack = FaultStack::new();

    let result = runtime.catch_faults(|| fault(&host, 0x00, 0x4321, &stack));
    let exception = result.unwrap_err();
    assert_eq!(exception.vector(), 0x00);
    assert_eq!(exception.name(), "divide error");
    assert_eq!(exception.fault_address(), FarPointer::new(PROGRAM_CODE_SELECTOR, 0x4321));
    assert_eq!(exception.record().frame.esp, stack.top());
    assert!(exception.record().extended.is_none());

    let bridge = runtime.exceptions();
    assert!(!bridge.reraise_in_flight());
    assert_eq!(bridge.last_fault(), Some(*exception.record()));
    assert_eq!(runtime.cpu().mask_depth(), 0);
    assert!(!runtime.cpu().in_interrupt());
    assert!(host.interrupts_enabled());

    let error: Error = exception.into();
    assert!(matches!(error, Error::Cpu(f) if f.address.offset == 0x4321 && f.vector == 0x00));
}

#[test]
fn test_code_after_recovery_keeps_running() {
    let (host, runtime) = runtime();
    let stack = FaultStack::new();

    for round in 0..5 {
        let result = runtime.catch_faults(|| fault(&host, 0x0d, 0x1000 + round, &stack));
        assert_eq!(result.unwrap_err().record().frame.eip, 0x1000 + round);
    }
    assert_eq!(runtime.catch_faults(|| 6 * 7), Ok(42));
    assert_eq!(runtime.interrupt_stack().depth(), 0);
}

#[test]
fn test_foreign_faults_chain_to_host() {
    let (host, runtime) = runtime_with(RuntimeConfig::default().with_code_range(0x1000..0x2000));
    let stack = FaultStack::new();

    // Raised while the host itself runs
    let mut scratch = sim::program_fault(host.as_ref(), 0x1800, stack.top());
    scratch.frame.cs = HOST_CODE_SELECTOR as usize;
    scratch.extended.frame.cs = HOST_CODE_SELECTOR as usize;
    match sim::raise_fault(host.as_ref(), 0x0d, scratch).unwrap() {
        FaultDelivery::Host(target, resumed) => {
            assert_eq!(target, original_exception_handler(0x0d));
            assert_eq!(resumed.frame.eip, 0x1800);
        }
        other => panic!("unexpected delivery {:?}", other),
    }

    // Outside the program's code range
    assert_eq!(fault(&host, 0x0e, 0x3000, &stack), original_exception_handler(0x0e));

    // Not a re-raised vector
    assert_eq!(fault(&host, 0x03, 0x1800, &stack), original_exception_handler(0x03));
    assert!(runtime.exceptions().last_fault().is_none());

    let inside = runtime.catch_faults(|| fault(&host, 0x0e, 0x1800, &stack));
    assert_eq!(inside.unwrap_err().vector(), 0x0e);
}

#[test]
fn test_fault_during_reraise_is_passed_on() {
    let (host, runtime) = runtime();
    let stack = FaultStack::new();
    let second = Cell::new(None);
    let in_flight = Cell::new(false);

    let result = runtime.catch_faults(|| {
        let scratch = sim::program_fault(host.as_ref(), 0x2000, stack.top());
        let Ok(FaultDelivery::Handled(resumed)) = sim::raise_fault(host.as_ref(), 0x0e, scratch) else {
            return FarPointer::default();
        };
        in_flight.set(runtime.exceptions().reraise_in_flight());

        // The first fault is still on its way; this one must not recurse.
        let other = FaultStack::new();
        second.set(Some(fault(&host, 0x0d, 0x2100, &other)));
        sim::resume_fault(host.as_ref(), &resumed)
    });

    assert!(in_flight.get());
    assert_eq!(second.get(), Some(original_exception_handler(0x0d)));
    let exception = result.unwrap_err();
    assert_eq!(exception.vector(), 0x0e);
    assert_eq!(exception.record().frame.eip, 0x2000);
    assert!(!runtime.exceptions().reraise_in_flight());
}

#[test]
fn test_handlers_run_newest_first_and_removal_restores() {
    let (host, runtime) = runtime();
    let bridge = runtime.exceptions();
    let log = EventLog::new();
    let stack = FaultStack::new();

    let l = log.clone();
    let older = bridge
        .add(0x03, move |_| {
            l.push(1);
            false
        })
        .unwrap();
    let l = log.clone();
    let newer = bridge
        .add(0x03, move |state| {
            l.push(2);
            state.frame_mut().eip += 1;
            true
        })
        .unwrap();
    assert!(bridge.is_hooked(0x03));
    assert_eq!(bridge.handler_count(0x03), 2);
    assert_ne!(host.get_exception_handler(0x03).unwrap(), original_exception_handler(0x03));

    let scratch = sim::program_fault(host.as_ref(), 0x500, stack.top());
    match sim::raise_fault(host.as_ref(), 0x03, scratch).unwrap() {
        FaultDelivery::Handled(resumed) => assert_eq!(resumed.frame.eip, 0x501),
        other => panic!("unexpected delivery {:?}", other),
    }
    assert_eq!(log.events(), vec![2]);

    bridge.remove(0x03, newer).unwrap();
    assert_eq!(fault(&host, 0x03, 0x500, &stack), original_exception_handler(0x03));
    assert_eq!(log.events(), vec![2, 1]);

    bridge.remove(0x03, older).unwrap();
    assert!(!bridge.is_hooked(0x03));
    assert_eq!(host.get_exception_handler(0x03).unwrap(), original_exception_handler(0x03));
    assert!(matches!(bridge.remove(0x03, older), Err(Error::NotFound(_))));
}

#[test]
fn test_user_handler_precedes_reraise() {
    let (host, runtime) = runtime();
    let bridge = runtime.exceptions();
    let stack = FaultStack::new();

    let skip = bridge
        .add(0x0d, |state| {
            state.frame_mut().eip += 2;
            true
        })
        .unwrap();
    assert_eq!(bridge.handler_count(0x0d), 2);

    let scratch = sim::program_fault(host.as_ref(), 0x700, stack.top());
    match sim::raise_fault(host.as_ref(), 0x0d, scratch).unwrap() {
        FaultDelivery::Handled(resumed) => {
            assert_eq!(resumed.frame.eip, 0x702);
            assert_eq!(sim::resume_fault(host.as_ref(), &resumed), FarPointer::new(PROGRAM_CODE_SELECTOR, 0x702));
        }
        other => panic!("unexpected delivery {:?}", other),
    }
    assert!(bridge.last_fault().is_none());

    bridge.remove(0x0d, skip).unwrap();
    assert!(bridge.is_hooked(0x0d));
    assert!(runtime.catch_faults(|| fault(&host, 0x0d, 0x700, &stack)).is_err());
}

#[test]
fn test_handler_registration_rules() {
    let (host, runtime) = runtime();
    let bridge = runtime.exceptions();
    assert!(matches!(bridge.add(0x20, |_| false), Err(Error::InvalidArgument(_))));

    let weak = Arc::downgrade(bridge);
    let refused = Arc::new(AtomicBool::new(false));
    let r = refused.clone();
    bridge
        .add(0x01, move |_| {
            if let Some(bridge) = weak.upgrade() {
                r.store(matches!(bridge.add(0x02, |_| false), Err(Error::InvalidState(_))), Ordering::SeqCst);
            }
            true
        })
        .unwrap();
    let stack = FaultStack::new();
    let scratch = sim::program_fault(host.as_ref(), 0x10, stack.top());
    assert!(matches!(sim::raise_fault(host.as_ref(), 0x01, scratch), Ok(FaultDelivery::Handled(_))));
    assert!(refused.load(Ordering::SeqCst));
    assert!(!bridge.is_hooked(0x02));
}

#[test]
fn test_extended_frames_are_captured() {
    let host = Arc::new(SimulatedHost::new());
    host.set_extended_frames(true);
    let runtime = runtime_on(&host, RuntimeConfig::default());
    let stack = FaultStack::new();

    let result = runtime.catch_faults(|| {
        let mut scratch = sim::program_fault(host.as_ref(), 0x6000, stack.top());
        // Only the extended frame is authoritative on such hosts.
        scratch.frame.eip = 0;
        scratch.extended.cr2 = 0xdead_b000;
        scratch.extended.ds = 0xaf;
        match sim::raise_fault(host.as_ref(), 0x0e, scratch) {
            Ok(FaultDelivery::Handled(resumed)) => sim::resume_fault(host.as_ref(), &resumed),
            _ => FarPointer::default(),
        }
    });

    let exception = result.unwrap_err();
    assert_eq!(exception.name(), "page fault");
    assert_eq!(exception.record().frame.eip, 0x6000);
    let extended = exception.record().extended.unwrap();
    assert_eq!(extended.cr2, 0xdead_b000);
    assert_eq!(extended.ds, 0xaf);

    let text = format!("{}", exception);
    assert!(text.starts_with("page fault (exception 0x0e)"));
    assert!(text.contains("cr2=0xdeadb000"));
}

#[test]
fn test_nested_recovery_points() {
    let (host, runtime) = runtime();
    let stack = FaultStack::new();
    let inner_vector = Cell::new(None);

    let outer = runtime.catch_faults(|| {
        let inner = runtime.catch_faults(|| fault(&host, 0x06, 0x100, &stack));
        inner_vector.set(inner.err().map(|e| e.vector()));
        fault(&host, 0x05, 0x200, &stack)
    });

    assert_eq!(inner_vector.get(), Some(0x06));
    let exception = outer.unwrap_err();
    assert_eq!(exception.vector(), 0x05);
    assert_eq!(exception.name(), "bound range exceeded");

    let plain = runtime.catch_faults(|| runtime.catch_faults(|| "inner").map_err(|e| e.vector()));
    assert_eq!(plain, Ok(Ok("inner")));
}

#[test]
fn test_recovery_points_belong_to_threads() {
    let (host, runtime) = runtime();
    let scheduler = runtime.scheduler();
    let log = EventLog::new();

    let l = log.clone();
    let h = host.clone();
    let cpu = runtime.cpu().clone();
    let worker = scheduler
        .spawn(move |s| {
            let result = catch_faults(&cpu, || {
                l.push(1);
                let _ = s.yield_now();
                fault(&h, 0x0d, 0x300, &FaultStack::new())
            });
            l.push(result.map_or_else(|e| e.vector() as u32, |_| 0));
            Ok(())
        })
        .unwrap();

    scheduler.yield_now().unwrap();
    assert_eq!(log.events(), vec![1]);

    // The worker's recovery point is parked; faults here reach our own.
    let stack = FaultStack::new();
    let mine = runtime.catch_faults(|| fault(&host, 0x00, 0x400, &stack));
    assert_eq!(mine.unwrap_err().vector(), 0x00);

    scheduler.join(&worker).unwrap();
    assert_eq!(log.events(), vec![1, 0x0d]);
}

#[test]
fn test_uninstall_and_drop_restore_handlers() {
    let (host, runtime) = runtime();
    let stack = FaultStack::new();

    runtime.exceptions().uninstall_reraise().unwrap();
    for &vector in &DEFAULT_RERAISE_VECTORS {
        assert_eq!(host.get_exception_handler(vector).unwrap(), original_exception_handler(vector));
    }
    assert_eq!(fault(&host, 0x0d, 0x100, &stack), original_exception_handler(0x0d));

    runtime.exceptions().add(0x0d, |_| false).unwrap();
    assert!(host.get_exception_handler(0x07).unwrap() != original_exception_handler(0x07));
    drop(runtime);
    assert_eq!(host.get_exception_handler(0x0d).unwrap(), original_exception_handler(0x0d));
    assert_eq!(host.get_exception_handler(0x07).unwrap(), original_exception_handler(0x07));
}

#[test]
fn test_fault_without_stack_room_is_passed_on() {
    let (host, runtime) = runtime();
    for esp in [0, 8, 2 * std::mem::size_of::<usize>()] {
        let scratch = sim::program_fault(host.as_ref(), 0x1200, esp);
        match sim::raise_fault(host.as_ref(), 0x0d, scratch).unwrap() {
            FaultDelivery::Host(target, resumed) => {
                assert_eq!(target, original_exception_handler(0x0d));
                assert_eq!(resumed.frame.eip, 0x1200);
                assert_eq!(resumed.frame.esp, esp);
            }
            other => panic!("fault with esp {:#x} was claimed: {:?}", esp, other),
        }
    }
    let bridge = runtime.exceptions();
    assert!(!bridge.reraise_in_flight());
    assert_eq!(bridge.last_fault(), None);
}

#[test]
fn test_last_fault_reads_with_interrupts_masked() {
    let (host, runtime) = runtime();
    let before = host.interrupt_disables();
    assert_eq!(runtime.exceptions().last_fault(), None);
    assert!(host.interrupt_disables() > before);
    assert!(host.interrupts_enabled());
}
