//! Host interface tests against the simulated host

use pmrt_api::sim::{self, SimulatedHost, PROGRAM_CODE_SELECTOR};
use pmrt_api::{Error, ErrorContext, FarPointer, Host, HostCall, HostError};
use proptest::prelude::*;

#[test]
fn test_vectors_start_at_host_defaults() {
    let host = SimulatedHost::new();
    for vector in [0x08u8, 0x09, 0x70, 0x77] {
        assert_eq!(
            host.get_interrupt_vector(vector),
            Ok(sim::original_interrupt_vector(vector))
        );
    }
    assert_eq!(host.get_exception_handler(0x0d), Ok(sim::original_exception_handler(0x0d)));
}

#[test]
fn test_exception_number_out_of_range() {
    let host = SimulatedHost::new();
    let err = host.get_exception_handler(40).unwrap_err();
    assert_eq!(err.call, HostCall::GetExceptionHandler);
}

#[test]
fn test_lock_and_unlock_regions() {
    let host = SimulatedHost::new();
    host.lock_region(0x1000, 0x200).unwrap();
    host.lock_region(0x4000, 0x100).unwrap();
    assert_eq!(host.locked_bytes(), 0x300);
    host.unlock_region(0x1000, 0x200).unwrap();
    assert_eq!(host.locked_bytes(), 0x100);
    assert!(host.unlock_region(0x1000, 0x200).is_err());
}

#[test]
fn test_host_error_converts_with_context() {
    let host = SimulatedHost::new();
    host.fail_next(HostCall::LockRegion, 0x8013);
    let result = host.lock_region(0x1000, 16).context("locking interrupt stack");
    assert_eq!(
        result,
        Err(Error::Custom(
            0x8013,
            "locking interrupt stack: Host error: lock linear region failed with code 0x8013".into()
        ))
    );
    let direct: Error = HostError::new(HostCall::LockRegion, 1).into();
    assert!(matches!(direct, Error::Host(_)));
}

proptest! {
    #[test]
    fn prop_vector_writes_read_back(vector in 0u8..=255, offset in 0usize..0x10_0000) {
        let host = SimulatedHost::new();
        let handler = FarPointer::new(PROGRAM_CODE_SELECTOR, offset);
        host.set_interrupt_vector(vector, handler).unwrap();
        prop_assert_eq!(host.get_interrupt_vector(vector).unwrap(), handler);
    }

    #[test]
    fn prop_pic_mask_toggles(irq in 0u8..16) {
        let host = SimulatedHost::new();
        host.mask_irq(irq);
        prop_assert!(host.irq_masked(irq));
        host.unmask_irq(irq);
        prop_assert!(!host.irq_masked(irq));
    }
}
