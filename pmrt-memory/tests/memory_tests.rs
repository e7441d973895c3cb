//! Locked heap integration tests

use std::alloc::Layout;
use std::sync::Arc;

use pmrt_api::sim::SimulatedHost;
use pmrt_api::{Error, HostCall};
use pmrt_memory::{LockedBox, LockedHeap, CHUNK_SIZE};
use proptest::prelude::*;

fn heap() -> (Arc<SimulatedHost>, Arc<LockedHeap>) {
    let host = Arc::new(SimulatedHost::new());
    (host.clone(), Arc::new(LockedHeap::new(host)))
}

#[test]
fn test_grow_keeps_contents() {
    let (_host, heap) = heap();
    let layout = Layout::from_size_align(32, 8).unwrap();
    let block = heap.allocate(layout).unwrap();
    unsafe {
        for i in 0..32 {
            block.as_ptr().add(i).write(i as u8);
        }
        let grown = heap.grow(block, layout, 6000).unwrap();
        for i in 0..32 {
            assert_eq!(grown.as_ptr().add(i).read(), i as u8);
        }
        heap.deallocate(grown, Layout::from_size_align(6000, 8).unwrap());
    }
    assert_eq!(heap.stats().in_use, 0);
}

#[test]
fn test_grow_within_class_is_in_place() {
    let (_host, heap) = heap();
    let layout = Layout::from_size_align(40, 8).unwrap();
    let block = heap.allocate(layout).unwrap();
    let grown = unsafe { heap.grow(block, layout, 60).unwrap() };
    assert_eq!(block, grown);
    unsafe { heap.deallocate(grown, Layout::from_size_align(60, 8).unwrap()) };
}

#[test]
fn test_failed_grow_keeps_original_block() {
    let (host, heap) = heap();
    let layout = Layout::from_size_align(64, 8).unwrap();
    let block = heap.allocate(layout).unwrap();
    host.fail_next(HostCall::LockRegion, 0x8013);
    let result = unsafe { heap.grow(block, layout, 10_000) };
    assert!(matches!(result, Err(Error::Host(_))));
    assert_eq!(heap.stats().in_use, 64);
    unsafe { heap.deallocate(block, layout) };
}

#[test]
fn test_shrink_rejects_larger_size() {
    let (_host, heap) = heap();
    let layout = Layout::from_size_align(64, 8).unwrap();
    let block = heap.allocate(layout).unwrap();
    let result = unsafe { heap.shrink(block, layout, 128) };
    assert_eq!(result, Err(Error::InvalidArgument("shrink to a larger size")));
    unsafe { heap.deallocate(block, layout) };
}

#[test]
fn test_zero_sized_allocations_do_not_touch_the_host() {
    let (host, heap) = heap();
    let layout = Layout::from_size_align(0, 64).unwrap();
    let block = heap.allocate(layout).unwrap();
    assert_eq!(block.as_ptr() as usize % 64, 0);
    assert_eq!(host.locked_bytes(), 0);
    unsafe { heap.deallocate(block, layout) };
}

#[test]
fn test_locked_box_round_trip() {
    let (_host, heap) = heap();
    let mut boxed = LockedBox::new(&heap, [7u8; 100]).unwrap();
    boxed[3] = 9;
    assert_eq!(boxed[3], 9);
    let inner = LockedBox::into_inner(boxed);
    assert_eq!(inner[0], 7);
    assert_eq!(heap.stats().in_use, 0);
}

#[test]
fn test_chunk_count_grows_only_when_full() {
    let (host, heap) = heap();
    let layout = Layout::from_size_align(1024, 8).unwrap();
    let per_chunk = CHUNK_SIZE / 1024;
    let blocks: Vec<_> = (0..per_chunk + 1).map(|_| heap.allocate(layout).unwrap()).collect();
    assert_eq!(heap.stats().chunks, 2);
    assert_eq!(host.locked_bytes(), 2 * CHUNK_SIZE);
    for block in blocks {
        unsafe { heap.deallocate(block, layout) };
    }
    assert_eq!(heap.stats().chunks, 2);
}

proptest! {
    #[test]
    fn prop_reuse_bounds_high_water(sizes in proptest::collection::vec(1usize..3000, 1..40), rounds in 1usize..8) {
        let (_host, heap) = heap();
        let mut first_high_water = None;
        for _ in 0..rounds {
            let blocks: Vec<_> = sizes
                .iter()
                .map(|&size| {
                    let layout = Layout::from_size_align(size, 8).unwrap();
                    (heap.allocate(layout).unwrap(), layout)
                })
                .collect();
            for (block, layout) in blocks {
                unsafe { heap.deallocate(block, layout) };
            }
            let stats = heap.stats();
            prop_assert_eq!(stats.in_use, 0);
            match first_high_water {
                None => first_high_water = Some((stats.high_water, stats.chunks)),
                Some(first) => prop_assert_eq!((stats.high_water, stats.chunks), first),
            }
        }
    }
}
