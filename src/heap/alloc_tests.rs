use std::{
    collections::{BTreeMap, HashSet},
    sync::Mutex as StdMutex,
    thread,
};

use proptest::prelude::*;
use rand::{Rng, SeedableRng, rngs::StdRng};

use super::*;
use crate::{
    block::{ALIGN, HEADER_SIZE, block_end},
    gateway::Region,
    test_common::get_heap,
};

fn header_of(ptr: *mut u8) -> BlockRef {
    BlockRef::from_payload(NonNull::new(ptr).expect("Pointer is null")).expect("Bad payload")
}

fn data_size_of(ptr: *mut u8) -> usize {
    unsafe { header_of(ptr).read() }.data_size
}

fn free_blocks(heap: &Heap<Region>) -> Vec<(usize, usize)> {
    heap.inspect(|free| {
        free.iter()
            .map(|(block, size)| (block.addr(), size))
            .collect()
    })
}

#[track_caller]
fn alloc_check(ptr: *mut u8, size: usize) {
    assert!(!ptr.is_null(), "Pointer is null");
    assert_eq!(ptr.addr() % ALIGN, 0, "Pointer is unaligned");
    assert!(data_size_of(ptr) >= size, "Block size too small");
}

#[test]
fn test_allocation() {
    let (heap, _backing) = get_heap(None);

    let ptr = heap.allocate(512);

    alloc_check(ptr, 512);
    assert_eq!(data_size_of(ptr), 512);
    assert!(heap.inspect(|free| free.is_empty()));
}

#[test]
fn test_fresh_blocks_are_contiguous() {
    let (heap, backing) = get_heap(None);
    let base = backing.as_ptr().addr();

    let a = heap.allocate(64);
    let b = heap.allocate(64);

    assert_eq!(header_of(a).addr(), base);
    assert_eq!(header_of(b).addr(), block_end(base, 64));
}

#[test]
fn test_round_trip_reuses_address() {
    let (heap, _backing) = get_heap(None);

    // Each `again` stays live so every round starts with an empty free list.
    for size in [1, 8, 13, 100, 512, 4096] {
        let ptr = heap.allocate(size);
        unsafe { heap.release(ptr) };
        let again = heap.allocate(size);
        assert_eq!(ptr, again, "size {size}");
    }
}

#[test]
fn test_size_fidelity_write_fence() {
    let (heap, _backing) = get_heap(None);

    for size in [1, 7, 24, 100, 333, 1024] {
        let below = heap.allocate(size);
        let ptr = heap.allocate(size);
        let above = heap.allocate(size);
        let below_header = unsafe { header_of(below).read() };
        let above_header = unsafe { header_of(above).read() };

        unsafe { ptr.write_bytes(0xAA, size) };

        assert_eq!(unsafe { header_of(below).read() }, below_header);
        assert_eq!(unsafe { header_of(above).read() }, above_header);
        let payload = unsafe { core::slice::from_raw_parts(ptr, size) };
        assert!(payload.iter().all(|&b| b == 0xAA));
    }
}

#[test]
fn test_coalescing_three_blocks() {
    let (heap, _backing) = get_heap(None);
    let size = 256;

    let a = heap.allocate(size);
    let b = heap.allocate(size);
    let c = heap.allocate(size);
    // Fence so the merged block is not the last thing in the region.
    let _fence = heap.allocate(size);

    unsafe {
        heap.release(a);
        heap.release(c);
    }
    assert_eq!(free_blocks(&heap).len(), 2);
    unsafe { heap.release(b) };

    assert_eq!(
        free_blocks(&heap),
        vec![(header_of(a).addr(), 3 * size + 2 * HEADER_SIZE)]
    );
    heap.inspect(FreeList::condition_check);
}

#[test]
fn test_merged_block_is_reused_whole() {
    let (heap, _backing) = get_heap(None);

    let a = heap.allocate(64);
    let b = heap.allocate(64);
    unsafe {
        heap.release(b);
        heap.release(a);
    }

    let big = heap.allocate(2 * 64 + HEADER_SIZE);
    assert_eq!(big, a);
    assert!(heap.inspect(|free| free.is_empty()));
}

#[test]
fn test_free_list_view_follows_merges() {
    let (heap, _backing) = get_heap(None);

    let a = heap.allocate(64);
    let b = heap.allocate(64);
    unsafe { heap.release(b) };
    let before = free_blocks(&heap);
    assert_eq!(before, vec![(header_of(b).addr(), 64)]);

    // b's header is absorbed into a and then handed out as payload.
    unsafe { heap.release(a) };
    let big = heap.allocate(2 * 64 + HEADER_SIZE);
    assert_eq!(big, a);
    unsafe { big.write_bytes(0x11, 2 * 64 + HEADER_SIZE) };

    assert!(free_blocks(&heap).is_empty());
    assert_eq!(heap.inspect(|free| (free.len(), free.free_bytes())), (0, 0));
    heap.inspect(FreeList::condition_check);
}

#[test]
fn test_no_reuse_before_release() {
    let (heap, _backing) = get_heap(None);

    let live: HashSet<_> = (0..32).map(|i| heap.allocate(16 + i * 8)).collect();
    assert_eq!(live.len(), 32);

    let extra = heap.allocate(16);
    assert!(!live.contains(&extra));
}

#[test]
fn test_null_release_is_noop() {
    let (heap, _backing) = get_heap(None);
    let a = heap.allocate(64);
    let _b = heap.allocate(64);
    unsafe { heap.release(a) };
    let blocks = free_blocks(&heap);

    unsafe { heap.release(ptr::null_mut()) };

    assert_eq!(free_blocks(&heap), blocks);
    assert_eq!(blocks, vec![(header_of(a).addr(), 64)]);
}

#[test]
fn test_best_fit_selection() {
    let (heap, _backing) = get_heap(None);
    let large = heap.allocate(512);
    let _fence1 = heap.allocate(8);
    let tight = heap.allocate(128);
    let _fence2 = heap.allocate(8);
    let small = heap.allocate(64);
    let _fence3 = heap.allocate(8);
    unsafe {
        heap.release(large);
        heap.release(tight);
        heap.release(small);
    }

    // 128 is the tightest block that holds 112 bytes, and too small to split.
    let ptr = heap.allocate(112);

    assert_eq!(ptr, tight);
    assert_eq!(data_size_of(ptr), 128);
    assert_eq!(free_blocks(&heap).len(), 2);
}

#[test]
fn test_reuse_splits_large_block() {
    let (heap, _backing) = get_heap(None);
    let big = heap.allocate(1024);
    let _fence = heap.allocate(8);
    unsafe { heap.release(big) };

    let ptr = heap.allocate(128);

    assert_eq!(ptr, big);
    assert_eq!(data_size_of(ptr), 128);
    assert_eq!(
        free_blocks(&heap),
        vec![(block_end(header_of(big).addr(), 128), 1024 - 128 - HEADER_SIZE)]
    );
}

#[test]
fn test_reuse_consumes_tight_block() {
    let (heap, _backing) = get_heap(None);
    let block = heap.allocate(64);
    let _fence = heap.allocate(8);
    unsafe { heap.release(block) };

    // No room for a remainder header, so the whole block goes out.
    let ptr = heap.allocate(48);

    assert_eq!(ptr, block);
    assert_eq!(data_size_of(ptr), 64);
    assert!(heap.inspect(|free| free.is_empty()));
}

#[test]
fn test_zero_size() {
    let (heap, _backing) = get_heap(None);

    let a = heap.allocate(0);
    let b = heap.allocate(0);

    alloc_check(a, 0);
    assert_ne!(a, b);
    assert_eq!(data_size_of(a), ALIGN);
}

#[test]
fn test_growth_failure_returns_null() {
    let (heap, _backing) = get_heap(Some(256));

    let ptr = heap.allocate(128);
    alloc_check(ptr, 128);

    assert!(heap.allocate(128).is_null());
    assert_eq!(
        heap.try_allocate(128),
        Err(GrowError::Exhausted {
            requested: 128 + HEADER_SIZE,
            available: 256 - 128 - HEADER_SIZE,
        })
    );

    // The heap keeps working from its free list after a failed growth.
    unsafe { heap.release(ptr) };
    assert_eq!(heap.allocate(128), ptr);
}

#[test]
fn test_oversized_request() {
    let (heap, _backing) = get_heap(None);

    assert!(heap.allocate(usize::MAX).is_null());
    assert!(matches!(
        heap.try_allocate(usize::MAX - HEADER_SIZE),
        Err(GrowError::TooLarge { .. })
    ));
}

#[test]
fn test_local_heap_keeps_private_list() {
    let (heap, _backing) = get_heap(None);
    let mut first = heap.local();
    let mut second = heap.local();

    let a = first.allocate(64);
    let b = second.allocate(64);
    alloc_check(a, 64);
    alloc_check(b, 64);
    unsafe { first.release(a) };

    assert_eq!(first.free_list().len(), 1);
    assert!(second.free_list().is_empty());
    assert!(heap.inspect(|free| free.is_empty()));
    // Another thread's free block is invisible here, so this grows.
    let c = second.allocate(64);
    assert_ne!(c, a);
    assert_eq!(first.allocate(64), a);
}

#[test]
fn test_local_heap_growth_failure() {
    let (heap, _backing) = get_heap(Some(128));
    let mut local = heap.local();

    assert!(!local.allocate(64).is_null());
    assert!(local.allocate(64).is_null());
}

#[test]
fn test_local_heap_does_not_merge_with_other_lists() {
    let (heap, _backing) = get_heap(None);
    let mut first = heap.local();
    let mut second = heap.local();

    // Physically adjacent blocks owned by different local heaps.
    let a = first.allocate(64);
    let b = second.allocate(64);
    assert_eq!(header_of(b).addr(), block_end(header_of(a).addr(), 64));

    unsafe {
        first.release(a);
        second.release(b);
    }

    assert_eq!(first.free_list().free_bytes(), 64);
    assert_eq!(second.free_list().free_bytes(), 64);
}

#[test]
fn test_concurrent_locked_heap() {
    let (heap, _backing) = get_heap(Some(0x40_0000));

    thread::scope(|scope| {
        for seed in 0..8 {
            let heap = &heap;
            scope.spawn(move || {
                let mut rng = StdRng::seed_from_u64(seed);
                let mut live = Vec::new();
                for _ in 0..500 {
                    if live.is_empty() || rng.gen_bool(0.6) {
                        let size = rng.gen_range(1..512);
                        let ptr = heap.allocate(size);
                        alloc_check(ptr, size);
                        unsafe { ptr.write_bytes(seed as u8, size) };
                        live.push((ptr, size));
                    } else {
                        let (ptr, size) = live.swap_remove(rng.gen_range(0..live.len()));
                        let payload = unsafe { core::slice::from_raw_parts(ptr, size) };
                        assert!(payload.iter().all(|&b| b == seed as u8), "Payload clobbered");
                        unsafe { heap.release(ptr) };
                    }
                }
                for (ptr, _) in live {
                    unsafe { heap.release(ptr) };
                }
            });
        }
    });

    heap.inspect(FreeList::condition_check);
    // Everything was released, so the region collapses back into one block.
    assert_eq!(heap.inspect(|free| free.len()), 1);
}

#[test]
fn test_concurrent_local_heaps_are_disjoint() {
    let (heap, _backing) = get_heap(Some(0x80_0000));
    let live = StdMutex::new(HashSet::new());

    thread::scope(|scope| {
        for seed in 0..8u64 {
            let heap = &heap;
            let live = &live;
            scope.spawn(move || {
                let mut local = heap.local();
                let mut rng = StdRng::seed_from_u64(0xB10C + seed);
                let mut mine = Vec::new();
                for _ in 0..1000 {
                    if mine.is_empty() || rng.gen_bool(0.55) {
                        let size = rng.gen_range(1..256);
                        let ptr = local.allocate(size);
                        alloc_check(ptr, size);
                        assert!(
                            live.lock().unwrap().insert(ptr.addr()),
                            "{ptr:p} handed out twice"
                        );
                        unsafe { ptr.write_bytes(seed as u8, size) };
                        mine.push((ptr, size));
                    } else {
                        let (ptr, size) = mine.swap_remove(rng.gen_range(0..mine.len()));
                        let payload = unsafe { core::slice::from_raw_parts(ptr, size) };
                        assert!(payload.iter().all(|&b| b == seed as u8), "Payload clobbered");
                        live.lock().unwrap().remove(&ptr.addr());
                        unsafe { local.release(ptr) };
                    }
                }
                local.free_list().condition_check();
            });
        }
    });
}

#[derive(Debug, Clone)]
enum Op {
    Allocate(usize),
    Release(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0usize..600).prop_map(Op::Allocate),
        2 => any::<usize>().prop_map(Op::Release),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn free_list_invariants_hold(ops in prop::collection::vec(op(), 1..200)) {
        let (heap, _backing) = get_heap(Some(0x20_0000));
        // payload address -> requested size
        let mut live = BTreeMap::new();

        for op in ops {
            match op {
                Op::Allocate(size) => {
                    let ptr = heap.allocate(size);
                    prop_assert!(!ptr.is_null());
                    prop_assert!(data_size_of(ptr) >= size);
                    prop_assert!(live.insert(ptr.addr(), size).is_none());
                }
                Op::Release(pick) if !live.is_empty() => {
                    let addr = *live.keys().nth(pick % live.len()).unwrap();
                    live.remove(&addr);
                    unsafe { heap.release(ptr::with_exposed_provenance_mut(addr)) };
                }
                Op::Release(_) => {}
            }

            heap.inspect(FreeList::condition_check);
            // No live block overlaps a free block or another live block.
            let mut spans: Vec<(usize, usize)> = free_blocks(&heap)
                .into_iter()
                .map(|(addr, size)| (addr, block_end(addr, size)))
                .collect();
            spans.extend(live.keys().map(|&addr| {
                let header = addr - HEADER_SIZE;
                (header, block_end(header, data_size_of(ptr::with_exposed_provenance_mut(addr))))
            }));
            spans.sort_unstable();
            for pair in spans.windows(2) {
                prop_assert!(pair[0].1 <= pair[1].0, "{:#x?} overlaps {:#x?}", pair[0], pair[1]);
            }
        }
    }
}
