//! Randomized and scenario tests for `cellar`.
//!
//! The quickcheck half drives random interleavings of sized allocations and
//! frees against the allocator, filling every allocation with a slot-specific
//! byte and re-checking it on free, so overlapping or corrupted cells show up
//! as content mismatches. The scenario half pins down the observable
//! contracts: disjointness, zeroing, realloc content, block rollover and
//! reuse, reclamation, and the oversize pass-through.

use quickcheck::{Arbitrary, Gen};
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::ptr;

#[derive(Debug, Clone, Copy)]
enum Operation {
    // Allocate this many bytes, optionally zeroed.
    Alloc { size: usize, zero: bool },

    // Free the n^th allocation we've made, or no-op if it has already been
    // freed.
    Free(usize),
}

use Operation::*;

fn arbitrary_alloc(rng: &mut SmallRng) -> Operation {
    let zero = rng.gen_bool(0.5);

    // Zero-sized allocation 1/1000 times.
    if rng.gen_ratio(1, 1000) {
        return Alloc { size: 0, zero };
    }

    // Oversize (beyond the largest class, so routed to the virtual handle)
    // with probability 1/500.
    if rng.gen_ratio(1, 500) {
        let floor = cellar::default_block_size() / 2;
        return Alloc {
            size: rng.gen_range(floor + 1..floor * 3),
            zero,
        };
    }

    // A large slabbed class with probability 1/50.
    if rng.gen_ratio(1, 50) {
        return Alloc {
            size: rng.gen_range(4096..=65536),
            zero,
        };
    }

    // Small allocation. Weighted towards the first few classes, where the
    // free lists are the hottest.
    if rng.gen_bool(0.5) {
        Alloc {
            size: rng.gen_range(1..=32),
            zero,
        }
    } else {
        Alloc {
            size: rng.gen_range(1..=256),
            zero,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Operations(Vec<Operation>);

#[cfg(feature = "extra_assertions")]
const NUM_OPERATIONS: usize = 500;

#[cfg(not(feature = "extra_assertions"))]
const NUM_OPERATIONS: usize = 5_000;

impl Arbitrary for Operations {
    fn arbitrary(g: &mut Gen) -> Self {
        let mut rng = SmallRng::seed_from_u64(u64::arbitrary(g));

        let mut num_allocs = 0;
        let mut active_allocs = vec![];
        let mut operations = Vec::with_capacity(NUM_OPERATIONS);

        for _ in 0..NUM_OPERATIONS {
            // Free with P = 1/4 so that the sequences exercise more free-list
            // reuse due to the higher rate of allocation.
            if !active_allocs.is_empty() && rng.gen_bool(0.25) {
                let i = rng.gen_range(0..active_allocs.len());
                operations.push(Free(active_allocs.swap_remove(i)));
            } else {
                active_allocs.push(num_allocs);
                num_allocs += 1;
                operations.push(arbitrary_alloc(&mut rng));
            }
        }

        // Free everything that is still live so the global handles end each
        // run with closed counters.
        operations.reserve_exact(active_allocs.len());
        while !active_allocs.is_empty() {
            let i = rng.gen_range(0..active_allocs.len());
            operations.push(Free(active_allocs.swap_remove(i)));
        }

        Operations(operations)
    }

    fn shrink(&self) -> Box<dyn Iterator<Item = Self>> {
        let ops = self.0.clone();
        let prefixes =
            (0..self.0.len()).map(move |i| Operations(ops.iter().cloned().take(i).collect()));

        let halved = std::iter::once(Operations(
            self.0
                .iter()
                .map(|op| match *op {
                    Alloc { size, zero } => Alloc {
                        size: size / 2,
                        zero,
                    },
                    Free(i) => Free(i),
                })
                .collect(),
        ));

        Box::new(prefixes.chain(halved))
    }
}

// Check a byte at a spread of offsets rather than every one of what might be
// megabytes.
fn sample_offsets(size: usize) -> impl Iterator<Item = usize> {
    let step = std::cmp::max(1, size / 64);
    (0..size).step_by(step).chain(std::iter::once(size - 1))
}

impl Operations {
    pub fn run_against(self, state: &cellar::State) {
        let mut allocs: Vec<Option<(usize, usize, u8)>> = vec![];

        for op in self.0 {
            match op {
                Alloc { size, zero } => {
                    let fill = (allocs.len() as u8).wrapping_mul(31) | 1;
                    let ptr = cellar::alloc_in(state, size, zero);

                    if size == 0 {
                        assert!(ptr.is_null(), "size-0 allocation must return null");
                        allocs.push(None);
                        continue;
                    }

                    // Out-of-memory is not a model failure.
                    if ptr.is_null() {
                        allocs.push(None);
                        continue;
                    }

                    unsafe {
                        if zero {
                            for i in sample_offsets(size) {
                                assert_eq!(*ptr.add(i), 0, "zeroed allocation must read 0");
                            }
                        }
                        ptr::write_bytes(ptr, fill, size);
                    }

                    allocs.push(Some((ptr as usize, size, fill)));
                }
                Free(idx) => {
                    if let Some(entry) = allocs.get_mut(idx) {
                        if let Some((raw, size, fill)) = entry.take() {
                            let ptr = raw as *mut u8;
                            unsafe {
                                for i in sample_offsets(size) {
                                    assert_eq!(
                                        *ptr.add(i),
                                        fill,
                                        "allocation content changed while live"
                                    );
                                }
                                cellar::free_in(state, ptr, size);
                            }
                        }
                    }
                }
            }
        }
    }

    pub fn run_single_threaded(self) {
        self.run_against(cellar::global_state());
    }

    pub fn run_multi_threaded(ops0: Self, ops1: Self, ops2: Self, ops3: Self) {
        use std::thread;

        let handle0 = thread::spawn(move || ops0.run_against(cellar::global_state()));
        let handle1 = thread::spawn(move || ops1.run_against(cellar::global_state()));
        let handle2 = thread::spawn(move || ops2.run_against(cellar::global_state()));
        let handle3 = thread::spawn(move || ops3.run_against(cellar::global_state()));

        handle0.join().unwrap();
        handle1.join().unwrap();
        handle2.join().unwrap();
        handle3.join().unwrap();
    }
}

////////////////////////////////////////////////////////////////////////////////

macro_rules! run_quickchecks {
    ( $name:ident ) => {
        #[test]
        fn $name() {
            quickcheck::QuickCheck::new()
                .tests(1)
                .quickcheck(Operations::run_single_threaded as fn(Operations) -> ());
        }
    };
}

// Let the test harness run each of our single threaded quickchecks
// concurrently with each other.
run_quickchecks!(quickchecks_0);
run_quickchecks!(quickchecks_1);
run_quickchecks!(quickchecks_2);
run_quickchecks!(quickchecks_3);

#[test]
fn multi_threaded_quickchecks() {
    quickcheck::QuickCheck::new().tests(1).quickcheck(
        Operations::run_multi_threaded
            as fn(Operations, Operations, Operations, Operations) -> (),
    );
}

////////////////////////////////////////////////////////////////////////////////

#[test]
fn fill_a_class_then_drain_it() {
    Operations(
        std::iter::repeat(Alloc {
            size: 16,
            zero: false,
        })
        .take(100)
        .chain((0..100).map(Free))
        .chain(
            std::iter::repeat(Alloc {
                size: 256,
                zero: true,
            })
            .take(100),
        )
        .chain((0..100).map(|i| Free(i + 100)))
        .collect(),
    )
    .run_single_threaded();
}

#[test]
fn interleave_zero_sized_allocations() {
    Operations(
        std::iter::repeat(Alloc {
            size: 0,
            zero: false,
        })
        .take(1000)
        .chain((0..1000).map(Free))
        .collect(),
    )
    .run_single_threaded();
}

#[test]
fn refill_immediately_after_free() {
    Operations(vec![
        Alloc {
            size: 1414,
            zero: false,
        },
        Free(0),
        Alloc {
            size: 1414,
            zero: true,
        },
        Free(1),
    ])
    .run_single_threaded();
}

#[test]
fn oversize_then_small() {
    Operations(vec![
        Alloc {
            size: cellar::default_block_size() * 2,
            zero: false,
        },
        Free(0),
        Alloc {
            size: 1,
            zero: true,
        },
        Free(1),
    ])
    .run_single_threaded();
}

////////////////////////////////////////////////////////////////////////////////

// A private state per scenario keeps the counter assertions immune to the
// other tests running in the same process.
struct TestState(ptr::NonNull<cellar::State>);

impl TestState {
    fn new() -> TestState {
        TestState(cellar::State::new(None).expect("state reservation"))
    }

    fn get(&self) -> &cellar::State {
        unsafe { self.0.as_ref() }
    }
}

impl Drop for TestState {
    fn drop(&mut self) {
        unsafe { cellar::State::destroy(self.0) };
    }
}

#[test]
fn live_pointers_are_disjoint_and_blocks_are_reused() {
    let state = TestState::new();
    let s = state.get();
    let handle = s.handle_of(16).unwrap();
    let mut rng = SmallRng::seed_from_u64(0x5eed);

    let alloc_round = |s: &cellar::State| -> Vec<*mut u8> {
        (0..256u32)
            .map(|i| {
                let p = cellar::alloc_in(s, 16, true);
                assert!(!p.is_null());
                unsafe { ptr::write_bytes(p, i as u8, 16) };
                p
            })
            .collect()
    };

    let mut ptrs = alloc_round(s);
    for i in 0..ptrs.len() {
        for j in i + 1..ptrs.len() {
            let a = ptrs[i] as usize;
            let b = ptrs[j] as usize;
            assert!(a + 16 <= b || b + 16 <= a, "live allocations overlap");
        }
    }
    let blocks_before = handle.block_count();

    ptrs.shuffle(&mut rng);
    for &p in &ptrs {
        unsafe { cellar::free_in(s, p, 16) };
    }
    assert_eq!(handle.live_cell_count(), 0);

    // Everything fits in the retained block; no new mapping happens.
    let again = alloc_round(s);
    assert_eq!(handle.block_count(), blocks_before);
    for p in again {
        unsafe { cellar::free_in(s, p, 16) };
    }
}

#[test]
fn realloc_preserves_content_and_zeroes_the_tail() {
    let state = TestState::new();
    let s = state.get();

    unsafe {
        let p = cellar::alloc_in(s, 32, true);
        assert!(!p.is_null());
        ptr::write_bytes(p, 0xaa, 32);

        let q = cellar::realloc_in(s, p, 32, 64, true);
        assert!(!q.is_null());
        for i in 0..32 {
            assert_eq!(*q.add(i), 0xaa);
        }
        for i in 32..64 {
            assert_eq!(*q.add(i), 0x00);
        }

        let r = cellar::realloc_in(s, q, 64, 32, false);
        assert!(!r.is_null());
        for i in 0..32 {
            assert_eq!(*r.add(i), 0xaa);
        }

        cellar::free_in(s, r, 32);
    }
}

#[test]
fn same_class_realloc_returns_the_same_cell() {
    let state = TestState::new();
    let s = state.get();

    unsafe {
        // 17 and 30 both round to the 32-byte class.
        let p = cellar::alloc_in(s, 17, true);
        assert!(!p.is_null());
        ptr::write_bytes(p, 0x11, 17);

        let q = cellar::realloc_in(s, p, 17, 30, true);
        assert_eq!(p, q);
        for i in 0..17 {
            assert_eq!(*q.add(i), 0x11);
        }
        for i in 17..30 {
            assert_eq!(*q.add(i), 0x00, "grown tail must be zeroed on request");
        }

        cellar::free_in(s, q, 30);
    }
}

#[test]
fn filling_a_block_maps_a_second() {
    let state = TestState::new();
    let s = state.get();
    let handle = s.handle_of(1).unwrap();
    let capacity = handle.capacity_cells();

    let mut cells = Vec::with_capacity(capacity + 1);
    for _ in 0..capacity {
        let p = cellar::alloc_in(s, 1, false);
        assert!(!p.is_null());
        cells.push(p);
    }
    assert_eq!(handle.block_count(), 1);

    cells.push(cellar::alloc_in(s, 1, false));
    assert_eq!(handle.block_count(), 2);

    for p in cells {
        unsafe { cellar::free_in(s, p, 1) };
    }
    assert_eq!(handle.live_cell_count(), 0);
}

#[cfg(feature = "extra_assertions")]
const FOOTPRINT_ITERATIONS: usize = 50_000;

#[cfg(not(feature = "extra_assertions"))]
const FOOTPRINT_ITERATIONS: usize = 1_000_000;

#[test]
fn immediate_free_keeps_the_footprint_bounded() {
    let state = TestState::new();
    let s = state.get();
    let handle = s.handle_of(8).unwrap();
    handle.add_flags(cellar::HandleFlags::IMMEDIATE_FREE);

    for i in 0..FOOTPRINT_ITERATIONS {
        let p = cellar::alloc_in(s, 8, true);
        assert!(!p.is_null());
        unsafe { cellar::free_in(s, p, 8) };

        if i % 4096 == 0 {
            assert!(handle.block_count() <= 2);
        }
    }

    assert_eq!(handle.block_count(), 0);
    assert_eq!(handle.live_cell_count(), 0);
}

#[test]
fn size_zero_is_a_successful_null() {
    let state = TestState::new();
    let s = state.get();

    assert!(cellar::alloc_in(s, 0, false).is_null());
    assert!(cellar::alloc_in(s, 0, true).is_null());
    unsafe { cellar::free_in(s, ptr::null_mut(), 0) };
}

#[test]
fn oversize_requests_pass_through_zeroed() {
    let state = TestState::new();
    let s = state.get();
    let size = cellar::default_block_size() * 4;

    let handle = s.handle_of(size).unwrap();
    assert!(handle.is_virtual());

    let p = cellar::alloc_in(s, size, true);
    assert!(!p.is_null());
    unsafe {
        for i in sample_offsets(size) {
            assert_eq!(*p.add(i), 0);
        }
        *p.add(size - 1) = 3;
        cellar::free_in(s, p, size);
    }
}

#[test]
fn counters_close_after_freeing_everything() {
    let state = TestState::new();
    let s = state.get();
    let sizes = [1usize, 2, 3, 8, 24, 100, 4096, 70_000];
    let mut rng = SmallRng::seed_from_u64(0xc10c);

    let mut live = Vec::new();
    for _ in 0..2000 {
        let size = sizes[rng.gen_range(0..sizes.len())];
        let p = cellar::alloc_in(s, size, false);
        assert!(!p.is_null());
        live.push((p, size));
    }

    live.shuffle(&mut rng);
    for (p, size) in live {
        unsafe { cellar::free_in(s, p, size) };
    }

    for &size in &sizes {
        let handle = s.handle_of(size).unwrap();
        assert_eq!(handle.live_cell_count(), 0);
        // Whatever blocks remain are empty ones the hysteresis kept warm; at
        // this scale that is never more than a couple per class.
        assert!(handle.block_count() <= 2);
    }
}

////////////////////////////////////////////////////////////////////////////////

// Modelled on the dlmalloc-rs smoke/stress tests, reshaped for the sized
// alloc/free/realloc facade.

#[test]
fn smoke() {
    unsafe {
        let p = cellar::alloc(1, false);
        assert!(!p.is_null());
        *p = 9;
        assert_eq!(*p, 9);
        cellar::free(p, 1);

        let p = cellar::alloc(1, true);
        assert!(!p.is_null());
        assert_eq!(*p, 0);
        *p = 10;
        assert_eq!(*p, 10);
        cellar::free(p, 1);
    }
}

// This takes too long with the extra assertion checks enabled.
#[test]
#[cfg(not(feature = "extra_assertions"))]
fn stress() {
    let mut rng = SmallRng::seed_from_u64(0x57_ae55);
    let mut live: Vec<(usize, usize, u8)> = Vec::new();

    unsafe {
        for _ in 0..100_000 {
            let do_free = !live.is_empty()
                && ((live.len() < 1_000 && rng.gen_bool(0.33)) || rng.gen_bool(0.5));
            if do_free {
                let idx = rng.gen_range(0..live.len());
                let (raw, size, fill) = live.swap_remove(idx);
                let ptr = raw as *mut u8;
                for i in sample_offsets(size) {
                    assert_eq!(*ptr.add(i), fill);
                }
                cellar::free(ptr, size);
                continue;
            }

            if !live.is_empty() && rng.gen_ratio(1, 100) {
                let idx = rng.gen_range(0..live.len());
                let (raw, old_size, fill) = live.swap_remove(idx);
                let new_size = if rng.gen_bool(0.5) {
                    rng.gen_range(old_size..=old_size * 2)
                } else {
                    rng.gen_range(1..=old_size)
                };
                let ptr = cellar::realloc(raw as *mut u8, old_size, new_size, false);
                assert!(!ptr.is_null());
                for i in sample_offsets(std::cmp::min(old_size, new_size)) {
                    assert_eq!(*ptr.add(i), fill, "realloc must preserve the overlap");
                }
                ptr::write_bytes(ptr, fill, new_size);
                live.push((ptr as usize, new_size, fill));
                continue;
            }

            let size = if rng.gen_bool(0.5) {
                rng.gen_range(1..=128)
            } else {
                rng.gen_range(1..=128 * 1024)
            };
            let zero = rng.gen_ratio(1, 50);
            let fill = rng.gen::<u8>() | 1;

            let ptr = cellar::alloc(size, zero);
            assert!(!ptr.is_null());
            if zero {
                for i in sample_offsets(size) {
                    assert_eq!(*ptr.add(i), 0);
                }
            }
            ptr::write_bytes(ptr, fill, size);
            live.push((ptr as usize, size, fill));
        }

        for (raw, size, fill) in live {
            let ptr = raw as *mut u8;
            for i in sample_offsets(size) {
                assert_eq!(*ptr.add(i), fill);
            }
            cellar::free(ptr, size);
        }
    }
}
