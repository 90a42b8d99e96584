//! The 1-byte size class.
//!
//! One-byte cells cannot amortise a full slab header each, so a block of this
//! class carries an array of small `Run` sub-headers, each owning a few
//! hundred cells inline. The block header keeps a cursor (`free`) to the
//! first run with room, and runs with room are chained through their `next`
//! bytes; full runs drop off the chain and re-enter it when a cell of theirs
//! is freed.

use core::mem;
use core::ptr;

/// Cells per run: 250 where pointers are 8 bytes, 251 otherwise. The wider
/// block header eats one cell's worth of page.
#[cfg(target_pointer_width = "64")]
pub(crate) const RUN_CELLS: usize = 250;

/// Cells per run: 250 where pointers are 8 bytes, 251 otherwise. The wider
/// block header eats one cell's worth of page.
#[cfg(not(target_pointer_width = "64"))]
pub(crate) const RUN_CELLS: usize = 251;

/// The most runs a block may carry: run indices travel through the one-byte
/// `Run::next` chain, reserving the sentinel.
pub(crate) const MAX_RUNS: usize = u8::MAX as usize - 2;

/// Terminator for the run chain and for each run's embedded cell free list.
pub(crate) const NONE: u8 = u8::MAX;

/// A sub-header owning one run of [`RUN_CELLS`] one-byte cells.
///
/// `free` indexes this run's own free list (each free cell stores the index
/// of the next free cell); `used` is the bump watermark; `next` chains runs
/// that still have room.
#[repr(C)]
pub(crate) struct Run {
    pub(crate) next: u8,
    pub(crate) used: u8,
    pub(crate) count: u8,
    pub(crate) free: u8,
    pub(crate) data: [u8; RUN_CELLS],
}

/// The primary header of a 1-byte-class block: the shared link prefix, then
/// block-wide counters and the trailing run array.
#[repr(C)]
pub(crate) struct RunBlockHeader {
    pub(crate) prev: *mut RunBlockHeader,
    pub(crate) next: *mut RunBlockHeader,
    pub(crate) real_ptr_off: u32,
    pub(crate) alloc_size: u32,
    /// Live cells across every run.
    pub(crate) count: u16,
    /// Index of the run the next allocation comes from.
    pub(crate) free: u16,
    runs: [Run; 0],
}

impl RunBlockHeader {
    pub(crate) unsafe fn run_at(block: *mut Self, index: usize) -> *mut Run {
        (ptr::addr_of_mut!((*block).runs) as *mut Run).add(index)
    }

    /// Which run owns `cell`, given that `cell` points into this block's run
    /// array.
    pub(crate) unsafe fn run_of(block: *mut Self, cell: *const u8) -> usize {
        let runs = ptr::addr_of!((*block).runs) as usize;
        (cell as usize - runs) / mem::size_of::<Run>()
    }

    /// Initialise a freshly mapped block: all runs empty, chained in order,
    /// cursor on the first.
    pub(crate) unsafe fn init(
        block: *mut Self,
        real_ptr_off: u32,
        run_count: usize,
    ) {
        ptr::write(
            block,
            RunBlockHeader {
                prev: ptr::null_mut(),
                next: ptr::null_mut(),
                real_ptr_off,
                alloc_size: 1,
                count: 0,
                free: 0,
                runs: [],
            },
        );

        for i in 0..run_count {
            let run = Self::run_at(block, i);
            (*run).next = if i + 1 < run_count { (i + 1) as u8 } else { NONE };
            (*run).used = 0;
            (*run).count = 0;
            (*run).free = NONE;
        }
    }
}

impl Run {
    /// Take one cell out of this run; the caller has already accounted for it
    /// in the counters and handled the run-full transition.
    pub(crate) unsafe fn pop_cell(run: *mut Run, zero: bool) -> *mut u8 {
        let data = (*run).data.as_mut_ptr();

        if (*run).free != NONE {
            let cell = data.add((*run).free as usize);
            (*run).free = *cell;

            if zero {
                *cell = 0;
            }

            return cell;
        }

        let used = (*run).used;
        (*run).used = used + 1;

        // Fresh mappings are zero-filled and the watermark never retreats.
        data.add(used as usize)
    }

    /// Thread a freed cell onto this run's free list.
    pub(crate) unsafe fn push_cell(run: *mut Run, cell: *mut u8) {
        let data = (*run).data.as_ptr();
        *cell = (*run).free;
        (*run).free = (cell as usize - data as usize) as u8;
    }
}

/// The run-block counterpart of `slab::assert_list_valid`: walk the partial
/// list, check the link mirror property, and close every counter at both the
/// block and the run level. O(cells), `extra_assertions` only.
#[cfg(feature = "extra_assertions")]
pub(crate) unsafe fn assert_list_valid(head: *mut RunBlockHeader, run_count: usize) {
    let mut prev: *mut RunBlockHeader = ptr::null_mut();
    let mut block = head;

    while !block.is_null() {
        assert_eq!(
            (*block).prev,
            prev,
            "partial-list back-links must mirror the forward links"
        );
        assert!(
            ((*block).count as usize) < RUN_CELLS * run_count,
            "full blocks must leave the partial list"
        );

        let mut total = 0usize;
        for i in 0..run_count {
            let run = RunBlockHeader::run_at(block, i);
            let used = (*run).used as usize;
            let count = (*run).count as usize;
            assert!(used <= RUN_CELLS);
            total += count;

            let mut free_len = 0;
            let mut index = (*run).free;
            while index != NONE {
                assert!(
                    (index as usize) < used,
                    "free indices must stay under the bump watermark"
                );
                free_len += 1;
                assert!(free_len <= used, "the free list must not cycle");
                index = *(*run).data.as_ptr().add(index as usize);
            }

            assert_eq!(
                count + free_len,
                used,
                "live cells plus free-list entries must account for every \
                 cell below the watermark"
            );
        }
        assert_eq!((*block).count as usize, total);

        prev = block;
        block = (*block).next;
    }
}
