//! Single-header slab blocks: one aligned virtual-memory region whose leading
//! header owns every cell in the block.
//!
//! The header embeds the block's free list inside the payload itself: while a
//! cell is free, its first `WIDTH` bytes hold the index of the next free cell.
//! Two monomorphisations cover the 2-byte class (`u16` indices) and every
//! class of 4 bytes and up (`u32` indices); the 1-byte class needs denser
//! bookkeeping and lives in `runs`.

use crate::checks;
use core::ptr;

/// An index into a block's cell array, stored in the first bytes of free
/// cells. The all-ones value is reserved as the empty-list sentinel.
pub(crate) trait CellIndex: Copy + PartialEq {
    /// "No cell": the free-list terminator.
    const SENTINEL: Self;

    /// The widest cell count a block may hold so that every valid index plus
    /// the sentinel still fits.
    const MAX_CELLS: usize;

    /// Bytes a stored index occupies at the start of a free cell.
    const WIDTH: usize;

    fn from_usize(n: usize) -> Self;
    fn to_usize(self) -> usize;

    /// Read an index from the head of a freed cell. Cells are only guaranteed
    /// to be aligned to their class, which may be finer than `Self`.
    unsafe fn read_from(cell: *const u8) -> Self;

    /// Store an index into the head of a freed cell.
    unsafe fn write_to(self, cell: *mut u8);
}

macro_rules! impl_cell_index {
    ( $ty:ident ) => {
        impl CellIndex for $ty {
            const SENTINEL: Self = $ty::MAX;
            const MAX_CELLS: usize = $ty::MAX as usize - 2;
            const WIDTH: usize = core::mem::size_of::<$ty>();

            #[inline]
            fn from_usize(n: usize) -> Self {
                extra_assert!(n < $ty::MAX as usize);
                n as $ty
            }

            #[inline]
            fn to_usize(self) -> usize {
                self as usize
            }

            #[inline]
            unsafe fn read_from(cell: *const u8) -> Self {
                ptr::read_unaligned(cell as *const $ty)
            }

            #[inline]
            unsafe fn write_to(self, cell: *mut u8) {
                ptr::write_unaligned(cell as *mut $ty, self);
            }
        }
    };
}

impl_cell_index!(u16);
impl_cell_index!(u32);

/// The primary (and only) cell-header of a slab block.
///
/// Lives at the very start of the block, so the block base recovered from a
/// user pointer by alignment masking *is* a `SlabHeader`. The payload array
/// begins at the handle's `payload_offset`.
///
/// `prev`/`next` link the block into its handle's partial list; a full block
/// is detached and carries null siblings until a free re-inserts it.
#[repr(C)]
pub(crate) struct SlabHeader<I> {
    pub(crate) prev: *mut SlabHeader<I>,
    pub(crate) next: *mut SlabHeader<I>,
    pub(crate) real_ptr_off: u32,
    pub(crate) alloc_size: u32,
    pub(crate) used: I,
    pub(crate) count: I,
    pub(crate) free: I,
}

impl<I: CellIndex> SlabHeader<I> {
    /// Initialise the header of a freshly mapped block. The mapping is
    /// zero-filled, but every field is written anyway so the invariants do
    /// not depend on that.
    pub(crate) unsafe fn init(block: *mut Self, real_ptr_off: u32, alloc_size: u32) {
        ptr::write(
            block,
            SlabHeader {
                prev: ptr::null_mut(),
                next: ptr::null_mut(),
                real_ptr_off,
                alloc_size,
                used: I::from_usize(0),
                count: I::from_usize(0),
                free: I::SENTINEL,
            },
        );
    }

    pub(crate) unsafe fn data(block: *mut Self, payload_offset: usize) -> *mut u8 {
        (block as *mut u8).add(payload_offset)
    }

    /// Take one cell out of the block: the free-list head if there is one,
    /// the bump watermark otherwise. The caller has already accounted for the
    /// cell in `count` and decided the full-block transition.
    pub(crate) unsafe fn pop_cell(
        block: *mut Self,
        payload_offset: usize,
        cell_size: usize,
        zero: bool,
    ) -> *mut u8 {
        let data = Self::data(block, payload_offset);

        let free = (*block).free;
        if free != I::SENTINEL {
            let cell = data.add(free.to_usize() * cell_size);
            checks::assert_freed_cell_poisoned(cell, I::WIDTH, cell_size);
            (*block).free = I::read_from(cell);

            if zero {
                ptr::write_bytes(cell, 0, cell_size);
            }

            return cell;
        }

        let used = (*block).used.to_usize();
        (*block).used = I::from_usize(used + 1);

        // The watermark only ever grows over freshly mapped, zero-filled
        // pages, so bump cells are already zero.
        data.add(used * cell_size)
    }

    /// Thread a freed cell onto the block's free list.
    pub(crate) unsafe fn push_cell(
        block: *mut Self,
        cell: *mut u8,
        payload_offset: usize,
        cell_size: usize,
    ) {
        let data = Self::data(block, payload_offset);
        let index = (cell as usize - data as usize) / cell_size;

        (*block).free.write_to(cell);
        checks::poison_freed_cell(cell, I::WIDTH, cell_size);
        (*block).free = I::from_usize(index);
    }
}

/// Walk a handle's whole partial list and check everything that can be
/// checked: back-links mirror forward links, no full block lingers in the
/// list, and each block's embedded free list closes its counters
/// (`count + |free list| + (capacity - used) == capacity`).
///
/// This is O(cells) per call, so it only runs under `extra_assertions`.
#[cfg(feature = "extra_assertions")]
pub(crate) unsafe fn assert_list_valid<I: CellIndex>(
    head: *mut SlabHeader<I>,
    capacity: usize,
    payload_offset: usize,
    cell_size: usize,
) {
    let mut prev: *mut SlabHeader<I> = ptr::null_mut();
    let mut block = head;

    while !block.is_null() {
        assert_eq!(
            (*block).prev,
            prev,
            "partial-list back-links must mirror the forward links"
        );

        let used = (*block).used.to_usize();
        let count = (*block).count.to_usize();
        assert!(used <= capacity);
        assert!(count < capacity, "full blocks must leave the partial list");

        let data = SlabHeader::data(block, payload_offset);
        let mut free_len = 0;
        let mut index = (*block).free;
        while index != I::SENTINEL {
            let i = index.to_usize();
            assert!(i < used, "free indices must stay under the bump watermark");
            free_len += 1;
            assert!(free_len <= used, "the free list must not cycle");
            index = I::read_from(data.add(i * cell_size));
        }

        assert_eq!(
            count + free_len,
            used,
            "live cells plus free-list entries must account for every cell \
             below the watermark"
        );

        prev = block;
        block = (*block).next;
    }
}
