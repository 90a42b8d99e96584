//! Per-size-class arenas.
//!
//! A `Handle` owns every block of one size class: the doubly-linked list of
//! partially-free blocks, the class geometry, the reclamation flags, and the
//! mutex that makes each operation a single critical section. Blocks that
//! fill up leave the list entirely; they are found again on free by masking
//! the user pointer down to the block base, which works because every block
//! is aligned to its own (power-of-two) size.

use crate::imp;
use crate::runs::{self, Run, RunBlockHeader, RUN_CELLS};
use crate::slab::{CellIndex, SlabHeader};
use core::cell::UnsafeCell;
use core::cmp;
use core::mem;
use core::ptr;

/// Reclamation behaviour bits for one handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandleFlags(u32);

impl HandleFlags {
    /// No special behaviour: empty blocks are released under hysteresis.
    pub const NONE: HandleFlags = HandleFlags(0);

    /// Release a block the moment its last cell is freed.
    pub const IMMEDIATE_FREE: HandleFlags = HandleFlags(1);

    /// Never release empty blocks.
    pub const DO_NOT_FREE: HandleFlags = HandleFlags(1 << 1);

    /// Does `self` contain every bit of `flags`?
    pub fn contains(self, flags: HandleFlags) -> bool {
        self.0 & flags.0 == flags.0
    }
}

impl core::ops::BitOr for HandleFlags {
    type Output = HandleFlags;

    fn bitor(self, rhs: HandleFlags) -> HandleFlags {
        HandleFlags(self.0 | rhs.0)
    }
}

/// Requested geometry for one size class.
#[derive(Clone, Copy, Debug)]
pub struct HandleConfig {
    /// Cell width in bytes. Must be at least 1; a width of 3 is rounded up
    /// to 4 so the embedded free-list index fits a freed cell.
    pub alloc_size: usize,
    /// Requested block size; clamped and rounded per the class geometry.
    pub block_size: usize,
    /// Cell alignment. Must be a power of two.
    pub alignment: usize,
}

/// Which in-block bookkeeping variant a class uses, by free-list index width.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum IndexWidth {
    U8,
    U16,
    U32,
}

/// The common prefix every block header starts with, whatever its variant.
/// The handle's list and teardown code work through this view, and the free
/// path reads `alloc_size` through it for the wrong-class diagnostic before
/// dispatching.
#[repr(C)]
pub(crate) struct BlockHead {
    prev: *mut BlockHead,
    next: *mut BlockHead,
    real_ptr_off: u32,
    alloc_size: u32,
}

/// The dynamic half of a handle, guarded by the handle's mutex.
struct HandleState {
    flags: HandleFlags,
    /// Mapped blocks, including full ones that left the partial list.
    blocks: usize,
    /// Live cells across all blocks.
    live_cells: usize,
    /// Head of the partial-block list.
    head: *mut BlockHead,
}

/// One size class's arena. See the module docs.
pub struct Handle {
    mutex: imp::RawMutex,
    state: UnsafeCell<HandleState>,
    width: IndexWidth,
    cell_size: usize,
    /// Power of two, and the alignment of every block; 0 marks the
    /// oversize/virtual handle.
    block_size: usize,
    alignment: usize,
    payload_offset: usize,
    /// Cells per block (for the 1-byte class, across all runs).
    capacity: usize,
    /// Runs per block; only meaningful for the 1-byte class.
    run_count: usize,
}

// The interior mutability in `state` is guarded by `mutex`; the geometry
// fields are immutable after construction.
unsafe impl Sync for Handle {}

fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

struct Geometry {
    width: IndexWidth,
    cell_size: usize,
    block_size: usize,
    alignment: usize,
    payload_offset: usize,
    capacity: usize,
    run_count: usize,
}

fn slab_geometry<I: CellIndex>(
    width: IndexWidth,
    cell_size: usize,
    config: &HandleConfig,
    max_block: usize,
) -> Geometry {
    let header = mem::size_of::<SlabHeader<I>>();

    let block_size = cmp::min(config.block_size, max_block);
    let block_size = cmp::max(block_size, crate::page_size());
    let block_size = block_size.next_power_of_two();

    let payload_offset = align_up(header, config.alignment);

    let capacity = block_size.saturating_sub(payload_offset) / cell_size;
    let capacity = cmp::min(capacity, I::MAX_CELLS);
    let capacity = cmp::max(capacity, 1);

    // Shrink back: the clamped capacity may leave a tail the class can never
    // hand out.
    let block_size = (payload_offset + capacity * cell_size).next_power_of_two();

    Geometry {
        width,
        cell_size,
        block_size,
        alignment: config.alignment,
        payload_offset,
        capacity,
        run_count: 0,
    }
}

fn run_geometry(config: &HandleConfig) -> Geometry {
    let header = mem::size_of::<RunBlockHeader>();
    let run = mem::size_of::<Run>();

    let block_size = cmp::min(config.block_size, 65536);
    let block_size = cmp::max(block_size, crate::page_size());
    let block_size = block_size.next_power_of_two();

    let run_count = (block_size - header) / run;
    let run_count = cmp::min(run_count, runs::MAX_RUNS);
    let run_count = cmp::max(run_count, 1);

    let block_size = (header + run_count * run).next_power_of_two();

    Geometry {
        width: IndexWidth::U8,
        cell_size: 1,
        block_size,
        alignment: config.alignment,
        payload_offset: 0,
        capacity: run_count * RUN_CELLS,
        run_count,
    }
}

fn geometry(config: &HandleConfig) -> Geometry {
    debug_assert!(config.alloc_size > 0);
    debug_assert!(config.alignment.is_power_of_two());

    match config.alloc_size {
        1 => run_geometry(config),
        2 => slab_geometry::<u16>(IndexWidth::U16, 2, config, 131072),
        // A 3-byte cell cannot hold the 4-byte free-list index.
        3 => slab_geometry::<u32>(IndexWidth::U32, 4, config, 1 << 30),
        n => slab_geometry::<u32>(IndexWidth::U32, n, config, 1 << 30),
    }
}

impl Handle {
    /// Construct a handle in place. `None` builds the oversize/virtual
    /// handle, which has no blocks and forwards to the virtual-memory layer.
    pub(crate) unsafe fn init(slot: *mut Handle, config: Option<&HandleConfig>) {
        let geom = match config {
            Some(config) => geometry(config),
            None => Geometry {
                width: IndexWidth::U32,
                cell_size: 0,
                block_size: 0,
                alignment: 0,
                payload_offset: 0,
                capacity: 0,
                run_count: 0,
            },
        };

        ptr::write(
            slot,
            Handle {
                mutex: imp::RawMutex::vacant(),
                state: UnsafeCell::new(HandleState {
                    flags: HandleFlags::NONE,
                    blocks: 0,
                    live_cells: 0,
                    head: ptr::null_mut(),
                }),
                width: geom.width,
                cell_size: geom.cell_size,
                block_size: geom.block_size,
                alignment: geom.alignment,
                payload_offset: geom.payload_offset,
                capacity: geom.capacity,
                run_count: geom.run_count,
            },
        );

        (*slot).mutex.init();
    }

    /// Construct a handle in place with `source`'s geometry and fresh
    /// dynamic state.
    pub(crate) unsafe fn init_cloned(slot: *mut Handle, source: &Handle) {
        if source.is_virtual() {
            Handle::init(slot, None);
        } else {
            Handle::init(
                slot,
                Some(&HandleConfig {
                    alloc_size: source.cell_size,
                    block_size: source.block_size,
                    alignment: source.alignment,
                }),
            );
        }
    }

    /// Release every block the handle still owns and tear down its mutex.
    /// Cells still live in those blocks become dangling.
    pub(crate) unsafe fn destroy(slot: *mut Handle) {
        let handle = &*slot;

        if !handle.is_virtual() {
            let st = &mut *handle.state.get();
            let mut block = st.head;
            while !block.is_null() {
                let next = (*block).next;
                crate::virtual_free_aligned(
                    (block as *mut u8).sub((*block).real_ptr_off as usize),
                    handle.block_size,
                    handle.block_size,
                );
                block = next;
            }
            st.head = ptr::null_mut();
        }

        handle.mutex.destroy();
    }

    /// Does this handle bypass slabs and call the virtual-memory layer
    /// directly?
    pub fn is_virtual(&self) -> bool {
        self.block_size == 0
    }

    /// The fixed cell width of this class; 0 for the virtual handle.
    pub fn cell_size(&self) -> usize {
        self.cell_size
    }

    /// The size (and alignment) of this class's blocks; 0 for the virtual
    /// handle.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// How many cells one block holds.
    pub fn capacity_cells(&self) -> usize {
        self.capacity
    }

    /// Acquire this handle's mutex. Callers may then stack any number of
    /// `*_unlocked` operations before `unlock`.
    pub fn lock(&self) {
        unsafe { self.mutex.lock() }
    }

    /// Release this handle's mutex. Must pair with a `lock` by the same
    /// thread.
    pub fn unlock(&self) {
        unsafe { self.mutex.unlock() }
    }

    /// Replace the flag word.
    pub fn set_flags(&self, flags: HandleFlags) {
        self.lock();
        unsafe { self.set_flags_unlocked(flags) };
        self.unlock();
    }

    /// `set_flags` for callers already holding the lock.
    pub unsafe fn set_flags_unlocked(&self, flags: HandleFlags) {
        (*self.state.get()).flags = flags;
    }

    /// Set the given bits.
    pub fn add_flags(&self, flags: HandleFlags) {
        self.lock();
        unsafe { self.add_flags_unlocked(flags) };
        self.unlock();
    }

    /// `add_flags` for callers already holding the lock.
    pub unsafe fn add_flags_unlocked(&self, flags: HandleFlags) {
        let st = &mut *self.state.get();
        st.flags = st.flags | flags;
    }

    /// Clear the given bits.
    pub fn del_flags(&self, flags: HandleFlags) {
        self.lock();
        unsafe { self.del_flags_unlocked(flags) };
        self.unlock();
    }

    /// `del_flags` for callers already holding the lock.
    pub unsafe fn del_flags_unlocked(&self, flags: HandleFlags) {
        let st = &mut *self.state.get();
        st.flags = HandleFlags(st.flags.0 & !flags.0);
    }

    /// Read the flag word.
    pub fn flags(&self) -> HandleFlags {
        self.lock();
        let flags = unsafe { self.flags_unlocked() };
        self.unlock();
        flags
    }

    /// `flags` for callers already holding the lock.
    pub unsafe fn flags_unlocked(&self) -> HandleFlags {
        (*self.state.get()).flags
    }

    /// How many blocks the handle currently has mapped, full ones included.
    pub fn block_count(&self) -> usize {
        self.lock();
        let blocks = unsafe { (*self.state.get()).blocks };
        self.unlock();
        blocks
    }

    /// How many cells of this class are currently live.
    pub fn live_cell_count(&self) -> usize {
        self.lock();
        let cells = unsafe { (*self.state.get()).live_cells };
        self.unlock();
        cells
    }

    /// Allocate one cell of at least `size` bytes, zero-filled if `zero`.
    /// Null on `size == 0` or when the virtual-memory layer refuses.
    pub fn alloc(&self, size: usize, zero: bool) -> *mut u8 {
        if size == 0 {
            return ptr::null_mut();
        }

        self.lock();
        let cell = unsafe { self.alloc_unlocked(size, zero) };
        self.unlock();
        cell
    }

    /// `alloc` for callers already holding the lock.
    pub unsafe fn alloc_unlocked(&self, size: usize, zero: bool) -> *mut u8 {
        if size == 0 {
            return ptr::null_mut();
        }

        if self.is_virtual() {
            // Fresh reservations are zero-filled, so `zero` costs nothing.
            return crate::virtual_alloc(size);
        }

        debug_assert!(
            size <= self.cell_size,
            "a request of {} bytes was routed to the {}-byte class",
            size,
            self.cell_size,
        );

        let st = &mut *self.state.get();
        match self.width {
            IndexWidth::U8 => self.alloc_runs(st, zero),
            IndexWidth::U16 => self.alloc_slab::<u16>(st, zero),
            IndexWidth::U32 => self.alloc_slab::<u32>(st, zero),
        }
    }

    /// Return a cell. `size` must be the size passed to the matching
    /// allocation; a null `ptr` is a no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from this handle (or a handle routing the same
    /// class of the same state) and must not be freed twice.
    pub unsafe fn free(&self, ptr: *mut u8, size: usize) {
        if ptr.is_null() {
            return;
        }

        self.lock();
        self.free_unlocked(ptr, size);
        self.unlock();
    }

    /// `free` for callers already holding the lock.
    pub unsafe fn free_unlocked(&self, ptr: *mut u8, size: usize) {
        if ptr.is_null() {
            return;
        }

        if self.is_virtual() {
            crate::virtual_free(ptr, size);
            return;
        }

        debug_assert!(
            size <= self.cell_size,
            "a free of {} bytes was routed to the {}-byte class",
            size,
            self.cell_size,
        );
        debug_assert_eq!(
            ptr as usize & (self.alignment - 1),
            0,
            "{:p} is not aligned to its declared size class",
            ptr,
        );

        let st = &mut *self.state.get();
        let base = (ptr as usize & !(self.block_size - 1)) as *mut u8;
        match self.width {
            IndexWidth::U8 => self.free_runs(st, base as *mut RunBlockHeader, ptr),
            IndexWidth::U16 => self.free_slab::<u16>(st, base as *mut SlabHeader<u16>, ptr),
            IndexWidth::U32 => self.free_slab::<u32>(st, base as *mut SlabHeader<u32>, ptr),
        }
    }

    /// Move an allocation between classes (or resize within one).
    ///
    /// `new_size == 0` frees and returns null; a null `ptr` allocates fresh.
    /// When both sizes route to the same non-virtual handle the pointer is
    /// returned unchanged — the cell already fits — zero-filling
    /// `[old_size, new_size)` if `zero` asked for it. Everything else
    /// allocates in `new`, copies the overlap, and frees from `old`.
    ///
    /// # Safety
    ///
    /// As for `free`; additionally, the caller must not hold either handle's
    /// lock.
    pub unsafe fn realloc(
        old: Option<&Handle>,
        ptr: *mut u8,
        old_size: usize,
        new: Option<&Handle>,
        new_size: usize,
        zero: bool,
    ) -> *mut u8 {
        realloc_engine(
            old,
            ptr,
            old_size,
            new,
            new_size,
            zero,
            |handle, size, zero| handle.alloc(size, zero),
            |handle, ptr, size| unsafe { handle.free(ptr, size) },
        )
    }

    /// `realloc` for callers already holding the locks of every handle
    /// involved.
    pub unsafe fn realloc_unlocked(
        old: Option<&Handle>,
        ptr: *mut u8,
        old_size: usize,
        new: Option<&Handle>,
        new_size: usize,
        zero: bool,
    ) -> *mut u8 {
        realloc_engine(
            old,
            ptr,
            old_size,
            new,
            new_size,
            zero,
            |handle, size, zero| unsafe { handle.alloc_unlocked(size, zero) },
            |handle, ptr, size| unsafe { handle.free_unlocked(ptr, size) },
        )
    }

    unsafe fn map_block(&self) -> Option<(*mut u8, u32)> {
        let (real, aligned) = crate::virtual_alloc_aligned(self.block_size, self.block_size)?;
        let off = aligned as usize - real as usize;
        debug_assert!(off < u32::MAX as usize);
        Some((aligned, off as u32))
    }

    // An empty block goes back to the OS either eagerly, or when enough
    // slack remains to absorb oscillation around a block boundary: one spare
    // block stays mapped unless live occupancy already fits in the blocks
    // beyond the spare.
    fn should_release(&self, st: &HandleState) -> bool {
        if st.flags.contains(HandleFlags::IMMEDIATE_FREE) {
            return true;
        }

        st.blocks >= 2
            && !st.flags.contains(HandleFlags::DO_NOT_FREE)
            && st.live_cells <= self.capacity * (st.blocks - 2)
    }

    unsafe fn alloc_slab<I: CellIndex>(&self, st: &mut HandleState, zero: bool) -> *mut u8 {
        let mut block = st.head as *mut SlabHeader<I>;
        if block.is_null() {
            let (aligned, off) = match self.map_block() {
                Some(mapping) => mapping,
                None => return ptr::null_mut(),
            };

            block = aligned as *mut SlabHeader<I>;
            SlabHeader::init(block, off, self.cell_size as u32);
            st.blocks += 1;
            st.head = block as *mut BlockHead;
        }

        st.live_cells += 1;
        let count = (*block).count.to_usize() + 1;
        (*block).count = I::from_usize(count);

        if count == self.capacity {
            // Full: leave the partial list. The block is the head, so only
            // the forward link needs patching.
            let next = (*block).next;
            st.head = next as *mut BlockHead;
            if !next.is_null() {
                (*next).prev = ptr::null_mut();
            }
            (*block).next = ptr::null_mut();
        }

        let cell = SlabHeader::pop_cell(block, self.payload_offset, self.cell_size, zero);
        self.verify(st);
        cell
    }

    unsafe fn free_slab<I: CellIndex>(
        &self,
        st: &mut HandleState,
        block: *mut SlabHeader<I>,
        cell: *mut u8,
    ) {
        debug_assert_eq!(
            (*block).alloc_size as usize,
            self.cell_size,
            "{:p} was freed with a size from another class",
            cell,
        );

        st.live_cells -= 1;
        let count = (*block).count.to_usize() - 1;
        (*block).count = I::from_usize(count);

        SlabHeader::push_cell(block, cell, self.payload_offset, self.cell_size);

        if count == self.capacity - 1 {
            // Coming back from full: re-enter at the head of the partial
            // list. This must happen before the reclamation check so that a
            // single-cell block (full the moment it is allocated from) is on
            // the list when it is unlinked below.
            extra_assert!((*block).prev.is_null());
            let head = st.head as *mut SlabHeader<I>;
            if !head.is_null() {
                (*head).prev = block;
            }
            (*block).next = head;
            st.head = block as *mut BlockHead;
        }

        if count == 0 && self.should_release(st) {
            let prev = (*block).prev;
            let next = (*block).next;
            if prev.is_null() {
                st.head = next as *mut BlockHead;
            } else {
                (*prev).next = next;
            }
            if !next.is_null() {
                (*next).prev = prev;
            }

            crate::virtual_free_aligned(
                (block as *mut u8).sub((*block).real_ptr_off as usize),
                self.block_size,
                self.block_size,
            );
            st.blocks -= 1;
        }

        self.verify(st);
    }

    unsafe fn alloc_runs(&self, st: &mut HandleState, zero: bool) -> *mut u8 {
        let mut block = st.head as *mut RunBlockHeader;
        if block.is_null() {
            let (aligned, off) = match self.map_block() {
                Some(mapping) => mapping,
                None => return ptr::null_mut(),
            };

            block = aligned as *mut RunBlockHeader;
            RunBlockHeader::init(block, off, self.run_count);
            st.blocks += 1;
            st.head = block as *mut BlockHead;
        }

        let run = RunBlockHeader::run_at(block, (*block).free as usize);

        st.live_cells += 1;
        (*block).count += 1;
        (*run).count += 1;

        if (*run).count as usize == RUN_CELLS {
            if (*block).count as usize == self.capacity {
                // Every run is full: the whole block leaves the partial
                // list.
                let next = (*block).next;
                st.head = next as *mut BlockHead;
                if !next.is_null() {
                    (*next).prev = ptr::null_mut();
                }
                (*block).next = ptr::null_mut();
            } else {
                // Advance the cursor to the next run with room.
                (*block).free = (*run).next as u16;
            }
        }

        let cell = Run::pop_cell(run, zero);
        self.verify(st);
        cell
    }

    unsafe fn free_runs(&self, st: &mut HandleState, block: *mut RunBlockHeader, cell: *mut u8) {
        debug_assert_eq!(
            (*block).alloc_size as usize,
            self.cell_size,
            "{:p} was freed with a size from another class",
            cell,
        );

        let run_index = RunBlockHeader::run_of(block, cell);
        let run = RunBlockHeader::run_at(block, run_index);

        st.live_cells -= 1;
        (*block).count -= 1;
        (*run).count -= 1;

        Run::push_cell(run, cell);

        if (*run).count as usize == RUN_CELLS - 1 {
            // The run was full; put it back on the block's run chain.
            (*run).next = (*block).free as u8;
            (*block).free = run_index as u16;

            if (*block).count as usize == self.capacity - 1 {
                // And the block itself was full and detached; re-enter at
                // the head of the partial list.
                extra_assert!((*block).prev.is_null());
                let head = st.head as *mut RunBlockHeader;
                if !head.is_null() {
                    (*head).prev = block;
                }
                (*block).next = head;
                st.head = block as *mut BlockHead;
            }
        }

        if (*block).count == 0 && self.should_release(st) {
            let prev = (*block).prev;
            let next = (*block).next;
            if prev.is_null() {
                st.head = next as *mut BlockHead;
            } else {
                (*prev).next = next;
            }
            if !next.is_null() {
                (*next).prev = prev;
            }

            crate::virtual_free_aligned(
                (block as *mut u8).sub((*block).real_ptr_off as usize),
                self.block_size,
                self.block_size,
            );
            st.blocks -= 1;
        }

        self.verify(st);
    }

    #[cfg(feature = "extra_assertions")]
    unsafe fn verify(&self, st: &HandleState) {
        match self.width {
            IndexWidth::U8 => {
                runs::assert_list_valid(st.head as *mut RunBlockHeader, self.run_count)
            }
            IndexWidth::U16 => crate::slab::assert_list_valid::<u16>(
                st.head as *mut SlabHeader<u16>,
                self.capacity,
                self.payload_offset,
                self.cell_size,
            ),
            IndexWidth::U32 => crate::slab::assert_list_valid::<u32>(
                st.head as *mut SlabHeader<u32>,
                self.capacity,
                self.payload_offset,
                self.cell_size,
            ),
        }
    }

    #[cfg(not(feature = "extra_assertions"))]
    #[inline(always)]
    unsafe fn verify(&self, st: &HandleState) {
        let _ = st;
    }
}

unsafe fn realloc_engine<A, F>(
    old: Option<&Handle>,
    ptr: *mut u8,
    old_size: usize,
    new: Option<&Handle>,
    new_size: usize,
    zero: bool,
    alloc: A,
    free: F,
) -> *mut u8
where
    A: Fn(&Handle, usize, bool) -> *mut u8,
    F: Fn(&Handle, *mut u8, usize),
{
    if new_size == 0 {
        match old {
            Some(old) => free(old, ptr, old_size),
            None => debug_assert!(ptr.is_null(), "non-null pointer with declared size 0"),
        }
        return ptr::null_mut();
    }

    let new_handle = match new {
        Some(new) => new,
        None => return ptr::null_mut(),
    };

    if ptr.is_null() {
        return alloc(new_handle, new_size, zero);
    }

    if let Some(old_handle) = old {
        if ptr::eq(old_handle, new_handle) {
            if old_handle.is_virtual() {
                return crate::virtual_realloc(ptr, old_size, new_size);
            }

            // The cell already fits the new size; only a requested
            // zero-fill of the grown tail is left to do.
            if new_size > old_size && zero {
                ptr::write_bytes(ptr.add(old_size), 0, new_size - old_size);
            }
            return ptr;
        }
    }

    let new_ptr = alloc(new_handle, new_size, zero);
    if new_ptr.is_null() {
        return ptr::null_mut();
    }

    ptr::copy_nonoverlapping(ptr, new_ptr, cmp::min(old_size, new_size));

    match old {
        Some(old) => free(old, ptr, old_size),
        None => debug_assert!(false, "non-null pointer with declared size 0"),
    }

    new_ptr
}
