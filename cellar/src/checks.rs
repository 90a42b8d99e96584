//! Integrity checking that is free unless the `extra_assertions` feature is
//! enabled.
//!
//! Caller misuse (bad pointer, wrong declared size) is diagnosed with plain
//! `debug_assert!`s at the public boundary. The machinery here is for hunting
//! bugs in `cellar` itself: freed-cell poisoning and the expensive
//! walk-everything block verification, both compiled away by default.

#[cfg(feature = "extra_assertions")]
macro_rules! extra_assert {
    ( $condition:expr $( , $args:expr )* ) => {
        assert!($condition $( , $args )* )
    }
}

#[cfg(not(feature = "extra_assertions"))]
macro_rules! extra_assert {
    ( $condition:expr $( , $args:expr )* ) => {
        if false {
            let _ = $condition;
            $( let _ = $args; )*
        }
    }
}

#[cfg(feature = "extra_assertions")]
macro_rules! extra_assert_eq {
    ( $left:expr , $right:expr $( , $args:expr )* ) => {
        assert_eq!($left, $right $( , $args )* )
    }
}

#[cfg(not(feature = "extra_assertions"))]
macro_rules! extra_assert_eq {
    ( $left:expr , $right:expr $( , $args:expr )* ) => {
        if false {
            let _ = $left;
            let _ = $right;
            $( let _ = $args; )*
        }
    }
}

// Freed cells keep their first `index_width` bytes for the embedded free-list
// index; everything after that is dead until the cell is reused. Under
// `extra_assertions` the dead bytes are filled with this pattern on free and
// re-checked on allocation.
//
// Unexpected `0x4b4b4b4b` values in user data mean either a use-after-free in
// the caller or a bug in `cellar`'s free lists.
#[cfg(feature = "extra_assertions")]
pub(crate) const FREED_CELL_PATTERN: u8 = 0x4b;

#[cfg(feature = "extra_assertions")]
pub(crate) unsafe fn poison_freed_cell(cell: *mut u8, index_width: usize, cell_size: usize) {
    if cell_size > index_width {
        core::ptr::write_bytes(
            cell.add(index_width),
            FREED_CELL_PATTERN,
            cell_size - index_width,
        );
    }
}

#[cfg(not(feature = "extra_assertions"))]
#[inline(always)]
pub(crate) unsafe fn poison_freed_cell(cell: *mut u8, index_width: usize, cell_size: usize) {
    let _ = (cell, index_width, cell_size);
}

#[cfg(feature = "extra_assertions")]
pub(crate) unsafe fn assert_freed_cell_poisoned(cell: *const u8, index_width: usize, cell_size: usize) {
    let mut at = index_width;
    while at < cell_size {
        assert_eq!(
            *cell.add(at),
            FREED_CELL_PATTERN,
            "{:p} was written to while on a free list",
            cell,
        );
        at += 1;
    }
}

#[cfg(not(feature = "extra_assertions"))]
#[inline(always)]
pub(crate) unsafe fn assert_freed_cell_poisoned(cell: *const u8, index_width: usize, cell_size: usize) {
    let _ = (cell, index_width, cell_size);
}
