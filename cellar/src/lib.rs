/*!

## About

`cellar`: a size-class slab allocator built directly on the operating
system's virtual-memory facilities.

Every request is routed by size to a per-class arena (a *handle*) that carves
large, naturally-aligned virtual-memory blocks into fixed-width cells. Freeing
needs no per-allocation header: because each block is aligned to its own
power-of-two size, the owning block is recovered from a user pointer by
masking off the low bits, and the caller re-declares the size it asked for.
Freed cells store the free list *inside* their own payload, so a block's
bookkeeping is a handful of bytes regardless of how many cells it holds.

`cellar` is aimed at workloads with many short-lived objects of predictable
sizes — spatial indices, graph nodes, parser nodes — where it can serve as a
drop-in replacement for the C library's general allocator. Requests larger
than the largest configured class bypass the slab machinery and go straight
to the virtual-memory layer.

```text
+------------------------------------------------------------------------+
| Operating System                                                       |
+------------------------------------------------------------------------+
          |                                                   ^
          | aligned blocks                                    | empty blocks
          V                                                   | (hysteresis)
+------------------------------------------------------------------------+
| State: [ handle 1B | handle 2B | handle 4B | ... | handle 4MiB | virt ] |
|             |                                                     |    |
|             | partial-block list per handle          oversize     |    |
|             V                                        pass-through |    |
|        +-------+     +-------+     +-------+                      |    |
|        | block | <-> | block | <-> | block |   (full blocks       |    |
|        +-------+     +-------+     +-------+    leave the list)   |    |
+------------------------------------------------------------------------+
          |                                                         |
          | cells                                       whole       |
          V                                             reservations V
+------------------------------------------------------------------------+
| User Application                                                       |
+------------------------------------------------------------------------+
```

## Using `cellar`

```no_run
let node = cellar::alloc(48, true);
assert!(!node.is_null());
// ... use the 48 zeroed bytes ...
unsafe { cellar::free(node, 48) };
```

Callers must remember the size they asked for: `free` and `realloc` take the
originally requested size, which is what routes them back to the right class.

## `cargo` Features

- **global_state**: On by default. Lazily creates one process-wide `State` on
  first use, backing the free-function facade (`alloc`, `free`, `realloc`,
  and the `*_items` helpers). Disable it to manage states explicitly.

- **extra_assertions**: Enable expensive integrity assertions and defensive
  mechanisms, such as poisoning freed cells and re-walking a handle's block
  list after every mutation. Large runtime overhead; useful when debugging a
  use-after-free or `cellar` itself.

## Locking

Each handle carries one mutex and every operation on it is a single critical
section; different size classes never contend. The `*_unlocked` variants are
the primitives — callers may take `Handle::lock` once and stack several of
them before `Handle::unlock`.

 */

#![deny(missing_docs)]
#![cfg_attr(not(test), no_std)]

#[macro_use]
mod checks;

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(unix)] {
        mod imp_unix;
        use crate::imp_unix as imp;
    } else if #[cfg(windows)] {
        mod imp_windows;
        use crate::imp_windows as imp;
    } else {
        compile_error! {
            "There is no `cellar` virtual-memory implementation for this target; want to send a pull request? :)"
        }
    }
}

mod handle;
mod runs;
mod slab;
mod state;

pub use crate::handle::{Handle, HandleConfig, HandleFlags};
pub use crate::state::{ClassIndexFn, State, StateConfig};

use core::cmp;
use core::mem;
use core::ptr;
use memory_units::Bytes;

/// The operating system's page size in bytes. Queried once, then cached.
pub fn page_size() -> usize {
    static PAGE_SIZE: spin::Once<usize> = spin::Once::new();

    *PAGE_SIZE.call_once(|| {
        let size = imp::page_size();
        debug_assert!(size.0.is_power_of_two());
        size.0
    })
}

/// The block size the default class table uses: 8 MiB.
pub fn default_block_size() -> usize {
    state::DEFAULT_BLOCK_SIZE
}

/// Reserve and commit `size` bytes of zero-filled read-write memory.
/// Null on `size == 0` or when the OS refuses.
pub fn virtual_alloc(size: usize) -> *mut u8 {
    unsafe { imp::alloc(Bytes(size)) }
}

/// Release a reservation made by [`virtual_alloc`]. A null `ptr` is a no-op.
///
/// # Safety
///
/// `ptr` and `size` must match the original reservation exactly.
pub unsafe fn virtual_free(ptr: *mut u8, size: usize) {
    imp::free(ptr, Bytes(size));
}

/// Reserve `size + align - 1` bytes and commit the `align`-aligned `size`
/// bytes inside. Returns `(real, aligned)`: keep `real` for the matching
/// [`virtual_free_aligned`]. `align` must be a power of two.
pub fn virtual_alloc_aligned(size: usize, align: usize) -> Option<(*mut u8, *mut u8)> {
    unsafe { imp::alloc_aligned(Bytes(size), Bytes(align)) }
}

/// Release a reservation made by [`virtual_alloc_aligned`].
///
/// # Safety
///
/// `real`, `size`, and `align` must match the original reservation exactly.
pub unsafe fn virtual_free_aligned(real: *mut u8, size: usize, align: usize) {
    imp::free_aligned(real, Bytes(size), Bytes(align));
}

/// Resize a plain virtual reservation by reserve-copy-release.
/// `new_size == 0` frees and returns null; a null `ptr` allocates fresh. On
/// failure the old reservation is left untouched and null is returned.
///
/// # Safety
///
/// As for [`virtual_free`].
pub unsafe fn virtual_realloc(ptr: *mut u8, old_size: usize, new_size: usize) -> *mut u8 {
    if new_size == 0 {
        virtual_free(ptr, old_size);
        return ptr::null_mut();
    }

    if ptr.is_null() {
        return virtual_alloc(new_size);
    }

    let new_ptr = virtual_alloc(new_size);
    if new_ptr.is_null() {
        return ptr::null_mut();
    }

    ptr::copy_nonoverlapping(ptr, new_ptr, cmp::min(old_size, new_size));
    virtual_free(ptr, old_size);

    new_ptr
}

/// [`virtual_realloc`] for aligned reservations. Takes and returns the
/// *real* base alongside the aligned pointer, like [`virtual_alloc_aligned`].
///
/// # Safety
///
/// As for [`virtual_free_aligned`].
pub unsafe fn virtual_realloc_aligned(
    real: *mut u8,
    old_size: usize,
    new_size: usize,
    align: usize,
) -> Option<(*mut u8, *mut u8)> {
    if new_size == 0 {
        virtual_free_aligned(real, old_size, align);
        return None;
    }

    if real.is_null() {
        return virtual_alloc_aligned(new_size, align);
    }

    let (new_real, new_aligned) = virtual_alloc_aligned(new_size, align)?;

    let mask = align - 1;
    let old_aligned = ((real as usize + mask) & !mask) as *const u8;
    ptr::copy_nonoverlapping(old_aligned, new_aligned, cmp::min(old_size, new_size));

    virtual_free_aligned(real, old_size, align);

    Some((new_real, new_aligned))
}

/// The process-wide state backing the free-function facade. Created lazily
/// on first use with the default class table; never torn down (the OS
/// reclaims it at process exit).
#[cfg(feature = "global_state")]
pub fn global_state() -> &'static State {
    static GLOBAL_STATE: spin::Once<&'static State> = spin::Once::new();

    *GLOBAL_STATE.call_once(|| {
        let state = State::new(None).expect("cellar: cannot reserve the global allocator state");
        // Never destroyed, so the reference really is 'static.
        unsafe { &*state.as_ptr() }
    })
}

/// Allocate `size` bytes from `state`, zero-filled if `zero`. The result is
/// aligned to `size`'s class. Null on `size == 0` or out-of-memory.
pub fn alloc_in(state: &State, size: usize, zero: bool) -> *mut u8 {
    match state.handle_of(size) {
        Some(handle) => handle.alloc(size, zero),
        None => ptr::null_mut(),
    }
}

/// Return an allocation to `state`. `size` must be the size originally
/// requested; a null `ptr` is a no-op.
///
/// # Safety
///
/// `ptr` must have been allocated from `state` with this `size` and must not
/// be freed twice.
pub unsafe fn free_in(state: &State, ptr: *mut u8, size: usize) {
    match state.handle_of(size) {
        Some(handle) => handle.free(ptr, size),
        None => debug_assert!(ptr.is_null(), "non-null pointer freed with size 0"),
    }
}

/// Resize an allocation in `state`; see [`Handle::realloc`] for the policy.
///
/// # Safety
///
/// As for [`free_in`]; `old_size` must be the size originally requested.
pub unsafe fn realloc_in(
    state: &State,
    ptr: *mut u8,
    old_size: usize,
    new_size: usize,
    zero: bool,
) -> *mut u8 {
    Handle::realloc(
        state.handle_of(old_size),
        ptr,
        old_size,
        state.handle_of(new_size),
        new_size,
        zero,
    )
}

/// [`alloc_in`] on the global state.
#[cfg(feature = "global_state")]
pub fn alloc(size: usize, zero: bool) -> *mut u8 {
    alloc_in(global_state(), size, zero)
}

/// [`free_in`] on the global state.
///
/// # Safety
///
/// As for [`free_in`].
#[cfg(feature = "global_state")]
pub unsafe fn free(ptr: *mut u8, size: usize) {
    free_in(global_state(), ptr, size);
}

/// [`realloc_in`] on the global state.
///
/// # Safety
///
/// As for [`realloc_in`].
#[cfg(feature = "global_state")]
pub unsafe fn realloc(ptr: *mut u8, old_size: usize, new_size: usize, zero: bool) -> *mut u8 {
    realloc_in(global_state(), ptr, old_size, new_size, zero)
}

/// Allocate room for `count` values of `T` from `state`. The class serving
/// `count * size_of::<T>()` is at least as aligned as `T`.
pub fn alloc_items_in<T>(state: &State, count: usize, zero: bool) -> *mut T {
    alloc_in(state, count * mem::size_of::<T>(), zero) as *mut T
}

/// Free `count` values of `T` allocated with [`alloc_items_in`].
///
/// # Safety
///
/// As for [`free_in`].
pub unsafe fn free_items_in<T>(state: &State, ptr: *mut T, count: usize) {
    free_in(state, ptr as *mut u8, count * mem::size_of::<T>());
}

/// Resize an [`alloc_items_in`] allocation from `old_count` to `new_count`
/// values of `T`.
///
/// # Safety
///
/// As for [`realloc_in`].
pub unsafe fn realloc_items_in<T>(
    state: &State,
    ptr: *mut T,
    old_count: usize,
    new_count: usize,
    zero: bool,
) -> *mut T {
    realloc_in(
        state,
        ptr as *mut u8,
        old_count * mem::size_of::<T>(),
        new_count * mem::size_of::<T>(),
        zero,
    ) as *mut T
}

/// [`alloc_items_in`] on the global state.
#[cfg(feature = "global_state")]
pub fn alloc_items<T>(count: usize, zero: bool) -> *mut T {
    alloc_items_in(global_state(), count, zero)
}

/// [`free_items_in`] on the global state.
///
/// # Safety
///
/// As for [`free_in`].
#[cfg(feature = "global_state")]
pub unsafe fn free_items<T>(ptr: *mut T, count: usize) {
    free_items_in(global_state(), ptr, count);
}

/// [`realloc_items_in`] on the global state.
///
/// # Safety
///
/// As for [`realloc_in`].
#[cfg(feature = "global_state")]
pub unsafe fn realloc_items<T>(ptr: *mut T, old_count: usize, new_count: usize, zero: bool) -> *mut T {
    realloc_items_in(global_state(), ptr, old_count, new_count, zero)
}
