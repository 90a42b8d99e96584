//! The arena table: an ordered array of handles plus the size-to-handle
//! index function, laid out header-first in a single virtual-memory
//! reservation. The last slot is always the oversize/virtual handle.

use crate::handle::{Handle, HandleConfig};
use crate::runs::{Run, RunBlockHeader};
use core::cmp;
use core::mem;
use core::ptr::{self, NonNull};

/// Maps a request size to a handle index. Indices past the end of the table
/// are clamped onto the last (oversize) handle.
pub type ClassIndexFn = fn(usize) -> u32;

/// Everything needed to build a custom state.
pub struct StateConfig<'a> {
    /// One entry per size class, in the order the index function counts
    /// them. The oversize handle is appended automatically.
    pub handles: &'a [HandleConfig],
    /// Size-to-class mapping; `None` uses the power-of-two default.
    pub class_of: Option<ClassIndexFn>,
}

/// Default block size for the power-of-two class table: 8 MiB.
pub(crate) const DEFAULT_BLOCK_SIZE: usize = 1 << 23;

// Power-of-two classes 1, 2, 4, ... up to half the default block size.
const DEFAULT_CLASS_COUNT: usize = 23;

const fn default_classes() -> [HandleConfig; DEFAULT_CLASS_COUNT] {
    let mut table = [HandleConfig {
        // The 1-byte class starts from the smallest useful block; handle
        // construction clamps it up to one page.
        alloc_size: 1,
        block_size: mem::size_of::<RunBlockHeader>() + mem::size_of::<Run>(),
        alignment: 1,
    }; DEFAULT_CLASS_COUNT];

    let mut class = 1;
    while class < DEFAULT_CLASS_COUNT {
        table[class] = HandleConfig {
            alloc_size: 1 << class,
            block_size: DEFAULT_BLOCK_SIZE,
            alignment: 1 << class,
        };
        class += 1;
    }

    table
}

static DEFAULT_CLASSES: [HandleConfig; DEFAULT_CLASS_COUNT] = default_classes();

fn default_class_of(size: usize) -> u32 {
    size.next_power_of_two().trailing_zeros()
}

/// A table of size-class handles. See the module docs.
///
/// States are created in their own virtual-memory reservation and returned
/// as raw pointers; the table itself is immutable after construction, so
/// shared references to it (and its handles) stay valid until `destroy`.
#[repr(C)]
pub struct State {
    class_of: ClassIndexFn,
    handle_count: usize,
    handles: [Handle; 0],
}

impl State {
    /// Build a state. `None` uses the default power-of-two class table.
    /// Returns `None` when the virtual-memory layer refuses.
    pub fn new(config: Option<&StateConfig>) -> Option<NonNull<State>> {
        let (classes, class_of) = match config {
            Some(config) => (
                config.handles,
                config.class_of.unwrap_or(default_class_of as ClassIndexFn),
            ),
            None => (&DEFAULT_CLASSES[..], default_class_of as ClassIndexFn),
        };

        // One extra slot: the oversize/virtual handle.
        let handle_count = classes.len() + 1;
        let total = mem::size_of::<State>() + handle_count * mem::size_of::<Handle>();

        let raw = crate::virtual_alloc(total) as *mut State;
        if raw.is_null() {
            return None;
        }

        unsafe {
            ptr::addr_of_mut!((*raw).class_of).write(class_of);
            ptr::addr_of_mut!((*raw).handle_count).write(handle_count);

            let mut slot = ptr::addr_of_mut!((*raw).handles) as *mut Handle;
            for class in classes {
                Handle::init(slot, Some(class));
                slot = slot.add(1);
            }
            Handle::init(slot, None);
        }

        NonNull::new(raw)
    }

    /// Build a new state with this state's geometry but fresh dynamic state:
    /// no blocks, no live cells, no flags, new mutexes.
    pub fn duplicate(&self) -> Option<NonNull<State>> {
        let handle_count = self.handle_count;
        let total = mem::size_of::<State>() + handle_count * mem::size_of::<Handle>();

        let raw = crate::virtual_alloc(total) as *mut State;
        if raw.is_null() {
            return None;
        }

        unsafe {
            ptr::addr_of_mut!((*raw).class_of).write(self.class_of);
            ptr::addr_of_mut!((*raw).handle_count).write(handle_count);

            let slot = ptr::addr_of_mut!((*raw).handles) as *mut Handle;
            for index in 0..handle_count {
                Handle::init_cloned(slot.add(index), &*self.handles_ptr().add(index));
            }
        }

        NonNull::new(raw)
    }

    /// Tear down every handle (releasing all their blocks) and return the
    /// state's reservation.
    ///
    /// # Safety
    ///
    /// No other reference to the state or its handles may be used afterwards,
    /// and no cell allocated from it may be touched or freed.
    pub unsafe fn destroy(state: NonNull<State>) {
        let raw = state.as_ptr();
        let handle_count = (*raw).handle_count;

        let slot = ptr::addr_of_mut!((*raw).handles) as *mut Handle;
        for index in 0..handle_count {
            Handle::destroy(slot.add(index));
        }

        crate::virtual_free(
            raw as *mut u8,
            mem::size_of::<State>() + handle_count * mem::size_of::<Handle>(),
        );
    }

    fn handles_ptr(&self) -> *const Handle {
        ptr::addr_of!(self.handles) as *const Handle
    }

    /// The handle serving `size`-byte requests, or `None` for `size == 0`
    /// (a no-op for both alloc and free). Oversize requests land on the
    /// virtual handle in the last slot.
    pub fn handle_of(&self, size: usize) -> Option<&Handle> {
        if size == 0 {
            return None;
        }

        let index = (self.class_of)(size) as usize;
        let index = cmp::min(index, self.handle_count - 1);

        unsafe { Some(&*self.handles_ptr().add(index)) }
    }

    /// Number of handles, the oversize slot included.
    pub fn handle_count(&self) -> usize {
        self.handle_count
    }
}
