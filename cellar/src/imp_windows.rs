use core::cell::UnsafeCell;
use core::mem;
use core::ptr;
use memory_units::Bytes;

use winapi::ctypes::c_void;
use winapi::um::memoryapi::{VirtualAlloc, VirtualFree};
use winapi::um::minwinbase::CRITICAL_SECTION;
use winapi::um::synchapi::{
    DeleteCriticalSection, EnterCriticalSection, InitializeCriticalSection, LeaveCriticalSection,
};
use winapi::um::sysinfoapi::{GetSystemInfo, SYSTEM_INFO};
use winapi::um::winnt::{MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS, PAGE_READWRITE};

pub(crate) fn page_size() -> Bytes {
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        debug_assert!(info.dwPageSize > 0);
        Bytes(info.dwPageSize as usize)
    }
}

pub(crate) unsafe fn alloc(size: Bytes) -> *mut u8 {
    if size.0 == 0 {
        return ptr::null_mut();
    }

    VirtualAlloc(
        ptr::null_mut(),
        size.0,
        MEM_COMMIT | MEM_RESERVE,
        PAGE_READWRITE,
    ) as *mut u8
}

pub(crate) unsafe fn free(ptr: *mut u8, size: Bytes) {
    // Releasing always covers the whole reservation; the size only matters to
    // the unix backend.
    let _ = size;

    if ptr.is_null() {
        return;
    }

    let status = VirtualFree(ptr as *mut c_void, 0, MEM_RELEASE);
    debug_assert_ne!(status, 0, "VirtualFree of our own reservation should succeed");
}

// Reserve `size + align - 1` bytes inaccessible, then commit exactly the
// aligned `size` bytes inside the reservation. The caller must release with
// `free_aligned`, passing the *real* base.
pub(crate) unsafe fn alloc_aligned(size: Bytes, align: Bytes) -> Option<(*mut u8, *mut u8)> {
    extra_assert!(align.0.is_power_of_two());

    if size.0 == 0 {
        return None;
    }

    let mask = align.0 - 1;
    let real = VirtualAlloc(ptr::null_mut(), size.0 + mask, MEM_RESERVE, PAGE_NOACCESS);
    if real.is_null() {
        return None;
    }

    let aligned = ((real as usize + mask) & !mask) as *mut c_void;
    let committed = VirtualAlloc(aligned, size.0, MEM_COMMIT, PAGE_READWRITE);
    if committed.is_null() {
        free(real as *mut u8, Bytes(size.0 + mask));
        return None;
    }

    Some((real as *mut u8, committed as *mut u8))
}

pub(crate) unsafe fn free_aligned(real: *mut u8, size: Bytes, align: Bytes) {
    free(real, Bytes(size.0 + align.0 - 1));
}

// Align to the cache line size on an i7 to prevent false sharing between
// neighbouring handles.
#[repr(align(64))]
pub(crate) struct RawMutex {
    inner: UnsafeCell<CRITICAL_SECTION>,
}

impl RawMutex {
    /// A mutex-shaped hole. `init` must run on it in place before first use.
    pub(crate) fn vacant() -> RawMutex {
        RawMutex {
            inner: UnsafeCell::new(unsafe { mem::zeroed() }),
        }
    }

    pub(crate) unsafe fn init(&self) {
        InitializeCriticalSection(self.inner.get());
    }

    pub(crate) unsafe fn lock(&self) {
        EnterCriticalSection(self.inner.get());
    }

    pub(crate) unsafe fn unlock(&self) {
        LeaveCriticalSection(self.inner.get());
    }

    pub(crate) unsafe fn destroy(&self) {
        DeleteCriticalSection(self.inner.get());
    }
}
