use core::cell::UnsafeCell;
use core::mem;
use core::ptr;
use memory_units::Bytes;

pub(crate) fn page_size() -> Bytes {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    debug_assert!(size > 0);
    Bytes(size as usize)
}

pub(crate) unsafe fn alloc(size: Bytes) -> *mut u8 {
    if size.0 == 0 {
        return ptr::null_mut();
    }

    let addr = libc::mmap(
        ptr::null_mut(),
        size.0,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_ANON | libc::MAP_PRIVATE,
        -1,
        0,
    );
    if addr == libc::MAP_FAILED {
        ptr::null_mut()
    } else {
        addr as *mut u8
    }
}

pub(crate) unsafe fn free(ptr: *mut u8, size: Bytes) {
    if ptr.is_null() {
        return;
    }

    let status = libc::munmap(ptr as *mut libc::c_void, size.0);
    debug_assert_eq!(status, 0, "munmap of our own mapping should succeed");
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
    let real = libc::mmap(
        ptr::null_mut(),
        size.0 + mask,
        libc::PROT_NONE,
        libc::MAP_ANON | libc::MAP_PRIVATE,
        -1,
        0,
    );
    if real == libc::MAP_FAILED {
        return None;
    }

    let aligned = ((real as usize + mask) & !mask) as *mut u8;
    if libc::mprotect(
        aligned as *mut libc::c_void,
        size.0,
        libc::PROT_READ | libc::PROT_WRITE,
    ) != 0
    {
        free(real as *mut u8, Bytes(size.0 + mask));
        return None;
    }

    Some((real as *mut u8, aligned))
}

pub(crate) unsafe fn free_aligned(real: *mut u8, size: Bytes, align: Bytes) {
    free(real, Bytes(size.0 + align.0 - 1));
}

// Align to the cache line size on an i7 to prevent false sharing between
// neighbouring handles.
#[repr(align(64))]
pub(crate) struct RawMutex {
    inner: UnsafeCell<libc::pthread_mutex_t>,
}

impl RawMutex {
    /// A mutex-shaped hole. `init` must run on it in place before first use.
    pub(crate) fn vacant() -> RawMutex {
        RawMutex {
            inner: UnsafeCell::new(unsafe { mem::zeroed() }),
        }
    }

    pub(crate) unsafe fn init(&self) {
        let code = libc::pthread_mutex_init(self.inner.get(), ptr::null());
        extra_assert_eq!(code, 0, "pthread_mutex_init should run OK");
    }

    pub(crate) unsafe fn lock(&self) {
        let code = libc::pthread_mutex_lock(self.inner.get());
        extra_assert_eq!(code, 0, "pthread_mutex_lock should run OK");
    }

    pub(crate) unsafe fn unlock(&self) {
        let code = libc::pthread_mutex_unlock(self.inner.get());
        extra_assert_eq!(code, 0, "pthread_mutex_unlock should run OK");
    }

    pub(crate) unsafe fn destroy(&self) {
        let code = libc::pthread_mutex_destroy(self.inner.get());
        extra_assert_eq!(code, 0, "pthread_mutex_destroy should run OK");
    }
}
