//! OS page allocator: the leaf of the allocator stack (`spec.md` §4.1).
//!
//! Wraps anonymous private mappings on unix and `VirtualAlloc`/`VirtualFree`
//! on Windows. Allocation failure returns `None` only for the OS's
//! memory-pressure condition (`ENOMEM` / `ERROR_NOT_ENOUGH_MEMORY`); any
//! other failure is a programming error we can't recover from, so it aborts
//! the process with a diagnostic, matching the fatal-violation band in
//! `spec.md` §7.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// The OS page size, cached after the first call.
///
/// Populated with a relaxed load/store, per the Design Note in `spec.md` §9
/// ("a single-init guard ... suffices"): a torn read just means two threads
/// independently recompute the same constant once, which is harmless.
pub fn page_size() -> usize {
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let fresh = query_os_page_size();
    PAGE_SIZE.store(fresh, Ordering::Relaxed);
    fresh
}

#[cfg(unix)]
fn query_os_page_size() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if ret <= 0 {
        log::error!("sysconf(_SC_PAGESIZE) returned {ret}");
        std::process::abort();
    }
    ret as usize
}

#[cfg(windows)]
fn query_os_page_size() -> usize {
    use winapi::um::sysinfoapi::{GetSystemInfo, SYSTEM_INFO};
    unsafe {
        let mut info: SYSTEM_INFO = std::mem::zeroed();
        GetSystemInfo(&mut info);
        info.dwPageSize as usize
    }
}

/// A handle to one or more OS-granted pages.
///
/// Carries its own length so `free` doesn't need the caller to separately
/// track it (mirrors `munmap(addr, len)` / `VirtualFree(addr, size, ...)`
/// both needing the original size).
#[derive(Debug)]
pub struct Page {
    ptr: NonNull<u8>,
    len: usize,
}

unsafe impl Send for Page {}

impl Page {
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

/// Allocate `n_pages` pages (rounded up from 1) of anonymous, read-write,
/// page-aligned memory. Returns `None` only on memory pressure.
pub fn alloc_pages(n_pages: usize) -> Option<Page> {
    let n_pages = n_pages.max(1);
    let len = n_pages * page_size();
    alloc_bytes(len)
}

#[cfg(unix)]
fn alloc_bytes(len: usize) -> Option<Page> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        let err = std::io::Error::last_os_error();
        return handle_alloc_failure(err);
    }
    Some(Page { ptr: NonNull::new(ptr as *mut u8).expect("mmap returned non-null on success"), len })
}

#[cfg(unix)]
fn handle_alloc_failure(err: std::io::Error) -> Option<Page> {
    if err.raw_os_error() == Some(libc::ENOMEM) {
        None
    } else {
        log::error!("mmap(MAP_ANONYMOUS) failed unexpectedly: {err}");
        std::process::abort();
    }
}

#[cfg(windows)]
fn alloc_bytes(len: usize) -> Option<Page> {
    use winapi::um::memoryapi::VirtualAlloc;
    use winapi::um::winnt::{MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE};
    let ptr = unsafe {
        VirtualAlloc(std::ptr::null_mut(), len, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE)
    };
    if ptr.is_null() {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(winapi::shared::winerror::ERROR_NOT_ENOUGH_MEMORY as i32) {
            return None;
        }
        log::error!("VirtualAlloc failed unexpectedly: {err}");
        std::process::abort();
    }
    Some(Page { ptr: NonNull::new(ptr as *mut u8).expect("VirtualAlloc returned non-null on success"), len })
}

/// Return a page previously obtained from [`alloc_pages`] to the OS.
pub fn free_page(page: Page) {
    free_bytes(page.ptr, page.len);
    std::mem::forget(page);
}

#[cfg(unix)]
fn free_bytes(ptr: NonNull<u8>, len: usize) {
    let ret = unsafe { libc::munmap(ptr.as_ptr() as *mut libc::c_void, len) };
    if ret != 0 {
        log::error!("munmap failed: {}", std::io::Error::last_os_error());
        std::process::abort();
    }
}

#[cfg(windows)]
fn free_bytes(ptr: NonNull<u8>, _len: usize) {
    use winapi::um::memoryapi::VirtualFree;
    use winapi::um::winnt::MEM_RELEASE;
    let ok = unsafe { VirtualFree(ptr.as_ptr() as *mut _, 0, MEM_RELEASE) };
    if ok == 0 {
        log::error!("VirtualFree failed: {}", std::io::Error::last_os_error());
        std::process::abort();
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        free_bytes(self.ptr, self.len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_a_positive_power_of_two() {
        let size = page_size();
        assert!(size > 0);
        assert_eq!(size & (size - 1), 0, "page size {size} is not a power of two");
    }

    #[test]
    fn page_size_is_cached_and_stable() {
        assert_eq!(page_size(), page_size());
    }

    #[test]
    fn alloc_returns_page_aligned_memory_of_requested_size() {
        let page = alloc_pages(1).expect("allocation should succeed");
        assert_eq!(page.len(), page_size());
        assert_eq!(page.as_ptr() as usize % page_size(), 0);
    }

    #[test]
    fn allocated_memory_is_writable_and_zeroed() {
        let mut page = alloc_pages(1).unwrap();
        assert!(page.as_slice().iter().all(|&b| b == 0));
        page.as_mut_slice()[0] = 0xAB;
        assert_eq!(page.as_slice()[0], 0xAB);
    }

    #[test]
    fn multi_page_allocation_scales_length() {
        let page = alloc_pages(3).unwrap();
        assert_eq!(page.len(), page_size() * 3);
    }
}
