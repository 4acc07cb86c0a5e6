use std::ptr::NonNull;

#[cfg(unix)]
mod unix {
    use core::ffi::c_void;

    pub const PROT_NONE: i32 = 0x0;
    pub const PROT_READ: i32 = 0x1;
    pub const PROT_WRITE: i32 = 0x2;

    pub const MAP_PRIVATE: i32 = 0x02;
    #[cfg(target_os = "linux")]
    pub const MAP_ANON: i32 = 0x20;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    pub const MAP_ANON: i32 = 0x1000;

    pub const MAP_FAILED: isize = -1;

    // posix, see the man pages for the contracts
    unsafe extern "C" {
        pub fn mmap(
            addr: *mut c_void,
            length: usize,
            prot: i32,
            flags: i32,
            fd: i32,
            offset: isize,
        ) -> *mut c_void;

        pub fn munmap(addr: *mut c_void, length: usize) -> i32;

        pub fn mprotect(addr: *mut c_void, length: usize, prot: i32) -> i32;
    }
}

pub const OS_PAGE_SIZE: usize = 4096;

/// Access rights of a range of mapped pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    None,
    ReadOnly,
    ReadWrite,
}

impl Protection {
    fn bits(self) -> i32 {
        match self {
            Self::None => unix::PROT_NONE,
            Self::ReadOnly => unix::PROT_READ,
            Self::ReadWrite => unix::PROT_READ | unix::PROT_WRITE,
        }
    }
}

#[inline(always)]
pub const fn page_align(size: usize) -> usize {
    (size + OS_PAGE_SIZE - 1) & !(OS_PAGE_SIZE - 1)
}

/// Maps `size` bytes of zeroed, private, read-write pages.
#[must_use]
pub fn map_memory(size: usize) -> Option<NonNull<u8>> {
    // SAFETY: anonymous mappings do not alias anything
    let ptr = unsafe {
        unix::mmap(
            core::ptr::null_mut(),
            size,
            Protection::ReadWrite.bits(),
            unix::MAP_PRIVATE | unix::MAP_ANON,
            -1,
            0,
        )
    };
    if ptr as isize == unix::MAP_FAILED {
        return None;
    }
    NonNull::new(ptr.cast())
}

pub fn unmap_memory(ptr: NonNull<u8>, size: usize) {
    // SAFETY: ptr must be from a map_memory allocation of `size` bytes
    let _ = unsafe { unix::munmap(ptr.as_ptr().cast(), size) };
}

/// Changes page protection. Returns false if the kernel refused.
///
/// # Safety
/// `ptr` and `size` must be page aligned and inside a live mapping, and no
/// live reference may point into a range made inaccessible.
pub unsafe fn protect_memory(ptr: NonNull<u8>, size: usize, protection: Protection) -> bool {
    debug_assert!((ptr.as_ptr() as usize).is_multiple_of(OS_PAGE_SIZE));
    debug_assert!(size.is_multiple_of(OS_PAGE_SIZE));
    // SAFETY: by contract
    unsafe { unix::mprotect(ptr.as_ptr().cast(), size, protection.bits()) == 0 }
}
