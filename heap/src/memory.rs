use std::ptr::NonNull;

use object::{Address, Region};

use crate::{
    HeapError,
    system::{self, Protection},
};

/// An owned anonymous mapping, unmapped on drop.
pub struct MappedMemory {
    ptr: NonNull<u8>,
    size: usize,
}

impl MappedMemory {
    /// Maps at least `size` bytes, rounded up to whole pages.
    pub fn new(size: usize) -> Result<Self, HeapError> {
        let size = system::page_align(size.max(1));
        let ptr = system::map_memory(size).ok_or(HeapError::MapFailed { size })?;
        Ok(Self { ptr, size })
    }

    #[inline(always)]
    pub fn start(&self) -> Address {
        Address::from_ptr(self.ptr.as_ptr())
    }

    #[inline(always)]
    pub fn end(&self) -> Address {
        self.start().add(self.size)
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline(always)]
    pub fn region(&self) -> Region {
        Region::new(self.start(), self.end())
    }

    /// Protects the page-aligned part of `region`.
    /// Returns false if the kernel refused.
    ///
    /// # Safety
    /// nothing may access an inaccessible range until it is unprotected.
    pub unsafe fn protect(&self, region: Region, protection: Protection) -> bool {
        debug_assert!(self.start() <= region.start && region.end <= self.end());
        let start = Address::from_usize(system::page_align(region.start.as_usize()));
        let end = Address::from_usize(region.end.as_usize() & !(system::OS_PAGE_SIZE - 1));
        if end <= start {
            return true;
        }
        let Some(ptr) = NonNull::new(start.as_ptr::<u8>()) else {
            return false;
        };
        // SAFETY: the range is page aligned and inside this mapping
        unsafe { system::protect_memory(ptr, end.diff(start), protection) }
    }
}

impl Drop for MappedMemory {
    fn drop(&mut self) {
        system::unmap_memory(self.ptr, self.size);
    }
}

impl std::fmt::Debug for MappedMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedMemory")
            .field("region", &self.region())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_is_page_rounded_and_zeroed() {
        let memory = MappedMemory::new(100).expect("map");
        assert_eq!(memory.size(), system::OS_PAGE_SIZE);
        assert!(memory.start().as_usize().is_multiple_of(system::OS_PAGE_SIZE));
        unsafe {
            assert_eq!(memory.start().load(), 0);
            memory.start().store(42);
            assert_eq!(memory.start().load(), 42);
        }
    }

    #[test]
    fn test_protect_round_trip() {
        let memory = MappedMemory::new(2 * system::OS_PAGE_SIZE).expect("map");
        let second = Region::new(memory.start().add(system::OS_PAGE_SIZE), memory.end());
        unsafe {
            assert!(memory.protect(second, Protection::None));
            assert!(memory.protect(second, Protection::ReadWrite));
            second.start.store(7);
            assert_eq!(second.start.load(), 7);
        }
    }
}
