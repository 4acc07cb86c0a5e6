use std::fmt;

pub const WORD_SIZE: usize = size_of::<usize>();
pub const WORD_BITS: usize = usize::BITS as usize;
pub const LOG_WORD_SIZE: u32 = WORD_SIZE.trailing_zeros();

/// Rounds a byte count up to the next multiple of the word size.
#[inline(always)]
pub const fn align_word(bytes: usize) -> usize {
    (bytes + WORD_SIZE - 1) & !(WORD_SIZE - 1)
}

#[inline(always)]
pub const fn words_for(bytes: usize) -> usize {
    align_word(bytes) / WORD_SIZE
}

/// A raw machine address inside (or outside) managed memory.
///
/// Addresses are plain integers: arithmetic never goes through a native
/// pointer until a load or store actually happens.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Address(usize);

impl Address {
    pub const NULL: Self = Self(0);

    #[inline(always)]
    pub const fn from_usize(raw: usize) -> Self {
        Self(raw)
    }

    #[inline(always)]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    #[inline(always)]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    #[inline(always)]
    pub const fn as_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    #[inline(always)]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline(always)]
    pub const fn is_word_aligned(self) -> bool {
        self.0 & (WORD_SIZE - 1) == 0
    }

    #[inline(always)]
    pub const fn align_up(self) -> Self {
        Self(align_word(self.0))
    }

    #[inline(always)]
    pub const fn add(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }

    #[inline(always)]
    pub const fn sub(self, bytes: usize) -> Self {
        Self(self.0 - bytes)
    }

    #[inline(always)]
    pub const fn add_words(self, words: usize) -> Self {
        Self(self.0 + words * WORD_SIZE)
    }

    #[inline(always)]
    pub const fn sub_words(self, words: usize) -> Self {
        Self(self.0 - words * WORD_SIZE)
    }

    /// Unsigned distance in bytes; `self` must not be below `base`.
    #[inline(always)]
    pub fn diff(self, base: Address) -> usize {
        debug_assert!(self >= base, "{self:?} is below {base:?}");
        self.0 - base.0
    }

    /// Signed distance in bytes from `base` to `self`.
    #[inline(always)]
    pub const fn delta(self, base: Address) -> isize {
        self.0.wrapping_sub(base.0) as isize
    }

    #[inline(always)]
    pub const fn offset(self, delta: isize) -> Self {
        Self(self.0.wrapping_add_signed(delta))
    }

    /// # Safety
    /// `self` must be a readable, word-aligned address.
    #[inline(always)]
    pub unsafe fn load(self) -> usize {
        debug_assert!(self.is_word_aligned(), "unaligned load at {self:?}");
        // SAFETY: by contract
        unsafe { self.as_ptr::<usize>().read() }
    }

    /// # Safety
    /// `self` must be a writable, word-aligned address.
    #[inline(always)]
    pub unsafe fn store(self, value: usize) {
        debug_assert!(self.is_word_aligned(), "unaligned store at {self:?}");
        // SAFETY: by contract
        unsafe { self.as_ptr::<usize>().write(value) }
    }

    /// # Safety
    /// see [`Address::load`]
    #[inline(always)]
    pub unsafe fn load_address(self) -> Address {
        // SAFETY: by contract
        Address(unsafe { self.load() })
    }

    /// # Safety
    /// see [`Address::store`]
    #[inline(always)]
    pub unsafe fn store_address(self, value: Address) {
        // SAFETY: by contract
        unsafe { self.store(value.0) }
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Copies `len` bytes, overlapping ranges allowed.
///
/// # Safety
/// both ranges must be valid for `len` bytes.
#[inline]
pub unsafe fn copy_bytes(src: Address, dst: Address, len: usize) {
    if len == 0 || src == dst {
        return;
    }
    // SAFETY: by contract, ptr::copy has memmove semantics
    unsafe { std::ptr::copy(src.as_ptr::<u8>(), dst.as_ptr::<u8>(), len) };
}

/// # Safety
/// `[start, end)` must be writable.
#[inline]
pub unsafe fn fill_zero(start: Address, end: Address) {
    if end <= start {
        return;
    }
    // SAFETY: by contract
    unsafe { std::ptr::write_bytes(start.as_ptr::<u8>(), 0, end.diff(start)) };
}

/// A half-open `[start, end)` range of addresses.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Region {
    pub start: Address,
    pub end: Address,
}

impl Region {
    pub const EMPTY: Self = Self {
        start: Address::NULL,
        end: Address::NULL,
    };

    #[inline(always)]
    pub const fn new(start: Address, end: Address) -> Self {
        Self { start, end }
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.end.diff(self.start)
    }

    #[inline(always)]
    pub fn words(&self) -> usize {
        self.size() / WORD_SIZE
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    #[inline(always)]
    pub fn contains(&self, addr: Address) -> bool {
        self.start <= addr && addr < self.end
    }

    /// Object pointers sit at least one header word past their block, and
    /// a zero-length body may end exactly at `end`.
    #[inline(always)]
    pub fn contains_object(&self, oop: Address) -> bool {
        self.start < oop && oop <= self.end
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}, {:?})", self.start, self.end)
    }
}
