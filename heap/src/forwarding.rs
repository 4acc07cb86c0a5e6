//! Forwarding encodings written into class words.
//!
//! Copying collector: the low bit of the class word marks a forwarded
//! object, the remaining bits are the new object pointer.
//!
//! Mark-compact collector:
//!
//! ```text
//! [class offset : CLASS_OFFSET_BITS][slice offset : SLICE_OFFSET_BITS][tag : 2]
//! ```
//!
//! Tag `00` is an untouched class pointer. The other tags name the space
//! holding the class-or-association (`01` heap, `10` ROM, `11` NVM) and mean
//! the object is forwarded. The class offset is in words from the start of
//! that space. The slice offset is in words from the slice table entry of
//! the slice holding the object's old pointer.

use object::{Address, LOG_WORD_SIZE, Region, WORD_BITS, WORD_SIZE};

// ── Copying collector ─────────────────────────────────────────────────

pub const FORWARDED_BIT: usize = 0b1;

#[inline(always)]
pub const fn is_forwarded(class_word: usize) -> bool {
    class_word & FORWARDED_BIT != 0
}

#[inline(always)]
pub fn forward_word(new_oop: Address) -> usize {
    debug_assert!(new_oop.is_word_aligned(), "unaligned forward pointer {new_oop:?}");
    new_oop.as_usize() | FORWARDED_BIT
}

#[inline(always)]
pub const fn forwardee(class_word: usize) -> Address {
    Address::from_usize(class_word & !FORWARDED_BIT)
}

// ── Mark-compact collector ────────────────────────────────────────────

pub const TAG_BITS: usize = 2;
const TAG_MASK: usize = (1 << TAG_BITS) - 1;

#[cfg(target_pointer_width = "64")]
pub const SLICE_OFFSET_BITS: usize = 20;
#[cfg(not(target_pointer_width = "64"))]
pub const SLICE_OFFSET_BITS: usize = 12;

const SLICE_SHIFT: usize = TAG_BITS;
const SLICE_MASK: usize = (1 << SLICE_OFFSET_BITS) - 1;
const CLASS_SHIFT: usize = TAG_BITS + SLICE_OFFSET_BITS;

pub const CLASS_OFFSET_BITS: usize = WORD_BITS - CLASS_SHIFT;
pub const MAX_CLASS_OFFSET: usize = usize::MAX >> CLASS_SHIFT;
pub const MAX_SLICE_OFFSET: usize = SLICE_MASK;

/// Space holding a forwarded object's class-or-association.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum ClassSpace {
    Heap = 0b01,
    Rom = 0b10,
    Nvm = 0b11,
}

impl ClassSpace {
    #[inline(always)]
    pub const fn tag(self) -> usize {
        self as usize
    }

    #[inline(always)]
    pub const fn from_tag(tag: usize) -> Option<Self> {
        match tag {
            0b01 => Some(Self::Heap),
            0b10 => Some(Self::Rom),
            0b11 => Some(Self::Nvm),
            _ => None,
        }
    }
}

/// Decoded mark-compact forwarding word. Offsets are in words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Forwarding {
    pub space: ClassSpace,
    pub class_offset: usize,
    pub slice_offset: usize,
}

impl Forwarding {
    #[inline]
    pub fn encode(self) -> usize {
        assert!(
            self.class_offset <= MAX_CLASS_OFFSET,
            "class offset {:#x} exceeds {CLASS_OFFSET_BITS} bits",
            self.class_offset
        );
        assert!(
            self.slice_offset <= MAX_SLICE_OFFSET,
            "slice offset {:#x} exceeds {SLICE_OFFSET_BITS} bits",
            self.slice_offset
        );
        (self.class_offset << CLASS_SHIFT) | (self.slice_offset << SLICE_SHIFT) | self.space.tag()
    }

    /// `None` for an untouched class word.
    #[inline]
    pub const fn decode(word: usize) -> Option<Self> {
        match ClassSpace::from_tag(word & TAG_MASK) {
            Some(space) => Some(Self {
                space,
                class_offset: word >> CLASS_SHIFT,
                slice_offset: (word >> SLICE_SHIFT) & SLICE_MASK,
            }),
            None => None,
        }
    }
}

#[inline(always)]
pub const fn is_encoded(class_word: usize) -> bool {
    class_word & TAG_MASK != 0
}

/// Maps class-or-association pointers to and from space-relative offsets.
#[derive(Debug, Clone, Copy)]
pub struct ForwardingCodec {
    heap: Region,
    rom: Region,
    nvm: Region,
}

impl ForwardingCodec {
    /// `heap` covers every collector-owned word, permanent space included.
    pub fn new(heap: Region, rom: Region, nvm: Region) -> Self {
        Self { heap, rom, nvm }
    }

    #[inline(always)]
    fn space_base(&self, space: ClassSpace) -> Address {
        match space {
            ClassSpace::Heap => self.heap.start,
            ClassSpace::Rom => self.rom.start,
            ClassSpace::Nvm => self.nvm.start,
        }
    }

    pub fn class_space_of(&self, coa: Address) -> ClassSpace {
        if self.heap.contains(coa) {
            ClassSpace::Heap
        } else if self.rom.contains(coa) {
            ClassSpace::Rom
        } else if self.nvm.contains(coa) {
            ClassSpace::Nvm
        } else {
            panic!("class pointer {coa:?} is outside every class space")
        }
    }

    #[inline]
    pub fn encode(&self, coa: Address, slice_offset: usize) -> usize {
        debug_assert!(coa.is_word_aligned(), "unaligned class pointer {coa:?}");
        let space = self.class_space_of(coa);
        Forwarding {
            space,
            class_offset: coa.diff(self.space_base(space)) / WORD_SIZE,
            slice_offset,
        }
        .encode()
    }

    /// # Panics
    /// if `word` is not an encoded forwarding word.
    #[inline]
    pub fn decode(&self, word: usize) -> (Address, ClassSpace, usize) {
        let Some(forwarding) = Forwarding::decode(word) else {
            panic!("class word {word:#x} is not forwarded");
        };
        let coa = self
            .space_base(forwarding.space)
            .add_words(forwarding.class_offset);
        (coa, forwarding.space, forwarding.slice_offset)
    }

    #[inline]
    pub fn class_or_association(&self, word: usize) -> Address {
        self.decode(word).0
    }

    /// Replaces the class locator of `word`, keeping its destination.
    #[inline]
    pub fn with_class(&self, word: usize, coa: Address) -> usize {
        let (_, _, slice_offset) = self.decode(word);
        self.encode(coa, slice_offset)
    }
}

/// Per-slice destination bases.
///
/// The entry of a slice is set to the first destination computed for an
/// object whose old pointer lies in that slice. Later objects in the slice
/// only store their distance to it.
pub struct SliceTable {
    entries: Address,
    count: usize,
    heap_start: Address,
    shift: u32,
}

impl SliceTable {
    /// Entries needed to cover object pointers in `(start, start + words]`.
    #[inline(always)]
    pub const fn entries_for(heap_words: usize, slice_words_log2: usize) -> usize {
        (heap_words >> slice_words_log2) + 1
    }

    /// # Safety
    /// `storage` must be writable for `count` words for the lifetime of
    /// the table.
    pub unsafe fn new(storage: Address, count: usize, heap_start: Address, slice_words_log2: usize) -> Self {
        debug_assert!(slice_words_log2 <= SLICE_OFFSET_BITS);
        Self {
            entries: storage,
            count,
            heap_start,
            shift: slice_words_log2 as u32 + LOG_WORD_SIZE,
        }
    }

    #[inline(always)]
    pub fn slice_of(&self, oop: Address) -> usize {
        let slice = oop.diff(self.heap_start) >> self.shift;
        debug_assert!(slice < self.count, "{oop:?} beyond the slice table");
        slice
    }

    #[inline(always)]
    pub fn base(&self, slice: usize) -> Address {
        debug_assert!(slice < self.count);
        // SAFETY: slice is within the table storage
        unsafe { self.entries.add_words(slice).load_address() }
    }

    #[inline(always)]
    fn set_base(&mut self, slice: usize, base: Address) {
        debug_assert!(slice < self.count);
        // SAFETY: slice is within the table storage
        unsafe { self.entries.add_words(slice).store_address(base) }
    }

    pub fn clear(&mut self) {
        for slice in 0..self.count {
            self.set_base(slice, Address::NULL);
        }
    }

    /// Word offset of `destination` from the base of `oop`'s slice,
    /// initializing the base on first use.
    #[inline]
    pub fn offset_for(&mut self, oop: Address, destination: Address) -> usize {
        let slice = self.slice_of(oop);
        let mut base = self.base(slice);
        if base.is_null() {
            base = destination;
            self.set_base(slice, base);
        }
        destination.diff(base) / WORD_SIZE
    }

    #[inline(always)]
    pub fn destination(&self, oop: Address, slice_offset: usize) -> Address {
        self.base(self.slice_of(oop)).add_words(slice_offset)
    }
}
