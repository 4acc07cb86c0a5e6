use std::fmt;

use crate::{Address, WORD_BITS, WORD_SIZE};

/// Numeric class identifier stored in every klass object.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct KlassId(pub usize);

impl KlassId {
    pub const KLASS: Self = Self(0);
    pub const OBJECT_ASSOCIATION: Self = Self(1);
    pub const LOCAL_ARRAY: Self = Self(2);
    pub const METHOD: Self = Self(3);
    pub const WEAK_REFERENCE: Self = Self(4);
    pub const FINALIZER: Self = Self(5);
    pub const BYTE_ARRAY: Self = Self(6);
    pub const WORD_ARRAY: Self = Self(7);
    pub const OBJECT_ARRAY: Self = Self(8);

    pub const FIRST_USER: Self = Self(16);

    #[inline(always)]
    pub const fn is_well_known(self) -> bool {
        self.0 < Self::FIRST_USER.0
    }
}

impl fmt::Debug for KlassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::KLASS => "Klass",
            Self::OBJECT_ASSOCIATION => "ObjectAssociation",
            Self::LOCAL_ARRAY => "LocalArray",
            Self::METHOD => "Method",
            Self::WEAK_REFERENCE => "WeakReference",
            Self::FINALIZER => "Finalizer",
            Self::BYTE_ARRAY => "ByteArray",
            Self::WORD_ARRAY => "WordArray",
            Self::OBJECT_ARRAY => "ObjectArray",
            _ => return write!(f, "KlassId({})", self.0),
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct KlassFlags(pub usize);

impl KlassFlags {
    pub const NONE: Self = Self(0);
    pub const ARRAY: Self = Self(1 << 0);
    /// Array elements are references (element size must be one word).
    pub const REFERENCE_ELEMENTS: Self = Self(1 << 1);

    #[inline(always)]
    pub const fn contains(self, flag: Self) -> bool {
        self.0 & flag.0 == flag.0
    }

    #[inline(always)]
    pub const fn with(self, flag: Self) -> Self {
        Self(self.0 | flag.0)
    }

    #[inline(always)]
    pub const fn without(self, flag: Self) -> Self {
        Self(self.0 & !flag.0)
    }
}

/// Reference map over the first `WORD_BITS` instance fields.
///
/// Bit `i` set means body word `i` holds an object reference.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct OopMap(pub usize);

impl OopMap {
    pub const EMPTY: Self = Self(0);

    pub const fn from_fields(fields: &[usize]) -> Self {
        let mut bits = 0;
        let mut i = 0;
        while i < fields.len() {
            assert!(fields[i] < WORD_BITS, "oop map field out of range");
            bits |= 1 << fields[i];
            i += 1;
        }
        Self(bits)
    }

    #[inline(always)]
    pub const fn with(self, field: usize) -> Self {
        Self(self.0 | (1 << field))
    }

    #[inline(always)]
    pub const fn is_reference(self, field: usize) -> bool {
        field < WORD_BITS && self.0 & (1 << field) != 0
    }

    #[inline(always)]
    pub const fn count(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Index one past the highest reference field.
    #[inline(always)]
    pub const fn extent(self) -> usize {
        WORD_BITS - self.0.leading_zeros() as usize
    }

    #[inline(always)]
    pub fn iter(self) -> OopMapIter {
        OopMapIter(self.0)
    }
}

impl fmt::Debug for OopMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

pub struct OopMapIter(usize);

impl Iterator for OopMapIter {
    type Item = usize;

    #[inline]
    fn next(&mut self) -> Option<usize> {
        if self.0 == 0 {
            return None;
        }
        let field = self.0.trailing_zeros() as usize;
        self.0 &= self.0 - 1;
        Some(field)
    }
}

/// Field indices of a klass body.
pub mod field {
    pub const ID: usize = 0;
    pub const FLAGS: usize = 1;
    pub const INSTANCE_WORDS: usize = 2;
    pub const OOP_MAP: usize = 3;
    pub const ELEMENT_SIZE: usize = 4;
    /// The only reference field of a klass.
    pub const SUPER: usize = 5;

    pub const BODY_WORDS: usize = 6;
}

/// Oop map of klass objects themselves.
pub const KLASS_OOP_MAP: OopMap = OopMap::from_fields(&[field::SUPER]);

/// Shape description used to initialize a klass object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KlassLayout {
    pub id: KlassId,
    pub flags: KlassFlags,
    pub instance_words: usize,
    pub oop_map: OopMap,
    pub element_size: usize,
}

impl KlassLayout {
    pub const fn instance(id: KlassId, instance_words: usize, oop_map: OopMap) -> Self {
        Self {
            id,
            flags: KlassFlags::NONE,
            instance_words,
            oop_map,
            element_size: 0,
        }
    }

    pub const fn array(id: KlassId, element_size: usize, references: bool) -> Self {
        let flags = if references {
            KlassFlags::ARRAY.with(KlassFlags::REFERENCE_ELEMENTS)
        } else {
            KlassFlags::ARRAY
        };
        Self {
            id,
            flags,
            instance_words: 0,
            oop_map: OopMap::EMPTY,
            element_size,
        }
    }

    #[inline(always)]
    pub const fn is_array(&self) -> bool {
        self.flags.contains(KlassFlags::ARRAY)
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.is_array() {
            if self.element_size == 0 {
                return Err("array element size must be > 0");
            }
            if self.flags.contains(KlassFlags::REFERENCE_ELEMENTS) && self.element_size != WORD_SIZE
            {
                return Err("reference elements must be one word wide");
            }
            if self.oop_map != OopMap::EMPTY {
                return Err("arrays carry no instance oop map");
            }
        } else {
            if self.flags.contains(KlassFlags::REFERENCE_ELEMENTS) {
                return Err("instances cannot have reference elements");
            }
            if self.oop_map.extent() > self.instance_words {
                return Err("oop map exceeds instance size");
            }
        }
        Ok(())
    }
}

/// View over a klass object in memory.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Klass(Address);

impl Klass {
    /// # Safety
    /// `oop` must point to an initialized klass body.
    #[inline(always)]
    pub const unsafe fn from_address(oop: Address) -> Self {
        Self(oop)
    }

    #[inline(always)]
    pub const fn address(self) -> Address {
        self.0
    }

    #[inline(always)]
    fn word(self, index: usize) -> usize {
        // SAFETY: the constructor guarantees a readable klass body
        unsafe { self.0.add_words(index).load() }
    }

    #[inline(always)]
    pub fn id(self) -> KlassId {
        KlassId(self.word(field::ID))
    }

    #[inline(always)]
    pub fn flags(self) -> KlassFlags {
        KlassFlags(self.word(field::FLAGS))
    }

    #[inline(always)]
    pub fn is_array(self) -> bool {
        self.flags().contains(KlassFlags::ARRAY)
    }

    #[inline(always)]
    pub fn has_reference_elements(self) -> bool {
        self.flags().contains(KlassFlags::REFERENCE_ELEMENTS)
    }

    #[inline(always)]
    pub fn instance_words(self) -> usize {
        self.word(field::INSTANCE_WORDS)
    }

    #[inline(always)]
    pub fn oop_map(self) -> OopMap {
        OopMap(self.word(field::OOP_MAP))
    }

    #[inline(always)]
    pub fn element_size(self) -> usize {
        self.word(field::ELEMENT_SIZE)
    }

    #[inline(always)]
    pub fn super_klass(self) -> Address {
        Address::from_usize(self.word(field::SUPER))
    }

    pub fn layout(self) -> KlassLayout {
        KlassLayout {
            id: self.id(),
            flags: self.flags(),
            instance_words: self.instance_words(),
            oop_map: self.oop_map(),
            element_size: self.element_size(),
        }
    }

    /// Writes all klass fields.
    ///
    /// # Safety
    /// `oop` must be a writable instance body of at least
    /// [`field::BODY_WORDS`] words.
    pub unsafe fn initialize(oop: Address, layout: &KlassLayout, super_klass: Address) -> Self {
        let values = [
            layout.id.0,
            layout.flags.0,
            layout.instance_words,
            layout.oop_map.0,
            layout.element_size,
            super_klass.as_usize(),
        ];
        for (index, value) in values.into_iter().enumerate() {
            // SAFETY: by contract
            unsafe { oop.add_words(index).store(value) };
        }
        Self(oop)
    }
}

impl fmt::Debug for Klass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Klass")
            .field("address", &self.0)
            .field("id", &self.id())
            .field("flags", &self.flags())
            .field("instance_words", &self.instance_words())
            .field("oop_map", &self.oop_map())
            .field("element_size", &self.element_size())
            .finish()
    }
}
