//! Object-model queries used by the collectors.
//!
//! Size and slot queries read the klass body and the length word, never the
//! class word: a collector may have rewritten it, so callers resolve the
//! klass themselves.

use crate::{
    Address, Klass, KlassId, WORD_SIZE, align_word, fill_zero,
    header::{self, header_words_for},
};

/// `ObjectAssociation` fields. The association sits between an object and
/// its klass.
pub mod association {
    pub const KLASS: usize = 0;
    pub const HASH: usize = 1;
    pub const WORDS: usize = 2;
}

/// `WeakReference` fields. Neither field is in the oop map.
pub mod weak_reference {
    pub const REFERENT: usize = 0;
    pub const NEXT: usize = 1;
    pub const WORDS: usize = 2;
}

/// `Finalizer` fields. `OBJECT` and `NEXT` are not in the oop map, `OWNER`
/// is a raw isolate id.
pub mod finalizer {
    pub const OBJECT: usize = 0;
    pub const NEXT: usize = 1;
    pub const OWNER: usize = 2;
    pub const WORDS: usize = 3;
}

#[inline(always)]
pub const fn field_slot(oop: Address, index: usize) -> Address {
    oop.add_words(index)
}

/// # Safety
/// `oop` must have at least `index + 1` body words.
#[inline(always)]
pub unsafe fn read_field(oop: Address, index: usize) -> Address {
    // SAFETY: by contract
    unsafe { field_slot(oop, index).load_address() }
}

/// # Safety
/// `oop` must have at least `index + 1` body words.
#[inline(always)]
pub unsafe fn write_field(oop: Address, index: usize, value: Address) {
    // SAFETY: by contract
    unsafe { field_slot(oop, index).store_address(value) }
}

#[inline(always)]
pub fn header_words(klass: Klass) -> usize {
    header_words_for(klass.is_array())
}

/// Body size in bytes, word rounded.
///
/// # Safety
/// for arrays, `oop` must carry a valid length word.
#[inline]
pub unsafe fn body_size(klass: Klass, oop: Address) -> usize {
    if klass.is_array() {
        // SAFETY: by contract
        let length = unsafe { header::array_length(oop) };
        align_word(length * klass.element_size())
    } else {
        klass.instance_words() * WORD_SIZE
    }
}

/// Header plus body in bytes.
///
/// # Safety
/// see [`body_size`]
#[inline]
pub unsafe fn block_size(klass: Klass, oop: Address) -> usize {
    // SAFETY: by contract
    header_words(klass) * WORD_SIZE + unsafe { body_size(klass, oop) }
}

#[inline(always)]
pub fn block_start(klass: Klass, oop: Address) -> Address {
    oop.sub_words(header_words(klass))
}

/// Bytes needed for a fresh object of `klass`.
#[inline]
pub fn allocation_size(klass: Klass, length: usize) -> usize {
    if klass.is_array() {
        header::ARRAY_HEADER_WORDS * WORD_SIZE + align_word(length * klass.element_size())
    } else {
        header::INSTANCE_HEADER_WORDS * WORD_SIZE + klass.instance_words() * WORD_SIZE
    }
}

/// Writes the header words of a fresh block and zeroes its body.
/// Returns the object pointer.
///
/// # Safety
/// `block` must be writable for `allocation_size(klass, length)` bytes.
pub unsafe fn initialize_object(block: Address, coa: Address, klass: Klass, length: usize) -> Address {
    let size = allocation_size(klass, length);
    // SAFETY: by contract
    unsafe {
        fill_zero(block, block.add(size));
        if klass.is_array() {
            debug_assert!(length <= header::MAX_ARRAY_LENGTH);
            block.store(header::encode_array_length(length));
        }
        let oop = block.add_words(header_words(klass));
        header::set_class_word(oop, coa.as_usize());
        oop
    }
}

/// Calls `f` with the address of every body word holding a reference.
///
/// Stack chunks, weak references and finalizers report nothing here: their
/// pointer words need dedicated handling.
///
/// # Safety
/// `oop` must be a well-formed object of `klass`.
#[inline]
pub unsafe fn for_each_reference_slot(klass: Klass, oop: Address, mut f: impl FnMut(Address)) {
    if klass.is_array() {
        if klass.has_reference_elements() {
            // SAFETY: by contract
            let length = unsafe { header::array_length(oop) };
            for i in 0..length {
                f(field_slot(oop, i));
            }
        }
    } else {
        let words = klass.instance_words();
        for i in klass.oop_map().iter().take_while(|&i| i < words) {
            f(field_slot(oop, i));
        }
    }
}

/// Resolves a class-or-association pointer to the klass describing the
/// object's layout. `coa_class` is the class of `coa` itself.
///
/// # Safety
/// both addresses must point to readable, initialized bodies.
#[inline]
pub unsafe fn resolve_klass(coa: Address, coa_class: Address) -> Klass {
    // SAFETY: by contract
    unsafe {
        let meta = Klass::from_address(coa_class);
        if meta.id() == KlassId::OBJECT_ASSOCIATION {
            Klass::from_address(read_field(coa, association::KLASS))
        } else {
            Klass::from_address(coa)
        }
    }
}

/// Klass of an object whose class word and whose class' class word are
/// both untagged.
///
/// # Safety
/// `oop` must be a well-formed, unforwarded object.
#[inline]
pub unsafe fn klass_of(oop: Address) -> Klass {
    // SAFETY: by contract
    unsafe {
        let coa = header::class_or_association(oop);
        resolve_klass(coa, header::class_or_association(coa))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{KlassLayout, OopMap, header::encode_array_length, klass};

    #[test]
    fn test_instance_sizes_and_reference_slots() {
        let mut klass_body = [0usize; klass::field::BODY_WORDS];
        let layout = KlassLayout::instance(KlassId::FIRST_USER, 4, OopMap::from_fields(&[1, 3]));
        let klass = unsafe {
            Klass::initialize(Address::from_ptr(klass_body.as_mut_ptr()), &layout, Address::NULL)
        };

        let mut block = [0usize; 5];
        let oop = Address::from_ptr(block.as_mut_ptr()).add_words(1);

        assert_eq!(header_words(klass), 1);
        assert_eq!(unsafe { body_size(klass, oop) }, 4 * WORD_SIZE);
        assert_eq!(unsafe { block_size(klass, oop) }, 5 * WORD_SIZE);
        assert_eq!(block_start(klass, oop), oop.sub_words(1));
        assert_eq!(allocation_size(klass, 0), 5 * WORD_SIZE);

        let mut slots = Vec::new();
        unsafe { for_each_reference_slot(klass, oop, |slot| slots.push(slot)) };
        assert_eq!(slots, vec![oop.add_words(1), oop.add_words(3)]);
    }

    #[test]
    fn test_byte_array_body_is_word_rounded() {
        let mut klass_body = [0usize; klass::field::BODY_WORDS];
        let layout = KlassLayout::array(KlassId::BYTE_ARRAY, 1, false);
        let klass = unsafe {
            Klass::initialize(Address::from_ptr(klass_body.as_mut_ptr()), &layout, Address::NULL)
        };

        let mut block = [0usize; 4];
        block[0] = encode_array_length(WORD_SIZE + 1);
        let oop = Address::from_ptr(block.as_mut_ptr()).add_words(2);

        assert_eq!(unsafe { body_size(klass, oop) }, 2 * WORD_SIZE);
        assert_eq!(unsafe { block_size(klass, oop) }, 4 * WORD_SIZE);

        let mut visited = 0;
        unsafe { for_each_reference_slot(klass, oop, |_| visited += 1) };
        assert_eq!(visited, 0);
    }

    #[test]
    fn test_resolve_through_association() {
        let mut meta = [0usize; klass::field::BODY_WORDS];
        let mut assoc_meta = [0usize; klass::field::BODY_WORDS];
        let mut target = [0usize; klass::field::BODY_WORDS];
        let mut assoc = [0usize; association::WORDS];

        unsafe {
            let meta = Klass::initialize(
                Address::from_ptr(meta.as_mut_ptr()),
                &KlassLayout::instance(KlassId::KLASS, klass::field::BODY_WORDS, klass::KLASS_OOP_MAP),
                Address::NULL,
            );
            let assoc_meta = Klass::initialize(
                Address::from_ptr(assoc_meta.as_mut_ptr()),
                &KlassLayout::instance(
                    KlassId::OBJECT_ASSOCIATION,
                    association::WORDS,
                    OopMap::from_fields(&[association::KLASS]),
                ),
                Address::NULL,
            );
            let target = Klass::initialize(
                Address::from_ptr(target.as_mut_ptr()),
                &KlassLayout::instance(KlassId::FIRST_USER, 2, OopMap::EMPTY),
                Address::NULL,
            );
            let assoc = Address::from_ptr(assoc.as_mut_ptr());
            write_field(assoc, association::KLASS, target.address());

            assert_eq!(resolve_klass(target.address(), meta.address()), target);
            assert_eq!(resolve_klass(assoc, assoc_meta.address()), target);
        }
    }
}
