use crate::{Address, WORD_SIZE};

/// Low tag of the first word of an array block.
pub const ARRAY_LENGTH_TAG: usize = 0b01;
const LENGTH_TAG_MASK: usize = 0b11;
const LENGTH_SHIFT: u32 = 2;

pub const MAX_ARRAY_LENGTH: usize = usize::MAX >> LENGTH_SHIFT;

pub const INSTANCE_HEADER_WORDS: usize = 1;
pub const ARRAY_HEADER_WORDS: usize = 2;

/// Block layouts.
///
/// ```text
/// instance: [class word][body ...]
///                       ^ oop
/// array:    [(len << 2) | 0b01][class word][elements ...]
///                                          ^ oop
/// ```
///
/// The class word always sits directly below the oop and holds a
/// class-or-association pointer. A class pointer is word aligned, so the
/// `0b01` tag of the length word is enough to tell the two block kinds
/// apart while walking a region linearly.
#[inline(always)]
pub const fn header_words_for(is_array: bool) -> usize {
    if is_array {
        ARRAY_HEADER_WORDS
    } else {
        INSTANCE_HEADER_WORDS
    }
}

#[inline(always)]
pub const fn class_word_slot(oop: Address) -> Address {
    oop.sub(WORD_SIZE)
}

/// # Safety
/// `oop` must be an object pointer into mapped memory.
#[inline(always)]
pub unsafe fn class_word(oop: Address) -> usize {
    // SAFETY: by contract
    unsafe { class_word_slot(oop).load() }
}

/// # Safety
/// `oop` must be an object pointer into mapped memory.
#[inline(always)]
pub unsafe fn set_class_word(oop: Address, word: usize) {
    // SAFETY: by contract
    unsafe { class_word_slot(oop).store(word) }
}

/// Reads the class word as an untagged class-or-association pointer.
///
/// # Safety
/// `oop` must be an object whose class word is not forwarded.
#[inline(always)]
pub unsafe fn class_or_association(oop: Address) -> Address {
    // SAFETY: by contract
    let word = unsafe { class_word(oop) };
    debug_assert!(
        Address::from_usize(word).is_word_aligned(),
        "class word of {oop:?} is tagged: {word:#x}"
    );
    Address::from_usize(word)
}

#[inline(always)]
pub const fn encode_array_length(length: usize) -> usize {
    (length << LENGTH_SHIFT) | ARRAY_LENGTH_TAG
}

#[inline(always)]
pub const fn decode_array_length(word: usize) -> usize {
    word >> LENGTH_SHIFT
}

#[inline(always)]
pub const fn is_array_length_word(word: usize) -> bool {
    word & LENGTH_TAG_MASK == ARRAY_LENGTH_TAG
}

/// # Safety
/// `oop` must be an array object.
#[inline(always)]
pub unsafe fn array_length(oop: Address) -> usize {
    // SAFETY: by contract the length word is two words below the oop
    let word = unsafe { oop.sub_words(ARRAY_HEADER_WORDS).load() };
    debug_assert!(is_array_length_word(word), "no length word below {oop:?}");
    decode_array_length(word)
}

/// # Safety
/// `oop` must be an array object.
#[inline(always)]
pub unsafe fn set_array_length(oop: Address, length: usize) {
    debug_assert!(length <= MAX_ARRAY_LENGTH);
    // SAFETY: by contract
    unsafe {
        oop.sub_words(ARRAY_HEADER_WORDS)
            .store(encode_array_length(length))
    }
}

/// # Safety
/// `block` must be the start of a well-formed block.
#[inline(always)]
pub unsafe fn is_array_block(block: Address) -> bool {
    // SAFETY: by contract
    is_array_length_word(unsafe { block.load() })
}

/// Object pointer for the block starting at `block`.
///
/// # Safety
/// `block` must be the start of a well-formed block.
#[inline(always)]
pub unsafe fn oop_for_block(block: Address) -> Address {
    // SAFETY: by contract
    let is_array = unsafe { is_array_block(block) };
    block.add_words(header_words_for(is_array))
}
