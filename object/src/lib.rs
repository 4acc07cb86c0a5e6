//! Object model shared by the collectors and the runtime.
//!
//! Objects are raw word blocks addressed through [`Address`]. Layout
//! metadata lives in klass objects, viewed through [`Klass`].

mod address;
pub mod header;
pub mod klass;
pub mod model;
pub mod stack;

pub use address::{
    Address, LOG_WORD_SIZE, Region, WORD_BITS, WORD_SIZE, align_word, copy_bytes, fill_zero,
    words_for,
};
pub use klass::{KLASS_OOP_MAP, Klass, KlassFlags, KlassId, KlassLayout, OopMap};
pub use model::{
    allocation_size, association, block_size, block_start, body_size, finalizer,
    for_each_reference_slot, header_words, initialize_object, klass_of, read_field, resolve_klass,
    weak_reference, write_field,
};

#[cfg(test)]
mod tests {
    use super::*;

    // ── Address arithmetic ─────────────────────────────────────────

    #[test]
    fn word_rounding() {
        assert_eq!(align_word(0), 0);
        assert_eq!(align_word(1), WORD_SIZE);
        assert_eq!(align_word(WORD_SIZE), WORD_SIZE);
        assert_eq!(words_for(WORD_SIZE + 1), 2);
    }

    #[test]
    fn signed_delta_round_trips() {
        let a = Address::from_usize(0x1000);
        let b = Address::from_usize(0x1800);
        assert_eq!(b.delta(a), 0x800);
        assert_eq!(a.delta(b), -0x800);
        assert_eq!(a.offset(b.delta(a)), b);
        assert_eq!(b.offset(a.delta(b)), a);
    }

    // ── Regions ────────────────────────────────────────────────────

    #[test]
    fn region_object_bounds_are_shifted() {
        let region = Region::new(Address::from_usize(0x100), Address::from_usize(0x200));
        assert!(region.contains(Address::from_usize(0x100)));
        assert!(!region.contains(Address::from_usize(0x200)));
        assert!(!region.contains_object(Address::from_usize(0x100)));
        assert!(region.contains_object(Address::from_usize(0x200)));
        assert_eq!(region.words(), 0x100 / WORD_SIZE);
    }

    #[test]
    fn overlapping_copy_moves_down() {
        let mut words = [1usize, 2, 3, 4, 5];
        let base = Address::from_ptr(words.as_mut_ptr());
        unsafe { copy_bytes(base.add_words(1), base, 4 * WORD_SIZE) };
        assert_eq!(words, [2, 3, 4, 5, 5]);

        let base = Address::from_ptr(words.as_mut_ptr());
        unsafe { fill_zero(base.add_words(3), base.add_words(5)) };
        assert_eq!(words, [2, 3, 4, 0, 0]);
    }
}
