//! Side bitmap with one bit per heap word.
//!
//! Bit `i` describes the word at `base + i * WORD_SIZE`. The mark-compact
//! collector sets the bit of every live object pointer. The bitmap does not
//! own its storage: it is carved out of the collector's mapping.
//!
//! At most one [`BitmapIterator`] may scan a bitmap at a time. The bitmap
//! tracks this itself, so a second iterator started before the first is
//! terminated panics.

use std::cell::Cell;

use object::{Address, WORD_BITS, WORD_SIZE};

pub struct Bitmap {
    bits: Address,
    storage_words: usize,
    base: Address,
    covered_words: usize,
    iterating: Cell<bool>,
}

impl Bitmap {
    #[inline(always)]
    pub const fn storage_words(covered_words: usize) -> usize {
        covered_words.div_ceil(WORD_BITS)
    }

    /// # Safety
    /// `storage` must be writable for `storage_words(covered_words)` words
    /// for the lifetime of the bitmap.
    pub unsafe fn new(storage: Address, base: Address, covered_words: usize) -> Self {
        debug_assert!(storage.is_word_aligned() && base.is_word_aligned());
        Self {
            bits: storage,
            storage_words: Self::storage_words(covered_words),
            base,
            covered_words,
            iterating: Cell::new(false),
        }
    }

    #[inline(always)]
    pub fn base(&self) -> Address {
        self.base
    }

    /// First address past the covered range.
    #[inline(always)]
    pub fn limit(&self) -> Address {
        self.base.add_words(self.covered_words)
    }

    #[inline(always)]
    fn index(&self, addr: Address) -> usize {
        debug_assert!(addr.is_word_aligned(), "unaligned bitmap address {addr:?}");
        debug_assert!(
            self.base <= addr && addr < self.limit(),
            "{addr:?} outside bitmap [{:?}, {:?})",
            self.base,
            self.limit()
        );
        addr.diff(self.base) / WORD_SIZE
    }

    #[inline(always)]
    fn word_slot(&self, word: usize) -> Address {
        debug_assert!(word < self.storage_words);
        self.bits.add_words(word)
    }

    #[inline(always)]
    fn load(&self, word: usize) -> usize {
        // SAFETY: storage is valid for storage_words words
        unsafe { self.word_slot(word).load() }
    }

    #[inline(always)]
    fn store(&mut self, word: usize, value: usize) {
        // SAFETY: storage is valid for storage_words words
        unsafe { self.word_slot(word).store(value) }
    }

    #[inline(always)]
    pub fn set_bit(&mut self, addr: Address) {
        let i = self.index(addr);
        let word = self.load(i / WORD_BITS);
        self.store(i / WORD_BITS, word | (1 << (i % WORD_BITS)));
    }

    #[inline(always)]
    pub fn clear_bit(&mut self, addr: Address) {
        let i = self.index(addr);
        let word = self.load(i / WORD_BITS);
        self.store(i / WORD_BITS, word & !(1 << (i % WORD_BITS)));
    }

    #[inline(always)]
    pub fn test_bit(&self, addr: Address) -> bool {
        let i = self.index(addr);
        self.load(i / WORD_BITS) & (1 << (i % WORD_BITS)) != 0
    }

    /// Sets the bit and returns its previous value.
    #[inline(always)]
    pub fn test_and_set_bit(&mut self, addr: Address) -> bool {
        let i = self.index(addr);
        let mask = 1 << (i % WORD_BITS);
        let word = self.load(i / WORD_BITS);
        if word & mask != 0 {
            return true;
        }
        self.store(i / WORD_BITS, word | mask);
        false
    }

    /// Clears the bits of `[lo, hi)`, clamped to the covered range.
    pub fn clear_range(&mut self, lo: Address, hi: Address) {
        let hi = hi.min(self.limit());
        if hi <= lo {
            return;
        }
        let mut i = self.index(lo);
        let end = hi.diff(self.base) / WORD_SIZE;

        while i < end && !i.is_multiple_of(WORD_BITS) {
            let word = self.load(i / WORD_BITS);
            self.store(i / WORD_BITS, word & !(1 << (i % WORD_BITS)));
            i += 1;
        }
        while i + WORD_BITS <= end {
            self.store(i / WORD_BITS, 0);
            i += WORD_BITS;
        }
        while i < end {
            let word = self.load(i / WORD_BITS);
            self.store(i / WORD_BITS, word & !(1 << (i % WORD_BITS)));
            i += 1;
        }
    }

    pub fn clear_all(&mut self) {
        for word in 0..self.storage_words {
            self.store(word, 0);
        }
    }
}

/// Restartable ascending scan over set bits.
///
/// Holds only a cursor, so the bitmap may be modified between calls to
/// [`next`](Self::next); bits set ahead of the cursor are returned.
#[derive(Debug, Default)]
pub struct BitmapIterator {
    next: usize,
    end: usize,
    in_use: bool,
}

impl BitmapIterator {
    pub const fn new() -> Self {
        Self {
            next: 0,
            end: 0,
            in_use: false,
        }
    }

    #[inline(always)]
    pub fn is_active(&self) -> bool {
        self.in_use
    }

    /// Starts a scan over `[lo, hi)`. An object range scans
    /// `[lo + WORD_SIZE, hi + WORD_SIZE)` so that an object pointer one
    /// header word past `lo`, or sitting exactly at `hi`, is included.
    pub fn start_range(&mut self, bitmap: &Bitmap, lo: Address, hi: Address, is_object_range: bool) {
        assert!(
            !self.in_use && !bitmap.iterating.replace(true),
            "bitmap iterator is already in use"
        );
        let (lo, hi) = if is_object_range {
            (lo.add(WORD_SIZE), hi.add(WORD_SIZE))
        } else {
            (lo, hi)
        };
        let hi = hi.min(bitmap.limit());
        self.in_use = true;
        if hi <= lo {
            self.next = 0;
            self.end = 0;
            return;
        }
        self.next = bitmap.index(lo);
        self.end = hi.diff(bitmap.base) / WORD_SIZE;
    }

    pub fn next(&mut self, bitmap: &Bitmap) -> Option<Address> {
        debug_assert!(self.in_use, "bitmap iterator used before start_range");
        while self.next < self.end {
            let shift = self.next % WORD_BITS;
            let pending = bitmap.load(self.next / WORD_BITS) >> shift;
            if pending == 0 {
                self.next += WORD_BITS - shift;
                continue;
            }
            let found = self.next + pending.trailing_zeros() as usize;
            if found >= self.end {
                self.next = self.end;
                break;
            }
            self.next = found + 1;
            return Some(bitmap.base.add_words(found));
        }
        None
    }

    pub fn terminate(&mut self, bitmap: &Bitmap) {
        if self.in_use {
            bitmap.iterating.set(false);
        }
        self.in_use = false;
        self.next = 0;
        self.end = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COVERED: usize = 300;

    fn create_test_bitmap(storage: &mut Vec<usize>) -> Bitmap {
        storage.resize(Bitmap::storage_words(COVERED), 0);
        let base = Address::from_usize(0x10000);
        unsafe { Bitmap::new(Address::from_ptr(storage.as_mut_ptr()), base, COVERED) }
    }

    fn collect(bitmap: &Bitmap, lo: Address, hi: Address, objects: bool) -> Vec<Address> {
        let mut iter = BitmapIterator::new();
        iter.start_range(bitmap, lo, hi, objects);
        let mut found = Vec::new();
        while let Some(addr) = iter.next(bitmap) {
            found.push(addr);
        }
        iter.terminate(bitmap);
        found
    }

    #[test]
    fn test_set_clear_test() {
        let mut storage = Vec::new();
        let mut bitmap = create_test_bitmap(&mut storage);
        let a = bitmap.base().add_words(70);

        assert!(!bitmap.test_bit(a));
        assert!(!bitmap.test_and_set_bit(a));
        assert!(bitmap.test_and_set_bit(a));
        assert!(bitmap.test_bit(a));
        bitmap.clear_bit(a);
        assert!(!bitmap.test_bit(a));
    }

    #[test]
    fn test_plain_range_boundaries() {
        let mut storage = Vec::new();
        let mut bitmap = create_test_bitmap(&mut storage);
        let lo = bitmap.base().add_words(10);
        let hi = bitmap.base().add_words(150);

        bitmap.set_bit(lo);
        bitmap.set_bit(hi.sub_words(1));
        bitmap.set_bit(hi);
        bitmap.set_bit(lo.sub_words(1));

        assert_eq!(collect(&bitmap, lo, hi, false), vec![lo, hi.sub_words(1)]);
    }

    #[test]
    fn test_object_range_boundaries() {
        let mut storage = Vec::new();
        let mut bitmap = create_test_bitmap(&mut storage);
        let lo = bitmap.base().add_words(10);
        let hi = bitmap.base().add_words(150);

        // same pair shifted one word up
        bitmap.set_bit(lo.add_words(1));
        bitmap.set_bit(hi);
        // block starts are never object pointers
        bitmap.set_bit(lo);

        assert_eq!(collect(&bitmap, lo, hi, true), vec![lo.add_words(1), hi]);
    }

    #[test]
    fn test_iteration_is_ascending_and_skips_zero_words() {
        let mut storage = Vec::new();
        let mut bitmap = create_test_bitmap(&mut storage);
        let expected: Vec<_> = [3usize, 64, 65, 200, 299]
            .iter()
            .map(|&i| bitmap.base().add_words(i))
            .collect();
        for &addr in expected.iter().rev() {
            bitmap.set_bit(addr);
        }
        assert_eq!(
            collect(&bitmap, bitmap.base(), bitmap.limit(), false),
            expected
        );
    }

    #[test]
    fn test_bits_set_during_iteration_are_seen() {
        let mut storage = Vec::new();
        let mut bitmap = create_test_bitmap(&mut storage);
        let base = bitmap.base();
        bitmap.set_bit(base.add_words(5));

        let mut iter = BitmapIterator::new();
        iter.start_range(&bitmap, base, bitmap.limit(), false);
        assert_eq!(iter.next(&bitmap), Some(base.add_words(5)));
        bitmap.set_bit(base.add_words(2));
        bitmap.set_bit(base.add_words(190));
        assert_eq!(iter.next(&bitmap), Some(base.add_words(190)));
        assert_eq!(iter.next(&bitmap), None);
        iter.terminate(&bitmap);
    }

    #[test]
    fn test_clear_range_is_exact() {
        let mut storage = Vec::new();
        let mut bitmap = create_test_bitmap(&mut storage);
        let base = bitmap.base();
        for i in 0..COVERED {
            bitmap.set_bit(base.add_words(i));
        }
        bitmap.clear_range(base.add_words(7), base.add_words(250));

        assert!(bitmap.test_bit(base.add_words(6)));
        assert!(!bitmap.test_bit(base.add_words(7)));
        assert!(!bitmap.test_bit(base.add_words(130)));
        assert!(!bitmap.test_bit(base.add_words(249)));
        assert!(bitmap.test_bit(base.add_words(250)));
    }

    #[test]
    #[should_panic(expected = "already in use")]
    fn test_second_iterator_on_one_bitmap_panics() {
        let mut storage = Vec::new();
        let bitmap = create_test_bitmap(&mut storage);
        let mut first = BitmapIterator::new();
        let mut second = BitmapIterator::new();
        first.start_range(&bitmap, bitmap.base(), bitmap.limit(), false);
        second.start_range(&bitmap, bitmap.base(), bitmap.limit(), false);
    }

    #[test]
    fn test_terminated_bitmap_accepts_a_new_iterator() {
        let mut storage = Vec::new();
        let mut bitmap = create_test_bitmap(&mut storage);
        let a = bitmap.base().add_words(40);
        bitmap.set_bit(a);

        let mut first = BitmapIterator::new();
        first.start_range(&bitmap, bitmap.base(), bitmap.limit(), false);
        first.terminate(&bitmap);
        // terminating twice does not release another iterator's claim
        let mut second = BitmapIterator::new();
        second.start_range(&bitmap, bitmap.base(), bitmap.limit(), false);
        first.terminate(&bitmap);
        assert!(second.is_active());
        assert_eq!(second.next(&bitmap), Some(a));
        second.terminate(&bitmap);
    }

    #[test]
    #[should_panic(expected = "already in use")]
    fn test_second_iterator_start_panics() {
        let mut storage = Vec::new();
        let bitmap = create_test_bitmap(&mut storage);
        let mut iter = BitmapIterator::new();
        iter.start_range(&bitmap, bitmap.base(), bitmap.limit(), false);
        iter.start_range(&bitmap, bitmap.base(), bitmap.limit(), false);
    }
}
