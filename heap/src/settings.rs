use object::WORD_SIZE;

use crate::{HeapError, OS_PAGE_SIZE, forwarding::SLICE_OFFSET_BITS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CollectorKind {
    /// Two equal semi-spaces, Cheney copying.
    #[default]
    Copying,
    /// One region compacted in place (Lisp2).
    MarkCompact,
}

/// Configuration for the managed heap and its collector.
#[derive(Debug, Clone)]
pub struct HeapSettings {
    pub collector: CollectorKind,
    /// Bytes of collected memory. The copying collector splits this into
    /// two semi-spaces, so only half of it is usable at a time.
    pub heap_size: usize,
    /// Bytes of never-collected memory in front of the mark-compact heap.
    pub permanent_size: usize,
    /// Bytes of read-only-image memory. Well-known klasses live here.
    pub rom_size: usize,
    /// Bytes of persistent-object memory.
    pub nvm_size: usize,
    /// Number of global root slots.
    pub global_roots: usize,
    /// log2 of the mark-compact slice size in words.
    pub slice_words_log2: usize,
    /// Upper bound on the mark-compact marking stack, in words.
    pub marking_stack_words: usize,
    /// Nesting budget of direct recursion while marking.
    pub max_recursion_depth: usize,
    /// Zero reclaimed memory after each collection.
    pub zero_fill_reclaimed: bool,
    /// Make the idle semi-space inaccessible between collections.
    pub protect_unused_space: bool,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            collector: CollectorKind::Copying,
            heap_size: 8 * 1024 * 1024, // 8 MB
            permanent_size: 0,
            rom_size: 64 * 1024,         // 64 KB
            nvm_size: 64 * 1024,         // 64 KB
            global_roots: 256,
            slice_words_log2: 12,
            marking_stack_words: 4096,
            max_recursion_depth: 4,
            zero_fill_reclaimed: true,
            protect_unused_space: false,
        }
    }
}

impl HeapSettings {
    pub(crate) fn validate(&self) -> Result<(), HeapError> {
        self.check().map_err(HeapError::InvalidSettings)
    }

    #[inline]
    fn check(&self) -> Result<(), &'static str> {
        if self.heap_size == 0 || self.rom_size == 0 || self.nvm_size == 0 {
            return Err("Sizes must be > 0");
        }
        if !self.heap_size.is_multiple_of(2 * OS_PAGE_SIZE) {
            return Err("heap_size must be a multiple of two pages");
        }
        if !self.permanent_size.is_multiple_of(WORD_SIZE) {
            return Err("permanent_size must be word aligned");
        }
        if self.slice_words_log2 == 0 || self.slice_words_log2 > SLICE_OFFSET_BITS {
            return Err("slice_words_log2 exceeds the forwarding offset budget");
        }
        if self.collector == CollectorKind::Copying && self.permanent_size != 0 {
            return Err("permanent space requires the mark-compact collector");
        }
        Ok(())
    }

    /// Settings suitable for the copying collector.
    pub fn copying(heap_size: usize) -> Self {
        Self {
            collector: CollectorKind::Copying,
            heap_size,
            ..Default::default()
        }
    }

    /// Settings suitable for the mark-compact collector.
    pub fn mark_compact(heap_size: usize) -> Self {
        Self {
            collector: CollectorKind::MarkCompact,
            heap_size,
            permanent_size: 64 * 1024, // 64 KB
            ..Default::default()
        }
    }
}
