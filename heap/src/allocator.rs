use object::{Address, align_word};

/// Bump allocator over the arena handed out by the active collector.
///
/// `limit` is where allocation stops and a collection is requested;
/// `hard_limit` is the end of the arena itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct BumpAllocator {
    start: Address,
    cursor: Address,
    limit: Address,
    hard_limit: Address,
}

impl BumpAllocator {
    pub const fn new() -> Self {
        Self {
            start: Address::NULL,
            cursor: Address::NULL,
            limit: Address::NULL,
            hard_limit: Address::NULL,
        }
    }

    pub fn set_allocation_parameters(
        &mut self,
        start: Address,
        cursor: Address,
        limit: Address,
        hard_limit: Address,
    ) {
        debug_assert!(start <= cursor && cursor <= limit && limit <= hard_limit);
        debug_assert!(cursor.is_word_aligned());
        self.start = start;
        self.cursor = cursor;
        self.limit = limit;
        self.hard_limit = hard_limit;
    }

    /// Reserves `bytes` (word rounded) and returns the block start.
    #[inline]
    pub fn allocate(&mut self, bytes: usize) -> Option<Address> {
        let size = align_word(bytes);
        let block = self.cursor;
        let end = block.as_usize().checked_add(size)?;
        if end > self.limit.as_usize() {
            return None;
        }
        self.cursor = Address::from_usize(end);
        Some(block)
    }

    #[inline(always)]
    pub fn start(&self) -> Address {
        self.start
    }

    /// Current allocation top.
    #[inline(always)]
    pub fn cursor(&self) -> Address {
        self.cursor
    }

    #[inline(always)]
    pub fn limit(&self) -> Address {
        self.limit
    }

    #[inline(always)]
    pub fn hard_limit(&self) -> Address {
        self.hard_limit
    }

    #[inline(always)]
    pub fn used(&self) -> usize {
        self.cursor.diff(self.start)
    }

    #[inline(always)]
    pub fn remaining(&self) -> usize {
        self.limit.diff(self.cursor)
    }
}
