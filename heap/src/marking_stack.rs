use object::{Address, WORD_SIZE};

/// Fixed-capacity LIFO of objects whose fields still need marking.
///
/// The stack lives in otherwise unused heap memory. A push onto a full
/// stack is dropped and only remembered through the overflow flag; the
/// marker then recovers by rescanning every marked object.
#[derive(Debug)]
pub struct MarkingStack {
    base: Address,
    limit: Address,
    top: Address,
    overflowed: bool,
}

impl MarkingStack {
    pub const fn new() -> Self {
        Self {
            base: Address::NULL,
            limit: Address::NULL,
            top: Address::NULL,
            overflowed: false,
        }
    }

    /// Resets the stack onto the writable words `[base, limit)`.
    pub fn setup(&mut self, base: Address, limit: Address) {
        let base = base.align_up();
        let limit = Address::from_usize(limit.as_usize() & !(WORD_SIZE - 1)).max(base);
        self.base = base;
        self.limit = limit;
        self.top = base;
        self.overflowed = false;
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.limit.diff(self.base) / WORD_SIZE
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.top.diff(self.base) / WORD_SIZE
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.top == self.base
    }

    /// Highest address the stack has reserved.
    #[inline(always)]
    pub fn limit(&self) -> Address {
        self.limit
    }

    #[inline]
    pub fn push(&mut self, oop: Address) {
        if self.top >= self.limit {
            self.overflowed = true;
            return;
        }
        // SAFETY: [base, limit) is writable by the setup contract
        unsafe { self.top.store_address(oop) };
        self.top = self.top.add(WORD_SIZE);
    }

    #[inline]
    pub fn pop(&mut self) -> Option<Address> {
        if self.top == self.base {
            return None;
        }
        self.top = self.top.sub(WORD_SIZE);
        // SAFETY: the slot was written by push
        Some(unsafe { self.top.load_address() })
    }

    #[inline(always)]
    pub fn has_overflowed(&self) -> bool {
        self.overflowed
    }

    #[inline(always)]
    pub fn reset_overflow(&mut self) {
        self.overflowed = false;
    }
}

impl Default for MarkingStack {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifo_order() {
        let mut storage = [0usize; 8];
        let base = Address::from_ptr(storage.as_mut_ptr());
        let mut stack = MarkingStack::new();
        stack.setup(base, base.add_words(8));

        for i in 1..=3 {
            stack.push(Address::from_usize(i * 8));
        }
        assert_eq!(stack.len(), 3);
        assert_eq!(stack.pop(), Some(Address::from_usize(24)));
        assert_eq!(stack.pop(), Some(Address::from_usize(16)));
        assert_eq!(stack.pop(), Some(Address::from_usize(8)));
        assert_eq!(stack.pop(), None);
        assert!(!stack.has_overflowed());
    }

    #[test]
    fn test_full_stack_flags_overflow() {
        let mut storage = [0usize; 2];
        let base = Address::from_ptr(storage.as_mut_ptr());
        let mut stack = MarkingStack::new();
        stack.setup(base, base.add_words(2));

        stack.push(Address::from_usize(8));
        stack.push(Address::from_usize(16));
        assert!(!stack.has_overflowed());
        stack.push(Address::from_usize(24));
        assert!(stack.has_overflowed());
        assert_eq!(stack.len(), 2);
        assert_eq!(stack.pop(), Some(Address::from_usize(16)));

        stack.reset_overflow();
        assert!(!stack.has_overflowed());
    }

    #[test]
    fn test_zero_capacity_always_overflows() {
        let mut stack = MarkingStack::new();
        let base = Address::from_usize(0x1000);
        stack.setup(base, base);
        assert_eq!(stack.capacity(), 0);
        stack.push(Address::from_usize(8));
        assert!(stack.has_overflowed());
        assert!(stack.is_empty());
    }

    #[test]
    fn test_setup_resets_state() {
        let mut storage = [0usize; 1];
        let base = Address::from_ptr(storage.as_mut_ptr());
        let mut stack = MarkingStack::new();
        stack.setup(base, base.add_words(1));
        stack.push(Address::from_usize(8));
        stack.push(Address::from_usize(16));
        assert!(stack.has_overflowed());

        stack.setup(base, base.add_words(1));
        assert!(stack.is_empty());
        assert!(!stack.has_overflowed());
    }
}
