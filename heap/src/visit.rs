use object::{
    Address, Klass, KlassId, Region, for_each_reference_slot, header,
    stack::{self, frames},
};

/// Callbacks for the pointer words of an object.
pub(crate) trait ObjectVisitor {
    /// `slot` holds a reference (or null).
    fn visit_reference(&mut self, slot: Address);

    /// `slot` holds an interior pointer whose owner moved by `delta` bytes.
    fn visit_internal_pointer(&mut self, slot: Address, delta: isize) {
        if delta == 0 {
            return;
        }
        // SAFETY: slot is a word inside a live object
        unsafe {
            let value = slot.load_address();
            if !value.is_null() {
                slot.store_address(value.offset(delta));
            }
        }
    }
}

/// Visits the reference words of `oop` except its class word.
///
/// # Safety
/// `oop` must be a well-formed object of `klass`. For stack chunks the
/// frame chain must point into the chunk at its current address.
pub(crate) unsafe fn scan_object<V: ObjectVisitor>(visitor: &mut V, klass: Klass, oop: Address) {
    if klass.id() == KlassId::LOCAL_ARRAY {
        // SAFETY: by contract
        unsafe { scan_frames(visitor, oop) };
    } else {
        // SAFETY: by contract
        unsafe { for_each_reference_slot(klass, oop, |slot| visitor.visit_reference(slot)) };
    }
}

/// Methods, instruction pointers and reference locals of every frame.
///
/// The instruction pointer is relocated by however far the visitor moved
/// the frame's method. The method's local map is read before the method
/// slot is visited.
unsafe fn scan_frames<V: ObjectVisitor>(visitor: &mut V, chunk: Address) {
    // SAFETY: by contract of scan_object
    unsafe {
        for fp in frames(chunk) {
            let method_slot = stack::method_slot(fp);
            let old_method = method_slot.load_address();
            if old_method.is_null() {
                continue;
            }
            let count = stack::local_count(old_method);
            let locals = stack::local_oop_map(old_method);

            visitor.visit_reference(method_slot);
            let new_method = method_slot.load_address();
            visitor.visit_internal_pointer(stack::ip_slot(fp), new_method.delta(old_method));

            for i in locals.iter().take_while(|&i| i < count) {
                visitor.visit_reference(stack::local_slot(fp, i));
            }
        }
    }
}

/// Relocates the frame-pointer chain of a chunk that moves by `delta`.
///
/// The chain is read from `source`, where its pointers are still valid,
/// and the matching words of `target` are rewritten. Both may be the same
/// chunk.
///
/// # Safety
/// `source` must be a stack chunk with an intact chain, `target` a chunk
/// with the same layout.
pub(crate) unsafe fn relocate_frame_chain<V: ObjectVisitor>(
    visitor: &mut V,
    source: Address,
    target: Address,
    delta: isize,
) {
    let shift = target.delta(source);
    // SAFETY: by contract
    unsafe {
        let mut fp = stack::last_frame(source);
        visitor.visit_internal_pointer(stack::last_frame_slot(target), delta);
        while !fp.is_null() {
            let previous = stack::previous_frame(fp);
            visitor.visit_internal_pointer(stack::previous_frame_slot(fp).offset(shift), delta);
            fp = previous;
        }
    }
}

/// Walks the blocks of a densely packed region. `visit` receives each
/// object pointer and returns the size of its block.
///
/// # Safety
/// `region` must contain only well-formed blocks.
pub(crate) unsafe fn walk_blocks(region: Region, mut visit: impl FnMut(Address) -> usize) {
    let mut block = region.start;
    while block < region.end {
        // SAFETY: by contract
        let oop = unsafe { header::oop_for_block(block) };
        let size = visit(oop);
        debug_assert!(size > 0, "zero sized block at {block:?}");
        block = block.add(size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::{OopMap, WORD_SIZE, header::encode_array_length, stack};

    struct Shift(isize);

    impl ObjectVisitor for Shift {
        fn visit_reference(&mut self, slot: Address) {
            unsafe {
                let value = slot.load_address();
                if !value.is_null() {
                    slot.store_address(value.offset(self.0));
                }
            }
        }
    }

    fn fake_array(words: &mut [usize], length: usize) -> Address {
        words[0] = encode_array_length(length);
        Address::from_ptr(words.as_mut_ptr()).add_words(2)
    }

    #[test]
    fn test_chain_relocation_preserves_frame_offsets() {
        let mut method_words = [0usize; 2 + 4];
        let method = fake_array(&mut method_words, 4);
        unsafe { stack::initialize_method(method, 1, OopMap::EMPTY, &[1, 2]) };

        let mut source_words = [0usize; 2 + 12];
        let mut target_words = [0usize; 2 + 12];
        let source = fake_array(&mut source_words, 12);
        let target = fake_array(&mut target_words, 12);

        unsafe {
            let f0 = stack::push_frame(source, method, 0).expect("frame 0");
            let f1 = stack::push_frame(source, method, 1).expect("frame 1");
            object::copy_bytes(source, target, 12 * WORD_SIZE);

            let delta = target.delta(source);
            relocate_frame_chain(&mut Shift(0), source, target, delta);

            assert_eq!(stack::last_frame(target), f1.offset(delta));
            assert_eq!(stack::previous_frame(f1.offset(delta)), f0.offset(delta));
            assert!(stack::previous_frame(f0.offset(delta)).is_null());
            // the source chain is untouched
            assert_eq!(stack::last_frame(source), f1);
            assert_eq!(
                stack::frames(target).map(|fp| fp.diff(target)).collect::<Vec<_>>(),
                vec![f1.diff(source), f0.diff(source)]
            );
        }
    }

    #[test]
    fn test_frame_scan_moves_ip_with_method() {
        let mut method_words = [0usize; 2 + 5];
        let method = fake_array(&mut method_words, 5);
        unsafe { stack::initialize_method(method, 2, OopMap::from_fields(&[1]), &[9, 9, 9]) };

        let mut chunk_words = [0usize; 2 + 8];
        let chunk = fake_array(&mut chunk_words, 8);
        let moved_by = 64 * WORD_SIZE as isize;

        unsafe {
            let fp = stack::push_frame(chunk, method, 2).expect("frame");
            stack::local_slot(fp, 0).store(0x1234);
            stack::local_slot(fp, 1).store(0x8000);

            scan_frames(&mut Shift(moved_by), chunk);

            assert_eq!(stack::method_slot(fp).load_address(), method.offset(moved_by));
            assert_eq!(
                stack::ip_slot(fp).load_address(),
                stack::code_slot(method, 2).offset(moved_by)
            );
            // only the mapped local is a reference
            assert_eq!(stack::local_slot(fp, 0).load(), 0x1234);
            assert_eq!(
                stack::local_slot(fp, 1).load_address(),
                Address::from_usize(0x8000).offset(moved_by)
            );
        }
    }
}
