//! Post-collection heap verification.
//!
//! Every reference reachable through the object layouts must be null or
//! point at an object inside a managed space. Failures panic with the
//! offending slot.

use log::trace;
use object::{Address, Region, block_size, header, klass_of};

use crate::{
    RootSet,
    visit::{ObjectVisitor, scan_object, walk_blocks},
};

struct Verifier<'a> {
    spaces: &'a [Region],
    checked: usize,
}

impl Verifier<'_> {
    fn check(&mut self, slot: Address, value: Address) {
        self.checked += 1;
        assert!(
            value.is_null() || self.spaces.iter().any(|space| space.contains_object(value)),
            "slot {slot:?} holds {value:?}, outside every managed space"
        );
    }
}

impl ObjectVisitor for Verifier<'_> {
    fn visit_reference(&mut self, slot: Address) {
        // SAFETY: slot is a reference word of a walked object
        let value = unsafe { slot.load_address() };
        self.check(slot, value);
    }

    fn visit_internal_pointer(&mut self, _slot: Address, _delta: isize) {}
}

/// Checks every object of `spaces` and of the stable spaces, then the
/// roots.
///
/// # Safety
/// every region must be densely packed with well-formed, unforwarded
/// objects.
pub(crate) unsafe fn verify_heap(spaces: &[Region], roots: &mut RootSet) {
    let mut all = spaces.to_vec();
    all.extend_from_slice(roots.stable_spaces());
    let mut verifier = Verifier {
        spaces: &all,
        checked: 0,
    };

    let mut objects = 0;
    for &space in &all {
        // SAFETY: by contract
        unsafe {
            walk_blocks(space, |oop| {
                objects += 1;
                verifier.visit_reference(header::class_word_slot(oop));
                let klass = klass_of(oop);
                scan_object(&mut verifier, klass, oop);
                block_size(klass, oop)
            });
        }
    }

    roots.visit_roots(&mut |slot| verifier.check(Address::NULL, *slot));
    let queues = roots.queues();
    verifier.check(Address::NULL, queues.weak_head);
    verifier.check(Address::NULL, queues.finalizer_head);

    trace!(
        "verified {objects} objects and {} references",
        verifier.checked
    );
}
