//! Lisp2 sliding mark-compact collector.
//!
//! Memory layout of the mapping:
//!
//! ```text
//! [permanent][heap ...][mark bitmap][slice table]
//! ```
//!
//! A collection marks live heap objects in the side bitmap, computes every
//! destination in address order, rewrites all references and finally
//! slides the objects toward the heap start. Destinations are kept in the
//! class words of moving objects (see [`crate::forwarding`]).

use std::{collections::HashMap, time::Instant};

use log::{debug, trace, warn};
use object::{
    Address, Klass, KlassId, Region, WORD_SIZE, align_word, association, block_size, copy_bytes,
    fill_zero, finalizer, header, header_words, model::field_slot, read_field, resolve_klass,
    weak_reference, write_field,
};

use crate::{
    Bitmap, BitmapIterator, BumpAllocator, GarbageCollector, GcPhase, GcTimings, HeapError,
    HeapSettings, MappedMemory, MarkingStack, RootSet, WellKnownKlasses,
    forwarding::{ClassSpace, ForwardingCodec, MAX_CLASS_OFFSET, SliceTable, is_encoded},
    visit::{ObjectVisitor, relocate_frame_chain, scan_object, walk_blocks},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Mark,
    Update,
}

/// Old and new klass of an association, captured before the association
/// is rewritten. Compaction resolves layouts through it because either
/// klass copy may be stale at that point.
#[derive(Debug, Clone, Copy)]
struct AssociationKlass {
    old: Address,
    new: Address,
}

pub struct MarkCompactCollector {
    memory: MappedMemory,
    permanent: Region,
    permanent_top: Address,
    heap: Region,
    bitmap: Bitmap,
    iterator: BitmapIterator,
    slices: SliceTable,
    codec: ForwardingCodec,
    stack: MarkingStack,
    stack_words: usize,
    max_depth: usize,
    depth: usize,
    phase: Phase,
    collection_top: Address,
    first_moving: Address,
    klasses: WellKnownKlasses,
    deferred: Vec<Address>,
    associations: HashMap<Address, AssociationKlass>,
    zero_fill: bool,
    last_top: Address,
    recoveries: u64,
    timings: GcTimings,
}

impl MarkCompactCollector {
    pub fn new(settings: &HeapSettings, rom: Region, nvm: Region) -> Result<Self, HeapError> {
        settings.validate()?;
        let heap_words = settings.heap_size / WORD_SIZE;
        let bitmap_words = Bitmap::storage_words(heap_words + 1);
        let slice_count = SliceTable::entries_for(heap_words, settings.slice_words_log2);
        let size = settings.permanent_size + settings.heap_size + (bitmap_words + slice_count) * WORD_SIZE;
        let memory = MappedMemory::new(size)?;

        let permanent = Region::new(memory.start(), memory.start().add(settings.permanent_size));
        let heap = Region::new(permanent.end, permanent.end.add(settings.heap_size));
        let class_space = Region::new(memory.start(), heap.end);
        if class_space.words() > MAX_CLASS_OFFSET {
            return Err(HeapError::InvalidSettings(
                "heap exceeds the class offset range of forwarding words",
            ));
        }

        // SAFETY: both tables lie inside the mapping, past the heap
        let (bitmap, slices) = unsafe {
            (
                Bitmap::new(heap.end, heap.start, heap_words + 1),
                SliceTable::new(
                    heap.end.add_words(bitmap_words),
                    slice_count,
                    heap.start,
                    settings.slice_words_log2,
                ),
            )
        };

        debug!(
            "mark-compact collector: heap {heap:?}, permanent {permanent:?}, {slice_count} slices"
        );
        Ok(Self {
            memory,
            permanent,
            permanent_top: permanent.start,
            heap,
            bitmap,
            iterator: BitmapIterator::new(),
            slices,
            codec: ForwardingCodec::new(class_space, rom, nvm),
            stack: MarkingStack::new(),
            stack_words: settings.marking_stack_words,
            max_depth: settings.max_recursion_depth,
            depth: 0,
            phase: Phase::Idle,
            collection_top: heap.start,
            first_moving: Address::NULL,
            klasses: WellKnownKlasses::default(),
            deferred: Vec::new(),
            associations: HashMap::new(),
            zero_fill: settings.zero_fill_reclaimed,
            last_top: heap.start,
            recoveries: 0,
            timings: GcTimings::default(),
        })
    }

    /// Number of marking-stack overflow recoveries so far.
    pub fn overflow_recoveries(&self) -> u64 {
        self.recoveries
    }

    pub fn permanent_space(&self) -> Region {
        Region::new(self.permanent.start, self.permanent_top)
    }

    fn ensure_initialized(&mut self, roots: &RootSet) {
        if !self.klasses.is_initialized() {
            self.klasses = *roots.klasses();
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        trace!("mark-compact collector: {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }

    #[inline(always)]
    fn in_collection(&self, oop: Address) -> bool {
        self.heap.start < oop && oop <= self.collection_top
    }

    #[inline]
    fn is_marked(&self, oop: Address) -> bool {
        oop.is_null() || !self.in_collection(oop) || self.bitmap.test_bit(oop)
    }

    /// Class-or-association recorded in the class word of `oop`, whether
    /// or not the word carries a forwarding encoding.
    #[inline]
    fn recorded_class(&self, oop: Address) -> Address {
        // SAFETY: oop is an object pointer
        let word = unsafe { header::class_word(oop) };
        if is_encoded(word) {
            self.codec.class_or_association(word)
        } else {
            Address::from_usize(word)
        }
    }

    #[inline]
    fn klass_of_coa(&self, coa: Address) -> Klass {
        let coa_class = self.recorded_class(coa);
        // SAFETY: class and association bodies are intact until compaction
        unsafe { resolve_klass(coa, coa_class) }
    }

    /// Destination of `oop`. Objects that do not move map to themselves.
    #[inline]
    fn forward(&self, oop: Address) -> Address {
        if !self.in_collection(oop) {
            return oop;
        }
        // SAFETY: references into the collection point at live objects
        let word = unsafe { header::class_word(oop) };
        if !is_encoded(word) {
            return oop;
        }
        let (_, _, slice_offset) = self.codec.decode(word);
        self.slices.destination(oop, slice_offset)
    }

    fn static_spaces(&self, roots: &RootSet) -> Vec<Region> {
        let mut spaces = vec![self.permanent_space()];
        spaces.extend_from_slice(roots.stable_spaces());
        spaces
    }

    // ── Mark ──────────────────────────────────────────────────────────

    fn setup(&mut self, top: Address) {
        self.collection_top = top;
        self.bitmap.clear_range(self.heap.start, top.add(WORD_SIZE));
        let stack_limit = top
            .as_usize()
            .saturating_add(self.stack_words * WORD_SIZE)
            .min(self.heap.end.as_usize());
        self.stack.setup(top, Address::from_usize(stack_limit));
        self.depth = 0;
        self.first_moving = Address::NULL;
    }

    fn mark_object(&mut self, oop: Address) {
        if !self.in_collection(oop) || self.bitmap.test_and_set_bit(oop) {
            return;
        }
        if self.depth < self.max_depth {
            self.depth += 1;
            self.mark_fields(oop);
            self.depth -= 1;
        } else {
            self.stack.push(oop);
        }
    }

    /// Marks the class-or-association and the references of `oop`.
    fn mark_fields(&mut self, oop: Address) -> Klass {
        // SAFETY: class words are untagged while marking
        let coa = unsafe { header::class_or_association(oop) };
        self.mark_object(coa);
        let klass = self.klass_of_coa(coa);
        // SAFETY: oop is a live object of klass
        unsafe { scan_object(self, klass, oop) };
        klass
    }

    /// Drains the marking stack, rescanning every marked object for as
    /// long as pushes were dropped.
    fn complete_marking(&mut self) {
        self.drain();
        while self.stack.has_overflowed() {
            self.stack.reset_overflow();
            self.recoveries += 1;
            warn!(
                "marking stack overflowed ({} words), rescanning marked objects",
                self.stack.capacity()
            );
            self.iterator
                .start_range(&self.bitmap, self.heap.start, self.collection_top, true);
            while let Some(oop) = self.iterator.next(&self.bitmap) {
                self.mark_fields(oop);
                self.drain();
            }
            self.iterator.terminate(&self.bitmap);
        }
    }

    fn drain(&mut self) {
        while let Some(oop) = self.stack.pop() {
            self.mark_fields(oop);
        }
    }

    fn mark_roots(&mut self, roots: &mut RootSet) {
        roots.visit_roots(&mut |slot| self.mark_object(*slot));

        let mut klasses = self.klasses;
        klasses.visit(&mut |slot| self.mark_object(*slot));
        self.complete_marking();

        for space in self.static_spaces(roots) {
            // SAFETY: static spaces are densely packed with objects
            unsafe {
                walk_blocks(space, |oop| {
                    let klass = self.mark_fields(oop);
                    block_size(klass, oop)
                });
            }
            self.complete_marking();
        }

        let heads: Vec<Address> = roots.queues().ready.values().copied().collect();
        for head in heads {
            let mut node = head;
            while !node.is_null() {
                // SAFETY: ready queues link finalizer objects
                unsafe {
                    self.mark_object(read_field(node, finalizer::OBJECT));
                    self.mark_object(node);
                    node = read_field(node, finalizer::NEXT);
                }
            }
        }
        self.complete_marking();
    }

    fn process_finalizers(&mut self, roots: &mut RootSet) {
        // SAFETY: the pending list is intact until it is rebuilt below
        let snapshot = unsafe { roots.queues().snapshot_finalizers(|object| self.is_marked(object)) };
        if snapshot.is_empty() {
            return;
        }
        for &(node, _) in &snapshot {
            self.mark_object(node);
            // SAFETY: node is a finalizer
            self.mark_object(unsafe { read_field(node, finalizer::OBJECT) });
        }
        self.complete_marking();

        // SAFETY: nodes have not moved yet
        let ready = unsafe { roots.queues_mut().route_finalizers(&snapshot) };
        trace!("finalizers: {} pending, {} ready", snapshot.len() - ready, ready);
    }

    fn process_weak_references(&mut self, roots: &mut RootSet) {
        // SAFETY: nothing has moved yet
        let (kept, cleared) = unsafe {
            roots
                .queues_mut()
                .filter_weak_references(|oop| self.is_marked(oop).then_some(oop))
        };
        trace!("weak references: {kept} kept, {cleared} cleared");
    }

    // ── Compute addresses ─────────────────────────────────────────────

    /// Assigns destinations in address order and returns the new top.
    fn compute_addresses(&mut self) -> Address {
        self.slices.clear();
        let mut free = self.heap.start;
        self.iterator
            .start_range(&self.bitmap, self.heap.start, self.collection_top, true);
        while let Some(oop) = self.iterator.next(&self.bitmap) {
            // SAFETY: oop is marked and not yet encoded
            unsafe {
                let coa = header::class_or_association(oop);
                let klass = self.klass_of_coa(coa);
                let header_bytes = header_words(klass) * WORD_SIZE;
                let destination = free.add(header_bytes);
                if destination != oop {
                    if self.first_moving.is_null() {
                        self.first_moving = oop.sub(header_bytes);
                    }
                    let offset = self.slices.offset_for(oop, destination);
                    header::set_class_word(oop, self.codec.encode(coa, offset));
                }
                free = free.add(block_size(klass, oop));
            }
        }
        self.iterator.terminate(&self.bitmap);
        free
    }

    // ── Update pointers ───────────────────────────────────────────────

    fn update_pointers(&mut self, roots: &mut RootSet) {
        roots.visit_roots(&mut |slot| *slot = self.forward(*slot));
        let mut klasses = self.klasses;
        klasses.visit(&mut |slot| *slot = self.forward(*slot));
        self.klasses = klasses;
        let queues = roots.queues_mut();
        queues.weak_head = self.forward(queues.weak_head);
        queues.finalizer_head = self.forward(queues.finalizer_head);

        for space in self.static_spaces(roots) {
            // SAFETY: static objects keep untagged class words
            unsafe {
                walk_blocks(space, |oop| {
                    let klass = self.klass_of_coa(header::class_or_association(oop));
                    self.update_fields(klass, oop);
                    self.visit_reference(header::class_word_slot(oop));
                    block_size(klass, oop)
                });
            }
        }

        self.iterator
            .start_range(&self.bitmap, self.heap.start, self.collection_top, true);
        while let Some(oop) = self.iterator.next(&self.bitmap) {
            // SAFETY: oop is a marked object at its old address
            unsafe { self.update_object(oop) };
        }
        self.iterator.terminate(&self.bitmap);

        self.update_associations();
    }

    /// Rewrites the references held in the body of `oop`. Associations are
    /// deferred: their klass field must stay valid while other objects are
    /// still being resolved through it.
    fn update_fields(&mut self, klass: Klass, oop: Address) {
        let special: &[usize] = match klass.id() {
            KlassId::OBJECT_ASSOCIATION => {
                self.deferred.push(oop);
                return;
            }
            KlassId::WEAK_REFERENCE => &[weak_reference::REFERENT, weak_reference::NEXT],
            KlassId::FINALIZER => &[finalizer::OBJECT, finalizer::NEXT],
            _ => &[],
        };
        for &field in special {
            self.visit_reference(field_slot(oop, field));
        }
        // SAFETY: oop is an object of klass at its current address
        unsafe { scan_object(self, klass, oop) };
    }

    unsafe fn update_object(&mut self, oop: Address) {
        // SAFETY: by contract
        let word = unsafe { header::class_word(oop) };
        if !is_encoded(word) {
            let coa = Address::from_usize(word);
            let klass = self.klass_of_coa(coa);
            self.update_fields(klass, oop);
            // SAFETY: by contract
            unsafe { header::set_class_word(oop, self.forward(coa).as_usize()) };
            return;
        }

        let (coa, space, _) = self.codec.decode(word);
        let klass = self.klass_of_coa(coa);
        self.update_fields(klass, oop);
        if klass.id() == KlassId::LOCAL_ARRAY {
            let delta = self.forward(oop).delta(oop);
            // SAFETY: the chain of oop still points into oop
            unsafe { relocate_frame_chain(self, oop, oop, delta) };
        }
        // a class below the object is compacted first, so the object
        // records the new copy; a class above it stays at its old address
        let locator = if space == ClassSpace::Heap && coa < oop {
            self.forward(coa)
        } else {
            coa
        };
        // SAFETY: by contract
        unsafe { header::set_class_word(oop, self.codec.with_class(word, locator)) };
    }

    fn update_associations(&mut self) {
        for oop in std::mem::take(&mut self.deferred) {
            // SAFETY: deferred objects are associations
            unsafe {
                let old = read_field(oop, association::KLASS);
                let new = self.forward(old);
                write_field(oop, association::KLASS, new);
                let klass = AssociationKlass { old, new };
                self.associations.insert(oop, klass);
                self.associations.insert(self.forward(oop), klass);
            }
        }
    }

    // ── Compact ───────────────────────────────────────────────────────

    /// Layout of an object about to be compacted. `coa` is the recorded
    /// locator: the new copy for classes below `oop`, the old one above.
    fn compaction_klass(&self, coa: Address, oop: Address) -> Klass {
        let coa_class = self.recorded_class(coa);
        debug_assert!(
            !self.in_collection(coa_class),
            "class of {coa:?} is collectable"
        );
        // SAFETY: classes of classes and associations never move
        let meta = unsafe { Klass::from_address(coa_class) };
        if meta.id() != KlassId::OBJECT_ASSOCIATION {
            // SAFETY: see the locator rule in update_object
            return unsafe { Klass::from_address(coa) };
        }
        let klass = match self.associations.get(&coa) {
            Some(klass) if klass.old < oop => klass.new,
            Some(klass) => klass.old,
            // SAFETY: an association outside the table was never rewritten
            None => unsafe { read_field(coa, association::KLASS) },
        };
        // SAFETY: a klass below oop has been compacted, one above is intact
        unsafe { Klass::from_address(klass) }
    }

    fn compact(&mut self) {
        self.iterator
            .start_range(&self.bitmap, self.first_moving, self.collection_top, true);
        while let Some(oop) = self.iterator.next(&self.bitmap) {
            // SAFETY: blocks at or above oop are still intact
            unsafe {
                let word = header::class_word(oop);
                if !is_encoded(word) {
                    continue;
                }
                let (coa, space, slice_offset) = self.codec.decode(word);
                let destination = self.slices.destination(oop, slice_offset);
                let klass = self.compaction_klass(coa, oop);
                let size = block_size(klass, oop);
                let coa = if space == ClassSpace::Heap && coa > oop {
                    self.forward(coa)
                } else {
                    coa
                };
                let header_bytes = header_words(klass) * WORD_SIZE;
                copy_bytes(oop.sub(header_bytes), destination.sub(header_bytes), size);
                header::set_class_word(destination, coa.as_usize());
            }
        }
        self.iterator.terminate(&self.bitmap);
        self.associations.clear();
    }

    fn finalize(&mut self, allocator: &mut BumpAllocator, free: Address) {
        let dirty = self.collection_top.max(self.stack.limit());
        if self.zero_fill && free < dirty {
            // SAFETY: nothing live remains above the new top
            unsafe { fill_zero(free, dirty) };
        }
        allocator.set_allocation_parameters(self.heap.start, free, self.heap.end, self.heap.end);
        self.last_top = free;
    }
}

impl ObjectVisitor for MarkCompactCollector {
    #[inline]
    fn visit_reference(&mut self, slot: Address) {
        // SAFETY: slot is a reference word of a scanned object
        unsafe {
            let value = slot.load_address();
            match self.phase {
                Phase::Mark => self.mark_object(value),
                Phase::Update => {
                    let forwarded = self.forward(value);
                    if forwarded != value {
                        slot.store_address(forwarded);
                    }
                }
                Phase::Idle => unreachable!("reference visited outside a collection"),
            }
        }
    }

    fn visit_internal_pointer(&mut self, slot: Address, delta: isize) {
        if self.phase != Phase::Update || delta == 0 {
            return;
        }
        // SAFETY: slot is an interior pointer word of a live object
        unsafe {
            let value = slot.load_address();
            if !value.is_null() {
                slot.store_address(value.offset(delta));
            }
        }
    }
}

impl GarbageCollector for MarkCompactCollector {
    fn collect(&mut self, roots: &mut RootSet, allocator: &mut BumpAllocator, _force_full: bool) -> bool {
        assert!(self.phase == Phase::Idle, "re-entrant collection");
        self.ensure_initialized(roots);
        let start = Instant::now();
        let top = allocator.cursor();
        let used_before = top.diff(self.heap.start);

        let phase = Instant::now();
        self.setup(top);
        self.set_phase(Phase::Mark);
        self.mark_roots(roots);
        self.timings.record(GcPhase::Trace, phase.elapsed());

        let phase = Instant::now();
        self.process_finalizers(roots);
        self.process_weak_references(roots);
        self.timings.record(GcPhase::References, phase.elapsed());

        let phase = Instant::now();
        let free = self.compute_addresses();
        self.timings.record(GcPhase::Addresses, phase.elapsed());

        if self.first_moving.is_null() {
            trace!("mark-compact collector: no object moves");
        } else {
            let phase = Instant::now();
            self.set_phase(Phase::Update);
            self.update_pointers(roots);
            self.timings.record(GcPhase::Update, phase.elapsed());

            let phase = Instant::now();
            self.compact();
            self.timings.record(GcPhase::Compact, phase.elapsed());
        }

        let phase = Instant::now();
        self.finalize(allocator, free);
        self.set_phase(Phase::Idle);
        self.timings.record(GcPhase::Reclaim, phase.elapsed());

        let live = free.diff(self.heap.start);
        let reclaimed = used_before - live;
        let elapsed = start.elapsed();
        self.timings.finish_collection(elapsed, reclaimed);
        debug!(
            "mark-compact collection #{}: {} bytes live, {} bytes reclaimed in {:?}",
            self.timings.collections, live, reclaimed, elapsed
        );
        true
    }

    fn post_collection(&mut self, roots: &mut RootSet) {
        #[cfg(feature = "gc-verify")]
        {
            let spaces = [self.permanent_space(), Region::new(self.heap.start, self.last_top)];
            // SAFETY: both regions are densely packed
            unsafe { crate::verify::verify_heap(&spaces, roots) };
        }
        #[cfg(not(feature = "gc-verify"))]
        let _ = roots;
    }

    fn free_memory(&self, allocation_top: Address) -> usize {
        self.heap.end.diff(allocation_top)
    }

    fn total_memory(&self) -> usize {
        self.heap.size()
    }

    fn arena(&self) -> Region {
        self.heap
    }

    fn allocate_permanent(&mut self, bytes: usize) -> Option<Address> {
        let size = align_word(bytes);
        if size > self.permanent.end.diff(self.permanent_top) {
            return None;
        }
        let block = self.permanent_top;
        self.permanent_top = block.add(size);
        Some(block)
    }

    fn timings(&self) -> &GcTimings {
        &self.timings
    }
}

impl std::fmt::Debug for MarkCompactCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkCompactCollector")
            .field("memory", &self.memory)
            .field("permanent", &self.permanent_space())
            .field("heap", &self.heap)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Collector, Heap, Placement};
    use object::{KlassLayout, OopMap, stack};

    fn create_test_settings() -> HeapSettings {
        HeapSettings::mark_compact(128 * 1024)
    }

    fn create_test_heap() -> Heap {
        Heap::new(create_test_settings()).expect("heap")
    }

    fn define_pair(heap: &mut Heap) -> Address {
        let layout = KlassLayout::instance(KlassId::FIRST_USER, 2, OopMap::from_fields(&[0]));
        heap.define_klass(&layout, Address::NULL, Placement::Rom)
            .expect("klass")
    }

    fn collector(heap: &Heap) -> &MarkCompactCollector {
        match heap.collector() {
            Collector::MarkCompact(collector) => collector,
            Collector::Copying(_) => panic!("expected the mark-compact collector"),
        }
    }

    /// Rooted singly linked list of `length` pairs with a garbage pair
    /// between every two nodes. Node `i` holds `i << 3` in its data field.
    fn build_list(heap: &mut Heap, pair: Address, length: usize) {
        for i in 0..length {
            heap.new_instance(pair).expect("garbage");
            let node = heap.new_instance(pair).expect("node");
            heap.set_field(node, 0, heap.global(0));
            heap.set_field(node, 1, Address::from_usize(i << 3));
            heap.set_global(0, node);
        }
    }

    fn read_list(heap: &Heap) -> Vec<usize> {
        let mut values = Vec::new();
        let mut node = heap.global(0);
        while !node.is_null() {
            values.push(heap.field(node, 1).as_usize() >> 3);
            node = heap.field(node, 0);
        }
        values
    }

    #[test]
    fn test_garbage_between_live_objects_is_reclaimed() {
        let mut heap = create_test_heap();
        let pair = define_pair(&mut heap);

        let a = heap.new_instance(pair).expect("a");
        heap.set_global(0, a);
        let c = heap.new_instance(pair).expect("c");
        let b = heap.new_instance(pair).expect("b");
        heap.set_field(b, 1, Address::from_usize(0xb0));
        heap.set_field(a, 0, b);
        let c_size = unsafe { block_size(heap.class_of(c), c) };

        let before = heap.free_memory();
        heap.collect();
        assert_eq!(heap.free_memory() - before, c_size);

        assert_eq!(heap.global(0), a, "objects below the gap stay in place");
        let moved = heap.field(a, 0);
        assert_eq!(moved, c, "B slides into the slot of C");
        assert_eq!(heap.field(moved, 1), Address::from_usize(0xb0));
        assert_eq!(heap.class_of(moved).address(), pair);
    }

    #[test]
    fn test_nothing_moves_without_garbage() {
        let mut heap = create_test_heap();
        let pair = define_pair(&mut heap);

        for _ in 0..4 {
            let node = heap.new_instance(pair).expect("node");
            heap.set_field(node, 0, heap.global(0));
            heap.set_global(0, node);
        }
        let head = heap.global(0);
        let top = heap.allocation_top();

        heap.collect();
        heap.collect();

        assert_eq!(heap.global(0), head);
        assert_eq!(heap.allocation_top(), top);
        let timings = heap.timings();
        assert_eq!(timings.collections, 2);
        assert!(timings.phase(GcPhase::Compact).is_zero());
        assert!(timings.phase(GcPhase::Update).is_zero());
    }

    #[test]
    fn test_repeated_compaction_keeps_values() {
        let mut heap = create_test_heap();
        let pair = define_pair(&mut heap);
        build_list(&mut heap, pair, 64);
        let expected: Vec<usize> = (0..64).rev().collect();

        heap.collect();
        assert_eq!(read_list(&heap), expected);
        let top = heap.allocation_top();

        heap.collect();
        assert_eq!(read_list(&heap), expected);
        assert_eq!(heap.allocation_top(), top, "a second collection finds no garbage");
    }

    #[test]
    fn test_marking_stack_overflow_recovers() {
        let settings = HeapSettings {
            marking_stack_words: 1,
            max_recursion_depth: 0,
            ..create_test_settings()
        };
        let mut heap = Heap::new(settings).expect("heap");
        let pair = define_pair(&mut heap);
        build_list(&mut heap, pair, 200);

        // a wide array fans out more children than the stack can hold
        let objects = heap.klasses().object_array;
        let array = heap.new_array(objects, 16).expect("array");
        heap.set_global(1, array);
        for i in 0..16 {
            let element = heap.new_instance(pair).expect("element");
            heap.set_field(element, 1, Address::from_usize(i << 3));
            let array = heap.global(1);
            heap.set_field(array, i, element);
        }

        heap.collect();

        assert!(collector(&heap).overflow_recoveries() > 0);
        assert_eq!(read_list(&heap), (0..200).rev().collect::<Vec<_>>());
        let array = heap.global(1);
        for i in 0..16 {
            let element = heap.field(array, i);
            assert_eq!(heap.field(element, 1), Address::from_usize(i << 3));
        }
    }

    #[test]
    fn test_zero_capacity_stack_still_marks_everything() {
        let settings = HeapSettings {
            marking_stack_words: 0,
            max_recursion_depth: 0,
            ..create_test_settings()
        };
        let mut heap = Heap::new(settings).expect("heap");
        let pair = define_pair(&mut heap);
        build_list(&mut heap, pair, 32);

        heap.collect();
        assert_eq!(read_list(&heap), (0..32).rev().collect::<Vec<_>>());
    }

    #[test]
    fn test_weak_references_follow_compaction() {
        let mut heap = create_test_heap();
        let pair = define_pair(&mut heap);

        heap.new_instance(pair).expect("garbage");
        let kept = heap.new_instance(pair).expect("kept");
        heap.set_field(kept, 1, Address::from_usize(0x4b << 3));
        heap.set_global(0, kept);
        let weak = heap.new_weak_reference(kept).expect("weak");
        heap.set_global(1, weak);
        let lost = heap.new_instance(pair).expect("lost");
        let weak_lost = heap.new_weak_reference(lost).expect("weak lost");
        heap.set_global(2, weak_lost);

        heap.collect();

        let kept = heap.global(0);
        assert_eq!(heap.weak_referent(heap.global(1)), kept);
        assert_eq!(heap.field(kept, 1), Address::from_usize(0x4b << 3));
        assert!(heap.weak_referent(heap.global(2)).is_null());
        assert_eq!(heap.weak_references(), vec![heap.global(1)]);
    }

    #[test]
    fn test_weak_references_to_stable_objects_are_never_cleared() {
        let mut heap = create_test_heap();
        let pair = define_pair(&mut heap);

        let permanent = heap
            .new_instance_in(pair, Placement::Permanent)
            .expect("permanent");
        let rom = heap.new_instance_in(pair, Placement::Rom).expect("rom");
        heap.new_instance(pair).expect("garbage");
        let to_permanent = heap.new_weak_reference(permanent).expect("weak permanent");
        heap.set_global(0, to_permanent);
        let to_rom = heap.new_weak_reference(rom).expect("weak rom");
        heap.set_global(1, to_rom);

        for _ in 0..2 {
            heap.collect();
            assert_eq!(heap.weak_referent(heap.global(0)), permanent);
            assert_eq!(heap.weak_referent(heap.global(1)), rom);
        }
        let mut listed = heap.weak_references();
        listed.sort();
        let mut expected = vec![heap.global(0), heap.global(1)];
        expected.sort();
        assert_eq!(listed, expected);
    }

    #[test]
    fn test_finalizer_resurrects_into_owner_queue() {
        let mut heap = create_test_heap();
        let pair = define_pair(&mut heap);

        heap.new_instance(pair).expect("garbage");
        let dead = heap.new_instance(pair).expect("dead");
        heap.set_field(dead, 1, Address::from_usize(0xd << 3));
        heap.new_finalizer(dead, 3).expect("finalizer");

        heap.collect();

        assert_eq!(heap.pending_finalizers(), 0);
        let ready = heap.take_ready_finalizers(3);
        assert_eq!(ready.len(), 1);
        assert_eq!(heap.field(ready[0], 1), Address::from_usize(0xd << 3));
    }

    #[test]
    fn test_stack_chunk_slides_with_frames() {
        let mut heap = create_test_heap();
        let pair = define_pair(&mut heap);

        heap.new_instance(pair).expect("garbage");
        let method = heap
            .new_method(1, OopMap::from_fields(&[0]), &[1, 2, 3, 4])
            .expect("method");
        heap.set_global(0, method);
        heap.new_array(heap.klasses().word_array, 7).expect("garbage");
        let chunk = heap.new_stack_chunk(24).expect("chunk");
        heap.register_thread(9, chunk);
        let method = heap.global(0);

        let f0 = heap.push_frame(chunk, method, 1).expect("frame 0");
        let f1 = heap.push_frame(chunk, method, 3).expect("frame 1");
        let (f0_offset, f1_offset) = (f0.diff(chunk), f1.diff(chunk));
        let local = heap.new_instance(pair).expect("local");
        heap.set_field(local, 1, Address::from_usize(0x33 << 3));
        unsafe { stack::local_slot(f0, 0).store_address(local) };

        heap.collect();

        let moved = heap.thread_chunks(9)[0];
        assert!(moved < chunk);
        let method = heap.global(0);
        unsafe {
            assert_eq!(stack::last_frame(moved), moved.add(f1_offset));
            let f0 = stack::previous_frame(moved.add(f1_offset));
            assert_eq!(f0, moved.add(f0_offset));
            assert_eq!(stack::method_slot(f0).load_address(), method);
            assert_eq!(stack::ip_slot(f0).load_address(), stack::code_slot(method, 1));
            assert_eq!(
                stack::ip_slot(moved.add(f1_offset)).load_address(),
                stack::code_slot(method, 3)
            );
            let local = stack::local_slot(f0, 0).load_address();
            assert_eq!(heap.field(local, 1), Address::from_usize(0x33 << 3));
        }
    }

    #[test]
    fn test_heap_klasses_and_associations_slide() {
        let mut heap = create_test_heap();
        let pair = define_pair(&mut heap);
        heap.new_instance(pair).expect("garbage");

        let layout = KlassLayout::instance(KlassId::FIRST_USER, 3, OopMap::from_fields(&[0]));
        let klass = heap
            .define_klass(&layout, Address::NULL, Placement::Heap)
            .expect("klass");
        heap.set_global(0, klass);
        heap.new_array(heap.klasses().byte_array, 40).expect("garbage");
        let association = heap.new_association(heap.global(0)).expect("association");
        heap.set_global(1, association);

        let direct = heap.new_object(heap.global(0), 0, Placement::Heap).expect("direct");
        heap.set_global(2, direct);
        let indirect = heap.new_object(heap.global(1), 0, Placement::Heap).expect("indirect");
        heap.set_field(indirect, 0, heap.global(2));
        heap.set_field(indirect, 2, Address::from_usize(0x99 << 3));
        heap.set_global(3, indirect);

        heap.collect();

        let klass = heap.global(0);
        let indirect = heap.global(3);
        assert_eq!(heap.class_of(heap.global(2)).address(), klass);
        assert_eq!(heap.class_of(indirect).address(), klass);
        assert_eq!(unsafe { header::class_or_association(indirect) }, heap.global(1));
        assert_eq!(heap.field(indirect, 0), heap.global(2));
        assert_eq!(heap.field(indirect, 2), Address::from_usize(0x99 << 3));
        assert_eq!(heap.class_of(klass).address(), heap.klasses().metaclass);
    }

    #[test]
    fn test_permanent_objects_are_roots() {
        let mut heap = create_test_heap();
        let pair = define_pair(&mut heap);

        let permanent = heap.new_instance_in(pair, Placement::Permanent).expect("permanent");
        heap.new_instance(pair).expect("garbage");
        let target = heap.new_instance(pair).expect("target");
        heap.set_field(target, 1, Address::from_usize(0x7 << 3));
        heap.set_field(permanent, 0, target);

        heap.collect();

        let target = heap.field(permanent, 0);
        assert_eq!(heap.field(target, 1), Address::from_usize(0x7 << 3));
        assert!(collector(&heap).permanent_space().contains_object(permanent));
        assert!(heap.collector().arena().contains_object(target));
    }
}
