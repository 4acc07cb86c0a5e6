//! Two semi-space Cheney collector.
//!
//! The arena is one half of the mapping. A collection toggles the halves,
//! copies everything reachable into the idle half breadth first and leaves
//! the old half empty. Forwarded originals carry `new_oop | 1` in their class
//! word until the old half is reclaimed.

use std::time::Instant;

use log::{debug, trace, warn};
use object::{
    Address, Klass, KlassId, Region, block_size, block_start, copy_bytes, fill_zero, finalizer,
    header, model::field_slot, read_field, resolve_klass,
};

use crate::{
    BumpAllocator, GarbageCollector, GcPhase, GcTimings, HeapError, HeapSettings, MappedMemory,
    RootSet, WellKnownKlasses,
    forwarding::{forward_word, forwardee, is_forwarded},
    system::Protection,
    visit::{ObjectVisitor, relocate_frame_chain, scan_object, walk_blocks},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CopyState {
    Idle,
    Toggled,
    RootsCopied,
    NonRootsCopied,
    Finalized,
}

/// Bookkeeping of an object-graph copy. Originals forwarded into the idle
/// half are recorded as `[oop, class word]` pairs growing down from the end
/// of that half.
#[cfg(feature = "graph-copy")]
#[derive(Debug, Default)]
pub(crate) struct GraphCopyState {
    pub(crate) active: bool,
    pub(crate) repair_top: Address,
    pub(crate) repair_end: Address,
    pub(crate) overflowed: bool,
}

pub struct CopyingCollector {
    memory: MappedMemory,
    spaces: [Region; 2],
    current: usize,
    state: CopyState,
    /// Occupied part of the space being evacuated.
    pub(crate) from: Region,
    pub(crate) cursor: Address,
    limit: Address,
    scan: Address,
    pub(crate) klasses: WellKnownKlasses,
    pub(crate) zero_fill: bool,
    pub(crate) protect_unused: bool,
    last_top: Address,
    timings: GcTimings,
    #[cfg(feature = "graph-copy")]
    pub(crate) graph: GraphCopyState,
}

impl CopyingCollector {
    pub fn new(settings: &HeapSettings) -> Result<Self, HeapError> {
        settings.validate()?;
        let memory = MappedMemory::new(settings.heap_size)?;
        let half = settings.heap_size / 2;
        let start = memory.start();
        let spaces = [
            Region::new(start, start.add(half)),
            Region::new(start.add(half), start.add(2 * half)),
        ];
        let collector = Self {
            memory,
            spaces,
            current: 0,
            state: CopyState::Idle,
            from: Region::EMPTY,
            cursor: Address::NULL,
            limit: Address::NULL,
            scan: Address::NULL,
            klasses: WellKnownKlasses::default(),
            zero_fill: settings.zero_fill_reclaimed,
            protect_unused: settings.protect_unused_space,
            last_top: spaces[0].start,
            timings: GcTimings::default(),
            #[cfg(feature = "graph-copy")]
            graph: GraphCopyState::default(),
        };
        collector.protect(collector.idle_space(), Protection::None);
        debug!(
            "copying collector: two semi-spaces of {} bytes at {:?}",
            half, collector.memory
        );
        Ok(collector)
    }

    #[inline(always)]
    pub(crate) fn idle_space(&self) -> Region {
        self.spaces[self.current ^ 1]
    }

    pub(crate) fn protect(&self, space: Region, protection: Protection) {
        if !self.protect_unused {
            return;
        }
        // SAFETY: the idle half holds no live object
        let ok = unsafe { self.memory.protect(space, protection) };
        if !ok {
            warn!("failed to change protection of {space:?}");
        }
    }

    /// Picks up the well-known klasses the first time they are needed.
    pub(crate) fn ensure_initialized(&mut self, roots: &RootSet) {
        if !self.klasses.is_initialized() {
            self.klasses = *roots.klasses();
        }
    }

    fn transition(&mut self, next: CopyState) {
        trace!("copying collector: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    #[inline(always)]
    pub(crate) fn is_idle(&self) -> bool {
        self.state == CopyState::Idle
    }

    /// Prepares copying of `from` into `to`.
    pub(crate) fn begin_copy(&mut self, from: Region, to: Region) {
        self.from = from;
        self.cursor = to.start;
        self.scan = to.start;
        self.limit = to.end;
    }

    /// Class word of `oop` as it was before the collection started.
    #[inline]
    fn original_class_word(&self, oop: Address) -> usize {
        // SAFETY: oop is an object pointer seen during this collection
        unsafe {
            let word = header::class_word(oop);
            if is_forwarded(word) {
                header::class_word(forwardee(word))
            } else {
                word
            }
        }
    }

    #[inline]
    pub(crate) fn klass_of_coa(&self, coa: Address) -> Klass {
        let coa_class = Address::from_usize(self.original_class_word(coa));
        // SAFETY: class and association bodies are never overwritten while
        // copying
        unsafe { resolve_klass(coa, coa_class) }
    }

    #[inline]
    fn is_live(&self, oop: Address) -> bool {
        // SAFETY: pointers inside from-space are object pointers
        oop.is_null() || !self.from.contains_object(oop) || is_forwarded(unsafe { header::class_word(oop) })
    }

    /// Current address of a live object.
    #[inline]
    fn translate(&self, oop: Address) -> Address {
        if oop.is_null() || !self.from.contains_object(oop) {
            return oop;
        }
        // SAFETY: oop is in from-space
        let word = unsafe { header::class_word(oop) };
        debug_assert!(is_forwarded(word), "{oop:?} was not copied");
        forwardee(word)
    }

    fn reserve(&mut self, size: usize) -> Option<Address> {
        #[cfg(feature = "graph-copy")]
        let limit = if self.graph.active {
            self.graph.repair_top.sub_words(2)
        } else {
            self.limit
        };
        #[cfg(not(feature = "graph-copy"))]
        let limit = self.limit;

        let block = self.cursor;
        if block.as_usize() + size > limit.as_usize() {
            return None;
        }
        self.cursor = block.add(size);
        Some(block)
    }

    /// Copies `oop` into to-space unless it is outside from-space or
    /// already copied, and returns its new address.
    pub(crate) fn copy_object(&mut self, oop: Address) -> Address {
        if oop.is_null() || !self.from.contains_object(oop) {
            return oop;
        }
        // SAFETY: oop is an object pointer inside from-space
        let word = unsafe { header::class_word(oop) };
        if is_forwarded(word) {
            return forwardee(word);
        }

        let klass = self.klass_of_coa(Address::from_usize(word));
        // SAFETY: the original block is intact until it is forwarded
        let size = unsafe { block_size(klass, oop) };
        let block = block_start(klass, oop);

        let Some(new_block) = self.reserve(size) else {
            #[cfg(feature = "graph-copy")]
            {
                if self.graph.active {
                    self.graph.overflowed = true;
                    return oop;
                }
            }
            panic!("to-space exhausted copying {size} bytes at {oop:?}");
        };
        let new_oop = new_block.add(oop.diff(block));

        // SAFETY: both blocks are `size` bytes and do not overlap
        unsafe {
            copy_bytes(block, new_block, size);
            #[cfg(feature = "graph-copy")]
            {
                if self.graph.active {
                    self.graph.repair_top = self.graph.repair_top.sub_words(2);
                    self.graph.repair_top.store_address(oop);
                    self.graph.repair_top.add_words(1).store(word);
                }
            }
            header::set_class_word(oop, forward_word(new_oop));
            if klass.id() == KlassId::LOCAL_ARRAY {
                relocate_frame_chain(self, oop, new_oop, new_oop.delta(oop));
            }
        }
        new_oop
    }

    #[inline]
    fn copy_slot(&mut self, slot: &mut Address) {
        *slot = self.copy_object(*slot);
    }

    /// Scans to-space from the scan pointer until it catches up with the
    /// copy cursor.
    pub(crate) fn copy_non_roots(&mut self) {
        while self.scan < self.cursor {
            #[cfg(feature = "graph-copy")]
            {
                if self.graph.overflowed {
                    break;
                }
            }
            // SAFETY: to-space below the cursor holds complete copies
            unsafe {
                let oop = header::oop_for_block(self.scan);
                self.visit_reference(header::class_word_slot(oop));
                let klass = self.klass_of_coa(header::class_or_association(oop));
                scan_object(self, klass, oop);
                self.scan = self.scan.add(block_size(klass, oop));
            }
        }
    }

    fn copy_roots(&mut self, roots: &mut RootSet) {
        roots.visit_roots(&mut |slot| self.copy_slot(slot));

        let mut klasses = self.klasses;
        klasses.visit(&mut |slot| self.copy_slot(slot));
        self.klasses = klasses;

        // objects in stable spaces never move but may refer into the heap
        for &space in roots.stable_spaces() {
            // SAFETY: stable spaces are densely packed with objects
            unsafe {
                walk_blocks(space, |oop| {
                    let klass = self.klass_of_coa(header::class_or_association(oop));
                    self.visit_reference(header::class_word_slot(oop));
                    scan_object(self, klass, oop);
                    block_size(klass, oop)
                });
            }
        }

        // ready finalizers keep their objects and successors alive
        let heads: Vec<Address> = roots.queues().ready.values().copied().collect();
        for head in heads {
            let mut node = head;
            while !node.is_null() {
                self.visit_reference(field_slot(node, finalizer::OBJECT));
                self.visit_reference(field_slot(node, finalizer::NEXT));
                // SAFETY: node is a finalizer in to-space
                node = unsafe { read_field(node, finalizer::NEXT) };
            }
        }
    }

    /// Routes pending finalizers whose object did not survive tracing to
    /// the ready queue of their owner. Every node and object is kept alive.
    fn process_finalizers(&mut self, roots: &mut RootSet) {
        // SAFETY: the pending list is intact until it is rebuilt below
        let mut snapshot = unsafe { roots.queues().snapshot_finalizers(|object| self.is_live(object)) };
        if snapshot.is_empty() {
            return;
        }

        for entry in &mut snapshot {
            entry.0 = self.copy_object(entry.0);
            self.visit_reference(field_slot(entry.0, finalizer::OBJECT));
        }
        self.copy_non_roots();

        // SAFETY: every node was copied into to-space
        let ready = unsafe { roots.queues_mut().route_finalizers(&snapshot) };
        trace!("finalizers: {} pending, {} ready", snapshot.len() - ready, ready);
    }

    /// Drops unreachable weak references, clears referents that did not
    /// survive and rewrites the others.
    fn process_weak_references(&mut self, roots: &mut RootSet) {
        // SAFETY: originals keep their bodies until from-space is reclaimed
        let (kept, cleared) = unsafe {
            roots
                .queues_mut()
                .filter_weak_references(|oop| self.is_live(oop).then(|| self.translate(oop)))
        };
        trace!("weak references: {kept} kept, {cleared} cleared");
    }

    fn toggle(&mut self, top: Address) {
        let from_space = self.spaces[self.current];
        self.current ^= 1;
        let to_space = self.spaces[self.current];
        self.protect(to_space, Protection::ReadWrite);
        self.begin_copy(Region::new(from_space.start, top), to_space);
        self.transition(CopyState::Toggled);
    }

    fn finalize(&mut self, allocator: &mut BumpAllocator) {
        let from_space = self.idle_space();
        let to_space = self.spaces[self.current];
        if self.zero_fill {
            // SAFETY: nothing live remains in the old half
            unsafe { fill_zero(from_space.start, from_space.end) };
        }
        self.protect(from_space, Protection::None);
        allocator.set_allocation_parameters(to_space.start, self.cursor, to_space.end, to_space.end);
        self.last_top = self.cursor;
        self.from = Region::EMPTY;
        self.transition(CopyState::Finalized);
    }
}

impl ObjectVisitor for CopyingCollector {
    #[inline]
    fn visit_reference(&mut self, slot: Address) {
        // SAFETY: slot is a reference word of a scanned object
        unsafe {
            let value = slot.load_address();
            let copied = self.copy_object(value);
            if copied != value {
                slot.store_address(copied);
            }
        }
    }
}

impl GarbageCollector for CopyingCollector {
    fn collect(&mut self, roots: &mut RootSet, allocator: &mut BumpAllocator, _force_full: bool) -> bool {
        assert!(self.is_idle(), "re-entrant collection");
        self.ensure_initialized(roots);
        let start = Instant::now();
        let top = allocator.cursor();
        let used_before = top.diff(self.spaces[self.current].start);

        let phase = Instant::now();
        self.toggle(top);
        self.copy_roots(roots);
        self.transition(CopyState::RootsCopied);
        self.timings.record(GcPhase::Roots, phase.elapsed());

        let phase = Instant::now();
        self.copy_non_roots();
        self.transition(CopyState::NonRootsCopied);
        self.timings.record(GcPhase::Trace, phase.elapsed());

        let phase = Instant::now();
        self.process_finalizers(roots);
        self.process_weak_references(roots);
        self.timings.record(GcPhase::References, phase.elapsed());

        let phase = Instant::now();
        self.finalize(allocator);
        self.timings.record(GcPhase::Reclaim, phase.elapsed());
        self.transition(CopyState::Idle);

        let live = self.cursor.diff(self.spaces[self.current].start);
        let reclaimed = used_before.saturating_sub(live);
        let elapsed = start.elapsed();
        self.timings.finish_collection(elapsed, reclaimed);
        debug!(
            "copying collection #{}: {} bytes live, {} bytes reclaimed in {:?}",
            self.timings.collections, live, reclaimed, elapsed
        );
        true
    }

    fn post_collection(&mut self, roots: &mut RootSet) {
        #[cfg(feature = "gc-verify")]
        {
            let live = Region::new(self.spaces[self.current].start, self.last_top);
            // SAFETY: the arena below the allocation top is densely packed
            unsafe { crate::verify::verify_heap(&[live], roots) };
        }
        #[cfg(not(feature = "gc-verify"))]
        let _ = roots;
    }

    fn free_memory(&self, allocation_top: Address) -> usize {
        self.spaces[self.current].end.diff(allocation_top)
    }

    fn total_memory(&self) -> usize {
        self.spaces[0].size()
    }

    fn arena(&self) -> Region {
        self.spaces[self.current]
    }

    fn timings(&self) -> &GcTimings {
        &self.timings
    }
}
