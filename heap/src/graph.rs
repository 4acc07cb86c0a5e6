//! Object-graph copy into a relocatable blob.
//!
//! The subgraph reachable from a root is copied into the idle semi-space
//! with the regular copying path, then serialized as two byte arrays in the
//! live heap:
//!
//! ```text
//! blob:    [root offset][graph words ...]
//! oop map: one bit per graph word that holds a graph-relative pointer
//! ```
//!
//! Pointers into the graph are stored as byte offsets from the graph start.
//! Pointers leaving the graph (ROM, NVM) stay absolute and are not mapped.
//! Weak references and finalizers are copied detached: their referent and
//! list links belong to the source heap's queues and are cleared.
//! The live heap is never mutated beyond the two new arrays: every forwarded
//! original gets its class word back before this returns.

use log::{debug, warn};
use object::{
    Address, Klass, KlassId, Region, WORD_SIZE, allocation_size, block_size, copy_bytes,
    fill_zero, finalizer, header, initialize_object, klass_of, weak_reference, write_field,
};

use crate::{
    BumpAllocator, CopyingCollector, GarbageCollector, HeapError, RootSet,
    system::Protection,
    visit::{ObjectVisitor, relocate_frame_chain, scan_object, walk_blocks},
};

/// A serialized object graph. Both arrays are fresh, unrooted byte arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectGraph {
    pub blob: Address,
    pub oop_map: Address,
    /// Byte offset of the root object pointer from the graph start.
    pub root_offset: usize,
    /// Graph size in bytes, without the root offset word.
    pub size: usize,
}

/// Records every pointer-holding word of the copied graph without
/// changing it.
#[derive(Default)]
struct SlotCollector {
    slots: Vec<Address>,
}

impl ObjectVisitor for SlotCollector {
    fn visit_reference(&mut self, slot: Address) {
        self.slots.push(slot);
    }

    fn visit_internal_pointer(&mut self, slot: Address, _delta: isize) {
        self.slots.push(slot);
    }
}

impl CopyingCollector {
    /// Copies everything reachable from `root` into a self-contained blob.
    ///
    /// Fails with [`HeapError::GraphCopyOutOfMemory`] when the graph does
    /// not fit into the idle semi-space, and with
    /// [`HeapError::OutOfMemory`] when the live heap has no room for the
    /// result. The heap is unchanged in both cases.
    pub fn copy_object_graph(
        &mut self,
        root: Address,
        roots: &RootSet,
        allocator: &mut BumpAllocator,
    ) -> Result<ObjectGraph, HeapError> {
        assert!(self.is_idle(), "re-entrant collection");
        self.ensure_initialized(roots);

        let live = Region::new(self.arena().start, allocator.cursor());
        if !live.contains_object(root) {
            return Err(HeapError::ForeignRoot(root));
        }

        let scratch = self.idle_space();
        self.protect(scratch, Protection::ReadWrite);
        self.begin_copy(live, scratch);
        self.graph.active = true;
        self.graph.overflowed = false;
        self.graph.repair_top = scratch.end;
        self.graph.repair_end = scratch.end;

        let new_root = self.copy_object(root);
        self.copy_non_roots();
        let overflowed = self.graph.overflowed;
        let graph = Region::new(scratch.start, self.cursor);
        let repaired = self.repair();

        let result = if overflowed {
            warn!(
                "graph copy from {root:?} overflowed after {} bytes, {repaired} objects repaired",
                graph.size()
            );
            Err(HeapError::GraphCopyOutOfMemory)
        } else {
            // SAFETY: the graph region holds complete, untagged copies
            unsafe { self.serialize(graph, new_root, allocator) }
        };

        if self.zero_fill {
            // SAFETY: the scratch space holds nothing live
            unsafe { fill_zero(scratch.start, scratch.end) };
        }
        self.protect(scratch, Protection::None);
        self.graph = Default::default();
        self.from = Region::EMPTY;
        result
    }

    /// Restores every original class word recorded in the repair table.
    fn repair(&mut self) -> usize {
        let mut entry = self.graph.repair_top;
        let mut count = 0;
        while entry < self.graph.repair_end {
            // SAFETY: entries were written by copy_object
            unsafe {
                let oop = entry.load_address();
                let word = entry.add_words(1).load();
                header::set_class_word(oop, word);
            }
            entry = entry.add_words(2);
            count += 1;
        }
        self.graph.repair_top = self.graph.repair_end;
        count
    }

    unsafe fn serialize(
        &mut self,
        graph: Region,
        new_root: Address,
        allocator: &mut BumpAllocator,
    ) -> Result<ObjectGraph, HeapError> {
        let mut collector = SlotCollector::default();
        // SAFETY: by contract
        unsafe {
            walk_blocks(graph, |oop| {
                let klass = klass_of(oop);
                collector.visit_reference(header::class_word_slot(oop));
                scan_object(&mut collector, klass, oop);
                match klass.id() {
                    KlassId::LOCAL_ARRAY => relocate_frame_chain(&mut collector, oop, oop, 0),
                    KlassId::WEAK_REFERENCE => {
                        write_field(oop, weak_reference::REFERENT, Address::NULL);
                        write_field(oop, weak_reference::NEXT, Address::NULL);
                    }
                    KlassId::FINALIZER => {
                        write_field(oop, finalizer::OBJECT, Address::NULL);
                        write_field(oop, finalizer::NEXT, Address::NULL);
                    }
                    _ => {}
                }
                block_size(klass, oop)
            });
        }

        let words = graph.words();
        let mut map = vec![0u8; words.div_ceil(8)];
        for slot in collector.slots {
            let index = slot.diff(graph.start) / WORD_SIZE;
            if map[index / 8] & (1 << (index % 8)) != 0 {
                continue;
            }
            // SAFETY: slot is a word of the graph
            unsafe {
                let value = slot.load_address();
                if value.is_null() || value < graph.start || value > graph.end {
                    continue;
                }
                slot.store(value.diff(graph.start));
            }
            map[index / 8] |= 1 << (index % 8);
        }

        let byte_array = self.klasses.byte_array;
        // SAFETY: the well-known klasses are initialized
        let klass = unsafe { Klass::from_address(byte_array) };
        let blob_length = WORD_SIZE + graph.size();
        let requested = allocation_size(klass, blob_length) + allocation_size(klass, map.len());
        if allocator.remaining() < requested {
            return Err(HeapError::OutOfMemory { requested });
        }

        let root_offset = new_root.diff(graph.start);
        // SAFETY: both blocks were reserved from the allocator above
        unsafe {
            let block = allocator
                .allocate(allocation_size(klass, blob_length))
                .ok_or(HeapError::OutOfMemory { requested })?;
            let blob = initialize_object(block, byte_array, klass, blob_length);
            blob.store(root_offset);
            copy_bytes(graph.start, blob.add(WORD_SIZE), graph.size());

            let block = allocator
                .allocate(allocation_size(klass, map.len()))
                .ok_or(HeapError::OutOfMemory { requested })?;
            let oop_map = initialize_object(block, byte_array, klass, map.len());
            copy_bytes(Address::from_ptr(map.as_ptr()), oop_map, map.len());

            debug!(
                "graph copy: {} bytes, {} pointer words, root at offset {root_offset}",
                graph.size(),
                map.iter().map(|b| b.count_ones()).sum::<u32>()
            );

            Ok(ObjectGraph {
                blob,
                oop_map,
                root_offset,
                size: graph.size(),
            })
        }
    }
}

/// Reads whether graph word `index` holds a graph-relative pointer.
///
/// # Safety
/// `oop_map` must be the map array of a serialized graph.
pub unsafe fn is_pointer_word(oop_map: Address, index: usize) -> bool {
    // SAFETY: by contract
    unsafe {
        let length = header::array_length(oop_map);
        if index / 8 >= length {
            return false;
        }
        let byte = *oop_map.add(index / 8).as_ptr::<u8>();
        byte & (1 << (index % 8)) != 0
    }
}
