//! Managed heap facade.
//!
//! Owns the static spaces (ROM, NVM), the root set, the bump allocator and
//! the collector picked by [`HeapSettings::collector`]. The well-known
//! klasses are bootstrapped into ROM when the heap is created.
//!
//! Every allocating call may run a collection. Addresses held across such
//! a call must be re-read from a root afterwards; arguments of the
//! allocating calls themselves are protected and updated internally.

use std::io::{self, Write};

use log::{debug, info, trace};
use object::{
    Address, KLASS_OOP_MAP, Klass, KlassId, KlassLayout, OopMap, Region, WORD_SIZE, align_word,
    allocation_size, association, body_size, fill_zero, finalizer, header, initialize_object, klass,
    klass_of, read_field, resolve_klass, stack, weak_reference, write_field,
};

use crate::{
    BumpAllocator, Collector, CollectorKind, GarbageCollector, GcTimings, HeapError, HeapResult,
    HeapSettings, MappedMemory, RootSet, ThreadStack, WellKnownKlasses,
};

/// Where a new object is placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Placement {
    /// The collected arena.
    #[default]
    Heap,
    /// Never collected, scanned as roots. Mark-compact only.
    Permanent,
    /// Read-only image space.
    Rom,
    /// Persistent object space.
    Nvm,
}

const ROM_SPACE: usize = 0;
const NVM_SPACE: usize = 1;

/// A bump-allocated space that is never collected.
struct StaticSpace {
    memory: MappedMemory,
    top: Address,
}

impl StaticSpace {
    fn new(size: usize) -> HeapResult<Self> {
        let memory = MappedMemory::new(size)?;
        let top = memory.start();
        Ok(Self { memory, top })
    }

    fn region(&self) -> Region {
        self.memory.region()
    }

    fn occupied(&self) -> Region {
        Region::new(self.memory.start(), self.top)
    }

    fn allocate(&mut self, bytes: usize) -> Option<Address> {
        let size = align_word(bytes);
        if size > self.memory.end().diff(self.top) {
            return None;
        }
        let block = self.top;
        self.top = block.add(size);
        Some(block)
    }
}

pub struct Heap {
    settings: HeapSettings,
    rom: StaticSpace,
    nvm: StaticSpace,
    roots: RootSet,
    allocator: BumpAllocator,
    collector: Collector,
    next_hash: usize,
}

impl Heap {
    pub fn new(settings: HeapSettings) -> HeapResult<Self> {
        settings.validate()?;
        let rom = StaticSpace::new(settings.rom_size)?;
        let nvm = StaticSpace::new(settings.nvm_size)?;
        let collector = Collector::new(&settings, rom.region(), nvm.region())?;

        let arena = collector.arena();
        let mut allocator = BumpAllocator::new();
        allocator.set_allocation_parameters(arena.start, arena.start, arena.end, arena.end);

        let mut heap = Self {
            roots: RootSet::new(settings.global_roots),
            settings,
            rom,
            nvm,
            allocator,
            collector,
            next_hash: 1,
        };
        heap.bootstrap()?;
        info!(
            "heap ready: {:?} collector, {} bytes collectable, ROM {:?}, NVM {:?}",
            heap.collector.kind(),
            heap.total_memory(),
            heap.rom.region(),
            heap.nvm.region()
        );
        Ok(heap)
    }

    /// Builds the self-describing metaclass and the well-known klasses in
    /// ROM.
    fn bootstrap(&mut self) -> HeapResult<()> {
        let layout = KlassLayout::instance(KlassId::KLASS, klass::field::BODY_WORDS, KLASS_OOP_MAP);
        let size = (header::INSTANCE_HEADER_WORDS + klass::field::BODY_WORDS) * WORD_SIZE;
        let block = self
            .rom
            .allocate(size)
            .ok_or(HeapError::OutOfMemory { requested: size })?;
        // SAFETY: block is fresh ROM memory of the metaclass size
        let metaclass = unsafe {
            let oop = block.add_words(header::INSTANCE_HEADER_WORDS);
            fill_zero(block, block.add(size));
            Klass::initialize(oop, &layout, Address::NULL);
            header::set_class_word(oop, oop.as_usize());
            oop
        };

        let mut klasses = WellKnownKlasses {
            metaclass,
            ..Default::default()
        };
        self.roots.set_klasses(klasses);

        let layouts = [
            KlassLayout::instance(
                KlassId::OBJECT_ASSOCIATION,
                association::WORDS,
                OopMap::from_fields(&[association::KLASS]),
            ),
            KlassLayout::array(KlassId::LOCAL_ARRAY, WORD_SIZE, false),
            KlassLayout::array(KlassId::METHOD, WORD_SIZE, false),
            KlassLayout::instance(KlassId::WEAK_REFERENCE, weak_reference::WORDS, OopMap::EMPTY),
            KlassLayout::instance(KlassId::FINALIZER, finalizer::WORDS, OopMap::EMPTY),
            KlassLayout::array(KlassId::BYTE_ARRAY, 1, false),
            KlassLayout::array(KlassId::WORD_ARRAY, WORD_SIZE, false),
            KlassLayout::array(KlassId::OBJECT_ARRAY, WORD_SIZE, true),
        ];
        for layout in &layouts {
            let address = self.new_klass(layout, Address::NULL, Placement::Rom)?;
            let slot = match layout.id {
                KlassId::OBJECT_ASSOCIATION => &mut klasses.association,
                KlassId::LOCAL_ARRAY => &mut klasses.local_array,
                KlassId::METHOD => &mut klasses.method,
                KlassId::WEAK_REFERENCE => &mut klasses.weak_reference,
                KlassId::FINALIZER => &mut klasses.finalizer,
                KlassId::BYTE_ARRAY => &mut klasses.byte_array,
                KlassId::WORD_ARRAY => &mut klasses.word_array,
                _ => &mut klasses.object_array,
            };
            *slot = address;
        }
        self.roots.set_klasses(klasses);
        self.sync_stable_spaces();
        debug!("bootstrapped well-known klasses: {klasses:?}");
        Ok(())
    }

    fn sync_stable_spaces(&mut self) {
        self.roots.set_stable_space(ROM_SPACE, self.rom.occupied());
        self.roots.set_stable_space(NVM_SPACE, self.nvm.occupied());
    }

    // ── Allocation ────────────────────────────────────────────────────

    /// Reserves an uninitialized block of `bytes`, collecting once if the
    /// arena is exhausted. The caller must write a well-formed object into
    /// the block before the next collection.
    pub fn allocate(&mut self, bytes: usize, placement: Placement) -> HeapResult<Address> {
        let block = match placement {
            Placement::Heap => {
                if let Some(block) = self.allocator.allocate(bytes) {
                    return Ok(block);
                }
                debug!("arena exhausted allocating {bytes} bytes, collecting");
                self.collect();
                self.allocator.allocate(bytes)
            }
            Placement::Permanent => {
                if self.collector.kind() == CollectorKind::Copying {
                    return Err(HeapError::PlacementUnavailable);
                }
                self.collector.allocate_permanent(bytes)
            }
            Placement::Rom => self.rom.allocate(bytes),
            Placement::Nvm => self.nvm.allocate(bytes),
        };
        block.ok_or(HeapError::OutOfMemory { requested: bytes })
    }

    /// Layout of objects whose class word is `coa`.
    fn layout_of(&self, coa: Address) -> HeapResult<Klass> {
        if coa.is_null() {
            return Err(HeapError::InvalidLayout("null class pointer"));
        }
        // SAFETY: coa is an object; its class word is untagged outside collections
        let coa_class = unsafe { header::class_or_association(coa) };
        let klasses = self.roots.klasses();
        if coa_class != klasses.metaclass && coa_class != klasses.association {
            return Err(HeapError::InvalidLayout(
                "class pointer is neither a klass nor an association",
            ));
        }
        // SAFETY: checked above
        Ok(unsafe { resolve_klass(coa, coa_class) })
    }

    /// Allocates and initializes an object. `live` holds addresses the
    /// caller still needs; they are updated if a collection moves them.
    fn instantiate(
        &mut self,
        coa: Address,
        length: usize,
        placement: Placement,
        live: &mut [Address],
    ) -> HeapResult<Address> {
        let klass = self.layout_of(coa)?;
        if klass.is_array() {
            let largest_space = self
                .settings
                .heap_size
                .max(self.settings.permanent_size)
                .max(self.settings.rom_size)
                .max(self.settings.nvm_size);
            let fits = length <= header::MAX_ARRAY_LENGTH
                && length
                    .checked_mul(klass.element_size())
                    .is_some_and(|bytes| bytes <= largest_space);
            if !fits {
                return Err(HeapError::InvalidLayout("array length out of range"));
            }
        }
        let size = allocation_size(klass, length);

        self.roots.push_scratch(coa);
        for &value in live.iter() {
            self.roots.push_scratch(value);
        }
        let block = self.allocate(size, placement);
        for value in live.iter_mut().rev() {
            *value = self.roots.pop_scratch();
        }
        let coa = self.roots.pop_scratch();
        let block = block?;

        // SAFETY: block is fresh and sized for the klass of coa
        let oop = unsafe { initialize_object(block, coa, self.layout_of(coa)?, length) };
        if matches!(placement, Placement::Rom | Placement::Nvm) {
            self.sync_stable_spaces();
        }
        trace!("allocated {oop:?} ({size} bytes) in {placement:?}");
        Ok(oop)
    }

    /// Allocates an object whose class word is `coa`, a klass or an
    /// association. `length` is ignored for instances.
    pub fn new_object(&mut self, coa: Address, length: usize, placement: Placement) -> HeapResult<Address> {
        self.instantiate(coa, length, placement, &mut [])
    }

    #[inline]
    pub fn new_instance(&mut self, klass: Address) -> HeapResult<Address> {
        self.new_object(klass, 0, Placement::Heap)
    }

    #[inline]
    pub fn new_instance_in(&mut self, klass: Address, placement: Placement) -> HeapResult<Address> {
        self.new_object(klass, 0, placement)
    }

    #[inline]
    pub fn new_array(&mut self, klass: Address, length: usize) -> HeapResult<Address> {
        self.new_object(klass, length, Placement::Heap)
    }

    #[inline]
    pub fn new_array_in(&mut self, klass: Address, length: usize, placement: Placement) -> HeapResult<Address> {
        self.new_object(klass, length, placement)
    }

    fn new_klass(&mut self, layout: &KlassLayout, super_klass: Address, placement: Placement) -> HeapResult<Address> {
        let metaclass = self.roots.klasses().metaclass;
        let mut live = [super_klass];
        let oop = self.instantiate(metaclass, 0, placement, &mut live)?;
        // SAFETY: oop is a fresh metaclass instance
        unsafe { Klass::initialize(oop, layout, live[0]) };
        Ok(oop)
    }

    /// Creates a user klass. Well-known ids are reserved for the bootstrap.
    pub fn define_klass(
        &mut self,
        layout: &KlassLayout,
        super_klass: Address,
        placement: Placement,
    ) -> HeapResult<Address> {
        layout.validate().map_err(HeapError::InvalidLayout)?;
        if layout.id.is_well_known() {
            return Err(HeapError::InvalidLayout("klass id is reserved"));
        }
        self.new_klass(layout, super_klass, placement)
    }

    /// Creates an association standing in for `klass` in class words.
    pub fn new_association(&mut self, klass: Address) -> HeapResult<Address> {
        let coa = self.roots.klasses().association;
        let mut live = [klass];
        let oop = self.instantiate(coa, 0, Placement::Heap, &mut live)?;
        let hash = self.next_hash;
        self.next_hash += 1;
        // SAFETY: oop is a fresh association
        unsafe {
            write_field(oop, association::KLASS, live[0]);
            write_field(oop, association::HASH, Address::from_usize(hash));
        }
        Ok(oop)
    }

    /// Creates a weak reference to `referent` and links it into the weak
    /// list.
    pub fn new_weak_reference(&mut self, referent: Address) -> HeapResult<Address> {
        let coa = self.roots.klasses().weak_reference;
        let mut live = [referent];
        let oop = self.instantiate(coa, 0, Placement::Heap, &mut live)?;
        let queues = self.roots.queues_mut();
        // SAFETY: oop is a fresh weak reference
        unsafe {
            write_field(oop, weak_reference::REFERENT, live[0]);
            write_field(oop, weak_reference::NEXT, queues.weak_head);
        }
        queues.weak_head = oop;
        Ok(oop)
    }

    /// Registers `object` for finalization on behalf of isolate `owner`.
    pub fn new_finalizer(&mut self, object: Address, owner: u32) -> HeapResult<Address> {
        let coa = self.roots.klasses().finalizer;
        let mut live = [object];
        let oop = self.instantiate(coa, 0, Placement::Heap, &mut live)?;
        let queues = self.roots.queues_mut();
        // SAFETY: oop is a fresh finalizer
        unsafe {
            write_field(oop, finalizer::OBJECT, live[0]);
            write_field(oop, finalizer::NEXT, queues.finalizer_head);
            write_field(oop, finalizer::OWNER, Address::from_usize(owner as usize));
        }
        queues.finalizer_head = oop;
        Ok(oop)
    }

    /// Creates a method with `local_count` locals, of which those in
    /// `locals` hold references.
    pub fn new_method(&mut self, local_count: usize, locals: OopMap, code: &[usize]) -> HeapResult<Address> {
        if local_count > stack::MAX_LOCALS || locals.extent() > local_count {
            return Err(HeapError::InvalidLayout("local map exceeds the local count"));
        }
        let coa = self.roots.klasses().method;
        let oop = self.new_object(coa, stack::method::CODE + code.len(), Placement::Heap)?;
        // SAFETY: oop is a word array of the method size
        unsafe { stack::initialize_method(oop, local_count, locals, code) };
        Ok(oop)
    }

    /// Creates an empty stack chunk of `words` body words.
    pub fn new_stack_chunk(&mut self, words: usize) -> HeapResult<Address> {
        if words < stack::FIRST_FRAME + stack::FRAME_HEADER_WORDS {
            return Err(HeapError::InvalidLayout("stack chunk cannot hold a frame"));
        }
        let coa = self.roots.klasses().local_array;
        self.new_object(coa, words, Placement::Heap)
    }

    /// Pushes a frame running `method` at code word `ip`. Does not allocate.
    pub fn push_frame(&mut self, chunk: Address, method: Address, ip: usize) -> HeapResult<Address> {
        debug_assert_eq!(self.class_of(chunk).id(), KlassId::LOCAL_ARRAY);
        debug_assert_eq!(self.class_of(method).id(), KlassId::METHOD);
        // SAFETY: chunk and method have the checked klasses
        unsafe {
            stack::push_frame(chunk, method, ip).ok_or_else(|| HeapError::OutOfMemory {
                requested: (stack::FRAME_HEADER_WORDS + stack::local_count(method)) * WORD_SIZE,
            })
        }
    }

    // ── Object access ─────────────────────────────────────────────────

    fn body_words(&self, oop: Address) -> usize {
        // SAFETY: oop is a live object
        unsafe { body_size(klass_of(oop), oop) / WORD_SIZE }
    }

    /// Body word `index` of `oop`.
    pub fn field(&self, oop: Address, index: usize) -> Address {
        assert!(index < self.body_words(oop), "field {index} out of bounds for {oop:?}");
        // SAFETY: bounds checked above
        unsafe { read_field(oop, index) }
    }

    pub fn set_field(&mut self, oop: Address, index: usize, value: Address) {
        assert!(index < self.body_words(oop), "field {index} out of bounds for {oop:?}");
        // SAFETY: bounds checked above
        unsafe { write_field(oop, index, value) }
    }

    #[inline]
    pub fn global(&self, index: usize) -> Address {
        self.roots.global_root(index)
    }

    #[inline]
    pub fn set_global(&mut self, index: usize, value: Address) {
        self.roots.set_global_root(index, value);
    }

    pub fn class_of(&self, oop: Address) -> Klass {
        // SAFETY: oop is a live object
        unsafe { klass_of(oop) }
    }

    #[inline]
    pub fn allocation_top(&self) -> Address {
        self.allocator.cursor()
    }

    // ── Threads ───────────────────────────────────────────────────────

    pub fn register_thread(&self, id: u32, chunk: Address) {
        self.roots.register_thread(id, chunk);
    }

    pub fn unregister_thread(&self, id: u32) -> Option<ThreadStack> {
        self.roots.unregister_thread(id)
    }

    pub fn thread_chunks(&self, id: u32) -> Vec<Address> {
        self.roots.thread_chunks(id)
    }

    // ── Collection ────────────────────────────────────────────────────

    /// Runs a full collection.
    pub fn collect(&mut self) -> bool {
        let collected = self.collector.collect(&mut self.roots, &mut self.allocator, false);
        self.collector.post_collection(&mut self.roots);
        collected
    }

    pub fn free_memory(&self) -> usize {
        self.collector.free_memory(self.allocator.cursor())
    }

    pub fn total_memory(&self) -> usize {
        self.collector.total_memory()
    }

    pub fn timings(&self) -> &GcTimings {
        self.collector.timings()
    }

    pub fn dump_timings(&self, out: &mut dyn Write) -> io::Result<()> {
        self.collector.dump_timings(out)
    }

    // ── Reference queues ──────────────────────────────────────────────

    /// Removes the ready queue of `owner` and returns the objects to
    /// finalize, most recently queued first.
    pub fn take_ready_finalizers(&mut self, owner: u32) -> Vec<Address> {
        let Some(head) = self.roots.queues_mut().ready.remove(&owner) else {
            return Vec::new();
        };
        let mut objects = Vec::new();
        let mut node = head;
        while !node.is_null() {
            // SAFETY: ready queues link finalizer objects
            unsafe {
                objects.push(read_field(node, finalizer::OBJECT));
                node = read_field(node, finalizer::NEXT);
            }
        }
        objects
    }

    pub fn pending_finalizers(&self) -> usize {
        // SAFETY: the list is intact outside collections
        unsafe { self.roots.queues().pending_finalizers().len() }
    }

    pub fn weak_referent(&self, reference: Address) -> Address {
        debug_assert_eq!(self.class_of(reference).id(), KlassId::WEAK_REFERENCE);
        // SAFETY: reference is a weak reference
        unsafe { read_field(reference, weak_reference::REFERENT) }
    }

    /// Weak references currently listed, most recent first.
    pub fn weak_references(&self) -> Vec<Address> {
        // SAFETY: the list is intact outside collections
        unsafe { self.roots.queues().weak_references() }
    }

    // ── Graph copy ────────────────────────────────────────────────────

    /// Serializes everything reachable from `root`. Retries once after a
    /// collection when the result does not fit into the arena.
    #[cfg(feature = "graph-copy")]
    pub fn copy_object_graph(&mut self, root: Address) -> HeapResult<crate::ObjectGraph> {
        match self.try_copy_object_graph(root) {
            Err(HeapError::OutOfMemory { requested }) => {
                debug!("graph copy needs {requested} bytes, collecting");
                self.roots.push_scratch(root);
                self.collect();
                let root = self.roots.pop_scratch();
                self.try_copy_object_graph(root)
            }
            result => result,
        }
    }

    #[cfg(feature = "graph-copy")]
    fn try_copy_object_graph(&mut self, root: Address) -> HeapResult<crate::ObjectGraph> {
        match &mut self.collector {
            Collector::Copying(collector) => {
                collector.copy_object_graph(root, &self.roots, &mut self.allocator)
            }
            Collector::MarkCompact(_) => Err(HeapError::Unsupported(CollectorKind::MarkCompact)),
        }
    }

    // ── Accessors ─────────────────────────────────────────────────────

    #[inline]
    pub fn settings(&self) -> &HeapSettings {
        &self.settings
    }

    #[inline]
    pub fn klasses(&self) -> &WellKnownKlasses {
        self.roots.klasses()
    }

    #[inline]
    pub fn roots(&self) -> &RootSet {
        &self.roots
    }

    #[inline]
    pub fn roots_mut(&mut self) -> &mut RootSet {
        &mut self.roots
    }

    #[inline]
    pub fn collector(&self) -> &Collector {
        &self.collector
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_settings() -> HeapSettings {
        HeapSettings::copying(64 * 1024)
    }

    fn create_test_heap() -> Heap {
        Heap::new(create_test_settings()).expect("heap")
    }

    fn define_pair(heap: &mut Heap) -> Address {
        let layout = KlassLayout::instance(KlassId::FIRST_USER, 2, OopMap::from_fields(&[0]));
        heap.define_klass(&layout, Address::NULL, Placement::Rom)
            .expect("klass")
    }

    #[test]
    fn test_bootstrap_places_well_known_klasses_in_rom() {
        let heap = create_test_heap();
        let klasses = *heap.klasses();
        let rom = heap.roots().stable_spaces()[ROM_SPACE];

        assert_eq!(heap.class_of(klasses.metaclass).address(), klasses.metaclass);
        assert_eq!(heap.class_of(klasses.metaclass).id(), KlassId::KLASS);
        for id in [
            KlassId::OBJECT_ASSOCIATION,
            KlassId::LOCAL_ARRAY,
            KlassId::METHOD,
            KlassId::WEAK_REFERENCE,
            KlassId::FINALIZER,
            KlassId::BYTE_ARRAY,
            KlassId::WORD_ARRAY,
            KlassId::OBJECT_ARRAY,
        ] {
            let address = klasses.by_id(id).expect("well-known klass");
            assert!(rom.contains_object(address));
            assert_eq!(unsafe { Klass::from_address(address) }.id(), id);
            assert_eq!(heap.class_of(address).address(), klasses.metaclass);
        }
    }

    #[test]
    fn test_define_klass_rejects_bad_layouts() {
        let mut heap = create_test_heap();
        let reserved = KlassLayout::instance(KlassId::FINALIZER, 3, OopMap::EMPTY);
        assert_eq!(
            heap.define_klass(&reserved, Address::NULL, Placement::Heap),
            Err(HeapError::InvalidLayout("klass id is reserved"))
        );

        let oversized = KlassLayout::instance(KlassId::FIRST_USER, 1, OopMap::from_fields(&[3]));
        assert_eq!(
            heap.define_klass(&oversized, Address::NULL, Placement::Heap),
            Err(HeapError::InvalidLayout("oop map exceeds instance size"))
        );
    }

    #[test]
    fn test_plain_objects_are_not_classes() {
        let mut heap = create_test_heap();
        let pair = define_pair(&mut heap);
        let object = heap.new_instance(pair).expect("object");
        assert!(matches!(
            heap.new_instance(object),
            Err(HeapError::InvalidLayout(_))
        ));
    }

    #[test]
    fn test_array_length_is_bounded_by_byte_size() {
        let mut heap = create_test_heap();
        let word_array = heap.klasses().word_array;
        let top = heap.allocation_top();

        // the byte size overflows a word
        assert_eq!(
            heap.new_array(word_array, (usize::MAX >> 3) + 1),
            Err(HeapError::InvalidLayout("array length out of range"))
        );
        // the byte size fits a word but no space
        assert_eq!(
            heap.new_array(word_array, 1 << 40),
            Err(HeapError::InvalidLayout("array length out of range"))
        );
        assert_eq!(heap.allocation_top(), top);

        let array = heap.new_array(word_array, 16).expect("small array");
        assert_eq!(unsafe { header::array_length(array) }, 16);
    }

    #[test]
    fn test_permanent_space_requires_mark_compact() {
        let mut heap = create_test_heap();
        let pair = define_pair(&mut heap);
        assert_eq!(
            heap.new_instance_in(pair, Placement::Permanent),
            Err(HeapError::PlacementUnavailable)
        );

        let mut heap = Heap::new(HeapSettings::mark_compact(64 * 1024)).expect("heap");
        let pair = define_pair(&mut heap);
        assert!(heap.new_instance_in(pair, Placement::Permanent).is_ok());
    }

    #[test]
    fn test_exhausted_arena_collects_before_failing() {
        let mut heap = create_test_heap();
        let pair = define_pair(&mut heap);
        let total = heap.total_memory();

        // garbage only: every allocation eventually succeeds
        for _ in 0..(2 * total / (3 * WORD_SIZE)) {
            heap.new_instance(pair).expect("garbage");
        }
        assert!(heap.timings().collections > 0);

        let bytes = heap.klasses().byte_array;
        assert_eq!(
            heap.new_array(bytes, total),
            Err(HeapError::OutOfMemory {
                requested: 2 * WORD_SIZE + total
            })
        );
    }

    #[test]
    fn test_arguments_survive_allocation_triggered_collection() {
        let mut heap = create_test_heap();
        let layout = KlassLayout::instance(KlassId::FIRST_USER, 1, OopMap::EMPTY);
        let klass = heap
            .define_klass(&layout, Address::NULL, Placement::Heap)
            .expect("klass");

        // fill the arena so that the association allocation collects
        let bytes = heap.klasses().byte_array;
        let filler = heap.free_memory() - 2 * WORD_SIZE;
        heap.new_array(bytes, filler).expect("filler");
        let association = heap.new_association(klass).expect("association");

        assert_eq!(heap.timings().collections, 1);
        let klass = heap.field(association, association::KLASS);
        assert_eq!(unsafe { Klass::from_address(klass) }.instance_words(), 1);
        assert_eq!(heap.class_of(klass).address(), heap.klasses().metaclass);
    }

    #[test]
    fn test_ready_finalizers_are_taken_once() {
        let mut heap = create_test_heap();
        let pair = define_pair(&mut heap);
        let first = heap.new_instance(pair).expect("first");
        heap.set_field(first, 1, Address::from_usize(1 << 3));
        heap.new_finalizer(first, 4).expect("finalizer");
        let second = heap.new_instance(pair).expect("second");
        heap.set_field(second, 1, Address::from_usize(2 << 3));
        heap.new_finalizer(second, 4).expect("finalizer");
        assert_eq!(heap.pending_finalizers(), 2);

        heap.collect();

        let ready = heap.take_ready_finalizers(4);
        let values: Vec<usize> = ready.iter().map(|&o| heap.field(o, 1).as_usize() >> 3).collect();
        assert_eq!(values.len(), 2);
        assert!(values.contains(&1) && values.contains(&2));
        assert!(heap.take_ready_finalizers(4).is_empty());
        assert_eq!(heap.pending_finalizers(), 0);
    }

    #[test]
    fn test_unregistered_thread_is_no_longer_a_root() {
        let mut heap = create_test_heap();
        let chunk = heap.new_stack_chunk(16).expect("chunk");
        heap.register_thread(2, chunk);
        assert_eq!(heap.roots().thread_count(), 1);

        let stack = heap.unregister_thread(2).expect("thread");
        assert_eq!(stack.chunks, vec![chunk]);
        assert!(heap.thread_chunks(2).is_empty());

        let free = heap.free_memory();
        heap.collect();
        assert!(heap.free_memory() > free);
    }

    #[test]
    fn test_method_local_map_is_checked() {
        let mut heap = create_test_heap();
        assert!(matches!(
            heap.new_method(1, OopMap::from_fields(&[2]), &[0]),
            Err(HeapError::InvalidLayout(_))
        ));
        assert!(matches!(
            heap.new_stack_chunk(2),
            Err(HeapError::InvalidLayout(_))
        ));
    }

    #[test]
    #[cfg(feature = "graph-copy")]
    fn test_graph_copy_needs_the_copying_collector() {
        let mut heap = Heap::new(HeapSettings::mark_compact(64 * 1024)).expect("heap");
        let pair = define_pair(&mut heap);
        let object = heap.new_instance(pair).expect("object");
        assert_eq!(
            heap.copy_object_graph(object),
            Err(HeapError::Unsupported(CollectorKind::MarkCompact))
        );
    }

    #[test]
    fn test_timings_dump_lists_collections() {
        let mut heap = create_test_heap();
        heap.collect();
        let mut out = Vec::new();
        heap.dump_timings(&mut out).expect("dump");
        let text = String::from_utf8(out).expect("utf8");
        assert!(text.starts_with("collections: 1"));
    }
}
