//! Root set shared by both collectors.

use std::collections::BTreeMap;

use object::{Address, KlassId, Region, finalizer, read_field, weak_reference, write_field};
use parking_lot::Mutex;

/// Klasses the collectors and the allocator need by identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WellKnownKlasses {
    pub metaclass: Address,
    pub association: Address,
    pub local_array: Address,
    pub method: Address,
    pub weak_reference: Address,
    pub finalizer: Address,
    pub byte_array: Address,
    pub word_array: Address,
    pub object_array: Address,
}

impl WellKnownKlasses {
    #[inline(always)]
    pub fn is_initialized(&self) -> bool {
        !self.metaclass.is_null()
    }

    pub fn by_id(&self, id: KlassId) -> Option<Address> {
        let klass = match id {
            KlassId::KLASS => self.metaclass,
            KlassId::OBJECT_ASSOCIATION => self.association,
            KlassId::LOCAL_ARRAY => self.local_array,
            KlassId::METHOD => self.method,
            KlassId::WEAK_REFERENCE => self.weak_reference,
            KlassId::FINALIZER => self.finalizer,
            KlassId::BYTE_ARRAY => self.byte_array,
            KlassId::WORD_ARRAY => self.word_array,
            KlassId::OBJECT_ARRAY => self.object_array,
            _ => return None,
        };
        (!klass.is_null()).then_some(klass)
    }

    pub fn visit(&mut self, visitor: &mut dyn FnMut(&mut Address)) {
        visitor(&mut self.metaclass);
        visitor(&mut self.association);
        visitor(&mut self.local_array);
        visitor(&mut self.method);
        visitor(&mut self.weak_reference);
        visitor(&mut self.finalizer);
        visitor(&mut self.byte_array);
        visitor(&mut self.word_array);
        visitor(&mut self.object_array);
    }
}

/// Stack chunks of one mutator thread, oldest first.
#[derive(Debug, Clone)]
pub struct ThreadStack {
    pub id: u32,
    pub chunks: Vec<Address>,
}

/// Weak reference list, pending finalizers and per-owner ready finalizers.
///
/// Only the ready queues are strong roots. The weak list and the pending
/// list are filtered by every collection.
#[derive(Debug, Default)]
pub struct ReferenceQueues {
    pub weak_head: Address,
    pub finalizer_head: Address,
    pub ready: BTreeMap<u32, Address>,
}

impl ReferenceQueues {
    /// Objects linked through `next_field`, starting at `head`.
    ///
    /// # Safety
    /// the list must link well-formed objects with a `next_field` body word.
    unsafe fn walk(head: Address, next_field: usize) -> Vec<Address> {
        let mut nodes = Vec::new();
        let mut node = head;
        while !node.is_null() {
            nodes.push(node);
            // SAFETY: by contract
            node = unsafe { read_field(node, next_field) };
        }
        nodes
    }

    /// # Safety
    /// the weak list must be intact.
    pub unsafe fn weak_references(&self) -> Vec<Address> {
        // SAFETY: by contract
        unsafe { Self::walk(self.weak_head, weak_reference::NEXT) }
    }

    /// # Safety
    /// the pending finalizer list must be intact.
    pub unsafe fn pending_finalizers(&self) -> Vec<Address> {
        // SAFETY: by contract
        unsafe { Self::walk(self.finalizer_head, finalizer::NEXT) }
    }

    /// Pending finalizers paired with whether their object survived
    /// tracing. Taken once per collection, before any finalizer object is
    /// kept alive.
    ///
    /// # Safety
    /// the pending finalizer list must be intact.
    pub(crate) unsafe fn snapshot_finalizers(
        &self,
        mut is_live: impl FnMut(Address) -> bool,
    ) -> Vec<(Address, bool)> {
        // SAFETY: by contract
        let nodes = unsafe { self.pending_finalizers() };
        nodes
            .into_iter()
            // SAFETY: every node is a finalizer
            .map(|node| (node, is_live(unsafe { read_field(node, finalizer::OBJECT) })))
            .collect()
    }

    /// Relinks a snapshot. Finalizers of reachable objects stay pending in
    /// their original order, the others are pushed onto the ready queue of
    /// their owner. Returns the number of ready finalizers.
    ///
    /// # Safety
    /// every node must be a writable finalizer object.
    pub(crate) unsafe fn route_finalizers(&mut self, snapshot: &[(Address, bool)]) -> usize {
        let mut pending = Address::NULL;
        let mut ready = 0;
        for &(node, reachable) in snapshot.iter().rev() {
            // SAFETY: by contract
            unsafe {
                if reachable {
                    write_field(node, finalizer::NEXT, pending);
                    pending = node;
                } else {
                    let owner = read_field(node, finalizer::OWNER).as_usize() as u32;
                    let head = self.ready.entry(owner).or_insert(Address::NULL);
                    write_field(node, finalizer::NEXT, *head);
                    *head = node;
                    ready += 1;
                }
            }
        }
        self.finalizer_head = pending;
        ready
    }

    /// Rebuilds the weak list after tracing. `current` returns the current
    /// address of a surviving object (null maps to null) and `None` for a
    /// dead one. Dead references are dropped, dead referents cleared, and
    /// references left without a referent are unlinked. Returns the number
    /// of kept and cleared references.
    ///
    /// # Safety
    /// the weak list must be intact and `current` must only return
    /// addresses of writable objects.
    pub(crate) unsafe fn filter_weak_references(
        &mut self,
        mut current: impl FnMut(Address) -> Option<Address>,
    ) -> (usize, usize) {
        let mut survivors = Vec::new();
        let mut cleared = 0;
        // SAFETY: by contract
        for node in unsafe { self.weak_references() } {
            let Some(node) = current(node) else {
                continue;
            };
            // SAFETY: node survived and is a weak reference
            unsafe {
                let referent = read_field(node, weak_reference::REFERENT);
                let moved = current(referent).unwrap_or_else(|| {
                    cleared += 1;
                    Address::NULL
                });
                write_field(node, weak_reference::REFERENT, moved);
                write_field(node, weak_reference::NEXT, Address::NULL);
                if !moved.is_null() {
                    survivors.push(node);
                }
            }
        }

        let mut head = Address::NULL;
        for &node in survivors.iter().rev() {
            // SAFETY: survivors are weak references
            unsafe { write_field(node, weak_reference::NEXT, head) };
            head = node;
        }
        self.weak_head = head;
        (survivors.len(), cleared)
    }
}

pub struct RootSet {
    globals: Vec<Address>,
    threads: Mutex<Vec<ThreadStack>>,
    scratch: Vec<Address>,
    stable: Vec<Region>,
    pub(crate) klasses: WellKnownKlasses,
    pub(crate) queues: ReferenceQueues,
}

impl RootSet {
    pub fn new(global_count: usize) -> Self {
        Self {
            globals: vec![Address::NULL; global_count],
            threads: Mutex::new(Vec::new()),
            scratch: Vec::new(),
            stable: Vec::new(),
            klasses: WellKnownKlasses::default(),
            queues: ReferenceQueues::default(),
        }
    }

    // ── globals ────────────────────────────────────────────────────

    #[inline(always)]
    pub fn global_root_count(&self) -> usize {
        self.globals.len()
    }

    #[inline(always)]
    pub fn global_root(&self, index: usize) -> Address {
        self.globals[index]
    }

    #[inline(always)]
    pub fn set_global_root(&mut self, index: usize, value: Address) {
        self.globals[index] = value;
    }

    // ── threads ────────────────────────────────────────────────────

    pub fn register_thread(&self, id: u32, chunk: Address) {
        let mut threads = self.threads.lock();
        match threads.iter_mut().find(|thread| thread.id == id) {
            Some(thread) => thread.chunks.push(chunk),
            None => threads.push(ThreadStack {
                id,
                chunks: vec![chunk],
            }),
        }
    }

    pub fn unregister_thread(&self, id: u32) -> Option<ThreadStack> {
        let mut threads = self.threads.lock();
        let index = threads.iter().position(|thread| thread.id == id)?;
        Some(threads.swap_remove(index))
    }

    /// Current chunk addresses of thread `id`, oldest first.
    pub fn thread_chunks(&self, id: u32) -> Vec<Address> {
        self.threads
            .lock()
            .iter()
            .find(|thread| thread.id == id)
            .map(|thread| thread.chunks.clone())
            .unwrap_or_default()
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }

    // ── scratch ────────────────────────────────────────────────────

    /// Protects an address held by native code across a collection.
    #[inline]
    pub fn push_scratch(&mut self, value: Address) {
        self.scratch.push(value);
    }

    /// Removes the most recent scratch root, returning its current value.
    #[inline]
    pub fn pop_scratch(&mut self) -> Address {
        self.scratch.pop().unwrap_or(Address::NULL)
    }

    // ── stable spaces ──────────────────────────────────────────────

    /// Occupied part of each stable space. Objects there are roots.
    #[inline(always)]
    pub fn stable_spaces(&self) -> &[Region] {
        &self.stable
    }

    pub fn set_stable_space(&mut self, index: usize, occupied: Region) {
        if self.stable.len() <= index {
            self.stable.resize(index + 1, Region::EMPTY);
        }
        self.stable[index] = occupied;
    }

    // ── accessors ──────────────────────────────────────────────────

    #[inline(always)]
    pub fn klasses(&self) -> &WellKnownKlasses {
        &self.klasses
    }

    pub fn set_klasses(&mut self, klasses: WellKnownKlasses) {
        self.klasses = klasses;
    }

    #[inline(always)]
    pub fn queues(&self) -> &ReferenceQueues {
        &self.queues
    }

    #[inline(always)]
    pub fn queues_mut(&mut self) -> &mut ReferenceQueues {
        &mut self.queues
    }

    /// Visits every strong root slot exactly once: globals, thread chunks,
    /// scratch roots, well-known klasses and the heads of ready finalizer
    /// queues.
    pub fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Address)) {
        for global in &mut self.globals {
            visitor(global);
        }
        for thread in self.threads.get_mut().iter_mut() {
            for chunk in &mut thread.chunks {
                visitor(chunk);
            }
        }
        for slot in &mut self.scratch {
            visitor(slot);
        }
        self.klasses.visit(visitor);
        for head in self.queues.ready.values_mut() {
            visitor(head);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visit_roots_reaches_every_slot_once() {
        let mut roots = RootSet::new(3);
        roots.set_global_root(1, Address::from_usize(0x100));
        roots.register_thread(7, Address::from_usize(0x200));
        roots.register_thread(7, Address::from_usize(0x300));
        roots.push_scratch(Address::from_usize(0x400));
        roots.queues_mut().ready.insert(2, Address::from_usize(0x500));
        roots.queues_mut().weak_head = Address::from_usize(0x600);

        let mut seen = Vec::new();
        roots.visit_roots(&mut |slot| {
            if !slot.is_null() {
                seen.push(*slot);
                *slot = slot.add(8);
            }
        });
        seen.sort();
        assert_eq!(
            seen,
            [0x100, 0x200, 0x300, 0x400, 0x500]
                .map(Address::from_usize)
                .to_vec()
        );

        assert_eq!(roots.global_root(1), Address::from_usize(0x108));
        assert_eq!(
            roots.thread_chunks(7),
            vec![Address::from_usize(0x208), Address::from_usize(0x308)]
        );
        assert_eq!(roots.pop_scratch(), Address::from_usize(0x408));
        // the weak list is not a strong root
        assert_eq!(roots.queues().weak_head, Address::from_usize(0x600));
    }

    #[test]
    fn test_unregister_thread() {
        let roots = RootSet::new(0);
        roots.register_thread(1, Address::from_usize(0x100));
        roots.register_thread(2, Address::from_usize(0x200));
        assert_eq!(roots.thread_count(), 2);

        let removed = roots.unregister_thread(1).expect("thread 1");
        assert_eq!(removed.chunks, vec![Address::from_usize(0x100)]);
        assert_eq!(roots.thread_count(), 1);
        assert!(roots.unregister_thread(1).is_none());
    }

    #[test]
    fn test_well_known_lookup() {
        let klasses = WellKnownKlasses {
            metaclass: Address::from_usize(0x10),
            ..Default::default()
        };
        assert!(klasses.is_initialized());
        assert_eq!(klasses.by_id(KlassId::KLASS), Some(Address::from_usize(0x10)));
        assert_eq!(klasses.by_id(KlassId::METHOD), None);
        assert_eq!(klasses.by_id(KlassId::FIRST_USER), None);
    }
}
