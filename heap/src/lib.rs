//! Managed-runtime heap with two interchangeable collectors.
//!
//! - [`CopyingCollector`]: two semi-spaces, Cheney breadth-first copying,
//!   optional object-graph serialization.
//! - [`MarkCompactCollector`]: Lisp2 sliding compaction over a side mark
//!   bitmap, with a bounded marking stack that recovers from overflow.
//!
//! [`Heap`] ties a collector to the allocator, the root set and the static
//! spaces, and is the entry point for consumers.

mod system;
mod memory;
mod error;
mod settings;
mod bitmap;
mod marking_stack;
mod forwarding;
mod roots;
mod allocator;
mod visit;
mod collector;
mod copying;
mod lisp2;
mod heap;
#[cfg(feature = "graph-copy")]
mod graph;
#[cfg(feature = "gc-verify")]
mod verify;

pub use object::{Address, Region};
pub use system::{OS_PAGE_SIZE, Protection};
pub use memory::MappedMemory;
pub use error::{HeapError, HeapResult};
pub use settings::{CollectorKind, HeapSettings};
pub use bitmap::{Bitmap, BitmapIterator};
pub use marking_stack::MarkingStack;
pub use roots::{ReferenceQueues, RootSet, ThreadStack, WellKnownKlasses};
pub use allocator::BumpAllocator;
pub use collector::{Collector, GarbageCollector, GcPhase, GcTimings};
pub use copying::CopyingCollector;
pub use lisp2::MarkCompactCollector;
pub use heap::{Heap, Placement};
#[cfg(feature = "graph-copy")]
pub use graph::{ObjectGraph, is_pointer_word};
