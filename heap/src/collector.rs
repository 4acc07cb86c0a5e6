use std::{
    io::{self, Write},
    time::Duration,
};

use object::{Address, Region};

use crate::{
    BumpAllocator, CollectorKind, CopyingCollector, HeapError, HeapSettings, MarkCompactCollector,
    RootSet,
};

/// Entry points every collector exposes to the allocator.
///
/// All calls happen with every mutator stopped. `collect` always completes:
/// whole-heap collection has enough room by construction.
pub trait GarbageCollector {
    /// Collects the whole heap and hands `allocator` its new arena.
    /// `force_full` is accepted for interface parity; every collection is
    /// a full one.
    fn collect(&mut self, roots: &mut RootSet, allocator: &mut BumpAllocator, force_full: bool) -> bool;

    /// Runs after the mutator has been told about the collection.
    fn post_collection(&mut self, roots: &mut RootSet);

    fn free_memory(&self, allocation_top: Address) -> usize;

    fn total_memory(&self) -> usize;

    /// Arena the allocator currently bumps through.
    fn arena(&self) -> Region;

    /// Memory that is never collected. Only the mark-compact collector has
    /// a permanent space.
    fn allocate_permanent(&mut self, bytes: usize) -> Option<Address> {
        let _ = bytes;
        None
    }

    fn timings(&self) -> &GcTimings;

    fn dump_timings(&self, out: &mut dyn Write) -> io::Result<()> {
        self.timings().dump(out)
    }
}

// ── Timings ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum GcPhase {
    Roots = 0,
    Trace,
    References,
    Addresses,
    Update,
    Compact,
    Reclaim,
}

impl GcPhase {
    pub const COUNT: usize = Self::Reclaim as usize + 1;
    const ALL: [Self; Self::COUNT] = [
        Self::Roots,
        Self::Trace,
        Self::References,
        Self::Addresses,
        Self::Update,
        Self::Compact,
        Self::Reclaim,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Roots => "roots",
            Self::Trace => "trace",
            Self::References => "references",
            Self::Addresses => "addresses",
            Self::Update => "update",
            Self::Compact => "compact",
            Self::Reclaim => "reclaim",
        }
    }
}

/// Accumulated collection statistics.
#[derive(Debug, Clone, Default)]
pub struct GcTimings {
    pub collections: u64,
    pub bytes_reclaimed: u64,
    pub total: Duration,
    pub last: Duration,
    phases: [Duration; GcPhase::COUNT],
}

impl GcTimings {
    #[inline]
    pub fn record(&mut self, phase: GcPhase, elapsed: Duration) {
        self.phases[phase as usize] += elapsed;
    }

    #[inline]
    pub fn phase(&self, phase: GcPhase) -> Duration {
        self.phases[phase as usize]
    }

    pub fn finish_collection(&mut self, elapsed: Duration, reclaimed: usize) {
        self.collections += 1;
        self.bytes_reclaimed += reclaimed as u64;
        self.total += elapsed;
        self.last = elapsed;
    }

    pub fn dump(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "collections: {}", self.collections)?;
        writeln!(out, "reclaimed:   {} bytes", self.bytes_reclaimed)?;
        writeln!(out, "total:       {:.3} ms", self.total.as_secs_f64() * 1e3)?;
        for phase in GcPhase::ALL {
            let time = self.phase(phase);
            if time.is_zero() {
                continue;
            }
            writeln!(out, "  {:<12} {:.3} ms", phase.name(), time.as_secs_f64() * 1e3)?;
        }
        Ok(())
    }
}

// ── Collector selection ───────────────────────────────────────────────

/// The collector chosen by [`HeapSettings::collector`].
pub enum Collector {
    Copying(CopyingCollector),
    MarkCompact(MarkCompactCollector),
}

impl Collector {
    pub fn new(settings: &HeapSettings, rom: Region, nvm: Region) -> Result<Self, HeapError> {
        Ok(match settings.collector {
            CollectorKind::Copying => Self::Copying(CopyingCollector::new(settings)?),
            CollectorKind::MarkCompact => {
                Self::MarkCompact(MarkCompactCollector::new(settings, rom, nvm)?)
            }
        })
    }

    pub fn kind(&self) -> CollectorKind {
        match self {
            Self::Copying(_) => CollectorKind::Copying,
            Self::MarkCompact(_) => CollectorKind::MarkCompact,
        }
    }

    #[inline]
    fn inner(&self) -> &dyn GarbageCollector {
        match self {
            Self::Copying(collector) => collector,
            Self::MarkCompact(collector) => collector,
        }
    }

    #[inline]
    fn inner_mut(&mut self) -> &mut dyn GarbageCollector {
        match self {
            Self::Copying(collector) => collector,
            Self::MarkCompact(collector) => collector,
        }
    }
}

impl GarbageCollector for Collector {
    fn collect(&mut self, roots: &mut RootSet, allocator: &mut BumpAllocator, force_full: bool) -> bool {
        self.inner_mut().collect(roots, allocator, force_full)
    }

    fn post_collection(&mut self, roots: &mut RootSet) {
        self.inner_mut().post_collection(roots)
    }

    fn free_memory(&self, allocation_top: Address) -> usize {
        self.inner().free_memory(allocation_top)
    }

    fn total_memory(&self) -> usize {
        self.inner().total_memory()
    }

    fn arena(&self) -> Region {
        self.inner().arena()
    }

    fn allocate_permanent(&mut self, bytes: usize) -> Option<Address> {
        self.inner_mut().allocate_permanent(bytes)
    }

    fn timings(&self) -> &GcTimings {
        self.inner().timings()
    }
}
