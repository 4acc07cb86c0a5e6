use clap::{Parser as ClapParser, ValueEnum};
use std::{
    collections::HashSet,
    io::{self, Write},
    process,
};

use heap::{
    Address, Heap, HeapError, HeapResult, HeapSettings, OS_PAGE_SIZE, Placement,
};
use log::{debug, info, warn};
use object::{KlassId, KlassLayout, OopMap};

/// Global slot holding the association of the heap-resident box klass.
const BOX_ASSOCIATION: usize = 0;
/// First global slot used as a workload anchor.
const FIRST_ANCHOR: usize = 1;

const NODE_ID: KlassId = KlassId(KlassId::FIRST_USER.0);
const BOX_ID: KlassId = KlassId(KlassId::FIRST_USER.0 + 1);

mod node {
    pub const LEFT: usize = 0;
    pub const RIGHT: usize = 1;
    pub const PAYLOAD: usize = 2;
    pub const WORDS: usize = 3;
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum CollectorArg {
    Copying,
    MarkCompact,
}

#[derive(ClapParser, Debug)]
#[command(author, version, about = "Random object-graph workload for the managed heap", long_about = None)]
struct Cli {
    /// Collector implementation
    #[arg(long, value_enum, default_value_t = CollectorArg::Copying)]
    collector: CollectorArg,

    /// Bytes of collected memory (rounded up to two pages)
    #[arg(long, default_value_t = 1024 * 1024)]
    heap_size: usize,

    /// Number of allocate-then-collect rounds
    #[arg(long, default_value_t = 10)]
    rounds: usize,

    /// Objects allocated per round
    #[arg(long, default_value_t = 4000)]
    objects: usize,

    /// Number of global anchors the workload keeps alive
    #[arg(long, default_value_t = 16)]
    survivors: usize,

    /// Seed of the workload generator
    #[arg(long, default_value_t = 0x2545_f491_4f6c_dd1d)]
    seed: u64,

    /// Print collector phase timings at the end
    #[arg(long)]
    timings: bool,

    /// Serialize the first anchor's graph after every round (copying only)
    #[arg(long)]
    graph_copy: bool,
}

/// Knuth's MMIX linear congruential generator.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    fn below(&mut self, bound: usize) -> usize {
        (self.next() % bound as u64) as usize
    }
}

struct Workload {
    heap: Heap,
    rng: Lcg,
    node_klass: Address,
    anchors: usize,
}

/// Shape summary of everything reachable from the globals. Independent of
/// object addresses, so it must survive any collection unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Census {
    objects: usize,
    checksum: u64,
}

impl Workload {
    fn new(cli: &Cli) -> HeapResult<Self> {
        let anchors = cli.survivors.max(1);
        let settings = HeapSettings {
            heap_size: cli.heap_size.next_multiple_of(2 * OS_PAGE_SIZE),
            global_roots: FIRST_ANCHOR + anchors,
            ..match cli.collector {
                CollectorArg::Copying => HeapSettings::copying(cli.heap_size),
                CollectorArg::MarkCompact => HeapSettings::mark_compact(cli.heap_size),
            }
        };
        let mut heap = Heap::new(settings)?;

        let node_layout = KlassLayout::instance(
            NODE_ID,
            node::WORDS,
            OopMap::from_fields(&[node::LEFT, node::RIGHT]),
        );
        let node_klass = heap.define_klass(&node_layout, Address::NULL, Placement::Rom)?;

        let box_layout = KlassLayout::instance(BOX_ID, 1, OopMap::EMPTY);
        let box_klass = heap.define_klass(&box_layout, Address::NULL, Placement::Heap)?;
        let association = heap.new_association(box_klass)?;
        heap.set_global(BOX_ASSOCIATION, association);

        Ok(Self {
            heap,
            rng: Lcg(cli.seed),
            node_klass,
            anchors,
        })
    }

    /// Drops about half of the anchors so that the live set stays bounded
    /// by a few rounds of allocation.
    fn release_anchors(&mut self) {
        for slot in FIRST_ANCHOR..FIRST_ANCHOR + self.anchors {
            if self.rng.below(2) == 0 {
                self.heap.set_global(slot, Address::NULL);
            }
        }
    }

    fn random_anchor(&mut self) -> usize {
        FIRST_ANCHOR + self.rng.below(self.anchors)
    }

    fn allocate_one(&mut self) -> HeapResult<()> {
        let payload = Address::from_usize(self.rng.next() as usize);
        if self.rng.below(10) < 3 {
            let association = self.heap.global(BOX_ASSOCIATION);
            let object = self.heap.new_object(association, 0, Placement::Heap)?;
            self.heap.set_field(object, 0, payload);
            if self.rng.below(8) == 0 {
                let slot = self.random_anchor();
                self.heap.set_global(slot, object);
            }
            return Ok(());
        }

        let object = self.heap.new_instance(self.node_klass)?;
        self.heap.set_field(object, node::PAYLOAD, payload);
        let left = self.random_anchor();
        let left = self.heap.global(left);
        self.heap.set_field(object, node::LEFT, left);
        if self.rng.below(2) == 0 {
            let right = self.random_anchor();
            let right = self.heap.global(right);
            self.heap.set_field(object, node::RIGHT, right);
        }
        if self.rng.below(4) == 0 {
            let slot = self.random_anchor();
            self.heap.set_global(slot, object);
        }
        Ok(())
    }

    /// Depth-first walk from the anchors in slot order, left before right.
    fn census(&self) -> Census {
        let mut seen = HashSet::new();
        let mut census = Census {
            objects: 0,
            checksum: 0xcbf2_9ce4_8422_2325,
        };
        for slot in FIRST_ANCHOR..FIRST_ANCHOR + self.anchors {
            let mut pending = vec![self.heap.global(slot)];
            while let Some(object) = pending.pop() {
                if object.is_null() || !seen.insert(object) {
                    continue;
                }
                census.objects += 1;
                let klass = self.heap.class_of(object);
                let payload = if klass.id() == NODE_ID {
                    pending.push(self.heap.field(object, node::RIGHT));
                    pending.push(self.heap.field(object, node::LEFT));
                    self.heap.field(object, node::PAYLOAD)
                } else {
                    self.heap.field(object, 0)
                };
                census.checksum = (census.checksum ^ payload.as_usize() as u64)
                    .wrapping_mul(0x0000_0100_0000_01b3)
                    .rotate_left(7);
            }
        }
        census
    }

    fn serialize_first_anchor(&mut self) {
        let root = self.heap.global(FIRST_ANCHOR);
        if root.is_null() {
            return;
        }
        match self.heap.copy_object_graph(root) {
            Ok(graph) => info!(
                "graph of {root:?}: {} bytes, root at offset {}",
                graph.size, graph.root_offset
            ),
            Err(HeapError::GraphCopyOutOfMemory) => {
                warn!("graph of {root:?} does not fit into the copy space")
            }
            Err(err) => warn!("graph copy failed: {err}"),
        }
    }
}

fn run(cli: &Cli) -> HeapResult<bool> {
    let mut workload = Workload::new(cli)?;
    let graph_copy = cli.graph_copy && cli.collector == CollectorArg::Copying;
    if cli.graph_copy && !graph_copy {
        warn!("--graph-copy needs the copying collector, ignoring");
    }

    for round in 0..cli.rounds {
        workload.release_anchors();
        for _ in 0..cli.objects {
            workload.allocate_one()?;
        }

        let before = workload.census();
        workload.heap.collect();
        let after = workload.census();
        if before != after {
            eprintln!("round {round}: live graph changed across collection: {before:?} -> {after:?}");
            return Ok(false);
        }
        println!(
            "round {round}: {} reachable objects, checksum {:#018x}, {} of {} bytes free",
            after.objects,
            after.checksum,
            workload.heap.free_memory(),
            workload.heap.total_memory()
        );

        if graph_copy {
            workload.serialize_first_anchor();
        }
    }

    debug!("{} collections in total", workload.heap.timings().collections);
    if cli.timings {
        let mut out = io::stdout().lock();
        if let Err(err) = workload.heap.dump_timings(&mut out).and_then(|_| out.flush()) {
            eprintln!("Error writing timings: {err}");
        }
    }
    Ok(true)
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    match run(&cli) {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(err) => {
            eprintln!("Error: {err}");
            process::exit(2);
        }
    }
}
