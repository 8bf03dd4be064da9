use std::sync::Barrier;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use arrayvec::ArrayVec;
use bon::bon;
use index_vec::IndexVec;
use thiserror::Error;
use tracing::{debug, info};

use super::bounds::{AtomicCentroidSceneAabb, CentroidSceneAabb};
use super::build_record::{BuildRecord, BuildState};
use super::morton::{MortonId, RADIX_BUCKETS, morton_code, radix_sort_worker};
use super::{BRANCHING_FACTOR, Bvh, MAX_LEAF_SIZE, Node, NodeIdx, NodeLink, PrimitiveSource};
use crate::geometry::{Box4, WorldBox};
use crate::sync::{
    BlockAllocator, SharedSlots, WorkStack, WorkerCount, block_allocator_capacity, thread_range,
};

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("too many primitives ({count}), at most {max} are supported", max = NodeLink::MAX_INDEX)]
    TooManyPrimitives { count: usize },
}

#[derive(Copy, Clone, Debug)]
pub struct BuildSettings {
    pub worker_count: WorkerCount,
    /// Ranges up to this size become leaves
    pub leaf_threshold: usize,
    /// Ranges up to this size are built by a single thread, `None` picks one from the input size
    pub top_level_item_threshold: Option<usize>,
    /// Nodes reserved by a thread at once
    pub allocator_block_size: usize,
    /// Pin each worker thread to one core
    pub pin_threads: bool,
}

#[bon]
impl BuildSettings {
    #[builder]
    pub fn new(
        #[builder(default)] worker_count: WorkerCount,
        #[builder(default = MAX_LEAF_SIZE)] leaf_threshold: usize,
        top_level_item_threshold: Option<usize>,
        #[builder(default = 64)] allocator_block_size: usize,
        #[builder(default)] pin_threads: bool,
    ) -> Self {
        assert!(leaf_threshold >= 1);
        assert!(leaf_threshold <= MAX_LEAF_SIZE);
        assert!(allocator_block_size >= 1);

        BuildSettings {
            worker_count,
            leaf_threshold,
            top_level_item_threshold,
            allocator_block_size,
            pin_threads,
        }
    }
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Parallel Morton code BVH builder.
///
/// Builds in phases separated by barriers: scene bounds, morton codes, radix sort,
/// top level splitting shared through a work stack, per thread subtrees
/// and finally conversion into four wide nodes.
#[derive(Clone, Debug, Default)]
pub struct MortonBuilder {
    settings: BuildSettings,
}

impl MortonBuilder {
    pub fn new(settings: BuildSettings) -> Self {
        MortonBuilder { settings }
    }

    pub fn settings(&self) -> &BuildSettings {
        &self.settings
    }

    pub fn build<S: PrimitiveSource + ?Sized>(&self, source: &S) -> Result<Bvh, BuildError> {
        let count = source.primitive_count();
        if count > NodeLink::MAX_INDEX as usize {
            return Err(BuildError::TooManyPrimitives { count });
        }

        let start = Instant::now();
        let mut bvh = if count <= self.settings.leaf_threshold {
            Bvh::single_leaf(source)
        } else {
            let thread_count = self.settings.worker_count.get().max(1);
            let state = MortonBuild::new(source, &self.settings, thread_count);
            state.run();
            state.finish()
        };

        if source.has_motion() {
            bvh.refit(source);
        }

        info!(
            primitives = count,
            nodes = bvh.nodes().len(),
            elapsed = ?start.elapsed(),
            "built bvh"
        );

        Ok(bvh)
    }
}

/// Child link and bounds written by the thread that built the child.
#[derive(Copy, Clone, Debug, Default)]
struct ChildSlot {
    link: NodeLink,
    bounds: WorldBox,
}

/// Shared state of one build, every worker thread runs `build_worker` on it.
struct MortonBuild<'a, S: ?Sized> {
    source: &'a S,
    settings: &'a BuildSettings,
    thread_count: usize,
    primitive_count: usize,
    top_level_item_threshold: usize,

    barrier: Barrier,
    scene_bounds: AtomicCentroidSceneAabb,

    morton: SharedSlots<MortonId>,
    morton_tmp: SharedSlots<MortonId>,
    histograms: SharedSlots<[usize; RADIX_BUCKETS]>,

    top_level_stack: WorkStack<BuildRecord>,
    /// Records on the top level stack or being split right now
    top_level_pending: AtomicUsize,
    subtree_stack: WorkStack<BuildRecord>,

    node_counter: AtomicUsize,
    node_capacity: usize,
    /// Children of node `i` live in slots `4 * i .. 4 * i + 4`, the root in the last slot
    child_slots: SharedSlots<ChildSlot>,

    nodes: SharedSlots<Node>,
    primitive_indices: SharedSlots<u32>,
}

impl<'a, S: PrimitiveSource + ?Sized> MortonBuild<'a, S> {
    fn new(source: &'a S, settings: &'a BuildSettings, thread_count: usize) -> Self {
        let primitive_count = source.primitive_count();
        let top_level_item_threshold = settings
            .top_level_item_threshold
            .unwrap_or_else(|| primitive_count.div_ceil(4 * thread_count))
            .max(settings.leaf_threshold);

        // Every inner node has at least two children
        let node_capacity = block_allocator_capacity(
            primitive_count,
            thread_count,
            settings.allocator_block_size,
        );

        let mut top_level_stack = WorkStack::with_capacity(primitive_count);
        top_level_stack.push_nolock(BuildRecord::new(
            0,
            primitive_count,
            Self::root_slot(node_capacity),
            1,
        ));

        MortonBuild {
            source,
            settings,
            thread_count,
            primitive_count,
            top_level_item_threshold,

            barrier: Barrier::new(thread_count),
            scene_bounds: AtomicCentroidSceneAabb::new(),

            morton: SharedSlots::new(primitive_count, |_| MortonId::default()),
            morton_tmp: SharedSlots::new(primitive_count, |_| MortonId::default()),
            histograms: SharedSlots::new(thread_count, |_| [0; RADIX_BUCKETS]),

            top_level_stack,
            top_level_pending: AtomicUsize::new(1),
            subtree_stack: WorkStack::with_capacity(primitive_count),

            node_counter: AtomicUsize::new(0),
            node_capacity,
            child_slots: SharedSlots::new(node_capacity * BRANCHING_FACTOR + 1, |_| {
                ChildSlot::default()
            }),

            nodes: SharedSlots::new(node_capacity, |_| Node::default()),
            primitive_indices: SharedSlots::new(primitive_count, |_| 0),
        }
    }

    fn root_slot(node_capacity: usize) -> usize {
        node_capacity * BRANCHING_FACTOR
    }

    fn run(&self) {
        debug!(
            primitives = self.primitive_count,
            threads = self.thread_count,
            top_level_item_threshold = self.top_level_item_threshold,
            "starting morton build"
        );

        let cores = if self.settings.pin_threads {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        std::thread::scope(|s| {
            for thread_index in 1..self.thread_count {
                let core = cores.get(thread_index % cores.len().max(1)).copied();
                s.spawn(move || {
                    if let Some(core) = core {
                        core_affinity::set_for_current(core);
                    }
                    self.build_worker(thread_index, self.thread_count);
                });
            }
            self.build_worker(0, self.thread_count);
        });
    }

    /// One thread's share of the build. All `thread_count` threads must run it.
    fn build_worker(&self, thread_index: usize, thread_count: usize) {
        let start = Instant::now();
        let log_phase = |phase: &str| {
            if thread_index == 0 {
                debug!(elapsed = ?start.elapsed(), "{phase} done");
            }
        };

        let mut allocator = BlockAllocator::new(
            &self.node_counter,
            self.node_capacity,
            self.settings.allocator_block_size,
        );

        self.compute_morton_codes(thread_index, thread_count);
        log_phase("morton codes");

        radix_sort_worker(
            thread_index,
            thread_count,
            &self.morton,
            &self.morton_tmp,
            &self.histograms,
            &self.barrier,
        );
        log_phase("radix sort");

        self.build_top_level(&mut allocator);
        self.barrier.wait();
        log_phase("top level");

        while let Some(record) = self.subtree_stack.pop_largest() {
            self.recurse(record, &mut allocator);
        }
        self.barrier.wait();
        log_phase("subtrees");

        self.convert_layout(thread_index, thread_count);
    }

    /// Scene bounds followed by the morton codes of this thread's share of primitives.
    fn compute_morton_codes(&self, thread_index: usize, thread_count: usize) {
        let range = thread_range(self.primitive_count, thread_index, thread_count);

        let local_bounds: CentroidSceneAabb = range
            .clone()
            .map(|i| self.source.primitive_bounds(i))
            .collect();
        self.scene_bounds.extend_atomic(&local_bounds);
        self.barrier.wait();

        let centroid_bounds = self.scene_bounds.load().centroid2;
        for i in range {
            let centroid2 = self.source.primitive_bounds(i).center2();
            let code = morton_code(&centroid2, &centroid_bounds);
            // Safety: threads write disjoint ranges
            unsafe { self.morton.set(i, MortonId::new(code, i as u32)) };
        }
        self.barrier.wait();
    }

    /// Splits large ranges in parallel until they are small enough for a single thread.
    fn build_top_level(&self, allocator: &mut BlockAllocator) {
        let root_slot = Self::root_slot(self.node_capacity);
        let mut idle = false;
        loop {
            // Idle threads only peek at the stack without waiting for its lock
            let popped = if idle {
                self.top_level_stack.try_pop()
            } else {
                self.top_level_stack.pop_largest()
            };
            let Some(mut record) = popped else {
                if self.top_level_pending.load(Ordering::Acquire) == 0 {
                    break;
                }
                idle = true;
                std::hint::spin_loop();
                continue;
            };
            idle = false;

            // The root record is queued before the scene bounds are known
            if record.parent_id == root_slot {
                record.set_bounds(self.scene_bounds.load().geometry);
            }

            if record.items() <= self.top_level_item_threshold {
                self.push_subtree(record, allocator);
            } else {
                let (node, children) = self.create_node(&record, allocator);
                self.write_child(record.parent_id, NodeLink::new_inner(node), record.bounds);

                for child in children {
                    self.top_level_pending.fetch_add(1, Ordering::AcqRel);
                    if let Err(child) = self.top_level_stack.push(child) {
                        self.top_level_pending.fetch_sub(1, Ordering::AcqRel);
                        self.push_subtree(child, allocator);
                    }
                }
            }

            self.top_level_pending.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn push_subtree(&self, record: BuildRecord, allocator: &mut BlockAllocator) {
        if let Err(record) = self.subtree_stack.push(record) {
            self.recurse(record, allocator);
        }
    }

    /// Single threaded build of a whole subtree, returns its bounds.
    fn recurse(&self, mut record: BuildRecord, allocator: &mut BlockAllocator) -> WorldBox {
        let (link, bounds) = if record.items() <= self.settings.leaf_threshold {
            record.set_state(BuildState::Leaf);
            self.create_leaf(&record)
        } else {
            record.set_state(BuildState::Internal);
            let (node, children) = self.create_node(&record, allocator);
            let bounds = children
                .into_iter()
                .fold(WorldBox::empty(), |acc, child| acc + &self.recurse(child, allocator));
            (NodeLink::new_inner(node), bounds)
        };

        self.write_child(record.parent_id, link, bounds);
        bounds
    }

    fn create_leaf(&self, record: &BuildRecord) -> (NodeLink, WorldBox) {
        let bounds = self.range_bounds(record.range());
        let link = NodeLink::new_leaf(record.begin as u32, record.items() as u32);
        (link, bounds)
    }

    /// Allocates an inner node and splits the record into its children.
    /// Children get their parent slots assigned.
    fn create_node(
        &self,
        record: &BuildRecord,
        allocator: &mut BlockAllocator,
    ) -> (NodeIdx, ArrayVec<BuildRecord, BRANCHING_FACTOR>) {
        let mut children = self.split_children(record);

        let node = allocator.get(1);
        for (slot, child) in children.iter_mut().enumerate() {
            child.parent_id = node * BRANCHING_FACTOR + slot;
        }

        (NodeIdx::from_usize(node), children)
    }

    /// Repeatedly splits the largest child until there are four or all are small enough for leaves.
    fn split_children(&self, record: &BuildRecord) -> ArrayVec<BuildRecord, BRANCHING_FACTOR> {
        let mut children = ArrayVec::new();
        children.push(record.clone());

        while !children.is_full() {
            let mut best: Option<usize> = None;
            for (i, child) in children.iter().enumerate() {
                if child.items() > self.settings.leaf_threshold
                    && best.is_none_or(|b| child.items() > children[b].items())
                {
                    best = Some(i);
                }
            }
            let Some(best) = best else {
                break;
            };

            let (left, right) = self.split(&children[best]);
            children[best] = left;
            children.push(right);
        }

        children
    }

    /// Splits at the highest bit where the morton codes in the range differ.
    /// Ranges of identical codes are split in the middle.
    /// Both halves get the bounds of their primitives.
    fn split(&self, record: &BuildRecord) -> (BuildRecord, BuildRecord) {
        debug_assert!(record.items() >= 2);
        let morton = &self.sorted_morton()[record.range()];

        let diff = morton[0].code() ^ morton[morton.len() - 1].code();
        let mid = if diff == 0 {
            record.items() / 2
        } else {
            let mask = 1u32 << (u32::BITS - 1 - diff.leading_zeros());
            morton.partition_point(|id| id.code() & mask == 0)
        };

        let (mut left, mut right) = record.split_at(record.begin + mid);
        left.set_bounds(self.range_bounds(left.range()));
        right.set_bounds(self.range_bounds(right.range()));
        (left, right)
    }

    /// Union of the bounds of the sorted primitives in `range`.
    fn range_bounds(&self, range: std::ops::Range<usize>) -> WorldBox {
        self.sorted_morton()[range]
            .iter()
            .fold(WorldBox::empty(), |acc, id| {
                acc + &self.source.primitive_bounds(id.index() as usize)
            })
    }

    fn sorted_morton(&self) -> &[MortonId] {
        // Safety: the morton array is only written before the sort finishes
        unsafe { self.morton.as_slice() }
    }

    fn write_child(&self, slot: usize, link: NodeLink, bounds: WorldBox) {
        // Safety: every slot has exactly one writer, the thread processing that child
        unsafe { self.child_slots.set(slot, ChildSlot { link, bounds }) };
    }

    /// Packs child slots into four wide nodes and writes out the sorted primitive order.
    fn convert_layout(&self, thread_index: usize, thread_count: usize) {
        let node_count = self.node_counter.load(Ordering::Acquire).min(self.node_capacity);
        for node in thread_range(node_count, thread_index, thread_count) {
            let slots: [ChildSlot; BRANCHING_FACTOR] = std::array::from_fn(|i| unsafe {
                self.child_slots.read(node * BRANCHING_FACTOR + i)
            });
            let converted = Node {
                bounds: Box4::from_boxes(&slots.map(|s| s.bounds)),
                bounds_end: None,
                children: slots.map(|s| s.link),
                refit_generation: 0,
            };
            // Safety: threads convert disjoint node ranges
            unsafe { self.nodes.set(node, converted) };
        }

        let morton = self.sorted_morton();
        for i in thread_range(self.primitive_count, thread_index, thread_count) {
            unsafe { self.primitive_indices.set(i, morton[i].index()) };
        }
    }

    fn finish(self) -> Bvh {
        let node_count = self.node_counter.load(Ordering::Acquire).min(self.node_capacity);
        let root_slot = Self::root_slot(self.node_capacity);
        let ChildSlot { link, bounds } = unsafe { self.child_slots.read(root_slot) };

        let mut nodes = self.nodes.into_vec();
        nodes.truncate(node_count);

        Bvh::from_parts(
            link,
            bounds,
            IndexVec::from_vec(nodes),
            self.primitive_indices.into_vec(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bvh::test_util::{MovingBoxes, random_boxes};
    use crate::geometry::{WorldPoint, WorldVector};
    use assert2::{assert, let_assert};
    use std::num::NonZeroUsize;
    use test_case::test_case;

    fn builder(threads: usize) -> MortonBuilder {
        MortonBuilder::new(
            BuildSettings::builder()
                .worker_count(WorkerCount::Manual(NonZeroUsize::new(threads).unwrap()))
                .build(),
        )
    }

    #[test_case(1, 1)]
    #[test_case(4, 1)]
    #[test_case(5, 1)]
    #[test_case(100, 1)]
    #[test_case(100, 4)]
    #[test_case(10_000, 1)]
    #[test_case(10_000, 8)]
    fn valid_tree(count: usize, threads: usize) {
        let boxes = random_boxes(count, count as u64);
        let bvh = builder(threads).build(boxes.as_slice()).unwrap();
        let_assert!(Ok(()) = bvh.validate(boxes.as_slice()));

        let expected = boxes.iter().fold(WorldBox::empty(), |acc, b| acc + b);
        assert!(*bvh.bounds() == expected);
    }

    #[test]
    fn empty_input() {
        let bvh = builder(2).build(&[] as &[WorldBox]).unwrap();
        assert!(bvh.is_empty());
        assert!(bvh.bounds().is_empty());
    }

    #[test]
    fn single_primitive_is_leaf_root() {
        let boxes = random_boxes(1, 0);
        let bvh = builder(2).build(boxes.as_slice()).unwrap();
        assert!(bvh.root().is_leaf());
        assert!(bvh.nodes().is_empty());
        assert!(bvh.primitive_indices() == [0]);
    }

    #[test]
    fn identical_centroids_use_fallback_split() {
        let b = WorldBox::new(WorldPoint::new(1.0, 1.0, 1.0), WorldPoint::new(2.0, 2.0, 2.0));
        let boxes = vec![b; 1000];
        let bvh = builder(4).build(boxes.as_slice()).unwrap();
        let_assert!(Ok(()) = bvh.validate(boxes.as_slice()));
        assert!(bvh.depth() <= 8);
    }

    #[test]
    fn thread_count_does_not_change_leaves() {
        let boxes = random_boxes(5000, 3);
        let a = builder(1).build(boxes.as_slice()).unwrap();
        let b = builder(6).build(boxes.as_slice()).unwrap();
        assert!(a.primitive_indices() == b.primitive_indices());
    }

    #[test]
    fn small_leaf_threshold() {
        let boxes = random_boxes(300, 11);
        let bvh = MortonBuilder::new(
            BuildSettings::builder()
                .worker_count(WorkerCount::Manual(NonZeroUsize::new(3).unwrap()))
                .leaf_threshold(1)
                .top_level_item_threshold(16)
                .allocator_block_size(4)
                .build(),
        )
        .build(boxes.as_slice())
        .unwrap();
        let_assert!(Ok(()) = bvh.validate(boxes.as_slice()));
        assert!(bvh.statistics().leaf_sizes.max == 1);
    }

    #[test]
    fn motion_bounds_are_filled() {
        let source = MovingBoxes::new(random_boxes(500, 5), WorldVector::new(3.0, 0.0, 0.0));
        let bvh = builder(2).build(&source).unwrap();
        let_assert!(Some(end) = bvh.bounds_end());
        let expected = source.end.iter().fold(WorldBox::empty(), |acc, b| acc + b);
        assert!(*end == expected);
        let_assert!(Ok(()) = bvh.validate(&source));
    }

    #[test]
    fn split_records_carry_their_bounds() {
        let boxes = random_boxes(2000, 21);
        let settings = BuildSettings::builder()
            .worker_count(WorkerCount::Manual(NonZeroUsize::new(1).unwrap()))
            .top_level_item_threshold(100)
            .build();
        let state = MortonBuild::new(boxes.as_slice(), &settings, 1);

        state.compute_morton_codes(0, 1);
        radix_sort_worker(0, 1, &state.morton, &state.morton_tmp, &state.histograms, &state.barrier);
        let mut allocator =
            BlockAllocator::new(&state.node_counter, state.node_capacity, settings.allocator_block_size);
        state.build_top_level(&mut allocator);

        let morton = state.sorted_morton();
        let mut subtrees = 0;
        while let Some(record) = state.subtree_stack.pop() {
            let expected = morton[record.range()]
                .iter()
                .fold(WorldBox::empty(), |acc, id| acc + &boxes[id.index() as usize]);
            assert!(!record.bounds.is_empty());
            assert!(record.bounds == expected);
            assert!(record.surface_area() == expected.half_area());
            subtrees += 1;
        }
        assert!(subtrees > 1);
    }

    #[test]
    #[should_panic]
    fn leaf_threshold_above_maximum() {
        BuildSettings::builder().leaf_threshold(MAX_LEAF_SIZE + 1).build();
    }
}
