mod bounds;
mod build_record;
mod building;
mod morton;
mod packet_traversal;
mod printing;
mod ray_bvh_intersection;
mod refit;
mod rotate;
mod validation;

pub use bounds::{AtomicCentroidSceneAabb, CentroidSceneAabb};
pub use build_record::{BuildRecord, BuildState};
pub use building::{BuildError, BuildSettings, MortonBuilder};
pub use morton::{MortonId, morton_code, radix_sort_parallel};
pub use printing::BvhStatistics;
pub use refit::RefitStats;
pub use rotate::{RotateSettings, RotationStats};
pub use validation::ValidationError;

use index_vec::IndexVec;

use crate::geometry::{Box4, PACKET_WIDTH, Ray, RayPacket, WorldBox};
use crate::util::bit_iter;

/// Children per inner node, one SIMD lane each.
pub const BRANCHING_FACTOR: usize = 4;

/// Largest number of primitives in a leaf, the width of a triangle block.
pub const MAX_LEAF_SIZE: usize = 4;

/// Depth bound for rotations, sized so that the traversal stack can't overflow.
pub const MAX_DEPTH: usize = 64;

/// Traversal stack size: each visited level pops one entry and pushes at most four.
pub(crate) const STACK_SIZE: usize = 1 + (BRANCHING_FACTOR - 1) * MAX_DEPTH;

/// Input of BVH construction and refitting: anything that can report primitive bounds.
pub trait PrimitiveSource: Sync {
    fn primitive_count(&self) -> usize;

    fn primitive_bounds(&self, index: usize) -> WorldBox;

    /// Primitives move linearly between `primitive_bounds` (time 0)
    /// and `primitive_bounds_end` (time 1).
    fn has_motion(&self) -> bool {
        false
    }

    fn primitive_bounds_end(&self, index: usize) -> WorldBox {
        self.primitive_bounds(index)
    }
}

impl PrimitiveSource for [WorldBox] {
    fn primitive_count(&self) -> usize {
        self.len()
    }

    fn primitive_bounds(&self, index: usize) -> WorldBox {
        self[index]
    }
}

/// Ray queries against the primitives referenced by one leaf.
///
/// Primitive indices are the ones used by the `PrimitiveSource` the tree was built from.
pub trait PrimitiveIntersector: Sync {
    type Hit: Copy + Send;

    /// Closest hit strictly within the ray's range. Shrinks `ray.tfar` on hit.
    fn intersect(&self, ray: &mut Ray, primitives: &[u32]) -> Option<Self::Hit>;

    /// Any hit within the ray's range.
    fn occluded(&self, ray: &Ray, primitives: &[u32]) -> bool;

    /// Packet variant of `intersect`, only lanes in `lanes` are touched.
    fn intersect_packet(
        &self,
        packet: &mut RayPacket,
        lanes: u8,
        primitives: &[u32],
        hits: &mut [Option<Self::Hit>; PACKET_WIDTH],
    ) {
        for lane in bit_iter(lanes) {
            let mut ray = packet.ray(lane);
            if let Some(hit) = self.intersect(&mut ray, primitives) {
                packet.set_tfar(lane, ray.tfar);
                hits[lane] = Some(hit);
            }
        }
    }

    /// Packet variant of `occluded`, returns the lanes that hit something.
    fn occluded_packet(&self, packet: &RayPacket, lanes: u8, primitives: &[u32]) -> u8 {
        bit_iter(lanes)
            .filter(|lane| self.occluded(&packet.ray(*lane), primitives))
            .fold(0, |acc, lane| acc | (1 << lane))
    }
}

/// Four-wide BVH over primitives of some `PrimitiveSource`.
///
/// Nodes live in one arena and are referenced by index. Leaves are ranges
/// of `primitive_indices`.
#[derive(Clone, Debug)]
pub struct Bvh {
    bounds: WorldBox,
    bounds_end: Option<WorldBox>,
    root: NodeLink,

    nodes: IndexVec<NodeIdx, Node>,
    primitive_indices: Vec<u32>,

    refit_generation: u32,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Node {
    /// Child boxes (at time 0 for motion blurred trees)
    pub bounds: Box4,
    /// Child boxes at time 1, only in motion blurred trees
    pub bounds_end: Option<Box4>,
    pub children: [NodeLink; BRANCHING_FACTOR],

    /// Refit pass that last refreshed this node's bounds
    refit_generation: u32,
}

impl Node {
    /// Child boxes at the given time.
    pub fn bounds_at(&self, time: f32) -> Box4 {
        match &self.bounds_end {
            Some(end) => self.bounds.lerp(end, time),
            None => self.bounds,
        }
    }

    /// Mask of slots with a non-null child link.
    pub fn child_mask(&self) -> u8 {
        self.children
            .iter()
            .enumerate()
            .filter(|(_, link)| !link.is_null())
            .fold(0, |acc, (i, _)| acc | (1 << i))
    }

    pub fn child_count(&self) -> usize {
        self.child_mask().count_ones() as usize
    }
}

impl Bvh {
    /// Tree without any primitives. All queries miss.
    pub fn empty() -> Bvh {
        Bvh {
            bounds: WorldBox::empty(),
            bounds_end: None,
            root: NodeLink::NULL,
            nodes: IndexVec::new(),
            primitive_indices: Vec::new(),
            refit_generation: 0,
        }
    }

    /// Tree consisting of a single leaf.
    pub(crate) fn single_leaf(source: &(impl PrimitiveSource + ?Sized)) -> Bvh {
        let count = source.primitive_count();
        if count == 0 {
            return Bvh::empty();
        }
        assert!(count <= MAX_LEAF_SIZE);

        let bounds = (0..count)
            .map(|i| source.primitive_bounds(i))
            .fold(WorldBox::empty(), |acc, b| acc + &b);
        let bounds_end = source.has_motion().then(|| {
            (0..count)
                .map(|i| source.primitive_bounds_end(i))
                .fold(WorldBox::empty(), |acc, b| acc + &b)
        });

        Bvh {
            bounds,
            bounds_end,
            root: NodeLink::new_leaf(0, count as u32),
            nodes: IndexVec::new(),
            primitive_indices: (0..count as u32).collect(),
            refit_generation: 0,
        }
    }

    pub(crate) fn from_parts(
        root: NodeLink,
        bounds: WorldBox,
        nodes: IndexVec<NodeIdx, Node>,
        primitive_indices: Vec<u32>,
    ) -> Bvh {
        Bvh {
            bounds,
            bounds_end: None,
            root,
            nodes,
            primitive_indices,
            refit_generation: 0,
        }
    }

    pub fn root(&self) -> NodeLink {
        self.root
    }

    pub fn node(&self, index: NodeIdx) -> &Node {
        &self.nodes[index]
    }

    /// All allocated nodes, including ones not reachable from the root.
    pub fn nodes(&self) -> &IndexVec<NodeIdx, Node> {
        &self.nodes
    }

    /// Bounds of the whole tree at time 0.
    pub fn bounds(&self) -> &WorldBox {
        &self.bounds
    }

    /// Bounds of the whole tree at time 1, for motion blurred trees.
    pub fn bounds_end(&self) -> Option<&WorldBox> {
        self.bounds_end.as_ref()
    }

    /// Bounds of the whole tree at a given time.
    pub fn bounds_at(&self, time: f32) -> WorldBox {
        match &self.bounds_end {
            Some(end) => self.bounds.lerp(end, time),
            None => self.bounds,
        }
    }

    pub fn has_motion(&self) -> bool {
        self.bounds_end.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_null()
    }

    /// Source primitive indices, leaves reference contiguous ranges of this array.
    pub fn primitive_indices(&self) -> &[u32] {
        &self.primitive_indices
    }

    /// Primitive indices of one leaf.
    pub fn leaf_primitives(&self, range: PrimitiveRange) -> &[u32] {
        &self.primitive_indices[range.into_range()]
    }

    /// Number of nodes reachable from the root.
    pub fn reachable_node_count(&self) -> usize {
        let mut count = 0;
        self.visit_inner_nodes(|_, _| count += 1);
        count
    }

    /// Calls `f` with every inner node reachable from the root and its depth (root = 1), pre-order.
    pub fn visit_inner_nodes(&self, mut f: impl FnMut(NodeIdx, usize)) {
        let mut stack = vec![(self.root, 1usize)];
        while let Some((link, depth)) = stack.pop() {
            if let NodeRef::Inner { index } = link.decode() {
                f(index, depth);
                for child in self.nodes[index].children.iter().rev() {
                    stack.push((*child, depth + 1));
                }
            }
        }
    }
}

/// Compact tagged reference to a child: inner node index, leaf primitive range, or null.
/// Low bits store the leaf primitive count (0 for inner nodes).
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeLink(u32);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeRef {
    Empty,
    Inner { index: NodeIdx },
    Leaf { range: PrimitiveRange },
}

impl NodeLink {
    const COUNT_BITS: u32 = 3;
    const COUNT_MASK: u32 = (1 << Self::COUNT_BITS) - 1;
    const NULL_VALUE: u32 = (u32::MAX >> Self::COUNT_BITS) << Self::COUNT_BITS;

    pub const MAX_INDEX: u32 = (u32::MAX >> Self::COUNT_BITS) - 1;
    pub const MIN_COUNT: u32 = 1;
    pub const MAX_COUNT: u32 = (1 << Self::COUNT_BITS) - 1;

    pub const NULL: Self = Self(Self::NULL_VALUE);

    /// Create a new leaf link, panics if first or count are out of range
    pub fn new_leaf(first: u32, count: u32) -> Self {
        assert!(count >= Self::MIN_COUNT);
        assert!(count <= Self::MAX_COUNT);
        assert!(first <= Self::MAX_INDEX);
        Self((first << Self::COUNT_BITS) | count)
    }

    /// Create a new inner node link, panics if index is out of range
    pub fn new_inner(index: NodeIdx) -> Self {
        assert!(index.raw() <= Self::MAX_INDEX);
        Self(index.raw() << Self::COUNT_BITS)
    }

    pub fn decode(&self) -> NodeRef {
        if self.is_null() {
            NodeRef::Empty
        } else {
            let count = self.0 & Self::COUNT_MASK;
            let index = self.0 >> Self::COUNT_BITS;

            if count == 0 {
                NodeRef::Inner {
                    index: NodeIdx::from_raw_unchecked(index),
                }
            } else {
                NodeRef::Leaf {
                    range: PrimitiveRange { first: index, count },
                }
            }
        }
    }

    pub fn is_null(&self) -> bool {
        self.0 == Self::NULL_VALUE
    }

    pub fn is_inner(&self) -> bool {
        !self.is_null() && self.0 & Self::COUNT_MASK == 0
    }

    pub fn is_leaf(&self) -> bool {
        !self.is_null() && self.0 & Self::COUNT_MASK != 0
    }

    pub fn inner_index(&self) -> Option<NodeIdx> {
        match self.decode() {
            NodeRef::Inner { index } => Some(index),
            _ => None,
        }
    }
}

impl Default for NodeLink {
    fn default() -> Self {
        Self::NULL
    }
}

impl std::fmt::Debug for NodeLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeLink")
            .field("0", &self.0)
            .field("<decoded>", &self.decode())
            .finish()
    }
}

index_vec::define_index_type! {
    pub struct NodeIdx = u32;
    MAX_INDEX = NodeLink::MAX_INDEX as usize;
    IMPL_RAW_CONVERSIONS = true;
}

/// Contiguous run of `Bvh::primitive_indices`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PrimitiveRange {
    pub first: u32,
    pub count: u32,
}

impl PrimitiveRange {
    pub fn into_range(self) -> std::ops::Range<usize> {
        self.first as usize..(self.first + self.count) as usize
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use rand::{Rng as _, SeedableRng as _, rngs::SmallRng};

    use crate::geometry::{Ray, WorldBox, WorldPoint, WorldVector};

    /// Small random boxes scattered in a cube.
    pub fn random_boxes(count: usize, seed: u64) -> Vec<WorldBox> {
        let mut rng = SmallRng::seed_from_u64(seed);
        (0..count)
            .map(|_| {
                let min = WorldPoint::new(
                    rng.random_range(-100.0..100.0),
                    rng.random_range(-100.0..100.0),
                    rng.random_range(-100.0..100.0),
                );
                let size = WorldVector::new(
                    rng.random_range(0.0..5.0),
                    rng.random_range(0.0..5.0),
                    rng.random_range(0.0..5.0),
                );
                WorldBox::new(min, min + size)
            })
            .collect()
    }

    /// Same boxes shifted, as a motion blurred end state.
    pub struct MovingBoxes {
        pub start: Vec<WorldBox>,
        pub end: Vec<WorldBox>,
    }

    impl MovingBoxes {
        pub fn new(start: Vec<WorldBox>, offset: WorldVector) -> Self {
            let end = start.iter().map(|b| b.map(|p| p + offset)).collect();
            MovingBoxes { start, end }
        }
    }

    /// Treats every box as a solid primitive hit at its entry distance.
    pub struct BoxIntersector {
        start: Vec<WorldBox>,
        end: Option<Vec<WorldBox>>,
    }

    impl BoxIntersector {
        pub fn new(boxes: &[WorldBox]) -> Self {
            BoxIntersector {
                start: boxes.to_vec(),
                end: None,
            }
        }

        pub fn moving(boxes: &MovingBoxes) -> Self {
            BoxIntersector {
                start: boxes.start.clone(),
                end: Some(boxes.end.clone()),
            }
        }

        fn entry(&self, ray: &Ray, primitive: u32) -> Option<f32> {
            let i = primitive as usize;
            let b = match &self.end {
                Some(end) => self.start[i].lerp(&end[i], ray.time),
                None => self.start[i],
            };
            let ta = (b.min - ray.origin).component_mul(&ray.inv_direction);
            let tb = (b.max - ray.origin).component_mul(&ray.inv_direction);
            let t1 = ta.inf(&tb).max();
            let t2 = ta.sup(&tb).min();
            (t1 <= t2 && t1 > ray.tnear && t1 < ray.tfar).then_some(t1)
        }
    }

    impl super::PrimitiveIntersector for BoxIntersector {
        type Hit = (u32, f32);

        fn intersect(&self, ray: &mut Ray, primitives: &[u32]) -> Option<Self::Hit> {
            let mut best = None;
            for primitive in primitives {
                if let Some(t) = self.entry(ray, *primitive) {
                    ray.tfar = t;
                    best = Some((*primitive, t));
                }
            }
            best
        }

        fn occluded(&self, ray: &Ray, primitives: &[u32]) -> bool {
            primitives.iter().any(|p| self.entry(ray, *p).is_some())
        }
    }

    impl super::PrimitiveSource for MovingBoxes {
        fn primitive_count(&self) -> usize {
            self.start.len()
        }

        fn primitive_bounds(&self, index: usize) -> WorldBox {
            self.start[index]
        }

        fn has_motion(&self) -> bool {
            true
        }

        fn primitive_bounds_end(&self, index: usize) -> WorldBox {
            self.end[index]
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use assert2::{assert, let_assert};
    use test_strategy::proptest;

    #[proptest]
    fn node_link_construction_leaf(
        #[strategy(0u32..=NodeLink::MAX_INDEX)] first: u32,
        #[strategy(1u32..=NodeLink::MAX_COUNT)] count: u32,
    ) {
        let link = NodeLink::new_leaf(first, count);
        let_assert!(NodeRef::Leaf { range } = link.decode());
        assert!(range.first == first);
        assert!(range.count == count);
        assert!(link.is_leaf());
        assert!(!link.is_inner());
    }

    #[proptest]
    fn node_link_construction_inner(#[strategy(0u32..=NodeLink::MAX_INDEX)] index: u32) {
        let link = NodeLink::new_inner(index.into());
        let_assert!(NodeRef::Inner { index: decoded } = link.decode());
        assert!(decoded.raw() == index);
        assert!(link.inner_index() == Some(decoded));
    }

    #[test]
    fn node_link_construction_null() {
        let link = NodeLink::NULL;
        assert!(link.decode() == NodeRef::Empty);
        assert!(NodeLink::default() == NodeLink::NULL);
        assert!(!link.is_leaf());
        assert!(!link.is_inner());
    }

    #[test]
    #[should_panic]
    fn node_link_invalid_leaf_count_zero() {
        NodeLink::new_leaf(0, 0);
    }

    #[test]
    #[should_panic]
    fn node_link_invalid_leaf_count_too_high() {
        NodeLink::new_leaf(0, NodeLink::MAX_COUNT + 1);
    }

    #[test]
    #[should_panic]
    fn node_link_leaf_index_out_of_range() {
        NodeLink::new_leaf(NodeLink::MAX_INDEX + 1, 1);
    }

    #[test]
    #[should_panic]
    fn node_link_inner_index_out_of_range() {
        NodeLink::new_inner((NodeLink::MAX_INDEX + 1).into());
    }

    #[test]
    fn empty_tree() {
        let bvh = Bvh::empty();
        assert!(bvh.is_empty());
        assert!(bvh.reachable_node_count() == 0);
        assert!(bvh.primitive_indices().is_empty());
    }

    #[test]
    fn child_mask_skips_null_links() {
        let mut node = Node::default();
        node.children[1] = NodeLink::new_leaf(0, 1);
        node.children[3] = NodeLink::new_inner(NodeIdx::from_raw(5));
        assert!(node.child_mask() == 0b1010);
        assert!(node.child_count() == 2);
    }
}
