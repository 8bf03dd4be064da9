use std::fmt::Display;

use super::{Bvh, Node, NodeLink, NodeRef};
use crate::geometry::WorldBox;
use crate::util::Stats;

/// Traversal cost of entering an inner node, relative to intersecting one primitive.
const TRAVERSAL_COST: f32 = 1.0;
const INTERSECTION_COST: f32 = 1.0;

#[derive(Clone, Debug)]
pub struct BvhStatistics {
    pub inner_nodes: usize,
    pub leaves: usize,
    pub primitives: usize,
    /// Expected traversal cost of a random ray hitting the root box
    pub sah: f32,
    pub leaf_depths: Stats,
    pub leaf_sizes: Stats,
    pub child_counts: Stats,
    pub node_bytes: usize,
}

impl Bvh {
    pub fn statistics(&self) -> BvhStatistics {
        let mut stats = BvhStatistics {
            inner_nodes: 0,
            leaves: 0,
            primitives: self.primitive_indices.len(),
            sah: 0.0,
            leaf_depths: Stats::default(),
            leaf_sizes: Stats::default(),
            child_counts: Stats::default(),
            node_bytes: 0,
        };

        let cost = self.statistics_recursive(self.root, self.bounds.half_area(), 0, &mut stats);
        let root_area = self.bounds.half_area();
        stats.sah = if root_area > 0.0 { cost / root_area } else { 0.0 };
        stats.node_bytes = stats.inner_nodes * std::mem::size_of::<Node>();

        stats
    }

    /// Returns area weighted cost of the subtree.
    fn statistics_recursive(
        &self,
        link: NodeLink,
        area: f32,
        depth: usize,
        stats: &mut BvhStatistics,
    ) -> f32 {
        match link.decode() {
            NodeRef::Empty => 0.0,
            NodeRef::Leaf { range } => {
                stats.leaves += 1;
                stats.leaf_depths.add_sample(depth);
                stats.leaf_sizes.add_sample(range.count as usize);
                INTERSECTION_COST * area * range.count as f32
            }
            NodeRef::Inner { index } => {
                stats.inner_nodes += 1;
                let node = &self.nodes[index];
                stats.child_counts.add_sample(node.child_count());

                let children_cost: f32 = node
                    .children
                    .iter()
                    .enumerate()
                    .map(|(i, child)| {
                        let child_area = node.bounds.extract(i).half_area();
                        self.statistics_recursive(*child, child_area, depth + 1, stats)
                    })
                    .sum();
                TRAVERSAL_COST * area + children_cost
            }
        }
    }

    pub fn print_statistics(&self) {
        println!("{}", self.statistics());
    }

    pub fn print_tree(&self) {
        self.print_recursive(0, self.root, &self.bounds);
    }

    fn print_recursive(&self, indent: usize, link: NodeLink, bounds: &WorldBox) {
        let indent_str = "  ".repeat(indent);
        match link.decode() {
            NodeRef::Empty => {}
            NodeRef::Leaf { range } => {
                println!(
                    "{indent_str}- L{:?}: {:?}-{:?}",
                    self.leaf_primitives(range),
                    bounds.min,
                    bounds.max,
                );
            }
            NodeRef::Inner { index } => {
                println!(
                    "{indent_str}- I{}: {:?}-{:?}",
                    index.index(),
                    bounds.min,
                    bounds.max,
                );
                let node = &self.nodes[index];
                for (i, child) in node.children.iter().enumerate() {
                    self.print_recursive(indent + 1, *child, &node.bounds.extract(i));
                }
            }
        }
    }
}

impl Display for BvhStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "sah = {:.2}", self.sah)?;
        writeln!(f, "depth = {}", self.leaf_depths)?;
        writeln!(
            f,
            "nodes = {} ({:.1} MB) ({:.1}% used)",
            self.inner_nodes,
            self.node_bytes as f64 / 1e6,
            100.0 * self.child_counts.avg() / super::BRANCHING_FACTOR as f32,
        )?;
        writeln!(f, "leaves = {} ({} primitives)", self.leaves, self.primitives)?;
        write!(f, "leaf sizes = {}", self.leaf_sizes)
    }
}
