use tracing::debug;

use super::{Bvh, NodeLink, NodeRef, PrimitiveSource};
use crate::geometry::{Box4, WorldBox};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RefitStats {
    /// Inner nodes whose bounds were recomputed
    pub nodes: usize,
    pub leaves: usize,
    pub generation: u32,
}

impl Bvh {
    /// Recomputes all bounds bottom up from the current primitive bounds, keeping the topology.
    ///
    /// Motion blurred sources get bounds for both time steps.
    pub fn refit<S: PrimitiveSource + ?Sized>(&mut self, source: &S) -> RefitStats {
        self.refit_generation = self.refit_generation.wrapping_add(1);
        let mut stats = RefitStats {
            generation: self.refit_generation,
            ..RefitStats::default()
        };

        let motion = source.has_motion();
        let (bounds, bounds_end) = self.refit_recursive(self.root, source, motion, &mut stats);
        self.bounds = bounds;
        self.bounds_end = motion.then_some(bounds_end);

        debug!(nodes = stats.nodes, leaves = stats.leaves, "refitted bvh");
        stats
    }

    /// Generation of the last refit, 0 if the tree was never refitted.
    pub fn refit_generation(&self) -> u32 {
        self.refit_generation
    }

    fn refit_recursive<S: PrimitiveSource + ?Sized>(
        &mut self,
        link: NodeLink,
        source: &S,
        motion: bool,
        stats: &mut RefitStats,
    ) -> (WorldBox, WorldBox) {
        match link.decode() {
            NodeRef::Empty => (WorldBox::empty(), WorldBox::empty()),
            NodeRef::Leaf { range } => {
                stats.leaves += 1;
                self.primitive_indices[range.into_range()].iter().fold(
                    (WorldBox::empty(), WorldBox::empty()),
                    |(start, end), primitive| {
                        let primitive = *primitive as usize;
                        let primitive_end = if motion {
                            source.primitive_bounds_end(primitive)
                        } else {
                            WorldBox::empty()
                        };
                        (
                            start + &source.primitive_bounds(primitive),
                            end + &primitive_end,
                        )
                    },
                )
            }
            NodeRef::Inner { index } => {
                // A node is visited once per pass even if reached again
                if self.nodes[index].refit_generation != self.refit_generation {
                    let children = self.nodes[index].children;
                    let mut bounds = Box4::empty();
                    let mut bounds_end = Box4::empty();
                    for (i, child) in children.into_iter().enumerate() {
                        let (start, end) = self.refit_recursive(child, source, motion, stats);
                        bounds.replace(i, &start);
                        bounds_end.replace(i, &end);
                    }

                    let node = &mut self.nodes[index];
                    node.bounds = bounds;
                    node.bounds_end = motion.then_some(bounds_end);
                    node.refit_generation = self.refit_generation;
                    stats.nodes += 1;
                }

                let node = &self.nodes[index];
                (
                    node.bounds.merged(),
                    node.bounds_end.as_ref().map_or_else(WorldBox::empty, Box4::merged),
                )
            }
        }
    }
}
