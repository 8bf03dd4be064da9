use thiserror::Error;

use super::{Bvh, NodeIdx, NodeLink, NodeRef, PrimitiveSource};
use crate::geometry::WorldBox;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("tree references {referenced} primitives, source has {expected}")]
    PrimitiveCount { referenced: usize, expected: usize },
    #[error("primitive {0} is referenced more than once")]
    DuplicatePrimitive(u32),
    #[error("primitive index {0} is out of range")]
    PrimitiveOutOfRange(u32),
    #[error("leaf range {first}..{end} is out of bounds")]
    LeafOutOfRange { first: u32, end: u32 },
    #[error("position {0} of the primitive index array belongs to more than one leaf")]
    OverlappingLeaves(usize),
    #[error("position {0} of the primitive index array belongs to no leaf")]
    UncoveredPosition(usize),
    #[error("node {0:?} is reachable more than once")]
    SharedNode(NodeIdx),
    #[error("inner node {0:?} has no children")]
    EmptyNode(NodeIdx),
    #[error("bounds of node {node:?} slot {slot} are {cached:?}, children span {actual:?}")]
    ChildBounds {
        node: NodeIdx,
        slot: usize,
        cached: WorldBox,
        actual: WorldBox,
    },
    #[error("tree bounds are {cached:?}, primitives span {actual:?}")]
    TreeBounds { cached: WorldBox, actual: WorldBox },
}

impl Bvh {
    /// Checks the structural invariants against the primitives the tree was built or refitted from:
    /// leaves partition the primitives and every cached box is the exact union of its subtree.
    pub fn validate<S: PrimitiveSource + ?Sized>(&self, source: &S) -> Result<(), ValidationError> {
        let count = source.primitive_count();
        if self.primitive_indices.len() != count {
            return Err(ValidationError::PrimitiveCount {
                referenced: self.primitive_indices.len(),
                expected: count,
            });
        }

        let mut seen_primitives = vec![false; count];
        for index in &self.primitive_indices {
            let seen = seen_primitives
                .get_mut(*index as usize)
                .ok_or(ValidationError::PrimitiveOutOfRange(*index))?;
            if *seen {
                return Err(ValidationError::DuplicatePrimitive(*index));
            }
            *seen = true;
        }

        let mut state = ValidationState {
            bvh: self,
            source,
            visited_nodes: vec![false; self.nodes.len()],
            covered_positions: vec![false; count],
        };
        let (bounds, bounds_end) = state.check(self.root)?;

        if let Some(position) = state.covered_positions.iter().position(|covered| !covered) {
            return Err(ValidationError::UncoveredPosition(position));
        }
        if bounds != self.bounds {
            return Err(ValidationError::TreeBounds {
                cached: self.bounds,
                actual: bounds,
            });
        }
        if let Some(cached) = self.bounds_end {
            if cached != bounds_end {
                return Err(ValidationError::TreeBounds {
                    cached,
                    actual: bounds_end,
                });
            }
        }

        Ok(())
    }

    /// Number of inner node levels, 0 for trees that are a single leaf.
    pub fn depth(&self) -> usize {
        let mut max = 0;
        self.visit_inner_nodes(|_, depth| max = max.max(depth));
        max
    }
}

struct ValidationState<'a, S: ?Sized> {
    bvh: &'a Bvh,
    source: &'a S,
    visited_nodes: Vec<bool>,
    /// Positions of `primitive_indices` already claimed by a leaf
    covered_positions: Vec<bool>,
}

impl<S: PrimitiveSource + ?Sized> ValidationState<'_, S> {
    /// Returns the recomputed bounds of the subtree at both time steps.
    fn check(&mut self, link: NodeLink) -> Result<(WorldBox, WorldBox), ValidationError> {
        match link.decode() {
            NodeRef::Empty => Ok((WorldBox::empty(), WorldBox::empty())),
            NodeRef::Leaf { range } => {
                let end = range.first + range.count;
                let bvh = self.bvh;
                let primitives = bvh
                    .primitive_indices
                    .get(range.into_range())
                    .ok_or(ValidationError::LeafOutOfRange {
                        first: range.first,
                        end,
                    })?;
                for position in range.into_range() {
                    let covered = &mut self.covered_positions[position];
                    if *covered {
                        return Err(ValidationError::OverlappingLeaves(position));
                    }
                    *covered = true;
                }

                Ok(primitives.iter().fold(
                    (WorldBox::empty(), WorldBox::empty()),
                    |(start, end), primitive| {
                        let primitive = *primitive as usize;
                        (
                            start + &self.source.primitive_bounds(primitive),
                            end + &self.source.primitive_bounds_end(primitive),
                        )
                    },
                ))
            }
            NodeRef::Inner { index } => {
                let visited = &mut self.visited_nodes[index.index()];
                if *visited {
                    return Err(ValidationError::SharedNode(index));
                }
                *visited = true;

                let bvh = self.bvh;
                let node = &bvh.nodes[index];
                if node.child_mask() == 0 {
                    return Err(ValidationError::EmptyNode(index));
                }

                let mut bounds = WorldBox::empty();
                let mut bounds_end = WorldBox::empty();
                for (slot, child) in node.children.iter().enumerate() {
                    let (start, end) = self.check(*child)?;

                    let cached = node.bounds.extract(slot);
                    if cached != start {
                        return Err(ValidationError::ChildBounds {
                            node: index,
                            slot,
                            cached,
                            actual: start,
                        });
                    }
                    if let Some(node_end) = &node.bounds_end {
                        let cached = node_end.extract(slot);
                        if cached != end {
                            return Err(ValidationError::ChildBounds {
                                node: index,
                                slot,
                                cached,
                                actual: end,
                            });
                        }
                    }

                    bounds.extend(&start);
                    bounds_end.extend(&end);
                }
                Ok((bounds, bounds_end))
            }
        }
    }
}
