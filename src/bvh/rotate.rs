use tracing::debug;

use super::{BRANCHING_FACTOR, Bvh, MAX_DEPTH, NodeIdx, NodeLink};
use crate::geometry::{Box4, WorldBox};

#[derive(Copy, Clone, Debug)]
pub struct RotateSettings {
    /// Rotations never push a subtree below this many inner node levels.
    /// Must not exceed `MAX_DEPTH`, the depth traversal stacks are sized for.
    pub max_depth: usize,
}

impl Default for RotateSettings {
    fn default() -> Self {
        RotateSettings {
            max_depth: MAX_DEPTH,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RotationStats {
    pub swaps: usize,
    /// Upper bound on the depth of the tree after rotating
    pub depth: usize,
}

/// Chosen exchange between a child of the node and a grandchild.
#[derive(Copy, Clone, Debug)]
struct Swap {
    /// Inner child whose child gets pulled up
    child: usize,
    /// Sibling of `child` that gets pushed down
    other: usize,
    /// Slot inside `child` receiving `other`
    target: usize,
}

impl Bvh {
    /// Greedy single pass of tree rotations, reducing the summed surface area of child boxes.
    ///
    /// Every inner node is visited after its children. At most one swap is done per node,
    /// the first of the equally good ones in slot order.
    pub fn rotate(&mut self, settings: &RotateSettings) -> RotationStats {
        assert!(
            settings.max_depth <= MAX_DEPTH,
            "rotation depth limit {} exceeds {MAX_DEPTH}",
            settings.max_depth
        );
        let mut stats = RotationStats::default();
        stats.depth = self.rotate_recursive(self.root, 1, settings, &mut stats);
        debug!(swaps = stats.swaps, depth = stats.depth, "rotated bvh");
        stats
    }

    /// Returns the height of the subtree in inner node levels (0 for leaves).
    fn rotate_recursive(
        &mut self,
        link: NodeLink,
        depth: usize,
        settings: &RotateSettings,
        stats: &mut RotationStats,
    ) -> usize {
        let Some(index) = link.inner_index() else {
            return 0;
        };

        let children = self.nodes[index].children;
        let mut child_depths = [0usize; BRANCHING_FACTOR];
        for (child_depth, child) in child_depths.iter_mut().zip(children) {
            *child_depth = self.rotate_recursive(child, depth + 1, settings, stats);
        }

        if let Some(swap) = self.find_swap(index, depth, &child_depths, settings) {
            self.apply_swap(index, swap);
            stats.swaps += 1;
            // Conservative, the pulled up grandchild may have been on the deepest path
            child_depths[swap.other] += 1;
        }

        1 + child_depths.iter().max().copied().unwrap_or(0)
    }

    fn find_swap(
        &self,
        index: NodeIdx,
        depth: usize,
        child_depths: &[usize; BRANCHING_FACTOR],
        settings: &RotateSettings,
    ) -> Option<Swap> {
        let parent = &self.nodes[index];
        let others: [WorldBox; BRANCHING_FACTOR] =
            std::array::from_fn(|i| parent.bounds.extract(i));

        let mut best_cost = f32::INFINITY;
        let mut best = None;

        for (c, child_link) in parent.children.iter().enumerate() {
            let Some(child_index) = child_link.inner_index() else {
                continue;
            };
            let child = &self.nodes[child_index];
            let targets: [WorldBox; BRANCHING_FACTOR] =
                std::array::from_fn(|i| child.bounds.extract(i));

            // Cheapest target position for every candidate sibling
            let mut best_other: Option<(f32, usize, usize)> = None;
            for (n, other_link) in parent.children.iter().enumerate() {
                if other_link.is_null() || depth + 1 + child_depths[n] > settings.max_depth {
                    continue;
                }

                let mut best_target: Option<(f32, usize)> = None;
                for (t, target_link) in child.children.iter().enumerate() {
                    if target_link.is_null() {
                        continue;
                    }
                    let cost = targets
                        .iter()
                        .enumerate()
                        .map(|(i, b)| if i == t { &others[n] } else { b })
                        .fold(WorldBox::empty(), |acc, b| acc + b)
                        .half_area();
                    if best_target.is_none_or(|(best, _)| cost < best) {
                        best_target = Some((cost, t));
                    }
                }

                if let Some((cost, t)) = best_target {
                    if best_other.is_none_or(|(best, _, _)| cost < best) {
                        best_other = Some((cost, n, t));
                    }
                }
            }

            let Some((other_cost, n, t)) = best_other else {
                continue;
            };

            // Growing the child box is bad, shrinking it good
            let cost = other_cost - others[c].half_area();
            if cost < best_cost && n != c {
                best_cost = cost;
                best = Some(Swap {
                    child: c,
                    other: n,
                    target: t,
                });
            }
        }

        if best_cost >= 0.0 { None } else { best }
    }

    fn apply_swap(&mut self, index: NodeIdx, swap: Swap) {
        let Swap {
            child,
            other,
            target,
        } = swap;
        let Some(child_index) = self.nodes[index].children[child].inner_index() else {
            unreachable!("swaps are only chosen for inner children");
        };

        let mut parent = self.nodes[index].clone();
        let mut inner = self.nodes[child_index].clone();

        std::mem::swap(
            &mut parent.children[other],
            &mut inner.children[target],
        );
        swap_lanes(&mut parent.bounds, other, &mut inner.bounds, target);
        parent.bounds.replace(child, &inner.bounds.merged());

        if let (Some(parent_end), Some(inner_end)) =
            (parent.bounds_end.as_mut(), inner.bounds_end.as_mut())
        {
            swap_lanes(parent_end, other, inner_end, target);
            parent_end.replace(child, &inner_end.merged());
        }

        self.nodes[index] = parent;
        self.nodes[child_index] = inner;
    }
}

fn swap_lanes(a: &mut Box4, lane_a: usize, b: &mut Box4, lane_b: usize) {
    let tmp = a.extract(lane_a);
    a.replace(lane_a, &b.extract(lane_b));
    b.replace(lane_b, &tmp);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bvh::test_util::{MovingBoxes, random_boxes};
    use crate::bvh::{BuildSettings, MortonBuilder, Node, NodeIdx};
    use crate::geometry::{WorldPoint, WorldVector};
    use assert2::{assert, let_assert};
    use index_vec::IndexVec;

    fn unit_box(x: f32) -> WorldBox {
        WorldBox::new(WorldPoint::new(x, 0.0, 0.0), WorldPoint::new(x + 1.0, 1.0, 1.0))
    }

    /// Root with a far leaf and an inner child holding one near and one far leaf.
    fn badly_grouped_tree() -> (Vec<WorldBox>, Bvh) {
        let boxes = vec![unit_box(0.0), unit_box(1.0), unit_box(100.0)];
        let mut nodes = IndexVec::new();

        let mut root = Node::default();
        let mut inner = Node::default();

        inner.children[0] = NodeLink::new_leaf(1, 1);
        inner.bounds.replace(0, &boxes[1]);
        inner.children[1] = NodeLink::new_leaf(2, 1);
        inner.bounds.replace(1, &boxes[2]);

        root.children[0] = NodeLink::new_leaf(0, 1);
        root.bounds.replace(0, &boxes[0]);
        root.children[1] = NodeLink::new_inner(NodeIdx::from_raw(1));
        root.bounds.replace(1, &inner.bounds.merged());

        nodes.push(root);
        nodes.push(inner);

        let bounds = boxes.iter().fold(WorldBox::empty(), |acc, b| acc + b);
        let bvh = Bvh::from_parts(
            NodeLink::new_inner(NodeIdx::from_raw(0)),
            bounds,
            nodes,
            vec![0, 1, 2],
        );
        (boxes, bvh)
    }

    #[test]
    fn swaps_far_leaf_out() {
        let (boxes, mut bvh) = badly_grouped_tree();
        let before = bvh.statistics().sah;

        let stats = bvh.rotate(&RotateSettings::default());
        assert!(stats.swaps == 1);
        let_assert!(Ok(()) = bvh.validate(boxes.as_slice()));
        assert!(bvh.statistics().sah < before);

        // The near leaves now share the inner node
        let inner = bvh.node(NodeIdx::from_raw(1));
        assert!(inner.bounds.merged() == unit_box(0.0) + &unit_box(1.0));
    }

    #[test]
    fn depth_limit_blocks_swap() {
        let (_, mut bvh) = badly_grouped_tree();
        let stats = bvh.rotate(&RotateSettings { max_depth: 1 });
        assert!(stats.swaps == 0);
    }

    #[test]
    #[should_panic]
    fn depth_limit_above_maximum() {
        let (_, mut bvh) = badly_grouped_tree();
        bvh.rotate(&RotateSettings {
            max_depth: MAX_DEPTH + 1,
        });
    }

    #[test]
    fn converged_tree_is_left_alone() {
        let boxes = random_boxes(3000, 21);
        let mut bvh = MortonBuilder::new(BuildSettings::default())
            .build(boxes.as_slice())
            .unwrap();

        for _ in 0..100 {
            if bvh.rotate(&RotateSettings::default()).swaps == 0 {
                break;
            }
        }

        let converged = bvh.clone();
        let stats = bvh.rotate(&RotateSettings::default());
        assert!(stats.swaps == 0);
        assert!(bvh.nodes() == converged.nodes());
        let_assert!(Ok(()) = bvh.validate(boxes.as_slice()));
    }

    #[test]
    fn rotation_keeps_tree_valid_and_shallow() {
        let boxes = random_boxes(5000, 8);
        let mut bvh = MortonBuilder::new(BuildSettings::default())
            .build(boxes.as_slice())
            .unwrap();
        let before = bvh.statistics().sah;

        let settings = RotateSettings::default();
        let stats = bvh.rotate(&settings);
        let_assert!(Ok(()) = bvh.validate(boxes.as_slice()));
        assert!(bvh.depth() <= settings.max_depth);
        assert!(bvh.depth() <= stats.depth);
        assert!(bvh.statistics().sah <= before);
    }

    #[test]
    fn motion_bounds_follow_swaps() {
        let source = MovingBoxes::new(random_boxes(2000, 4), WorldVector::new(0.0, 10.0, 0.0));
        let mut bvh = MortonBuilder::new(BuildSettings::default())
            .build(&source)
            .unwrap();
        bvh.rotate(&RotateSettings::default());
        let_assert!(Ok(()) = bvh.validate(&source));
    }
}
