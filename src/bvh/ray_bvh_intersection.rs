use std::cmp::Reverse;

use arrayvec::ArrayVec;
use ordered_float::OrderedFloat;
use wide::f32x4;

use super::{BRANCHING_FACTOR, Bvh, Node, NodeLink, NodeRef, PrimitiveIntersector, STACK_SIZE};
use crate::geometry::{Ray, RayIntersectionExt as _};
use crate::util::bit_iter;
use crate::util::simd::SimdFloat as _;

type TraversalStack = ArrayVec<(NodeLink, f32), STACK_SIZE>;

impl Bvh {
    /// Closest hit along the ray. On hit, `ray.tfar` is shrunk to the hit distance.
    pub fn intersect_with<I: PrimitiveIntersector + ?Sized>(
        &self,
        ray: &mut Ray,
        intersector: &I,
    ) -> Option<I::Hit> {
        let mut stack = TraversalStack::new();
        stack.push((self.root, ray.tnear));

        let mut best = None;

        while let Some((link, t_entry)) = stack.pop() {
            if t_entry > ray.tfar {
                // Entry point is behind a hit found meanwhile
                continue;
            }

            match link.decode() {
                NodeRef::Empty => continue,
                NodeRef::Inner { index } => {
                    let mut children: ArrayVec<(f32, NodeLink), BRANCHING_FACTOR> =
                        hit_children(&self.nodes[index], ray).collect();
                    // Nearest child gets popped first
                    children.sort_unstable_by_key(|(t, _)| Reverse(OrderedFloat(*t)));
                    for (t, child) in children {
                        stack.push((child, t));
                    }
                }
                NodeRef::Leaf { range } => {
                    if let Some(hit) = intersector.intersect(ray, self.leaf_primitives(range)) {
                        best = Some(hit);
                    }
                }
            }
        }

        best
    }

    /// Whether anything blocks the ray within its range.
    pub fn occluded_with<I: PrimitiveIntersector + ?Sized>(&self, ray: &Ray, intersector: &I) -> bool {
        let mut stack = TraversalStack::new();
        stack.push((self.root, ray.tnear));

        while let Some((link, _)) = stack.pop() {
            match link.decode() {
                NodeRef::Empty => continue,
                NodeRef::Inner { index } => {
                    for (t, child) in hit_children(&self.nodes[index], ray) {
                        stack.push((child, t));
                    }
                }
                NodeRef::Leaf { range } => {
                    if intersector.occluded(ray, self.leaf_primitives(range)) {
                        return true;
                    }
                }
            }
        }

        false
    }
}

/// Children whose boxes overlap the ray's current range, with their entry distances.
fn hit_children(node: &Node, ray: &Ray) -> impl Iterator<Item = (f32, NodeLink)> {
    let (t1, t2) = node.bounds_at(ray.time).intersect(ray);
    let t1 = t1.max(f32x4::splat(ray.tnear));
    let t2 = t2.min(f32x4::splat(ray.tfar));
    // Null slots have empty boxes that still pass the slab test
    let mask = t1.simd_le(t2).bitmask() & node.child_mask() as u64;

    let children = node.children;
    bit_iter(mask).map(move |i| (t1.extract(i), children[i]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bvh::test_util::{BoxIntersector, MovingBoxes, random_boxes};
    use crate::bvh::{BuildSettings, MortonBuilder, RotateSettings};
    use crate::geometry::{WorldBox, WorldPoint, WorldVector};
    use assert2::{assert, let_assert};
    use rand::{Rng as _, SeedableRng as _, rngs::SmallRng};

    fn random_rays(count: usize, seed: u64) -> Vec<Ray> {
        let mut rng = SmallRng::seed_from_u64(seed);
        (0..count)
            .map(|_| {
                let origin = WorldPoint::new(
                    rng.random_range(-150.0..150.0),
                    rng.random_range(-150.0..150.0),
                    rng.random_range(-150.0..150.0),
                );
                let target = WorldPoint::new(
                    rng.random_range(-80.0..80.0),
                    rng.random_range(-80.0..80.0),
                    rng.random_range(-80.0..80.0),
                );
                Ray::new(origin, target - origin)
            })
            .collect()
    }

    #[test]
    fn matches_brute_force() {
        let boxes = random_boxes(3000, 1);
        let intersector = BoxIntersector::new(&boxes);
        let mut bvh = MortonBuilder::new(BuildSettings::default())
            .build(boxes.as_slice())
            .unwrap();
        bvh.rotate(&RotateSettings::default());

        let all: Vec<u32> = (0..boxes.len() as u32).collect();
        let mut hit_count = 0;
        for ray in random_rays(500, 2) {
            let mut expected_ray = ray;
            let expected = intersector.intersect(&mut expected_ray, &all);

            let mut traced = ray;
            let hit = bvh.intersect_with(&mut traced, &intersector);

            assert!(hit.map(|h| h.1) == expected.map(|h| h.1));
            assert!(traced.tfar == expected_ray.tfar);
            assert!(bvh.occluded_with(&ray, &intersector) == expected.is_some());
            hit_count += hit.is_some() as usize;
        }
        assert!(hit_count > 50);
    }

    #[test]
    fn miss_leaves_ray_untouched() {
        let boxes = random_boxes(100, 3);
        let intersector = BoxIntersector::new(&boxes);
        let bvh = MortonBuilder::new(BuildSettings::default())
            .build(boxes.as_slice())
            .unwrap();

        let mut ray = Ray::new(WorldPoint::new(0.0, 500.0, 0.0), WorldVector::y());
        assert!(bvh.intersect_with(&mut ray, &intersector).is_none());
        assert!(ray.tfar == f32::INFINITY);
        assert!(!bvh.occluded_with(&ray, &intersector));
    }

    #[test]
    fn range_limits_hits() {
        let boxes = vec![WorldBox::new(
            WorldPoint::new(-1.0, -1.0, 10.0),
            WorldPoint::new(1.0, 1.0, 11.0),
        ); 8];
        let intersector = BoxIntersector::new(&boxes);
        let bvh = MortonBuilder::new(BuildSettings::default())
            .build(boxes.as_slice())
            .unwrap();

        let ray = Ray::new(WorldPoint::origin(), WorldVector::z());
        assert!(bvh.occluded_with(&ray, &intersector));
        assert!(!bvh.occluded_with(&ray.with_range(0.0, 5.0), &intersector));

        let mut ray = ray;
        let_assert!(Some((_, t)) = bvh.intersect_with(&mut ray, &intersector));
        assert!(t == 10.0);
    }

    #[test]
    fn empty_tree_misses() {
        let bvh = Bvh::empty();
        let intersector = BoxIntersector::new(&[]);
        let mut ray = Ray::new(WorldPoint::origin(), WorldVector::x());
        assert!(bvh.intersect_with(&mut ray, &intersector).is_none());
        assert!(!bvh.occluded_with(&ray, &intersector));
    }

    #[test]
    fn motion_blurred_boxes_follow_time() {
        let start = vec![WorldBox::new(
            WorldPoint::new(-1.0, -1.0, 5.0),
            WorldPoint::new(1.0, 1.0, 6.0),
        ); 10];
        let source = MovingBoxes::new(start, WorldVector::new(10.0, 0.0, 0.0));
        let intersector = BoxIntersector::moving(&source);
        let bvh = MortonBuilder::new(BuildSettings::default())
            .build(&source)
            .unwrap();

        let ray = Ray::new(WorldPoint::origin(), WorldVector::z());
        assert!(bvh.occluded_with(&ray.at_time(0.0), &intersector));
        assert!(!bvh.occluded_with(&ray.at_time(1.0), &intersector));

        let shifted = Ray::new(WorldPoint::new(10.0, 0.0, 0.0), WorldVector::z());
        assert!(bvh.occluded_with(&shifted.at_time(1.0), &intersector));
        let halfway = Ray::new(WorldPoint::new(5.0, 0.0, 0.0), WorldVector::z());
        assert!(bvh.occluded_with(&halfway.at_time(0.5), &intersector));
    }
}
