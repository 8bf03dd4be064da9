use std::cmp::Reverse;

use arrayvec::ArrayVec;
use ordered_float::OrderedFloat;
use wide::f32x8;

use super::{BRANCHING_FACTOR, Bvh, Node, NodeLink, NodeRef, PrimitiveIntersector, STACK_SIZE};
use crate::geometry::{PACKET_WIDTH, RayIntersectionExt as _, RayPacket, intersect_motion_box_packet};
use crate::util::bit_iter;
use crate::util::simd::SimdFloat as _;

/// Pending node with per lane entry distances and the lanes that reached it.
#[derive(Copy, Clone, Debug)]
struct StackEntry {
    link: NodeLink,
    distance: f32x8,
    lanes: u8,
}

type PacketStack = ArrayVec<StackEntry, STACK_SIZE>;

impl Bvh {
    /// Closest hit for every active lane of the packet, shrinking `tfar` of lanes that hit.
    ///
    /// Lanes get the same hits as tracing their rays one by one.
    pub fn intersect_packet_with<I: PrimitiveIntersector + ?Sized>(
        &self,
        packet: &mut RayPacket,
        intersector: &I,
    ) -> [Option<I::Hit>; PACKET_WIDTH] {
        let mut hits = [None; PACKET_WIDTH];
        let mut stack = PacketStack::new();
        stack.push(StackEntry {
            link: self.root,
            distance: packet.tnear,
            lanes: packet.active,
        });

        while let Some(entry) = stack.pop() {
            let lanes = entry.lanes & entry.distance.simd_le(packet.tfar).bitmask() as u8;
            if lanes == 0 {
                continue;
            }

            match entry.link.decode() {
                NodeRef::Empty => continue,
                NodeRef::Inner { index } => {
                    let mut children = hit_children(&self.nodes[index], packet, lanes);
                    // Child with the nearest lane gets popped first
                    children.sort_unstable_by_key(|child| {
                        Reverse(OrderedFloat(child.distance.reduce_min()))
                    });
                    stack.extend(children);
                }
                NodeRef::Leaf { range } => {
                    intersector.intersect_packet(
                        packet,
                        lanes,
                        self.leaf_primitives(range),
                        &mut hits,
                    );
                }
            }
        }

        hits
    }

    /// Mask of active lanes whose ray is blocked within its range.
    pub fn occluded_packet_with<I: PrimitiveIntersector + ?Sized>(
        &self,
        packet: &RayPacket,
        intersector: &I,
    ) -> u8 {
        let mut occluded = 0u8;
        let mut stack = PacketStack::new();
        stack.push(StackEntry {
            link: self.root,
            distance: packet.tnear,
            lanes: packet.active,
        });

        while let Some(entry) = stack.pop() {
            let lanes = entry.lanes & !occluded;
            if lanes == 0 {
                continue;
            }

            match entry.link.decode() {
                NodeRef::Empty => continue,
                NodeRef::Inner { index } => {
                    stack.extend(hit_children(&self.nodes[index], packet, lanes));
                }
                NodeRef::Leaf { range } => {
                    occluded |=
                        intersector.occluded_packet(packet, lanes, self.leaf_primitives(range));
                    if occluded == packet.active {
                        break;
                    }
                }
            }
        }

        occluded
    }
}

/// Children hit by at least one of `lanes`, lanes that miss a child get infinite distance.
fn hit_children(
    node: &Node,
    packet: &RayPacket,
    lanes: u8,
) -> ArrayVec<StackEntry, BRANCHING_FACTOR> {
    bit_iter(node.child_mask())
        .filter_map(|i| {
            let bounds = node.bounds.extract(i);
            let (t1, t2) = match &node.bounds_end {
                Some(end) => intersect_motion_box_packet(&bounds, &end.extract(i), packet),
                None => bounds.intersect(packet),
            };
            let t1 = t1.max(packet.tnear);
            let t2 = t2.min(packet.tfar);
            let hit = lanes & t1.simd_le(t2).bitmask() as u8;

            (hit != 0).then(|| StackEntry {
                link: node.children[i],
                distance: f32x8::select(f32x8::mask_from_bits(hit as u64), t1, f32x8::infinity()),
                lanes: hit,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bvh::test_util::{BoxIntersector, MovingBoxes, random_boxes};
    use crate::bvh::{BuildSettings, MortonBuilder};
    use crate::geometry::{Ray, WorldPoint, WorldVector};
    use assert2::assert;
    use rand::{Rng as _, SeedableRng as _, rngs::SmallRng};

    fn random_ray(rng: &mut SmallRng) -> Ray {
        let origin = WorldPoint::new(
            rng.random_range(-150.0..150.0),
            rng.random_range(-150.0..150.0),
            -150.0,
        );
        let target = WorldPoint::new(
            rng.random_range(-90.0..90.0),
            rng.random_range(-90.0..90.0),
            rng.random_range(-90.0..90.0),
        );
        Ray::new(origin, target - origin).at_time(rng.random_range(0.0..1.0))
    }

    fn check_against_single_rays(bvh: &Bvh, intersector: &BoxIntersector, seed: u64) {
        let mut rng = SmallRng::seed_from_u64(seed);
        for ray_count in [1, 5, 8, 8, 8, 8, 8, 8, 8, 8] {
            let rays: Vec<Ray> = (0..ray_count).map(|_| random_ray(&mut rng)).collect();

            let mut packet = RayPacket::from_rays(&rays);
            let packet_hits = bvh.intersect_packet_with(&mut packet, intersector);
            let occluded = bvh.occluded_packet_with(&RayPacket::from_rays(&rays), intersector);

            for (lane, ray) in rays.iter().enumerate() {
                let mut single = *ray;
                let hit = bvh.intersect_with(&mut single, intersector);
                assert!(packet_hits[lane].map(|h| h.1) == hit.map(|h| h.1));
                assert!(packet.ray(lane).tfar == single.tfar);
                assert!((occluded & (1 << lane) != 0) == bvh.occluded_with(ray, intersector));
            }
            for lane in ray_count..PACKET_WIDTH {
                assert!(packet_hits[lane].is_none());
                assert!(occluded & (1 << lane) == 0);
            }
        }
    }

    #[test]
    fn packet_matches_single_rays() {
        let boxes = random_boxes(4000, 31);
        let bvh = MortonBuilder::new(BuildSettings::default())
            .build(boxes.as_slice())
            .unwrap();
        check_against_single_rays(&bvh, &BoxIntersector::new(&boxes), 5);
    }

    #[test]
    fn motion_packet_matches_single_rays() {
        let source = MovingBoxes::new(random_boxes(2000, 32), WorldVector::new(20.0, 0.0, 0.0));
        let bvh = MortonBuilder::new(BuildSettings::default())
            .build(&source)
            .unwrap();
        check_against_single_rays(&bvh, &BoxIntersector::moving(&source), 6);
    }

    #[test]
    fn inactive_packet_does_nothing() {
        let boxes = random_boxes(100, 1);
        let bvh = MortonBuilder::new(BuildSettings::default())
            .build(boxes.as_slice())
            .unwrap();
        let intersector = BoxIntersector::new(&boxes);
        let mut packet = RayPacket::from_rays(&[]);
        assert!(bvh.intersect_packet_with(&mut packet, &intersector).iter().all(Option::is_none));
        assert!(bvh.occluded_packet_with(&packet, &intersector) == 0);
    }
}
