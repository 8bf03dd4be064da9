use arrayvec::ArrayVec;
use wide::{f32x4, f32x8};

use super::{FilterFn, Geometry, GeometryId, GeometryKind, Hit, Scene};
use crate::bvh::{MAX_LEAF_SIZE, PrimitiveIntersector, PrimitiveSource};
use crate::geometry::{
    CurveHit, MoellerHits, PACKET_WIDTH, Ray, RayPacket, TrianglePlane, TrianglePlanes, WorldBox,
    WorldVector,
};
use crate::util::bit_iter;
use crate::util::simd::{SimdFloat, Vector3x};

/// One primitive of a scene, as referenced from the tree's leaves.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct PrimRef {
    pub geom_id: GeometryId,
    pub prim_id: u32,
}

/// Every primitive of the scene, in geometry id order.
pub(crate) fn collect_primitives(scene: &Scene) -> Vec<PrimRef> {
    scene
        .iter()
        .flat_map(|(geom_id, geometry)| {
            (0..geometry.primitive_count() as u32).map(move |prim_id| PrimRef { geom_id, prim_id })
        })
        .collect()
}

/// Scene primitives seen as boxes for building and refitting.
pub(crate) struct ScenePrimitives<'a> {
    scene: &'a Scene,
    prims: &'a [PrimRef],
    motion: bool,
}

impl<'a> ScenePrimitives<'a> {
    pub fn new(scene: &'a Scene, prims: &'a [PrimRef]) -> Self {
        ScenePrimitives {
            scene,
            prims,
            motion: scene.has_motion(),
        }
    }

    fn bounds(&self, index: usize, time_step: usize) -> WorldBox {
        let prim = self.prims[index];
        self.scene
            .built_geometry(prim.geom_id)
            .primitive_bounds(prim.prim_id, time_step)
    }
}

impl PrimitiveSource for ScenePrimitives<'_> {
    fn primitive_count(&self) -> usize {
        self.prims.len()
    }

    fn primitive_bounds(&self, index: usize) -> WorldBox {
        self.bounds(index, 0)
    }

    fn has_motion(&self) -> bool {
        self.motion
    }

    fn primitive_bounds_end(&self, index: usize) -> WorldBox {
        self.bounds(index, 1)
    }
}

/// Leaf intersector dispatching on the geometry kind of each primitive.
///
/// Triangles of a leaf are tested together, four at once for single rays and
/// one triangle against all eight lanes for packets.
pub(crate) struct SceneIntersector<'a> {
    scene: &'a Scene,
    prims: &'a [PrimRef],
}

impl<'a> SceneIntersector<'a> {
    pub fn new(scene: &'a Scene, prims: &'a [PrimRef]) -> Self {
        SceneIntersector { scene, prims }
    }

    fn resolve(&self, index: u32) -> (PrimRef, &'a Geometry) {
        let prim = self.prims[index as usize];
        (prim, self.scene.built_geometry(prim.geom_id))
    }

    /// Triangles of the leaf with their planes at the ray's time.
    fn gather_triangles(
        &self,
        primitives: &[u32],
        time: f32,
    ) -> ArrayVec<(PrimRef, &'a Geometry, TrianglePlane), MAX_LEAF_SIZE> {
        primitives
            .iter()
            .filter_map(|&index| {
                let (prim, geometry) = self.resolve(index);
                match geometry.kind() {
                    GeometryKind::Triangles(mesh) => {
                        Some((prim, geometry, mesh.plane_at(prim.prim_id, time)))
                    }
                    _ => None,
                }
            })
            .collect()
    }

    fn intersect_triangles(&self, ray: &mut Ray, primitives: &[u32]) -> Option<Hit> {
        let triangles = self.gather_triangles(primitives, ray.time);
        if triangles.is_empty() {
            return None;
        }

        let hits = test_triangles(&triangles, ray);
        let mut candidates = hits.valid_bits();
        while let Some(lane) = hits.select_min(candidates) {
            let (prim, geometry, plane) = &triangles[lane];
            let hit = triangle_hit(&hits, lane, plane, prim);
            if passes(geometry.intersection_filter(), ray, &hit) {
                ray.tfar = hit.t;
                return Some(hit);
            }
            candidates &= !(1 << lane);
        }
        None
    }

    fn occluded_triangles(&self, ray: &Ray, primitives: &[u32]) -> bool {
        let triangles = self.gather_triangles(primitives, ray.time);
        if triangles.is_empty() {
            return false;
        }

        let hits = test_triangles(&triangles, ray);
        bit_iter(hits.valid_bits()).any(|lane| {
            let (prim, geometry, plane) = &triangles[lane];
            match geometry.occlusion_filter() {
                None => true,
                Some(filter) => filter(ray, &triangle_hit(&hits, lane, plane, prim)),
            }
        })
    }

    /// Closest hit with a curve or instance primitive, closer than `ray.tfar`.
    fn intersect_other(&self, ray: &mut Ray, index: u32) -> Option<Hit> {
        let (prim, geometry) = self.resolve(index);
        let hit = match geometry.kind() {
            GeometryKind::Triangles(_) => return None,
            GeometryKind::Curves(curves) => {
                let curve = curves.curve_at(prim.prim_id, ray.time);
                let hit = curve_hit(&prim, curve.intersect(ray)?);
                if !passes(geometry.intersection_filter(), ray, &hit) {
                    return None;
                }
                hit
            }
            GeometryKind::Instance(instance) => {
                let hit = instance.intersect(ray)?;
                Hit {
                    geom_id: prim.geom_id,
                    inner_geom_id: Some(hit.geom_id),
                    ..hit
                }
            }
        };
        ray.tfar = hit.t;
        Some(hit)
    }

    fn occluded_other(&self, ray: &Ray, index: u32) -> bool {
        let (prim, geometry) = self.resolve(index);
        match geometry.kind() {
            GeometryKind::Triangles(_) => false,
            GeometryKind::Curves(curves) => {
                let Some(hit) = curves.curve_at(prim.prim_id, ray.time).intersect(ray) else {
                    return false;
                };
                match geometry.occlusion_filter() {
                    None => true,
                    Some(filter) => filter(ray, &curve_hit(&prim, hit)),
                }
            }
            GeometryKind::Instance(instance) => instance.occluded(ray),
        }
    }

    fn is_triangle(&self, index: u32) -> bool {
        matches!(self.resolve(index).1.kind(), GeometryKind::Triangles(_))
    }

    /// Planes of one triangle for every lane of the packet.
    fn packet_planes(
        &self,
        prim: &PrimRef,
        geometry: &Geometry,
        packet: &RayPacket,
    ) -> Option<(TrianglePlanes<f32x8>, [TrianglePlane; PACKET_WIDTH])> {
        let GeometryKind::Triangles(mesh) = geometry.kind() else {
            return None;
        };
        let per_lane: [TrianglePlane; PACKET_WIDTH] = if mesh.has_motion() {
            std::array::from_fn(|lane| mesh.plane_at(prim.prim_id, packet.time.extract(lane)))
        } else {
            [mesh.plane_at(prim.prim_id, 0.0); PACKET_WIDTH]
        };
        let planes = if mesh.has_motion() {
            TrianglePlanes::from_fn(|lane| per_lane[lane])
        } else {
            TrianglePlanes::splat(&per_lane[0])
        };
        Some((planes, per_lane))
    }
}

impl PrimitiveIntersector for SceneIntersector<'_> {
    type Hit = Hit;

    fn intersect(&self, ray: &mut Ray, primitives: &[u32]) -> Option<Hit> {
        let mut best = self.intersect_triangles(ray, primitives);
        for &index in primitives {
            if let Some(hit) = self.intersect_other(ray, index) {
                best = Some(hit);
            }
        }
        best
    }

    fn occluded(&self, ray: &Ray, primitives: &[u32]) -> bool {
        self.occluded_triangles(ray, primitives)
            || primitives
                .iter()
                .any(|&index| self.occluded_other(ray, index))
    }

    fn intersect_packet(
        &self,
        packet: &mut RayPacket,
        lanes: u8,
        primitives: &[u32],
        hits: &mut [Option<Hit>; PACKET_WIDTH],
    ) {
        // Triangles first, in leaf order, like the single ray path
        for &index in primitives {
            let (prim, geometry) = self.resolve(index);
            let Some((planes, per_lane)) = self.packet_planes(&prim, geometry, packet) else {
                continue;
            };
            let result = planes.intersect(
                &packet.origin,
                &packet.direction,
                packet.tnear,
                packet.tfar,
            );
            for lane in bit_iter(result.valid_bits() & lanes as u64) {
                let hit = triangle_hit(&result, lane, &per_lane[lane], &prim);
                if passes(geometry.intersection_filter(), &packet.ray(lane), &hit) {
                    packet.set_tfar(lane, hit.t);
                    hits[lane] = Some(hit);
                }
            }
        }

        for &index in primitives.iter().filter(|&&index| !self.is_triangle(index)) {
            for lane in bit_iter(lanes) {
                let mut ray = packet.ray(lane);
                if let Some(hit) = self.intersect_other(&mut ray, index) {
                    packet.set_tfar(lane, ray.tfar);
                    hits[lane] = Some(hit);
                }
            }
        }
    }

    fn occluded_packet(&self, packet: &RayPacket, lanes: u8, primitives: &[u32]) -> u8 {
        let mut occluded = 0u8;
        for &index in primitives {
            let remaining = lanes & !occluded;
            if remaining == 0 {
                break;
            }

            let (prim, geometry) = self.resolve(index);
            match self.packet_planes(&prim, geometry, packet) {
                Some((planes, per_lane)) => {
                    let result = planes.intersect(
                        &packet.origin,
                        &packet.direction,
                        packet.tnear,
                        packet.tfar,
                    );
                    for lane in bit_iter(result.valid_bits() & remaining as u64) {
                        let blocked = match geometry.occlusion_filter() {
                            None => true,
                            Some(filter) => filter(
                                &packet.ray(lane),
                                &triangle_hit(&result, lane, &per_lane[lane], &prim),
                            ),
                        };
                        if blocked {
                            occluded |= 1 << lane;
                        }
                    }
                }
                None => {
                    for lane in bit_iter(remaining) {
                        if self.occluded_other(&packet.ray(lane), index) {
                            occluded |= 1 << lane;
                        }
                    }
                }
            }
        }
        occluded
    }
}

fn test_triangles(
    triangles: &[(PrimRef, &Geometry, TrianglePlane)],
    ray: &Ray,
) -> MoellerHits<f32x4> {
    TrianglePlanes::<f32x4>::from_fn(|lane| {
        triangles
            .get(lane)
            .map_or_else(TrianglePlane::degenerate, |(_, _, plane)| *plane)
    })
    .intersect(
        &Vector3x::splat_point(&ray.origin),
        &Vector3x::splat(&ray.direction),
        f32x4::splat(ray.tnear),
        f32x4::splat(ray.tfar),
    )
}

fn triangle_hit<F: SimdFloat>(
    hits: &MoellerHits<F>,
    lane: usize,
    plane: &TrianglePlane,
    prim: &PrimRef,
) -> Hit {
    Hit {
        t: hits.t.extract(lane),
        u: hits.u.extract(lane),
        v: hits.v.extract(lane),
        geometric_normal: plane.normal(),
        geom_id: prim.geom_id,
        prim_id: prim.prim_id,
        inner_geom_id: None,
    }
}

fn curve_hit(prim: &PrimRef, hit: CurveHit) -> Hit {
    Hit {
        t: hit.t,
        u: hit.u,
        v: 0.0,
        geometric_normal: WorldVector::zeros(),
        geom_id: prim.geom_id,
        prim_id: prim.prim_id,
        inner_geom_id: None,
    }
}

fn passes(filter: Option<&FilterFn>, ray: &Ray, hit: &Hit) -> bool {
    filter.is_none_or(|filter| filter(ray, hit))
}
