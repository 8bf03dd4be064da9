use wide::{f32x4, f32x8};

use crate::{
    geometry::{Box4, Ray, RayPacket, WorldBox},
    util::simd::{SimdFloat, Vector3x},
};

pub trait RayIntersectionExt<R> {
    type DistanceType;
    /// Calculate first and last ray intersection with the box
    fn intersect(&self, ray: &R) -> (Self::DistanceType, Self::DistanceType);
}

/// Slab test of boxes against rays, lane by lane.
/// Returns minimum and maximum distance along the ray, ray intersects if min <= max.
#[inline(always)]
pub fn slab_test<F: SimdFloat>(
    min: &Vector3x<F>,
    max: &Vector3x<F>,
    origin: &Vector3x<F>,
    inv_direction: &Vector3x<F>,
) -> (F, F) {
    // Componentwise distances along the ray to the box's min and max corners
    // The multiplication is NAN if the ray is starting inside the slab bounding plane
    // and is parallel to it. In this case we blend to +-infinity, so that the range becomes infinite
    let to_box_min = (*min - *origin)
        .zip_map(inv_direction, |a, b| a * b)
        .map(|x| F::select(x.is_nan(), F::neg_infinity(), x));
    let to_box_max = (*max - *origin)
        .zip_map(inv_direction, |a, b| a * b)
        .map(|x| F::select(x.is_nan(), F::infinity(), x));

    // Correctly ordered (min_t <= max_t)
    let componentwise_min_t = to_box_min.zip_map(&to_box_max, |a, b| a.min(b));
    let componentwise_max_t = to_box_min.zip_map(&to_box_max, |a, b| a.max(b));

    let min_t = componentwise_min_t
        .x
        .max(componentwise_min_t.y.max(componentwise_min_t.z));
    let max_t = componentwise_max_t
        .x
        .min(componentwise_max_t.y.min(componentwise_max_t.z));

    (min_t, max_t)
}

impl RayIntersectionExt<Ray> for Box4 {
    type DistanceType = f32x4;

    /// Calculates ray intersection with the four boxes of a node.
    fn intersect(&self, ray: &Ray) -> (f32x4, f32x4) {
        slab_test(
            &self.min,
            &self.max,
            &Vector3x::splat_point(&ray.origin),
            &Vector3x::splat(&ray.inv_direction),
        )
    }
}

impl RayIntersectionExt<RayPacket> for WorldBox {
    type DistanceType = f32x8;

    /// Calculates intersection of a single box with all rays of a packet.
    fn intersect(&self, packet: &RayPacket) -> (f32x8, f32x8) {
        slab_test(
            &Vector3x::splat(&self.min.coords),
            &Vector3x::splat(&self.max.coords),
            &packet.origin,
            &packet.inv_direction,
        )
    }
}

/// Box moving linearly between two time steps, evaluated at each packet lane's time.
pub fn intersect_motion_box_packet(
    box0: &WorldBox,
    box1: &WorldBox,
    packet: &RayPacket,
) -> (f32x8, f32x8) {
    let t = packet.time;
    let one_minus_t = f32x8::splat(1.0) - t;
    let mix = |a: f32, b: f32| {
        if a == b {
            f32x8::splat(a)
        } else {
            f32x8::splat(a) * one_minus_t + f32x8::splat(b) * t
        }
    };
    let min = Vector3x::new(
        mix(box0.min.x, box1.min.x),
        mix(box0.min.y, box1.min.y),
        mix(box0.min.z, box1.min.z),
    );
    let max = Vector3x::new(
        mix(box0.max.x, box1.max.x),
        mix(box0.max.y, box1.max.y),
        mix(box0.max.z, box1.max.z),
    );
    slab_test(&min, &max, &packet.origin, &packet.inv_direction)
}
