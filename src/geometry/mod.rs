mod aabb;
mod curve;
mod ray_box_intersection;
mod ray_packet;
mod ray_triangle_intersection;
mod triangle;

pub use aabb::{AABB, Box4};
pub use curve::{BezierCurve, CurveHit};
pub use ray_box_intersection::{RayIntersectionExt, intersect_motion_box_packet, slab_test};
pub use ray_packet::{PACKET_WIDTH, RayPacket};
pub use ray_triangle_intersection::{MoellerHits, TrianglePlane, TrianglePlanes};
pub use triangle::Triangle;

pub type FloatType = f32;
pub type WorldPoint = nalgebra::Point3<FloatType>;
pub type WorldVector = nalgebra::Vector3<FloatType>;
pub type WorldBox = AABB<WorldPoint>;

/// Linear interpolation between two values at `time` in [0, 1].
/// Equal values are returned unchanged, so that infinite bounds survive.
pub fn lerp(a: FloatType, b: FloatType, time: FloatType) -> FloatType {
    if a == b { a } else { a * (1.0 - time) + b * time }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Ray {
    pub origin: WorldPoint,
    /// Normalized direction of the ray
    pub direction: WorldVector,

    /// Componentwise inverse of the ray direction
    /// Zeros in direction get turned into positive infinity regardless of the sign of the zero
    pub inv_direction: WorldVector,

    /// Valid hits must lie in (tnear, tfar). Traversal shrinks tfar as closer hits are found.
    pub tnear: FloatType,
    pub tfar: FloatType,

    /// Time within the shutter interval, in [0, 1]. Only used by motion blurred geometry.
    pub time: FloatType,
}

impl Ray {
    pub fn new(origin: WorldPoint, direction: WorldVector) -> Ray {
        let direction = direction.normalize();
        let inv_direction = direction.map(|x| if x == 0.0 { f32::INFINITY } else { 1.0 / x });

        Ray {
            origin,
            direction,
            inv_direction,
            tnear: 0.0,
            tfar: FloatType::INFINITY,
            time: 0.0,
        }
    }

    pub fn with_range(self, tnear: FloatType, tfar: FloatType) -> Ray {
        Ray {
            tnear,
            tfar,
            ..self
        }
    }

    pub fn at_time(self, time: FloatType) -> Ray {
        Ray { time, ..self }
    }

    pub fn point_at(&self, distance: f32) -> WorldPoint {
        self.origin + self.direction * distance
    }
}
