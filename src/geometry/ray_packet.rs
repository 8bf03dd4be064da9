use wide::f32x8;

use crate::geometry::{Ray, WorldPoint, WorldVector};
use crate::util::simd::{SimdFloat as _, Vector3x};

pub const PACKET_WIDTH: usize = 8;

/// Eight rays traced together, one per SIMD lane.
#[derive(Copy, Clone, Debug)]
pub struct RayPacket {
    pub origin: Vector3x<f32x8>,
    pub direction: Vector3x<f32x8>,
    pub inv_direction: Vector3x<f32x8>,
    pub tnear: f32x8,
    pub tfar: f32x8,
    pub time: f32x8,
    /// Lanes that carry a ray, bit i for lane i.
    pub active: u8,
}

impl RayPacket {
    /// Packs up to eight rays, unused lanes are inactive.
    /// Panics if more than `PACKET_WIDTH` rays are given.
    pub fn from_rays(rays: &[Ray]) -> RayPacket {
        assert!(rays.len() <= PACKET_WIDTH, "too many rays for one packet");

        let placeholder = Ray::new(WorldPoint::origin(), WorldVector::z());
        let lane = |i: usize| rays.get(i).unwrap_or(&placeholder);

        RayPacket {
            origin: Vector3x::from_fn(|i| lane(i).origin.coords),
            direction: Vector3x::from_fn(|i| lane(i).direction),
            inv_direction: Vector3x::from_fn(|i| lane(i).inv_direction),
            tnear: f32x8::from_fn(|i| lane(i).tnear),
            tfar: f32x8::from_fn(|i| lane(i).tfar),
            time: f32x8::from_fn(|i| lane(i).time),
            active: ((1u16 << rays.len()) - 1) as u8,
        }
    }

    pub fn is_active(&self, lane: usize) -> bool {
        self.active & (1 << lane) != 0
    }

    /// Ray stored in one lane, with its current range.
    pub fn ray(&self, lane: usize) -> Ray {
        Ray {
            origin: WorldPoint::from(self.origin.extract(lane)),
            direction: self.direction.extract(lane),
            inv_direction: self.inv_direction.extract(lane),
            tnear: self.tnear.extract(lane),
            tfar: self.tfar.extract(lane),
            time: self.time.extract(lane),
        }
    }

    pub fn set_tfar(&mut self, lane: usize, tfar: f32) {
        self.tfar.replace(lane, tfar);
    }
}
