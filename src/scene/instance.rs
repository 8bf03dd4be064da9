use std::sync::Arc;

use nalgebra::Isometry3;
use thiserror::Error;

use super::{Accel, GeometryId, Hit};
use crate::geometry::{FloatType, Ray, WorldBox, WorldPoint};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum InstanceError {
    #[error("instanced scene has not been built")]
    NotBuilt,

    #[error("instanced scene contains instance {0}, only one level of instancing is supported")]
    Nested(GeometryId),
}

/// Built scene placed into another scene by a rigid transformation.
#[derive(Debug)]
pub struct Instance {
    accel: Arc<Accel>,
    placement: Isometry3<FloatType>,
    inverse: Isometry3<FloatType>,
}

impl Instance {
    pub fn new(accel: Arc<Accel>, placement: Isometry3<FloatType>) -> Result<Self, InstanceError> {
        if !accel.is_built() {
            return Err(InstanceError::NotBuilt);
        }
        if let Some(id) = accel.scene().instance_ids().next() {
            return Err(InstanceError::Nested(id));
        }

        Ok(Instance {
            accel,
            placement,
            inverse: placement.inverse(),
        })
    }

    pub fn accel(&self) -> &Arc<Accel> {
        &self.accel
    }

    pub fn placement(&self) -> &Isometry3<FloatType> {
        &self.placement
    }

    pub fn has_motion(&self) -> bool {
        self.accel.bvh().has_motion()
    }

    /// World space box around the instanced scene at a time step.
    pub fn bounds(&self, time_step: usize) -> WorldBox {
        let bvh = self.accel.bvh();
        let local = match bvh.bounds_end() {
            Some(end) if time_step > 0 => end,
            _ => bvh.bounds(),
        };
        if local.is_empty() {
            return WorldBox::empty();
        }

        WorldBox::from_points((0..8).map(|corner| {
            let pick = |axis: usize| {
                if corner & (1 << axis) == 0 {
                    local.min[axis]
                } else {
                    local.max[axis]
                }
            };
            self.placement * WorldPoint::new(pick(0), pick(1), pick(2))
        }))
    }

    /// The ray in the instanced scene's space. Distances are preserved.
    fn to_local(&self, ray: &Ray) -> Ray {
        Ray::new(self.inverse * ray.origin, self.inverse * ray.direction)
            .with_range(ray.tnear, ray.tfar)
            .at_time(ray.time)
    }

    /// Closest hit inside the instance, with the normal in world space.
    /// Geometry ids of the hit refer to the instanced scene.
    pub fn intersect(&self, ray: &mut Ray) -> Option<Hit> {
        let mut local = self.to_local(ray);
        let hit = self.accel.intersect(&mut local)?;
        ray.tfar = local.tfar;
        Some(Hit {
            geometric_normal: self.placement * hit.geometric_normal,
            ..hit
        })
    }

    pub fn occluded(&self, ray: &Ray) -> bool {
        self.accel.occluded(&self.to_local(ray))
    }
}
