use std::sync::atomic::Ordering;

use crate::geometry::{WorldBox, WorldPoint};
use crate::sync::AtomicF32;

/// Bounds of a set of primitives together with the bounds of their doubled centroids.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CentroidSceneAabb {
    pub geometry: WorldBox,
    /// Bounds of `min + max` of every primitive box (twice the centroid)
    pub centroid2: WorldBox,
}

impl CentroidSceneAabb {
    pub fn empty() -> Self {
        CentroidSceneAabb {
            geometry: WorldBox::empty(),
            centroid2: WorldBox::empty(),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::empty();
    }

    pub fn is_empty(&self) -> bool {
        self.geometry.is_empty()
    }

    /// Adds one primitive.
    pub fn extend_box(&mut self, primitive_bounds: &WorldBox) {
        self.geometry.extend(primitive_bounds);
        self.centroid2.extend_point(&primitive_bounds.center2());
    }

    /// Merges bounds of another primitive range.
    pub fn extend(&mut self, other: &CentroidSceneAabb) {
        self.geometry.extend(&other.geometry);
        self.centroid2.extend(&other.centroid2);
    }
}

impl Default for CentroidSceneAabb {
    fn default() -> Self {
        Self::empty()
    }
}

impl FromIterator<WorldBox> for CentroidSceneAabb {
    fn from_iter<I: IntoIterator<Item = WorldBox>>(iter: I) -> Self {
        let mut ret = CentroidSceneAabb::empty();
        for b in iter {
            ret.extend_box(&b);
        }
        ret
    }
}

/// Lock-free accumulator for `CentroidSceneAabb`, merged into by all builder threads.
#[derive(Debug)]
pub struct AtomicCentroidSceneAabb {
    geometry: AtomicBox,
    centroid2: AtomicBox,
}

#[derive(Debug)]
struct AtomicBox {
    min: [AtomicF32; 3],
    max: [AtomicF32; 3],
}

impl AtomicBox {
    fn empty() -> Self {
        AtomicBox {
            min: std::array::from_fn(|_| AtomicF32::new(f32::INFINITY)),
            max: std::array::from_fn(|_| AtomicF32::new(f32::NEG_INFINITY)),
        }
    }

    fn extend(&self, b: &WorldBox) {
        for axis in 0..3 {
            self.min[axis].fetch_min(b.min[axis], Ordering::Relaxed);
            self.max[axis].fetch_max(b.max[axis], Ordering::Relaxed);
        }
    }

    fn load(&self) -> WorldBox {
        WorldBox::new(
            WorldPoint::from(std::array::from_fn(|axis| self.min[axis].load(Ordering::Relaxed))),
            WorldPoint::from(std::array::from_fn(|axis| self.max[axis].load(Ordering::Relaxed))),
        )
    }
}

impl AtomicCentroidSceneAabb {
    pub fn new() -> Self {
        AtomicCentroidSceneAabb {
            geometry: AtomicBox::empty(),
            centroid2: AtomicBox::empty(),
        }
    }

    /// Merges thread local bounds into the shared ones.
    pub fn extend_atomic(&self, local: &CentroidSceneAabb) {
        if local.is_empty() {
            return;
        }
        self.geometry.extend(&local.geometry);
        self.centroid2.extend(&local.centroid2);
    }

    /// Current value. Only consistent after all writers are done.
    pub fn load(&self) -> CentroidSceneAabb {
        CentroidSceneAabb {
            geometry: self.geometry.load(),
            centroid2: self.centroid2.load(),
        }
    }
}

impl Default for AtomicCentroidSceneAabb {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bvh::test_util::random_boxes;
    use assert2::assert;

    #[test]
    fn centroid_bounds() {
        let bounds: CentroidSceneAabb = [
            WorldBox::new(WorldPoint::new(0.0, 0.0, 0.0), WorldPoint::new(2.0, 2.0, 2.0)),
            WorldBox::new(WorldPoint::new(4.0, -1.0, 0.0), WorldPoint::new(6.0, 1.0, 1.0)),
        ]
        .into_iter()
        .collect();

        assert!(bounds.geometry.min == WorldPoint::new(0.0, -1.0, 0.0));
        assert!(bounds.geometry.max == WorldPoint::new(6.0, 2.0, 2.0));
        assert!(bounds.centroid2.min == WorldPoint::new(2.0, 0.0, 1.0));
        assert!(bounds.centroid2.max == WorldPoint::new(10.0, 2.0, 2.0));
    }

    #[test]
    fn parallel_merge_matches_serial() {
        let boxes = random_boxes(1000, 7);
        let serial: CentroidSceneAabb = boxes.iter().copied().collect();

        let shared = AtomicCentroidSceneAabb::new();
        std::thread::scope(|s| {
            for chunk in boxes.chunks(137) {
                let shared = &shared;
                s.spawn(move || {
                    let local: CentroidSceneAabb = chunk.iter().copied().collect();
                    shared.extend_atomic(&local);
                });
            }
        });

        assert!(shared.load() == serial);
    }

    #[test]
    fn extend_and_reset() {
        let boxes = random_boxes(10, 1);
        let mut a: CentroidSceneAabb = boxes[..5].iter().copied().collect();
        let b: CentroidSceneAabb = boxes[5..].iter().copied().collect();
        a.extend(&b);
        assert!(a == boxes.iter().copied().collect());

        a.reset();
        assert!(a.is_empty());
    }

    #[test]
    fn empty_merge_keeps_empty() {
        let shared = AtomicCentroidSceneAabb::new();
        shared.extend_atomic(&CentroidSceneAabb::empty());
        assert!(shared.load().geometry.is_empty());
    }
}
