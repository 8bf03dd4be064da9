use std::ops::{Add, Sub};

use wide::f32x4;

use crate::geometry::{FloatType, WorldPoint, WorldVector, lerp};
use crate::util::simd::{SimdFloat, Vector3x};

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct AABB<Point> {
    pub min: Point,
    pub max: Point,
}

impl<Point> AABB<Point> {
    pub fn new(min: Point, max: Point) -> AABB<Point> {
        AABB { min, max }
    }

    pub fn map<Point2, F: FnMut(&Point) -> Point2>(&self, mut f: F) -> AABB<Point2> {
        AABB {
            min: f(&self.min),
            max: f(&self.max),
        }
    }

    pub fn zip_map<Point2, Point3, F: FnMut(&Point, &Point2) -> Point3>(
        &self,
        rhs: &AABB<Point2>,
        mut f: F,
    ) -> AABB<Point3> {
        AABB {
            min: f(&self.min, &rhs.min),
            max: f(&self.max, &rhs.max),
        }
    }
}

impl<Point: Sub + Copy> AABB<Point> {
    pub fn size(&self) -> Point::Output {
        self.max - self.min
    }
}

impl<Point> From<[Point; 2]> for AABB<Point> {
    fn from(value: [Point; 2]) -> Self {
        let [min, max] = value;
        AABB { min, max }
    }
}

impl AABB<WorldPoint> {
    /// Box that contains nothing, neutral element of `union`.
    pub fn empty() -> Self {
        AABB {
            min: WorldPoint::from(WorldVector::repeat(FloatType::INFINITY)),
            max: WorldPoint::from(WorldVector::repeat(FloatType::NEG_INFINITY)),
        }
    }

    pub fn from_point(p: WorldPoint) -> Self {
        AABB { min: p, max: p }
    }

    pub fn from_points(points: impl IntoIterator<Item = WorldPoint>) -> Self {
        let mut ret = Self::empty();
        for p in points {
            ret.extend_point(&p);
        }
        ret
    }

    pub fn is_empty(&self) -> bool {
        self.min
            .iter()
            .zip(self.max.iter())
            .any(|(min, max)| min > max)
    }

    pub fn extend_point(&mut self, p: &WorldPoint) {
        self.min = self.min.inf(p);
        self.max = self.max.sup(p);
    }

    pub fn extend(&mut self, other: &Self) {
        self.min = self.min.inf(&other.min);
        self.max = self.max.sup(&other.max);
    }

    pub fn union(&self, other: &Self) -> Self {
        let mut ret = self.clone();
        ret.extend(other);
        ret
    }

    /// Grows the box by `radius` in every direction.
    pub fn enlarge(&self, radius: FloatType) -> Self {
        let r = WorldVector::repeat(radius);
        AABB {
            min: self.min - r,
            max: self.max + r,
        }
    }

    /// Sum of the three face areas; zero for empty boxes.
    pub fn half_area(&self) -> FloatType {
        if self.is_empty() {
            return 0.0;
        }
        let d = self.size();
        d.x * d.y + d.y * d.z + d.z * d.x
    }

    /// Centroid multiplied by two, avoids a multiplication where only relative positions matter.
    pub fn center2(&self) -> WorldPoint {
        WorldPoint::from(self.min.coords + self.max.coords)
    }

    pub fn contains(&self, other: &Self) -> bool {
        other.is_empty()
            || (self.min.iter().zip(other.min.iter()).all(|(a, b)| a <= b)
                && self.max.iter().zip(other.max.iter()).all(|(a, b)| a >= b))
    }

    pub fn lerp(&self, other: &Self, time: FloatType) -> Self {
        self.zip_map(other, |a, b| {
            WorldPoint::from(a.coords.zip_map(&b.coords, |a, b| lerp(a, b, time)))
        })
    }
}

impl Default for AABB<WorldPoint> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<'a> Add<&'a AABB<WorldPoint>> for AABB<WorldPoint> {
    type Output = AABB<WorldPoint>;

    fn add(mut self, rhs: &'a AABB<WorldPoint>) -> Self::Output {
        self.extend(rhs);
        self
    }
}

/// Four boxes in structure of arrays layout, one lane per child of a BVH node.
#[derive(Copy, Clone, Debug)]
pub struct Box4 {
    pub min: Vector3x<f32x4>,
    pub max: Vector3x<f32x4>,
}

impl Box4 {
    pub const LANES: usize = 4;

    pub fn empty() -> Self {
        Box4 {
            min: Vector3x::new(f32x4::infinity(), f32x4::infinity(), f32x4::infinity()),
            max: Vector3x::new(
                f32x4::neg_infinity(),
                f32x4::neg_infinity(),
                f32x4::neg_infinity(),
            ),
        }
    }

    pub fn from_boxes(boxes: &[AABB<WorldPoint>; 4]) -> Self {
        Box4 {
            min: Vector3x::from_fn(|i| boxes[i].min.coords),
            max: Vector3x::from_fn(|i| boxes[i].max.coords),
        }
    }

    pub fn extract(&self, lane: usize) -> AABB<WorldPoint> {
        AABB {
            min: WorldPoint::from(self.min.extract(lane)),
            max: WorldPoint::from(self.max.extract(lane)),
        }
    }

    pub fn replace(&mut self, lane: usize, b: &AABB<WorldPoint>) {
        self.min.replace(lane, &b.min.coords);
        self.max.replace(lane, &b.max.coords);
    }

    /// Union of all four lanes.
    pub fn merged(&self) -> AABB<WorldPoint> {
        (0..Self::LANES).fold(AABB::empty(), |acc, i| acc + &self.extract(i))
    }

    pub fn lerp(&self, other: &Self, time: FloatType) -> Self {
        let t = f32x4::splat(time);
        let one_minus_t = f32x4::splat(1.0 - time);
        // Equal lanes are passed through, empty lanes would otherwise turn into NaN (inf * 0).
        let mix = |a: &Vector3x<f32x4>, b: &Vector3x<f32x4>| {
            a.zip_map(b, |a, b| f32x4::select(a.simd_eq(b), a, a * one_minus_t + b * t))
        };
        Box4 {
            min: mix(&self.min, &other.min),
            max: mix(&self.max, &other.max),
        }
    }
}

impl Default for Box4 {
    fn default() -> Self {
        Self::empty()
    }
}

impl PartialEq for Box4 {
    fn eq(&self, other: &Self) -> bool {
        (0..Self::LANES).all(|i| self.extract(i) == other.extract(i))
    }
}
