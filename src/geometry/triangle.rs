use std::ops::{Index, IndexMut};

use crate::geometry::{FloatType, WorldBox, WorldPoint, WorldVector};

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Triangle<Point>([Point; 3]);

impl<Point> Triangle<Point> {
    pub fn new(a: Point, b: Point, c: Point) -> Triangle<Point> {
        Triangle([a, b, c])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Point> {
        self.0.iter()
    }

    pub fn map<Point2, F: FnMut(&Point) -> Point2>(&self, mut f: F) -> Triangle<Point2> {
        Triangle([f(&self[0]), f(&self[1]), f(&self[2])])
    }

    pub fn zip_map<Point2, Point3, F: FnMut(&Point, &Point2) -> Point3>(
        &self,
        rhs: &Triangle<Point2>,
        mut f: F,
    ) -> Triangle<Point3> {
        Triangle([
            f(&self.0[0], &rhs.0[0]),
            f(&self.0[1], &rhs.0[1]),
            f(&self.0[2], &rhs.0[2]),
        ])
    }
}

impl<Point: Default> Default for Triangle<Point> {
    fn default() -> Self {
        Triangle([Default::default(), Default::default(), Default::default()])
    }
}

impl<Point> Index<usize> for Triangle<Point> {
    type Output = Point;

    fn index(&self, index: usize) -> &Self::Output {
        &self.0[index]
    }
}

impl<Point> IndexMut<usize> for Triangle<Point> {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.0[index]
    }
}

impl Triangle<WorldPoint> {
    /// Returns edge vectors, coming from self[0]
    pub fn edges(&self) -> [WorldVector; 2] {
        [self.0[1] - self.0[0], self.0[2] - self.0[0]]
    }

    /// Returns a normal vector of the triangle, not normalized.
    pub fn normal(&self) -> WorldVector {
        let [e1, e2] = self.edges();
        e1.cross(&e2)
    }

    pub fn bounds(&self) -> WorldBox {
        WorldBox::from_points(self.0)
    }

    /// Vertices interpolated between two time steps.
    pub fn lerp(&self, other: &Self, time: FloatType) -> Self {
        self.zip_map(other, |a, b| {
            WorldPoint::from(a.coords.zip_map(&b.coords, |a, b| super::lerp(a, b, time)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert2::assert;

    fn triangle() -> Triangle<WorldPoint> {
        Triangle::new(
            WorldPoint::new(0.0, 0.0, 0.0),
            WorldPoint::new(3.0, 0.0, 0.0),
            WorldPoint::new(0.0, 3.0, 0.0),
        )
    }

    #[test]
    fn bounds_cover_vertices() {
        let t = triangle();
        assert!(t.bounds() == WorldBox::new(WorldPoint::origin(), WorldPoint::new(3.0, 3.0, 0.0)));
    }

    #[test]
    fn normal_is_right_handed() {
        assert!(triangle().normal() == WorldVector::new(0.0, 0.0, 9.0));
    }

    #[test]
    fn lerp_moves_vertices() {
        let t0 = triangle();
        let t1 = t0.map(|p| p + WorldVector::new(0.0, 0.0, 2.0));
        let mid = t0.lerp(&t1, 0.5);
        assert!(mid[1] == WorldPoint::new(3.0, 0.0, 1.0));
        assert!(mid.normal() == t0.normal());
    }
}
