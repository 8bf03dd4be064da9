use arrayvec::ArrayVec;
use nalgebra::{Matrix3, Vector4};

use crate::geometry::{FloatType, Ray, WorldBox, WorldPoint, WorldVector};

/// Cubic Bezier curve with a radius at each control point.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BezierCurve {
    pub points: [WorldPoint; 4],
    pub radii: [FloatType; 4],
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CurveHit {
    pub t: FloatType,
    /// Curve parameter of the hit
    pub u: FloatType,
}

/// Levels of subdivision before the remaining segment is treated as a line.
const SUBDIVISION_DEPTH: u32 = 4;

/// Curve piece in ray space, w holds the radius.
#[derive(Copy, Clone, Debug)]
struct Segment {
    v: [Vector4<FloatType>; 4],
    t0: FloatType,
    t1: FloatType,
    depth: u32,
}

impl BezierCurve {
    pub fn new(points: [WorldPoint; 4], radii: [FloatType; 4]) -> Self {
        BezierCurve { points, radii }
    }

    /// Box enclosing the control points, grown by the largest radius.
    pub fn bounds(&self) -> WorldBox {
        let max_radius = self.radii.iter().copied().fold(0.0, FloatType::max);
        WorldBox::from_points(self.points).enlarge(max_radius)
    }

    pub fn lerp(&self, other: &Self, time: FloatType) -> Self {
        BezierCurve {
            points: std::array::from_fn(|i| {
                WorldPoint::from(
                    self.points[i]
                        .coords
                        .zip_map(&other.points[i].coords, |a, b| super::lerp(a, b, time)),
                )
            }),
            radii: std::array::from_fn(|i| super::lerp(self.radii[i], other.radii[i], time)),
        }
    }

    /// Closest intersection of the ray with the swept circle cross sections,
    /// strictly within the ray's (tnear, tfar). Among equally distant candidates
    /// the one passing closest to the curve's axis wins.
    pub fn intersect(&self, ray: &Ray) -> Option<CurveHit> {
        let to_ray_space = ray_frame(&ray.direction).transpose();
        let v = std::array::from_fn(|i| {
            let p = to_ray_space * (self.points[i] - ray.origin);
            Vector4::new(p.x, p.y, p.z, self.radii[i])
        });

        let mut stack = ArrayVec::<Segment, 32>::new();
        stack.push(Segment {
            v,
            t0: 0.0,
            t1: 1.0,
            depth: SUBDIVISION_DEPTH,
        });

        // Closest hit so far with its distance from the curve axis
        let mut best: Option<(CurveHit, FloatType)> = None;

        'pop: while let Some(mut segment) = stack.pop() {
            while segment.depth > 0 {
                let (left, right) = segment.subdivide();
                let hit_left = left.bounds_contain_ray();
                let hit_right = right.bounds_contain_ray();

                match (hit_left, hit_right) {
                    (false, false) => continue 'pop,
                    (true, false) => segment = left,
                    (false, true) => segment = right,
                    (true, true) => {
                        segment = left;
                        stack.push(right);
                    }
                }
            }

            // Closest point of the ray to the line through the segment's end points
            let v = segment.v[3] - segment.v[0];
            let w = -segment.v[0];
            let d0 = w.x * v.x + w.y * v.y;
            let d1 = v.x * v.x + v.y * v.y;
            let u = if d1 > 0.0 {
                (d0 / d1).clamp(0.0, 1.0)
            } else {
                0.0
            };
            let d = segment.v[0] + v * u;
            let dist = (d.x * d.x + d.y * d.y).sqrt();
            if dist > d.w {
                continue;
            }
            let t = d.z;
            if t <= ray.tnear || t >= ray.tfar {
                continue;
            }
            // Neighbouring segments often report the same depth, the one passing
            // nearest to the ray gives the curve parameter
            if best.is_some_and(|(hit, best_dist)| (t, dist) >= (hit.t, best_dist)) {
                continue;
            }
            let hit = CurveHit {
                t,
                u: segment.t0 + u * (segment.t1 - segment.t0),
            };
            best = Some((hit, dist));
        }

        best.map(|(hit, _)| hit)
    }
}

impl Segment {
    fn subdivide(&self) -> (Segment, Segment) {
        let [p00, p01, p02, p03] = self.v;
        let p10 = (p00 + p01) * 0.5;
        let p11 = (p01 + p02) * 0.5;
        let p12 = (p02 + p03) * 0.5;
        let p20 = (p10 + p11) * 0.5;
        let p21 = (p11 + p12) * 0.5;
        let p30 = (p20 + p21) * 0.5;
        let t_mid = (self.t0 + self.t1) * 0.5;

        (
            Segment {
                v: [p00, p10, p20, p30],
                t0: self.t0,
                t1: t_mid,
                depth: self.depth - 1,
            },
            Segment {
                v: [p30, p21, p12, p03],
                t0: t_mid,
                t1: self.t1,
                depth: self.depth - 1,
            },
        )
    }

    /// The ray runs along the z axis of ray space, so only the xy footprint matters.
    fn bounds_contain_ray(&self) -> bool {
        let mut lower = Vector4::repeat(FloatType::INFINITY);
        let mut upper = Vector4::repeat(FloatType::NEG_INFINITY);
        for p in &self.v {
            lower = lower.inf(p);
            upper = upper.sup(p);
        }
        let radius = upper.w;
        let (lower_x, lower_y) = (lower.x - radius, lower.y - radius);
        let (upper_x, upper_y) = (upper.x + radius, upper.y + radius);

        lower_x.max(lower_y) <= 0.0 && 0.0 <= upper_x.min(upper_y)
    }
}

/// Orthonormal basis with `direction` as its third column.
fn ray_frame(direction: &WorldVector) -> Matrix3<FloatType> {
    let d = direction;
    let dx = if d.x.abs() > d.z.abs() {
        WorldVector::new(-d.y, d.x, 0.0)
    } else {
        WorldVector::new(0.0, -d.z, d.y)
    }
    .normalize();
    let dy = d.cross(&dx);
    Matrix3::from_columns(&[dx, dy, *d])
}
