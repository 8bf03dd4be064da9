use crate::{
    geometry::{Triangle, WorldPoint, WorldVector},
    util::simd::{SimdFloat, Vector3x},
};

/// Triangle with the edges and the plane normal precomputed for the intersection test.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct TrianglePlane {
    pub v0: WorldVector,
    /// v0 - v1
    pub e1: WorldVector,
    /// v2 - v0
    pub e2: WorldVector,
    /// cross(e1, e2), points against the winding order normal
    pub ng: WorldVector,
}

impl TrianglePlane {
    pub fn new(triangle: &Triangle<WorldPoint>) -> TrianglePlane {
        let e1 = triangle[0] - triangle[1];
        let e2 = triangle[2] - triangle[0];
        TrianglePlane {
            v0: triangle[0].coords,
            e1,
            e2,
            ng: e1.cross(&e2),
        }
    }

    /// Plane that never reports a hit, used to fill unused lanes.
    pub fn degenerate() -> TrianglePlane {
        TrianglePlane {
            v0: WorldVector::zeros(),
            e1: WorldVector::zeros(),
            e2: WorldVector::zeros(),
            ng: WorldVector::zeros(),
        }
    }

    /// Geometric normal following the vertex winding, not normalized.
    pub fn normal(&self) -> WorldVector {
        -self.ng
    }
}

/// Triangle planes in structure of arrays layout.
#[derive(Copy, Clone, Debug)]
pub struct TrianglePlanes<F> {
    v0: Vector3x<F>,
    e1: Vector3x<F>,
    e2: Vector3x<F>,
    ng: Vector3x<F>,
}

/// Result of a vectorized triangle test.
/// t, u and v are only meaningful in lanes set in `valid`.
#[derive(Copy, Clone, Debug)]
pub struct MoellerHits<F> {
    pub valid: F,
    pub t: F,
    pub u: F,
    pub v: F,
}

impl<F: SimdFloat> MoellerHits<F> {
    pub fn valid_bits(&self) -> u64 {
        self.valid.bitmask()
    }

    /// Lane with the smallest distance among `lanes`; lowest lane index wins ties.
    pub fn select_min(&self, lanes: u64) -> Option<usize> {
        let mut best: Option<(usize, f32)> = None;
        for lane in crate::util::bit_iter(lanes) {
            let t = self.t.extract(lane);
            if best.is_none_or(|(_, best_t)| t < best_t) {
                best = Some((lane, t));
            }
        }
        best.map(|(lane, _)| lane)
    }
}

impl<F: SimdFloat> TrianglePlanes<F> {
    pub fn from_fn(mut f: impl FnMut(usize) -> TrianglePlane) -> Self {
        let planes: Vec<TrianglePlane> = (0..F::LANES).map(&mut f).collect();
        TrianglePlanes {
            v0: Vector3x::from_fn(|i| planes[i].v0),
            e1: Vector3x::from_fn(|i| planes[i].e1),
            e2: Vector3x::from_fn(|i| planes[i].e2),
            ng: Vector3x::from_fn(|i| planes[i].ng),
        }
    }

    /// Packs up to `F::LANES` planes, remaining lanes never hit.
    pub fn gather(planes: &[TrianglePlane]) -> Self {
        assert!(planes.len() <= F::LANES);
        Self::from_fn(|i| planes.get(i).copied().unwrap_or_else(TrianglePlane::degenerate))
    }

    pub fn splat(plane: &TrianglePlane) -> Self {
        TrianglePlanes {
            v0: Vector3x::splat(&plane.v0),
            e1: Vector3x::splat(&plane.e1),
            e2: Vector3x::splat(&plane.e2),
            ng: Vector3x::splat(&plane.ng),
        }
    }

    /// Two sided Moeller-Trumbore test of lanes of rays against lanes of triangles.
    /// Hits must lie strictly inside (tnear, tfar). Rays parallel to the triangle plane
    /// (zero denominator) never hit.
    #[inline(always)]
    pub fn intersect(
        &self,
        origin: &Vector3x<F>,
        direction: &Vector3x<F>,
        tnear: F,
        tfar: F,
    ) -> MoellerHits<F> {
        let zero = F::splat(0.0);

        let c = self.v0 - *origin;
        let r = direction.cross(&c);
        let den = self.ng.dot(direction);
        let abs_den = den.abs();
        let sgn_den = den.sign_mask();

        // Barycentric coordinates scaled by |den|, sign of den folded in
        let u = r.dot(&self.e2) ^ sgn_den;
        let v = r.dot(&self.e1) ^ sgn_den;
        let mut valid = den.simd_ne(zero)
            & u.simd_ge(zero)
            & v.simd_ge(zero)
            & (u + v).simd_le(abs_den);

        let t = self.ng.dot(&c) ^ sgn_den;
        valid = valid & t.simd_gt(abs_den * tnear) & t.simd_lt(abs_den * tfar);

        let safe_den = F::select(valid, abs_den, F::splat(1.0));
        MoellerHits {
            valid,
            t: t / safe_den,
            u: u / safe_den,
            v: v / safe_den,
        }
    }
}
