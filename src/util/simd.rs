//! Thin layer over `wide` vectors, so that the hot intersection kernels can be written once
//! and instantiated both for 4 primitives vs. one ray and for one primitive vs. 8 rays.

use std::fmt::Debug;
use std::ops::{Add, BitAnd, BitOr, BitXor, Div, Mul, Neg, Sub};

use wide::{CmpEq as _, CmpGe as _, CmpGt as _, CmpLe as _, CmpLt as _, CmpNe as _, f32x4, f32x8};

use crate::geometry::{WorldPoint, WorldVector};

/// Float vector with comparison results represented as all-ones / all-zeros lanes.
pub trait SimdFloat:
    Copy
    + Debug
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + BitAnd<Output = Self>
    + BitOr<Output = Self>
    + BitXor<Output = Self>
{
    const LANES: usize;

    fn splat(x: f32) -> Self;
    fn from_fn(f: impl FnMut(usize) -> f32) -> Self;
    fn extract(self, lane: usize) -> f32;
    fn replace(&mut self, lane: usize, value: f32);

    fn abs(self) -> Self;
    fn min(self, rhs: Self) -> Self;
    fn max(self, rhs: Self) -> Self;
    fn is_nan(self) -> Self;

    fn simd_lt(self, rhs: Self) -> Self;
    fn simd_le(self, rhs: Self) -> Self;
    fn simd_gt(self, rhs: Self) -> Self;
    fn simd_ge(self, rhs: Self) -> Self;
    fn simd_eq(self, rhs: Self) -> Self;
    fn simd_ne(self, rhs: Self) -> Self;

    /// Picks lanes from `t` where mask is set, from `f` elsewhere.
    fn select(mask: Self, t: Self, f: Self) -> Self;

    /// One bit per lane, lane 0 in the lowest bit.
    fn bitmask(self) -> u64;

    /// Mask with lanes set according to the low bits of `bits`.
    fn mask_from_bits(bits: u64) -> Self {
        Self::from_fn(|i| {
            if bits & (1 << i) != 0 {
                f32::from_bits(u32::MAX)
            } else {
                0.0
            }
        })
    }

    /// Keeps only the sign bits.
    fn sign_mask(self) -> Self {
        self & Self::splat(-0.0)
    }

    /// Smallest lane value, NaN lanes are skipped.
    fn reduce_min(self) -> f32 {
        (0..Self::LANES)
            .map(|i| self.extract(i))
            .fold(f32::INFINITY, f32::min)
    }

    fn infinity() -> Self {
        Self::splat(f32::INFINITY)
    }

    fn neg_infinity() -> Self {
        Self::splat(f32::NEG_INFINITY)
    }
}

macro_rules! impl_simd_float {
    ($type:ty, $lanes:expr) => {
        impl SimdFloat for $type {
            const LANES: usize = $lanes;

            #[inline(always)]
            fn splat(x: f32) -> Self {
                <$type>::splat(x)
            }

            #[inline(always)]
            fn from_fn(f: impl FnMut(usize) -> f32) -> Self {
                <$type>::from(std::array::from_fn::<f32, $lanes, _>(f))
            }

            #[inline(always)]
            fn extract(self, lane: usize) -> f32 {
                self.to_array()[lane]
            }

            #[inline(always)]
            fn replace(&mut self, lane: usize, value: f32) {
                let mut array = self.to_array();
                array[lane] = value;
                *self = <$type>::from(array);
            }

            #[inline(always)]
            fn abs(self) -> Self {
                <$type>::abs(self)
            }

            #[inline(always)]
            fn min(self, rhs: Self) -> Self {
                <$type>::min(self, rhs)
            }

            #[inline(always)]
            fn max(self, rhs: Self) -> Self {
                <$type>::max(self, rhs)
            }

            #[inline(always)]
            fn is_nan(self) -> Self {
                <$type>::is_nan(self)
            }

            #[inline(always)]
            fn simd_lt(self, rhs: Self) -> Self {
                self.cmp_lt(rhs)
            }

            #[inline(always)]
            fn simd_le(self, rhs: Self) -> Self {
                self.cmp_le(rhs)
            }

            #[inline(always)]
            fn simd_gt(self, rhs: Self) -> Self {
                self.cmp_gt(rhs)
            }

            #[inline(always)]
            fn simd_ge(self, rhs: Self) -> Self {
                self.cmp_ge(rhs)
            }

            #[inline(always)]
            fn simd_eq(self, rhs: Self) -> Self {
                self.cmp_eq(rhs)
            }

            #[inline(always)]
            fn simd_ne(self, rhs: Self) -> Self {
                self.cmp_ne(rhs)
            }

            #[inline(always)]
            fn select(mask: Self, t: Self, f: Self) -> Self {
                mask.blend(t, f)
            }

            #[inline(always)]
            fn bitmask(self) -> u64 {
                self.move_mask() as u64
            }
        }
    };
}

impl_simd_float!(f32x4, 4);
impl_simd_float!(f32x8, 8);

/// Three component vector of SIMD lanes (structure of arrays).
#[derive(Copy, Clone, Debug)]
pub struct Vector3x<F> {
    pub x: F,
    pub y: F,
    pub z: F,
}

impl<F: SimdFloat> Vector3x<F> {
    pub fn new(x: F, y: F, z: F) -> Self {
        Vector3x { x, y, z }
    }

    pub fn splat(v: &WorldVector) -> Self {
        Vector3x {
            x: F::splat(v.x),
            y: F::splat(v.y),
            z: F::splat(v.z),
        }
    }

    pub fn splat_point(p: &WorldPoint) -> Self {
        Self::splat(&p.coords)
    }

    /// Builds the vector lane by lane.
    pub fn from_fn(mut f: impl FnMut(usize) -> WorldVector) -> Self {
        let lanes: Vec<WorldVector> = (0..F::LANES).map(&mut f).collect();
        Vector3x {
            x: F::from_fn(|i| lanes[i].x),
            y: F::from_fn(|i| lanes[i].y),
            z: F::from_fn(|i| lanes[i].z),
        }
    }

    pub fn extract(&self, lane: usize) -> WorldVector {
        WorldVector::new(self.x.extract(lane), self.y.extract(lane), self.z.extract(lane))
    }

    pub fn replace(&mut self, lane: usize, v: &WorldVector) {
        self.x.replace(lane, v.x);
        self.y.replace(lane, v.y);
        self.z.replace(lane, v.z);
    }

    pub fn map(&self, mut f: impl FnMut(F) -> F) -> Self {
        Vector3x {
            x: f(self.x),
            y: f(self.y),
            z: f(self.z),
        }
    }

    pub fn zip_map(&self, rhs: &Self, mut f: impl FnMut(F, F) -> F) -> Self {
        Vector3x {
            x: f(self.x, rhs.x),
            y: f(self.y, rhs.y),
            z: f(self.z, rhs.z),
        }
    }

    pub fn dot(&self, rhs: &Self) -> F {
        self.x * rhs.x + self.y * rhs.y + self.z * rhs.z
    }

    pub fn cross(&self, rhs: &Self) -> Self {
        Vector3x {
            x: self.y * rhs.z - self.z * rhs.y,
            y: self.z * rhs.x - self.x * rhs.z,
            z: self.x * rhs.y - self.y * rhs.x,
        }
    }
}

impl<F: SimdFloat> Sub for Vector3x<F> {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        self.zip_map(&rhs, |a, b| a - b)
    }
}

impl<F: SimdFloat> Add for Vector3x<F> {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        self.zip_map(&rhs, |a, b| a + b)
    }
}
