pub mod simd;
mod stats;

pub use stats::Stats;

/// Indices of the set bits, lowest first. Used to walk SIMD lane masks.
pub fn bit_iter(bits: impl Into<u64>) -> BitIter {
    BitIter { bits: bits.into() }
}

#[derive(Copy, Clone, Debug)]
pub struct BitIter {
    bits: u64,
}

impl Iterator for BitIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.bits == 0 {
            return None;
        }
        let tz = self.bits.trailing_zeros() as usize;
        self.bits &= self.bits - 1;
        Some(tz)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let count = self.bits.count_ones() as usize;
        (count, Some(count))
    }
}

impl ExactSizeIterator for BitIter {}
