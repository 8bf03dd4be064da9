use std::sync::Barrier;

use morton_encoding::morton_encode;

use crate::geometry::{WorldBox, WorldPoint};
use crate::sync::{SharedSlots, thread_range};

/// Grid resolution per axis.
pub const LATTICE_BITS_PER_DIM: u32 = 10;
const LATTICE_SIZE: u32 = 1 << LATTICE_BITS_PER_DIM;

const RADIX_BITS: u32 = 8;
pub(crate) const RADIX_BUCKETS: usize = 1 << RADIX_BITS;
const RADIX_PASSES: usize = (u32::BITS / RADIX_BITS) as usize;
const _: () = assert!(RADIX_PASSES % 2 == 0, "sorted keys must end up in the input buffer");

/// Morton code of a primitive centroid together with the primitive index.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MortonId {
    code: u32,
    index: u32,
}

impl MortonId {
    pub fn new(code: u32, index: u32) -> Self {
        MortonId { code, index }
    }

    pub fn code(&self) -> u32 {
        self.code
    }

    /// Index of the primitive in the source.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// One 8-bit digit of the code, 0 is the least significant.
    pub fn byte(&self, b: usize) -> usize {
        ((self.code >> (b as u32 * RADIX_BITS)) & (RADIX_BUCKETS as u32 - 1)) as usize
    }
}

/// Morton code of a doubled centroid on a 1024^3 grid spanning `centroid2_bounds`.
///
/// Axes with zero extent map to 0.
pub fn morton_code(centroid2: &WorldPoint, centroid2_bounds: &WorldBox) -> u32 {
    let extent = centroid2_bounds.size();
    let grid_coordinates: [u32; 3] = std::array::from_fn(|axis| {
        let scale = if extent[axis] > 0.0 {
            LATTICE_SIZE as f32 * 0.99 / extent[axis]
        } else {
            0.0
        };
        let q = (centroid2[axis] - centroid2_bounds.min[axis]) * scale;
        (q.max(0.0) as u32).min(LATTICE_SIZE - 1)
    });

    morton_encode(grid_coordinates) as u32
}

/// Stable least-significant-digit radix sort run by all threads of a phase together.
///
/// Every one of the `thread_count` threads must call this with the same buffers.
/// Sorted keys end up back in `keys`, `tmp` is scratch space of the same length
/// and `histograms` has one entry per thread.
pub(crate) fn radix_sort_worker(
    thread_index: usize,
    thread_count: usize,
    keys: &SharedSlots<MortonId>,
    tmp: &SharedSlots<MortonId>,
    histograms: &SharedSlots<[usize; RADIX_BUCKETS]>,
    barrier: &Barrier,
) {
    debug_assert!(keys.len() == tmp.len());
    debug_assert!(histograms.len() == thread_count);

    let range = thread_range(keys.len(), thread_index, thread_count);

    for pass in 0..RADIX_PASSES {
        let (src, dst) = if pass % 2 == 0 { (keys, tmp) } else { (tmp, keys) };

        let mut counts = [0usize; RADIX_BUCKETS];
        for i in range.clone() {
            // Safety: src is only read during this pass
            counts[unsafe { src.read(i) }.byte(pass)] += 1;
        }
        // Safety: each thread writes its own histogram, the others read it after the barrier
        unsafe { histograms.set(thread_index, counts) };

        barrier.wait();

        // Start of this thread's run within every bucket
        let all_counts: Vec<&[usize; RADIX_BUCKETS]> = (0..thread_count)
            .map(|t| unsafe { histograms.get(t) })
            .collect();
        let mut offsets = [0usize; RADIX_BUCKETS];
        let mut total = 0;
        for (bucket, offset) in offsets.iter_mut().enumerate() {
            *offset = total;
            for (t, counts) in all_counts.iter().enumerate() {
                if t < thread_index {
                    *offset += counts[bucket];
                }
                total += counts[bucket];
            }
        }

        for i in range.clone() {
            let id = unsafe { src.read(i) };
            let bucket = id.byte(pass);
            // Safety: the offset ranges of different threads are disjoint
            unsafe { dst.set(offsets[bucket], id) };
            offsets[bucket] += 1;
        }

        barrier.wait();
    }
}

/// Sorts by morton code using `thread_count` threads. Equal codes keep their order.
pub fn radix_sort_parallel(ids: &mut [MortonId], thread_count: usize) {
    let thread_count = thread_count.max(1);
    let keys = SharedSlots::from_vec(ids.to_vec());
    let tmp = SharedSlots::new(ids.len(), |_| MortonId::default());
    let histograms = SharedSlots::new(thread_count, |_| [0usize; RADIX_BUCKETS]);
    let barrier = Barrier::new(thread_count);

    std::thread::scope(|s| {
        for thread_index in 0..thread_count {
            let (keys, tmp, histograms, barrier) = (&keys, &tmp, &histograms, &barrier);
            s.spawn(move || {
                radix_sort_worker(thread_index, thread_count, keys, tmp, histograms, barrier)
            });
        }
    });

    ids.copy_from_slice(&keys.into_vec());
}
