use std::sync::atomic::{AtomicUsize, Ordering};

/// Hands out contiguous index ranges from a shared counter, taking whole blocks at a time.
///
/// One allocator per thread; only block refills touch the shared counter.
/// Indices are never reused. Running past `capacity` is a sizing bug and panics.
#[derive(Debug)]
pub struct BlockAllocator<'a> {
    counter: &'a AtomicUsize,
    capacity: usize,
    block_size: usize,
    current: usize,
    end: usize,
}

impl<'a> BlockAllocator<'a> {
    pub fn new(counter: &'a AtomicUsize, capacity: usize, block_size: usize) -> Self {
        assert!(block_size > 0);
        BlockAllocator {
            counter,
            capacity,
            block_size,
            current: 0,
            end: 0,
        }
    }

    /// Returns the first of `count` consecutive indices.
    pub fn get(&mut self, count: usize) -> usize {
        if self.current + count > self.end {
            let block = self.block_size.max(count);
            let start = self.counter.fetch_add(block, Ordering::Relaxed);
            let end = start + block;
            assert!(
                end <= self.capacity,
                "not enough nodes allocated ({end} needed, capacity {})",
                self.capacity
            );
            self.current = start;
            self.end = end;
        }

        let ret = self.current;
        self.current += count;
        ret
    }
}

/// Number of slots needed so that `thread_count` block allocators can hand out
/// `item_count` indices in total.
pub fn block_allocator_capacity(item_count: usize, thread_count: usize, block_size: usize) -> usize {
    item_count + thread_count * block_size
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert2::assert;
    use itertools::Itertools as _;

    #[test]
    fn consecutive_within_block() {
        let counter = AtomicUsize::new(0);
        let mut allocator = BlockAllocator::new(&counter, 100, 8);
        assert!(allocator.get(1) == 0);
        assert!(allocator.get(3) == 1);
        assert!(allocator.get(4) == 4);
        assert!(counter.load(Ordering::Relaxed) == 8);
        assert!(allocator.get(1) == 8);
        assert!(counter.load(Ordering::Relaxed) == 16);
    }

    #[test]
    fn request_larger_than_block() {
        let counter = AtomicUsize::new(0);
        let mut allocator = BlockAllocator::new(&counter, 100, 4);
        allocator.get(1);
        assert!(allocator.get(10) == 4);
        assert!(allocator.get(1) == 14);
    }

    #[test]
    #[should_panic(expected = "not enough nodes allocated")]
    fn capacity_exceeded_is_fatal() {
        let counter = AtomicUsize::new(0);
        let mut allocator = BlockAllocator::new(&counter, 10, 8);
        allocator.get(8);
        allocator.get(1);
    }

    #[test]
    fn threads_get_disjoint_indices() {
        const THREADS: usize = 4;
        const PER_THREAD: usize = 1000;
        let counter = AtomicUsize::new(0);
        let capacity = block_allocator_capacity(THREADS * PER_THREAD, THREADS, 16);

        let mut all: Vec<usize> = std::thread::scope(|s| {
            let handles = (0..THREADS)
                .map(|_| {
                    s.spawn(|| {
                        let mut allocator = BlockAllocator::new(&counter, capacity, 16);
                        (0..PER_THREAD).map(|_| allocator.get(1)).collect::<Vec<_>>()
                    })
                })
                .collect_vec();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect()
        });

        all.sort_unstable();
        assert!(all.iter().tuple_windows().all(|(a, b)| a < b));
        assert!(*all.last().unwrap() < capacity);
    }
}
