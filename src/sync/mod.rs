//! Lock-free and low-contention building blocks for the parallel builder.
//! Phases are separated with `std::sync::Barrier`.

mod atomic_float;
mod block_allocator;
mod shared_slots;
mod work_stack;

pub use atomic_float::AtomicF32;
pub use block_allocator::{BlockAllocator, block_allocator_capacity};
pub use shared_slots::SharedSlots;
pub use work_stack::{WorkSize, WorkStack};

use std::num::NonZeroUsize;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum WorkerCount {
    /// One worker per logical CPU
    #[default]
    Auto,
    Manual(NonZeroUsize),
}

impl WorkerCount {
    pub fn get(&self) -> usize {
        match self {
            WorkerCount::Auto => num_cpus::get(),
            WorkerCount::Manual(num) => num.get(),
        }
    }
}

/// Contiguous share of `item_count` items processed by one of `thread_count` threads.
pub fn thread_range(item_count: usize, thread_index: usize, thread_count: usize) -> std::ops::Range<usize> {
    (item_count * thread_index / thread_count)..(item_count * (thread_index + 1) / thread_count)
}
