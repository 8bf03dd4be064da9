use std::sync::atomic::{AtomicU32, Ordering};

/// f32 stored in an atomic integer.
/// Min and max are compare-and-retry loops comparing as floats, not as bit patterns,
/// so negative values and mixed signs behave.
#[derive(Debug)]
#[repr(transparent)]
pub struct AtomicF32(AtomicU32);

impl AtomicF32 {
    pub fn new(value: f32) -> Self {
        AtomicF32(AtomicU32::new(value.to_bits()))
    }

    pub fn load(&self, order: Ordering) -> f32 {
        f32::from_bits(self.0.load(order))
    }

    pub fn store(&self, value: f32, order: Ordering) {
        self.0.store(value.to_bits(), order)
    }

    /// Stores the minimum of the current and given value, returns the previous value.
    pub fn fetch_min(&self, value: f32, order: Ordering) -> f32 {
        self.update_if(value, order, |current| value < current)
    }

    /// Stores the maximum of the current and given value, returns the previous value.
    pub fn fetch_max(&self, value: f32, order: Ordering) -> f32 {
        self.update_if(value, order, |current| value > current)
    }

    fn update_if(&self, value: f32, order: Ordering, mut replace: impl FnMut(f32) -> bool) -> f32 {
        let mut current_bits = self.0.load(Ordering::Relaxed);
        loop {
            let current = f32::from_bits(current_bits);
            if !replace(current) {
                return current;
            }
            match self.0.compare_exchange_weak(
                current_bits,
                value.to_bits(),
                order,
                Ordering::Relaxed,
            ) {
                Ok(_) => return current,
                Err(actual) => current_bits = actual,
            }
        }
    }
}
