use std::cell::UnsafeCell;

/// Fixed size array that several threads write into without locking.
///
/// Threads must touch disjoint slots between two synchronization points
/// (barrier, scope end); every access is `unsafe` and callers uphold that.
pub struct SharedSlots<T> {
    slots: Box<[UnsafeCell<T>]>,
}

// Safety: access discipline is delegated to the callers of the unsafe accessors.
unsafe impl<T: Send> Sync for SharedSlots<T> {}

impl<T> SharedSlots<T> {
    pub fn new(len: usize, mut init: impl FnMut(usize) -> T) -> Self {
        SharedSlots {
            slots: (0..len).map(|i| UnsafeCell::new(init(i))).collect(),
        }
    }

    pub fn from_vec(values: Vec<T>) -> Self {
        SharedSlots {
            slots: values.into_iter().map(UnsafeCell::new).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// # Safety
    /// No other thread may be writing slot `index` concurrently.
    pub unsafe fn get(&self, index: usize) -> &T {
        unsafe { &*self.slots[index].get() }
    }

    /// # Safety
    /// No other thread may be accessing slot `index` concurrently.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut(&self, index: usize) -> &mut T {
        unsafe { &mut *self.slots[index].get() }
    }

    /// # Safety
    /// No other thread may be accessing slot `index` concurrently.
    pub unsafe fn set(&self, index: usize, value: T) {
        unsafe { *self.slots[index].get() = value }
    }

    /// # Safety
    /// No thread may write any slot while the returned slice is alive.
    pub unsafe fn as_slice(&self) -> &[T] {
        let ptr = UnsafeCell::raw_get(self.slots.as_ptr()) as *const T;
        unsafe { std::slice::from_raw_parts(ptr, self.slots.len()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        // Exclusive borrow, so no shared access can exist
        let len = self.slots.len();
        let ptr = UnsafeCell::raw_get(self.slots.as_ptr());
        unsafe { std::slice::from_raw_parts_mut(ptr, len) }
    }

    pub fn into_vec(self) -> Vec<T> {
        self.slots
            .into_vec()
            .into_iter()
            .map(UnsafeCell::into_inner)
            .collect()
    }
}

impl<T: Copy> SharedSlots<T> {
    /// # Safety
    /// No other thread may be writing slot `index` concurrently.
    pub unsafe fn read(&self, index: usize) -> T {
        unsafe { *self.slots[index].get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert2::assert;

    #[test]
    fn disjoint_parallel_writes() {
        let slots = SharedSlots::new(64, |_| 0usize);
        std::thread::scope(|s| {
            for t in 0..4 {
                let slots = &slots;
                s.spawn(move || {
                    for i in (t..64).step_by(4) {
                        unsafe { slots.set(i, i * 10) };
                    }
                });
            }
        });
        assert!(slots.into_vec() == (0..64).map(|i| i * 10).collect::<Vec<_>>());
    }

    #[test]
    fn mut_slice_view() {
        let mut slots = SharedSlots::from_vec(vec![3, 1, 2]);
        slots.as_mut_slice().sort();
        assert!(unsafe { slots.read(0) } == 1);
        assert!(unsafe { slots.as_slice() } == [1, 2, 3]);
        assert!(slots.len() == 3);
    }
}
