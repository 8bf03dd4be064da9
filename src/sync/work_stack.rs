use parking_lot::Mutex;

/// Items that can be compared by the amount of work they represent.
pub trait WorkSize {
    fn work_size(&self) -> usize;
}

/// Fixed capacity stack shared between worker threads.
///
/// The capacity is provisioned up front from the known amount of work;
/// overflowing an unguarded push is a sizing bug and panics.
#[derive(Debug)]
pub struct WorkStack<T> {
    items: Mutex<Vec<T>>,
    capacity: usize,
}

impl<T> WorkStack<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        WorkStack {
            items: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    /// Pushes an item, giving it back if the stack is full.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            return Err(item);
        }
        items.push(item);
        Ok(())
    }

    /// Push without locking, for filling the stack before it is shared. Panics if full.
    pub fn push_nolock(&mut self, item: T) {
        let items = self.items.get_mut();
        assert!(items.len() < self.capacity, "work stack overflow");
        items.push(item);
    }

    /// Pops the most recently pushed item, waiting for the lock.
    pub fn pop(&self) -> Option<T> {
        self.items.lock().pop()
    }

    /// Pops without waiting, returns None if the lock is taken or the stack is empty.
    pub fn try_pop(&self) -> Option<T> {
        self.items.try_lock()?.pop()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn into_vec(self) -> Vec<T> {
        self.items.into_inner()
    }
}

impl<T: WorkSize> WorkStack<T> {
    /// Removes the item with the most work, the first one found wins ties.
    pub fn pop_largest(&self) -> Option<T> {
        self.pop_by(|candidate, best| candidate > best)
    }

    /// Removes the item with the least work, the first one found wins ties.
    pub fn pop_smallest(&self) -> Option<T> {
        self.pop_by(|candidate, best| candidate < best)
    }

    fn pop_by(&self, better: impl Fn(usize, usize) -> bool) -> Option<T> {
        let mut items = self.items.lock();
        let mut best: Option<(usize, usize)> = None;
        for (i, item) in items.iter().enumerate() {
            let size = item.work_size();
            if best.is_none_or(|(_, best_size)| better(size, best_size)) {
                best = Some((i, size));
            }
        }
        best.map(|(i, _)| items.swap_remove(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert2::{assert, let_assert};

    #[derive(Debug, PartialEq)]
    struct Job(usize);

    impl WorkSize for Job {
        fn work_size(&self) -> usize {
            self.0
        }
    }

    #[test]
    fn lifo_order() {
        let stack = WorkStack::with_capacity(4);
        stack.push(Job(1)).unwrap();
        stack.push(Job(2)).unwrap();
        assert!(stack.len() == 2);
        assert!(stack.pop() == Some(Job(2)));
        assert!(stack.pop() == Some(Job(1)));
        assert!(stack.pop() == None);
        assert!(stack.is_empty());
    }

    #[test]
    fn push_on_full_stack_returns_item() {
        let stack = WorkStack::with_capacity(1);
        stack.push(Job(1)).unwrap();
        let_assert!(Err(Job(5)) = stack.push(Job(5)));
    }

    #[test]
    #[should_panic(expected = "work stack overflow")]
    fn push_nolock_overflow_is_fatal() {
        let mut stack = WorkStack::with_capacity(1);
        stack.push_nolock(Job(1));
        stack.push_nolock(Job(2));
    }

    #[test]
    fn pop_largest_and_smallest() {
        let mut stack = WorkStack::with_capacity(8);
        for size in [5, 9, 1, 9, 3] {
            stack.push_nolock(Job(size));
        }
        assert!(stack.pop_largest() == Some(Job(9)));
        assert!(stack.pop_smallest() == Some(Job(1)));
        assert!(stack.pop_largest() == Some(Job(9)));
        assert!(stack.pop_largest() == Some(Job(5)));
        assert!(stack.pop_smallest() == Some(Job(3)));
        assert!(stack.pop_largest() == None);
    }

    #[test]
    fn try_pop_fails_while_locked() {
        let stack = WorkStack::with_capacity(2);
        stack.push(Job(1)).unwrap();
        {
            let _guard = stack.items.lock();
            assert!(stack.try_pop() == None);
        }
        assert!(stack.try_pop() == Some(Job(1)));
    }

    #[test]
    fn concurrent_drain() {
        let mut stack = WorkStack::with_capacity(1000);
        for i in 0..1000 {
            stack.push_nolock(Job(i));
        }
        let mut popped: Vec<usize> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    s.spawn(|| {
                        let mut mine = Vec::new();
                        while let Some(job) = stack.pop_largest() {
                            mine.push(job.0);
                        }
                        mine
                    })
                })
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });
        popped.sort_unstable();
        assert!(popped == (0..1000).collect::<Vec<_>>());
    }
}
