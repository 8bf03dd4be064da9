use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;

use crate::geometry::{Triangle, WorldPoint};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BufferError {
    #[error("buffer is already mapped")]
    AlreadyMapped,

    #[error("buffer is not mapped")]
    NotMapped,

    #[error("stride {actual} doesn't match element size {expected}")]
    StrideMismatch { expected: usize, actual: usize },

    #[error("buffer already has storage")]
    AlreadyAllocated,

    #[error("got {actual} elements, buffer holds {expected}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("buffer has no storage")]
    Unallocated,
}

/// Element type of a `GeometryBuffer`.
pub trait BufferElement: Copy {
    /// Value of freshly allocated storage.
    fn zeroed() -> Self;
}

macro_rules! zeroed_element {
    ( $( $type:ty => $zero:expr ),* $(,)? ) => {
        $(
            impl BufferElement for $type {
                fn zeroed() -> Self {
                    $zero
                }
            }
        )*
    };
}

zeroed_element! {
    u32 => 0,
    f32 => 0.0,
    WorldPoint => WorldPoint::origin(),
    Triangle<u32> => Triangle::new(0, 0, 0),
}

/// Shared count of mapped buffers, one per scene.
pub(crate) type MappedCounter = Arc<AtomicUsize>;

/// Fixed size array of geometry data.
///
/// Storage is either allocated by the buffer itself (on `alloc` or on first `map`)
/// or handed over by the user through `set`. While a buffer is mapped its scene
/// refuses to build or refit. Failing calls leave the buffer unchanged.
#[derive(Debug)]
pub struct GeometryBuffer<T> {
    len: usize,
    data: Option<Vec<T>>,
    shared: bool,
    mapped: bool,
    counter: MappedCounter,
}

impl<T: BufferElement> GeometryBuffer<T> {
    /// Buffer of `len` elements without storage.
    pub fn new(len: usize) -> Self {
        GeometryBuffer {
            len,
            data: None,
            shared: false,
            mapped: false,
            counter: MappedCounter::default(),
        }
    }

    pub fn from_vec(data: Vec<T>) -> Self {
        GeometryBuffer {
            len: data.len(),
            data: Some(data),
            shared: true,
            mapped: false,
            counter: MappedCounter::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_allocated(&self) -> bool {
        self.data.is_some()
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped
    }

    /// Allocates zeroed storage.
    pub fn alloc(&mut self) -> Result<(), BufferError> {
        if self.shared || self.data.is_some() {
            return Err(BufferError::AlreadyAllocated);
        }
        self.data = Some(vec![T::zeroed(); self.len]);
        Ok(())
    }

    /// Replaces the storage with user data.
    /// `stride` is the byte distance between elements and must match the element size.
    pub fn set(&mut self, data: Vec<T>, stride: usize) -> Result<(), BufferError> {
        let expected = std::mem::size_of::<T>();
        if stride != expected {
            return Err(BufferError::StrideMismatch {
                expected,
                actual: stride,
            });
        }
        if data.len() != self.len {
            return Err(BufferError::SizeMismatch {
                expected: self.len,
                actual: data.len(),
            });
        }
        if self.mapped {
            return Err(BufferError::AlreadyMapped);
        }

        self.data = Some(data);
        self.shared = true;
        Ok(())
    }

    /// Gives write access to the data, allocating storage if there is none yet.
    /// The buffer stays mapped until `unmap`.
    pub fn map(&mut self) -> Result<&mut [T], BufferError> {
        if self.mapped {
            return Err(BufferError::AlreadyMapped);
        }

        self.counter.fetch_add(1, Ordering::Relaxed);
        self.mapped = true;
        let len = self.len;
        Ok(self
            .data
            .get_or_insert_with(|| vec![T::zeroed(); len])
            .as_mut_slice())
    }

    pub fn unmap(&mut self) -> Result<(), BufferError> {
        if !self.mapped {
            return Err(BufferError::NotMapped);
        }

        self.counter.fetch_sub(1, Ordering::Relaxed);
        self.mapped = false;
        Ok(())
    }

    /// Current contents, empty if the buffer has no storage.
    pub fn as_slice(&self) -> &[T] {
        self.data.as_deref().unwrap_or_default()
    }

    /// Contents of a buffer that must have storage.
    pub fn data(&self) -> Result<&[T], BufferError> {
        self.data.as_deref().ok_or(BufferError::Unallocated)
    }

    /// Moves the buffer's mapped state over to another counter.
    pub(crate) fn attach(&mut self, counter: &MappedCounter) {
        if self.mapped {
            self.counter.fetch_sub(1, Ordering::Relaxed);
            counter.fetch_add(1, Ordering::Relaxed);
        }
        self.counter = Arc::clone(counter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert2::{assert, let_assert};

    #[test]
    fn map_allocates_and_counts() {
        let counter = MappedCounter::default();
        let mut buffer = GeometryBuffer::<u32>::new(3);
        buffer.attach(&counter);
        assert!(!buffer.is_allocated());

        let_assert!(Ok(data) = buffer.map());
        data.copy_from_slice(&[1, 2, 3]);
        assert!(counter.load(Ordering::Relaxed) == 1);

        buffer.unmap().unwrap();
        assert!(counter.load(Ordering::Relaxed) == 0);
        assert!(buffer.as_slice() == [1, 2, 3]);
    }

    #[test]
    fn double_map_is_rejected() {
        let counter = MappedCounter::default();
        let mut buffer = GeometryBuffer::<u32>::new(2);
        buffer.attach(&counter);

        buffer.map().unwrap();
        let_assert!(Err(BufferError::AlreadyMapped) = buffer.map());
        assert!(counter.load(Ordering::Relaxed) == 1);
        assert!(buffer.is_mapped());
    }

    #[test]
    fn unmap_of_unmapped_is_rejected() {
        let mut buffer = GeometryBuffer::<u32>::new(2);
        assert!(buffer.unmap() == Err(BufferError::NotMapped));
        assert!(buffer.counter.load(Ordering::Relaxed) == 0);
    }

    #[test]
    fn set_checks_stride_and_size() {
        let mut buffer = GeometryBuffer::<u32>::new(2);

        assert!(
            buffer.set(vec![1, 2], 8)
                == Err(BufferError::StrideMismatch {
                    expected: 4,
                    actual: 8
                })
        );
        assert!(
            buffer.set(vec![1, 2, 3], 4)
                == Err(BufferError::SizeMismatch {
                    expected: 2,
                    actual: 3
                })
        );
        assert!(!buffer.is_allocated());

        buffer.set(vec![5, 6], 4).unwrap();
        assert!(buffer.as_slice() == [5, 6]);
    }

    #[test]
    fn alloc_twice_is_rejected() {
        let mut buffer = GeometryBuffer::<f32>::new(4);
        buffer.alloc().unwrap();
        assert!(buffer.alloc() == Err(BufferError::AlreadyAllocated));

        let mut shared = GeometryBuffer::from_vec(vec![1.0f32]);
        assert!(shared.alloc() == Err(BufferError::AlreadyAllocated));
    }

    #[test]
    fn unallocated_data_is_an_error() {
        let buffer = GeometryBuffer::<f32>::new(4);
        assert!(buffer.data() == Err(BufferError::Unallocated));
        assert!(buffer.as_slice().is_empty());
    }

    #[test]
    fn attach_moves_mapped_count() {
        let mut buffer = GeometryBuffer::<u32>::new(1);
        buffer.map().unwrap();

        let counter = MappedCounter::default();
        buffer.attach(&counter);
        assert!(counter.load(Ordering::Relaxed) == 1);
        buffer.unmap().unwrap();
        assert!(counter.load(Ordering::Relaxed) == 0);
    }
}
