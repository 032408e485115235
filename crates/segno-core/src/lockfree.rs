//! Lock-free primitives shared between UI, input and output threads.

use std::sync::atomic::Ordering;

use atomic_float::AtomicF32;

/// Cache-line aligned atomic f32.
///
/// Backs meter gains, pan positions and the tempo cell; readers on the
/// hot paths only ever need *a* recent value.
#[derive(Debug)]
#[repr(align(64))]
pub struct AtomicFloat {
    value: AtomicF32,
}

impl AtomicFloat {
    pub fn new(value: f32) -> Self {
        Self {
            value: AtomicF32::new(value),
        }
    }

    #[inline]
    pub fn get(&self) -> f32 {
        self.value.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set(&self, value: f32) {
        self.value.store(value, Ordering::Release);
    }

    #[inline]
    pub fn swap(&self, value: f32) -> f32 {
        self.value.swap(value, Ordering::AcqRel)
    }
}

impl Clone for AtomicFloat {
    fn clone(&self) -> Self {
        Self::new(self.get())
    }
}

impl Default for AtomicFloat {
    fn default() -> Self {
        Self::new(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_set() {
        let value = AtomicFloat::new(0.5);
        assert_eq!(value.get(), 0.5);
        value.set(-1.25);
        assert_eq!(value.get(), -1.25);
    }

    #[test]
    fn test_swap() {
        let value = AtomicFloat::new(1.0);
        assert_eq!(value.swap(2.5), 1.0);
        assert_eq!(value.get(), 2.5);
    }
}
