use core::fmt;

use super::Init;

/// The maximum number of threads that can hold a permission index, i.e., the
/// number of bits in [`PermBitmap`].
pub const MAX_THREADS: usize = 64;

/// A set of thread permission indices.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct PermBitmap(u64);

impl Init for PermBitmap {
    const INIT: Self = Self(0);
}

impl PermBitmap {
    pub const fn new() -> Self {
        Self(0)
    }

    /// Get the bit at `i`. `i` must be less than [`MAX_THREADS`].
    #[inline]
    pub const fn get(&self, i: usize) -> bool {
        assert!(i < MAX_THREADS);
        self.0 & (1 << i) != 0
    }

    #[inline]
    pub fn set(&mut self, i: usize) {
        assert!(i < MAX_THREADS);
        self.0 |= 1 << i;
    }

    #[inline]
    pub fn clear(&mut self, i: usize) {
        assert!(i < MAX_THREADS);
        self.0 &= !(1 << i);
    }

    #[inline]
    pub fn clear_all(&mut self) {
        self.0 = 0;
    }

    #[inline]
    pub const fn count(&self) -> u32 {
        self.0.count_ones()
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Find the lowest unset bit.
    #[inline]
    pub const fn first_clear(&self) -> Option<usize> {
        let i = (!self.0).trailing_zeros() as usize;
        if i < MAX_THREADS {
            Some(i)
        } else {
            None
        }
    }

    /// Iterate over the set bits in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> {
        let mut bits = self.0;
        core::iter::from_fn(move || {
            if bits == 0 {
                None
            } else {
                let i = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                Some(i)
            }
        })
    }
}

impl fmt::Debug for PermBitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
