//! Utility
//!
//! **This module is exempt from the API stability guarantee** unless specified
//! otherwise. It's exposed only because it's needed by macros and the port.
mod init;
mod perm_bitmap;
pub use self::{init::*, perm_bitmap::*};

/// Round `x` up to the next multiple of `align`.
///
/// `align` must be a power of two.
#[inline]
pub const fn round_up(x: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (x + (align - 1)) & !(align - 1)
}

/// Like [`round_up`] but returns `None` on overflow.
#[inline]
pub const fn checked_round_up(x: usize, align: usize) -> Option<usize> {
    match x.checked_add(align - 1) {
        Some(x) => Some(x & !(align - 1)),
        None => None,
    }
}

/// Copy `src` into `dst` as a NUL-terminated string, truncating at a
/// character boundary if `src` doesn't fit. Returns the number of bytes copied
/// (excluding the terminator).
pub(crate) fn copy_nul_terminated(dst: &mut [u8], src: &str) -> usize {
    let Some(max_len) = dst.len().checked_sub(1) else {
        return 0;
    };

    let mut len = src.len().min(max_len);
    while !src.is_char_boundary(len) {
        len -= 1;
    }

    dst[..len].copy_from_slice(&src.as_bytes()[..len]);
    dst[len..].fill(0);
    len
}
