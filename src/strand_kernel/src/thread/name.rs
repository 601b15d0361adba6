use core::fmt;

use crate::utils::{copy_nul_terminated, Init};

/// The capacity of a thread name buffer, including the NUL terminator.
pub const THREAD_MAX_NAME_LEN: usize = 32;

/// A fixed-capacity, always NUL-terminated thread name.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ThreadName {
    buf: [u8; THREAD_MAX_NAME_LEN],
}

impl Init for ThreadName {
    const INIT: Self = Self::empty();
}

impl ThreadName {
    /// Construct an empty name.
    pub const fn empty() -> Self {
        Self {
            buf: [0; THREAD_MAX_NAME_LEN],
        }
    }

    /// Construct a name from `name`, truncating it to
    /// `THREAD_MAX_NAME_LEN - 1` bytes at a character boundary. `None`
    /// produces an empty name.
    pub fn new(name: Option<&str>) -> Self {
        let mut this = Self::empty();
        this.set(name);
        this
    }

    /// Replace the name. See [`Self::new`].
    pub fn set(&mut self, name: Option<&str>) {
        copy_nul_terminated(&mut self.buf, name.unwrap_or(""));
    }

    /// The length in bytes, not including the terminator.
    pub fn len(&self) -> usize {
        self.buf.iter().position(|&b| b == 0).unwrap_or(THREAD_MAX_NAME_LEN - 1)
    }

    pub fn is_empty(&self) -> bool {
        self.buf[0] == 0
    }

    pub fn as_str(&self) -> &str {
        // `set` only cuts at character boundaries
        core::str::from_utf8(&self.buf[..self.len()]).unwrap_or_default()
    }

    /// The name followed by the NUL terminator.
    pub fn as_bytes_with_nul(&self) -> &[u8] {
        &self.buf[..self.len() + 1]
    }
}

impl fmt::Debug for ThreadName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl fmt::Display for ThreadName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[quickcheck]
    fn truncation_keeps_terminator(name: String) -> bool {
        let subject = ThreadName::new(Some(&name));
        let bytes = subject.as_bytes_with_nul();

        bytes.len() <= THREAD_MAX_NAME_LEN
            && bytes.last() == Some(&0)
            && subject.len() <= THREAD_MAX_NAME_LEN - 1
            && name.starts_with(subject.as_str())
    }

    #[quickcheck]
    fn short_names_are_kept(name: String) -> bool {
        let name: String = name.chars().filter(|&c| c != '\0').take(8).collect();
        if name.len() >= THREAD_MAX_NAME_LEN {
            return true;
        }
        ThreadName::new(Some(&name)).as_str() == name
    }

    #[test]
    fn none_clears() {
        let mut subject = ThreadName::new(Some("worker"));
        assert_eq!(subject.as_str(), "worker");
        subject.set(None);
        assert!(subject.is_empty());
        assert_eq!(subject.as_bytes_with_nul(), b"\0");
    }

    #[test]
    fn long_name() {
        let long = "x".repeat(100);
        let subject = ThreadName::new(Some(&long));
        assert_eq!(subject.len(), THREAD_MAX_NAME_LEN - 1);
        assert_eq!(subject.as_str(), &long[..THREAD_MAX_NAME_LEN - 1]);
    }
}
