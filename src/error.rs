//! Recoverable allocator failures.
//!
//! The public ABI (`allocate`, `free`, ...) never surfaces this type
//! directly -- it returns null and records one of these in the
//! thread-local error cell, matching the platform allocator's errno
//! convention. Internal, fallible helpers use `Result<T, HeapError>`
//! so the translation to the ABI only happens once, at the entry shims.
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// `zeroed_allocate`'s `count * elem_size` would overflow `usize`.
    SizeOverflow,
    /// The page source could not supply more memory.
    PageExhausted,
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            HeapError::SizeOverflow => "allocation size overflowed",
            HeapError::PageExhausted => "out of memory: page source exhausted",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for HeapError {}
