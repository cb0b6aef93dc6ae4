//! `ChunkRef` is a capability over a raw heap address: it mediates every
//! bit of pointer arithmetic the boundary-tag allocator needs, so no other
//! module reads or writes chunk bytes directly.
//!
//! Layout of a chunk, low to high address:
//!
//! ```text
//! [ header (size|used) ][ prev ][ next ][ ... payload ... ][ footer (size|used) ]
//! ```
//!
//! `prev`/`next` only hold meaningful data while the chunk is free; a used
//! chunk's payload starts in the same slot and may overwrite them freely.
use std::ptr::NonNull;

use static_assertions::const_assert_eq;

/// Pointer-sized word. The allocator assumes a 64-bit target throughout.
pub(crate) const WORD: usize = std::mem::size_of::<usize>();
const_assert_eq!(WORD, 8);

/// Size of a boundary tag (header or footer).
pub(crate) const FENCE_SIZE: usize = WORD;

/// Bytes a free chunk needs beyond its footer: the header word plus the
/// prev/next link words.
pub(crate) const NODE_SIZE: usize = WORD + 2 * WORD;

/// Smallest chunk that can ever exist: header, both free-list links, footer.
pub(crate) const NODE_OVERHEAD: usize = NODE_SIZE + FENCE_SIZE;

/// All chunk sizes, and the heap itself, are aligned to this boundary, which
/// is also the alignment guaranteed to callers (see `round_up_chunk_size`).
pub(crate) const CHUNK_ALIGN: usize = 16;

const USED_BIT: usize = 1;

/// Rounds `x` up to the nearest multiple of `multiple`, which must be a
/// power of two.
pub(crate) fn round_up(x: usize, multiple: usize) -> usize {
    debug_assert!(multiple.is_power_of_two());
    (x + multiple - 1) & !(multiple - 1)
}

/// Computes the on-heap chunk size for a user request of `requested` bytes:
/// enough payload for the request, a header and a footer, rounded up to
/// `CHUNK_ALIGN`, and never smaller than a chunk that could later hold free
/// list links.
pub(crate) fn round_up_chunk_size(requested: usize) -> usize {
    let min_payload = NODE_OVERHEAD - FENCE_SIZE;
    round_up(requested.max(min_payload) + 2 * FENCE_SIZE, CHUNK_ALIGN)
}

fn tag_size(tag: usize) -> usize {
    tag & !USED_BIT
}

fn tag_used(tag: usize) -> bool {
    tag & USED_BIT != 0
}

fn make_tag(size: usize, used: bool) -> usize {
    debug_assert_eq!(size & USED_BIT, 0, "chunk size must be even");
    if used {
        size | USED_BIT
    } else {
        size
    }
}

/// A single sentinel word: used bit set, size field zero.
pub(crate) const SENTINEL_TAG: usize = USED_BIT;

/// Writes a sentinel fence at `at`.
///
/// # Safety
///
/// `at` must point to a valid, writable word.
pub(crate) unsafe fn write_sentinel(at: NonNull<u8>) {
    (at.as_ptr() as *mut usize).write(SENTINEL_TAG);
}

/// A capability over the chunk whose header starts at `base`. Copyable: it
/// is just an address, distinct instances may alias the same chunk.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct ChunkRef {
    base: NonNull<u8>,
}

impl ChunkRef {
    /// Wraps `base` as a chunk header.
    ///
    /// # Safety
    ///
    /// `base` must point at the start of a live chunk's header word.
    pub(crate) unsafe fn at(base: NonNull<u8>) -> Self {
        Self { base }
    }

    /// Recovers the chunk owning a payload pointer previously handed to a
    /// caller.
    ///
    /// # Safety
    ///
    /// `payload` must be a pointer this allocator previously returned from
    /// an allocate-family call, and must not already have been freed.
    pub(crate) unsafe fn from_payload(payload: NonNull<u8>) -> Self {
        Self {
            base: NonNull::new_unchecked(payload.as_ptr().sub(FENCE_SIZE)),
        }
    }

    pub(crate) fn addr(self) -> usize {
        self.base.as_ptr() as usize
    }

    pub(crate) fn base_ptr(self) -> *mut u8 {
        self.base.as_ptr()
    }

    fn header_ptr(self) -> *mut usize {
        self.base.as_ptr() as *mut usize
    }

    pub(crate) fn header_tag(self) -> usize {
        unsafe { self.header_ptr().read() }
    }

    pub(crate) fn size(self) -> usize {
        tag_size(self.header_tag())
    }

    pub(crate) fn is_used(self) -> bool {
        tag_used(self.header_tag())
    }

    fn footer_ptr(self, size: usize) -> *mut usize {
        unsafe { self.base.as_ptr().add(size - FENCE_SIZE) as *mut usize }
    }

    pub(crate) fn footer_tag(self) -> usize {
        let size = self.size();
        unsafe { self.footer_ptr(size).read() }
    }

    /// Writes matching header and footer tags encoding `size` and `used`.
    pub(crate) fn write_tags(self, size: usize, used: bool) {
        let tag = make_tag(size, used);
        unsafe {
            self.header_ptr().write(tag);
            self.footer_ptr(size).write(tag);
        }
    }

    fn link_ptr(self, word_offset: usize) -> *mut usize {
        unsafe { self.base.as_ptr().add(WORD * word_offset) as *mut usize }
    }

    fn read_link(self, word_offset: usize) -> Option<ChunkRef> {
        let raw = unsafe { self.link_ptr(word_offset).read() };
        NonNull::new(raw as *mut u8).map(|base| ChunkRef { base })
    }

    fn write_link(self, word_offset: usize, chunk: Option<ChunkRef>) {
        let raw = chunk.map(ChunkRef::addr).unwrap_or(0);
        unsafe { self.link_ptr(word_offset).write(raw) }
    }

    pub(crate) fn prev_link(self) -> Option<ChunkRef> {
        self.read_link(1)
    }

    pub(crate) fn set_prev_link(self, chunk: Option<ChunkRef>) {
        self.write_link(1, chunk)
    }

    pub(crate) fn next_link(self) -> Option<ChunkRef> {
        self.read_link(2)
    }

    pub(crate) fn set_next_link(self, chunk: Option<ChunkRef>) {
        self.write_link(2, chunk)
    }

    pub(crate) fn payload_ptr(self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(FENCE_SIZE)) }
    }

    /// Usable payload bytes, i.e. chunk size minus header and footer.
    pub(crate) fn payload_capacity(self) -> usize {
        self.size() - 2 * FENCE_SIZE
    }

    /// The next chunk in address order, found by walking past this one's
    /// recorded size. Only valid while this chunk isn't the end sentinel.
    pub(crate) fn next_chunk(self) -> ChunkRef {
        let size = self.size();
        unsafe {
            Self {
                base: NonNull::new_unchecked(self.base.as_ptr().add(size)),
            }
        }
    }

    /// The footer word of whatever chunk (or sentinel) physically precedes
    /// this one.
    pub(crate) fn prev_footer_tag(self) -> usize {
        unsafe { (self.base.as_ptr().sub(FENCE_SIZE) as *const usize).read() }
    }
}

pub(crate) fn is_sentinel(tag: usize) -> bool {
    tag == SENTINEL_TAG
}

pub(crate) fn tag_is_used(tag: usize) -> bool {
    tag_used(tag)
}

pub(crate) fn tag_size_of(tag: usize) -> usize {
    tag_size(tag)
}
