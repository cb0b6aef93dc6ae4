//! Heap-consistency self-checks, in the spirit of `slitter`'s
//! `debug_allocation_map` / `debug_arange_map`: active only in test builds
//! or under the `check_contracts` feature, never compiled into a release
//! build's hot path.
use std::collections::HashMap;
use std::sync::Mutex;

use crate::chunk::{self, ChunkRef, FENCE_SIZE, NODE_OVERHEAD};
use crate::state::HeapState;

/// Walks the whole heap from the start sentinel to the end sentinel and
/// confirms every invariant in the data model holds:
///
/// - header/footer size and state agree for every chunk,
/// - every chunk's size is a multiple of 16 and at least `NODE_OVERHEAD`,
/// - the walk reaches the end sentinel after visiting every chunk exactly
///   once,
/// - no two physically adjacent chunks are both free,
/// - the free list contains exactly the free chunks, in strictly
///   increasing address order.
pub(crate) fn walk_heap(heap: &HeapState) -> Result<(), String> {
    let (start, end) = match (heap.heap_start(), heap.heap_break()) {
        (Some(start), Some(end)) => (start, end),
        _ => return Ok(()), // heap never grown, nothing to check
    };

    let start_tag = unsafe { (start.as_ptr() as *const usize).read() };
    if !chunk::is_sentinel(start_tag) {
        return Err("start sentinel is corrupted".to_string());
    }

    let mut cursor =
        unsafe { ChunkRef::at(std::ptr::NonNull::new_unchecked(start.as_ptr().add(FENCE_SIZE))) };
    let mut walked_free_count = 0usize;
    let mut prev_was_free = false;

    loop {
        let tag = cursor.header_tag();

        if chunk::is_sentinel(tag) {
            let expected = unsafe { end.as_ptr().sub(FENCE_SIZE) };
            if cursor.base_ptr() as *const u8 != expected {
                return Err(format!(
                    "end sentinel at {:?}, expected {:?}",
                    cursor.base_ptr(),
                    expected
                ));
            }
            break;
        }

        let size = chunk::tag_size_of(tag);
        if size % 16 != 0 || size < NODE_OVERHEAD {
            return Err(format!(
                "chunk at {:?} has invalid size {}",
                cursor.base_ptr(),
                size
            ));
        }

        let footer_tag = cursor.footer_tag();
        if footer_tag != tag {
            return Err(format!(
                "chunk at {:?} header tag {:#x} disagrees with footer tag {:#x}",
                cursor.base_ptr(),
                tag,
                footer_tag
            ));
        }

        let is_free = !chunk::tag_is_used(tag);
        if is_free {
            walked_free_count += 1;
            if prev_was_free {
                return Err(format!(
                    "chunk at {:?} is free and adjacent to a free predecessor",
                    cursor.base_ptr()
                ));
            }
        }
        prev_was_free = is_free;

        cursor = cursor.next_chunk();
    }

    let mut list_count = 0usize;
    let mut prev_addr: Option<usize> = None;
    let mut cur = heap.free_list().head();

    while let Some(chunk) = cur {
        if let Some(prev) = prev_addr {
            if chunk.addr() <= prev {
                return Err("free list is not in strictly increasing address order".to_string());
            }
        }
        prev_addr = Some(chunk.addr());

        if chunk.is_used() {
            return Err(format!(
                "chunk at {:?} is on the free list but marked used",
                chunk.base_ptr()
            ));
        }

        list_count += 1;
        cur = chunk.next_link();
    }

    if list_count != walked_free_count {
        return Err(format!(
            "free list has {} entries but the heap walk found {} free chunks",
            list_count, walked_free_count
        ));
    }

    Ok(())
}

/// Tracks the liveness of every address this allocator has ever handed out,
/// so property tests can catch a double-free or a free of an address never
/// returned by `allocate` before it corrupts the heap enough to make
/// `walk_heap` itself lie.
///
/// Mirrors the teacher's `debug_allocation_map`: a lazily-populated map from
/// address to a `live` bit, guarded by its own mutex rather than the heap's,
/// since the test harness needs to record allocations and frees without
/// holding the heap lock across the call into `entry::allocate`/`free`.
lazy_static::lazy_static! {
    static ref LIVE: Mutex<HashMap<usize, bool>> = Default::default();
}

/// Records `addr` as newly handed to the mutator. Panics (test harness only)
/// if `addr` is currently recorded as live, which would mean the allocator
/// returned an address it had not yet freed.
pub(crate) fn mark_allocated(addr: usize) {
    let mut map = LIVE.lock().unwrap();
    if let Some(true) = map.insert(addr, true) {
        panic!("allocator returned address {addr:#x} that is still live");
    }
}

/// Records `addr` as released by the mutator. Panics (test harness only) on
/// a double-free or a free of an address never seen by `mark_allocated`.
pub(crate) fn mark_released(addr: usize) {
    let mut map = LIVE.lock().unwrap();
    match map.insert(addr, false) {
        Some(true) => {}
        Some(false) => panic!("double free of address {addr:#x}"),
        None => panic!("free of address {addr:#x} never returned by allocate"),
    }
}
