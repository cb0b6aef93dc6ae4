//! The chunk manager: the one piece of global, mutex-guarded state that
//! owns the heap extent and the free list, and the only place that mutates
//! either.
//!
//! Every public entry point in [`crate::entry`] acquires [`HEAP`] for the
//! whole of its call; no core operation here ever runs without the lock
//! held.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
)))]
use disabled_contracts::*;

use std::ptr::NonNull;
use std::sync::Mutex;

use crate::chunk::{self, ChunkRef, FENCE_SIZE, NODE_OVERHEAD};
use crate::error::HeapError;
use crate::free_list::FreeList;
use crate::page_source::{PageSource, SystemPageSource};

pub(crate) struct HeapState {
    free_list: FreeList,
    heap_start: Option<NonNull<u8>>,
    heap_break: Option<NonNull<u8>>,
    page_source: Box<dyn PageSource>,
}

// `HeapState` holds raw pointers into memory this process owns, but every
// access goes through the `Mutex` in `HEAP`, so it is safe to move between
// threads.
unsafe impl Send for HeapState {}

impl HeapState {
    fn new(page_source: Box<dyn PageSource>) -> Self {
        Self {
            free_list: FreeList::default(),
            heap_start: None,
            heap_break: None,
            page_source,
        }
    }

    pub(crate) fn heap_start(&self) -> Option<NonNull<u8>> {
        self.heap_start
    }

    pub(crate) fn heap_break(&self) -> Option<NonNull<u8>> {
        self.heap_break
    }

    pub(crate) fn free_list(&self) -> &FreeList {
        &self.free_list
    }

    /// Services one allocation request. `chunk_size` must already be
    /// rounded per [`chunk::round_up_chunk_size`].
    #[ensures(ret.is_err() -> self.heap_break == old(self.heap_break),
              "A failed allocation never silently grows the heap.")]
    pub(crate) fn allocate(&mut self, chunk_size: usize) -> Result<NonNull<u8>, HeapError> {
        let fit = match self.free_list.find_fit(chunk_size) {
            Some(chunk) => chunk,
            None => self.expand(chunk_size)?,
        };

        let used = self.split(fit, chunk_size);
        Ok(used.payload_ptr())
    }

    /// Releases a previously allocated block, then coalesces it with
    /// whichever physical neighbors are free.
    pub(crate) fn free(&mut self, ptr: NonNull<u8>) {
        let chunk = unsafe { ChunkRef::from_payload(ptr) };
        let size = chunk.size();

        chunk.write_tags(size, false);

        let merged = self.fuse_up(chunk);
        self.fuse_down(merged);
    }

    /// Splits `chunk` (already removed from no list -- it is the caller's
    /// job to have found it via `find_fit`) down to `request` bytes,
    /// handing the residual back to the free list when it is large enough
    /// to hold one, and marks the returned chunk Used.
    #[requires(chunk.size() >= request, "the chunk must already fit the request")]
    fn split(&mut self, chunk: ChunkRef, request: usize) -> ChunkRef {
        self.free_list.remove(chunk);

        let total = chunk.size();
        let residual = total - request;

        if residual >= NODE_OVERHEAD {
            chunk.write_tags(request, true);

            let remainder_base =
                unsafe { NonNull::new_unchecked(chunk.base_ptr().add(request)) };
            let remainder = unsafe { ChunkRef::at(remainder_base) };
            remainder.write_tags(residual, false);
            remainder.set_prev_link(None);
            remainder.set_next_link(None);
            self.free_list.insert(remainder);
        } else {
            chunk.write_tags(total, true);
        }

        chunk
    }

    /// Attempts to merge `chunk` into its free physical predecessor.
    ///
    /// If the predecessor is Used (or is the start sentinel), `chunk` is
    /// inserted into the free list and returned unchanged. Otherwise the
    /// predecessor absorbs `chunk`'s bytes and is returned; it keeps its
    /// existing free-list links, since merging never changes its address.
    fn fuse_up(&mut self, chunk: ChunkRef) -> ChunkRef {
        let prev_tag = chunk.prev_footer_tag();

        if chunk::tag_is_used(prev_tag) {
            self.free_list.insert(chunk);
            return chunk;
        }

        let prev_size = chunk::tag_size_of(prev_tag);
        let prev_base = unsafe { NonNull::new_unchecked(chunk.base_ptr().sub(prev_size)) };
        let prev = unsafe { ChunkRef::at(prev_base) };

        let combined = prev_size + chunk.size();
        prev.write_tags(combined, false);
        prev
    }

    /// Attempts to merge `chunk`'s free physical successor into it. `chunk`
    /// must already be a member of the free list (fuse_up guarantees this:
    /// either it inserted `chunk` itself, or `chunk` is the predecessor
    /// that was already there).
    fn fuse_down(&mut self, chunk: ChunkRef) -> ChunkRef {
        let next = chunk.next_chunk();
        let next_tag = next.header_tag();

        if chunk::tag_is_used(next_tag) {
            return chunk;
        }

        self.free_list.remove(next);

        let combined = chunk.size() + chunk::tag_size_of(next_tag);
        chunk.write_tags(combined, false);
        chunk
    }

    /// Grows the heap by at least `request` bytes and returns a free chunk
    /// of at least that size, already a member of the free list.
    fn expand(&mut self, request: usize) -> Result<ChunkRef, HeapError> {
        match self.heap_break {
            None => self.expand_initial(request),
            Some(_) => self.expand_subsequent(request),
        }
    }

    fn expand_initial(&mut self, request: usize) -> Result<ChunkRef, HeapError> {
        let page_size = self.page_source.page_size();
        let pages = chunk::round_up(request + 2 * FENCE_SIZE, page_size);

        let region = self.page_source.obtain(pages)?;

        unsafe { chunk::write_sentinel(region) };
        let end_fence = unsafe { NonNull::new_unchecked(region.as_ptr().add(pages - FENCE_SIZE)) };
        unsafe { chunk::write_sentinel(end_fence) };

        self.heap_start = Some(region);
        self.heap_break = Some(unsafe { NonNull::new_unchecked(region.as_ptr().add(pages)) });

        let free_base = unsafe { NonNull::new_unchecked(region.as_ptr().add(FENCE_SIZE)) };
        let free_chunk = unsafe { ChunkRef::at(free_base) };
        free_chunk.write_tags(pages - 2 * FENCE_SIZE, false);
        free_chunk.set_prev_link(None);
        free_chunk.set_next_link(None);
        self.free_list.insert(free_chunk);

        tracing::debug!(pages, "initialized heap");
        Ok(free_chunk)
    }

    fn expand_subsequent(&mut self, request: usize) -> Result<ChunkRef, HeapError> {
        let page_size = self.page_source.page_size();
        let pages = chunk::round_up(request, page_size);

        let old_break = self.heap_break.expect("heap already initialized");
        let region = self.page_source.obtain(pages)?;
        debug_assert_eq!(
            region.as_ptr(),
            old_break.as_ptr(),
            "page source must hand back memory contiguous with the current break"
        );

        let new_break = unsafe { NonNull::new_unchecked(region.as_ptr().add(pages)) };
        let end_fence = unsafe { NonNull::new_unchecked(new_break.as_ptr().sub(FENCE_SIZE)) };
        unsafe { chunk::write_sentinel(end_fence) };
        self.heap_break = Some(new_break);

        // Reclaim the word that held the old end sentinel as the header of
        // the freshly grown chunk: it is free to merge with whatever free
        // chunk immediately preceded it, via the usual fuse_up.
        let free_base = unsafe { NonNull::new_unchecked(region.as_ptr().sub(FENCE_SIZE)) };
        let free_chunk = unsafe { ChunkRef::at(free_base) };
        free_chunk.write_tags(pages, false);
        free_chunk.set_prev_link(None);
        free_chunk.set_next_link(None);

        let merged = self.fuse_up(free_chunk);
        tracing::debug!(pages, "grew heap");
        Ok(merged)
    }
}

fn default_heap_state() -> HeapState {
    let config = crate::config::current();
    let page_source: Box<dyn PageSource> = match config.reservation_bytes {
        Some(bytes) => Box::new(SystemPageSource::with_reservation(bytes)),
        None => Box::new(SystemPageSource::new()),
    };
    HeapState::new(page_source)
}

lazy_static::lazy_static! {
    pub(crate) static ref HEAP: Mutex<HeapState> = Mutex::new(default_heap_state());
}

#[cfg(test)]
pub(crate) fn test_heap_with_reservation(reservation_bytes: usize) -> HeapState {
    HeapState::new(Box::new(SystemPageSource::with_reservation(reservation_bytes)))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::debug_check;

    fn small_heap() -> HeapState {
        test_heap_with_reservation(64 * crate::page_source::page_size())
    }

    #[test]
    fn allocate_then_free_leaves_one_free_chunk() {
        let mut heap = small_heap();

        let size = chunk::round_up_chunk_size(4);
        let ptr = heap.allocate(size).expect("allocate should succeed");
        debug_check::walk_heap(&heap).expect("heap should be consistent");

        heap.free(ptr);
        debug_check::walk_heap(&heap).expect("heap should be consistent");

        assert_eq!(heap.free_list().head().unwrap().prev_link(), None);
        assert_eq!(heap.free_list().head().unwrap().next_link(), None);
    }

    #[test]
    fn coalesces_three_adjacent_frees_into_one() {
        let mut heap = small_heap();
        let size = chunk::round_up_chunk_size(32);

        let a = heap.allocate(size).unwrap();
        let b = heap.allocate(size).unwrap();
        let c = heap.allocate(size).unwrap();

        heap.free(a);
        heap.free(c);
        // Two disjoint free chunks at this point.
        debug_check::walk_heap(&heap).unwrap();

        heap.free(b);
        debug_check::walk_heap(&heap).unwrap();

        let mut count = 0;
        let mut cur = heap.free_list().head();
        while let Some(chunk) = cur {
            count += 1;
            cur = chunk.next_link();
        }
        assert_eq!(count, 1, "a, b, c should have coalesced into a single chunk");
    }

    #[test]
    fn expansion_merges_with_prior_free_tail() {
        let mut heap = small_heap();
        let page = crate::page_source::page_size();

        // Force a first heap page, then free everything so the page's
        // entire free space sits at the tail as one free chunk.
        let small = heap.allocate(chunk::round_up_chunk_size(8)).unwrap();
        heap.free(small);
        debug_check::walk_heap(&heap).unwrap();

        let before = heap.free_list().head().unwrap().size();

        // Ask for something bigger than a page: this must grow the heap
        // and merge with the existing free tail rather than creating a
        // second free chunk.
        let big = heap.allocate(page * 2).unwrap();
        debug_check::walk_heap(&heap).unwrap();
        heap.free(big);
        debug_check::walk_heap(&heap).unwrap();

        let mut count = 0;
        let mut cur = heap.free_list().head();
        while let Some(chunk) = cur {
            count += 1;
            cur = chunk.next_link();
        }
        assert_eq!(count, 1);
        assert!(heap.free_list().head().unwrap().size() > before);
    }

    struct AlwaysFailsPageSource;

    impl std::fmt::Debug for AlwaysFailsPageSource {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("AlwaysFailsPageSource").finish()
        }
    }

    impl PageSource for AlwaysFailsPageSource {
        fn page_size(&self) -> usize {
            crate::page_source::page_size()
        }

        fn obtain(&self, _byte_count: usize) -> Result<NonNull<u8>, HeapError> {
            Err(HeapError::PageExhausted)
        }
    }

    #[test]
    fn exhausted_page_source_leaves_heap_untouched() {
        let mut heap = HeapState::new(Box::new(AlwaysFailsPageSource));

        let result = heap.allocate(chunk::round_up_chunk_size(16));
        assert_eq!(result, Err(HeapError::PageExhausted));
        assert_eq!(heap.heap_break(), None);
        assert_eq!(heap.free_list().head(), None);
    }

    use proptest::collection::vec as pvec;
    use proptest::prelude::*;

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Allocate(usize),
        FreeOldest,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1usize..2048).prop_map(Op::Allocate),
            Just(Op::FreeOldest),
        ]
    }

    proptest! {
        // Random allocate/free sequences must never leave the heap in a
        // state debug_check::walk_heap objects to.
        #[test]
        fn random_alloc_free_sequence_stays_consistent(ops in pvec(op_strategy(), 1..200)) {
            let mut heap = small_heap();
            let mut live: std::collections::VecDeque<NonNull<u8>> = std::collections::VecDeque::new();

            for op in ops {
                match op {
                    Op::Allocate(size) => {
                        if let Ok(ptr) = heap.allocate(chunk::round_up_chunk_size(size)) {
                            live.push_back(ptr);
                        }
                    }
                    Op::FreeOldest => {
                        if let Some(ptr) = live.pop_front() {
                            heap.free(ptr);
                        }
                    }
                }
                debug_check::walk_heap(&heap).expect("heap should stay consistent");
            }

            for ptr in live {
                heap.free(ptr);
            }
            debug_check::walk_heap(&heap).expect("heap should stay consistent after final frees");
        }
    }

    #[test]
    fn concurrent_allocate_free_resize_stays_consistent() {
        use std::thread;

        let threads: Vec<_> = (0..8)
            .map(|t| {
                thread::spawn(move || {
                    let mut ptrs = Vec::new();
                    for i in 0..200 {
                        let size = 8 + ((t * 37 + i) % 512);
                        let ptr = crate::entry::allocate(size);
                        assert!(!ptr.is_null());
                        ptrs.push((ptr, size));
                    }

                    for (ptr, size) in ptrs.drain(..ptrs.len() / 2) {
                        let grown = crate::entry::resize(ptr, size * 2);
                        assert!(!grown.is_null());
                        crate::entry::free(grown);
                    }

                    for (ptr, _) in ptrs {
                        crate::entry::free(ptr);
                    }
                })
            })
            .collect();

        for t in threads {
            t.join().expect("worker thread should not panic");
        }

        let heap = HEAP.lock().unwrap();
        debug_check::walk_heap(&heap).expect("heap should stay consistent after concurrent use");
    }
}
