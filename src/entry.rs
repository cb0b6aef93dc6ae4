//! The public entry points: size validation, overflow checks, zero-fill and
//! copy-on-grow sit here; every actual chunk mutation happens in
//! [`crate::state`] with the global heap mutex held.
use std::cell::Cell;
use std::ptr::NonNull;

use crate::chunk::{self, ChunkRef};
use crate::error::HeapError;
use crate::state::HEAP;

thread_local! {
    static LAST_ERROR: Cell<Option<HeapError>> = Cell::new(None);
}

fn set_error(err: HeapError) {
    tracing::warn!(error = %err, "allocator call failed");
    LAST_ERROR.with(|cell| cell.set(Some(err)));
}

/// Returns the error recorded by the most recent failing call on this
/// thread, or `None` if the last call (if any) succeeded.
pub fn last_error() -> Option<HeapError> {
    LAST_ERROR.with(|cell| cell.get())
}

#[cfg(any(test, feature = "check_contracts"))]
fn assert_consistent(heap: &crate::state::HeapState) {
    if let Err(msg) = crate::debug_check::walk_heap(heap) {
        panic!("heap invariant violated: {msg}");
    }
}

/// Allocates at least `size` bytes, 16-byte aligned. Returns null and sets
/// the thread-local error on failure.
pub fn allocate(size: usize) -> *mut u8 {
    let chunk_size = chunk::round_up_chunk_size(size);

    let mut heap = HEAP.lock().unwrap();
    let result = heap.allocate(chunk_size);
    #[cfg(any(test, feature = "check_contracts"))]
    assert_consistent(&heap);
    drop(heap);

    match result {
        Ok(ptr) => {
            #[cfg(any(test, feature = "check_contracts"))]
            crate::debug_check::mark_allocated(ptr.as_ptr() as usize);
            ptr.as_ptr()
        }
        Err(err) => {
            set_error(err);
            std::ptr::null_mut()
        }
    }
}

/// Allocates a zero-filled region of at least `count * elem_size` bytes.
/// Rejects the request (null + `SizeOverflow`) if that product would
/// overflow `usize`.
pub fn zeroed_allocate(count: usize, elem_size: usize) -> *mut u8 {
    let total = match checked_product(count, elem_size) {
        Some(total) => total,
        None => {
            set_error(HeapError::SizeOverflow);
            return std::ptr::null_mut();
        }
    };

    let ptr = allocate(total);
    if !ptr.is_null() {
        unsafe { std::ptr::write_bytes(ptr, 0, total) };
    }
    ptr
}

/// Resizes the block at `ptr` to `new_size` bytes, preserving
/// `min(old_size, new_size)` bytes of content. `ptr = null` behaves like
/// `allocate`; `new_size == 0` behaves like `free` and returns null. On
/// allocation failure the original block is left untouched and still
/// owned by the caller.
pub fn resize(ptr: *mut u8, new_size: usize) -> *mut u8 {
    let ptr = match NonNull::new(ptr) {
        Some(ptr) => ptr,
        None => return allocate(new_size),
    };

    if new_size == 0 {
        free(ptr.as_ptr());
        return std::ptr::null_mut();
    }

    let current_payload = unsafe { ChunkRef::from_payload(ptr).payload_capacity() };
    if current_payload >= new_size {
        return ptr.as_ptr();
    }

    let new_ptr = allocate(new_size);
    if new_ptr.is_null() {
        return std::ptr::null_mut();
    }

    let copy_len = current_payload.min(new_size);
    unsafe { std::ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr, copy_len) };
    free(ptr.as_ptr());

    new_ptr
}

/// Releases a block returned by an allocate-family call. A no-op on null.
pub fn free(ptr: *mut u8) {
    let ptr = match NonNull::new(ptr) {
        Some(ptr) => ptr,
        None => return,
    };

    #[cfg(any(test, feature = "check_contracts"))]
    crate::debug_check::mark_released(ptr.as_ptr() as usize);

    let mut heap = HEAP.lock().unwrap();
    heap.free(ptr);
    #[cfg(any(test, feature = "check_contracts"))]
    assert_consistent(&heap);
}

/// `count * elem_size` with the overflow check from the original malloc:
/// reject whenever the sum of the two operands' bit widths would exceed
/// the width of `usize`.
fn checked_product(count: usize, elem_size: usize) -> Option<usize> {
    let bits = usize::BITS as usize;
    if highest_bit(count) + highest_bit(elem_size) > bits {
        return None;
    }
    count.checked_mul(elem_size)
}

fn highest_bit(x: usize) -> usize {
    usize::BITS as usize - x.leading_zeros() as usize
}

/// Allocates `size` bytes via the ABI-compatible entry point.
///
/// # Safety
///
/// Purely a thin wrapper; safe to call from C as long as the process is
/// not currently inside a signal handler (the allocator is not
/// signal-safe).
#[no_mangle]
pub unsafe extern "C" fn tagheap_allocate(size: usize) -> *mut u8 {
    allocate(size)
}

/// # Safety
///
/// See [`tagheap_allocate`].
#[no_mangle]
pub unsafe extern "C" fn tagheap_zeroed_allocate(count: usize, elem_size: usize) -> *mut u8 {
    zeroed_allocate(count, elem_size)
}

/// # Safety
///
/// `ptr` must be null or a pointer returned by one of this crate's
/// allocate-family calls, not already freed.
#[no_mangle]
pub unsafe extern "C" fn tagheap_resize(ptr: *mut u8, new_size: usize) -> *mut u8 {
    resize(ptr, new_size)
}

/// # Safety
///
/// See [`tagheap_resize`].
#[no_mangle]
pub unsafe extern "C" fn tagheap_free(ptr: *mut u8) {
    free(ptr)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tiny_alloc_then_free_leaves_single_free_chunk() {
        let ptr = allocate(4);
        assert!(!ptr.is_null());
        free(ptr);
    }

    #[test]
    fn free_null_is_a_no_op() {
        free(std::ptr::null_mut());
    }

    #[test]
    fn resize_null_is_allocate() {
        let ptr = resize(std::ptr::null_mut(), 64);
        assert!(!ptr.is_null());
        free(ptr);
    }

    #[test]
    fn resize_to_zero_frees_and_returns_null() {
        let ptr = allocate(64);
        assert!(resize(ptr, 0).is_null());
    }

    #[test]
    fn resize_preserves_contents_on_grow() {
        let ptr = allocate(16);
        assert!(!ptr.is_null());
        unsafe {
            for i in 0..16u8 {
                *ptr.add(i as usize) = i;
            }
        }

        let grown = resize(ptr, 1024);
        assert!(!grown.is_null());
        unsafe {
            for i in 0..16u8 {
                assert_eq!(*grown.add(i as usize), i);
            }
        }
        free(grown);
    }

    #[test]
    fn resize_shrink_keeps_same_pointer() {
        let ptr = allocate(256);
        let same = resize(ptr, 8);
        assert_eq!(ptr, same);
        free(same);
    }

    #[test]
    fn zeroed_allocate_is_actually_zero() {
        let ptr = zeroed_allocate(32, 8);
        assert!(!ptr.is_null());
        unsafe {
            for i in 0..256 {
                assert_eq!(*ptr.add(i), 0);
            }
        }
        free(ptr);
    }

    #[test]
    fn zeroed_allocate_overflow_is_rejected() {
        let ptr = zeroed_allocate(usize::MAX, 2);
        assert!(ptr.is_null());
        assert_eq!(last_error(), Some(HeapError::SizeOverflow));
    }

    #[test]
    fn allocate_zero_returns_minimum_block() {
        let ptr = allocate(0);
        assert!(!ptr.is_null());
        free(ptr);
    }

    #[test]
    fn coalescing_after_three_frees_in_the_middle() {
        let a = allocate(64);
        let b = allocate(64);
        let c = allocate(64);

        free(a);
        free(c);
        free(b);
    }

    #[test]
    fn churn_preserves_values_across_resize() {
        const COUNT: usize = 500;
        let mut ptrs = Vec::with_capacity(COUNT);

        for i in 0..COUNT {
            let p = zeroed_allocate(i + 1, 8) as *mut usize;
            assert!(!p.is_null());
            unsafe { *p.add(i) = i };
            ptrs.push(p);
        }

        for i in 0..COUNT {
            let p = ptrs[i];
            assert_eq!(unsafe { *p.add(i) }, i);

            let grown = resize(p as *mut u8, 8 * (i + 5)) as *mut usize;
            assert!(!grown.is_null());
            assert_eq!(unsafe { *grown.add(i) }, i);
            ptrs[i] = grown;
        }

        for p in ptrs {
            free(p as *mut u8);
        }
    }
}
