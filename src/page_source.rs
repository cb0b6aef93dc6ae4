//! The page source is the allocator's one external collaborator: it hands
//! out contiguous, page-aligned address space that only ever grows, just
//! like the classic `brk`-style break. Modeled as a trait, the way
//! `slitter`'s `Mapper` trait lets its `Mill` stay agnostic of how address
//! space is actually reserved.
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::Mutex;

use crate::error::HeapError;

/// External collaborator that supplies fresh heap memory.
///
/// `obtain` must behave like a `brk`: each call's returned region is
/// immediately contiguous with the end of the previous call's region, and
/// `byte_count` is always a multiple of `page_size()`.
pub trait PageSource: std::fmt::Debug + Send + Sync {
    /// The mapping granularity. Constant for the process's lifetime.
    fn page_size(&self) -> usize;

    /// Requests `byte_count` contiguous, zero-filled, writable bytes.
    fn obtain(&self, byte_count: usize) -> Result<NonNull<u8>, HeapError>;
}

/// Default reservation: 64 GiB of address space, almost none of which is
/// ever committed to physical pages. `mmap` with `PROT_NONE` makes this
/// essentially free.
#[cfg(not(feature = "test_only_small_constants"))]
const DEFAULT_RESERVATION_BYTES: usize = 1 << 36;

/// Shrunk reservation so exhaustion-path tests don't need to commit
/// gigabytes of pages to hit the limit.
#[cfg(feature = "test_only_small_constants")]
const DEFAULT_RESERVATION_BYTES: usize = 1 << 20;

/// `mmap`/`mprotect`-backed `PageSource`. Reserves a large address-space
/// range lazily on first use, then commits pages from the low end of that
/// range on every `obtain` call, which is what gives callers the
/// `brk`-style contiguity guarantee.
pub struct SystemPageSource {
    reservation_bytes: usize,
    reservation: Mutex<Reservation>,
}

#[derive(Default)]
struct Reservation {
    base: Option<NonNull<u8>>,
    committed: usize,
}

// `Reservation` only ever holds a raw pointer into memory this process
// owns exclusively; access is already serialized by the outer `Mutex`.
unsafe impl Send for Reservation {}

impl std::fmt::Debug for SystemPageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemPageSource")
            .field("reservation_bytes", &self.reservation_bytes)
            .finish()
    }
}

impl SystemPageSource {
    pub fn new() -> Self {
        Self::with_reservation(DEFAULT_RESERVATION_BYTES)
    }

    pub fn with_reservation(reservation_bytes: usize) -> Self {
        Self {
            reservation_bytes,
            reservation: Mutex::new(Reservation::default()),
        }
    }

    fn reserve_address_space(&self) -> Result<NonNull<u8>, HeapError> {
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                self.reservation_bytes,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };

        if addr == libc::MAP_FAILED {
            tracing::warn!(
                reservation_bytes = self.reservation_bytes,
                "failed to reserve heap address space"
            );
            return Err(HeapError::PageExhausted);
        }

        NonNull::new(addr as *mut u8).ok_or(HeapError::PageExhausted)
    }
}

impl Default for SystemPageSource {
    fn default() -> Self {
        Self::new()
    }
}

impl PageSource for SystemPageSource {
    fn page_size(&self) -> usize {
        page_size()
    }

    fn obtain(&self, byte_count: usize) -> Result<NonNull<u8>, HeapError> {
        debug_assert_eq!(byte_count % self.page_size(), 0);
        debug_assert!(byte_count > 0);

        let mut reservation = self.reservation.lock().unwrap();

        let base = match reservation.base {
            Some(base) => base,
            None => {
                let base = self.reserve_address_space()?;
                reservation.base = Some(base);
                base
            }
        };

        if reservation.committed + byte_count > self.reservation_bytes {
            tracing::warn!(
                requested = byte_count,
                committed = reservation.committed,
                reservation_bytes = self.reservation_bytes,
                "page source exhausted its address-space reservation"
            );
            return Err(HeapError::PageExhausted);
        }

        let start = unsafe { base.as_ptr().add(reservation.committed) };
        let rc =
            unsafe { libc::mprotect(start as *mut c_void, byte_count, libc::PROT_READ | libc::PROT_WRITE) };
        if rc != 0 {
            tracing::warn!(bytes = byte_count, "mprotect failed while committing heap pages");
            return Err(HeapError::PageExhausted);
        }

        reservation.committed += byte_count;
        tracing::trace!(
            bytes = byte_count,
            total_committed = reservation.committed,
            "committed heap pages"
        );

        Ok(unsafe { NonNull::new_unchecked(start) })
    }
}

lazy_static::lazy_static! {
    static ref PAGE_SIZE: usize = {
        let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        assert!(raw > 0, "unable to determine system page size");
        raw as usize
    };
}

/// The system page size, queried once and cached for the process's
/// lifetime.
pub fn page_size() -> usize {
    *PAGE_SIZE
}
