//! Process-wide allocator configuration, set once before the heap is first
//! touched.
//!
//! There is no file- or environment-backed configuration: the allocator
//! holds no persisted state (see the crate's design notes). The only knob
//! is how much address space the page source reserves up front, which
//! tests shrink to exercise exhaustion paths without mapping gigabytes.
use std::sync::Mutex;

#[derive(Debug, Clone, Copy)]
pub struct HeapConfig {
    /// Total bytes of address space the default page source reserves on
    /// first use. `None` means "use the built-in default".
    pub reservation_bytes: Option<usize>,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            reservation_bytes: None,
        }
    }
}

lazy_static::lazy_static! {
    static ref CONFIG: Mutex<HeapConfig> = Mutex::new(HeapConfig::default());
}

/// Overrides the default `HeapConfig`. Must be called before the first
/// allocate/free/resize call; the heap singleton reads this exactly once,
/// at first use.
pub fn configure(config: HeapConfig) {
    *CONFIG.lock().unwrap() = config;
}

pub(crate) fn current() -> HeapConfig {
    *CONFIG.lock().unwrap()
}
