//! Platform-specific helpers for shared memory

/// Platform capabilities
pub struct PlatformCapabilities {
    /// Default page size
    pub page_size: usize,
}

impl PlatformCapabilities {
    /// Get platform capabilities
    pub fn get() -> Self {
        Self {
            page_size: page_size(),
        }
    }
}

#[cfg(unix)]
fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

#[cfg(not(unix))]
fn page_size() -> usize {
    4096
}

/// Platform-specific utilities
pub struct PlatformUtils;

impl PlatformUtils {
    /// Align size to page boundary
    pub fn align_to_page_size(size: usize) -> usize {
        let page_size = PlatformCapabilities::get().page_size;

        // Round up to nearest page size
        align_up(size, page_size)
    }
}

/// Round `value` up to a multiple of `align` (a power of two)
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Memory barrier utilities for cross-processor synchronization
pub struct MemoryBarriers;

impl MemoryBarriers {
    /// Acquire barrier: slot reads may not move above it
    pub fn acquire_barrier() {
        std::sync::atomic::fence(std::sync::atomic::Ordering::Acquire);
    }

    /// Release barrier: slot writes may not move below it
    pub fn release_barrier() {
        std::sync::atomic::fence(std::sync::atomic::Ordering::Release);
    }
}
