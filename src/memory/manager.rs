use std::alloc::Layout;
use std::ptr::NonNull;

use super::global::GlobalPool;
use super::pool::{BLOCK_ALIGNMENT, align_up};
use super::registry;
use super::stats::MemoryStats;
use super::thread_local::{try_with_local_pool, with_local_pool};

/// Public allocator surface implementing the three-tier fallback:
/// thread-local pool, then the global pool, then the system allocator.
pub struct MemoryManager;

impl MemoryManager {
    /// Allocate `user_size` bytes.
    ///
    /// Tier order: the caller's thread-local pool (no locking), the global
    /// pool (mutex), and finally the system allocator. System-tier pointers
    /// carry no pool header; they are tracked in a side table so
    /// [`deallocate`](Self::deallocate) can route them back with the right
    /// layout. Returns `None` only when every tier fails.
    pub fn allocate(user_size: usize) -> Option<NonNull<u8>> {
        if let Some(ptr) = with_local_pool(|pool| pool.allocate(user_size)) {
            return Some(ptr);
        }
        if let Some(ptr) = GlobalPool::instance().allocate(user_size) {
            return Some(ptr);
        }

        let size = align_up(user_size.max(1), BLOCK_ALIGNMENT);
        let layout = Layout::from_size_align(size, BLOCK_ALIGNMENT).ok()?;
        // Safety: layout has non-zero size.
        let ptr = NonNull::new(unsafe { std::alloc::alloc(layout) })?;
        registry::record_system_alloc(ptr.as_ptr() as usize, layout);
        Some(ptr)
    }

    /// Release a pointer obtained from [`allocate`](Self::allocate).
    ///
    /// Null is a no-op. Pool blocks go back onto the calling thread's
    /// freelists — including blocks minted by another thread's pool; the
    /// local pool inserts their class on demand. System-tier pointers are
    /// released through the recorded layout. A pointer this process never
    /// produced is logged and dropped rather than freed blind.
    ///
    /// # Safety
    /// - `ptr` must be null or a live pointer returned by `allocate`.
    /// - `ptr` must not be used after this call.
    pub unsafe fn deallocate(ptr: *mut u8) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        let addr = ptr.as_ptr() as usize;

        if registry::is_pool_addr(addr) {
            // Safety: classified pool-born; contract forwarded.
            let routed = try_with_local_pool(|pool| unsafe { pool.deallocate(ptr) });
            if routed.is_none() {
                // TLS already torn down: hand the block to the global tier.
                // Safety: same contract.
                unsafe { GlobalPool::instance().deallocate(ptr) };
            }
            return;
        }

        if let Some(layout) = registry::take_system_alloc(addr) {
            // Safety: allocated by the system tier with exactly this layout.
            unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
            return;
        }

        log::warn!("deallocate: pointer {ptr:p} has unknown provenance; leaking it");
    }

    /// Stats of the process-wide global pool.
    pub fn global_stats() -> MemoryStats {
        GlobalPool::instance().stats()
    }

    /// Stats of the calling thread's local pool.
    pub fn local_stats() -> MemoryStats {
        with_local_pool(|pool| pool.stats())
    }
}
