use std::ptr::NonNull;

use super::pool::{BasePool, MAX_GLOBAL_FREE_MEMORY};
use super::stats::MemoryStats;
use crate::sync::{Mutex, OnceLock};

static GLOBAL_POOL: OnceLock<GlobalPool> = OnceLock::new();

/// Process-wide middle tier: one [`BasePool`] behind a mutex.
///
/// Thread-local pools donate their freelists here on thread exit; the pool
/// enforces the [`MAX_GLOBAL_FREE_MEMORY`] high-water mark after every
/// deallocate and transfer, while still holding the mutex, so observers
/// never see the cap exceeded across a returned call.
pub struct GlobalPool {
    inner: Mutex<BasePool>,
}

impl GlobalPool {
    /// The process-wide instance, constructed on first use.
    pub fn instance() -> &'static GlobalPool {
        GLOBAL_POOL.get_or_init(|| GlobalPool {
            inner: Mutex::new(BasePool::new()),
        })
    }

    pub fn allocate(&self, user_size: usize) -> Option<NonNull<u8>> {
        // Recover from poisoned mutexes throughout: a panicking allocator
        // user must not permanently wedge the tier.
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .allocate(user_size)
    }

    /// Return a pool block to the global tier.
    ///
    /// # Safety
    /// Same contract as [`BasePool::deallocate`].
    pub unsafe fn deallocate(&self, user_ptr: NonNull<u8>) {
        let mut pool = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        // Safety: forwarded contract.
        unsafe { pool.deallocate(user_ptr) };
        Self::reclaim_if_over(&mut pool);
    }

    /// Splice a donor pool's freelists into the global tier.
    pub fn transfer_from(&self, src: &mut BasePool) {
        let mut pool = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        src.transfer_to(&mut pool);
        Self::reclaim_if_over(&mut pool);
    }

    pub fn stats(&self) -> MemoryStats {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .stats()
    }

    fn reclaim_if_over(pool: &mut BasePool) {
        if pool.stats().total_free_memory > MAX_GLOBAL_FREE_MEMORY {
            let reclaimed = pool.reclaim_idle_memory();
            if reclaimed > 0 {
                log::debug!("global pool reclaimed {reclaimed} bytes of idle memory");
            }
        }
    }
}
