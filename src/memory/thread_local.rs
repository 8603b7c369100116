use super::global::GlobalPool;
use super::pool::BasePool;
use crate::sync::cell::UnsafeCell;

/// Per-thread handle owning the thread's pool.
///
/// # Safety
///
/// `pool` is wrapped in `UnsafeCell` because it is only ever accessed by the
/// owning thread (via TLS). `with_local_pool` does not re-enter the TLS
/// access point — pool operations touch the backing allocator and the page
/// registry, never TLS. On thread exit the handle drains its freelists into
/// the global tier.
struct LocalPoolHandle {
    pool: UnsafeCell<BasePool>,
}

// Safety: LocalPoolHandle is confined to a single thread via thread_local!.
unsafe impl Sync for LocalPoolHandle {}

impl LocalPoolHandle {
    fn new() -> Self {
        Self {
            pool: UnsafeCell::new(BasePool::new()),
        }
    }
}

impl Drop for LocalPoolHandle {
    fn drop(&mut self) {
        // Donate remaining freelists to the global pool so blocks survive
        // the thread. Drop provides &mut self, guaranteeing exclusive access.
        let pool = crate::sync::unsafe_cell_get_mut!(self.pool);
        GlobalPool::instance().transfer_from(pool);
    }
}

thread_local! {
    static LOCAL_POOL: LocalPoolHandle = LocalPoolHandle::new();
}

/// Run `f` against the calling thread's pool. No locking: the pool is never
/// observed from another thread while live.
///
/// # Panics
///
/// Panics when called while the thread's TLS is being torn down; use
/// [`try_with_local_pool`] from destructors.
pub fn with_local_pool<F, R>(f: F) -> R
where
    F: FnOnce(&mut BasePool) -> R,
{
    LOCAL_POOL.with(|handle| {
        // Safety: single-threaded TLS access (see struct-level safety note).
        f(crate::sync::unsafe_cell_get_mut!(handle.pool))
    })
}

/// Like [`with_local_pool`], but returns `None` once the thread's TLS has
/// been destroyed (e.g. frees issued from another TLS destructor).
pub(crate) fn try_with_local_pool<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&mut BasePool) -> R,
{
    LOCAL_POOL
        .try_with(|handle| {
            // Safety: single-threaded TLS access (see struct-level safety note).
            f(crate::sync::unsafe_cell_get_mut!(handle.pool))
        })
        .ok()
}
