#[cfg(not(target_pointer_width = "64"))]
compile_error!("tierpool supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod memory;

// backing allocators
#[cfg(unix)]
pub use memory::backing::{FileBacking, FileKind};
pub use memory::backing::{BackingAlloc, BackingError, HeapBacking};

// pool tiers
pub use memory::global::GlobalPool;
pub use memory::pool::{
    BLOCK_ALIGNMENT, BasePool, MAX_GLOBAL_FREE_MEMORY, MAX_USER_SIZE, MIN_USER_SIZE, PAGE_SIZE,
    RESERVE_BLOCK_COUNT,
};
pub use memory::thread_local::with_local_pool;

// facade/stats
pub use memory::manager::MemoryManager;
pub use memory::stats::MemoryStats;

// scoped group allocator
pub use memory::scoped::{MemChunk, ScopedAllocator};
