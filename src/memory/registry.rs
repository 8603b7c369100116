//! Process-wide pointer classification.
//!
//! Pool blocks carry an in-band header, but reading it first requires
//! knowing the pointer is pool-born — guessing from header bytes would read
//! foreign memory. Two side tables settle provenance:
//!
//! - a set of live pool-page base addresses (pages are page-aligned, so a
//!   candidate pointer classifies by masking to its page base), and
//! - a map from system-fallback pointers to their allocation layouts, so
//!   the facade can release tier-3 allocations with the layout they were
//!   created with.

use std::alloc::Layout;
use std::collections::{HashMap, HashSet};
// Deliberately std primitives, not the loom shim: these are process-lifetime
// leaf locks living in statics, which loom cannot re-create per model run
// (same rationale as the OnceLock shim). They guard plain map lookups with
// no further synchronization underneath.
use std::sync::{Mutex, RwLock};

use crate::memory::pool::PAGE_SIZE;
use crate::sync::OnceLock;

static POOL_PAGES: OnceLock<RwLock<HashSet<usize>>> = OnceLock::new();
static SYSTEM_ALLOCS: OnceLock<Mutex<HashMap<usize, Layout>>> = OnceLock::new();

fn pool_pages() -> &'static RwLock<HashSet<usize>> {
    POOL_PAGES.get_or_init(|| RwLock::new(HashSet::new()))
}

fn system_allocs() -> &'static Mutex<HashMap<usize, Layout>> {
    SYSTEM_ALLOCS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Record a freshly manufactured pool page. `base` must be page-aligned.
pub(crate) fn register_page(base: usize) {
    debug_assert!(base.is_multiple_of(PAGE_SIZE), "page base {base:#x} unaligned");
    pool_pages()
        .write()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .insert(base);
}

/// Forget a pool page that was returned to its backing allocator.
pub(crate) fn unregister_page(base: usize) {
    pool_pages()
        .write()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .remove(&base);
}

/// True when `addr` falls inside a live pool page.
pub(crate) fn is_pool_addr(addr: usize) -> bool {
    pool_pages()
        .read()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .contains(&(addr & !(PAGE_SIZE - 1)))
}

/// Track a tier-3 (system allocator) pointer and its layout.
pub(crate) fn record_system_alloc(addr: usize, layout: Layout) {
    system_allocs()
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .insert(addr, layout);
}

/// Claim a tracked tier-3 pointer, returning its layout.
pub(crate) fn take_system_alloc(addr: usize) -> Option<Layout> {
    system_allocs()
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .remove(&addr)
}
