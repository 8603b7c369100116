use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::ptr::{self, NonNull};

#[cfg(debug_assertions)]
use fixedbitset::FixedBitSet;

use super::backing::{BackingAlloc, HeapBacking};
use super::registry;
use super::size_class::{FREE_BLOCK_HEADER_SIZE, FreeBlock, SizeClassTable};
use super::stats::{Counter, MemoryStats};
// Deliberately std Arc, not the loom shim: a refcounted trait-object handle
// with no synchronization loom needs to model (loom's Arc cannot hold
// unsized types).
use std::sync::Arc;

/// Smallest user-visible request; zero-size requests are normalized to this.
pub const MIN_USER_SIZE: usize = 8;
/// Largest request the pool tiers serve; anything bigger escalates.
pub const MAX_USER_SIZE: usize = 2048;
/// Block alignment step. Must be a power of two.
pub const BLOCK_ALIGNMENT: usize = 8;
/// Backing buffer granularity: pages are carved into blocks of one class.
pub const PAGE_SIZE: usize = 4096;
/// High-water mark on the global pool's idle memory.
pub const MAX_GLOBAL_FREE_MEMORY: usize = 10 * 1024 * 1024;
/// Blocks retained per class when reclaiming idle memory.
pub const RESERVE_BLOCK_COUNT: usize = 4;

/// Round `value` up to a multiple of `alignment` (a power of two).
pub(crate) fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(
        alignment.is_power_of_two(),
        "alignment {alignment} must be a power of two"
    );
    (value + alignment - 1) & !(alignment - 1)
}

/// Block total size for a user request: header plus payload, aligned.
pub(crate) fn aligned_total_size(user_size: usize) -> usize {
    let user_size = if user_size == 0 { MIN_USER_SIZE } else { user_size };
    align_up(user_size + FREE_BLOCK_HEADER_SIZE, BLOCK_ALIGNMENT)
}

/// Per-page bookkeeping: how many of the page's blocks sit on *this* pool's
/// freelists, and whether this pool carries the page in its allocated-bytes
/// accounting. A page is releasable only by the pool that both owns it and
/// holds every one of its blocks free — blocks scattered across pools pin
/// the page until a transfer reunites them.
struct PageResidency {
    total_size: usize,
    resident: usize,
    owned: bool,
    /// Free-block occupancy by slot, for double-free detection.
    #[cfg(debug_assertions)]
    free_map: FixedBitSet,
}

impl PageResidency {
    fn new(total_size: usize) -> Self {
        Self {
            total_size,
            resident: 0,
            owned: false,
            #[cfg(debug_assertions)]
            free_map: FixedBitSet::with_capacity(PAGE_SIZE / total_size),
        }
    }

    fn blocks_per_page(&self) -> usize {
        PAGE_SIZE / self.total_size
    }

    fn fully_idle(&self) -> bool {
        self.resident == self.blocks_per_page()
    }
}

/// Core allocation and reclamation logic over a size-class table.
///
/// One instance backs each tier: thread-confined (no locking) for the local
/// tier, mutex-wrapped for the global tier. The pool manufactures blocks a
/// page at a time from its backing allocator, threads them into per-class
/// freelists through their in-band headers, and tracks per-page residency so
/// idle pages can be returned without assuming freelist order.
pub struct BasePool {
    classes: SizeClassTable,
    pages: HashMap<usize, PageResidency>,
    backing: Arc<dyn BackingAlloc + Send + Sync>,
    allocate_count: Counter,
    deallocate_count: Counter,
    total_free_memory: Counter,
    total_allocated_memory: Counter,
}

// Safety: BasePool owns every block on its freelists; raw pointers never
// alias another pool's lists.
unsafe impl Send for BasePool {}

impl Default for BasePool {
    fn default() -> Self {
        Self::new()
    }
}

impl BasePool {
    pub fn new() -> Self {
        Self::with_backing(Arc::new(HeapBacking))
    }

    /// Create a pool over a specific backing allocator. Classes are seeded
    /// for the whole `MIN_USER_SIZE..=MAX_USER_SIZE` ladder up front; unusual
    /// aligned sizes are inserted on demand.
    pub fn with_backing(backing: Arc<dyn BackingAlloc + Send + Sync>) -> Self {
        let mut classes = SizeClassTable::new();
        let mut user_size = MIN_USER_SIZE;
        while user_size <= MAX_USER_SIZE {
            classes.insert_if_absent(aligned_total_size(user_size));
            user_size += BLOCK_ALIGNMENT;
        }
        Self {
            classes,
            pages: HashMap::new(),
            backing,
            allocate_count: Counter::new(),
            deallocate_count: Counter::new(),
            total_free_memory: Counter::new(),
            total_allocated_memory: Counter::new(),
        }
    }

    /// Allocate `user_size` bytes from the pool.
    ///
    /// Returns `None` when the request exceeds [`MAX_USER_SIZE`] or the
    /// backing allocator cannot produce a page — the caller escalates to the
    /// next tier. A `user_size` of 0 is normalized to [`MIN_USER_SIZE`].
    /// The returned pointer is `BLOCK_ALIGNMENT`-aligned and points just past
    /// the block header.
    pub fn allocate(&mut self, user_size: usize) -> Option<NonNull<u8>> {
        if user_size > MAX_USER_SIZE {
            return None;
        }
        let total_size = aligned_total_size(user_size);
        let index = self.classes.insert_if_absent(total_size);
        if self.classes.heads[index].is_null() && !self.batch_allocate(total_size, index) {
            return None;
        }

        let block = self.classes.heads[index];
        // Safety: block heads a freelist we own; its header is intact.
        let user = unsafe {
            debug_assert_eq!((*block).total_size, total_size);
            self.classes.heads[index] = (*block).next;
            block.cast::<u8>().add(FREE_BLOCK_HEADER_SIZE)
        };
        self.classes.counts[index] -= 1;
        self.total_free_memory.sub(total_size);
        self.allocate_count.add(1);
        self.note_block_taken(block as usize, total_size);

        // Safety: user points into a live page, never null.
        Some(unsafe { NonNull::new_unchecked(user) })
    }

    /// Return a block to its freelist, inserting the class if this pool has
    /// never seen the size (blocks may arrive from another pool's pages).
    ///
    /// # Safety
    /// - `user_ptr` must have been returned by `allocate` on some `BasePool`
    ///   over the same page registry (any pool tier in this process).
    /// - The block must be live: not freed since its last allocation.
    pub unsafe fn deallocate(&mut self, user_ptr: NonNull<u8>) {
        // Safety: pool-born pointers sit FREE_BLOCK_HEADER_SIZE past their
        // header, which the user region never overlaps.
        let block = unsafe { user_ptr.as_ptr().sub(FREE_BLOCK_HEADER_SIZE) }.cast::<FreeBlock>();
        // Safety: header is readable per the contract above.
        let total_size = unsafe { (*block).total_size };
        debug_assert!(
            total_size >= aligned_total_size(MIN_USER_SIZE)
                && total_size <= PAGE_SIZE
                && total_size.is_multiple_of(BLOCK_ALIGNMENT),
            "deallocate: corrupt block header (total_size={total_size})"
        );

        let index = self.classes.insert_if_absent(total_size);
        // Safety: we own the block from here on.
        unsafe {
            (*block).next = self.classes.heads[index];
        }
        self.classes.heads[index] = block;
        self.classes.counts[index] += 1;
        self.total_free_memory.add(total_size);
        self.deallocate_count.add(1);
        self.note_block_freed(block as usize, total_size);
    }

    /// Manufacture one page worth of `total_size` blocks onto class `index`.
    fn batch_allocate(&mut self, total_size: usize, index: usize) -> bool {
        if total_size == 0 || total_size > PAGE_SIZE {
            return false;
        }
        let count = PAGE_SIZE / total_size;
        let page = match self.backing.acquire(PAGE_SIZE) {
            Ok(p) => p,
            Err(e) => {
                log::debug!("page acquisition failed for class {total_size}: {e}");
                return false;
            }
        };
        let base = page.as_ptr();
        debug_assert!(
            (base as usize).is_multiple_of(PAGE_SIZE),
            "backing returned an unaligned page {base:p}"
        );

        // Thread the page into forward-linked blocks; the tail picks up the
        // prior list head.
        let prior_head = self.classes.heads[index];
        // Safety: the page spans count * total_size bytes we own exclusively.
        unsafe {
            for i in 0..count {
                let block = base.add(i * total_size).cast::<FreeBlock>();
                (*block).total_size = total_size;
                (*block).next = if i + 1 < count {
                    base.add((i + 1) * total_size).cast::<FreeBlock>()
                } else {
                    prior_head
                };
            }
            self.classes.heads[index] = base.cast::<FreeBlock>();
        }
        self.classes.counts[index] += count;
        self.total_free_memory.add(count * total_size);
        self.total_allocated_memory.add(PAGE_SIZE);

        registry::register_page(base as usize);
        let mut residency = PageResidency::new(total_size);
        residency.owned = true;
        residency.resident = count;
        #[cfg(debug_assertions)]
        for slot in 0..count {
            residency.free_map.insert(slot);
        }
        let prev = self.pages.insert(base as usize, residency);
        debug_assert!(prev.is_none(), "page {base:p} manufactured twice");
        true
    }

    /// Splice every non-empty freelist into `dest`, inserting classes there
    /// as needed, and move page residency and ownership accounting along.
    /// Empties this pool's freelists; conserves the summed free memory.
    pub fn transfer_to(&mut self, dest: &mut BasePool) {
        for i in 0..self.classes.len() {
            let head = self.classes.heads[i];
            if head.is_null() {
                continue;
            }
            let total_size = self.classes.sizes[i];
            let count = self.classes.counts[i];
            let dest_index = dest.classes.insert_if_absent(total_size);

            // Safety: we own every block on the list; the spliced list is
            // terminated by dest's prior head.
            unsafe {
                let mut tail = head;
                while !(*tail).next.is_null() {
                    tail = (*tail).next;
                }
                (*tail).next = dest.classes.heads[dest_index];
            }
            dest.classes.heads[dest_index] = head;
            dest.classes.counts[dest_index] += count;
            dest.total_free_memory.add(total_size * count);

            self.classes.heads[i] = ptr::null_mut();
            self.classes.counts[i] = 0;
            self.total_free_memory.sub(total_size * count);
        }

        let moved: Vec<(usize, PageResidency)> = self.pages.drain().collect();
        for (base, res) in moved {
            if res.owned {
                self.total_allocated_memory.sub(PAGE_SIZE);
                dest.total_allocated_memory.add(PAGE_SIZE);
            }
            match dest.pages.entry(base) {
                Entry::Occupied(mut occupied) => {
                    let entry = occupied.get_mut();
                    debug_assert_eq!(entry.total_size, res.total_size);
                    entry.resident += res.resident;
                    entry.owned |= res.owned;
                    #[cfg(debug_assertions)]
                    entry.free_map.union_with(&res.free_map);
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(res);
                }
            }
        }
    }

    /// Release surplus idle memory, keeping [`RESERVE_BLOCK_COUNT`] blocks
    /// per class. Only whole pages go back to the backing allocator: the
    /// surplus is rounded down to page multiples and capped by the number of
    /// fully idle pages this pool owns. Returns the bytes released.
    pub fn reclaim_idle_memory(&mut self) -> usize {
        self.release_idle_pages(RESERVE_BLOCK_COUNT)
    }

    fn release_idle_pages(&mut self, keep: usize) -> usize {
        let mut reclaimed = 0usize;
        for i in 0..self.classes.len() {
            let total_size = self.classes.sizes[i];
            let blocks_per_page = PAGE_SIZE / total_size;
            if blocks_per_page == 0 {
                continue;
            }
            let count = self.classes.counts[i];
            if count <= keep {
                continue;
            }
            let max_pages = (count - keep) / blocks_per_page;
            if max_pages == 0 {
                continue;
            }

            let victims: Vec<usize> = self
                .pages
                .iter()
                .filter(|(_, r)| r.total_size == total_size && r.owned && r.fully_idle())
                .take(max_pages)
                .map(|(&base, _)| base)
                .collect();
            if victims.is_empty() {
                continue;
            }
            let victim_set: std::collections::HashSet<usize> = victims.iter().copied().collect();

            // Unlink every block living on a victim page. Blocks of one page
            // may be interleaved anywhere in the list, so this is a single
            // filtering walk rather than a tail detach.
            let mut removed = 0usize;
            // Safety: we own the list; victim pages hold only free blocks.
            unsafe {
                let mut prev: *mut FreeBlock = ptr::null_mut();
                let mut cur = self.classes.heads[i];
                while !cur.is_null() {
                    let next = (*cur).next;
                    if victim_set.contains(&((cur as usize) & !(PAGE_SIZE - 1))) {
                        if prev.is_null() {
                            self.classes.heads[i] = next;
                        } else {
                            (*prev).next = next;
                        }
                        removed += 1;
                    } else {
                        prev = cur;
                    }
                    cur = next;
                }
            }
            debug_assert_eq!(removed, victims.len() * blocks_per_page);

            self.classes.counts[i] -= removed;
            self.total_free_memory.sub(removed * total_size);
            reclaimed += removed * total_size;

            for base in victims {
                self.pages.remove(&base);
                registry::unregister_page(base);
                self.total_allocated_memory.sub(PAGE_SIZE);
                // Safety: the page came from this pool's backing and no free
                // or live block references it anymore.
                unsafe {
                    self.backing
                        .release(NonNull::new_unchecked(base as *mut u8), PAGE_SIZE);
                }
            }
        }
        reclaimed
    }

    pub fn stats(&self) -> MemoryStats {
        let total_free_memory = self.total_free_memory.get();
        let total_allocated_memory = self.total_allocated_memory.get();
        MemoryStats {
            allocate_count: self.allocate_count.get(),
            deallocate_count: self.deallocate_count.get(),
            total_free_memory,
            total_used_memory: total_allocated_memory.saturating_sub(total_free_memory),
            total_allocated_memory,
        }
    }

    fn note_block_freed(&mut self, addr: usize, total_size: usize) {
        let base = addr & !(PAGE_SIZE - 1);
        let entry = self
            .pages
            .entry(base)
            .or_insert_with(|| PageResidency::new(total_size));
        debug_assert_eq!(entry.total_size, total_size);
        entry.resident += 1;
        #[cfg(debug_assertions)]
        {
            let slot = (addr - base) / total_size;
            debug_assert_eq!(addr - base, slot * total_size, "block {addr:#x} off-grid");
            assert!(
                !entry.free_map.contains(slot),
                "double free of block {addr:#x}"
            );
            entry.free_map.insert(slot);
        }
    }

    fn note_block_taken(&mut self, addr: usize, #[allow(unused)] total_size: usize) {
        let base = addr & !(PAGE_SIZE - 1);
        let Some(entry) = self.pages.get_mut(&base) else {
            debug_assert!(false, "block {addr:#x} taken from an untracked page");
            return;
        };
        entry.resident -= 1;
        #[cfg(debug_assertions)]
        entry.free_map.set((addr - base) / total_size, false);
        if entry.resident == 0 && !entry.owned {
            self.pages.remove(&base);
        }
    }

    /// Walk every freelist and cross-check lengths, headers and counters.
    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        let mut free_sum = 0usize;
        for i in 0..self.classes.len() {
            let total_size = self.classes.sizes[i];
            let mut len = 0usize;
            let mut cur = self.classes.heads[i];
            // Safety: walking our own freelist.
            unsafe {
                while !cur.is_null() {
                    assert_eq!((*cur).total_size, total_size);
                    len += 1;
                    cur = (*cur).next;
                }
            }
            assert_eq!(len, self.classes.counts[i], "class {total_size} count skew");
            free_sum += len * total_size;
        }
        assert_eq!(free_sum, self.total_free_memory.get());
        assert!(self.total_allocated_memory.get() >= self.total_free_memory.get());
    }

    #[cfg(test)]
    pub(crate) fn non_empty_classes(&self) -> Vec<(usize, usize)> {
        (0..self.classes.len())
            .filter(|&i| self.classes.counts[i] > 0)
            .map(|i| (self.classes.sizes[i], self.classes.counts[i]))
            .collect()
    }
}

impl Drop for BasePool {
    fn drop(&mut self) {
        // Give every fully idle page back. Pages with outstanding user
        // blocks cannot be released safely and stay with the process.
        let released = self.release_idle_pages(0);
        if released > 0 {
            log::trace!("pool drop released {released} bytes");
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_small_block() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = BasePool::new();

        let ptr = pool.allocate(64).expect("allocation failed");
        assert_eq!(
            (ptr.as_ptr() as usize - FREE_BLOCK_HEADER_SIZE) % BLOCK_ALIGNMENT,
            0
        );
        let stats = pool.stats();
        assert_eq!(stats.allocate_count, 1);
        assert!(stats.total_used_memory > 0);

        // Safety: Test code.
        unsafe { pool.deallocate(ptr) };
        let stats = pool.stats();
        assert_eq!(stats.deallocate_count, 1);
        // The whole page sits free again, modulo the page's carve slack.
        assert_eq!(
            stats.total_used_memory,
            PAGE_SIZE - (PAGE_SIZE / aligned_total_size(64)) * aligned_total_size(64)
        );
        pool.assert_invariants();
    }

    #[test]
    fn test_user_region_does_not_clobber_header() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = BasePool::new();
        let ptr = pool.allocate(48).unwrap();
        // Safety: Test code — fill the entire user capacity.
        unsafe {
            ptr.as_ptr().write_bytes(0xFF, 48);
            pool.deallocate(ptr);
        }
        pool.assert_invariants();
    }

    #[test]
    fn test_zero_size_normalizes_to_min() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = BasePool::new();
        let ptr = pool.allocate(0).expect("zero-size allocation failed");
        // Safety: Test code — the backing block is the smallest class.
        unsafe {
            let block = ptr.as_ptr().sub(FREE_BLOCK_HEADER_SIZE).cast::<FreeBlock>();
            assert_eq!((*block).total_size, aligned_total_size(MIN_USER_SIZE));
            pool.deallocate(ptr);
        }
    }

    #[test]
    fn test_oversize_returns_none() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = BasePool::new();
        assert!(pool.allocate(MAX_USER_SIZE + 1).is_none());
        assert_eq!(pool.stats().allocate_count, 0);
    }

    #[test]
    fn test_odd_size_shares_aligned_class() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = BasePool::new();
        // 15 and 16 land in the same aligned class.
        let a = pool.allocate(15).unwrap();
        let b = pool.allocate(16).unwrap();
        // Safety: Test code.
        unsafe {
            let block_a = a.as_ptr().sub(FREE_BLOCK_HEADER_SIZE).cast::<FreeBlock>();
            let block_b = b.as_ptr().sub(FREE_BLOCK_HEADER_SIZE).cast::<FreeBlock>();
            assert_eq!((*block_a).total_size, aligned_total_size(15));
            assert_eq!((*block_a).total_size, (*block_b).total_size);
            pool.deallocate(a);
            pool.deallocate(b);
        }
        // Exactly one class is populated, by exactly one page of blocks.
        let classes = pool.non_empty_classes();
        assert_eq!(classes.len(), 1);
        let (total_size, count) = classes[0];
        assert_eq!(total_size, aligned_total_size(15));
        assert_eq!(count, PAGE_SIZE / total_size);
        pool.assert_invariants();
    }

    #[test]
    fn test_batch_populates_whole_page() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = BasePool::new();
        let ptr = pool.allocate(8).unwrap();
        let total_size = aligned_total_size(8);
        let stats = pool.stats();
        assert_eq!(stats.total_allocated_memory, PAGE_SIZE);
        assert_eq!(
            stats.total_free_memory,
            (PAGE_SIZE / total_size - 1) * total_size
        );
        // Safety: Test code.
        unsafe { pool.deallocate(ptr) };
        pool.assert_invariants();
    }

    #[test]
    fn test_freelist_is_lifo_on_free() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = BasePool::new();
        let a = pool.allocate(32).unwrap();
        let b = pool.allocate(32).unwrap();
        assert_ne!(a, b);
        // Safety: Test code.
        unsafe { pool.deallocate(a) };
        let c = pool.allocate(32).unwrap();
        assert_eq!(a, c, "freed block should be handed out first");
        // Safety: Test code.
        unsafe {
            pool.deallocate(b);
            pool.deallocate(c);
        }
        pool.assert_invariants();
    }

    #[test]
    fn test_reclaim_keeps_reserve_and_is_idempotent() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = BasePool::new();
        let total_size = aligned_total_size(64);
        let blocks_per_page = PAGE_SIZE / total_size;

        // Fill three pages worth, then free everything.
        let mut ptrs = Vec::new();
        for _ in 0..blocks_per_page * 3 {
            ptrs.push(pool.allocate(64).unwrap());
        }
        for ptr in ptrs.drain(..) {
            // Safety: Test code.
            unsafe { pool.deallocate(ptr) };
        }
        assert_eq!(pool.stats().total_allocated_memory, 3 * PAGE_SIZE);

        let reclaimed = pool.reclaim_idle_memory();
        assert!(reclaimed > 0);
        // At least the reserve survives.
        let remaining = pool.stats().total_free_memory / total_size;
        assert!(remaining >= RESERVE_BLOCK_COUNT);
        pool.assert_invariants();

        assert_eq!(pool.reclaim_idle_memory(), 0, "second reclaim must be a no-op");
    }

    #[test]
    fn test_reclaim_skips_partially_used_pages() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = BasePool::new();
        let total_size = aligned_total_size(64);
        let blocks_per_page = PAGE_SIZE / total_size;

        let mut ptrs = Vec::new();
        for _ in 0..blocks_per_page {
            ptrs.push(pool.allocate(64).unwrap());
        }
        // Keep one block live; the page must survive reclamation.
        let live = ptrs.pop().unwrap();
        for ptr in ptrs.drain(..) {
            // Safety: Test code.
            unsafe { pool.deallocate(ptr) };
        }
        assert_eq!(pool.reclaim_idle_memory(), 0);
        assert_eq!(pool.stats().total_allocated_memory, PAGE_SIZE);

        // Safety: Test code.
        unsafe { pool.deallocate(live) };
        pool.assert_invariants();
    }

    #[test]
    fn test_transfer_conserves_free_memory() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut src = BasePool::new();
        let mut dest = BasePool::new();

        let mut ptrs = Vec::new();
        for size in [8usize, 64, 256, 1024] {
            for _ in 0..4 {
                ptrs.push(src.allocate(size).unwrap());
            }
        }
        for ptr in ptrs.drain(..) {
            // Safety: Test code.
            unsafe { src.deallocate(ptr) };
        }

        let before = src.stats().total_free_memory + dest.stats().total_free_memory;
        src.transfer_to(&mut dest);
        let after = src.stats().total_free_memory + dest.stats().total_free_memory;
        assert_eq!(before, after);
        assert_eq!(src.stats().total_free_memory, 0);
        assert_eq!(src.stats().total_allocated_memory, 0);
        src.assert_invariants();
        dest.assert_invariants();
    }

    #[test]
    fn test_transferred_blocks_allocate_from_dest() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut src = BasePool::new();
        let mut dest = BasePool::new();

        let ptr = src.allocate(128).unwrap();
        // Safety: Test code.
        unsafe { src.deallocate(ptr) };
        src.transfer_to(&mut dest);

        let allocated_before = dest.stats().total_allocated_memory;
        let again = dest.allocate(128).unwrap();
        assert_eq!(
            dest.stats().total_allocated_memory,
            allocated_before,
            "transfer should satisfy the allocation without a new page"
        );
        // Safety: Test code.
        unsafe { dest.deallocate(again) };
    }

    #[test]
    fn test_transfer_reunites_split_pages_for_reclaim() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut src = BasePool::new();
        let mut other = BasePool::new();
        let total_size = aligned_total_size(64);
        let blocks_per_page = PAGE_SIZE / total_size;

        let ptrs: Vec<_> = (0..blocks_per_page)
            .map(|_| src.allocate(64).unwrap())
            .collect();
        // Half the blocks are freed into a different pool.
        for (i, ptr) in ptrs.into_iter().enumerate() {
            // Safety: Test code.
            unsafe {
                if i % 2 == 0 {
                    src.deallocate(ptr);
                } else {
                    other.deallocate(ptr);
                }
            }
        }
        // Neither pool can release the page on its own.
        assert_eq!(src.release_idle_pages(0), 0);
        assert_eq!(other.release_idle_pages(0), 0);

        other.transfer_to(&mut src);
        assert_eq!(src.release_idle_pages(0), blocks_per_page * total_size);
        src.assert_invariants();
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_panics_in_debug() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = BasePool::new();
        let ptr = pool.allocate(64).unwrap();
        // Safety: Test code deliberately violating the contract.
        unsafe {
            pool.deallocate(ptr);
            pool.deallocate(ptr);
        }
    }

    #[test]
    fn test_file_backed_pool_round_trip() {
        #[cfg(unix)]
        {
            let _guard = crate::memory::TEST_MUTEX.read().unwrap();
            let dir = std::env::temp_dir().join(format!("tierpool-pool-{}", std::process::id()));
            std::fs::create_dir_all(&dir).unwrap();

            let backing = Arc::new(crate::memory::backing::FileBacking::new(
                &dir,
                "pool",
                crate::memory::backing::FileKind::Static,
                true,
                0,
            ));
            let mut pool = BasePool::with_backing(backing);
            let ptr = pool.allocate(64).unwrap();
            // Safety: Test code.
            unsafe {
                ptr.as_ptr().write_bytes(0x5A, 64);
                pool.deallocate(ptr);
            }
            pool.assert_invariants();
            drop(pool);
            drop(std::fs::remove_dir_all(&dir));
        }
    }
}
