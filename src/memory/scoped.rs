use std::collections::{BTreeMap, HashMap};
use std::ptr::{self, NonNull};
use std::thread::ThreadId;

use super::backing::BackingAlloc;
use super::pool::align_up;
// Backing handles are std Arc (loom's Arc cannot hold unsized types); the
// synchronization that matters goes through the shim below.
use std::sync::Arc;

use crate::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use crate::sync::cell::UnsafeCell;
use crate::sync::{Mutex, RwLock};

/// Default chunk alignment when none is requested.
const DEFAULT_ALIGNMENT: usize = 16;

/// One managed buffer. `base` stays null for a deferred node until
/// [`ScopedAllocator::sync`] realizes it; `offset` adjusts `base` up to the
/// allocator alignment.
struct ChunkNode {
    base: *mut u8,
    offset: usize,
    /// Usable bytes, a multiple of the allocator alignment.
    size: usize,
    /// Bytes acquired from the backing (usable size plus alignment headroom).
    raw_size: usize,
}

/// Opaque chunk handle: a node reference plus a caller-visible offset.
///
/// The default value is the invalid sentinel; allocation failure is reported
/// by returning it, never by panicking.
#[derive(Clone, Copy, Debug)]
pub struct MemChunk {
    node: *mut ChunkNode,
    pub offset: usize,
}

impl Default for MemChunk {
    fn default() -> Self {
        Self {
            node: ptr::null_mut(),
            offset: 0,
        }
    }
}

impl MemChunk {
    fn from_node(node: NonNull<ChunkNode>) -> Self {
        Self {
            node: node.as_ptr(),
            offset: 0,
        }
    }

    /// True for the failure sentinel.
    pub fn invalid(&self) -> bool {
        self.node.is_null()
    }

    /// Resolve the chunk to a raw pointer. Null for the invalid sentinel and
    /// for deferred chunks that have not been realized yet.
    ///
    /// # Safety
    /// The allocator that produced this chunk must still be alive and the
    /// chunk must not have been freed.
    pub unsafe fn ptr(&self) -> *mut u8 {
        if self.node.is_null() {
            return ptr::null_mut();
        }
        // Safety: node is live per the contract above.
        let node = unsafe { &*self.node };
        if node.base.is_null() {
            return ptr::null_mut();
        }
        // Safety: offset stays within the acquired buffer.
        unsafe { node.base.add(node.offset + self.offset) }
    }

    /// Usable bytes behind the chunk.
    ///
    /// # Safety
    /// Same contract as [`ptr`](Self::ptr).
    pub unsafe fn capacity(&self) -> usize {
        if self.node.is_null() {
            return 0;
        }
        // Safety: node is live per the contract above.
        unsafe { (*self.node).size }
    }
}

type FreeMap = BTreeMap<usize, Vec<NonNull<ChunkNode>>>;

/// Freelist and outstanding set private to one open group.
#[derive(Default)]
struct GroupFrame {
    free: FreeMap,
    used: HashMap<usize, NonNull<ChunkNode>>,
}

/// Stack of open frames for one thread. Entries live in the frame registry;
/// only the owning thread pushes, pops or reads its stack outside the
/// registry's write lock.
struct ThreadFrames {
    stack: UnsafeCell<Vec<GroupFrame>>,
}

impl ThreadFrames {
    fn new() -> Self {
        Self {
            stack: UnsafeCell::new(Vec::new()),
        }
    }
}

// Safety: a stack is mutated either by its owning thread (under the
// registry read lock) or with the registry write lock held; the two never
// overlap for one entry.
unsafe impl Send for ThreadFrames {}
unsafe impl Sync for ThreadFrames {}

/// Shared allocator state: the common freelist, outstanding chunks, group
/// freelists parked until the barrier closes, and unrealized nodes.
#[derive(Default)]
struct CommonState {
    free: FreeMap,
    used: HashMap<usize, NonNull<ChunkNode>>,
    pending: Vec<FreeMap>,
    deferred: Vec<NonNull<ChunkNode>>,
}

/// Scoped allocator for worker-pool execution.
///
/// Chunks draw from a best-fit freelist of whole buffers. Between
/// [`begin_group`](Self::begin_group) and [`end_group`](Self::end_group) a
/// thread allocates from a frame-private freelist; inside a
/// [`barrier_begin`](Self::barrier_begin)/[`barrier_end`](Self::barrier_end)
/// window any number of workers may run their own groups concurrently
/// without contending on the common freelist. Closing the barrier merges
/// every parked group freelist back into the common one.
pub struct ScopedAllocator {
    backing: Arc<dyn BackingAlloc + Send + Sync>,
    align: usize,
    /// Soft bound on total managed bytes; 0 means unbounded. Exceeding it
    /// evicts idle buffers before acquiring more.
    cap: usize,
    managed: AtomicUsize,
    in_barrier: AtomicBool,
    state: Mutex<CommonState>,
    frames: RwLock<HashMap<ThreadId, ThreadFrames>>,
}

// Safety: node pointers are owned by the allocator; every list holding them
// is reached through the state mutex or the frame registry discipline.
unsafe impl Send for ScopedAllocator {}
unsafe impl Sync for ScopedAllocator {}

impl ScopedAllocator {
    pub fn new(backing: Arc<dyn BackingAlloc + Send + Sync>) -> Self {
        Self::with_limits(backing, DEFAULT_ALIGNMENT, 0)
    }

    /// `alignment` must be a non-zero power of two; `cap` soft-limits total
    /// managed bytes (0 = unbounded).
    pub fn with_limits(
        backing: Arc<dyn BackingAlloc + Send + Sync>,
        alignment: usize,
        cap: usize,
    ) -> Self {
        debug_assert!(
            alignment.is_power_of_two(),
            "alignment {alignment} must be a power of two"
        );
        Self {
            backing,
            align: alignment,
            cap,
            managed: AtomicUsize::new(0),
            in_barrier: AtomicBool::new(false),
            state: Mutex::new(CommonState::default()),
            frames: RwLock::new(HashMap::new()),
        }
    }

    /// Total bytes currently held from the backing allocator.
    pub fn total_managed(&self) -> usize {
        self.managed.load(Ordering::Relaxed)
    }

    /// Allocate a chunk of at least `size` bytes (rounded up to the
    /// allocator alignment). With `defer_real_alloc`, a freelist miss does
    /// not touch the backing allocator — the chunk's memory materializes at
    /// the next [`sync`](Self::sync).
    ///
    /// Failure returns the invalid sentinel.
    pub fn alloc(&self, size: usize, defer_real_alloc: bool) -> MemChunk {
        let size = align_up(size.max(1), self.align);

        // An open group frame on this thread is the active freelist; misses
        // acquire privately so workers never touch the common list.
        if let Some(popped) = self.with_top_frame(|frame| Self::best_fit(&mut frame.free, size)) {
            let node = match popped {
                Some(node) => {
                    // A recycled node may still be unrealized if its chunk
                    // was freed before sync(); realize it on reuse.
                    if !defer_real_alloc && !self.ensure_realized(node) {
                        self.with_top_frame(|frame| {
                            // Safety: node came off our freelist moments ago.
                            let size = unsafe { (*node.as_ptr()).size };
                            frame.free.entry(size).or_default().push(node);
                        });
                        return MemChunk::default();
                    }
                    node
                }
                None => match self.make_node(size, defer_real_alloc) {
                    Some(node) => node,
                    None => return MemChunk::default(),
                },
            };
            self.with_top_frame(|frame| frame.used.insert(node.as_ptr() as usize, node));
            return MemChunk::from_node(node);
        }

        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(node) = Self::best_fit(&mut state.free, size) {
            if !defer_real_alloc && !self.ensure_realized(node) {
                // Safety: node came off our freelist.
                let size = unsafe { (*node.as_ptr()).size };
                state.free.entry(size).or_default().push(node);
                return MemChunk::default();
            }
            state.used.insert(node.as_ptr() as usize, node);
            return MemChunk::from_node(node);
        }

        if defer_real_alloc {
            let node = Self::new_node(size, self.align);
            state.deferred.push(node);
            state.used.insert(node.as_ptr() as usize, node);
            return MemChunk::from_node(node);
        }

        self.evict_for(&mut state, size + self.align);
        match self.acquire_node(size) {
            Some(node) => {
                state.used.insert(node.as_ptr() as usize, node);
                MemChunk::from_node(node)
            }
            None => MemChunk::default(),
        }
    }

    /// Return a chunk. Inside an open group the buffer lands on the
    /// frame-private freelist, otherwise on the common one. Freeing the
    /// invalid sentinel is a no-op.
    ///
    /// # Safety
    /// - `chunk` must have come from `alloc` on this allocator and be live.
    pub unsafe fn free(&self, chunk: MemChunk) {
        let Some(node) = NonNull::new(chunk.node) else {
            return;
        };
        let addr = node.as_ptr() as usize;
        // Safety: node is live per the contract.
        let size = unsafe { (*node.as_ptr()).size };

        let frame_hit = self.with_top_frame(|frame| {
            let was_frame_owned = frame.used.remove(&addr).is_some();
            frame.free.entry(size).or_default().push(node);
            was_frame_owned
        });
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let was_common = state.used.remove(&addr).is_some();
        match frame_hit {
            Some(was_frame_owned) => {
                debug_assert!(
                    was_frame_owned || was_common,
                    "free of a chunk that is not outstanding (double free?)"
                );
            }
            None => {
                debug_assert!(
                    was_common,
                    "free of a chunk that is not outstanding (double free?)"
                );
                state.free.entry(size).or_default().push(node);
            }
        }
    }

    /// Open a group frame on the calling thread. Groups nest strictly.
    pub fn begin_group(&self) {
        let tid = std::thread::current().id();
        let mut map = self
            .frames
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let frames = map.entry(tid).or_insert_with(ThreadFrames::new);
        // Safety: registry write lock gives exclusive access.
        crate::sync::unsafe_cell_get_mut!(frames.stack).push(GroupFrame::default());
    }

    /// Close the innermost group on the calling thread. Its outstanding
    /// chunks join the common set; its freelist merges into the common list
    /// immediately, or parks until `barrier_end` when a window is open.
    pub fn end_group(&self) {
        let tid = std::thread::current().id();
        let frame = {
            let map = self
                .frames
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            match map.get(&tid) {
                // Safety: only the owning thread mutates its frame stack.
                Some(frames) => crate::sync::unsafe_cell_get_mut!(frames.stack).pop(),
                None => None,
            }
        };
        let Some(frame) = frame else {
            debug_assert!(false, "end_group without a matching begin_group");
            return;
        };

        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.used.extend(frame.used);
        if self.in_barrier.load(Ordering::Acquire) {
            state.pending.push(frame.free);
        } else {
            Self::merge_free(&mut state.free, frame.free);
        }
    }

    /// Mark the start of a multi-threaded phase on the controlling thread.
    pub fn barrier_begin(&self) {
        let was_open = self.in_barrier.swap(true, Ordering::AcqRel);
        debug_assert!(!was_open, "barrier_begin while a window is already open");
    }

    /// Close the multi-threaded phase: every group must be closed by now;
    /// all parked group freelists merge into the common freelist.
    pub fn barrier_end(&self) {
        let was_open = self.in_barrier.swap(false, Ordering::AcqRel);
        debug_assert!(was_open, "barrier_end without a matching barrier_begin");

        let leftover = self.drain_frames(true);
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for frame in leftover {
            state.used.extend(frame.used);
            state.pending.push(frame.free);
        }
        let pending = std::mem::take(&mut state.pending);
        for freelist in pending {
            Self::merge_free(&mut state.free, freelist);
        }
    }

    /// Realize every deferred allocation. Nodes whose backing acquisition
    /// fails stay queued for the next call; their chunks keep resolving to
    /// null.
    pub fn sync(&self) {
        let deferred = {
            let mut state = self
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            std::mem::take(&mut state.deferred)
        };
        let mut failed = Vec::new();
        for node in deferred {
            if !self.ensure_realized(node) {
                failed.push(node);
            }
        }
        if !failed.is_empty() {
            self.state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .deferred
                .append(&mut failed);
        }
    }

    /// Drop managed memory. `all = false` releases idle buffers only;
    /// `all = true` additionally retires every outstanding buffer.
    ///
    /// # Safety
    /// With `all = true`, every chunk previously returned by `alloc`
    /// becomes dangling and must not be used (including `free`) afterwards.
    pub unsafe fn release(&self, all: bool) {
        self.purge(all, true);
    }

    fn purge(&self, all: bool, assert_closed: bool) {
        let leftover = if all {
            self.drain_frames(assert_closed)
        } else {
            Vec::new()
        };

        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for frame in leftover {
            state.used.extend(frame.used);
            state.pending.push(frame.free);
        }

        let free = std::mem::take(&mut state.free);
        for (_, nodes) in free {
            for node in nodes {
                self.dispose(&mut state, node);
            }
        }
        let pending = std::mem::take(&mut state.pending);
        for freelist in pending {
            for (_, nodes) in freelist {
                for node in nodes {
                    self.dispose(&mut state, node);
                }
            }
        }
        if all {
            let used = std::mem::take(&mut state.used);
            for (_, node) in used {
                self.dispose(&mut state, node);
            }
            debug_assert!(state.deferred.is_empty());
        }
    }

    // ------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------

    fn with_top_frame<R>(&self, f: impl FnOnce(&mut GroupFrame) -> R) -> Option<R> {
        let tid = std::thread::current().id();
        let map = self
            .frames
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let frames = map.get(&tid)?;
        // Safety: only the owning thread mutates its frame stack; the read
        // lock keeps the registry entry alive.
        let stack = crate::sync::unsafe_cell_get_mut!(frames.stack);
        let top = stack.last_mut()?;
        Some(f(top))
    }

    /// Empty the frame registry, returning any frames still open. Open
    /// frames at this point are a programmer error.
    fn drain_frames(&self, assert_closed: bool) -> Vec<GroupFrame> {
        let mut map = self
            .frames
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut leftover = Vec::new();
        for frames in map.values() {
            // Safety: registry write lock gives exclusive access.
            let stack = crate::sync::unsafe_cell_get_mut!(frames.stack);
            if assert_closed {
                debug_assert!(stack.is_empty(), "open group left behind");
            }
            leftover.append(stack);
        }
        map.clear();
        leftover
    }

    /// Pop the smallest free node of at least `size` bytes.
    fn best_fit(free: &mut FreeMap, size: usize) -> Option<NonNull<ChunkNode>> {
        let found = free.range(size..).next().map(|(&s, _)| s)?;
        let list = free.get_mut(&found)?;
        let node = list.pop()?;
        if list.is_empty() {
            free.remove(&found);
        }
        Some(node)
    }

    fn merge_free(into: &mut FreeMap, from: FreeMap) {
        for (size, mut nodes) in from {
            into.entry(size).or_default().append(&mut nodes);
        }
    }

    fn new_node(size: usize, align: usize) -> NonNull<ChunkNode> {
        let node = Box::new(ChunkNode {
            base: ptr::null_mut(),
            offset: 0,
            size,
            raw_size: size + align,
        });
        // Safety: Box::into_raw never returns null.
        unsafe { NonNull::new_unchecked(Box::into_raw(node)) }
    }

    /// Acquire backing for a node if it has none yet.
    fn ensure_realized(&self, node: NonNull<ChunkNode>) -> bool {
        // Safety: node is owned by this allocator; callers hold the list it
        // came from.
        let node = unsafe { &mut *node.as_ptr() };
        if !node.base.is_null() {
            return true;
        }
        match self.backing.acquire(node.raw_size) {
            Ok(base) => {
                node.offset = base.as_ptr().align_offset(self.align);
                debug_assert!(node.offset < self.align);
                node.base = base.as_ptr();
                self.managed.fetch_add(node.raw_size, Ordering::Relaxed);
                true
            }
            Err(e) => {
                log::debug!(
                    "scoped buffer acquisition failed ({} bytes): {e}",
                    node.raw_size
                );
                false
            }
        }
    }

    fn make_node(&self, size: usize, defer: bool) -> Option<NonNull<ChunkNode>> {
        if defer {
            let node = Self::new_node(size, self.align);
            self.state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .deferred
                .push(node);
            return Some(node);
        }
        if self.cap > 0 {
            let mut state = self
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            self.evict_for(&mut state, size + self.align);
        }
        self.acquire_node(size)
    }

    fn acquire_node(&self, size: usize) -> Option<NonNull<ChunkNode>> {
        let node = Self::new_node(size, self.align);
        if self.ensure_realized(node) {
            Some(node)
        } else {
            // Safety: the node was never shared.
            unsafe { drop(Box::from_raw(node.as_ptr())) };
            None
        }
    }

    /// Soft cap: drop idle buffers (largest first) until `need` more bytes
    /// fit. The request proceeds even if the list runs dry.
    fn evict_for(&self, state: &mut CommonState, need: usize) {
        while self.cap > 0 && self.managed.load(Ordering::Relaxed) + need > self.cap {
            let Some((&size, _)) = state.free.iter().next_back() else {
                break;
            };
            let node = state.free.get_mut(&size).and_then(|list| list.pop());
            if state.free.get(&size).is_some_and(|list| list.is_empty()) {
                state.free.remove(&size);
            }
            match node {
                Some(node) => self.dispose(state, node),
                None => break,
            }
        }
    }

    /// Retire a node: return its buffer to the backing and drop it.
    fn dispose(&self, state: &mut CommonState, node: NonNull<ChunkNode>) {
        state.deferred.retain(|d| *d != node);
        // Safety: the node is owned by this allocator and being retired.
        let boxed = unsafe { Box::from_raw(node.as_ptr()) };
        if let Some(base) = NonNull::new(boxed.base) {
            // Safety: base was acquired from this backing with raw_size bytes.
            unsafe { self.backing.release(base, boxed.raw_size) };
            self.managed.fetch_sub(boxed.raw_size, Ordering::Relaxed);
        }
    }
}

impl Drop for ScopedAllocator {
    fn drop(&mut self) {
        // Retire everything, including buffers still on loan; outstanding
        // chunks die with the allocator.
        self.purge(true, false);
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::backing::HeapBacking;

    fn scoped() -> ScopedAllocator {
        ScopedAllocator::new(Arc::new(HeapBacking))
    }

    #[test]
    fn test_alloc_free_reuse() {
        let alloc = scoped();
        let chunk = alloc.alloc(1024, false);
        assert!(!chunk.invalid());
        // Safety: Test code.
        unsafe {
            assert!(!chunk.ptr().is_null());
            assert_eq!(chunk.ptr() as usize % DEFAULT_ALIGNMENT, 0);
            assert!(chunk.capacity() >= 1024);
            chunk.ptr().write_bytes(0xA5, 1024);
            alloc.free(chunk);
        }
        let managed = alloc.total_managed();
        assert!(managed > 0);

        // A smaller request reuses the freed buffer instead of growing.
        let again = alloc.alloc(512, false);
        assert!(!again.invalid());
        assert_eq!(alloc.total_managed(), managed);
        // Safety: Test code.
        unsafe { alloc.free(again) };
    }

    #[test]
    fn test_invalid_chunk_free_is_noop() {
        let alloc = scoped();
        let chunk = MemChunk::default();
        assert!(chunk.invalid());
        // Safety: Test code.
        unsafe {
            assert!(chunk.ptr().is_null());
            alloc.free(chunk);
        }
    }

    #[test]
    fn test_alignment_is_honored() {
        let alloc = ScopedAllocator::with_limits(Arc::new(HeapBacking), 64, 0);
        let chunk = alloc.alloc(100, false);
        assert!(!chunk.invalid());
        // Safety: Test code.
        unsafe {
            assert_eq!(chunk.ptr() as usize % 64, 0);
            alloc.free(chunk);
        }
    }

    #[test]
    fn test_single_thread_group_merges_on_end() {
        let alloc = scoped();
        alloc.begin_group();
        let chunk = alloc.alloc(2048, false);
        assert!(!chunk.invalid());
        // Safety: Test code.
        unsafe { alloc.free(chunk) };
        alloc.end_group();

        // The group's freelist is live on the common list now.
        let managed = alloc.total_managed();
        let reuse = alloc.alloc(2048, false);
        assert!(!reuse.invalid());
        assert_eq!(alloc.total_managed(), managed);
        // Safety: Test code.
        unsafe { alloc.free(reuse) };
    }

    #[test]
    fn test_chunk_survives_group_end() {
        let alloc = scoped();
        alloc.begin_group();
        let chunk = alloc.alloc(256, false);
        alloc.end_group();
        // Safety: Test code — the chunk outlives its group.
        unsafe {
            chunk.ptr().write_bytes(0x11, 256);
            alloc.free(chunk);
        }
    }

    #[test]
    fn test_nested_groups() {
        let alloc = scoped();
        alloc.begin_group();
        let outer = alloc.alloc(512, false);
        alloc.begin_group();
        let inner = alloc.alloc(512, false);
        assert!(!inner.invalid());
        // Safety: Test code.
        unsafe { alloc.free(inner) };
        alloc.end_group();
        // Safety: Test code.
        unsafe { alloc.free(outer) };
        alloc.end_group();
    }

    #[test]
    fn test_barrier_merges_worker_freelists() {
        let alloc = Arc::new(scoped());
        alloc.barrier_begin();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let alloc = alloc.clone();
            handles.push(std::thread::spawn(move || {
                alloc.begin_group();
                let chunks: Vec<MemChunk> =
                    (1..=5).map(|i| alloc.alloc(1024 * i, false)).collect();
                for chunk in &chunks {
                    assert!(!chunk.invalid());
                }
                // Free a prefix; the rest stays on loan past the group.
                for chunk in &chunks[..3] {
                    // Safety: Test code.
                    unsafe { alloc.free(*chunk) };
                }
                alloc.end_group();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        alloc.barrier_end();

        // A 2 KiB request is served from the merged freelists without any
        // new backing acquisition.
        let managed = alloc.total_managed();
        let chunk = alloc.alloc(2048, false);
        assert!(!chunk.invalid());
        assert_eq!(alloc.total_managed(), managed);
        // Safety: Test code.
        unsafe {
            alloc.free(chunk);
            alloc.release(true);
        }
        assert_eq!(alloc.total_managed(), 0);
    }

    #[test]
    fn test_deferred_alloc_realizes_on_sync() {
        let alloc = scoped();
        let chunk = alloc.alloc(4096, true);
        assert!(!chunk.invalid());
        // Safety: Test code — deferred chunks resolve to null before sync.
        unsafe { assert!(chunk.ptr().is_null()) };
        assert_eq!(alloc.total_managed(), 0);

        alloc.sync();
        // Safety: Test code.
        unsafe {
            assert!(!chunk.ptr().is_null());
            assert_eq!(chunk.ptr() as usize % DEFAULT_ALIGNMENT, 0);
            chunk.ptr().write_bytes(0x77, 4096);
            alloc.free(chunk);
        }
        assert!(alloc.total_managed() > 0);
    }

    #[test]
    fn test_release_idle_only_keeps_outstanding() {
        let alloc = scoped();
        let keep = alloc.alloc(1024, false);
        let drop_me = alloc.alloc(2048, false);
        // Safety: Test code.
        unsafe { alloc.free(drop_me) };

        // Safety: Test code.
        unsafe { alloc.release(false) };
        // The outstanding buffer survives; the idle one is gone.
        // Safety: Test code.
        unsafe {
            keep.ptr().write_bytes(0x42, 1024);
            alloc.free(keep);
            alloc.release(true);
        }
        assert_eq!(alloc.total_managed(), 0);
    }

    #[test]
    fn test_soft_cap_evicts_idle_buffers() {
        let cap = 10_000;
        let alloc = ScopedAllocator::with_limits(Arc::new(HeapBacking), DEFAULT_ALIGNMENT, cap);
        let first = alloc.alloc(4096, false);
        let first_raw = 4096 + DEFAULT_ALIGNMENT;
        assert_eq!(alloc.total_managed(), first_raw);
        // Safety: Test code.
        unsafe { alloc.free(first) };

        // The next acquisition would exceed the cap; the idle buffer is
        // evicted to make room.
        let second = alloc.alloc(8192, false);
        assert!(!second.invalid());
        assert_eq!(alloc.total_managed(), 8192 + DEFAULT_ALIGNMENT);
        // Safety: Test code.
        unsafe { alloc.free(second) };
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "end_group without a matching begin_group")]
    fn test_mismatched_end_group_panics_in_debug() {
        let alloc = scoped();
        alloc.end_group();
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "barrier_end without a matching barrier_begin")]
    fn test_mismatched_barrier_end_panics_in_debug() {
        let alloc = scoped();
        alloc.barrier_end();
    }
}
