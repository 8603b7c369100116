//! Cross-component tests: the three-tier fallback, thread-exit donation and
//! the scoped allocator driven end to end.

#![cfg(all(test, not(loom)))]

use super::global::GlobalPool;
use super::manager::MemoryManager;
use super::pool::{BasePool, MAX_GLOBAL_FREE_MEMORY, PAGE_SIZE};
use super::scoped::ScopedAllocator;
use crate::sync::Arc;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn test_worker_threads_donate_on_exit() {
    let _guard = crate::memory::TEST_MUTEX.write().unwrap();
    init_logging();

    let before = GlobalPool::instance().stats().total_free_memory;

    let handles: Vec<_> = (0..4)
        .map(|t| {
            std::thread::spawn(move || {
                let mut live = Vec::new();
                for i in 0..300 {
                    let size = 8 + ((t * 37 + i * 13) % 2040);
                    let ptr = MemoryManager::allocate(size).expect("allocation failed");
                    live.push(ptr.as_ptr() as usize);
                }
                for addr in live {
                    // Safety: Test code.
                    unsafe { MemoryManager::deallocate(addr as *mut u8) };
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let after = GlobalPool::instance().stats().total_free_memory;
    assert!(
        after > before,
        "exited workers should have donated their freelists"
    );
    assert!(
        after <= MAX_GLOBAL_FREE_MEMORY,
        "the high-water reclamation must cap donated memory"
    );
}

#[test]
fn test_cross_thread_free_lands_in_caller_pool() {
    let _guard = crate::memory::TEST_MUTEX.write().unwrap();
    init_logging();

    // Mint a block on another thread and keep it alive past the thread.
    let addr = std::thread::spawn(|| {
        let ptr = MemoryManager::allocate(777).expect("allocation failed");
        ptr.as_ptr() as usize
    })
    .join()
    .unwrap();

    let before = MemoryManager::local_stats();
    // Safety: Test code — the block is live and pool-born.
    unsafe { MemoryManager::deallocate(addr as *mut u8) };
    let after = MemoryManager::local_stats();
    assert_eq!(after.deallocate_count, before.deallocate_count + 1);
    assert!(after.total_free_memory > before.total_free_memory);
}

#[test]
fn test_three_tier_fallback_for_oversize() {
    let _guard = crate::memory::TEST_MUTEX.write().unwrap();
    init_logging();

    let global_before = MemoryManager::global_stats();
    let local_before = MemoryManager::local_stats();

    let ptr = MemoryManager::allocate(3 * PAGE_SIZE).expect("oversize allocation failed");
    // Safety: Test code.
    unsafe {
        ptr.as_ptr().write_bytes(0x3C, 3 * PAGE_SIZE);
        MemoryManager::deallocate(ptr.as_ptr());
    }

    // Neither pool tier was involved.
    assert_eq!(
        MemoryManager::global_stats().allocate_count,
        global_before.allocate_count
    );
    assert_eq!(
        MemoryManager::local_stats().allocate_count,
        local_before.allocate_count
    );
}

#[test]
fn test_global_stats_are_coherent() {
    let _guard = crate::memory::TEST_MUTEX.write().unwrap();
    init_logging();

    let mut donor = BasePool::new();
    let ptrs: Vec<_> = (0..64).map(|_| donor.allocate(256).unwrap()).collect();
    for ptr in ptrs {
        // Safety: Test code.
        unsafe { donor.deallocate(ptr) };
    }
    GlobalPool::instance().transfer_from(&mut donor);

    let stats = MemoryManager::global_stats();
    assert_eq!(
        stats.total_used_memory,
        stats.total_allocated_memory - stats.total_free_memory
    );
    assert!(stats.total_allocated_memory >= stats.total_free_memory);
}

#[test]
fn test_scoped_allocator_over_file_backing() {
    #[cfg(unix)]
    {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        init_logging();

        let dir = std::env::temp_dir().join(format!("tierpool-it-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let backing = Arc::new(crate::memory::backing::FileBacking::new(
            &dir,
            "scoped",
            crate::memory::backing::FileKind::Weight,
            true,
            0,
        ));
        let alloc = ScopedAllocator::with_limits(backing, 64, 0);

        let chunk = alloc.alloc(100, false);
        assert!(!chunk.invalid());
        // Safety: Test code.
        unsafe {
            chunk.ptr().write_bytes(0x99, 100);
            alloc.free(chunk);
            alloc.release(true);
        }
        assert_eq!(alloc.total_managed(), 0);
        drop(alloc);
        drop(std::fs::remove_dir_all(&dir));
    }
}

#[test]
fn test_scoped_groups_and_pools_coexist() {
    let _guard = crate::memory::TEST_MUTEX.write().unwrap();
    init_logging();

    let scoped = Arc::new(ScopedAllocator::new(Arc::new(
        crate::memory::backing::HeapBacking,
    )));
    scoped.barrier_begin();

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let scoped = scoped.clone();
            std::thread::spawn(move || {
                scoped.begin_group();
                // Pool traffic and scoped traffic interleave freely.
                let small = MemoryManager::allocate(128).expect("pool allocation failed");
                let chunk = scoped.alloc(3072, false);
                assert!(!chunk.invalid());
                // Safety: Test code.
                unsafe {
                    scoped.free(chunk);
                    MemoryManager::deallocate(small.as_ptr());
                }
                scoped.end_group();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    scoped.barrier_end();

    let managed = scoped.total_managed();
    let chunk = scoped.alloc(2048, false);
    assert!(!chunk.invalid());
    assert_eq!(scoped.total_managed(), managed);
    // Safety: Test code.
    unsafe {
        scoped.free(chunk);
        scoped.release(true);
    }
}
