use std::ptr;

/// In-band header living in the first bytes of every block, free or
/// allocated. While the block sits on a freelist, `next` threads the list;
/// once handed out, the user region starts at `block + FREE_BLOCK_HEADER_SIZE`
/// so the header is never overwritten and `total_size` stays readable for a
/// size-free deallocate.
#[repr(C)]
pub(crate) struct FreeBlock {
    pub total_size: usize,
    pub next: *mut FreeBlock,
}

pub(crate) const FREE_BLOCK_HEADER_SIZE: usize = size_of::<FreeBlock>();

/// Ordered table of block total sizes with parallel freelist heads and
/// counts. Kept sorted so lookups are a binary search and reclamation scans
/// stay cache-friendly.
///
/// Not intrinsically thread-safe; the owning pool's access discipline
/// (thread confinement or the global mutex) applies.
pub(crate) struct SizeClassTable {
    pub sizes: Vec<usize>,
    pub heads: Vec<*mut FreeBlock>,
    pub counts: Vec<usize>,
}

impl SizeClassTable {
    pub fn new() -> Self {
        Self {
            sizes: Vec::new(),
            heads: Vec::new(),
            counts: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    /// Binary search for an exact total size.
    pub fn find(&self, total_size: usize) -> Option<usize> {
        self.sizes.binary_search(&total_size).ok()
    }

    /// Locate `total_size`, inserting a fresh empty class at the sorted
    /// position when absent. Returns the class index either way.
    pub fn insert_if_absent(&mut self, total_size: usize) -> usize {
        match self.sizes.binary_search(&total_size) {
            Ok(index) => index,
            Err(index) => {
                self.sizes.insert(index, total_size);
                self.heads.insert(index, ptr::null_mut());
                self.counts.insert(index, 0);
                index
            }
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_insert_preserves_order() {
        let mut table = SizeClassTable::new();
        for size in [64usize, 24, 2064, 32, 1024] {
            table.insert_if_absent(size);
        }
        assert_eq!(table.sizes, vec![24, 32, 64, 1024, 2064]);
        assert_eq!(table.heads.len(), 5);
        assert_eq!(table.counts.len(), 5);
    }

    #[test]
    fn test_insert_is_idempotent() {
        let mut table = SizeClassTable::new();
        let a = table.insert_if_absent(128);
        let b = table.insert_if_absent(128);
        assert_eq!(a, b);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_find_missing_size() {
        let mut table = SizeClassTable::new();
        table.insert_if_absent(24);
        table.insert_if_absent(48);
        assert_eq!(table.find(24), Some(0));
        assert_eq!(table.find(48), Some(1));
        assert_eq!(table.find(32), None);
    }

    #[test]
    fn test_header_is_two_words() {
        assert_eq!(FREE_BLOCK_HEADER_SIZE, 2 * size_of::<usize>());
    }
}
