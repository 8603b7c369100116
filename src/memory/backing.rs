use std::fmt;
use std::ptr::NonNull;

use crate::memory::pool::PAGE_SIZE;
#[cfg(unix)]
use crate::sync::Mutex;
#[cfg(unix)]
use crate::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug)]
pub enum BackingError {
    AcquireFailed(std::io::Error),
    MapFailed(std::io::Error),
    CapExceeded {
        requested: usize,
        cap: usize,
        mapped: usize,
    },
    InvalidRequest(String),
}

impl fmt::Display for BackingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackingError::AcquireFailed(e) => write!(f, "buffer acquisition failed: {e}"),
            BackingError::MapFailed(e) => write!(f, "file mapping failed: {e}"),
            BackingError::CapExceeded {
                requested,
                cap,
                mapped,
            } => write!(
                f,
                "mapped-size cap exceeded: request {requested} with {mapped} mapped of {cap} max"
            ),
            BackingError::InvalidRequest(msg) => write!(f, "invalid buffer request: {msg}"),
        }
    }
}

impl std::error::Error for BackingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BackingError::AcquireFailed(e) | BackingError::MapFailed(e) => Some(e),
            BackingError::CapExceeded { .. } | BackingError::InvalidRequest(_) => None,
        }
    }
}

/// Capability interface for raw buffer production.
///
/// The pool tiers consume only this pair of operations and are agnostic to
/// the backing choice. Implementations must return page-aligned buffers
/// whenever `bytes` is a multiple of [`PAGE_SIZE`] — the pools classify
/// pointers by masking to the containing page base.
pub trait BackingAlloc {
    /// Produce a buffer of exactly `bytes` bytes.
    fn acquire(&self, bytes: usize) -> Result<NonNull<u8>, BackingError>;

    /// Return a buffer previously produced by [`acquire`](Self::acquire) on
    /// this instance with the same `bytes`.
    ///
    /// # Safety
    /// - `ptr` must have been returned by `acquire(bytes)` on this instance.
    /// - `ptr` must not be used after this call.
    unsafe fn release(&self, ptr: NonNull<u8>, bytes: usize);
}

/// Default heap-backed variant.
///
/// Page-multiple requests are page-aligned; anything else gets the natural
/// buffer alignment. The layout is derived from `bytes` alone so `release`
/// can reconstruct it without a side table.
pub struct HeapBacking;

/// Alignment for non-page-sized buffers (scoped allocator traffic).
const BUFFER_ALIGN: usize = 16;

impl HeapBacking {
    fn layout_for(bytes: usize) -> Result<std::alloc::Layout, BackingError> {
        let align = if bytes.is_multiple_of(PAGE_SIZE) {
            PAGE_SIZE
        } else {
            BUFFER_ALIGN
        };
        std::alloc::Layout::from_size_align(bytes, align)
            .map_err(|e| BackingError::InvalidRequest(format!("layout for {bytes} bytes: {e}")))
    }
}

impl BackingAlloc for HeapBacking {
    fn acquire(&self, bytes: usize) -> Result<NonNull<u8>, BackingError> {
        if bytes == 0 {
            return Err(BackingError::InvalidRequest(
                "zero-size acquisition".to_string(),
            ));
        }
        let layout = Self::layout_for(bytes)?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            BackingError::AcquireFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn release(&self, ptr: NonNull<u8>, bytes: usize) {
        let Ok(layout) = Self::layout_for(bytes) else {
            debug_assert!(false, "release size {bytes} was never acquirable");
            return;
        };
        // Safety: ptr was produced by acquire(bytes), which used this layout.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
    }
}

/// Tag distinguishing the two file families a mapped backing produces.
#[cfg(unix)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    Static,
    Weight,
}

#[cfg(unix)]
impl FileKind {
    fn as_str(self) -> &'static str {
        match self {
            FileKind::Static => "static",
            FileKind::Weight => "weight",
        }
    }
}

#[cfg(unix)]
struct FileMapping {
    path: std::path::PathBuf,
    len: usize,
}

/// File-mapped variant: every acquired buffer is an `mmap(MAP_SHARED)` view
/// of its own file under `dir`, named `{prefix}.{kind}.{seq}`.
///
/// `max_mapped` is a hard cap on total bytes mapped at once (0 = unbounded).
/// With `auto_remove` set, backing files are unlinked on release.
#[cfg(unix)]
pub struct FileBacking {
    dir: std::path::PathBuf,
    prefix: String,
    kind: FileKind,
    auto_remove: bool,
    max_mapped: usize,
    seq: AtomicUsize,
    mapped: AtomicUsize,
    live: Mutex<std::collections::HashMap<usize, FileMapping>>,
}

#[cfg(unix)]
impl FileBacking {
    pub fn new(
        dir: impl Into<std::path::PathBuf>,
        prefix: impl Into<String>,
        kind: FileKind,
        auto_remove: bool,
        max_mapped: usize,
    ) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            kind,
            auto_remove,
            max_mapped,
            seq: AtomicUsize::new(0),
            mapped: AtomicUsize::new(0),
            live: Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Total bytes currently mapped.
    pub fn mapped_bytes(&self) -> usize {
        self.mapped.load(Ordering::Relaxed)
    }

    fn map_file(&self, path: &std::path::Path, bytes: usize) -> Result<NonNull<u8>, BackingError> {
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(BackingError::MapFailed)?;
        file.set_len(bytes as u64).map_err(BackingError::MapFailed)?;

        // Safety: FFI call to mmap; fd is valid for the duration of the call
        // and the mapping outlives the closed fd.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                bytes,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            let err = std::io::Error::last_os_error();
            drop(std::fs::remove_file(path));
            return Err(BackingError::MapFailed(err));
        }

        NonNull::new(ptr.cast::<u8>()).ok_or_else(|| {
            BackingError::MapFailed(std::io::Error::other("mmap returned null"))
        })
    }
}

#[cfg(unix)]
impl BackingAlloc for FileBacking {
    fn acquire(&self, bytes: usize) -> Result<NonNull<u8>, BackingError> {
        if bytes == 0 {
            return Err(BackingError::InvalidRequest(
                "zero-size acquisition".to_string(),
            ));
        }
        if self.max_mapped > 0 {
            let mapped = self.mapped.load(Ordering::Relaxed);
            if mapped + bytes > self.max_mapped {
                return Err(BackingError::CapExceeded {
                    requested: bytes,
                    cap: self.max_mapped,
                    mapped,
                });
            }
        }

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let path = self
            .dir
            .join(format!("{}.{}.{seq:04}", self.prefix, self.kind.as_str()));
        let ptr = self.map_file(&path, bytes)?;

        self.mapped.fetch_add(bytes, Ordering::Relaxed);
        self.live
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(ptr.as_ptr() as usize, FileMapping { path, len: bytes });
        Ok(ptr)
    }

    unsafe fn release(&self, ptr: NonNull<u8>, bytes: usize) {
        let mapping = self
            .live
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&(ptr.as_ptr() as usize));
        let Some(mapping) = mapping else {
            debug_assert!(false, "release of pointer {ptr:p} not mapped by this backing");
            return;
        };
        debug_assert_eq!(mapping.len, bytes, "release size mismatch for {ptr:p}");

        // Safety: FFI call to munmap; the mapping was created by map_file.
        if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), mapping.len) } != 0 {
            log::warn!(
                "munmap of {:p} ({} bytes) failed: {}",
                ptr,
                mapping.len,
                std::io::Error::last_os_error()
            );
        }
        self.mapped.fetch_sub(mapping.len, Ordering::Relaxed);

        if self.auto_remove
            && let Err(e) = std::fs::remove_file(&mapping.path)
        {
            log::warn!("failed to remove backing file {:?}: {e}", mapping.path);
        }
    }
}
