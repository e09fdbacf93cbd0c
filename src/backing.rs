//! [`BackingAlloc`] trait and structures that implement it.
//!
//! The [`BackingAlloc`] trait is the seam between the pool allocators and
//! whatever general-purpose memory source supplies their page blocks. The
//! pools in this crate never touch the operating system directly; every page
//! is acquired from and released to a backing store.

use core::alloc::Layout;
use core::ptr::NonNull;

/// A source of raw blocks for page storage.
///
/// # Safety
/// * A block returned by `acquire` must be valid for reads and writes of
///   `layout.size()` bytes, aligned to `layout.align()`, and exclusively
///   owned by the caller until passed back to `release`.
/// * Blocks must stay at a stable address until released; the pools thread
///   free lists through them.
pub unsafe trait BackingAlloc {
    /// Acquires a block described by `layout`, or `Err(())` if the store is
    /// exhausted. `layout.size()` is never 0.
    fn acquire(&self, layout: Layout) -> Result<NonNull<u8>, ()>;

    /// Releases a block previously returned by `acquire`.
    ///
    /// # Safety
    /// `base` must have been returned by `acquire` on this same store with
    /// this exact `layout`, and must not have been released already.
    unsafe fn release(&self, base: NonNull<u8>, layout: Layout);
}

/// A backing store over the process heap.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SystemBacking;

unsafe impl BackingAlloc for SystemBacking {
    fn acquire(&self, layout: Layout) -> Result<NonNull<u8>, ()> {
        debug_assert!(layout.size() > 0);
        NonNull::new(unsafe { std::alloc::alloc(layout) }).ok_or(())
    }

    unsafe fn release(&self, base: NonNull<u8>, layout: Layout) {
        std::alloc::dealloc(base.as_ptr(), layout);
    }
}

/// A backing store that maps page blocks straight from the operating system
/// with [`libc::mmap`], bypassing the process heap.
///
/// Blocks come back page-aligned, so alignments up to the OS page size are
/// honored for free; `acquire` fails for anything stricter.
#[cfg(unix)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MmapBacking;

#[cfg(unix)]
unsafe impl BackingAlloc for MmapBacking {
    fn acquire(&self, layout: Layout) -> Result<NonNull<u8>, ()> {
        debug_assert!(layout.size() > 0);
        let os_page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if os_page <= 0 || layout.align() > os_page as usize {
            return Err(());
        }
        let p = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                layout.size(),
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if p == libc::MAP_FAILED {
            return Err(());
        }
        NonNull::new(p.cast()).ok_or(())
    }

    unsafe fn release(&self, base: NonNull<u8>, layout: Layout) {
        let rc = libc::munmap(base.as_ptr().cast(), layout.size());
        debug_assert_eq!(rc, 0, "munmap of an acquired block should never fail.");
    }
}

unsafe impl<T: BackingAlloc + ?Sized> BackingAlloc for &T {
    fn acquire(&self, layout: Layout) -> Result<NonNull<u8>, ()> {
        (*self).acquire(layout)
    }

    unsafe fn release(&self, base: NonNull<u8>, layout: Layout) {
        (*self).release(base, layout)
    }
}
