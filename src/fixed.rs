//! The [`FixedAllocator`]: a chain of pages serving one record size.

use core::alloc::Layout;
use core::cell::{Cell, UnsafeCell};
use core::fmt::Debug;
use core::ptr::NonNull;

use tracing::{debug, error, instrument};

use crate::backing::{BackingAlloc, SystemBacking};
use crate::error::AllocError;
use crate::page::{Page, PageState, PAGE_BASE_ALIGN, RECORD_QUANTUM};
use crate::policy::{GrowthPolicy, PurgePolicy};
use crate::util::round_up;

/// Address range of a page block, reported to callers that maintain an
/// ownership directory over several allocators.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct PageSpan {
    pub(crate) base: usize,
    pub(crate) bytes: usize,
}

/// Page-chain state behind the interior-mutability cell.
///
/// The three hints are caches, never authorities: a stale hint is detected
/// by re-checking the page it points at, so structural changes only have to
/// reset them coarsely.
struct Chain {
    pages: Vec<Page>,
    /// Candidate index of the first page with free records.
    free_hint: usize,
    /// Candidate index of the first fully-empty page.
    empty_hint: usize,
    /// Page that served the most recent deallocation.
    dealloc_hint: usize,
}

impl Chain {
    const fn new() -> Self {
        Chain {
            pages: Vec::new(),
            free_hint: 0,
            empty_hint: usize::MAX,
            dealloc_hint: 0,
        }
    }

    fn reset_hints(&mut self) {
        self.free_hint = 0;
        self.empty_hint = usize::MAX;
        self.dealloc_hint = 0;
    }

    /// Index of a page with at least one free record, hint-first.
    fn page_with_space(&mut self) -> Option<usize> {
        for hint in [self.free_hint, self.empty_hint] {
            if let Some(page) = self.pages.get(hint) {
                if page.state() != PageState::Full {
                    self.free_hint = hint;
                    return Some(hint);
                }
            }
        }
        let found = self.pages.iter().position(|p| p.state() != PageState::Full)?;
        self.free_hint = found;
        Some(found)
    }

    /// Index of the page whose block contains `addr`, hint-first.
    fn owning_page(&mut self, addr: usize) -> Option<usize> {
        if let Some(page) = self.pages.get(self.dealloc_hint) {
            if page.contains(addr) {
                return Some(self.dealloc_hint);
            }
        }
        let found = self.pages.iter().position(|p| p.contains(addr))?;
        self.dealloc_hint = found;
        Some(found)
    }
}

/// A pooling allocator for records of exactly one size.
///
/// Records live in [`Page`]s acquired from the backing store `B`; the page
/// to create next is sized by the [`GrowthPolicy`] fixed at construction.
/// Allocation and deallocation are *O*(1) amortized: the common pattern of
/// short-lived same-size objects keeps the cached page hints warm.
///
/// The type is not `Sync`; wrap it in a lock to share it across threads
/// (see [`SyncSmallObjAllocator`](crate::SyncSmallObjAllocator)).
///
/// [`Page`]: crate::page::Page
pub struct FixedAllocator<B: BackingAlloc = SystemBacking> {
    chain: UnsafeCell<Chain>,
    backing: B,
    record_size: usize,
    record_align: usize,
    stride: usize,
    page_align: usize,
    growth: GrowthPolicy,
    policy: Cell<PurgePolicy>,
}

// Pages are exclusively owned raw blocks; moving the allocator to another
// thread moves them with it.
unsafe impl<B: BackingAlloc + Send> Send for FixedAllocator<B> {}

impl<B: BackingAlloc> Debug for FixedAllocator<B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FixedAllocator")
            .field("record_size", &self.record_size)
            .field("stride", &self.stride)
            .field("page_count", &self.page_count())
            .finish()
    }
}

impl FixedAllocator<SystemBacking> {
    /// Creates an allocator for `record_size`-byte records on the process
    /// heap. Records are 4-byte aligned; use [`for_layout`] for stricter
    /// alignment.
    ///
    /// [`for_layout`]: FixedAllocator::for_layout
    pub fn new(record_size: usize, growth: GrowthPolicy) -> Self {
        Self::with_backing(record_size, growth, SystemBacking)
    }
}

impl<B: BackingAlloc> FixedAllocator<B> {
    /// Creates an allocator for `record_size`-byte records with the
    /// specified backing store.
    pub fn with_backing(record_size: usize, growth: GrowthPolicy, backing: B) -> Self {
        let layout = Layout::from_size_align(record_size.max(1), 1)
            .expect("record size exceeds the address space");
        Self::for_layout(layout, growth, backing)
    }

    /// Creates an allocator whose records satisfy `layout`. The stride is
    /// rounded up so that every record holds a free-list link and every
    /// record address honors `layout.align()`.
    pub fn for_layout(layout: Layout, growth: GrowthPolicy, backing: B) -> Self {
        let record_align = layout.align().max(RECORD_QUANTUM);
        let stride = round_up(layout.size().max(RECORD_QUANTUM), record_align)
            .expect("record stride exceeds the address space");
        FixedAllocator {
            chain: UnsafeCell::new(Chain::new()),
            backing,
            record_size: layout.size().max(1),
            record_align,
            stride,
            page_align: record_align.max(PAGE_BASE_ALIGN),
            growth,
            policy: Cell::new(PurgePolicy::Manual),
        }
    }

    /// Returns a record-sized address with no construction performed.
    ///
    /// Fails with [`AllocError::OutOfMemory`] only if creating a new page
    /// fails; otherwise the allocator grows as needed and always succeeds.
    pub fn allocate(&self) -> Result<NonNull<u8>, AllocError> {
        self.allocate_reporting().map(|(ptr, _)| ptr)
    }

    /// Pushes the record at `ptr` back onto its owning page's free list.
    /// Under [`PurgePolicy::Auto`] the page is released the moment it
    /// becomes fully empty.
    ///
    /// # Safety
    /// `ptr` must have been returned by `allocate` on this exact allocator
    /// instance and not deallocated since.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        self.deallocate_reporting(ptr);
    }

    /// Releases every fully-empty page back to the backing store and
    /// returns the number of bytes released. Pages with any live record are
    /// untouched; repeated calls with no intervening traffic are no-ops.
    pub fn purge(&self) -> usize {
        self.purge_reporting(|_| {})
    }

    pub(crate) fn allocate_reporting(
        &self,
    ) -> Result<(NonNull<u8>, Option<PageSpan>), AllocError> {
        // Sound: the type is !Sync and nothing below reenters the cell.
        let chain = unsafe { &mut *self.chain.get() };

        let (index, span) = match chain.page_with_space() {
            Some(index) => (index, None),
            None => {
                let records = self.growth.records_for(chain.pages.len());
                let page = match Page::new(&self.backing, self.stride, self.page_align, records)
                {
                    Ok(page) => page,
                    Err(()) => {
                        error!(
                            record_size = self.record_size,
                            records, "Page growth failed, backing store exhausted."
                        );
                        return Err(AllocError::OutOfMemory);
                    }
                };
                let span = PageSpan {
                    base: page.base_addr(),
                    bytes: page.reserved_bytes(),
                };
                debug!(
                    record_size = self.record_size,
                    records,
                    base = span.base,
                    "Created page."
                );
                chain.pages.push(page);
                let index = chain.pages.len() - 1;
                chain.free_hint = index;
                (index, Some(span))
            }
        };

        match chain.pages[index].allocate() {
            Some(ptr) => Ok((ptr, span)),
            None => unreachable!("selected page has free records"),
        }
    }

    /// Returns the span of the page released by this deallocation, if any.
    pub(crate) fn deallocate_reporting(&self, ptr: NonNull<u8>) -> Option<PageSpan> {
        let chain = unsafe { &mut *self.chain.get() };

        let addr = ptr.as_ptr() as usize;
        let Some(index) = chain.owning_page(addr) else {
            panic!("address passed to deallocate does not belong to this allocator");
        };
        unsafe { chain.pages[index].deallocate(ptr) };

        match chain.pages[index].state() {
            PageState::Empty if self.policy.get() == PurgePolicy::Auto => {
                let page = chain.pages.swap_remove(index);
                let span = PageSpan {
                    base: page.base_addr(),
                    bytes: page.reserved_bytes(),
                };
                debug!(
                    record_size = self.record_size,
                    base = span.base,
                    "Releasing page emptied under auto purge."
                );
                unsafe { page.release(&self.backing) };
                chain.reset_hints();
                Some(span)
            }
            PageState::Empty => {
                chain.empty_hint = index;
                chain.free_hint = index;
                None
            }
            _ => {
                chain.free_hint = index;
                None
            }
        }
    }

    #[instrument(level = "debug", skip_all, fields(record_size = self.record_size))]
    pub(crate) fn purge_reporting<F: FnMut(PageSpan)>(&self, mut released: F) -> usize {
        let chain = unsafe { &mut *self.chain.get() };

        let pages = core::mem::take(&mut chain.pages);
        let mut kept = Vec::with_capacity(pages.len());
        let mut bytes = 0;
        for page in pages {
            if page.state() == PageState::Empty {
                bytes += page.reserved_bytes();
                released(PageSpan {
                    base: page.base_addr(),
                    bytes: page.reserved_bytes(),
                });
                unsafe { page.release(&self.backing) };
            } else {
                kept.push(page);
            }
        }
        chain.pages = kept;
        chain.reset_hints();
        if bytes > 0 {
            debug!(bytes, "Purged empty pages.");
        }
        bytes
    }

    /// Record size this allocator exclusively serves.
    #[inline]
    pub fn record_size(&self) -> usize {
        self.record_size
    }

    /// Alignment every returned record satisfies.
    #[inline]
    pub fn record_align(&self) -> usize {
        self.record_align
    }

    /// Distance in bytes between adjacent records of one page.
    #[inline]
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Number of pages currently owned.
    pub fn page_count(&self) -> usize {
        unsafe { &*self.chain.get() }.pages.len()
    }

    /// Number of records currently handed out.
    pub fn live_records(&self) -> usize {
        let chain = unsafe { &*self.chain.get() };
        chain.pages.iter().map(|p| p.live_records() as usize).sum()
    }

    /// Total bytes currently reserved from the backing store. Diagnostic
    /// only; not part of any correctness contract.
    pub fn reserved_bytes(&self) -> usize {
        let chain = unsafe { &*self.chain.get() };
        chain.pages.iter().map(Page::reserved_bytes).sum()
    }

    #[inline]
    pub fn purge_policy(&self) -> PurgePolicy {
        self.policy.get()
    }

    #[inline]
    pub fn set_purge_policy(&self, policy: PurgePolicy) {
        self.policy.set(policy);
    }
}

impl<B: BackingAlloc> crate::policy::PurgePolicyHost for FixedAllocator<B> {
    fn purge_policy(&self) -> PurgePolicy {
        self.policy.get()
    }

    fn set_purge_policy(&self, policy: PurgePolicy) {
        self.policy.set(policy);
    }
}

impl<B: BackingAlloc> Drop for FixedAllocator<B> {
    fn drop(&mut self) {
        let chain = self.chain.get_mut();
        for page in chain.pages.drain(..) {
            unsafe { page.release(&self.backing) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::test_backing::CountingBacking;

    fn fixed(record_size: usize, records: u32) -> FixedAllocator<CountingBacking> {
        FixedAllocator::with_backing(
            record_size,
            GrowthPolicy::FixedSize { records },
            CountingBacking::new(),
        )
    }

    #[test]
    fn test_1() {
        // Fill one page, spill into a second, empty the first, purge it.
        let allocator = fixed(16, 4);

        let first_page: Vec<_> = (0..4).map(|_| allocator.allocate().unwrap()).collect();
        assert_eq!(allocator.page_count(), 1);

        let fifth = allocator.allocate().unwrap();
        assert_eq!(allocator.page_count(), 2);
        assert_eq!(allocator.reserved_bytes(), 2 * 4 * 16);

        for ptr in &first_page {
            unsafe { allocator.deallocate(*ptr) };
        }
        // Manual policy: the empty page stays until an explicit purge.
        assert_eq!(allocator.page_count(), 2);

        let released = allocator.purge();
        assert_eq!(released, 4 * 16);
        assert_eq!(allocator.page_count(), 1);
        assert_eq!(allocator.reserved_bytes(), 4 * 16);
        assert_eq!(allocator.live_records(), 1);

        // Idempotence: a second purge with no traffic frees nothing.
        assert_eq!(allocator.purge(), 0);

        unsafe { allocator.deallocate(fifth) };
    }

    #[test]
    fn test_2() {
        // Auto policy releases a page the moment it becomes empty.
        let allocator = fixed(16, 4);
        allocator.set_purge_policy(PurgePolicy::Auto);

        let records: Vec<_> = (0..5).map(|_| allocator.allocate().unwrap()).collect();
        assert_eq!(allocator.page_count(), 2);

        for ptr in &records[..4] {
            unsafe { allocator.deallocate(*ptr) };
        }
        assert_eq!(allocator.page_count(), 1);
        assert_eq!(allocator.reserved_bytes(), 4 * 16);

        unsafe { allocator.deallocate(records[4]) };
        assert_eq!(allocator.page_count(), 0);
    }

    #[test]
    fn test_3() {
        // LIFO reuse on an otherwise idle pool.
        let allocator = fixed(8, 16);
        for _ in 0..10 {
            let ptr = allocator.allocate().unwrap();
            unsafe { allocator.deallocate(ptr) };
            assert_eq!(allocator.allocate().unwrap(), ptr);
            unsafe { allocator.deallocate(ptr) };
        }
    }

    #[test]
    fn test_4() {
        // Out of memory surfaces only when growth itself fails.
        let backing = CountingBacking::with_budget(1);
        let allocator = FixedAllocator::with_backing(
            32,
            GrowthPolicy::FixedSize { records: 2 },
            backing,
        );

        let a = allocator.allocate().unwrap();
        let b = allocator.allocate().unwrap();
        assert_eq!(allocator.allocate(), Err(AllocError::OutOfMemory));

        // Freed records make the existing page usable again.
        unsafe { allocator.deallocate(b) };
        assert!(allocator.allocate().is_ok());
        let _ = a;
    }

    #[test]
    fn test_5() {
        // Growth policies size successive pages as documented.
        let backing = CountingBacking::new();
        let allocator = FixedAllocator::with_backing(
            4,
            GrowthPolicy::Exponential { base: 2 },
            backing.clone(),
        );

        // Pages hold 2, 4, 8 records; 14 allocations need exactly 3 pages.
        let records: Vec<_> = (0..14).map(|_| allocator.allocate().unwrap()).collect();
        assert_eq!(allocator.page_count(), 3);
        assert_eq!(backing.acquired(), 3);

        for ptr in records {
            unsafe { allocator.deallocate(ptr) };
        }
    }

    #[test]
    fn test_6() {
        // Deallocations route to the owning page even across many pages.
        let allocator = fixed(4, 2);
        let records: Vec<_> = (0..16).map(|_| allocator.allocate().unwrap()).collect();
        assert_eq!(allocator.page_count(), 8);

        // Free in an interleaved order so the dealloc hint keeps missing.
        for step in [0, 3, 1, 5, 2, 7, 4, 6] {
            for chunk in records.chunks(8) {
                if let Some(ptr) = chunk.get(step) {
                    unsafe { allocator.deallocate(*ptr) };
                }
            }
        }
        assert_eq!(allocator.live_records(), 0);
        assert_eq!(allocator.purge(), 8 * 2 * 4);
        assert_eq!(allocator.page_count(), 0);
    }

    #[test]
    #[should_panic(expected = "does not belong")]
    fn test_7() {
        let allocator = fixed(16, 4);
        let other = fixed(16, 4);
        let foreign = other.allocate().unwrap();
        unsafe { allocator.deallocate(foreign) };
    }

    #[test]
    fn test_8() {
        // Drop returns every page to the backing store.
        let backing = CountingBacking::new();
        {
            let allocator = FixedAllocator::with_backing(
                64,
                GrowthPolicy::Quadratic { base: 1 },
                backing.clone(),
            );
            for _ in 0..6 {
                allocator.allocate().unwrap();
            }
            assert!(backing.outstanding() > 0);
        }
        assert_eq!(backing.outstanding(), 0);
    }

    #[test]
    fn test_9() {
        // Record addresses honor the alignment the layout asked for.
        let layout = Layout::from_size_align(24, 32).unwrap();
        let allocator = FixedAllocator::for_layout(
            layout,
            GrowthPolicy::FixedSize { records: 8 },
            CountingBacking::new(),
        );
        assert_eq!(allocator.stride(), 32);
        for _ in 0..12 {
            let ptr = allocator.allocate().unwrap();
            assert_eq!(ptr.as_ptr() as usize % 32, 0);
        }
    }
}
