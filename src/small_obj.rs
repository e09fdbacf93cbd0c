//! The [`SmallObjAllocator`]: a facade over one [`FixedAllocator`] per size
//! class, with address-only deallocation.

use core::cell::{Cell, RefCell};
use core::ptr::NonNull;
use std::collections::BTreeMap;

use tracing::instrument;

use crate::backing::{BackingAlloc, SystemBacking};
use crate::error::AllocError;
use crate::fixed::FixedAllocator;
use crate::page::{PAGE_BASE_ALIGN, RECORD_QUANTUM};
use crate::policy::{GrowthPolicy, PurgePolicy, PurgePolicyHost};
use crate::util::round_up;

/// Target byte size of a freshly created page; each size class derives its
/// default per-page record count from this.
pub(crate) const DEFAULT_PAGE_BYTES: usize = 4096;

/// Largest record size served by [`crate::global_pool`].
pub const DEFAULT_MAX_OBJECT_SIZE: usize = 256;

/// Strictest alignment the size-class facade can honor. Stricter requests
/// are reported [`AllocError::SizeNotSupported`] so the caller falls back to
/// a general allocator.
pub const MAX_SUPPORTED_ALIGN: usize = PAGE_BASE_ALIGN;

/// Directory value: which size class owns the page starting at the key.
#[derive(Copy, Clone, Debug)]
pub(crate) struct PageOwner {
    pub(crate) class: u32,
    pub(crate) bytes: usize,
}

/// Looks up the class owning `addr` in a page directory keyed by page base
/// address. Shared by the unsync facade and the thread-safe wrapper.
pub(crate) fn directory_lookup(
    directory: &BTreeMap<usize, PageOwner>,
    addr: usize,
) -> Option<u32> {
    let (base, owner) = directory.range(..=addr).next_back()?;
    (addr < base + owner.bytes).then_some(owner.class)
}

/// Default growth for the class serving `stride`-byte records.
pub(crate) fn default_growth(stride: usize) -> GrowthPolicy {
    let records = (DEFAULT_PAGE_BYTES / stride).max(1);
    GrowthPolicy::FixedSize {
        records: records.min(u32::MAX as usize) as u32,
    }
}

/// Maps a request to its size class parameters, shared with the sync
/// wrapper. Returns the class index, or the error the facade must report.
pub(crate) fn class_index(size: usize, ceiling: usize) -> Result<usize, AllocError> {
    let size = size.max(1);
    if size > ceiling {
        return Err(AllocError::SizeNotSupported {
            requested: size,
            ceiling,
        });
    }
    Ok(size - 1)
}

/// Effective class size for an aligned request, or the error to report.
pub(crate) fn aligned_class_size(
    size: usize,
    align: usize,
    ceiling: usize,
) -> Result<usize, AllocError> {
    if !align.is_power_of_two() {
        return Err(AllocError::InvalidAlignment(align));
    }
    if align <= RECORD_QUANTUM {
        return Ok(size.max(1));
    }
    let effective = round_up(size.max(1), align).unwrap_or(usize::MAX);
    if align > MAX_SUPPORTED_ALIGN || effective > ceiling {
        return Err(AllocError::SizeNotSupported {
            requested: effective,
            ceiling,
        });
    }
    Ok(effective)
}

/// Builds the per-class allocator array for `1..=ceiling` byte records.
pub(crate) fn build_classes<B: BackingAlloc + Clone>(
    ceiling: usize,
    policy: PurgePolicy,
    backing: &B,
) -> Vec<FixedAllocator<B>> {
    assert!(ceiling >= 1, "max_object_size must be at least 1");
    (1..=ceiling)
        .map(|size| {
            let allocator = FixedAllocator::with_backing(
                size,
                default_growth(round_up(size.max(RECORD_QUANTUM), RECORD_QUANTUM).unwrap()),
                backing.clone(),
            );
            allocator.set_purge_policy(policy);
            allocator
        })
        .collect()
}

/// A pooling facade for frequent small fixed-size allocations.
///
/// Requests of `1..=max_object_size` bytes are routed to the
/// [`FixedAllocator`] of the narrowest fitting size class; larger requests
/// are rejected with [`AllocError::SizeNotSupported`] so the caller can fall
/// back to a general-purpose allocator. Deallocation needs only the address:
/// a directory keyed by page base address maps it back to the owning class.
///
/// This is the non-thread-safe fast path. It is `!Sync` by construction;
/// share [`SyncSmallObjAllocator`](crate::SyncSmallObjAllocator) across
/// threads instead.
pub struct SmallObjAllocator<B: BackingAlloc + Clone = SystemBacking> {
    classes: Box<[FixedAllocator<B>]>,
    directory: RefCell<BTreeMap<usize, PageOwner>>,
    max_object_size: usize,
    policy: Cell<PurgePolicy>,
}

impl SmallObjAllocator<SystemBacking> {
    /// Creates a facade serving records of `1..=max_object_size` bytes from
    /// the process heap.
    pub fn new(max_object_size: usize, policy: PurgePolicy) -> Self {
        Self::with_backing(max_object_size, policy, SystemBacking)
    }
}

impl<B: BackingAlloc + Clone> SmallObjAllocator<B> {
    /// As [`SmallObjAllocator::new`], with an explicit backing store. Every
    /// size class clones `backing`, so stores shared between classes should
    /// be handle-like (`Copy` or reference-counted).
    pub fn with_backing(max_object_size: usize, policy: PurgePolicy, backing: B) -> Self {
        SmallObjAllocator {
            classes: build_classes(max_object_size, policy, &backing).into_boxed_slice(),
            directory: RefCell::new(BTreeMap::new()),
            max_object_size,
            policy: Cell::new(policy),
        }
    }

    /// Returns a record of at least `size` bytes with no construction.
    /// A `size` of 0 is treated as 1: a technically-valid request never
    /// yields a non-allocation.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let class = class_index(size, self.max_object_size)?;
        let (ptr, span) = self.classes[class].allocate_reporting()?;
        if let Some(span) = span {
            self.directory.borrow_mut().insert(
                span.base,
                PageOwner {
                    class: class as u32,
                    bytes: span.bytes,
                },
            );
        }
        Ok(ptr)
    }

    /// As [`allocate`], with the returned address guaranteed to satisfy
    /// `align`, which must be a power of two. Alignments above
    /// [`MAX_SUPPORTED_ALIGN`] are reported as unsupported.
    ///
    /// [`allocate`]: SmallObjAllocator::allocate
    pub fn allocate_aligned(&self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
        let effective = aligned_class_size(size, align, self.max_object_size)?;
        let ptr = self.allocate(effective)?;
        debug_assert_eq!(ptr.as_ptr() as usize % align, 0);
        Ok(ptr)
    }

    /// Returns the record at `ptr` to its owning page, located purely from
    /// the address.
    ///
    /// # Safety
    /// `ptr` must have been returned by [`allocate`] on this exact instance
    /// and not deallocated since.
    ///
    /// [`allocate`]: SmallObjAllocator::allocate
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        let addr = ptr.as_ptr() as usize;
        let class = {
            let directory = self.directory.borrow();
            directory_lookup(&directory, addr)
        };
        let Some(class) = class else {
            panic!("address passed to deallocate does not belong to this allocator");
        };
        if let Some(span) = self.classes[class as usize].deallocate_reporting(ptr) {
            self.directory.borrow_mut().remove(&span.base);
        }
    }

    /// Counterpart of [`allocate_aligned`]. Plain and aligned calls must be
    /// paired with their matching deallocation; mixing them on one pointer
    /// is undefined.
    ///
    /// # Safety
    /// As [`deallocate`], for pointers from [`allocate_aligned`].
    ///
    /// [`allocate_aligned`]: SmallObjAllocator::allocate_aligned
    /// [`deallocate`]: SmallObjAllocator::deallocate
    pub unsafe fn deallocate_aligned(&self, ptr: NonNull<u8>) {
        self.deallocate(ptr);
    }

    /// Releases every fully-empty page in every size class. Idempotent.
    #[instrument(level = "debug", skip(self))]
    pub fn purge(&self) -> usize {
        let mut directory = self.directory.borrow_mut();
        self.classes
            .iter()
            .map(|class| {
                class.purge_reporting(|span| {
                    directory.remove(&span.base);
                })
            })
            .sum()
    }

    /// Total bytes currently reserved across all owned pages. Diagnostic
    /// only.
    pub fn reserved_bytes(&self) -> usize {
        self.classes.iter().map(FixedAllocator::reserved_bytes).sum()
    }

    /// Largest record size this facade serves.
    #[inline]
    pub fn max_object_size(&self) -> usize {
        self.max_object_size
    }
}

impl<B: BackingAlloc + Clone> PurgePolicyHost for SmallObjAllocator<B> {
    fn purge_policy(&self) -> PurgePolicy {
        self.policy.get()
    }

    fn set_purge_policy(&self, policy: PurgePolicy) {
        self.policy.set(policy);
        for class in self.classes.iter() {
            class.set_purge_policy(policy);
        }
    }
}
