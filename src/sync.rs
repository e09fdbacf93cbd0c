//! The [`SyncSmallObjAllocator`]: a thread-safe small-object pool.
//!
//! Each size class sits behind its own mutex, so calls on one class are
//! linearized while different classes proceed concurrently. The page
//! directory shared by all classes is guarded by the crate's
//! [`ReentrantReadWriteLock`]: deallocation lookups take the read side,
//! structural changes (page creation and release) take the write side.
//!
//! On top of the central pool every thread keeps a small magazine of
//! recently freed records per size class, so the common free-then-allocate
//! pattern runs without touching any lock. A thread that used this
//! allocator must call [`SyncSmallObjAllocator::leave_thread`] before it
//! terminates, returning its cached records to the central pool.

use core::cell::{RefCell, UnsafeCell};
use core::ptr::NonNull;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{LazyLock, Mutex};

use tracing::{debug, instrument};

use crate::backing::{BackingAlloc, SystemBacking};
use crate::error::AllocError;
use crate::fixed::FixedAllocator;
use crate::policy::{PurgePolicy, PurgePolicyHost};
use crate::rwlock::ReentrantReadWriteLock;
use crate::small_obj::{
    aligned_class_size, build_classes, class_index, directory_lookup, PageOwner,
    DEFAULT_MAX_OBJECT_SIZE,
};

/// Records a thread caches per size class before flushing to the central
/// pool.
const MAGAZINE_CAPACITY: usize = 32;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static MAGAZINES: RefCell<Vec<PoolMagazines>> = const { RefCell::new(Vec::new()) };
}

/// This thread's cached records for one allocator instance, keyed by the
/// instance's unique id so a dropped allocator's stale entries can never be
/// matched by a new one.
struct PoolMagazines {
    pool: u64,
    stacks: Vec<Vec<usize>>,
}

fn magazine_pop(pool: u64, class: usize) -> Option<usize> {
    MAGAZINES.with(|magazines| {
        let mut magazines = magazines.borrow_mut();
        let entry = magazines.iter_mut().find(|e| e.pool == pool)?;
        entry.stacks.get_mut(class)?.pop()
    })
}

/// Caches `addr`; on overflow returns the whole stack for a central flush.
fn magazine_push(pool: u64, classes: usize, class: usize, addr: usize) -> Option<Vec<usize>> {
    MAGAZINES.with(|magazines| {
        let mut magazines = magazines.borrow_mut();
        let entry = match magazines.iter_mut().position(|e| e.pool == pool) {
            Some(index) => &mut magazines[index],
            None => {
                magazines.push(PoolMagazines {
                    pool,
                    stacks: (0..classes).map(|_| Vec::new()).collect(),
                });
                magazines.last_mut().unwrap()
            }
        };
        let stack = &mut entry.stacks[class];
        stack.push(addr);
        (stack.len() > MAGAZINE_CAPACITY).then(|| core::mem::take(stack))
    })
}

fn magazine_take(pool: u64) -> Option<PoolMagazines> {
    MAGAZINES.with(|magazines| {
        let mut magazines = magazines.borrow_mut();
        let index = magazines.iter().position(|e| e.pool == pool)?;
        Some(magazines.swap_remove(index))
    })
}

/// Page directory shared by all size classes of one sync pool.
///
/// The map itself lives in an `UnsafeCell`; every access happens under the
/// appropriate side of the reader/writer lock.
struct Directory {
    lock: ReentrantReadWriteLock,
    map: UnsafeCell<BTreeMap<usize, PageOwner>>,
}

unsafe impl Send for Directory {}
unsafe impl Sync for Directory {}

impl Directory {
    fn new() -> Self {
        Directory {
            lock: ReentrantReadWriteLock::new(),
            map: UnsafeCell::new(BTreeMap::new()),
        }
    }

    fn lookup(&self, addr: usize) -> Option<u32> {
        let _guard = self.lock.read().acquire();
        directory_lookup(unsafe { &*self.map.get() }, addr)
    }

    fn insert(&self, base: usize, owner: PageOwner) {
        let _guard = self.lock.write().acquire();
        unsafe { &mut *self.map.get() }.insert(base, owner);
    }

    /// Removes the entry for `base` if it still belongs to `class`.
    ///
    /// A released page's address range can be reacquired by another class
    /// before the releasing class gets here; the class check keeps a stale
    /// remove from deleting the new owner's entry. Within one class the
    /// release and the remove run under the same class mutex, so a
    /// same-class reacquire cannot slip in between.
    fn remove(&self, base: usize, class: u32) {
        let _guard = self.lock.write().acquire();
        let map = unsafe { &mut *self.map.get() };
        if map.get(&base).is_some_and(|owner| owner.class == class) {
            map.remove(&base);
        }
    }
}

/// A small-object pool that may be shared freely across threads.
///
/// The locking contract follows the non-thread-safe
/// [`SmallObjAllocator`](crate::SmallObjAllocator) API exactly; see the
/// module docs for what runs concurrently and what is linearized.
pub struct SyncSmallObjAllocator<B: BackingAlloc + Clone = SystemBacking> {
    classes: Box<[Mutex<FixedAllocator<B>>]>,
    directory: Directory,
    max_object_size: usize,
    policy: AtomicU8,
    id: u64,
}

impl SyncSmallObjAllocator<SystemBacking> {
    /// Creates a shareable pool serving records of `1..=max_object_size`
    /// bytes from the process heap.
    pub fn new(max_object_size: usize, policy: PurgePolicy) -> Self {
        Self::with_backing(max_object_size, policy, SystemBacking)
    }
}

impl<B: BackingAlloc + Clone> SyncSmallObjAllocator<B> {
    /// As [`SyncSmallObjAllocator::new`], with an explicit backing store.
    pub fn with_backing(max_object_size: usize, policy: PurgePolicy, backing: B) -> Self {
        let classes = build_classes(max_object_size, policy, &backing)
            .into_iter()
            .map(Mutex::new)
            .collect::<Vec<_>>()
            .into_boxed_slice();
        SyncSmallObjAllocator {
            classes,
            directory: Directory::new(),
            max_object_size,
            policy: AtomicU8::new(policy.as_u8()),
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Returns a record of at least `size` bytes. Size 0 is treated as 1;
    /// sizes above the ceiling are rejected with
    /// [`AllocError::SizeNotSupported`].
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let class = class_index(size, self.max_object_size)?;
        if let Some(addr) = magazine_pop(self.id, class) {
            // Magazine records were handed out by this pool, never null.
            return Ok(unsafe { NonNull::new_unchecked(addr as *mut u8) });
        }
        let fixed = self.classes[class].lock().unwrap();
        let (ptr, span) = fixed.allocate_reporting()?;
        if let Some(span) = span {
            // Published while the class lock pins the page: a record of the
            // new page cannot reach another thread's deallocate before the
            // directory knows the page.
            self.directory.insert(
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
    /// `align` (a power of two, at most
    /// [`MAX_SUPPORTED_ALIGN`](crate::MAX_SUPPORTED_ALIGN)).
    ///
    /// [`allocate`]: SyncSmallObjAllocator::allocate
    pub fn allocate_aligned(&self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
        let effective = aligned_class_size(size, align, self.max_object_size)?;
        let ptr = self.allocate(effective)?;
        debug_assert_eq!(ptr.as_ptr() as usize % align, 0);
        Ok(ptr)
    }

    /// Returns the record at `ptr` to the pool, located purely from the
    /// address. Under [`PurgePolicy::Manual`] the record is cached in the
    /// calling thread's magazine; under [`PurgePolicy::Auto`] it goes
    /// straight back to its page so an emptied page can be released.
    ///
    /// # Safety
    /// `ptr` must have been returned by [`allocate`] on this exact instance
    /// and not deallocated since.
    ///
    /// [`allocate`]: SyncSmallObjAllocator::allocate
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        let addr = ptr.as_ptr() as usize;
        let Some(class) = self.directory.lookup(addr) else {
            panic!("address passed to deallocate does not belong to this allocator");
        };
        let class = class as usize;

        if self.purge_policy() == PurgePolicy::Manual {
            if let Some(batch) = magazine_push(self.id, self.classes.len(), class, addr) {
                debug!(class, count = batch.len(), "Flushing magazine to central pool.");
                for cached in batch {
                    self.central_deallocate(class, NonNull::new_unchecked(cached as *mut u8));
                }
            }
        } else {
            self.central_deallocate(class, ptr);
        }
    }

    /// Counterpart of [`allocate_aligned`]; pairing is the caller's
    /// obligation.
    ///
    /// # Safety
    /// As [`deallocate`], for pointers from [`allocate_aligned`].
    ///
    /// [`allocate_aligned`]: SyncSmallObjAllocator::allocate_aligned
    /// [`deallocate`]: SyncSmallObjAllocator::deallocate
    pub unsafe fn deallocate_aligned(&self, ptr: NonNull<u8>) {
        self.deallocate(ptr);
    }

    unsafe fn central_deallocate(&self, class: usize, ptr: NonNull<u8>) {
        let fixed = self.classes[class].lock().unwrap();
        if let Some(span) = fixed.deallocate_reporting(ptr) {
            self.directory.remove(span.base, class as u32);
        }
    }

    /// Releases every fully-empty page in every size class. Records still
    /// sitting in thread magazines keep their pages live; flush them first
    /// with [`leave_thread`] for a maximal purge.
    ///
    /// [`leave_thread`]: SyncSmallObjAllocator::leave_thread
    #[instrument(level = "debug", skip(self))]
    pub fn purge(&self) -> usize {
        self.classes
            .iter()
            .enumerate()
            .map(|(index, class)| {
                let fixed = class.lock().unwrap();
                fixed.purge_reporting(|span| {
                    self.directory.remove(span.base, index as u32);
                })
            })
            .sum()
    }

    /// Flushes the calling thread's magazines for this pool back to the
    /// central allocators. Must be invoked on every thread that used this
    /// pool before that thread terminates; records cached by a thread that
    /// exits without this call are leaked until process exit.
    pub fn leave_thread(&self) {
        let Some(magazines) = magazine_take(self.id) else {
            return;
        };
        for (class, stack) in magazines.stacks.into_iter().enumerate() {
            for addr in stack {
                unsafe {
                    self.central_deallocate(class, NonNull::new_unchecked(addr as *mut u8))
                };
            }
        }
    }

    /// Total bytes currently reserved across all owned pages. Diagnostic
    /// only; classes are sampled one at a time.
    pub fn reserved_bytes(&self) -> usize {
        self.classes
            .iter()
            .map(|class| class.lock().unwrap().reserved_bytes())
            .sum()
    }

    /// Largest record size this pool serves.
    #[inline]
    pub fn max_object_size(&self) -> usize {
        self.max_object_size
    }
}

impl<B: BackingAlloc + Clone> PurgePolicyHost for SyncSmallObjAllocator<B> {
    fn purge_policy(&self) -> PurgePolicy {
        PurgePolicy::from_u8(self.policy.load(Ordering::Acquire))
    }

    fn set_purge_policy(&self, policy: PurgePolicy) {
        self.policy.store(policy.as_u8(), Ordering::Release);
        for class in self.classes.iter() {
            class.lock().unwrap().set_purge_policy(policy);
        }
    }
}

impl<B: BackingAlloc + Clone> Drop for SyncSmallObjAllocator<B> {
    fn drop(&mut self) {
        // Best effort for the dropping thread; other threads must have
        // called leave_thread already per the usage contract.
        self.leave_thread();
    }
}

static GLOBAL_OBJ_POOL: LazyLock<SyncSmallObjAllocator> =
    LazyLock::new(|| SyncSmallObjAllocator::new(DEFAULT_MAX_OBJECT_SIZE, PurgePolicy::Manual));

/// The process-wide shared pool: thread-safe, serving records up to
/// [`DEFAULT_MAX_OBJECT_SIZE`] bytes, initialized on first use and torn
/// down with the process. Callers needing isolation (or different tuning)
/// should construct their own [`SyncSmallObjAllocator`] and pass it through
/// call sites explicitly; the global exists as a default convenience
/// binding.
pub fn global_pool() -> &'static SyncSmallObjAllocator {
    &GLOBAL_OBJ_POOL
}
