//! A small-object pooling allocator written in Rust.
//!
//! General-purpose allocators pay a search-and-bookkeeping cost on every
//! call. When a program allocates the same small sizes over and over —
//! nodes, handles, messages — that cost dominates. This crate groups
//! same-size requests into *pages* of contiguous pre-sliced *records* so
//! that the common allocate/deallocate pair is a pointer pop and push.
//!
//! # Usage
//! ```
//! use pooled_malloc::{PurgePolicy, SmallObjAllocator};
//!
//! let pool = SmallObjAllocator::new(256, PurgePolicy::Manual);
//!
//! let record = pool.allocate(24).unwrap();
//! // ... use the 24 bytes at `record` ...
//! unsafe { pool.deallocate(record) };
//!
//! // Hand fully-empty pages back to the backing store.
//! pool.purge();
//! ```
//!
//! # Mode of operation
//! A request for *N* bytes is routed to the [`FixedAllocator`] serving the
//! narrowest fitting size class. That allocator finds a page with a free
//! record — a cached hint makes this *O*(1) in the common case — or grows
//! by creating a new page, sized by its [`GrowthPolicy`]. The page pops a
//! slot off the free list threaded through its unused records and returns
//! the address. Deallocation reverses the path purely from the pointer's
//! address: a directory keyed by page base address recovers the owning
//! class, and the record is pushed back onto its page's free list.
//!
//! Fully-empty pages are reclaimed according to the [`PurgePolicy`]:
//! eagerly under `Auto`, or only on explicit [`purge`] under `Manual`.
//! [`ManualPurgeScope`] suppresses auto-reclaim for the extent of a batch.
//!
//! # Components
//! - [`FixedAllocator`] — a page chain for exactly one record size.
//! - [`SmallObjAllocator`] — the size-class facade, single-threaded fast
//!   path.
//! - [`SyncSmallObjAllocator`] — the thread-safe wrapper: one mutex per
//!   size class, a reader/writer-locked page directory, and per-thread
//!   magazine caches ([`global_pool`] is a process-wide instance).
//! - [`ReentrantReadWriteLock`] — the writer-preference reader/writer lock
//!   the wrapper builds on, usable on its own.
//! - [`variadic_allocator!`] / [`SubAllocated`] — compile-time binding of
//!   concrete types to pooled storage.
//! - [`BackingAlloc`] — the seam to the general allocator that supplies
//!   page blocks ([`SystemBacking`] for the process heap, [`MmapBacking`]
//!   for OS pages on unix).
//!
//! # Oversized and over-aligned requests
//! The pool is deliberately not a general heap. Requests above the
//! configured ceiling — or aligned requests beyond [`MAX_SUPPORTED_ALIGN`]
//! — fail with [`AllocError::SizeNotSupported`], signaling the caller to
//! fall back to a general-purpose allocator.
//!
//! # Thread safety
//! [`SmallObjAllocator`] and [`FixedAllocator`] are `!Sync` on purpose:
//! sharing them across threads without external synchronization does not
//! compile. [`SyncSmallObjAllocator`] is the shareable flavor; calls on one
//! size class are linearized, calls on different classes proceed
//! concurrently. Threads that used a sync pool must call
//! [`SyncSmallObjAllocator::leave_thread`] before terminating.
//!
//! [`purge`]: SmallObjAllocator::purge

pub use crate::backing::{BackingAlloc, SystemBacking};
#[cfg(unix)]
pub use crate::backing::MmapBacking;
pub use crate::error::AllocError;
pub use crate::fixed::FixedAllocator;
pub use crate::policy::{
    GrowthPolicy, ManualPurgeScope, PurgePolicy, PurgePolicyHost, MAX_PAGE_RECORDS,
};
pub use crate::rwlock::{
    CancelToken, ReadGuard, ReadHalf, ReentrantReadWriteLock, WriteGuard, WriteHalf,
};
pub use crate::small_obj::{SmallObjAllocator, DEFAULT_MAX_OBJECT_SIZE, MAX_SUPPORTED_ALIGN};
pub use crate::sync::{global_pool, SyncSmallObjAllocator};
pub use crate::typed::{PoolFor, SubAllocated};

mod backing;
mod error;
mod fixed;
mod page;
mod policy;
mod rwlock;
mod small_obj;
mod sync;
mod typed;
mod util;
