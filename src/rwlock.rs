//! The [`ReentrantReadWriteLock`]: a multi-reader / single-writer lock with
//! writer-preference starvation avoidance.
//!
//! Built on the platform's mutex and condition primitives
//! ([`std::sync::Mutex`] / [`std::sync::Condvar`]). The lock itself holds no
//! data; callers guard their shared state with the RAII guards returned by
//! the read-side and write-side views.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// How often an interruptible wait rechecks its [`CancelToken`].
const CANCEL_POLL: Duration = Duration::from_millis(5);

/// Cooperative cancellation signal for [`try_acquire`] waits.
///
/// Cancelling is sticky: once set, every wait observing the token gives up.
/// Share one token across threads by reference (or in an `Arc`).
///
/// [`try_acquire`]: ReadHalf::try_acquire
#[derive(Debug, Default)]
pub struct CancelToken {
    flag: AtomicBool,
}

impl CancelToken {
    pub const fn new() -> Self {
        CancelToken {
            flag: AtomicBool::new(false),
        }
    }

    /// Aborts every in-progress and future interruptible wait on this token.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
struct LockState {
    active_readers: u32,
    waiting_writers: u32,
    writer_active: bool,
}

impl LockState {
    /// Whether a new reader may be admitted. Waiting writers block new
    /// readers so a stream of readers cannot starve a writer.
    fn admits_reader(&self) -> bool {
        !self.writer_active && self.waiting_writers == 0
    }

    /// Whether a registered writer may proceed.
    fn admits_writer(&self) -> bool {
        !self.writer_active && self.active_readers == 0
    }
}

/// A multi-reader / single-writer lock.
///
/// At most one writer holds the lock at a time and never concurrently with
/// any reader. Once a writer starts waiting, new readers are held back until
/// that writer has acquired and released. Releasing a write acquisition
/// wakes one waiting writer if any, otherwise all waiting readers.
#[derive(Debug)]
pub struct ReentrantReadWriteLock {
    state: Mutex<LockState>,
    readers: Condvar,
    writers: Condvar,
}

impl ReentrantReadWriteLock {
    pub const fn new() -> Self {
        ReentrantReadWriteLock {
            state: Mutex::new(LockState {
                active_readers: 0,
                waiting_writers: 0,
                writer_active: false,
            }),
            readers: Condvar::new(),
            writers: Condvar::new(),
        }
    }

    /// The read-side view of this lock.
    pub fn read(&self) -> ReadHalf<'_> {
        ReadHalf { lock: self }
    }

    /// The write-side view of this lock.
    pub fn write(&self) -> WriteHalf<'_> {
        WriteHalf { lock: self }
    }

    #[cfg(test)]
    pub(crate) fn waiting_writers(&self) -> u32 {
        self.state.lock().unwrap().waiting_writers
    }

    /// Waits on `condvar` until `admit` passes, the deadline expires, or the
    /// token is cancelled. Returns the guard-ready state on success.
    fn wait_until<'a>(
        &'a self,
        condvar: &Condvar,
        mut state: std::sync::MutexGuard<'a, LockState>,
        admit: impl Fn(&LockState) -> bool,
        deadline: Option<Instant>,
        cancel: Option<&CancelToken>,
    ) -> Option<std::sync::MutexGuard<'a, LockState>> {
        while !admit(&state) {
            if cancel.is_some_and(CancelToken::is_cancelled) {
                return None;
            }
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    let mut wait = deadline - now;
                    if cancel.is_some() {
                        wait = wait.min(CANCEL_POLL);
                    }
                    wait
                }
                // No deadline: only the cancellation token can end the wait.
                None => CANCEL_POLL,
            };
            state = condvar.wait_timeout(state, wait).unwrap().0;
        }
        Some(state)
    }
}

impl Default for ReentrantReadWriteLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-side handle; acquisitions may overlap with other readers.
#[derive(Copy, Clone, Debug)]
pub struct ReadHalf<'a> {
    lock: &'a ReentrantReadWriteLock,
}

impl<'a> ReadHalf<'a> {
    /// Blocks until no writer holds or waits on the lock.
    pub fn acquire(&self) -> ReadGuard<'a> {
        let mut state = self.lock.state.lock().unwrap();
        while !state.admits_reader() {
            state = self.lock.readers.wait(state).unwrap();
        }
        state.active_readers += 1;
        ReadGuard { lock: self.lock }
    }

    /// As [`acquire`], giving up after `timeout` or when `cancel` fires.
    /// A failed attempt has no side effects.
    ///
    /// [`acquire`]: ReadHalf::acquire
    pub fn try_acquire(
        &self,
        timeout: Duration,
        cancel: Option<&CancelToken>,
    ) -> Option<ReadGuard<'a>> {
        let deadline = Instant::now().checked_add(timeout);
        let state = self.lock.state.lock().unwrap();
        let mut state =
            self.lock
                .wait_until(&self.lock.readers, state, LockState::admits_reader, deadline, cancel)?;
        state.active_readers += 1;
        Some(ReadGuard { lock: self.lock })
    }
}

/// Write-side handle; acquisitions are exclusive.
#[derive(Copy, Clone, Debug)]
pub struct WriteHalf<'a> {
    lock: &'a ReentrantReadWriteLock,
}

impl<'a> WriteHalf<'a> {
    /// Blocks until every reader has drained and no other writer holds the
    /// lock. While blocked, the thread counts as a waiting writer and new
    /// readers are held back.
    pub fn acquire(&self) -> WriteGuard<'a> {
        let mut state = self.lock.state.lock().unwrap();
        state.waiting_writers += 1;
        while !state.admits_writer() {
            state = self.lock.writers.wait(state).unwrap();
        }
        state.waiting_writers -= 1;
        state.writer_active = true;
        WriteGuard { lock: self.lock }
    }

    /// As [`acquire`], giving up after `timeout` or when `cancel` fires.
    /// A failed attempt unregisters the writer and has no lasting effects.
    ///
    /// [`acquire`]: WriteHalf::acquire
    pub fn try_acquire(
        &self,
        timeout: Duration,
        cancel: Option<&CancelToken>,
    ) -> Option<WriteGuard<'a>> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.lock.state.lock().unwrap();
        state.waiting_writers += 1;
        match self
            .lock
            .wait_until(&self.lock.writers, state, LockState::admits_writer, deadline, cancel)
        {
            Some(mut state) => {
                state.waiting_writers -= 1;
                state.writer_active = true;
                Some(WriteGuard { lock: self.lock })
            }
            None => {
                let mut state = self.lock.state.lock().unwrap();
                state.waiting_writers -= 1;
                // Readers held back only by this writer can run again.
                if state.waiting_writers == 0 && !state.writer_active {
                    self.lock.readers.notify_all();
                }
                None
            }
        }
    }
}

/// RAII guard for one read acquisition.
#[must_use = "the read acquisition is released when the guard drops"]
#[derive(Debug)]
pub struct ReadGuard<'a> {
    lock: &'a ReentrantReadWriteLock,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock().unwrap();
        state.active_readers -= 1;
        if state.active_readers == 0 && state.waiting_writers > 0 {
            self.lock.writers.notify_one();
        }
    }
}

/// RAII guard for the single write acquisition.
#[must_use = "the write acquisition is released when the guard drops"]
#[derive(Debug)]
pub struct WriteGuard<'a> {
    lock: &'a ReentrantReadWriteLock,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock().unwrap();
        state.writer_active = false;
        if state.waiting_writers > 0 {
            self.lock.writers.notify_one();
        } else {
            self.lock.readers.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_1() {
        // Readers overlap freely when no writer is involved.
        let lock = ReentrantReadWriteLock::new();
        let a = lock.read().acquire();
        let b = lock.read().acquire();
        assert!(lock.read().try_acquire(Duration::ZERO, None).is_some());
        drop(a);
        drop(b);
    }

    #[test]
    fn test_2() {
        // A held write acquisition excludes readers and writers.
        let lock = ReentrantReadWriteLock::new();
        let guard = lock.write().acquire();
        assert!(lock
            .read()
            .try_acquire(Duration::from_millis(10), None)
            .is_none());
        assert!(lock
            .write()
            .try_acquire(Duration::from_millis(10), None)
            .is_none());
        drop(guard);
        let _ = lock.read().acquire();
    }

    #[test]
    fn test_3() {
        // Two threads race for the write side: exactly one succeeds
        // immediately, the other blocks until the first releases.
        let lock = Arc::new(ReentrantReadWriteLock::new());
        let order = Arc::new(AtomicUsize::new(0));

        let first = lock.write().acquire();
        let contender = {
            let lock = Arc::clone(&lock);
            let order = Arc::clone(&order);
            thread::spawn(move || {
                let _guard = lock.write().acquire();
                // Must observe the release marker set by the main thread.
                assert_eq!(order.load(Ordering::SeqCst), 1);
            })
        };

        while lock.waiting_writers() == 0 {
            thread::yield_now();
        }
        order.store(1, Ordering::SeqCst);
        drop(first);
        contender.join().unwrap();
    }

    #[test]
    fn test_4() {
        // Writer preference: once a writer waits, new readers are held back
        // until it has acquired and released.
        let lock = Arc::new(ReentrantReadWriteLock::new());
        let reader = lock.read().acquire();

        let writer = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                let _guard = lock.write().acquire();
                thread::sleep(Duration::from_millis(20));
            })
        };
        while lock.waiting_writers() == 0 {
            thread::yield_now();
        }

        // The waiting writer blocks this new reader.
        assert!(lock
            .read()
            .try_acquire(Duration::from_millis(20), None)
            .is_none());

        drop(reader);
        writer.join().unwrap();
        assert!(lock.read().try_acquire(Duration::ZERO, None).is_some());
    }

    #[test]
    fn test_5() {
        // A timed-out write attempt leaves no trace.
        let lock = ReentrantReadWriteLock::new();
        let reader = lock.read().acquire();
        assert!(lock
            .write()
            .try_acquire(Duration::from_millis(10), None)
            .is_none());
        assert_eq!(lock.waiting_writers(), 0);
        // Readers are admitted again right away.
        assert!(lock.read().try_acquire(Duration::ZERO, None).is_some());
        drop(reader);
        let _ = lock.write().acquire();
    }

    #[test]
    fn test_6() {
        // Cancellation aborts a wait long before its timeout.
        let lock = Arc::new(ReentrantReadWriteLock::new());
        let token = Arc::new(CancelToken::new());
        let guard = lock.write().acquire();

        let waiter = {
            let lock = Arc::clone(&lock);
            let token = Arc::clone(&token);
            thread::spawn(move || {
                let started = Instant::now();
                let result = lock
                    .read()
                    .try_acquire(Duration::from_secs(60), Some(token.as_ref()));
                (result.is_none(), started.elapsed())
            })
        };

        thread::sleep(Duration::from_millis(30));
        token.cancel();
        let (cancelled, elapsed) = waiter.join().unwrap();
        assert!(cancelled);
        assert!(elapsed < Duration::from_secs(10));
        drop(guard);
    }

    #[test]
    fn test_7() {
        // No successful write acquisition overlaps any other acquisition.
        let lock = Arc::new(ReentrantReadWriteLock::new());
        let in_critical = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];

        for worker in 0..8 {
            let lock = Arc::clone(&lock);
            let in_critical = Arc::clone(&in_critical);
            handles.push(thread::spawn(move || {
                for _ in 0..200 {
                    if worker % 2 == 0 {
                        let _guard = lock.write().acquire();
                        assert_eq!(in_critical.fetch_add(100, Ordering::SeqCst), 0);
                        assert_eq!(in_critical.fetch_sub(100, Ordering::SeqCst), 100);
                    } else {
                        let _guard = lock.read().acquire();
                        let seen = in_critical.fetch_add(1, Ordering::SeqCst);
                        assert!(seen < 100, "reader admitted during a write");
                        in_critical.fetch_sub(1, Ordering::SeqCst);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
