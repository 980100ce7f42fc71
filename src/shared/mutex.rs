//! The guard around a [`SegFit`](crate::SegFit) inside a
//! [`SharedSegFit`](crate::SharedSegFit).
//!
//! Every `Allocator` call locks, runs one heap operation, and unlocks.

use core::{
    cell::{Cell, UnsafeCell},
    hint,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

/// Serializes access to the heap behind a [`SharedSegFit`](crate::SharedSegFit).
///
/// A heap only used from one thread, for example by the collections of a
/// single task, can use [`SingleThreadedLock`]. A heap shared between threads
/// needs a `Sync` lock such as [`SpinLock`], or one built on the platform's
/// own primitives.
///
/// # Safety
///
/// * A `Sync` lock makes the `SharedSegFit` `Sync`, so `lock` must then give
///   true mutual exclusion across threads.
///
/// * `lock` must never return while the lock is already held, even on a
///   single thread. A re-entrant call would otherwise hold two `&mut SegFit`
///   at once.
pub unsafe trait Lock {
    /// Acquire the lock. Panic, abort, or wait while it is held.
    fn lock(&self);

    /// Release a lock acquired with [`Lock::lock`].
    fn unlock(&self);
}

/// A [`Lock`] for heaps that never leave their thread.
///
/// It only checks for re-entry: allocating while the heap is already locked
/// panics with "allocator re-entered while locked". It is not `Sync`.
#[derive(Debug, Default)]
pub struct SingleThreadedLock {
    locked: Cell<bool>,
}

impl SingleThreadedLock {
    /// An unlocked lock, usable in a `static` or `const`.
    #[inline]
    pub const fn new() -> Self {
        SingleThreadedLock {
            locked: Cell::new(false),
        }
    }
}

unsafe impl Lock for SingleThreadedLock {
    #[inline]
    fn lock(&self) {
        assert!(!self.locked.get(), "allocator re-entered while locked");
        self.locked.set(true);
    }

    #[inline]
    fn unlock(&self) {
        assert!(self.locked.get());
        self.locked.set(false);
    }
}

/// A test-and-test-and-set spin lock, for heaps shared between threads.
///
/// Heap operations are short, so waiters spin rather than park. Re-entry
/// from the holding thread spins forever.
#[derive(Debug, Default)]
pub struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    /// An unlocked lock, usable in a `static` or `const`.
    #[inline]
    pub const fn new() -> Self {
        SpinLock {
            locked: AtomicBool::new(false),
        }
    }
}

unsafe impl Lock for SpinLock {
    #[inline]
    fn lock(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
    }

    #[inline]
    fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

pub(super) struct Mutex<T, L> {
    lock: L,
    value: UnsafeCell<T>,
}

// Safety: the mutex owns its value and its lock outright; moving it moves
// both.
unsafe impl<T, L> Send for Mutex<T, L>
where
    T: Send,
    L: Send,
{
}

// Safety: a `Sync` lock excludes concurrent guards by contract. `T: Send`
// because a guard on another thread is a `&mut T` over there.
unsafe impl<T, L> Sync for Mutex<T, L>
where
    T: Send,
    L: Sync + Lock,
{
}

impl<T, L> Mutex<T, L>
where
    L: Lock,
{
    pub(super) const fn new(value: T, lock: L) -> Self {
        Mutex {
            lock,
            value: UnsafeCell::new(value),
        }
    }

    pub(super) fn lock(&self) -> MutexGuard<'_, T, L> {
        self.lock.lock();
        MutexGuard { mutex: self }
    }

    pub(super) fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    pub(super) fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

pub(super) struct MutexGuard<'a, T, L>
where
    L: Lock,
{
    mutex: &'a Mutex<T, L>,
}

impl<T, L> Drop for MutexGuard<'_, T, L>
where
    L: Lock,
{
    fn drop(&mut self) {
        self.mutex.lock.unlock();
    }
}

impl<T, L> Deref for MutexGuard<'_, T, L>
where
    L: Lock,
{
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        // Safety: the lock is held for as long as the guard lives.
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T, L> DerefMut for MutexGuard<'_, T, L>
where
    L: Lock,
{
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        // Safety: as above, and the guard is borrowed exclusively.
        unsafe { &mut *self.mutex.value.get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_releases_on_drop() {
        let mutex = Mutex::new(1u32, SingleThreadedLock::new());
        {
            let mut guard = mutex.lock();
            *guard += 1;
        }
        assert_eq!(*mutex.lock(), 2);
    }

    #[test]
    #[should_panic(expected = "re-entered")]
    fn single_threaded_lock_rejects_recursion() {
        let mutex = Mutex::new((), SingleThreadedLock::new());
        let _a = mutex.lock();
        let _b = mutex.lock();
    }

    #[test]
    fn spin_lock_round_trip() {
        let lock = SpinLock::new();
        lock.lock();
        assert!(lock.locked.load(Ordering::Relaxed));
        lock.unlock();
        lock.lock();
        lock.unlock();
    }
}
