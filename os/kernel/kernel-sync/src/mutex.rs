use crate::{RawLock, RawUnlock};
use core::cell::UnsafeCell;
use core::fmt;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU8, Ordering};

/// Highest nesting level accepted by [`Mutex::lock_nested`].
pub const MAX_NESTING_LEVEL: u8 = 7;

/// Data protected by a raw lock word `R`.
pub struct Mutex<T, R> {
    raw: R,
    /// Nesting level the current holder acquired the lock at.
    level: AtomicU8,
    cell: UnsafeCell<T>,
    _no_send_sync: PhantomData<*mut ()>, // !Send/!Sync by default; we implement below
}

unsafe impl<T: Send, R: Sync> Sync for Mutex<T, R> {}
unsafe impl<T: Send, R: Send> Send for Mutex<T, R> {}

impl<T, R> Mutex<T, R> {
    pub const fn from_raw(raw: R, value: T) -> Self {
        Self {
            raw,
            level: AtomicU8::new(0),
            cell: UnsafeCell::new(value),
            _no_send_sync: PhantomData,
        }
    }

    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.cell.get_mut()
    }

    #[inline]
    pub fn into_inner(self) -> T {
        self.cell.into_inner()
    }
}

impl<T, R> Mutex<T, R>
where
    R: RawLock + RawUnlock,
{
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, T, R> {
        self.lock_nested(0)
    }

    /// Acquire the lock while (possibly) holding another lock of the same
    /// class at a lower `level`.
    ///
    /// The level is an annotation only; lock ordering between instances is
    /// the caller's responsibility.
    #[inline]
    pub fn lock_nested(&self, level: u8) -> MutexGuard<'_, T, R> {
        debug_assert!(level <= MAX_NESTING_LEVEL, "nesting level {level} too deep");
        self.raw.raw_lock();
        self.level.store(level, Ordering::Relaxed);
        MutexGuard { m: self }
    }

    #[inline]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T, R>> {
        if self.raw.raw_try_lock() {
            self.level.store(0, Ordering::Relaxed);
            Some(MutexGuard { m: self })
        } else {
            None
        }
    }

    /// Snapshot of the lock state; only meaningful for assertions.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.raw.raw_is_locked()
    }

    /// Run `f` with the lock held.
    #[inline]
    pub fn with_lock<U>(&self, f: impl FnOnce(&mut T) -> U) -> U {
        let mut guard = self.lock();
        f(&mut guard)
    }
}

impl<T: fmt::Debug, R> fmt::Debug for Mutex<T, R>
where
    R: RawLock + RawUnlock,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("Mutex").field("data", &&*guard).finish(),
            None => f.debug_struct("Mutex").field("data", &"<locked>").finish(),
        }
    }
}

pub struct MutexGuard<'a, T, R>
where
    R: RawUnlock,
{
    m: &'a Mutex<T, R>,
}

impl<T, R> MutexGuard<'_, T, R>
where
    R: RawLock + RawUnlock,
{
    /// Nesting level this guard was acquired at.
    #[inline]
    #[must_use]
    pub fn nesting_level(this: &Self) -> u8 {
        this.m.level.load(Ordering::Relaxed)
    }

    /// Release the lock while `f` runs, then take it back at the same
    /// nesting level.
    ///
    /// The protected data may have changed by the time this returns.
    pub fn unlocked<U>(this: &mut Self, f: impl FnOnce() -> U) -> U {
        struct Relock<'r, T, R: RawLock> {
            m: &'r Mutex<T, R>,
            level: u8,
        }

        impl<T, R: RawLock> Drop for Relock<'_, T, R> {
            fn drop(&mut self) {
                self.m.raw.raw_lock();
                self.m.level.store(self.level, Ordering::Relaxed);
            }
        }

        let level = Self::nesting_level(this);
        // SAFETY: the guard proves we hold the lock; `Relock` takes it back
        // before the guard can be used or dropped again, even if `f` unwinds.
        unsafe { this.m.raw.raw_unlock() };
        let _relock = Relock { m: this.m, level };
        f()
    }
}

impl<T, R> Deref for MutexGuard<'_, T, R>
where
    R: RawUnlock,
{
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.m.cell.get() }
    }
}

impl<T, R> DerefMut for MutexGuard<'_, T, R>
where
    R: RawUnlock,
{
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.m.cell.get() }
    }
}

impl<T, R> Drop for MutexGuard<'_, T, R>
where
    R: RawUnlock,
{
    fn drop(&mut self) {
        unsafe { self.m.raw.raw_unlock() }
    }
}
