//! # Lock primitives for the physical memory resource engine
//!
//! Two raw lock flavours back a single generic [`Mutex`]:
//!
//! * [`RawSpin`]: test-and-test-and-set, for critical sections that only
//!   touch a counter or a bitset ([`SpinMutex`]).
//! * [`RawTicket`]: FIFO ticket lock, for structural locks that may be held
//!   across short backend calls ([`TicketMutex`]).
//!
//! [`Mutex::lock_nested`] annotates the nesting level when two locks of the
//! same class are held at once (for example the resource locks of two
//! different PMRs). [`MutexGuard::unlocked`] drops the raw lock for the
//! duration of a closure, which is how waiters give way to the thread they
//! are waiting for.
//!
//! [`Completion`] is a reusable event that one side signals and the other
//! spins on.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod completion;
mod mutex;
mod raw_spin;
mod raw_ticket;

pub use completion::Completion;
pub use mutex::{MAX_NESTING_LEVEL, Mutex, MutexGuard};
pub use raw_spin::RawSpin;
pub use raw_ticket::RawTicket;

pub type SpinMutex<T> = Mutex<T, RawSpin>;
pub type TicketMutex<T> = Mutex<T, RawTicket>;

pub type SpinMutexGuard<'a, T> = MutexGuard<'a, T, RawSpin>;
pub type TicketMutexGuard<'a, T> = MutexGuard<'a, T, RawTicket>;

impl<T> SpinMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawSpin::new(), value)
    }
}

impl<T> TicketMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawTicket::new(), value)
    }
}

impl<T: Default> Default for SpinMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Default> Default for TicketMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

pub trait RawLock {
    fn raw_lock(&self);
    fn raw_try_lock(&self) -> bool;
    fn raw_is_locked(&self) -> bool;
}

pub trait RawUnlock {
    /// # Safety
    /// The caller must currently hold the lock.
    unsafe fn raw_unlock(&self);
}
