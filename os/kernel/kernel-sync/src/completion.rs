use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// A reusable "it has happened" signal.
///
/// The signalling side calls [`complete_all`](Self::complete_all); waiters
/// spin in [`wait`](Self::wait) until they observe it. [`reinit`](Self::reinit)
/// arms the completion again for the next round.
///
/// A waiter that started waiting before a `complete_all` is released even if
/// the completion is re-armed before the waiter gets to look at it: every
/// completion bumps a generation counter that waiters compare against.
pub struct Completion {
    done: AtomicBool,
    generation: AtomicU32,
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

impl Completion {
    /// A completion that has not happened yet.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
            generation: AtomicU32::new(0),
        }
    }

    /// A completion that is already signalled.
    #[must_use]
    pub const fn completed() -> Self {
        Self {
            done: AtomicBool::new(true),
            generation: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn reinit(&self) {
        self.done.store(false, Ordering::Release);
    }

    #[inline]
    pub fn complete_all(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.done.store(true, Ordering::Release);
    }

    #[inline]
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Number of times [`complete_all`](Self::complete_all) ran.
    #[inline]
    #[must_use]
    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    /// Spin until the completion is signalled. No timeout.
    pub fn wait(&self) {
        let seen = self.generation();
        while !self.is_completed() && self.generation() == seen {
            spin_loop();
        }
    }
}
