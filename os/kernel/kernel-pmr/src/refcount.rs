//! # Reference, lock and map counters
//!
//! Every resource carries two liveness counters:
//!
//! * `refs`: general references. The resource is torn down when it drops to
//!   zero.
//! * `locks`: physical-address pins. Every pin is also a reference, so
//!   `refs >= locks - baseline` holds whenever no operation is in flight.
//!
//! Resources whose backing is allocated up front start with a lock baseline
//! of one (the allocation itself pins the pages); on-demand resources start at
//! zero and only have pages while somebody holds a lock.

use crate::error::PmrError;
use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use kernel_sync::SpinMutex;
use log::{error, warn};

pub struct PmrCounters {
    /// General references, behind the refcount spinlock.
    refs: SpinMutex<u32>,
    /// Physical-address pins, including the baseline.
    locks: AtomicU32,
    baseline: u32,
}

impl PmrCounters {
    /// Counters of a resource nobody references yet.
    #[must_use]
    pub const fn new(on_demand: bool) -> Self {
        let baseline = if on_demand { 0 } else { 1 };
        Self {
            refs: SpinMutex::new(0),
            locks: AtomicU32::new(baseline),
            baseline,
        }
    }

    #[inline]
    #[must_use]
    pub fn refs(&self) -> u32 {
        *self.refs.lock()
    }

    #[inline]
    #[must_use]
    pub fn locks(&self) -> u32 {
        self.locks.load(Ordering::Acquire)
    }

    /// Lock count of an idle resource: 0 for on-demand, 1 otherwise.
    #[inline]
    #[must_use]
    pub const fn lock_baseline(&self) -> u32 {
        self.baseline
    }

    /// Someone holds a physical-address lock beyond the baseline, or the
    /// pages are allocated up front.
    #[inline]
    #[must_use]
    pub fn is_backed(&self) -> bool {
        self.locks() > 0
    }

    /// Hand out the very first reference of a fresh resource.
    pub(crate) fn initialise(&self) {
        let mut refs = self.refs.lock();
        debug_assert_eq!(*refs, 0, "resource referenced before initialisation");
        *refs = 1;
    }

    /// Take `n` references; returns the new count.
    ///
    /// # Errors
    /// [`PmrError::RefcountOverflow`] if the resource is already dead (count
    /// zero) or the count would not fit. The counter is left untouched.
    pub fn take(&self, n: u32) -> Result<u32, PmrError> {
        let mut refs = self.refs.lock();
        if *refs == 0 {
            warn!("taking a reference on a resource with no references");
            return Err(PmrError::RefcountOverflow);
        }
        let new = refs.checked_add(n).ok_or_else(|| {
            error!("reference count {} cannot take {n} more", *refs);
            PmrError::RefcountOverflow
        })?;
        *refs = new;
        Ok(new)
    }

    /// Drop `n` references; returns how many remain.
    ///
    /// # Errors
    /// [`PmrError::RefcountOverflow`] if `n` is zero, the count is already
    /// zero or fewer than `n` references exist. The counter is left
    /// untouched.
    pub fn release(&self, n: u32) -> Result<u32, PmrError> {
        let mut refs = self.refs.lock();
        if n == 0 || *refs == 0 {
            error!("releasing {n} references with {} held", *refs);
            return Err(PmrError::RefcountOverflow);
        }
        let Some(remaining) = refs.checked_sub(n) else {
            error!("releasing {n} references with only {} held", *refs);
            return Err(PmrError::RefcountOverflow);
        };
        *refs = remaining;
        Ok(remaining)
    }

    /// Take one reference unless the resource is dead or saturated.
    ///
    /// # Errors
    /// [`PmrError::NotPermitted`] if the count is zero or `u32::MAX`.
    pub fn try_take(&self) -> Result<(), PmrError> {
        let mut refs = self.refs.lock();
        if *refs == 0 || *refs == u32::MAX {
            return Err(PmrError::NotPermitted);
        }
        *refs += 1;
        Ok(())
    }

    /// Take one reference if the count is not zero; `Ok(false)` on a dead
    /// count.
    ///
    /// # Errors
    /// [`PmrError::RefcountOverflow`] if the count is saturated.
    pub(crate) fn take_if_live(&self) -> Result<bool, PmrError> {
        let mut refs = self.refs.lock();
        if *refs == 0 {
            return Ok(false);
        }
        *refs = refs.checked_add(1).ok_or_else(|| {
            error!("reference count {} cannot take one more", *refs);
            PmrError::RefcountOverflow
        })?;
        Ok(true)
    }

    /// Bring a zombie back to one reference. The caller owns the zombie
    /// queue entry, which is what keeps a dead count meaningful.
    pub(crate) fn revive(&self) {
        let mut refs = self.refs.lock();
        debug_assert_eq!(*refs, 0, "reviving a referenced resource");
        *refs += 1;
    }

    /// Add `n` pins; returns the new lock count.
    pub(crate) fn add_locks(&self, n: u32) -> u32 {
        self.locks.fetch_add(n, Ordering::AcqRel) + n
    }

    /// Remove `n` pins; returns the new lock count.
    ///
    /// # Errors
    /// [`PmrError::RefcountOverflow`] if that would drop below the baseline.
    pub(crate) fn sub_locks(&self, n: u32) -> Result<u32, PmrError> {
        let baseline = self.baseline;
        self.locks
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |locks| {
                locks.checked_sub(n).filter(|&left| left >= baseline)
            })
            .map(|prev| prev - n)
            .map_err(|locks| {
                error!("unlocking {n} pins with lock count {locks} (baseline {baseline})");
                PmrError::RefcountOverflow
            })
    }
}

/// Saturating mapping counter.
///
/// Over- and underflow are reported and ignored: a map count is a hint for
/// policy decisions, not a liveness count.
pub struct MapCount {
    count: AtomicI32,
    what: &'static str,
}

impl MapCount {
    #[must_use]
    pub const fn new(what: &'static str) -> Self {
        Self {
            count: AtomicI32::new(0),
            what,
        }
    }

    #[inline]
    #[must_use]
    pub fn get(&self) -> i32 {
        self.count.load(Ordering::Acquire)
    }

    pub fn increment(&self) {
        if self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_add(1))
            .is_err()
        {
            warn!("{} map count saturated at {}", self.what, i32::MAX);
        }
    }

    pub fn decrement(&self) {
        if self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                (c > 0).then(|| c - 1)
            })
            .is_err()
        {
            warn!("{} map count already zero", self.what);
        }
    }
}
