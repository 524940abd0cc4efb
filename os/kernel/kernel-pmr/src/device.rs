//! # Devices
//!
//! A [`PmrDevice`] is the hardware side of the deferred free path. It owns
//! the zombie queue of resources allocated for it and tracks two
//! counters the cleanup pass compares against:
//!
//! * the MMU cache invalidation sequence: the driver numbers every
//!   invalidation it issues, and the firmware reports the number of the last
//!   one it finished;
//! * the power-off count: a device that lost power has no caches left to
//!   invalidate.

use crate::config::{MAX_DEVICES, PmrConfig};
use crate::error::PmrError;
use crate::factory::ZombiePages;
use crate::zombie::{ZombieEntry, ZombieQueue};
use alloc::boxed::Box;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use kernel_sync::TicketMutex;
use log::{debug, warn};

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum PowerState {
    /// Not reported yet; treated as powered.
    Unknown = 0,
    Off = 1,
    On = 2,
}

impl PowerState {
    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Off,
            2 => Self::On,
            _ => Self::Unknown,
        }
    }
}

/// `current` has reached `target` on a wrapping 32-bit sequence.
#[inline]
#[must_use]
pub const fn has_counter_advanced(current: u32, target: u32) -> bool {
    current.wrapping_sub(target).cast_signed() >= 0
}

pub struct PmrDevice {
    id: u8,
    name: &'static str,
    config: PmrConfig,
    power: AtomicU8,
    pci_error: AtomicBool,
    unloading: AtomicBool,
    /// Sequence number of the last invalidation the firmware finished.
    mmu_sync: AtomicU32,
    /// Sequence number the next invalidation will carry.
    next_mmu_invalidate: AtomicU32,
    power_off_count: AtomicU32,
    pub(crate) zombies: TicketMutex<ZombieQueue>,
}

impl PmrDevice {
    /// # Errors
    /// [`PmrError::InvalidDeviceId`] if `id` does not fit the import bitmap.
    pub fn new(id: u8, name: &'static str, config: PmrConfig) -> Result<Arc<Self>, PmrError> {
        if id >= MAX_DEVICES {
            return Err(PmrError::InvalidDeviceId(id));
        }
        Ok(Arc::new(Self {
            id,
            name,
            config,
            power: AtomicU8::new(PowerState::Unknown as u8),
            pci_error: AtomicBool::new(false),
            unloading: AtomicBool::new(false),
            mmu_sync: AtomicU32::new(0),
            next_mmu_invalidate: AtomicU32::new(1),
            power_off_count: AtomicU32::new(0),
            zombies: TicketMutex::new(ZombieQueue::new()),
        }))
    }

    #[inline]
    #[must_use]
    pub const fn id(&self) -> u8 {
        self.id
    }

    #[inline]
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    #[must_use]
    pub const fn config(&self) -> &PmrConfig {
        &self.config
    }

    /// Bit of this device in an import bitmap.
    #[inline]
    #[must_use]
    pub const fn import_bit(&self) -> u64 {
        1 << self.id
    }

    #[inline]
    #[must_use]
    pub fn power_state(&self) -> PowerState {
        PowerState::from_u8(self.power.load(Ordering::Acquire))
    }

    pub fn set_power_state(&self, state: PowerState) {
        let prev = PowerState::from_u8(self.power.swap(state as u8, Ordering::AcqRel));
        if state == PowerState::Off && prev != PowerState::Off {
            self.power_off_count.fetch_add(1, Ordering::AcqRel);
            debug!("{}: powered off", self.name);
        }
    }

    #[inline]
    #[must_use]
    pub fn power_off_count(&self) -> u32 {
        self.power_off_count.load(Ordering::Acquire)
    }

    pub fn set_pci_error(&self, faulted: bool) {
        self.pci_error.store(faulted, Ordering::Release);
    }

    #[inline]
    #[must_use]
    pub fn has_pci_error(&self) -> bool {
        self.pci_error.load(Ordering::Acquire)
    }

    /// Powered (or not known to be off) and not faulted; only such a device
    /// may still hold cached translations worth waiting for.
    #[must_use]
    pub fn is_on_and_operating(&self) -> bool {
        self.power_state() != PowerState::Off && !self.has_pci_error()
    }

    /// While unloading no new cleanup passes are started.
    pub fn set_unloading(&self, unloading: bool) {
        self.unloading.store(unloading, Ordering::Release);
    }

    #[inline]
    #[must_use]
    pub fn is_unloading(&self) -> bool {
        self.unloading.load(Ordering::Acquire)
    }

    /// Sequence number the next MMU cache invalidation will report.
    #[inline]
    #[must_use]
    pub fn next_mmu_invalidate(&self) -> u32 {
        self.next_mmu_invalidate.load(Ordering::Acquire)
    }

    /// Reserve a sequence number for an invalidation about to be issued.
    pub fn issue_mmu_invalidate(&self) -> u32 {
        self.next_mmu_invalidate.fetch_add(1, Ordering::AcqRel)
    }

    /// The firmware finished the invalidation numbered `value`.
    pub fn complete_mmu_invalidate(&self, value: u32) {
        self.mmu_sync.store(value, Ordering::Release);
    }

    #[inline]
    #[must_use]
    pub fn mmu_sync_value(&self) -> u32 {
        self.mmu_sync.load(Ordering::Acquire)
    }

    /// Everything queued before `required_sync` was reserved, or before the
    /// power-off counter reached `required_power_off`, can go. So can
    /// everything on a device that is off or faulted.
    pub(crate) fn can_free_zombies(&self, required_sync: u32, required_power_off: u32) -> bool {
        !self.is_on_and_operating()
            || has_counter_advanced(self.mmu_sync_value(), required_sync)
            || has_counter_advanced(self.power_off_count(), required_power_off)
    }

    /// Entries waiting for the next cleanup pass.
    #[must_use]
    pub fn zombie_count(&self) -> usize {
        self.zombies.lock().live_len()
    }

    /// Entries captured by cleanup passes that have not finished.
    #[must_use]
    pub fn in_cleanup_count(&self) -> usize {
        self.zombies.lock().in_cleanup_len()
    }

    /// Free page remnants now if no device cache can still reference them,
    /// otherwise park them on the zombie queue.
    pub(crate) fn dispose_zombie_pages(&self, mut pages: Box<dyn ZombiePages>) {
        if self.config.pages_deferred_free && self.is_on_and_operating() {
            self.zombies.lock().push(ZombieEntry::Pages(pages));
            return;
        }
        if let Err(err) = pages.free() {
            warn!("{}: freeing {} zombie pages failed: {err}", self.name, pages.page_count());
            self.zombies.lock().push(ZombieEntry::Pages(pages));
        }
    }
}

impl fmt::Debug for PmrDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PmrDevice")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("power", &self.power_state())
            .field("pci_error", &self.has_pci_error())
            .finish_non_exhaustive()
    }
}
