//! Cross-device imports.
//!
//! When another device maps a resource, its caches may hold translations
//! too. Each such device gets one [`DeviceImport`] record on the resource
//! and one bit in the resource's import bitmap. When the resource turns into
//! a zombie, every record is queued on its own device's zombie queue, and
//! the resource is only destroyed once all of them have been released.

use crate::device::PmrDevice;
use crate::error::PmrError;
use crate::resource::{Pmr, PmrInner};
use crate::zombie::ZombieEntry;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use log::{debug, trace};

/// One device's claim on a resource owned by another device.
pub struct DeviceImport {
    device: Arc<PmrDevice>,
    parent: Weak<PmrInner>,
    serial: u64,
}

impl DeviceImport {
    #[inline]
    #[must_use]
    pub const fn device(&self) -> &Arc<PmrDevice> {
        &self.device
    }

    /// Serial of the imported resource.
    #[inline]
    #[must_use]
    pub const fn serial(&self) -> u64 {
        self.serial
    }

    /// Drop the claim: unlink from the resource and clear the bitmap bit.
    pub(crate) fn release(self: &Arc<Self>) {
        let Some(parent) = self.parent.upgrade() else {
            return;
        };
        let mut locked = parent.locked.lock();
        locked.imports.retain(|import| !Arc::ptr_eq(import, self));
        parent.state.lock().imports &= !self.device.import_bit();
        drop(locked);
        trace!("{}: released import of PMR {}", self.device.name(), self.serial);
    }
}

impl fmt::Display for DeviceImport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "import of PMR {} by {}", self.serial, self.device.name())
    }
}

impl fmt::Debug for DeviceImport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceImport")
            .field("device", &self.device.name())
            .field("serial", &self.serial)
            .finish()
    }
}

impl Pmr {
    /// Record that `device` maps this resource.
    ///
    /// Imports by the owning device, and all imports while import tracking
    /// is disabled, are not recorded. A device is recorded once no matter how
    /// often it imports.
    ///
    /// # Errors
    /// [`PmrError::NotPermitted`] for on-demand resources and resources whose
    /// layout is not fixed yet; their pages can change under the importer.
    pub fn register_device_import(&self, device: &Arc<PmrDevice>) -> Result<(), PmrError> {
        if device.id() == self.device().id() || !self.0.ctx.config().device_import_deferred_free
        {
            return Ok(());
        }
        if self.flags().on_demand() || !self.is_layout_fixed() {
            return Err(PmrError::NotPermitted);
        }

        let mut locked = self.0.locked.lock();
        let bit = device.import_bit();
        let fresh = {
            let mut state = self.0.state.lock();
            let fresh = state.imports & bit == 0;
            state.imports |= bit;
            fresh
        };
        if fresh {
            locked.imports.push(Arc::new(DeviceImport {
                device: Arc::clone(device),
                parent: Arc::downgrade(&self.0),
                serial: self.serial(),
            }));
            debug!("PMR {} imported by {}", self.serial(), device.name());
        }
        Ok(())
    }

    /// Bitmap of devices holding an import.
    #[must_use]
    pub fn imported_devices_mask(&self) -> u64 {
        self.0.state.lock().imports
    }

    /// Queue every import record on its device. Records of devices that are
    /// off or faulted are dropped on the spot. Returns whether any record was
    /// queued.
    pub(crate) fn enqueue_import_zombies(&self) -> bool {
        let mut locked = self.0.locked.lock();
        let (queued, dropped): (Vec<_>, Vec<_>) = locked
            .imports
            .drain(..)
            .partition(|import| import.device.is_on_and_operating());

        let mut cleared = 0;
        for import in &dropped {
            cleared |= import.device.import_bit();
        }
        if cleared != 0 {
            self.0.state.lock().imports &= !cleared;
        }

        for import in &queued {
            import
                .device
                .zombies
                .lock()
                .push(ZombieEntry::DeviceImport(Arc::clone(import)));
        }
        let pending = !queued.is_empty();
        locked.imports = queued;
        pending
    }

    /// Pull the import records back out of their devices' queues. Records a
    /// cleanup pass released in the meantime are gone for good.
    pub(crate) fn revive_import_zombies(&self) {
        let locked = self.0.locked.lock();
        for import in &locked.imports {
            import.device.zombies.lock().remove_import(import);
        }
    }

    /// Forget every import, unlinking records still sitting on a queue.
    pub(crate) fn unregister_all_imports(&self) {
        let mut locked = self.0.locked.lock();
        for import in locked.imports.drain(..) {
            import.device.zombies.lock().remove_import(&import);
        }
        self.0.state.lock().imports = 0;
    }

    /// Device of the first import record not on `device`.
    pub(crate) fn first_import_device_except(&self, device: &PmrDevice) -> Option<Arc<PmrDevice>> {
        self.0
            .locked
            .lock()
            .imports
            .iter()
            .find(|import| import.device.id() != device.id())
            .map(|import| Arc::clone(&import.device))
    }
}
