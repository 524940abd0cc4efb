//! # Deferred free
//!
//! When the last reference to a resource goes away while its device may
//! still hold cached translations of the backing, the resource becomes a
//! *zombie*: it is parked on the device's zombie queue instead of being torn
//! down. Page remnants released by unlock or sparse changes, and the import
//! records of other devices, travel the same queue.
//!
//! ```text
//!                  queue_zombies_for_cleanup          run()
//!  live queue  ──────────────────────────────▶ batch ───────▶ destroyed
//!     ▲  │                                        │
//!     │  └──────────── ref_or_revive ◀────────────┘
//!     └── unref to zero
//! ```
//!
//! A cleanup pass captures the whole live queue as a batch together with the
//! invalidation sequence number the firmware has to reach. Once it has (or
//! the device lost power in between) the batch is drained one entry at a
//! time; the queue lock is never held across a backend call. Entries that
//! cannot go yet are put back at the front of the batch and the pass asks to
//! be rerun later.
//!
//! Revival can pull a resource (and its import records) out of the live
//! queue or any batch up until the moment a pass commits to destroying it;
//! that decision is taken under the queue lock after re-checking that the
//! resource is still the head of the batch.

use crate::device::PmrDevice;
use crate::factory::ZombiePages;
use crate::import::DeviceImport;
use crate::resource::Pmr;
use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use log::{debug, info, trace, warn};

/// One deferred obligation.
pub(crate) enum ZombieEntry {
    /// A whole resource with no references left.
    Resource(Pmr),
    /// Pages released by a backend.
    Pages(Box<dyn ZombiePages>),
    /// Another device's import of a zombie resource.
    DeviceImport(Arc<DeviceImport>),
}

impl ZombieEntry {
    fn is_resource(&self, pmr: &Pmr) -> bool {
        matches!(self, Self::Resource(r) if r.ptr_eq(pmr))
    }

    fn is_import(&self, import: &Arc<DeviceImport>) -> bool {
        matches!(self, Self::DeviceImport(i) if Arc::ptr_eq(i, import))
    }
}

impl fmt::Display for ZombieEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resource(pmr) => write!(
                f,
                "PMR serial {} \"{}\" ({} bytes)",
                pmr.serial(),
                pmr.annotation(),
                pmr.logical_size()
            ),
            Self::Pages(pages) => write!(f, "{} zombie pages", pages.page_count()),
            Self::DeviceImport(import) => write!(f, "{import}"),
        }
    }
}

struct CleanupBatch {
    id: u64,
    pending: VecDeque<ZombieEntry>,
    /// Entries processed in this round that have to be offered again.
    retry: Vec<ZombieEntry>,
}

impl CleanupBatch {
    fn len(&self) -> usize {
        self.pending.len() + self.retry.len()
    }

    /// Put retried entries back at the front, oldest first.
    fn requeue_retries(&mut self) {
        for entry in self.retry.drain(..).rev() {
            self.pending.push_front(entry);
        }
    }

    fn remove_where(&mut self, pred: impl Fn(&ZombieEntry) -> bool) -> bool {
        if let Some(pos) = self.pending.iter().position(&pred) {
            self.pending.remove(pos);
            return true;
        }
        if let Some(pos) = self.retry.iter().position(&pred) {
            self.retry.remove(pos);
            return true;
        }
        false
    }
}

/// Per-device zombie state, behind the zombie-queue lock.
pub(crate) struct ZombieQueue {
    live: VecDeque<ZombieEntry>,
    batches: Vec<CleanupBatch>,
    next_batch: u64,
}

impl ZombieQueue {
    pub(crate) const fn new() -> Self {
        Self {
            live: VecDeque::new(),
            batches: Vec::new(),
            next_batch: 0,
        }
    }

    pub(crate) fn push(&mut self, entry: ZombieEntry) {
        self.live.push_back(entry);
    }

    pub(crate) fn live_len(&self) -> usize {
        self.live.len()
    }

    pub(crate) fn in_cleanup_len(&self) -> usize {
        self.batches.iter().map(CleanupBatch::len).sum()
    }

    /// Move the live queue into a new batch.
    fn capture(&mut self) -> u64 {
        let id = self.next_batch;
        self.next_batch += 1;
        let pending = core::mem::take(&mut self.live);
        self.batches.push(CleanupBatch {
            id,
            pending,
            retry: Vec::new(),
        });
        id
    }

    /// Move the live queue and every running batch into one new batch.
    fn capture_all(&mut self) -> u64 {
        let mut older: VecDeque<ZombieEntry> = self
            .batches
            .drain(..)
            .flat_map(|mut batch| {
                batch.requeue_retries();
                batch.pending
            })
            .collect();
        older.append(&mut self.live);
        self.live = older;
        self.capture()
    }

    fn batch_mut(&mut self, id: u64) -> Option<&mut CleanupBatch> {
        self.batches.iter_mut().find(|b| b.id == id)
    }

    fn remove_batch(&mut self, id: u64) {
        self.batches.retain(|b| b.id != id);
    }

    fn push_retry(&mut self, id: u64, entry: ZombieEntry) {
        match self.batch_mut(id) {
            Some(batch) => batch.retry.push(entry),
            None => self.live.push_front(entry),
        }
    }

    /// Pop `pmr` off batch `id` if it is still its head.
    fn claim_head(&mut self, id: u64, pmr: &Pmr) -> Option<ZombieEntry> {
        let batch = self.batch_mut(id)?;
        if batch.pending.front().is_some_and(|e| e.is_resource(pmr)) {
            batch.pending.pop_front()
        } else {
            None
        }
    }

    fn remove_where(&mut self, pred: impl Fn(&ZombieEntry) -> bool) -> bool {
        if let Some(pos) = self.live.iter().position(&pred) {
            self.live.remove(pos);
            return true;
        }
        self.batches.iter_mut().any(|batch| batch.remove_where(&pred))
    }

    /// Unlink a resource wherever it sits.
    pub(crate) fn remove_resource(&mut self, pmr: &Pmr) -> bool {
        self.remove_where(|e| e.is_resource(pmr))
    }

    /// Unlink an import record wherever it sits.
    pub(crate) fn remove_import(&mut self, import: &Arc<DeviceImport>) -> bool {
        self.remove_where(|e| e.is_import(import))
    }

    fn iter(&self) -> impl Iterator<Item = &ZombieEntry> {
        self.live.iter().chain(
            self.batches
                .iter()
                .flat_map(|b| b.pending.iter().chain(b.retry.iter())),
        )
    }
}

/// What a cleanup pass achieved.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CleanupOutcome {
    /// The batch is gone; drop the item.
    Done,
    /// Run the item again after the given delay.
    Retry { after_ms: u32 },
}

/// Next thing to look at in a batch.
enum Head {
    /// Still linked; must be claimed under the factory and queue locks.
    Resource(Pmr),
    Pages(Box<dyn ZombiePages>),
    Import(Arc<DeviceImport>),
}

/// A captured batch of zombies waiting for the device to confirm cache
/// invalidation. Hand it to whatever runs deferred work and call
/// [`run`](Self::run) until it reports [`CleanupOutcome::Done`].
pub struct ZombieCleanupItem {
    device: Arc<PmrDevice>,
    batch: u64,
    required_sync: u32,
    required_power_off: u32,
    retry_after_ms: u32,
}

impl ZombieCleanupItem {
    #[must_use]
    pub const fn device(&self) -> &Arc<PmrDevice> {
        &self.device
    }

    /// Invalidation sequence number the firmware must reach.
    #[must_use]
    pub const fn required_sync(&self) -> u32 {
        self.required_sync
    }

    /// One cleanup pass.
    pub fn run(&mut self) -> CleanupOutcome {
        let device = &self.device;
        if !device.can_free_zombies(self.required_sync, self.required_power_off) {
            trace!(
                "{}: zombie batch {} waits for sync {} (at {})",
                device.name(),
                self.batch,
                self.required_sync,
                device.mmu_sync_value()
            );
            return CleanupOutcome::Retry {
                after_ms: self.retry_after_ms,
            };
        }

        while let Some(head) = device.next_head(self.batch) {
            match head {
                Head::Pages(mut pages) => {
                    if let Err(err) = pages.free() {
                        warn!("{}: zombie pages not freed yet: {err}", device.name());
                        device
                            .zombies
                            .lock()
                            .push_retry(self.batch, ZombieEntry::Pages(pages));
                    }
                }
                Head::Import(import) => import.release(),
                Head::Resource(pmr) => self.retire_resource(&pmr),
            }
        }

        let mut queue = device.zombies.lock();
        let done = queue.batch_mut(self.batch).is_none_or(|batch| {
            batch.requeue_retries();
            batch.pending.is_empty()
        });
        if done {
            queue.remove_batch(self.batch);
            debug!("{}: zombie batch {} done", device.name(), self.batch);
            CleanupOutcome::Done
        } else {
            debug!("{}: zombie batch {} retried", device.name(), self.batch);
            CleanupOutcome::Retry {
                after_ms: self.retry_after_ms,
            }
        }
    }

    fn retire_resource(&self, pmr: &Pmr) {
        let _factory = pmr.lock_factory();
        let mut queue = self.device.zombies.lock();
        let Some(entry) = queue.claim_head(self.batch, pmr) else {
            // Revived since we looked.
            return;
        };
        if pmr.imported_devices_mask() != 0 {
            queue.push_retry(self.batch, entry);
            return;
        }
        pmr.leave_zombie_queue();
        drop(queue);
        drop(entry);
        pmr.destroy();
    }
}

impl PmrDevice {
    /// Capture everything queued so far for a cleanup pass.
    ///
    /// Returns `None` while the driver unloads or when there is nothing to do.
    pub fn queue_zombies_for_cleanup(self: &Arc<Self>) -> Option<ZombieCleanupItem> {
        if self.is_unloading() {
            return None;
        }
        let mut queue = self.zombies.lock();
        if queue.live_len() == 0 {
            return None;
        }
        let batch = queue.capture();
        let required_sync = self.next_mmu_invalidate();
        let required_power_off = self.power_off_count().wrapping_add(1);
        drop(queue);

        debug!(
            "{}: zombie batch {batch} waits for sync {required_sync}",
            self.name()
        );
        Some(ZombieCleanupItem {
            device: Arc::clone(self),
            batch,
            required_sync,
            required_power_off,
            retry_after_ms: self.config().cleanup_retry_timeout_ms,
        })
    }

    /// Free every zombie right away, for device teardown.
    ///
    /// Resources other devices still import are handed to the first of those
    /// devices instead. Page remnants the backend refuses to free stay queued.
    pub fn free_zombies(self: &Arc<Self>) {
        let batch = self.zombies.lock().capture_all();
        let mut stuck = Vec::new();

        // Remnants and import records first, so resources see the imports of
        // this device released.
        while let Some(head) = self.next_head(batch) {
            match head {
                Head::Pages(mut pages) => {
                    if let Err(err) = pages.free() {
                        warn!("{}: zombie pages left behind: {err}", self.name());
                        stuck.push(ZombieEntry::Pages(pages));
                    }
                }
                Head::Import(import) => import.release(),
                Head::Resource(pmr) => {
                    let mut queue = self.zombies.lock();
                    if let Some(entry) = queue.claim_head(batch, &pmr) {
                        queue.push_retry(batch, entry);
                    }
                }
            }
        }

        if let Some(b) = self.zombies.lock().batch_mut(batch) {
            b.requeue_retries();
        }
        while let Some(head) = self.next_head(batch) {
            match head {
                Head::Resource(pmr) => self.release_resource_for_teardown(batch, &pmr),
                Head::Import(import) => import.release(),
                Head::Pages(mut pages) => {
                    if pages.free().is_err() {
                        stuck.push(ZombieEntry::Pages(pages));
                    }
                }
            }
        }

        let mut queue = self.zombies.lock();
        queue.remove_batch(batch);
        for entry in stuck.into_iter().rev() {
            queue.live.push_front(entry);
        }
    }

    fn release_resource_for_teardown(self: &Arc<Self>, batch: u64, pmr: &Pmr) {
        let _factory = pmr.lock_factory();
        let mut queue = self.zombies.lock();
        let Some(entry) = queue.claim_head(batch, pmr) else {
            return;
        };
        drop(queue);

        match pmr.first_import_device_except(self) {
            Some(target) => {
                debug!(
                    "{}: handing zombie PMR {} to {}",
                    self.name(),
                    pmr.serial(),
                    target.name()
                );
                let mut queue = target.zombies.lock();
                queue.push(entry);
                pmr.enter_zombie_queue(&target);
            }
            None => {
                pmr.leave_zombie_queue();
                drop(entry);
                pmr.destroy();
            }
        }
    }

    /// Log every queued entry.
    pub fn dump_zombies(&self) {
        let queue = self.zombies.lock();
        info!(
            "{}: {} zombies queued, {} in cleanup",
            self.name(),
            queue.live_len(),
            queue.in_cleanup_len()
        );
        for entry in queue.iter() {
            info!("  {entry}");
        }
    }

    fn next_head(&self, batch: u64) -> Option<Head> {
        let mut queue = self.zombies.lock();
        let batch = queue.batch_mut(batch)?;
        Some(match batch.pending.pop_front()? {
            ZombieEntry::Resource(pmr) => {
                let head = Head::Resource(pmr.clone());
                batch.pending.push_front(ZombieEntry::Resource(pmr));
                head
            }
            ZombieEntry::Pages(pages) => Head::Pages(pages),
            ZombieEntry::DeviceImport(import) => Head::Import(import),
        })
    }
}
