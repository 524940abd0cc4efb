//! # Physical memory resources
//!
//! A [`Pmr`] is a handle on one physical allocation. Handles are cheap
//! clones of a shared object; liveness is governed by the *manual* reference
//! count, not by how many handles exist. Whoever takes a reference gives it
//! back exactly once, and the last [`unref_and_maybe_destroy`] decides
//! between tearing the resource down right away and parking it on its
//! device's zombie queue.
//!
//! ```text
//!            unref to 0, defer-free, device on
//!   Active ─────────────────────────────────────▶ Zombie
//!     │  ▲                                          │
//!     │  └────────────── ref_or_revive ◀────────────┤
//!     │ unref to 0                                  │ cleanup pass
//!     ▼                                             ▼
//!  Destroyed ◀──────────────────────────────────────┘
//! ```
//!
//! Locks of one resource, outermost first: resource lock ([`Pmr::lock`]),
//! then the refcount and state spinlocks. A zombie queue lock may be taken
//! under the resource lock; two zombie queue locks are never held at once.
//!
//! [`unref_and_maybe_destroy`]: Pmr::unref_and_maybe_destroy

use crate::config::NESTED_RESOURCE_LOCK;
use crate::context::{Identity, PmrContext};
use crate::device::PmrDevice;
use crate::error::PmrError;
use crate::factory::{FactoryOps, PmrKind, ZombiePages};
use crate::flags::{InternalFlags, PmrFlags};
use crate::heap::PhysHeap;
use crate::import::DeviceImport;
use crate::mapping_table::MappingTable;
use crate::refcount::{MapCount, PmrCounters};
use crate::zombie::ZombieEntry;
use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::any::Any;
use core::fmt;
use core::hint::spin_loop;
use core::mem::ManuallyDrop;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_sync::{Completion, SpinMutex, TicketMutex, TicketMutexGuard};
use log::{debug, error, trace, warn};

/// Where a resource is in its life.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Lifecycle {
    Active,
    /// Active, but pages are being moved; address queries wait or retry.
    PagesInMigrate,
    /// Unreferenced and parked on a zombie queue.
    Zombie,
    Destroyed,
}

/// What [`Pmr::ref_or_revive`] had to do.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RefOutcome {
    Referenced,
    Revived,
}

/// Opaque identifier of a GPU mapping built on top of a resource.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct GpuMappingId(pub u64);

/// Parameters of [`Pmr::create`].
#[derive(Debug, Copy, Clone)]
pub struct PmrCreateInfo<'a> {
    pub logical_size: u64,
    pub num_phys_chunks: u32,
    pub num_logical_chunks: u32,
    /// Logical chunks backed at creation.
    pub mapping: &'a [u32],
    /// Chunk size exponent of sparse resources; alignment of all of them.
    pub log2_contiguity: u32,
    pub flags: PmrFlags,
    pub annotation: &'a str,
}

impl<'a> PmrCreateInfo<'a> {
    /// A fully backed single chunk resource.
    #[must_use]
    pub const fn dense(logical_size: u64, log2_contiguity: u32, flags: PmrFlags) -> Self {
        Self {
            logical_size,
            num_phys_chunks: 1,
            num_logical_chunks: 1,
            mapping: &[0],
            log2_contiguity,
            flags,
            annotation: "",
        }
    }

    /// A resource of `num_logical_chunks` chunks of `1 << log2_chunk_size`
    /// bytes, backed at the chunks listed in `mapping`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn sparse(
        log2_chunk_size: u32,
        num_logical_chunks: u32,
        mapping: &'a [u32],
        flags: PmrFlags,
    ) -> Self {
        Self {
            logical_size: (1u64 << log2_chunk_size) * num_logical_chunks as u64,
            num_phys_chunks: mapping.len() as u32,
            num_logical_chunks,
            mapping,
            log2_contiguity: log2_chunk_size,
            flags,
            annotation: "",
        }
    }

    #[must_use]
    pub const fn with_annotation(mut self, annotation: &'a str) -> Self {
        self.annotation = annotation;
        self
    }
}

/// State bits, behind the bitmap spinlock.
pub(crate) struct StateBits {
    pub(crate) flags: InternalFlags,
    /// One bit per device holding an import.
    pub(crate) imports: u64,
    /// Device whose zombie queue holds the resource; `Some` iff zombie.
    pub(crate) zombie_host: Option<Arc<PmrDevice>>,
}

/// State behind the resource lock.
pub(crate) struct Locked {
    pub(crate) table: MappingTable,
    pub(crate) imports: Vec<Arc<DeviceImport>>,
    pub(crate) gpu_mappings: Vec<GpuMappingId>,
    pub(crate) gpu_resources: u32,
}

pub(crate) struct PmrInner {
    pub(crate) ctx: Arc<PmrContext>,
    pub(crate) heap: Arc<PhysHeap>,
    pub(crate) ops: FactoryOps,
    pub(crate) identity: Identity,
    pub(crate) logical_size: u64,
    pub(crate) log2_contiguity: u32,
    /// `PmrFlags` bits; only the IPA policy field changes after creation.
    pub(crate) flags: AtomicU64,
    pub(crate) annotation: String,
    pub(crate) counters: PmrCounters,
    pub(crate) client_cpu_maps: MapCount,
    pub(crate) kernel_cpu_maps: MapCount,
    pub(crate) state: SpinMutex<StateBits>,
    pub(crate) locked: TicketMutex<Locked>,
    /// Signalled while no migration is in flight.
    pub(crate) migration: Completion,
}

/// Handle on a physical memory resource.
#[derive(Clone)]
pub struct Pmr(pub(crate) Arc<PmrInner>);

impl Pmr {
    /// Create a resource and hand its first reference to the caller.
    ///
    /// A resource is sparse when it has more than one logical chunk or fewer
    /// physical than logical chunks; its chunks are then
    /// `1 << log2_contiguity` bytes, otherwise the single chunk spans the
    /// whole resource.
    ///
    /// # Errors
    /// * [`PmrError::BadMappingTableSize`] if the logical size is not the
    ///   chunk size times the logical chunk count, or the chunk counts are
    ///   inconsistent.
    /// * [`PmrError::InvalidChunk`] for a mapping index out of range or
    ///   repeated.
    pub fn create(
        ctx: &Arc<PmrContext>,
        heap: &Arc<PhysHeap>,
        ops: FactoryOps,
        info: &PmrCreateInfo<'_>,
    ) -> Result<Self, PmrError> {
        let pmr = Self::create_unreferenced(ctx, heap, ops, info)?;
        pmr.0.counters.initialise();
        Ok(pmr)
    }

    fn create_unreferenced(
        ctx: &Arc<PmrContext>,
        heap: &Arc<PhysHeap>,
        ops: FactoryOps,
        info: &PmrCreateInfo<'_>,
    ) -> Result<Self, PmrError> {
        let sparse =
            info.num_logical_chunks != info.num_phys_chunks || info.num_logical_chunks > 1;
        let chunk_size = if sparse {
            if info.log2_contiguity >= u64::BITS {
                return Err(PmrError::InvalidParams);
            }
            1u64 << info.log2_contiguity
        } else {
            info.logical_size
        };
        if chunk_size.checked_mul(u64::from(info.num_logical_chunks)) != Some(info.logical_size) {
            warn!(
                "logical size {:#x} is not {} chunks of {chunk_size:#x}",
                info.logical_size, info.num_logical_chunks
            );
            return Err(PmrError::BadMappingTableSize);
        }
        let table = MappingTable::new(
            chunk_size,
            info.num_logical_chunks,
            info.num_phys_chunks,
            info.mapping,
        )?;

        let inner = ctx.register(|identity| {
            Arc::new(PmrInner {
                ctx: Arc::clone(ctx),
                heap: Arc::clone(heap),
                ops,
                identity,
                logical_size: info.logical_size,
                log2_contiguity: info.log2_contiguity,
                flags: AtomicU64::new(info.flags.into_bits()),
                annotation: String::from(info.annotation),
                counters: PmrCounters::new(info.flags.on_demand()),
                client_cpu_maps: MapCount::new("client CPU"),
                kernel_cpu_maps: MapCount::new("kernel CPU"),
                state: SpinMutex::new(StateBits {
                    flags: InternalFlags::new().with_sparse(sparse),
                    imports: 0,
                    zombie_host: None,
                }),
                locked: TicketMutex::new(Locked {
                    table,
                    imports: Vec::new(),
                    gpu_mappings: Vec::new(),
                    gpu_resources: 0,
                }),
                migration: Completion::completed(),
            })
        });

        let pmr = Self(inner);
        debug!(
            "created PMR {} \"{}\" ({} bytes, {} on {})",
            pmr.serial(),
            pmr.annotation(),
            pmr.logical_size(),
            pmr.kind(),
            heap.name()
        );
        Ok(pmr)
    }

    /// Take `n` references; returns the new count.
    ///
    /// # Errors
    /// [`PmrError::RefcountOverflow`] on a dead resource or overflow.
    pub fn ref_n(&self, n: u32) -> Result<u32, PmrError> {
        self.0.counters.take(n)
    }

    /// Drop `n` references without ever destroying; returns the remaining
    /// count. Use [`unref_and_maybe_destroy`](Self::unref_and_maybe_destroy)
    /// to give back references for good.
    ///
    /// # Errors
    /// * [`PmrError::InvalidParams`] if `n` is zero.
    /// * [`PmrError::RefcountOverflow`] if fewer than `n` are held.
    pub fn unref_n(&self, n: u32) -> Result<u32, PmrError> {
        if n == 0 {
            return Err(PmrError::InvalidParams);
        }
        self.0.counters.release(n)
    }

    /// Take a reference unless the resource is dying.
    ///
    /// # Errors
    /// [`PmrError::NotPermitted`] if the count is zero or saturated.
    pub fn try_ref(&self) -> Result<(), PmrError> {
        self.0.counters.try_take()
    }

    /// Give back `n` references; the last one destroys the resource or
    /// parks it on the zombie queue.
    ///
    /// # Errors
    /// * [`PmrError::InvalidParams`] if `n` is zero.
    /// * [`PmrError::RefcountOverflow`] if fewer than `n` are held, which
    ///   includes a resource that is already a zombie or destroyed.
    pub fn unref_and_maybe_destroy(&self, n: u32) -> Result<(), PmrError> {
        if n == 0 {
            return Err(PmrError::InvalidParams);
        }
        let _factory = self.lock_factory();
        if self.0.counters.release(n)? > 0 {
            return Ok(());
        }
        self.retire_or_defer();
        Ok(())
    }

    fn retire_or_defer(&self) {
        let defer = self.0.ctx.config().deferred_free && self.0.state.lock().flags.defer_free();
        if !defer {
            self.destroy();
            return;
        }

        let device = self.device();
        let imports_pending = self.enqueue_import_zombies();
        if !imports_pending && !device.is_on_and_operating() {
            self.destroy();
            return;
        }

        let mut queue = device.zombies.lock();
        self.enter_zombie_queue(device);
        queue.push(ZombieEntry::Resource(self.clone()));
        if let Err(err) = self.0.ops.backing.zombify() {
            warn!("PMR {}: zombify hook failed: {err}", self.serial());
        }
        drop(queue);
        debug!("PMR {} zombified on {}", self.serial(), device.name());
    }

    /// Take a reference, bringing the resource back from the zombie queue if
    /// it already went there.
    ///
    /// # Errors
    /// [`PmrError::RefcountOverflow`] if the resource is already destroyed
    /// or the count would overflow.
    pub fn ref_or_revive(&self) -> Result<RefOutcome, PmrError> {
        let _factory = self.lock_factory();
        loop {
            let Some(host) = self.zombie_host() else {
                if self.0.counters.take_if_live()? {
                    return Ok(RefOutcome::Referenced);
                }
                if self.0.state.lock().flags.destroyed() {
                    warn!("PMR {}: reference on a destroyed resource", self.serial());
                    return Err(PmrError::RefcountOverflow);
                }
                // Between the last unref and the zombie queue or destroy.
                spin_loop();
                continue;
            };

            let mut queue = host.zombies.lock();
            let still_hosted = self
                .zombie_host()
                .is_some_and(|current| Arc::ptr_eq(&current, &host));
            if !still_hosted || !queue.remove_resource(self) {
                // Moving between queues or being claimed for destruction.
                drop(queue);
                spin_loop();
                continue;
            }

            self.0.counters.revive();
            self.leave_zombie_queue();
            drop(queue);
            self.revive_import_zombies();
            debug!("PMR {} revived from {}", self.serial(), host.name());
            return Ok(RefOutcome::Revived);
        }
    }

    /// Let the last unref park the resource instead of destroying it, as
    /// soon as it may be cached by the device. No-op for on-demand resources,
    /// whose pages take the remnant path on unlock.
    pub fn mark_for_defer_free(&self) {
        if self.flags().on_demand() {
            return;
        }
        self.0.state.lock().flags.set_defer_free(true);
    }

    pub(crate) fn zombie_host(&self) -> Option<Arc<PmrDevice>> {
        self.0.state.lock().zombie_host.clone()
    }

    pub(crate) fn enter_zombie_queue(&self, host: &Arc<PmrDevice>) {
        let mut state = self.0.state.lock();
        state.flags.set_zombie(true);
        state.zombie_host = Some(Arc::clone(host));
    }

    pub(crate) fn leave_zombie_queue(&self) {
        let mut state = self.0.state.lock();
        state.flags.set_zombie(false);
        state.zombie_host = None;
    }

    /// Final teardown. Runs once per resource, with no references left.
    pub(crate) fn destroy(&self) {
        {
            let mut state = self.0.state.lock();
            if state.flags.destroyed() {
                error!("PMR {} destroyed twice", self.0.identity.serial);
                return;
            }
            state.flags.set_destroyed(true);
            state.flags.set_zombie(false);
            state.zombie_host = None;
        }

        let locks = self.0.counters.locks();
        let baseline = self.0.counters.lock_baseline();
        debug_assert_eq!(locks, baseline, "PMR destroyed while locked");
        if locks != baseline {
            error!(
                "PMR {} destroyed with lock count {locks}, expected {baseline}",
                self.serial()
            );
        }

        self.unregister_all_imports();
        let mappings = self.0.locked.lock().gpu_mappings.len();
        if mappings != 0 {
            error!("PMR {} destroyed with {mappings} GPU mappings linked", self.serial());
        }

        self.0.ops.backing.finalize();
        self.0.ctx.retire();
        debug!("destroyed PMR {} \"{}\"", self.serial(), self.annotation());
    }

    /// Take the backend-wide factory lock, if the backend has one.
    pub(crate) fn lock_factory(&self) -> Option<TicketMutexGuard<'_, ()>> {
        self.0.ops.lock_factory()
    }

    /// Pin the backing and take `n` references.
    ///
    /// The backend pins on the first lock beyond the baseline only.
    ///
    /// # Errors
    /// Reference overflow, or the backend's error; nothing changes then.
    pub fn lock_physical_addresses(&self, n: u32) -> Result<(), PmrError> {
        self.lock_physical_addresses_nested(n, 0)
    }

    /// [`lock_physical_addresses`](Self::lock_physical_addresses) while
    /// another resource lock is held at a lower nesting level.
    ///
    /// # Errors
    /// See [`lock_physical_addresses`](Self::lock_physical_addresses).
    pub fn lock_physical_addresses_nested(&self, n: u32, level: u8) -> Result<(), PmrError> {
        if n == 0 {
            return Err(PmrError::InvalidParams);
        }
        let _locked = self.0.locked.lock_nested(level);
        self.0.counters.take(n)?;
        let locks = self.0.counters.add_locks(n);

        if locks == n + self.0.counters.lock_baseline()
            && let Some(phys) = &self.0.ops.phys_lock
            && let Err(err) = phys.lock_phys_addresses()
        {
            let locks_back = self.0.counters.sub_locks(n);
            let refs_back = self.0.counters.release(n);
            debug_assert!(
                locks_back.is_ok() && refs_back.is_ok(),
                "lock rollback failed"
            );
            warn!("PMR {}: locking physical addresses failed: {err}", self.serial());
            return Err(err);
        }
        trace!("PMR {} locked, lock count {locks}", self.serial());
        Ok(())
    }

    /// Unpin `n` locks and give back their references.
    ///
    /// # Errors
    /// * [`PmrError::InvalidParams`] if `n` is zero.
    /// * [`PmrError::RefcountOverflow`] if fewer locks are held.
    /// * The backend's unlock error, reported after the references were
    ///   given back.
    pub fn unlock_physical_addresses(&self, n: u32) -> Result<(), PmrError> {
        self.unlock_physical_addresses_nested(n, 0)
    }

    /// [`unlock_physical_addresses`](Self::unlock_physical_addresses) while
    /// another resource lock is held at a lower nesting level.
    ///
    /// # Errors
    /// See [`unlock_physical_addresses`](Self::unlock_physical_addresses).
    pub fn unlock_physical_addresses_nested(&self, n: u32, level: u8) -> Result<(), PmrError> {
        if n == 0 {
            return Err(PmrError::InvalidParams);
        }
        let unlocked = {
            let _locked = self.0.locked.lock_nested(level);
            let locks = self.0.counters.sub_locks(n)?;
            trace!("PMR {} unlocked, lock count {locks}", self.serial());
            match &self.0.ops.phys_lock {
                Some(phys) if locks == self.0.counters.lock_baseline() => {
                    phys.unlock_phys_addresses()
                }
                _ => Ok(None),
            }
        };

        let unlocked = match unlocked {
            Ok(Some(pages)) => {
                self.device().dispose_zombie_pages(pages);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(err) => {
                error!("PMR {}: unlocking physical addresses failed: {err}", self.serial());
                Err(err)
            }
        };
        self.unref_and_maybe_destroy(n)?;
        unlocked
    }

    /// Take the resource lock.
    pub fn lock(&self) -> PmrGuard<'_> {
        self.lock_nested(0)
    }

    /// Take the resource lock while another resource lock is held; use
    /// [`NESTED_RESOURCE_LOCK`] for the inner one.
    pub fn lock_nested(&self, level: u8) -> PmrGuard<'_> {
        PmrGuard {
            pmr: self,
            locked: ManuallyDrop::new(self.0.locked.lock_nested(level)),
            remnants: Vec::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn serial(&self) -> u64 {
        self.0.identity.serial
    }

    /// Export password.
    #[inline]
    #[must_use]
    pub fn key(&self) -> u64 {
        self.0.identity.key
    }

    #[inline]
    #[must_use]
    pub fn logical_size(&self) -> u64 {
        self.0.logical_size
    }

    #[inline]
    #[must_use]
    pub fn log2_contiguity(&self) -> u32 {
        self.0.log2_contiguity
    }

    /// Alignment guaranteed for the backing, `1 << log2_contiguity`.
    #[inline]
    #[must_use]
    pub fn alignment(&self) -> u64 {
        1u64 << self.0.log2_contiguity
    }

    #[inline]
    #[must_use]
    pub fn flags(&self) -> PmrFlags {
        PmrFlags::from_bits(self.0.flags.load(Ordering::Acquire))
    }

    #[inline]
    #[must_use]
    pub fn annotation(&self) -> &str {
        &self.0.annotation
    }

    #[inline]
    #[must_use]
    pub fn kind(&self) -> PmrKind {
        self.0.ops.kind()
    }

    #[inline]
    #[must_use]
    pub fn heap(&self) -> &Arc<PhysHeap> {
        &self.0.heap
    }

    /// Device owning the heap the resource was allocated from.
    #[inline]
    #[must_use]
    pub fn device(&self) -> &Arc<PmrDevice> {
        self.0.heap.device()
    }

    #[must_use]
    pub fn ref_count(&self) -> u32 {
        self.0.counters.refs()
    }

    #[must_use]
    pub fn lock_count(&self) -> u32 {
        self.0.counters.locks()
    }

    #[must_use]
    pub fn is_sparse(&self) -> bool {
        self.0.state.lock().flags.sparse()
    }

    #[must_use]
    pub fn is_zombie(&self) -> bool {
        self.0.state.lock().flags.zombie()
    }

    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        let flags = self.0.state.lock().flags;
        if flags.destroyed() {
            Lifecycle::Destroyed
        } else if flags.zombie() {
            Lifecycle::Zombie
        } else if !self.0.migration.is_completed() {
            Lifecycle::PagesInMigrate
        } else {
            Lifecycle::Active
        }
    }

    #[must_use]
    pub fn is_layout_fixed(&self) -> bool {
        self.0.state.lock().flags.layout_fixed()
    }

    /// Freeze the physical layout. One way.
    ///
    /// Taken under the resource lock so no sparse change is in flight.
    pub fn set_layout_fixed(&self) {
        let _locked = self.0.locked.lock();
        self.0.state.lock().flags.set_layout_fixed(true);
    }

    /// Bytes of physical backing; zero while nothing is pinned.
    #[must_use]
    pub fn physical_size(&self) -> u64 {
        if !self.0.counters.is_backed() {
            return 0;
        }
        if self.is_sparse() {
            self.0.locked.lock().table.backed_size()
        } else {
            self.0.logical_size
        }
    }

    /// Copy of the current mapping table.
    #[must_use]
    pub fn mapping_table(&self) -> MappingTable {
        self.0.locked.lock().table.clone()
    }

    /// Which of `num_pages` pages from `logical_offset` are backed.
    ///
    /// # Errors
    /// As [`MappingTable::translate`].
    pub fn is_offset_valid(
        &self,
        log2_page_size: u32,
        num_pages: usize,
        logical_offset: u64,
    ) -> Result<Vec<bool>, PmrError> {
        let translation = self.0.locked.lock().table.translate(
            log2_page_size,
            num_pages,
            logical_offset,
            self.0.logical_size,
        )?;
        Ok(translation.valid())
    }

    /// The backend object, if it is a `B`.
    #[must_use]
    pub fn backing<B: Any>(&self) -> Option<&B> {
        let backing: &dyn Any = &*self.0.ops.backing;
        backing.downcast_ref::<B>()
    }

    /// Per-allocation IPA policy; zero selects the heap default.
    #[must_use]
    pub fn ipa_policy(&self) -> u8 {
        self.flags().ipa_policy()
    }

    /// # Errors
    /// [`PmrError::NotImplemented`] if the heap has no IPA field.
    pub fn modify_ipa_policy(&self, policy: u8) -> Result<(), PmrError> {
        if self.0.heap.ipa().clear_mask == 0 {
            return Err(PmrError::NotImplemented);
        }
        let mut bits = self.0.flags.load(Ordering::Acquire);
        loop {
            let new = PmrFlags::from_bits(bits).with_ipa_policy(policy).into_bits();
            match self
                .0
                .flags
                .compare_exchange_weak(bits, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(()),
                Err(current) => bits = current,
            }
        }
    }

    pub fn increment_client_cpu_map_count(&self) {
        self.0.client_cpu_maps.increment();
    }

    pub fn decrement_client_cpu_map_count(&self) {
        self.0.client_cpu_maps.decrement();
    }

    #[must_use]
    pub fn is_client_cpu_mapped(&self) -> bool {
        self.0.client_cpu_maps.get() > 0
    }

    #[must_use]
    pub fn client_cpu_map_count(&self) -> i32 {
        self.0.client_cpu_maps.get()
    }

    pub fn increment_kernel_cpu_map_count(&self) {
        self.0.kernel_cpu_maps.increment();
    }

    pub fn decrement_kernel_cpu_map_count(&self) {
        self.0.kernel_cpu_maps.decrement();
    }

    #[must_use]
    pub fn kernel_cpu_map_count(&self) -> i32 {
        self.0.kernel_cpu_maps.get()
    }

    /// Check a CPU mapping request against the resource.
    ///
    /// # Errors
    /// * [`PmrError::NotPermitted`] for an access the resource does not allow.
    /// * [`PmrError::BadMapping`] if nothing is backed.
    pub fn check_cpu_mapping(&self, requested: PmrFlags) -> Result<(), PmrError> {
        let flags = self.flags();
        if (requested.cpu_writable() && !flags.cpu_writable())
            || (requested.cpu_readable() && !flags.cpu_readable())
        {
            return Err(PmrError::NotPermitted);
        }
        if self.physical_size() == 0 {
            return Err(PmrError::BadMapping);
        }
        Ok(())
    }

    /// Both handles refer to the same resource.
    #[inline]
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Pmr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pmr")
            .field("serial", &self.serial())
            .field("annotation", &self.annotation())
            .field("logical_size", &self.logical_size())
            .field("refs", &self.ref_count())
            .field("locks", &self.lock_count())
            .field("lifecycle", &self.lifecycle())
            .finish_non_exhaustive()
    }
}

/// The resource lock of one [`Pmr`].
///
/// Page remnants released while the lock is held are handed to the zombie
/// path after it is dropped.
pub struct PmrGuard<'a> {
    pub(crate) pmr: &'a Pmr,
    pub(crate) locked: ManuallyDrop<TicketMutexGuard<'a, Locked>>,
    pub(crate) remnants: Vec<Box<dyn ZombiePages>>,
}

impl PmrGuard<'_> {
    #[inline]
    #[must_use]
    pub const fn pmr(&self) -> &Pmr {
        self.pmr
    }

    /// Nesting level the lock was taken at.
    #[must_use]
    pub fn nesting_level(&self) -> u8 {
        TicketMutexGuard::nesting_level(&*self.locked)
    }

    /// Lock a second resource under this one.
    #[must_use]
    pub fn lock_other<'b>(&self, other: &'b Pmr) -> PmrGuard<'b> {
        other.lock_nested(NESTED_RESOURCE_LOCK)
    }
}

impl Drop for PmrGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: dropped exactly once, here; `locked` is not touched again.
        unsafe { ManuallyDrop::drop(&mut self.locked) };
        for pages in self.remnants.drain(..) {
            self.pmr.device().dispose_zombie_pages(pages);
        }
    }
}
