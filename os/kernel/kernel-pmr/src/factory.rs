//! # Backend capabilities
//!
//! A memory factory (OS page allocator, local memory carve-out, imported
//! dma-buf, ...) backs each resource with an object implementing
//! [`PhysBacking`]. Everything else is an optional capability the backend
//! opts into with [`FactoryOps::builder`]:
//!
//! | Capability       | Trait            | Without it                                 |
//! |------------------|------------------|--------------------------------------------|
//! | pin pages        | [`PhysLock`]     | locking only counts                        |
//! | kernel mappings  | [`KernelMap`]    | no kernel mapping, no fallback byte access |
//! | byte copies      | [`ByteAccess`]   | byte access through kernel mappings        |
//! | sparse changes   | [`SparseLayout`] | layout is fixed at creation                |
//! | factory lock     | [`FactoryLock`]  | no destroy vs. allocate serialisation      |
//!
//! Paired operations (lock/unlock, acquire/release) live in one trait, so a
//! backend cannot provide one half without the other.

use crate::addresses::DevPhysAddr;
use crate::error::PmrError;
use crate::flags::{PmrFlags, SparseResize};
use alloc::boxed::Box;
use alloc::sync::Arc;
use core::any::Any;
use core::fmt;
use core::ptr::NonNull;
use kernel_sync::{TicketMutex, TicketMutexGuard};

/// Intermediate physical address bits to merge into device addresses.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct IpaPolicy {
    /// Bits to set, already shifted into place.
    pub policy: u64,
    /// Bits to clear before applying `policy`, already shifted into place.
    pub clear_mask: u64,
}

impl IpaPolicy {
    /// Leave addresses untouched.
    pub const NONE: Self = Self {
        policy: 0,
        clear_mask: 0,
    };

    #[inline]
    #[must_use]
    pub const fn apply(self, addr: u64) -> u64 {
        (addr & !self.clear_mask) | self.policy
    }
}

/// Request for device addresses of translated pages.
#[derive(Debug)]
pub struct DevPhysQuery<'a> {
    pub log2_page_size: u32,
    /// One physical offset per page; `None` for pages without backing.
    pub phys_offsets: &'a [Option<u64>],
    pub ipa: IpaPolicy,
}

/// Mandatory part of every backend.
///
/// The object doubles as the resource's private data; see
/// [`Pmr::backing`](crate::Pmr::backing).
pub trait PhysBacking: Any + Send + Sync {
    /// Fill `out[i]` with the device address of `query.phys_offsets[i]`.
    /// Entries without backing stay `None`.
    ///
    /// # Errors
    /// Backend specific.
    fn dev_phys_addr(
        &self,
        query: &DevPhysQuery<'_>,
        out: &mut [Option<DevPhysAddr>],
    ) -> Result<(), PmrError>;

    /// Last call a backend receives for a resource.
    fn finalize(&self) {}

    /// The resource was parked on a zombie queue.
    ///
    /// # Errors
    /// Backend specific; reported but does not stop the resource from being
    /// parked.
    fn zombify(&self) -> Result<(), PmrError> {
        Ok(())
    }
}

/// Physical pages that can only be released once the device has dropped
/// every cached translation of them.
pub trait ZombiePages: Send {
    /// Release the pages.
    ///
    /// # Errors
    /// Transient failures; the pages stay queued and are offered again.
    fn free(&mut self) -> Result<(), PmrError>;

    /// Number of pages held, for diagnostics.
    fn page_count(&self) -> usize;
}

/// Pinning of physical pages.
pub trait PhysLock: Send + Sync {
    /// Pin (and, for on-demand resources, allocate) the pages.
    ///
    /// # Errors
    /// Backend specific.
    fn lock_phys_addresses(&self) -> Result<(), PmrError>;

    /// Unpin the pages. On-demand backends may hand back pages that must not
    /// be reused before the device cache is flushed.
    ///
    /// # Errors
    /// Backend specific.
    fn unlock_phys_addresses(&self) -> Result<Option<Box<dyn ZombiePages>>, PmrError>;
}

/// A CPU-visible window onto physical backing.
pub struct KernelMapping {
    ptr: NonNull<u8>,
    len: usize,
    handle: u64,
}

// SAFETY: the mapping is plain memory owned by the backend until released.
unsafe impl Send for KernelMapping {}

impl KernelMapping {
    /// # Safety
    /// `ptr` must be valid for reads and writes of `len` bytes until the
    /// mapping is handed back to [`KernelMap::release_kernel_mapping`], and
    /// nothing else may access those bytes concurrently except through the
    /// owning resource.
    #[must_use]
    pub const unsafe fn new(ptr: NonNull<u8>, len: usize, handle: u64) -> Self {
        Self { ptr, len, handle }
    }

    #[inline]
    #[must_use]
    pub const fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Backend cookie identifying the mapping.
    #[inline]
    #[must_use]
    pub const fn handle(&self) -> u64 {
        self.handle
    }

    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: guaranteed by the constructor contract.
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: guaranteed by the constructor contract.
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl fmt::Debug for KernelMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelMapping")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("handle", &self.handle)
            .finish()
    }
}

/// Kernel virtual mappings of the backing.
pub trait KernelMap: Send + Sync {
    /// Map `size` bytes at physical offset `offset`.
    ///
    /// # Errors
    /// Backend specific; [`PmrError::Retry`] while pages are migrating.
    fn acquire_kernel_mapping(
        &self,
        offset: u64,
        size: usize,
        flags: PmrFlags,
    ) -> Result<KernelMapping, PmrError>;

    fn release_kernel_mapping(&self, mapping: KernelMapping);
}

/// Direct copies to and from physical backing.
pub trait ByteAccess: Send + Sync {
    /// Copy into `buf` from physical offset `offset`; returns bytes copied.
    ///
    /// # Errors
    /// Backend specific.
    fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> Result<usize, PmrError>;

    /// Copy `buf` to physical offset `offset`; returns bytes copied.
    ///
    /// # Errors
    /// Backend specific.
    fn write_bytes(&self, offset: u64, buf: &[u8]) -> Result<usize, PmrError>;
}

/// A request to change which logical chunks are backed.
#[derive(Debug)]
pub struct SparseChange<'a> {
    /// Logical chunks to back, each at the identical physical chunk index.
    pub alloc: &'a [u32],
    /// Logical chunks to release.
    pub free: &'a [u32],
    pub flags: SparseResize,
    pub chunk_size: u64,
}

/// Runtime changes of a sparse layout.
pub trait SparseLayout: Send + Sync {
    /// Allocate and free chunks. Released pages may come back as remnants
    /// that must wait for a device cache flush.
    ///
    /// # Errors
    /// Backend specific; nothing changes on failure.
    fn change_sparse_mem(
        &self,
        change: &SparseChange<'_>,
    ) -> Result<Option<Box<dyn ZombiePages>>, PmrError>;
}

/// Lock a backend shares between all its resources to keep destruction and
/// allocation apart.
#[derive(Default)]
pub struct FactoryLock(TicketMutex<()>);

impl FactoryLock {
    #[must_use]
    pub const fn new() -> Self {
        Self(TicketMutex::new(()))
    }

    pub fn lock(&self) -> TicketMutexGuard<'_, ()> {
        self.0.lock()
    }
}

/// Kind of backend, for diagnostics.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PmrKind {
    OsPages,
    LocalMemory,
    DmaBuf,
    External,
    Secure,
    Other,
}

impl PmrKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OsPages => "OSMEM",
            Self::LocalMemory => "LMA",
            Self::DmaBuf => "DMABUF",
            Self::External => "EXTMEM",
            Self::Secure => "SECURE",
            Self::Other => "OTHER",
        }
    }
}

impl fmt::Display for PmrKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The capability set of one resource's backend, fixed at registration.
pub struct FactoryOps {
    pub(crate) kind: PmrKind,
    pub(crate) backing: Arc<dyn PhysBacking>,
    pub(crate) phys_lock: Option<Arc<dyn PhysLock>>,
    pub(crate) kernel_map: Option<Arc<dyn KernelMap>>,
    pub(crate) bytes: Option<Arc<dyn ByteAccess>>,
    pub(crate) sparse: Option<Arc<dyn SparseLayout>>,
    pub(crate) factory_lock: Option<Arc<FactoryLock>>,
}

impl FactoryOps {
    pub fn builder<B: PhysBacking>(kind: PmrKind, backing: Arc<B>) -> FactoryOpsBuilder<B> {
        FactoryOpsBuilder {
            ops: Self {
                kind,
                backing: backing.clone() as Arc<dyn PhysBacking>,
                phys_lock: None,
                kernel_map: None,
                bytes: None,
                sparse: None,
                factory_lock: None,
            },
            backing,
        }
    }

    #[inline]
    #[must_use]
    pub const fn kind(&self) -> PmrKind {
        self.kind
    }

    #[must_use]
    pub const fn has_phys_lock(&self) -> bool {
        self.phys_lock.is_some()
    }

    #[must_use]
    pub const fn has_kernel_map(&self) -> bool {
        self.kernel_map.is_some()
    }

    #[must_use]
    pub const fn has_byte_access(&self) -> bool {
        self.bytes.is_some()
    }

    #[must_use]
    pub const fn has_sparse_layout(&self) -> bool {
        self.sparse.is_some()
    }

    /// Take the backend-wide lock, if the backend has one.
    pub(crate) fn lock_factory(&self) -> Option<TicketMutexGuard<'_, ()>> {
        self.factory_lock.as_deref().map(FactoryLock::lock)
    }
}

impl fmt::Debug for FactoryOps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FactoryOps")
            .field("kind", &self.kind)
            .field("phys_lock", &self.has_phys_lock())
            .field("kernel_map", &self.has_kernel_map())
            .field("bytes", &self.has_byte_access())
            .field("sparse", &self.has_sparse_layout())
            .field("factory_lock", &self.factory_lock.is_some())
            .finish()
    }
}

/// Registers the capabilities a backend type implements.
pub struct FactoryOpsBuilder<B> {
    ops: FactoryOps,
    backing: Arc<B>,
}

impl<B: PhysBacking> FactoryOpsBuilder<B> {
    #[must_use]
    pub fn with_phys_lock(mut self) -> Self
    where
        B: PhysLock,
    {
        self.ops.phys_lock = Some(self.backing.clone() as Arc<dyn PhysLock>);
        self
    }

    #[must_use]
    pub fn with_kernel_map(mut self) -> Self
    where
        B: KernelMap,
    {
        self.ops.kernel_map = Some(self.backing.clone() as Arc<dyn KernelMap>);
        self
    }

    #[must_use]
    pub fn with_byte_access(mut self) -> Self
    where
        B: ByteAccess,
    {
        self.ops.bytes = Some(self.backing.clone() as Arc<dyn ByteAccess>);
        self
    }

    #[must_use]
    pub fn with_sparse_layout(mut self) -> Self
    where
        B: SparseLayout,
    {
        self.ops.sparse = Some(self.backing.clone() as Arc<dyn SparseLayout>);
        self
    }

    #[must_use]
    pub fn with_factory_lock(mut self, lock: Arc<FactoryLock>) -> Self {
        self.ops.factory_lock = Some(lock);
        self
    }

    #[must_use]
    pub fn build(self) -> FactoryOps {
        self.ops
    }
}
