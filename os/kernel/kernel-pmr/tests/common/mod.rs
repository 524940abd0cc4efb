//! In-memory backend and fixtures shared by the integration tests.

#![allow(dead_code)]

use kernel_pmr::{
    ByteAccess, DevPhysAddr, DevPhysQuery, FactoryLock, FactoryOps, KernelMap, KernelMapping,
    PhysBacking, PhysHeap, PhysLock, Pmr, PmrConfig, PmrContext, PmrCreateInfo, PmrDevice,
    PmrError, PmrFlags, PmrKind, SecureExchange, SparseChange, SparseLayout, ZombiePages,
};
use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const PAGE: u64 = 0x1000;
pub const DEV_BASE: u64 = 0x8000_0000;

/// Pages handed back by the fake backend.
pub struct FakePages {
    pub pages: usize,
    pub freed: Arc<AtomicUsize>,
    /// Number of `free` calls that fail before one succeeds.
    pub failures: Arc<AtomicU32>,
}

impl ZombiePages for FakePages {
    fn free(&mut self) -> Result<(), PmrError> {
        if self
            .failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(PmrError::Retry);
        }
        self.freed.fetch_add(self.pages, Ordering::AcqRel);
        Ok(())
    }

    fn page_count(&self) -> usize {
        self.pages
    }
}

/// Physical memory backed by a heap buffer. Physical offset `n` lives at
/// device address `DEV_BASE + n`.
pub struct Ram {
    mem: Box<[UnsafeCell<u8>]>,
    pub lock_calls: AtomicU32,
    pub unlock_calls: AtomicU32,
    pub fail_next_lock: AtomicBool,
    pub finalized: AtomicBool,
    pub zombified: AtomicU32,
    pub maps_out: AtomicI32,
    /// Kernel mapping requests answered with `Retry` before one succeeds.
    pub map_retries: AtomicU32,
    /// Pages handed back on unlock and on sparse frees, per call.
    pub remnant_pages: AtomicUsize,
    pub pages_freed: Arc<AtomicUsize>,
    pub page_failures: Arc<AtomicU32>,
    pub sparse_changes: Mutex<Vec<(Vec<u32>, Vec<u32>)>>,
    pub fail_sparse: AtomicBool,
}

// SAFETY: the buffer is only touched through raw pointers by callers that
// own disjoint ranges or run single threaded.
unsafe impl Sync for Ram {}

impl Ram {
    pub fn new(size: u64) -> Arc<Self> {
        let size = usize::try_from(size).unwrap();
        Arc::new(Self {
            mem: (0..size).map(|_| UnsafeCell::new(0)).collect(),
            lock_calls: AtomicU32::new(0),
            unlock_calls: AtomicU32::new(0),
            fail_next_lock: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            zombified: AtomicU32::new(0),
            maps_out: AtomicI32::new(0),
            map_retries: AtomicU32::new(0),
            remnant_pages: AtomicUsize::new(0),
            pages_freed: Arc::new(AtomicUsize::new(0)),
            page_failures: Arc::new(AtomicU32::new(0)),
            sparse_changes: Mutex::new(Vec::new()),
            fail_sparse: AtomicBool::new(false),
        })
    }

    fn ptr(&self, offset: u64) -> *mut u8 {
        UnsafeCell::raw_get(self.mem.as_ptr()).wrapping_add(usize::try_from(offset).unwrap())
    }

    fn check(&self, offset: u64, len: usize) -> Result<(), PmrError> {
        let end = usize::try_from(offset).unwrap() + len;
        if end > self.mem.len() {
            return Err(PmrError::Factory("access beyond backing"));
        }
        Ok(())
    }

    /// Copy of physical bytes `range`.
    pub fn snapshot(&self, offset: u64, len: usize) -> Vec<u8> {
        let mut out = vec![0; len];
        self.read_bytes(offset, &mut out).unwrap();
        out
    }

    pub fn fill(&self, offset: u64, len: usize, value: u8) {
        self.write_bytes(offset, &vec![value; len]).unwrap();
    }

    fn remnant(&self) -> Option<Box<dyn ZombiePages>> {
        let pages = self.remnant_pages.load(Ordering::Acquire);
        (pages > 0).then(|| {
            Box::new(FakePages {
                pages,
                freed: Arc::clone(&self.pages_freed),
                failures: Arc::clone(&self.page_failures),
            }) as Box<dyn ZombiePages>
        })
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    pub fn freed_pages(&self) -> usize {
        self.pages_freed.load(Ordering::Acquire)
    }
}

impl PhysBacking for Ram {
    fn dev_phys_addr(
        &self,
        query: &DevPhysQuery<'_>,
        out: &mut [Option<DevPhysAddr>],
    ) -> Result<(), PmrError> {
        for (slot, offset) in out.iter_mut().zip(query.phys_offsets) {
            *slot = offset.map(|o| DevPhysAddr::new(query.ipa.apply(DEV_BASE + o)));
        }
        Ok(())
    }

    fn finalize(&self) {
        assert!(
            !self.finalized.swap(true, Ordering::AcqRel),
            "backend finalized twice"
        );
    }

    fn zombify(&self) -> Result<(), PmrError> {
        self.zombified.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

impl PhysLock for Ram {
    fn lock_phys_addresses(&self) -> Result<(), PmrError> {
        if self.fail_next_lock.swap(false, Ordering::AcqRel) {
            return Err(PmrError::OutOfMemory);
        }
        self.lock_calls.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn unlock_phys_addresses(&self) -> Result<Option<Box<dyn ZombiePages>>, PmrError> {
        self.unlock_calls.fetch_add(1, Ordering::AcqRel);
        Ok(self.remnant())
    }
}

impl KernelMap for Ram {
    fn acquire_kernel_mapping(
        &self,
        offset: u64,
        size: usize,
        _flags: PmrFlags,
    ) -> Result<KernelMapping, PmrError> {
        if self
            .map_retries
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(PmrError::Retry);
        }
        self.check(offset, size)?;
        self.maps_out.fetch_add(1, Ordering::AcqRel);
        let ptr = NonNull::new(self.ptr(offset)).ok_or(PmrError::Factory("null mapping"))?;
        // SAFETY: the range lies within `mem`, which outlives every mapping
        // the tests take.
        Ok(unsafe { KernelMapping::new(ptr, size, offset) })
    }

    fn release_kernel_mapping(&self, _mapping: KernelMapping) {
        self.maps_out.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ByteAccess for Ram {
    fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> Result<usize, PmrError> {
        self.check(offset, buf.len())?;
        // SAFETY: bounds checked above.
        unsafe { std::ptr::copy_nonoverlapping(self.ptr(offset), buf.as_mut_ptr(), buf.len()) };
        Ok(buf.len())
    }

    fn write_bytes(&self, offset: u64, buf: &[u8]) -> Result<usize, PmrError> {
        self.check(offset, buf.len())?;
        // SAFETY: bounds checked above.
        unsafe { std::ptr::copy_nonoverlapping(buf.as_ptr(), self.ptr(offset), buf.len()) };
        Ok(buf.len())
    }
}

impl SparseLayout for Ram {
    fn change_sparse_mem(
        &self,
        change: &SparseChange<'_>,
    ) -> Result<Option<Box<dyn ZombiePages>>, PmrError> {
        if self.fail_sparse.load(Ordering::Acquire) {
            return Err(PmrError::OutOfMemory);
        }
        for &chunk in change.alloc {
            let offset = u64::from(chunk) * change.chunk_size;
            self.fill(offset, usize::try_from(change.chunk_size).unwrap(), 0);
        }
        self.sparse_changes
            .lock()
            .unwrap()
            .push((change.alloc.to_vec(), change.free.to_vec()));
        Ok(if change.free.is_empty() {
            None
        } else {
            self.remnant()
        })
    }
}

/// Every capability of [`Ram`].
pub fn full_ops(ram: &Arc<Ram>) -> FactoryOps {
    FactoryOps::builder(PmrKind::OsPages, Arc::clone(ram))
        .with_phys_lock()
        .with_kernel_map()
        .with_byte_access()
        .with_sparse_layout()
        .build()
}

/// Kernel mappings but no direct byte access.
pub fn map_only_ops(ram: &Arc<Ram>) -> FactoryOps {
    FactoryOps::builder(PmrKind::LocalMemory, Arc::clone(ram))
        .with_phys_lock()
        .with_kernel_map()
        .build()
}

/// Secure handle broker keeping resources in a map.
#[derive(Default)]
pub struct Broker {
    handles: Mutex<HashMap<u32, Pmr>>,
    next: AtomicU32,
    pub refuse: AtomicBool,
}

impl SecureExchange for Broker {
    type Handle = u32;

    fn publish(&self, pmr: &Pmr) -> Result<u32, PmrError> {
        if self.refuse.load(Ordering::Acquire) {
            return Err(PmrError::Factory("broker full"));
        }
        let handle = self.next.fetch_add(1, Ordering::AcqRel) + 1;
        self.handles.lock().unwrap().insert(handle, pmr.clone());
        Ok(handle)
    }

    fn lookup(&self, handle: u32) -> Result<Pmr, PmrError> {
        self.handles
            .lock()
            .unwrap()
            .get(&handle)
            .cloned()
            .ok_or(PmrError::WrongPasswordOrStaleResource)
    }

    fn withdraw(&self, handle: u32) -> Result<Pmr, PmrError> {
        self.handles
            .lock()
            .unwrap()
            .remove(&handle)
            .ok_or(PmrError::WrongPasswordOrStaleResource)
    }
}

/// One context, one device, one heap.
pub struct Rig {
    pub ctx: Arc<PmrContext>,
    pub device: Arc<PmrDevice>,
    pub heap: Arc<PhysHeap>,
}

impl Rig {
    pub fn new() -> Self {
        Self::with_config(PmrConfig::DEFAULT)
    }

    pub fn with_config(config: PmrConfig) -> Self {
        let ctx = PmrContext::new(config, 0x5eed);
        let device = PmrDevice::new(0, "gpu0", config).unwrap();
        let heap = Arc::new(PhysHeap::new("gpu0_local", Arc::clone(&device)));
        Self { ctx, device, heap }
    }

    /// A second device and heap sharing this rig's context.
    pub fn peer(&self, id: u8, name: &'static str) -> (Arc<PmrDevice>, Arc<PhysHeap>) {
        let device = PmrDevice::new(id, name, *self.ctx.config()).unwrap();
        let heap = Arc::new(PhysHeap::new(name, Arc::clone(&device)));
        (device, heap)
    }

    pub fn dense(&self, size: u64) -> (Pmr, Arc<Ram>) {
        self.dense_with(size, PmrFlags::read_write())
    }

    pub fn dense_with(&self, size: u64, flags: PmrFlags) -> (Pmr, Arc<Ram>) {
        let ram = Ram::new(size);
        let pmr = Pmr::create(
            &self.ctx,
            &self.heap,
            full_ops(&ram),
            &PmrCreateInfo::dense(size, 12, flags).with_annotation("dense"),
        )
        .unwrap();
        (pmr, ram)
    }

    pub fn dense_on(&self, heap: &Arc<PhysHeap>, size: u64) -> (Pmr, Arc<Ram>) {
        let ram = Ram::new(size);
        let pmr = Pmr::create(
            &self.ctx,
            heap,
            full_ops(&ram),
            &PmrCreateInfo::dense(size, 12, PmrFlags::read_write()),
        )
        .unwrap();
        (pmr, ram)
    }

    /// `chunks` chunks of one page each, backed where listed.
    pub fn sparse(&self, chunks: u32, backed: &[u32]) -> (Pmr, Arc<Ram>) {
        let ram = Ram::new(PAGE * u64::from(chunks));
        let pmr = Pmr::create(
            &self.ctx,
            &self.heap,
            full_ops(&ram),
            &PmrCreateInfo::sparse(12, chunks, backed, PmrFlags::read_write())
                .with_annotation("sparse"),
        )
        .unwrap();
        (pmr, ram)
    }

    pub fn with_factory_lock(&self, size: u64, lock: &Arc<FactoryLock>) -> (Pmr, Arc<Ram>) {
        let ram = Ram::new(size);
        let ops = FactoryOps::builder(PmrKind::OsPages, Arc::clone(&ram))
            .with_phys_lock()
            .with_byte_access()
            .with_factory_lock(Arc::clone(lock))
            .build();
        let pmr = Pmr::create(
            &self.ctx,
            &self.heap,
            ops,
            &PmrCreateInfo::dense(size, 12, PmrFlags::read_write()),
        )
        .unwrap();
        (pmr, ram)
    }
}

/// Confirm every invalidation issued so far.
pub fn flush_mmu(device: &PmrDevice) {
    let seq = device.issue_mmu_invalidate();
    device.complete_mmu_invalidate(seq);
}
