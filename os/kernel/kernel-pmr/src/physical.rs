//! # Physical addresses and layout changes
//!
//! Everything here needs the backing pinned ([`Pmr::lock_physical_addresses`])
//! and most of it the resource lock ([`PmrGuard`]):
//!
//! * device and CPU physical addresses, with the IPA policy of the heap;
//! * the page migration sub-state, during which address queries for new
//!   mappings wait (CPU) or bounce with [`PmrError::Retry`] (device);
//! * runtime changes of a sparse layout;
//! * GPU mapping bookkeeping;
//! * kernel mappings of the backing, handed out as [`MappedRange`].

use crate::addresses::{CpuPhysAddr, DevPhysAddr};
use crate::error::PmrError;
use crate::factory::{DevPhysQuery, KernelMap, KernelMapping, SparseChange};
use crate::flags::{PhysAddrUsage, SparseResize};
use crate::mapping_table::MappingTable;
use crate::resource::{GpuMappingId, Pmr, PmrGuard};
use alloc::vec;
use alloc::vec::Vec;
use kernel_sync::MutexGuard;
use log::{debug, error, trace};

impl Pmr {
    /// Device addresses of `num_pages` pages of `1 << log2_page_size` bytes
    /// from `logical_offset`; `None` for unbacked pages.
    ///
    /// # Errors
    /// * [`PmrError::NotPermitted`] while the backing is not pinned.
    /// * [`PmrError::Retry`] while pages migrate.
    /// * Translation and backend errors.
    pub fn dev_phys_addr(
        &self,
        log2_page_size: u32,
        num_pages: usize,
        logical_offset: u64,
    ) -> Result<Vec<Option<DevPhysAddr>>, PmrError> {
        self.lock()
            .dev_phys_addr(PhysAddrUsage::DEVICE, log2_page_size, num_pages, logical_offset)
    }

    /// CPU physical addresses of the same pages. Waits for a migration in
    /// flight.
    ///
    /// # Errors
    /// As [`dev_phys_addr`](Self::dev_phys_addr), except [`PmrError::Retry`].
    pub fn cpu_phys_addr(
        &self,
        log2_page_size: u32,
        num_pages: usize,
        logical_offset: u64,
    ) -> Result<Vec<Option<CpuPhysAddr>>, PmrError> {
        let dev = self.lock().dev_phys_addr(
            PhysAddrUsage::CPU,
            log2_page_size,
            num_pages,
            logical_offset,
        )?;
        let heap = self.heap();
        Ok(dev
            .into_iter()
            .map(|addr| addr.map(|addr| heap.dev_to_cpu(addr)))
            .collect())
    }

    fn query_dev_phys_addr(
        &self,
        table: &MappingTable,
        usage: PhysAddrUsage,
        log2_page_size: u32,
        num_pages: usize,
        logical_offset: u64,
    ) -> Result<Vec<Option<DevPhysAddr>>, PmrError> {
        if self.lock_count() == 0 {
            error!("PMR {}: physical addresses queried while unlocked", self.serial());
            return Err(PmrError::NotPermitted);
        }
        let translation =
            table.translate(log2_page_size, num_pages, logical_offset, self.logical_size())?;
        let query = DevPhysQuery {
            log2_page_size,
            phys_offsets: &translation.offsets,
            ipa: self.heap().ipa_policy(self.ipa_policy(), usage),
        };
        let mut out = vec![None; num_pages];
        self.0.ops.backing.dev_phys_addr(&query, &mut out)?;
        Ok(out)
    }

    /// Change which chunks of a sparse resource are backed.
    ///
    /// # Errors
    /// See [`PmrGuard::change_sparse_mem`].
    pub fn change_sparse_mem(
        &self,
        alloc: &[u32],
        free: &[u32],
        flags: SparseResize,
    ) -> Result<(), PmrError> {
        self.lock().change_sparse_mem(alloc, free, flags)
    }

    /// Map part of a non-sparse resource into the kernel.
    ///
    /// `size` zero maps the rest of the resource; sizes up to one CPU page
    /// map a whole page. The length is clamped to the resource. The caller
    /// keeps the backing pinned while the mapping lives.
    ///
    /// # Errors
    /// * [`PmrError::NotPermitted`] for sparse resources.
    /// * [`PmrError::NotImplemented`] without kernel map support.
    /// * [`PmrError::InvalidParams`] for an offset past the end.
    pub fn acquire_kernel_mapping(
        &self,
        logical_offset: u64,
        size: u64,
    ) -> Result<MappedRange<'_>, PmrError> {
        if self.is_sparse() {
            return Err(PmrError::NotPermitted);
        }
        self.map_logical(logical_offset, size)
    }

    /// Map the backed part of one chunk of any resource into the kernel.
    ///
    /// The mapping ends at the chunk boundary.
    ///
    /// # Errors
    /// * [`PmrError::BadMapping`] if the chunk at `logical_offset` is not
    ///   backed.
    /// * Otherwise as [`acquire_kernel_mapping`](Self::acquire_kernel_mapping).
    pub fn acquire_sparse_kernel_mapping(
        &self,
        logical_offset: u64,
        size: u64,
    ) -> Result<MappedRange<'_>, PmrError> {
        self.map_logical(logical_offset, size)
    }

    fn map_logical(&self, logical_offset: u64, size: u64) -> Result<MappedRange<'_>, PmrError> {
        let kmap = self.0.ops.kernel_map.as_deref().ok_or(PmrError::NotImplemented)?;
        let logical_size = self.logical_size();
        if logical_offset >= logical_size {
            return Err(PmrError::InvalidParams);
        }

        let page = self.0.ctx.config().cpu_page_size;
        let wanted = match size {
            0 => logical_size,
            s if s > page => s,
            _ => page,
        };
        let translation = self.0.locked.lock().table.translate(
            0,
            1,
            logical_offset,
            logical_size,
        )?;
        let phys = translation.first().ok_or(PmrError::BadMapping)?;
        let len = wanted
            .min(logical_size - logical_offset)
            .min(translation.bytes_remain);

        self.increment_kernel_cpu_map_count();
        match self.map_phys(kmap, phys, len) {
            Ok(mapping) => Ok(MappedRange {
                pmr: self,
                mapping: Some(mapping),
            }),
            Err(err) => {
                self.decrement_kernel_cpu_map_count();
                Err(err)
            }
        }
    }

    /// Backend mapping of a physical range. Movable resources retry once
    /// a migration in flight completes; without one the backend's
    /// [`PmrError::Retry`] goes to the caller.
    pub(crate) fn map_phys(
        &self,
        kmap: &dyn KernelMap,
        phys_offset: u64,
        len: u64,
    ) -> Result<KernelMapping, PmrError> {
        let len = usize::try_from(len).map_err(|_| PmrError::InvalidParams)?;
        loop {
            match kmap.acquire_kernel_mapping(phys_offset, len, self.flags()) {
                Err(PmrError::Retry)
                    if self.flags().movable() && !self.0.migration.is_completed() =>
                {
                    trace!("PMR {}: kernel mapping waits for migration", self.serial());
                    self.0.migration.wait();
                }
                result => return result,
            }
        }
    }
}

impl PmrGuard<'_> {
    /// Device addresses for `usage`.
    ///
    /// While pages migrate, device use fails with [`PmrError::Retry`] and
    /// everything else drops the resource lock until the migration
    /// completes.
    ///
    /// # Errors
    /// As [`Pmr::dev_phys_addr`].
    pub fn dev_phys_addr(
        &mut self,
        usage: PhysAddrUsage,
        log2_page_size: u32,
        num_pages: usize,
        logical_offset: u64,
    ) -> Result<Vec<Option<DevPhysAddr>>, PmrError> {
        let pmr = self.pmr;
        if pmr.0.ctx.config().page_migration {
            while self.is_migrating() {
                if usage.device() {
                    return Err(PmrError::Retry);
                }
                let migration = &pmr.0.migration;
                MutexGuard::unlocked(&mut *self.locked, || migration.wait());
            }
        }
        pmr.query_dev_phys_addr(
            &self.locked.table,
            usage,
            log2_page_size,
            num_pages,
            logical_offset,
        )
    }

    #[must_use]
    pub fn is_migrating(&self) -> bool {
        !self.pmr.0.migration.is_completed()
    }

    /// Pages are about to move.
    pub fn notify_migrate_in_progress(&mut self) {
        self.pmr.0.migration.reinit();
        debug!("PMR {} migrating", self.pmr.serial());
    }

    /// Pages have moved; wakes everyone waiting for addresses.
    pub fn notify_migrate_complete(&mut self) {
        self.pmr.0.migration.complete_all();
        debug!("PMR {} migration complete", self.pmr.serial());
    }

    /// Back the chunks in `alloc` and release those in `free`, each half
    /// only if selected in `flags`.
    ///
    /// Page remnants the backend hands back go to the zombie path when the
    /// guard is dropped.
    ///
    /// # Errors
    /// * [`PmrError::NotPermitted`] for non-sparse resources, a fixed layout
    ///   or while a client CPU mapping exists.
    /// * [`PmrError::NotImplemented`] without sparse layout support.
    /// * [`PmrError::InvalidChunk`] for bad indices.
    /// * The backend's error; the layout is unchanged then.
    pub fn change_sparse_mem(
        &mut self,
        alloc: &[u32],
        free: &[u32],
        flags: SparseResize,
    ) -> Result<(), PmrError> {
        let pmr = self.pmr;
        let state = pmr.0.state.lock().flags;
        if !state.sparse() || state.layout_fixed() || pmr.is_client_cpu_mapped() {
            return Err(PmrError::NotPermitted);
        }
        let sparse = pmr.0.ops.sparse.as_deref().ok_or(PmrError::NotImplemented)?;

        let alloc = if flags.alloc() { alloc } else { &[] };
        let free = if flags.free() { free } else { &[] };
        self.locked.table.validate_change(alloc, free)?;

        let change = SparseChange {
            alloc,
            free,
            flags,
            chunk_size: self.locked.table.chunk_size(),
        };
        let remnants = sparse.change_sparse_mem(&change)?;
        self.locked.table.apply_change(alloc, free);
        if let Some(pages) = remnants {
            self.remnants.push(pages);
        }
        debug!(
            "PMR {}: {} chunks allocated, {} freed",
            pmr.serial(),
            alloc.len(),
            free.len()
        );
        Ok(())
    }

    pub fn link_gpu_mapping(&mut self, mapping: GpuMappingId) {
        self.locked.gpu_mappings.push(mapping);
    }

    /// # Errors
    /// [`PmrError::InvalidParams`] if `mapping` is not linked.
    pub fn unlink_gpu_mapping(&mut self, mapping: GpuMappingId) -> Result<(), PmrError> {
        let mappings = &mut self.locked.gpu_mappings;
        let pos = mappings
            .iter()
            .position(|m| *m == mapping)
            .ok_or(PmrError::InvalidParams)?;
        mappings.swap_remove(pos);
        Ok(())
    }

    #[must_use]
    pub fn gpu_mappings(&self) -> &[GpuMappingId] {
        &self.locked.gpu_mappings
    }

    /// # Errors
    /// [`PmrError::RefcountOverflow`] on overflow.
    pub fn increment_gpu_resource_count(&mut self) -> Result<(), PmrError> {
        let count = &mut self.locked.gpu_resources;
        *count = count.checked_add(1).ok_or(PmrError::RefcountOverflow)?;
        Ok(())
    }

    /// # Errors
    /// [`PmrError::RefcountOverflow`] if the count is already zero.
    pub fn decrement_gpu_resource_count(&mut self) -> Result<(), PmrError> {
        let count = &mut self.locked.gpu_resources;
        *count = count.checked_sub(1).ok_or_else(|| {
            error!("PMR {}: GPU resource count underflow", self.pmr.serial());
            PmrError::RefcountOverflow
        })?;
        Ok(())
    }

    #[must_use]
    pub fn gpu_resource_count(&self) -> u32 {
        self.locked.gpu_resources
    }

    /// More than one GPU resource is built on this memory.
    #[must_use]
    pub fn is_gpu_multi_mapped(&self) -> bool {
        self.locked.gpu_resources > 1
    }
}

/// A kernel mapping of part of a resource, released on drop.
pub struct MappedRange<'a> {
    pmr: &'a Pmr,
    mapping: Option<KernelMapping>,
}

impl MappedRange<'_> {
    #[must_use]
    pub fn len(&self) -> usize {
        self.mapping.as_ref().map_or(0, KernelMapping::len)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        match &self.mapping {
            Some(mapping) => mapping.as_slice(),
            None => &[],
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.mapping {
            Some(mapping) => mapping.as_mut_slice(),
            None => &mut [],
        }
    }

    /// Backend handle of the mapping.
    #[must_use]
    pub fn handle(&self) -> Option<u64> {
        self.mapping.as_ref().map(KernelMapping::handle)
    }

    /// Release the mapping now.
    pub fn release(mut self) {
        self.release_mapping();
    }

    fn release_mapping(&mut self) {
        let Some(mapping) = self.mapping.take() else {
            return;
        };
        if let Some(kmap) = self.pmr.0.ops.kernel_map.as_deref() {
            kmap.release_kernel_mapping(mapping);
        }
        self.pmr.decrement_kernel_cpu_map_count();
    }
}

impl Drop for MappedRange<'_> {
    fn drop(&mut self) {
        self.release_mapping();
    }
}
