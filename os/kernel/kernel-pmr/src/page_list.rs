//! Page lists, zeroing and page dumps of dense resources.

use crate::error::PmrError;
use crate::flags::PhysAddrUsage;
use crate::resource::Pmr;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Write;
use log::{debug, error, info};

/// Bytes per page list entry.
pub const PAGE_LIST_WORD_SIZE: u64 = 4;

const DUMP_COLUMNS: usize = 16;

/// Device page numbers of a reference resource, written into a list
/// resource. Keeps the reference pinned until unwritten or dropped.
#[derive(Debug)]
pub struct PageList {
    reference: Option<Pmr>,
}

impl PageList {
    /// The resource whose pages are listed.
    #[must_use]
    pub fn reference(&self) -> Option<&Pmr> {
        self.reference.as_ref()
    }

    /// Unpin the reference resource.
    ///
    /// # Errors
    /// As [`Pmr::unlock_physical_addresses`].
    pub fn unwrite(mut self) -> Result<(), PmrError> {
        self.reference
            .take()
            .map_or(Ok(()), |pmr| pmr.unlock_physical_addresses(1))
    }
}

impl Drop for PageList {
    fn drop(&mut self) {
        if let Some(pmr) = self.reference.take()
            && let Err(err) = pmr.unlock_physical_addresses(1)
        {
            error!("PMR {}: dropping page list failed: {err}", pmr.serial());
        }
    }
}

impl Pmr {
    /// Number of `1 << log2_page_size` pages in a resource that must be a
    /// whole number of them and not sparse.
    fn whole_pages(&self, log2_page_size: u32) -> Result<usize, PmrError> {
        if log2_page_size >= u64::BITS {
            return Err(PmrError::InvalidParams);
        }
        let size = self.logical_size();
        let pages = size >> log2_page_size;
        if pages << log2_page_size != size {
            return Err(PmrError::NotPageMultiple);
        }
        if self.is_sparse() {
            return Err(PmrError::InvalidParams);
        }
        usize::try_from(pages).map_err(|_| PmrError::InvalidParams)
    }

    /// Write the device page numbers of `reference` into this resource at
    /// `table_offset`, one little-endian `u32` per page of
    /// `1 << log2_page_size` bytes. `reference` stays pinned while the
    /// returned list lives.
    ///
    /// # Errors
    /// * [`PmrError::NotPageMultiple`] if `reference` is not a whole number
    ///   of pages or `table_len` is not a whole number of entries.
    /// * [`PmrError::InvalidParams`] for a table that does not fit, entries
    ///   that are not 32 bits, or a sparse resource.
    /// * [`PmrError::InvalidPmrFlags`] if this resource is CPU accessible or
    ///   CPU cached.
    pub fn write_page_list(
        &self,
        table_offset: u64,
        table_len: u64,
        reference: &Self,
        log2_page_size: u32,
    ) -> Result<PageList, PmrError> {
        if log2_page_size >= u64::BITS {
            return Err(PmrError::InvalidParams);
        }
        let size = reference.logical_size();
        let num_pages = size >> log2_page_size;
        if num_pages == 0 || num_pages << log2_page_size != size {
            return Err(PmrError::NotPageMultiple);
        }
        let word_size = table_len / num_pages;
        if word_size * num_pages != table_len {
            return Err(PmrError::NotPageMultiple);
        }
        if word_size != PAGE_LIST_WORD_SIZE {
            return Err(PmrError::InvalidParams);
        }
        let end = table_offset
            .checked_add(table_len)
            .ok_or(PmrError::InvalidParams)?;
        if end > self.logical_size() {
            return Err(PmrError::InvalidParams);
        }

        let flags = self.flags();
        if flags.is_cpu_accessible() || flags.cpu_cache().is_cached() {
            error!("PMR {}: page list must not be CPU mappable", self.serial());
            return Err(PmrError::InvalidPmrFlags);
        }
        if self.is_sparse() || reference.is_sparse() {
            return Err(PmrError::InvalidParams);
        }
        let num_pages = usize::try_from(num_pages).map_err(|_| PmrError::InvalidParams)?;

        reference.lock_physical_addresses(1)?;
        let list = PageList {
            reference: Some(reference.clone()),
        };

        let addrs = reference
            .lock()
            .dev_phys_addr(PhysAddrUsage::DEVICE, log2_page_size, num_pages, 0)?;
        let mut table = Vec::with_capacity(num_pages * 4);
        for addr in addrs {
            let addr = addr.ok_or(PmrError::BadMapping)?;
            let page = u32::try_from(addr.as_u64() >> log2_page_size)
                .map_err(|_| PmrError::InvalidParams)?;
            table.extend_from_slice(&page.to_le_bytes());
        }
        self.write_bytes(table_offset, &table)?;

        debug!(
            "PMR {}: page list of PMR {} written ({num_pages} pages)",
            self.serial(),
            reference.serial()
        );
        Ok(list)
    }

    /// Clear the resource page by page through kernel mappings.
    ///
    /// # Errors
    /// * [`PmrError::NotPageMultiple`] or [`PmrError::InvalidParams`] as for
    ///   [`write_page_list`](Self::write_page_list).
    /// * [`PmrError::InvalidParams`] if a mapping does not cover exactly
    ///   one page.
    /// * Mapping errors.
    pub fn zero(&self, log2_page_size: u32) -> Result<(), PmrError> {
        let num_pages = self.whole_pages(log2_page_size)?;
        let page_size = 1u64 << log2_page_size;

        self.with_phys_locked(|| {
            for page in 0..num_pages as u64 {
                let mut mapping = self.acquire_kernel_mapping(page * page_size, page_size)?;
                if mapping.len() as u64 != page_size {
                    error!(
                        "PMR {}: mapped {:#x} bytes for a {page_size:#x} page",
                        self.serial(),
                        mapping.len()
                    );
                    return Err(PmrError::InvalidParams);
                }
                mapping.as_mut_slice().fill(0);
            }
            Ok(())
        })?;
        debug!("PMR {} zeroed ({num_pages} pages)", self.serial());
        Ok(())
    }

    /// Log the device address of every page, sixteen per line.
    ///
    /// # Errors
    /// As [`zero`](Self::zero), plus address query errors.
    pub fn dump_page_list(&self, log2_page_size: u32) -> Result<(), PmrError> {
        let num_pages = self.whole_pages(log2_page_size)?;
        let addrs = self.with_phys_locked(|| {
            self.lock()
                .dev_phys_addr(PhysAddrUsage::DEVICE, log2_page_size, num_pages, 0)
        })?;

        info!(
            "PMR {} \"{}\": {num_pages} pages of {:#x} bytes",
            self.serial(),
            self.annotation(),
            1u64 << log2_page_size
        );
        for row in addrs.chunks(DUMP_COLUMNS) {
            let mut line = String::new();
            for addr in row {
                match addr {
                    Some(addr) => write!(line, " {:#010x}", addr.as_u64() >> log2_page_size).ok(),
                    None => write!(line, " {:>10}", "-").ok(),
                };
            }
            info!("{line}");
        }
        Ok(())
    }
}
