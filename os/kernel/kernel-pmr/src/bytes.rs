//! Byte access to the backing of a resource.
//!
//! Copies go chunk by chunk through the mapping table. Backed chunks use the
//! backend's [`ByteAccess`](crate::ByteAccess) if it has one and a temporary
//! kernel mapping otherwise; holes read as zeroes and swallow writes.

use crate::error::PmrError;
use crate::resource::Pmr;
use log::warn;

enum Transfer<'b> {
    Read(&'b mut [u8]),
    Write(&'b [u8]),
}

impl Transfer<'_> {
    fn len(&self) -> usize {
        match self {
            Self::Read(buf) => buf.len(),
            Self::Write(buf) => buf.len(),
        }
    }
}

impl Pmr {
    /// Read up to `buf.len()` bytes from `logical_offset`; returns the bytes
    /// produced, which stops short at the end of the resource.
    ///
    /// # Errors
    /// * [`PmrError::InvalidParams`] if the range overflows or starts past
    ///   the end.
    /// * Backend errors.
    pub fn read_bytes(&self, logical_offset: u64, buf: &mut [u8]) -> Result<usize, PmrError> {
        self.copy_bytes(logical_offset, Transfer::Read(buf))
    }

    /// Write up to `buf.len()` bytes at `logical_offset`; returns the bytes
    /// consumed. Bytes falling into unbacked chunks count as consumed.
    ///
    /// # Errors
    /// As [`read_bytes`](Self::read_bytes).
    pub fn write_bytes(&self, logical_offset: u64, buf: &[u8]) -> Result<usize, PmrError> {
        self.copy_bytes(logical_offset, Transfer::Write(buf))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn copy_bytes(&self, logical_offset: u64, mut copy: Transfer<'_>) -> Result<usize, PmrError> {
        let logical_size = self.logical_size();
        let end = logical_offset
            .checked_add(copy.len() as u64)
            .ok_or(PmrError::InvalidParams)?;
        if logical_offset > logical_size {
            return Err(PmrError::InvalidParams);
        }
        // Bounded by `copy.len()`.
        let len = (end.min(logical_size) - logical_offset) as usize;

        let mut done = 0;
        let mut total = 0;
        while done < len {
            let at = logical_offset + done as u64;
            let translation = self
                .0
                .locked
                .lock()
                .table
                .translate(0, 1, at, logical_size)?;
            // Bounded by `len - done`.
            let step = translation.bytes_remain.min((len - done) as u64) as usize;
            let range = done..done + step;

            total += match (translation.first(), &mut copy) {
                (Some(phys), Transfer::Read(buf)) => self.read_phys(phys, &mut buf[range])?,
                (Some(phys), Transfer::Write(buf)) => self.write_phys(phys, &buf[range])?,
                (None, Transfer::Read(buf)) => {
                    warn!("PMR {}: read of unbacked offset {at:#x}", self.serial());
                    buf[range].fill(0);
                    step
                }
                (None, Transfer::Write(_)) => step,
            };
            done += step;
        }
        Ok(total)
    }

    fn read_phys(&self, phys_offset: u64, buf: &mut [u8]) -> Result<usize, PmrError> {
        self.with_phys_locked(|| match self.0.ops.bytes.as_deref() {
            Some(bytes) => bytes.read_bytes(phys_offset, buf),
            None => {
                let kmap = self.0.ops.kernel_map.as_deref().ok_or(PmrError::NotImplemented)?;
                let mapping = self.map_phys(kmap, phys_offset, buf.len() as u64)?;
                let n = mapping.len().min(buf.len());
                buf[..n].copy_from_slice(&mapping.as_slice()[..n]);
                kmap.release_kernel_mapping(mapping);
                Ok(n)
            }
        })
    }

    fn write_phys(&self, phys_offset: u64, buf: &[u8]) -> Result<usize, PmrError> {
        self.with_phys_locked(|| match self.0.ops.bytes.as_deref() {
            Some(bytes) => bytes.write_bytes(phys_offset, buf),
            None => {
                let kmap = self.0.ops.kernel_map.as_deref().ok_or(PmrError::NotImplemented)?;
                let mut mapping = self.map_phys(kmap, phys_offset, buf.len() as u64)?;
                let n = mapping.len().min(buf.len());
                mapping.as_mut_slice()[..n].copy_from_slice(&buf[..n]);
                kmap.release_kernel_mapping(mapping);
                Ok(n)
            }
        })
    }

    /// Run `f` with the backing pinned.
    pub(crate) fn with_phys_locked<T>(
        &self,
        f: impl FnOnce() -> Result<T, PmrError>,
    ) -> Result<T, PmrError> {
        self.lock_physical_addresses(1)?;
        let result = f();
        let unlocked = self.unlock_physical_addresses(1);
        let value = result?;
        unlocked?;
        Ok(value)
    }
}
