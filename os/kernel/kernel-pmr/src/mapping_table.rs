//! # Logical to physical chunk translation
//!
//! A resource is a run of `num_logical_chunks` logical chunks of
//! `chunk_size` bytes. Each logical chunk is either backed by a physical
//! chunk or a hole:
//!
//! ```text
//!  logical   | 0 | 1 | 2 | 3 | 4 | 5 | 6 | 7 |
//!  physical  | 0 | 1 | - | - | 4 | - | - | 7 |     (- = no backing)
//! ```
//!
//! Backed chunks always sit at the physical index equal to their logical
//! index. A dense table (every chunk backed) translates offsets one to one
//! and takes an O(1) path.

use crate::error::PmrError;
use alloc::vec;
use alloc::vec::Vec;

/// Result of translating a run of pages.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Translation {
    /// Physical offset for each page, `None` where the page is not backed.
    pub offsets: Vec<Option<u64>>,
    /// Bytes left in the chunk (or, for dense tables, in the resource) from
    /// the first translated offset.
    pub bytes_remain: u64,
}

impl Translation {
    #[inline]
    #[must_use]
    pub fn first(&self) -> Option<u64> {
        self.offsets.first().copied().flatten()
    }

    #[must_use]
    pub fn valid(&self) -> Vec<bool> {
        self.offsets.iter().map(Option::is_some).collect()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MappingTable {
    chunk_size: u64,
    num_phys_chunks: u32,
    translation: Vec<Option<u32>>,
}

impl MappingTable {
    /// Build a table with the logical chunks listed in `backed` placed at the
    /// identical physical index.
    ///
    /// # Errors
    /// * [`PmrError::BadMappingTableSize`] if more chunks are backed than exist,
    ///   or the chunk size is zero.
    /// * [`PmrError::InvalidChunk`] if an index is out of range or repeated.
    pub fn new(
        chunk_size: u64,
        num_logical_chunks: u32,
        num_phys_chunks: u32,
        backed: &[u32],
    ) -> Result<Self, PmrError> {
        if chunk_size == 0 || num_phys_chunks > num_logical_chunks {
            return Err(PmrError::BadMappingTableSize);
        }
        if backed.len() != num_phys_chunks as usize {
            return Err(PmrError::BadMappingTableSize);
        }

        let mut translation = vec![None; num_logical_chunks as usize];
        for &index in backed {
            let slot = translation
                .get_mut(index as usize)
                .ok_or(PmrError::InvalidChunk)?;
            if slot.replace(index).is_some() {
                return Err(PmrError::InvalidChunk);
            }
        }

        Ok(Self {
            chunk_size,
            num_phys_chunks,
            translation,
        })
    }

    #[inline]
    #[must_use]
    pub const fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn num_logical_chunks(&self) -> u32 {
        // Bounded by the `u32` count the table was built from.
        self.translation.len() as u32
    }

    #[inline]
    #[must_use]
    pub const fn num_phys_chunks(&self) -> u32 {
        self.num_phys_chunks
    }

    /// Every logical chunk is backed.
    #[inline]
    #[must_use]
    pub fn is_dense(&self) -> bool {
        self.num_phys_chunks == self.num_logical_chunks()
    }

    #[inline]
    #[must_use]
    pub fn is_chunk_backed(&self, index: u32) -> bool {
        matches!(self.translation.get(index as usize), Some(Some(_)))
    }

    /// Physical chunk backing logical chunk `index`.
    #[inline]
    #[must_use]
    pub fn physical_index(&self, index: u32) -> Option<u32> {
        self.translation.get(index as usize).copied().flatten()
    }

    /// Bytes of physical backing.
    #[inline]
    #[must_use]
    pub fn backed_size(&self) -> u64 {
        self.chunk_size * u64::from(self.num_phys_chunks)
    }

    /// Translate `num_pages` pages of `1 << log2_page_size` bytes starting at
    /// `logical_offset`.
    ///
    /// The first page keeps the unaligned offset; later pages start at the
    /// page-aligned-down offset plus a whole number of pages.
    ///
    /// # Errors
    /// [`PmrError::BadMapping`] if a page falls beyond the last logical chunk,
    /// [`PmrError::InvalidParams`] for an empty request.
    pub fn translate(
        &self,
        log2_page_size: u32,
        num_pages: usize,
        logical_offset: u64,
        logical_size: u64,
    ) -> Result<Translation, PmrError> {
        if num_pages == 0 || log2_page_size >= u64::BITS {
            return Err(PmrError::InvalidParams);
        }
        let page_size = 1u64 << log2_page_size;
        let mut offsets = Vec::with_capacity(num_pages);

        if self.is_dense() {
            let bytes_remain = logical_size
                .checked_sub(logical_offset)
                .ok_or(PmrError::BadMapping)?;
            offsets.push(Some(logical_offset));
            let mut offset = logical_offset & !(page_size - 1);
            for _ in 1..num_pages {
                offset += page_size;
                offsets.push(Some(offset));
            }
            return Ok(Translation {
                offsets,
                bytes_remain,
            });
        }

        let mut offset = logical_offset;
        let mut bytes_remain = 0;
        for page in 0..num_pages {
            let chunk = offset / self.chunk_size;
            let within = offset % self.chunk_size;
            if chunk >= u64::from(self.num_logical_chunks()) {
                return Err(PmrError::BadMapping);
            }

            #[allow(clippy::cast_possible_truncation)]
            let phys = self.translation[chunk as usize]
                .map(|index| u64::from(index) * self.chunk_size + within);
            offsets.push(phys);

            if page == 0 {
                bytes_remain = self.chunk_size - within;
                offset &= !(page_size - 1);
            }
            offset += page_size;
        }

        Ok(Translation {
            offsets,
            bytes_remain,
        })
    }

    /// Check a sparse change request against the current table without
    /// modifying it.
    ///
    /// # Errors
    /// [`PmrError::InvalidChunk`] if an index is out of range, an alloc index
    /// is already backed, a free index is not backed, or an index repeats.
    pub fn validate_change(&self, alloc: &[u32], free: &[u32]) -> Result<(), PmrError> {
        let mut touched = vec![false; self.translation.len()];
        for (&index, want_backed) in alloc
            .iter()
            .map(|i| (i, false))
            .chain(free.iter().map(|i| (i, true)))
        {
            let slot = self
                .translation
                .get(index as usize)
                .ok_or(PmrError::InvalidChunk)?;
            if slot.is_some() != want_backed || core::mem::replace(&mut touched[index as usize], true)
            {
                return Err(PmrError::InvalidChunk);
            }
        }
        Ok(())
    }

    /// Back the chunks in `alloc` and drop the backing of those in `free`.
    /// The request must have passed [`validate_change`](Self::validate_change).
    pub fn apply_change(&mut self, alloc: &[u32], free: &[u32]) {
        for &index in free {
            if self.translation[index as usize].take().is_some() {
                self.num_phys_chunks -= 1;
            }
        }
        for &index in alloc {
            if self.translation[index as usize].replace(index).is_none() {
                self.num_phys_chunks += 1;
            }
        }
    }
}
