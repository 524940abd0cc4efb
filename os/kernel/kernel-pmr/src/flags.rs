//! Bit-packed flag words.
//!
//! [`PmrFlags`] are the allocation flags a resource is created with; they
//! travel to the backend with every kernel mapping request. The remaining
//! words are engine-internal or describe a single request.

use bitfield_struct::bitfield;

/// CPU or GPU caching mode of the backing pages.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum CacheMode {
    Uncached = 0,
    WriteCombine = 1,
    Cached = 2,
    CachedCoherent = 3,
}

impl CacheMode {
    #[inline]
    pub const fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => Self::Uncached,
            1 => Self::WriteCombine,
            2 => Self::Cached,
            _ => Self::CachedCoherent,
        }
    }

    #[inline]
    pub const fn into_bits(self) -> u8 {
        self as u8
    }

    /// Whether the CPU may hold lines of this memory in its caches.
    #[inline]
    #[must_use]
    pub const fn is_cached(self) -> bool {
        matches!(self, Self::Cached | Self::CachedCoherent)
    }
}

/// Allocation flags of a resource.
#[bitfield(u64)]
#[derive(Eq, PartialEq)]
pub struct PmrFlags {
    /// CPU may read the memory (bit 0).
    pub cpu_readable: bool,
    /// CPU may write the memory (bit 1).
    pub cpu_writable: bool,
    /// Device may read the memory (bit 2).
    pub gpu_readable: bool,
    /// Device may write the memory (bit 3).
    pub gpu_writable: bool,

    /// CPU caching mode (bits 4..5).
    #[bits(2)]
    pub cpu_cache: CacheMode,

    /// Device caching mode (bits 6..7).
    #[bits(2)]
    pub gpu_cache: CacheMode,

    /// Physical backing is allocated on the first physical-address lock and
    /// released on the last unlock (bit 8).
    pub on_demand: bool,
    /// Backend zeroes pages when allocating them (bit 9).
    pub zero_on_alloc: bool,
    /// Backend poisons pages when allocating them (bit 10).
    pub poison_on_alloc: bool,
    /// Pages may be migrated by the OS while the resource is alive (bit 11).
    pub movable: bool,

    /// Per-allocation IPA policy override; zero selects the heap default
    /// (bits 12..19).
    #[bits(8)]
    pub ipa_policy: u8,

    #[bits(44)]
    __: u64,
}

impl PmrFlags {
    /// Readable and writable by both CPU and device, write-combined on the CPU.
    #[must_use]
    pub const fn read_write() -> Self {
        Self::new()
            .with_cpu_readable(true)
            .with_cpu_writable(true)
            .with_gpu_readable(true)
            .with_gpu_writable(true)
            .with_cpu_cache(CacheMode::WriteCombine)
            .with_gpu_cache(CacheMode::Uncached)
    }

    #[inline]
    #[must_use]
    pub const fn is_cpu_accessible(self) -> bool {
        self.cpu_readable() || self.cpu_writable()
    }
}

/// Engine-private state bits, guarded by the bitmap spinlock.
#[bitfield(u8)]
#[derive(Eq, PartialEq)]
pub struct InternalFlags {
    /// Logical and physical layout differ.
    pub sparse: bool,
    /// Physical layout may no longer change (set on export).
    pub layout_fixed: bool,
    /// Last unref parks the resource on the zombie queue.
    pub defer_free: bool,
    /// Resource sits on a zombie queue or in a cleanup batch.
    pub zombie: bool,
    /// Teardown ran; no further references can be taken.
    pub destroyed: bool,
    #[bits(3)]
    __: u8,
}

/// Which half of a sparse change request to act on.
#[bitfield(u8)]
#[derive(Eq, PartialEq)]
pub struct SparseResize {
    pub alloc: bool,
    pub free: bool,
    #[bits(6)]
    __: u8,
}

impl SparseResize {
    #[must_use]
    pub const fn alloc_and_free() -> Self {
        Self::new().with_alloc(true).with_free(true)
    }
}

/// How a physical-address query will be used.
#[bitfield(u8)]
#[derive(Eq, PartialEq)]
pub struct PhysAddrUsage {
    /// Addresses are programmed into the device.
    pub device: bool,
    /// Addresses are used by the CPU; IPA policy is not applied.
    pub cpu: bool,
    /// Addresses feed a new mapping; the caller holds the resource lock.
    pub mapping: bool,
    #[bits(5)]
    __: u8,
}

impl PhysAddrUsage {
    pub const DEVICE: Self = Self::new().with_device(true);
    pub const CPU: Self = Self::new().with_cpu(true);
    pub const CPU_MAPPING: Self = Self::new().with_cpu(true).with_mapping(true);
    pub const DEVICE_MAPPING: Self = Self::new().with_device(true).with_mapping(true);
}
