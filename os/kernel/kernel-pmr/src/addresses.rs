use core::fmt;
use core::ops::Add;

/// Address of a byte as seen by the device, after heap translation and IPA
/// policy have been applied.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DevPhysAddr(u64);

/// Address of a byte as seen by the CPU.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CpuPhysAddr(u64);

macro_rules! phys_addr_impls {
    ($ty:ident, $tag:literal) => {
        impl $ty {
            #[inline]
            #[must_use]
            pub const fn new(v: u64) -> Self {
                Self(v)
            }

            #[inline]
            #[must_use]
            pub const fn as_u64(self) -> u64 {
                self.0
            }

            #[inline]
            #[must_use]
            pub const fn is_aligned_to(self, align: u64) -> bool {
                debug_assert!(align.is_power_of_two());
                self.0 & (align - 1) == 0
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($tag, "(0x{:016X})"), self.0)
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{:016X}", self.0)
            }
        }

        impl From<u64> for $ty {
            #[inline]
            fn from(v: u64) -> Self {
                Self::new(v)
            }
        }

        impl Add<u64> for $ty {
            type Output = Self;

            #[inline]
            fn add(self, rhs: u64) -> Self::Output {
                Self(self.0 + rhs)
            }
        }
    };
}

phys_addr_impls!(DevPhysAddr, "DEV");
phys_addr_impls!(CpuPhysAddr, "CPU");
