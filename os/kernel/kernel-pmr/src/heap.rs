use crate::addresses::{CpuPhysAddr, DevPhysAddr};
use crate::device::PmrDevice;
use crate::factory::IpaPolicy;
use crate::flags::PhysAddrUsage;
use alloc::sync::Arc;

/// Intermediate physical address configuration of a heap.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct IpaConfig {
    /// Bit position of the policy field in device addresses.
    pub shift: u32,
    /// Policy value used when the allocation does not override it.
    pub default_policy: u32,
    /// Bits of the policy field to clear before applying a policy.
    pub clear_mask: u32,
}

/// A region of physical memory a device allocates from.
///
/// Resources point at their heap to find their device, the IPA policy and
/// the device-to-CPU address offset.
#[derive(Debug)]
pub struct PhysHeap {
    name: &'static str,
    device: Arc<PmrDevice>,
    ipa: IpaConfig,
    cpu_base: CpuPhysAddr,
    dev_base: DevPhysAddr,
}

impl PhysHeap {
    /// A heap whose device and CPU addresses coincide, without IPA bits.
    #[must_use]
    pub const fn new(name: &'static str, device: Arc<PmrDevice>) -> Self {
        Self {
            name,
            device,
            ipa: IpaConfig {
                shift: 0,
                default_policy: 0,
                clear_mask: 0,
            },
            cpu_base: CpuPhysAddr::new(0),
            dev_base: DevPhysAddr::new(0),
        }
    }

    #[must_use]
    pub fn with_ipa(mut self, ipa: IpaConfig) -> Self {
        self.ipa = ipa;
        self
    }

    /// Device address `dev_base` is seen by the CPU at `cpu_base`.
    #[must_use]
    pub fn with_cpu_window(mut self, cpu_base: CpuPhysAddr, dev_base: DevPhysAddr) -> Self {
        self.cpu_base = cpu_base;
        self.dev_base = dev_base;
        self
    }

    #[inline]
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    #[must_use]
    pub const fn device(&self) -> &Arc<PmrDevice> {
        &self.device
    }

    #[inline]
    #[must_use]
    pub const fn ipa(&self) -> IpaConfig {
        self.ipa
    }

    /// IPA bits for a query. `override_policy` is the per-allocation policy;
    /// zero selects the heap default. CPU use never gets IPA bits.
    #[must_use]
    pub const fn ipa_policy(&self, override_policy: u8, usage: PhysAddrUsage) -> IpaPolicy {
        if usage.cpu() {
            return IpaPolicy::NONE;
        }
        let policy = if override_policy == 0 {
            self.ipa.default_policy
        } else {
            override_policy as u32
        };
        IpaPolicy {
            policy: (policy as u64) << self.ipa.shift,
            clear_mask: (self.ipa.clear_mask as u64) << self.ipa.shift,
        }
    }

    #[must_use]
    pub const fn dev_to_cpu(&self, addr: DevPhysAddr) -> CpuPhysAddr {
        CpuPhysAddr::new(
            addr.as_u64()
                .wrapping_sub(self.dev_base.as_u64())
                .wrapping_add(self.cpu_base.as_u64()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PmrConfig;

    fn heap() -> PhysHeap {
        let device = PmrDevice::new(0, "gpu0", PmrConfig::DEFAULT).unwrap();
        PhysHeap::new("gpu_local", device).with_ipa(IpaConfig {
            shift: 40,
            default_policy: 0b01,
            clear_mask: 0b11,
        })
    }

    #[test]
    fn ipa_override_wins_over_heap_default() {
        let heap = heap();
        assert_eq!(
            heap.ipa_policy(0, PhysAddrUsage::DEVICE),
            IpaPolicy {
                policy: 1 << 40,
                clear_mask: 0b11 << 40
            }
        );
        assert_eq!(heap.ipa_policy(0b10, PhysAddrUsage::DEVICE).policy, 0b10 << 40);
        assert_eq!(heap.ipa_policy(0b10, PhysAddrUsage::CPU), IpaPolicy::NONE);
    }

    #[test]
    fn cpu_window_translation() {
        let heap = heap().with_cpu_window(CpuPhysAddr::new(0x8000_0000), DevPhysAddr::new(0x1000));
        assert_eq!(
            heap.dev_to_cpu(DevPhysAddr::new(0x1234)),
            CpuPhysAddr::new(0x8000_0234)
        );
    }
}
