use crate::config::PmrConfig;
use crate::error::PmrError;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};
use kernel_sync::SpinMutex;
use log::{debug, error};

/// Identity handed to a new resource.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Identity {
    /// Unique within the context, starting at 1.
    pub serial: u64,
    /// Export password.
    pub key: u64,
}

struct IdState {
    next_serial: u64,
    next_key: u64,
}

/// Shared state of one PMR engine instance: identity generator, live
/// resource count and configuration.
///
/// Every resource keeps the context alive; [`deinit`](Self::deinit) refuses
/// to proceed while any of them is still around.
pub struct PmrContext {
    config: PmrConfig,
    ids: SpinMutex<IdState>,
    live: AtomicUsize,
}

impl PmrContext {
    /// `seed` perturbs the export passwords; pass something that differs
    /// between boots.
    #[must_use]
    pub fn new(config: PmrConfig, seed: u64) -> Arc<Self> {
        Arc::new(Self {
            config,
            ids: SpinMutex::new(IdState {
                next_serial: 1,
                next_key: 0x8300_f001_u64.wrapping_mul(seed),
            }),
            live: AtomicUsize::new(0),
        })
    }

    #[inline]
    #[must_use]
    pub const fn config(&self) -> &PmrConfig {
        &self.config
    }

    /// Resources created and not yet destroyed.
    #[inline]
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Allocate the next identity and build the object carrying it.
    ///
    /// The object's address is folded into the key sequence so passwords
    /// depend on allocation history as well as on the seed.
    pub(crate) fn register<T>(&self, build: impl FnOnce(Identity) -> Arc<T>) -> Arc<T> {
        let mut ids = self.ids.lock();
        let identity = Identity {
            serial: ids.next_serial,
            key: ids.next_key,
        };
        let object = build(identity);

        let address = Arc::as_ptr(&object) as usize as u64;
        ids.next_serial += 1;
        ids.next_key =
            0x8020_0003_u64.wrapping_mul(ids.next_key) ^ 0xf00f_0081_u64.wrapping_mul(address);
        drop(ids);

        self.live.fetch_add(1, Ordering::AcqRel);
        object
    }

    pub(crate) fn retire(&self) {
        let prev = self.live.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "live resource count underflow");
    }

    /// Check that the engine can be torn down.
    ///
    /// # Errors
    /// [`PmrError::LiveResources`] while resources are still live. Tearing
    /// down anyway would leak their physical memory.
    pub fn deinit(&self) -> Result<(), PmrError> {
        match self.live_count() {
            0 => {
                debug!("PMR context torn down");
                Ok(())
            }
            live => {
                error!("refusing PMR teardown with {live} live resources");
                Err(PmrError::LiveResources { live })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serials_are_monotonic_and_keys_differ() {
        let ctx = PmrContext::new(PmrConfig::DEFAULT, 7);
        let a = ctx.register(Arc::new);
        let b = ctx.register(Arc::new);
        assert_eq!(a.serial, 1);
        assert_eq!(b.serial, 2);
        assert_eq!(a.key, 0x8300_f001_u64.wrapping_mul(7));
        assert_ne!(a.key, b.key);
        assert_eq!(ctx.live_count(), 2);
    }

    #[test]
    fn deinit_refuses_with_live_resources() {
        let ctx = PmrContext::new(PmrConfig::DEFAULT, 1);
        let _id = ctx.register(Arc::new);
        assert_eq!(ctx.deinit(), Err(PmrError::LiveResources { live: 1 }));
        ctx.retire();
        assert_eq!(ctx.deinit(), Ok(()));
    }
}
